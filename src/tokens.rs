use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

/// 32 random bytes, URL-safe. Used for onboarding sessions and action tokens;
/// only the SHA-256 of a token is ever stored.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Zero-padded 6-digit one-time code.
pub fn otp_code() -> String {
    format!("{:06}", OsRng.next_u32() % 1_000_000)
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    PasswordReset,
    EmailVerify,
    Invitation,
}

impl Purpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::PasswordReset => "password_reset",
            Purpose::EmailVerify => "email_verify",
            Purpose::Invitation => "invitation",
        }
    }
}

/// Issues a single-use action token bound to a user/workspace, stored by
/// hash with a TTL and a purpose tag. Returns the raw token for delivery.
pub async fn issue_action_token<'e, E: PgExecutor<'e>>(
    ex: E,
    purpose: Purpose,
    user_id: Option<Uuid>,
    workspace_id: Option<Uuid>,
    payload: Value,
) -> AppResult<String> {
    let token = random_token();
    let expires_at = Utc::now() + Duration::minutes(*config::ACTION_TOKEN_TTL_MINUTES);
    sqlx::query(
        "INSERT INTO action_tokens (token_hash, purpose, user_id, workspace_id, payload, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(sha256_hex(&token))
    .bind(purpose.as_str())
    .bind(user_id)
    .bind(workspace_id)
    .bind(payload)
    .bind(expires_at)
    .execute(ex)
    .await?;
    Ok(token)
}

pub struct ConsumedToken {
    pub user_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
    pub payload: Value,
}

/// Redeems an action token: must exist for the purpose, be unexpired, and be
/// unconsumed. Consumption is atomic so a token can be used exactly once.
pub async fn consume_action_token<'e, E: PgExecutor<'e>>(
    ex: E,
    purpose: Purpose,
    token: &str,
) -> AppResult<ConsumedToken> {
    let row: Option<(Option<Uuid>, Option<Uuid>, Value)> = sqlx::query_as(
        "UPDATE action_tokens SET consumed_at = NOW() \
         WHERE token_hash = $1 AND purpose = $2 AND consumed_at IS NULL AND expires_at > NOW() \
         RETURNING user_id, workspace_id, payload",
    )
    .bind(sha256_hex(token))
    .bind(purpose.as_str())
    .fetch_optional(ex)
    .await?;
    let (user_id, workspace_id, payload) = row.ok_or(AppError::Unauthorized)?;
    Ok(ConsumedToken {
        user_id,
        workspace_id,
        payload,
    })
}

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Both token kinds carry the auth_version the user had at issue time; the
/// pipeline rejects tokens whose version the user has since advanced past.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub wid: Uuid,
    pub ver: i32,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
}

pub fn sign(
    kind: TokenKind,
    user_id: Uuid,
    workspace_id: Uuid,
    auth_version: i32,
    ttl: Duration,
) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        wid: workspace_id,
        ver: auth_version,
        kind,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config::JWT_SECRET.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(?e, "token encoding failed");
        AppError::Message("token encoding failed".into())
    })
}

pub fn issue_pair(user_id: Uuid, workspace_id: Uuid, auth_version: i32) -> AppResult<TokenPair> {
    Ok(TokenPair {
        token: sign(
            TokenKind::Access,
            user_id,
            workspace_id,
            auth_version,
            Duration::minutes(*config::ACCESS_TOKEN_TTL_MINUTES),
        )?,
        refresh_token: sign(
            TokenKind::Refresh,
            user_id,
            workspace_id,
            auth_version,
            Duration::days(*config::REFRESH_TOKEN_TTL_DAYS),
        )?,
    })
}

/// Verifies signature and expiry, and that the token is of the expected kind.
/// The stored auth_version check happens where the actor row is loaded.
pub fn verify(token: &str, expected: TokenKind) -> AppResult<Claims> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config::JWT_SECRET.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| AppError::Unauthorized)?;
    if decoded.claims.kind != expected {
        return Err(AppError::Unauthorized);
    }
    Ok(decoded.claims)
}

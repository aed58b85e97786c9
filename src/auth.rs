use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::Actor;
use crate::jwt::{self, TokenKind, TokenPair};
use crate::mail::{templates, Mailer};
use crate::oauth::GoogleOAuth;
use crate::rate_limit::RateLimiter;
use crate::tokens::{self, Purpose};
use crate::validate::Check;

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Message(format!("password hashing failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub email_verified: bool,
    pub auth_version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Wire shape for a user. The password hash never leaves this module.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub email_verified: bool,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        UserInfo {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role.clone(),
            email_verified: user.email_verified,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: UserInfo,
    pub token: String,
    pub refresh_token: String,
}

pub async fn issue_session<'e, E: PgExecutor<'e>>(ex: E, user: &User) -> AppResult<TokenPair> {
    let pair = jwt::issue_pair(user.id, user.workspace_id, user.auth_version)?;
    store_refresh_token(ex, user, &pair.refresh_token).await?;
    Ok(pair)
}

async fn store_refresh_token<'e, E: PgExecutor<'e>>(
    ex: E,
    user: &User,
    refresh_token: &str,
) -> AppResult<()> {
    let expires_at = Utc::now() + Duration::days(*config::REFRESH_TOKEN_TTL_DAYS);
    sqlx::query(
        "INSERT INTO refresh_tokens (token_hash, user_id, workspace_id, expires_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(tokens::sha256_hex(refresh_token))
    .bind(user.id)
    .bind(user.workspace_id)
    .bind(expires_at)
    .execute(ex)
    .await?;
    Ok(())
}

async fn users_by_email<'e, E: PgExecutor<'e>>(ex: E, email: &str) -> AppResult<Vec<User>> {
    Ok(sqlx::query_as::<_, User>(
        "SELECT * FROM users WHERE lower(email) = lower($1)",
    )
    .bind(email.trim())
    .fetch_all(ex)
    .await?)
}

pub async fn find_user<'e, E: PgExecutor<'e>>(ex: E, id: Uuid) -> AppResult<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await?)
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn login(
    Extension(pool): Extension<PgPool>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let mut check = Check::new();
    check
        .require_email("email", &payload.email)
        .require_present("password", &payload.password);
    check.finish()?;
    limiter.check(&RateLimiter::anonymous_key(
        &payload.email.trim().to_lowercase(),
        "auth",
    ))?;

    // Emails are unique per workspace, not globally; the password picks the
    // account when one address exists in several workspaces.
    let candidates = users_by_email(&pool, &payload.email).await?;
    let user = candidates
        .into_iter()
        .find(|user| verify_password(&payload.password, &user.password_hash))
        .ok_or(AppError::Unauthorized)?;
    let pair = issue_session(&pool, &user).await?;
    Ok(Json(LoginResponse {
        user: UserInfo::from(&user),
        token: pair.token,
        refresh_token: pair.refresh_token,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<LoginResponse>> {
    let claims = jwt::verify(&payload.refresh_token, TokenKind::Refresh)?;
    let token_hash = tokens::sha256_hex(&payload.refresh_token);
    let known: Option<Uuid> = sqlx::query_scalar(
        "DELETE FROM refresh_tokens WHERE token_hash = $1 AND expires_at > NOW() RETURNING user_id",
    )
    .bind(&token_hash)
    .fetch_optional(&pool)
    .await?;
    if known != Some(claims.sub) {
        return Err(AppError::Unauthorized);
    }
    let user = find_user(&pool, claims.sub)
        .await?
        .ok_or(AppError::Unauthorized)?;
    if user.auth_version > claims.ver {
        return Err(AppError::Unauthorized);
    }
    let pair = issue_session(&pool, &user).await?;
    Ok(Json(LoginResponse {
        user: UserInfo::from(&user),
        token: pair.token,
        refresh_token: pair.refresh_token,
    }))
}

pub async fn logout(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<StatusCode> {
    sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
        .bind(tokens::sha256_hex(&payload.refresh_token))
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bumps auth_version so every previously issued access and refresh token is
/// dead on next use.
pub async fn logout_all(
    Extension(pool): Extension<PgPool>,
    actor: Actor,
) -> AppResult<StatusCode> {
    sqlx::query("UPDATE users SET auth_version = auth_version + 1, updated_at = NOW() WHERE id = $1")
        .bind(actor.user_id)
        .execute(&pool)
        .await?;
    sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
        .bind(actor.user_id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(Extension(pool): Extension<PgPool>, actor: Actor) -> AppResult<Json<UserInfo>> {
    let user = find_user(&pool, actor.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;
    Ok(Json(UserInfo::from(&user)))
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

/// Always answers 204; whether the address exists is not observable.
pub async fn forgot_password(
    Extension(pool): Extension<PgPool>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> AppResult<StatusCode> {
    let mut check = Check::new();
    check.require_email("email", &payload.email);
    check.finish()?;
    limiter.check(&RateLimiter::anonymous_key(
        &payload.email.trim().to_lowercase(),
        "auth",
    ))?;
    for user in users_by_email(&pool, &payload.email).await? {
        let token = tokens::issue_action_token(
            &pool,
            Purpose::PasswordReset,
            Some(user.id),
            Some(user.workspace_id),
            json!({}),
        )
        .await?;
        if let Err(e) = mailer.send(templates::password_reset(&user.email, &token)).await {
            tracing::error!(?e, "failed to send password reset mail");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

pub async fn reset_password(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<StatusCode> {
    let mut check = Check::new();
    check
        .require_present("token", &payload.token)
        .require_min_len("password", &payload.password, 8);
    check.finish()?;
    let consumed = tokens::consume_action_token(&pool, Purpose::PasswordReset, &payload.token).await?;
    let user_id = consumed.user_id.ok_or(AppError::Unauthorized)?;
    let password_hash = hash_password(&payload.password)?;
    // A reset also invalidates every outstanding session.
    sqlx::query(
        "UPDATE users SET password_hash = $1, auth_version = auth_version + 1, updated_at = NOW() \
         WHERE id = $2",
    )
    .bind(&password_hash)
    .bind(user_id)
    .execute(&pool)
    .await?;
    sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
        .bind(user_id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

pub async fn verify_email(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<VerifyEmailRequest>,
) -> AppResult<StatusCode> {
    let consumed = tokens::consume_action_token(&pool, Purpose::EmailVerify, &payload.token).await?;
    let user_id = consumed.user_id.ok_or(AppError::Unauthorized)?;
    sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1")
        .bind(user_id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct GoogleLoginRequest {
    pub code: String,
}

/// OAuth login for existing accounts; sign-up goes through onboarding.
pub async fn google_login(
    Extension(pool): Extension<PgPool>,
    Extension(oauth): Extension<Arc<GoogleOAuth>>,
    Json(payload): Json<GoogleLoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let mut check = Check::new();
    check.require_present("code", &payload.code);
    check.finish()?;
    let profile = oauth.exchange(&payload.code).await?;
    let user = users_by_email(&pool, &profile.email)
        .await?
        .into_iter()
        .next()
        .ok_or(AppError::Unauthorized)?;
    let pair = issue_session(&pool, &user).await?;
    Ok(Json(LoginResponse {
        user: UserInfo::from(&user),
        token: pair.token,
        refresh_token: pair.refresh_token,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("password123").unwrap();
        assert_ne!(hash, "password123");
        assert!(verify_password("password123", &hash));
        assert!(!verify_password("password124", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("password123").unwrap();
        let b = hash_password("password123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!verify_password("password123", "not-a-phc-string"));
    }

    #[test]
    fn user_info_omits_password_hash() {
        let user = User {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            email: "a@b.co".into(),
            password_hash: "$argon2id$v=19$secret".into(),
            first_name: "A".into(),
            last_name: "B".into(),
            role: "owner".into(),
            email_verified: true,
            auth_version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&UserInfo::from(&user)).unwrap();
        assert!(!serialized.contains("argon2"));
        assert!(!serialized.contains("password"));
    }
}

use axum::http::Request;
use axum::{extract::FromRequestParts, Extension, Json};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use souk::auth::{self, LoginRequest, RefreshRequest, ResetPasswordRequest};
use souk::error::AppError;
use souk::extractor::Actor;
use souk::rate_limit::RateLimiter;
use souk::tokens::{self, Purpose};

async fn seed_user(pool: &PgPool, email: &str, password: &str) -> (Uuid, Uuid) {
    sqlx::migrate!("./migrations").run(pool).await.unwrap();
    let workspace_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id) VALUES ($1)")
        .bind(workspace_id)
        .execute(pool)
        .await
        .unwrap();
    let user_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (id, workspace_id, email, password_hash, first_name, last_name, role, email_verified) \
         VALUES ($1, $2, $3, $4, 'A', 'B', 'owner', TRUE)",
    )
    .bind(user_id)
    .bind(workspace_id)
    .bind(email)
    .bind(auth::hash_password(password).unwrap())
    .execute(pool)
    .await
    .unwrap();
    (user_id, workspace_id)
}

async fn actor_for(pool: &PgPool, token: &str) -> Result<Actor, AppError> {
    let request = Request::builder()
        .header("Authorization", format!("Bearer {token}"))
        .extension(pool.clone())
        .body(axum::body::Body::empty())
        .unwrap();
    let mut parts = request.into_parts().0;
    Actor::from_request_parts(&mut parts, &()).await
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn login_issues_tokens_and_actor_resolves(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    let (user_id, workspace_id) = seed_user(&pool, "a@b.co", "password123").await;
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(login) = auth::login(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(LoginRequest {
            email: "a@b.co".into(),
            password: "password123".into(),
        }),
    )
    .await
    .expect("valid credentials");
    assert_eq!(login.user.id, user_id);

    let actor = actor_for(&pool, &login.token).await.expect("actor loads");
    assert_eq!(actor.user_id, user_id);
    assert_eq!(actor.workspace_id, workspace_id);

    let wrong = auth::login(
        Extension(pool.clone()),
        Extension(limiter),
        Json(LoginRequest {
            email: "a@b.co".into(),
            password: "password124".into(),
        }),
    )
    .await;
    assert!(matches!(wrong, Err(AppError::Unauthorized)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refresh_rotates_and_old_token_dies(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    seed_user(&pool, "r@b.co", "password123").await;
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(login) = auth::login(
        Extension(pool.clone()),
        Extension(limiter),
        Json(LoginRequest {
            email: "r@b.co".into(),
            password: "password123".into(),
        }),
    )
    .await
    .unwrap();

    let Json(rotated) = auth::refresh(
        Extension(pool.clone()),
        Json(RefreshRequest {
            refresh_token: login.refresh_token.clone(),
        }),
    )
    .await
    .expect("first refresh succeeds");
    assert_ne!(rotated.refresh_token, login.refresh_token);

    // The presented token was rotated out; replaying it must fail.
    let replay = auth::refresh(
        Extension(pool.clone()),
        Json(RefreshRequest {
            refresh_token: login.refresh_token,
        }),
    )
    .await;
    assert!(matches!(replay, Err(AppError::Unauthorized)));

    let again = auth::refresh(
        Extension(pool.clone()),
        Json(RefreshRequest {
            refresh_token: rotated.refresh_token,
        }),
    )
    .await;
    assert!(again.is_ok());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn logout_all_invalidates_every_token(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    seed_user(&pool, "l@b.co", "password123").await;
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(login) = auth::login(
        Extension(pool.clone()),
        Extension(limiter),
        Json(LoginRequest {
            email: "l@b.co".into(),
            password: "password123".into(),
        }),
    )
    .await
    .unwrap();
    let actor = actor_for(&pool, &login.token).await.unwrap();

    auth::logout_all(Extension(pool.clone()), actor)
        .await
        .expect("logout all");

    // Access token: rejected by the stored auth_version check.
    let stale_access = actor_for(&pool, &login.token).await;
    assert!(matches!(stale_access, Err(AppError::Unauthorized)));

    // Refresh token: both the version check and the deleted row reject it.
    let stale_refresh = auth::refresh(
        Extension(pool.clone()),
        Json(RefreshRequest {
            refresh_token: login.refresh_token,
        }),
    )
    .await;
    assert!(matches!(stale_refresh, Err(AppError::Unauthorized)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn password_reset_consumes_token_and_invalidates_sessions(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    let (user_id, workspace_id) = seed_user(&pool, "p@b.co", "password123").await;
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(login) = auth::login(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(LoginRequest {
            email: "p@b.co".into(),
            password: "password123".into(),
        }),
    )
    .await
    .unwrap();

    let token = tokens::issue_action_token(
        &pool,
        Purpose::PasswordReset,
        Some(user_id),
        Some(workspace_id),
        json!({}),
    )
    .await
    .unwrap();

    auth::reset_password(
        Extension(pool.clone()),
        Json(ResetPasswordRequest {
            token: token.clone(),
            password: "new-password-9".into(),
        }),
    )
    .await
    .expect("reset succeeds");

    // Single use.
    let reuse = auth::reset_password(
        Extension(pool.clone()),
        Json(ResetPasswordRequest {
            token,
            password: "another-pass-9".into(),
        }),
    )
    .await;
    assert!(matches!(reuse, Err(AppError::Unauthorized)));

    // Old password and old sessions are gone; the new password works.
    let old = auth::login(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(LoginRequest {
            email: "p@b.co".into(),
            password: "password123".into(),
        }),
    )
    .await;
    assert!(old.is_err());
    let stale = actor_for(&pool, &login.token).await;
    assert!(matches!(stale, Err(AppError::Unauthorized)));
    let fresh = auth::login(
        Extension(pool.clone()),
        Extension(limiter),
        Json(LoginRequest {
            email: "p@b.co".into(),
            password: "new-password-9".into(),
        }),
    )
    .await;
    assert!(fresh.is_ok());
}

use async_trait::async_trait;
use axum::{Extension, Json};
use regex::Regex;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};

use souk::cache::Cache;
use souk::error::{AppError, AppResult};
use souk::mail::{Mailer, Outgoing};
use souk::onboarding::{
    self, SessionTokenBody, StageBusinessRequest, StartPaymentRequest, StartRequest, Stage,
    VerifyEmailRequest,
};
use souk::payments::{CheckoutParams, CheckoutSession, PaymentProvider};
use souk::rate_limit::RateLimiter;

struct CaptureMailer(Mutex<Vec<Outgoing>>);

#[async_trait]
impl Mailer for CaptureMailer {
    async fn send(&self, mail: Outgoing) -> AppResult<()> {
        self.0.lock().unwrap().push(mail);
        Ok(())
    }
}

struct RefusingProvider;

#[async_trait]
impl PaymentProvider for RefusingProvider {
    async fn create_checkout_session(&self, _params: CheckoutParams) -> AppResult<CheckoutSession> {
        panic!("free-plan onboarding must not touch the payment provider");
    }
}

async fn counts(pool: &PgPool) -> (i64, i64, i64, i64) {
    let workspaces: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces")
        .fetch_one(pool)
        .await
        .unwrap();
    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .unwrap();
    let businesses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM businesses")
        .fetch_one(pool)
        .await
        .unwrap();
    let subscriptions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(pool)
        .await
        .unwrap();
    (workspaces, users, businesses, subscriptions)
}

// key: onboarding-tests -> free plan happy path
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn free_plan_onboarding_commits_exactly_one_of_each(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let cache = Cache::new();
    let mailer = Arc::new(CaptureMailer(Mutex::new(Vec::new())));
    let mailer_dyn: Arc<dyn Mailer> = mailer.clone();
    let limiter = RateLimiter::new(1_000.0, 1_000.0);
    let provider: Arc<dyn PaymentProvider> = Arc::new(RefusingProvider);

    let Json(started) = onboarding::start(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(StartRequest {
            email: "a@b.co".into(),
            plan_descriptor: "free".into(),
        }),
    )
    .await
    .expect("start session");
    assert_eq!(started.stage, Stage::PlanSelected);
    assert!(!started.is_paid);
    let token = started.session_token;

    onboarding::send_email_otp(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Extension(mailer_dyn.clone()),
        Extension(limiter.clone()),
        Json(SessionTokenBody {
            session_token: token.clone(),
        }),
    )
    .await
    .expect("send otp");

    let code = {
        let sent = mailer.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "a@b.co");
        Regex::new(r"\d{6}")
            .unwrap()
            .find(&sent[0].html)
            .expect("otp code in mail")
            .as_str()
            .to_string()
    };

    let Json(verified) = onboarding::verify_email(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Json(VerifyEmailRequest {
            session_token: token.clone(),
            code,
            first_name: "A".into(),
            last_name: "B".into(),
            password: "password123".into(),
        }),
    )
    .await
    .expect("verify otp");
    assert_eq!(verified.stage, Stage::IdentityVerified);

    let Json(staged) = onboarding::stage_business(
        Extension(pool.clone()),
        Json(StageBusinessRequest {
            session_token: token.clone(),
            name: "Shop".into(),
            descriptor: "shop".into(),
            country: "AE".into(),
            currency: "AED".into(),
        }),
    )
    .await
    .expect("stage business");
    assert_eq!(staged.stage, Stage::BusinessStaged);

    let Json(payment) = onboarding::start_payment(
        Extension(pool.clone()),
        Extension(provider.clone()),
        Json(StartPaymentRequest {
            session_token: token.clone(),
            success_url: "https://portal.example/success".into(),
            cancel_url: "https://portal.example/cancel".into(),
        }),
    )
    .await
    .expect("start payment");
    assert_eq!(payment.stage, Stage::ReadyToCommit);
    assert!(payment.checkout_url.is_none());

    let before = counts(&pool).await;
    let Json(login) = onboarding::complete(
        Extension(pool.clone()),
        Json(SessionTokenBody {
            session_token: token.clone(),
        }),
    )
    .await
    .expect("complete onboarding");
    assert_eq!(login.user.email, "a@b.co");
    assert_eq!(login.user.role, "owner");
    assert!(login.user.email_verified);
    assert!(!login.token.is_empty());
    assert!(!login.refresh_token.is_empty());

    let after = counts(&pool).await;
    assert_eq!(after.0, before.0 + 1);
    assert_eq!(after.1, before.1 + 1);
    assert_eq!(after.2, before.2 + 1);
    assert_eq!(after.3, before.3 + 1);

    // The session is gone; a second complete cannot double-provision.
    let replay = onboarding::complete(
        Extension(pool.clone()),
        Json(SessionTokenBody {
            session_token: token,
        }),
    )
    .await;
    assert!(matches!(replay, Err(AppError::NotFound(_))));
    assert_eq!(counts(&pool).await, after);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn premature_complete_leaves_no_rows(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(started) = onboarding::start(
        Extension(pool.clone()),
        Extension(limiter),
        Json(StartRequest {
            email: "early@b.co".into(),
            plan_descriptor: "free".into(),
        }),
    )
    .await
    .unwrap();

    let before = counts(&pool).await;
    let result = onboarding::complete(
        Extension(pool.clone()),
        Json(SessionTokenBody {
            session_token: started.session_token,
        }),
    )
    .await;
    assert!(matches!(result, Err(AppError::OnboardingNotReady(_))));
    assert_eq!(counts(&pool).await, before);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn bad_descriptor_is_a_field_level_validation_error(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let cache = Cache::new();
    let mailer: Arc<dyn Mailer> = Arc::new(CaptureMailer(Mutex::new(Vec::new())));
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(started) = onboarding::start(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(StartRequest {
            email: "d@b.co".into(),
            plan_descriptor: "free".into(),
        }),
    )
    .await
    .unwrap();
    let token = started.session_token;

    onboarding::send_email_otp(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Extension(mailer),
        Extension(limiter),
        Json(SessionTokenBody {
            session_token: token.clone(),
        }),
    )
    .await
    .unwrap();
    // Cheat past the OTP by staging the profile the way verify does.
    sqlx::query(
        "UPDATE onboarding_sessions SET stage = 'identity_verified', \
         profile = '{\"firstName\":\"D\",\"lastName\":\"E\",\"passwordHash\":\"x\",\"viaOauth\":false}'",
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = onboarding::stage_business(
        Extension(pool.clone()),
        Json(StageBusinessRequest {
            session_token: token,
            name: "Shop".into(),
            descriptor: "Bad Descriptor!".into(),
            country: "AE".into(),
            currency: "AED".into(),
        }),
    )
    .await;
    match result {
        Err(AppError::Validation(fields)) => assert!(fields.contains_key("descriptor")),
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn handlers_are_idempotent_per_stage(pool: PgPool) {
    std::env::set_var("JWT_SECRET", "test-secret");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let cache = Cache::new();
    let mailer = Arc::new(CaptureMailer(Mutex::new(Vec::new())));
    let mailer_dyn: Arc<dyn Mailer> = mailer.clone();
    let limiter = RateLimiter::new(1_000.0, 1_000.0);

    let Json(started) = onboarding::start(
        Extension(pool.clone()),
        Extension(limiter.clone()),
        Json(StartRequest {
            email: "i@b.co".into(),
            plan_descriptor: "free".into(),
        }),
    )
    .await
    .unwrap();
    let token = started.session_token;

    onboarding::send_email_otp(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Extension(mailer_dyn.clone()),
        Extension(limiter.clone()),
        Json(SessionTokenBody {
            session_token: token.clone(),
        }),
    )
    .await
    .unwrap();
    let code = {
        let sent = mailer.0.lock().unwrap();
        Regex::new(r"\d{6}")
            .unwrap()
            .find(&sent.last().unwrap().html)
            .unwrap()
            .as_str()
            .to_string()
    };
    onboarding::verify_email(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Json(VerifyEmailRequest {
            session_token: token.clone(),
            code: code.clone(),
            first_name: "I".into(),
            last_name: "J".into(),
            password: "password123".into(),
        }),
    )
    .await
    .unwrap();

    // Replaying the satisfied stage returns the current state, not an error,
    // even though the one-time code is spent.
    let Json(replayed) = onboarding::verify_email(
        Extension(pool.clone()),
        Extension(cache.clone()),
        Json(VerifyEmailRequest {
            session_token: token.clone(),
            code,
            first_name: "I".into(),
            last_name: "J".into(),
            password: "password123".into(),
        }),
    )
    .await
    .expect("idempotent replay");
    assert_eq!(replayed.stage, Stage::IdentityVerified);
}

use axum::extract::Query;
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Months, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::Json as SqlJson;
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use crate::auth::{self, LoginResponse, User, UserInfo};
use crate::billing;
use crate::bus::{EventBus, TOPIC_ONBOARDING_PAYMENT_SUCCEEDED};
use crate::cache::Cache;
use crate::config;
use crate::db::{self, ExecOptions};
use crate::error::{AppError, AppResult};
use crate::mail::{templates, Mailer};
use crate::oauth::GoogleOAuth;
use crate::payments::{CheckoutParams, PaymentProvider};
use crate::rate_limit::RateLimiter;
use crate::tokens;
use crate::validate::Check;

/// Onboarding stages, in order. A session only ever moves forward; asking
/// for an already-satisfied stage returns the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PlanSelected,
    IdentityPending,
    IdentityVerified,
    BusinessStaged,
    PaymentPending,
    PaymentConfirmed,
    ReadyToCommit,
    Committed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::PlanSelected => "plan_selected",
            Stage::IdentityPending => "identity_pending",
            Stage::IdentityVerified => "identity_verified",
            Stage::BusinessStaged => "business_staged",
            Stage::PaymentPending => "payment_pending",
            Stage::PaymentConfirmed => "payment_confirmed",
            Stage::ReadyToCommit => "ready_to_commit",
            Stage::Committed => "committed",
        }
    }

    pub fn parse(value: &str) -> Option<Stage> {
        match value {
            "plan_selected" => Some(Stage::PlanSelected),
            "identity_pending" => Some(Stage::IdentityPending),
            "identity_verified" => Some(Stage::IdentityVerified),
            "business_staged" => Some(Stage::BusinessStaged),
            "payment_pending" => Some(Stage::PaymentPending),
            "payment_confirmed" => Some(Stage::PaymentConfirmed),
            "ready_to_commit" => Some(Stage::ReadyToCommit),
            "committed" => Some(Stage::Committed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Stage::PlanSelected => 0,
            Stage::IdentityPending => 1,
            Stage::IdentityVerified => 2,
            Stage::BusinessStaged => 3,
            Stage::PaymentPending => 4,
            Stage::PaymentConfirmed => 5,
            Stage::ReadyToCommit => 6,
            Stage::Committed => 7,
        }
    }

    pub fn at_least(self, other: Stage) -> bool {
        self.rank() >= other.rank()
    }

    fn commit_ready(self) -> bool {
        matches!(self, Stage::PaymentConfirmed | Stage::ReadyToCommit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedProfile {
    pub first_name: String,
    pub last_name: String,
    /// Hashed at staging time; absent for OAuth identities.
    pub password_hash: Option<String>,
    pub via_oauth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedBusiness {
    pub name: String,
    pub descriptor: String,
    pub country: String,
    pub currency: String,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Session {
    pub token_hash: String,
    pub stage: String,
    pub email: String,
    pub plan_id: Uuid,
    pub is_paid: bool,
    pub profile: Option<SqlJson<StagedProfile>>,
    pub business: Option<SqlJson<StagedBusiness>>,
    pub checkout_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn stage(&self) -> Stage {
        Stage::parse(&self.stage).unwrap_or(Stage::PlanSelected)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub stage: Stage,
    pub email: String,
    pub is_paid: bool,
    pub identity_verified: bool,
    pub business: Option<StagedBusiness>,
    pub checkout_url: Option<String>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        SessionView {
            stage: session.stage(),
            email: session.email.clone(),
            is_paid: session.is_paid,
            identity_verified: session.stage().at_least(Stage::IdentityVerified),
            business: session.business.as_ref().map(|b| b.0.clone()),
            checkout_url: session.checkout_url.clone(),
        }
    }
}

async fn load_session<'e, E: PgExecutor<'e>>(ex: E, token: &str) -> AppResult<Session> {
    sqlx::query_as::<_, Session>("SELECT * FROM onboarding_sessions WHERE token_hash = $1")
        .bind(tokens::sha256_hex(token))
        .fetch_optional(ex)
        .await?
        .ok_or(AppError::NotFound("onboarding_session"))
}

async fn set_stage<'e, E: PgExecutor<'e>>(ex: E, token_hash: &str, stage: Stage) -> AppResult<()> {
    sqlx::query("UPDATE onboarding_sessions SET stage = $1, updated_at = NOW() WHERE token_hash = $2")
        .bind(stage.as_str())
        .bind(token_hash)
        .execute(ex)
        .await?;
    Ok(())
}

fn otp_cache_key(token_hash: &str) -> String {
    format!("onboarding_otp:{token_hash}")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub email: String,
    pub plan_descriptor: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_token: String,
    pub stage: Stage,
    pub is_paid: bool,
}

/// `POST /v1/onboarding/start`
pub async fn start(
    Extension(pool): Extension<PgPool>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Json(payload): Json<StartRequest>,
) -> AppResult<Json<StartResponse>> {
    let mut check = Check::new();
    check
        .require_email("email", &payload.email)
        .require_present("planDescriptor", &payload.plan_descriptor);
    check.finish()?;
    let email = payload.email.trim().to_lowercase();
    limiter.check(&RateLimiter::anonymous_key(&email, "onboarding"))?;

    let plan = billing::find_plan_by_descriptor(&pool, &payload.plan_descriptor)
        .await?
        .ok_or(AppError::NotFound("plan"))?;
    let token = tokens::random_token();
    sqlx::query(
        "INSERT INTO onboarding_sessions (token_hash, stage, email, plan_id, is_paid) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tokens::sha256_hex(&token))
    .bind(Stage::PlanSelected.as_str())
    .bind(&email)
    .bind(plan.id)
    .bind(plan.is_paid())
    .execute(&pool)
    .await?;
    Ok(Json(StartResponse {
        session_token: token,
        stage: Stage::PlanSelected,
        is_paid: plan.is_paid(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenQuery {
    pub session_token: String,
}

/// `GET /v1/onboarding/session`
pub async fn get_session(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<SessionTokenQuery>,
) -> AppResult<Json<SessionView>> {
    let session = load_session(&pool, &query.session_token).await?;
    Ok(Json(SessionView::from(&session)))
}

/// `DELETE /v1/onboarding/session` — final from any uncommitted state.
pub async fn delete_session(
    Extension(pool): Extension<PgPool>,
    Extension(cache): Extension<Arc<Cache>>,
    Json(payload): Json<SessionTokenBody>,
) -> AppResult<StatusCode> {
    let token_hash = tokens::sha256_hex(&payload.session_token);
    sqlx::query("DELETE FROM onboarding_sessions WHERE token_hash = $1")
        .bind(&token_hash)
        .execute(&pool)
        .await?;
    cache.remove(&otp_cache_key(&token_hash));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenBody {
    pub session_token: String,
}

/// `POST /v1/onboarding/email/otp` — (re)sends a 6-digit code. Only its hash
/// is kept, with a short TTL.
pub async fn send_email_otp(
    Extension(pool): Extension<PgPool>,
    Extension(cache): Extension<Arc<Cache>>,
    Extension(mailer): Extension<Arc<dyn Mailer>>,
    Extension(limiter): Extension<Arc<RateLimiter>>,
    Json(payload): Json<SessionTokenBody>,
) -> AppResult<StatusCode> {
    let session = load_session(&pool, &payload.session_token).await?;
    if session.stage().at_least(Stage::IdentityVerified) {
        return Ok(StatusCode::NO_CONTENT);
    }
    limiter.check(&RateLimiter::anonymous_key(&session.token_hash, "otp"))?;

    let code = tokens::otp_code();
    cache.put(
        &otp_cache_key(&session.token_hash),
        &tokens::sha256_hex(&code),
        StdDuration::from_secs(*config::OTP_TTL_MINUTES as u64 * 60),
    );
    mailer.send(templates::otp(&session.email, &code)).await?;
    if session.stage() == Stage::PlanSelected {
        set_stage(&pool, &session.token_hash, Stage::IdentityPending).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailRequest {
    pub session_token: String,
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

/// `POST /v1/onboarding/email/verify`
pub async fn verify_email(
    Extension(pool): Extension<PgPool>,
    Extension(cache): Extension<Arc<Cache>>,
    Json(payload): Json<VerifyEmailRequest>,
) -> AppResult<Json<SessionView>> {
    let session = load_session(&pool, &payload.session_token).await?;
    if session.stage().at_least(Stage::IdentityVerified) {
        return Ok(Json(SessionView::from(&session)));
    }
    let mut check = Check::new();
    check
        .require(
            "code",
            payload.code.len() == 6 && payload.code.chars().all(|c| c.is_ascii_digit()),
            "must be a 6-digit code",
        )
        .require_present("firstName", &payload.first_name)
        .require_present("lastName", &payload.last_name)
        .require_min_len("password", &payload.password, 8);
    check.finish()?;

    let expected = cache
        .get(&otp_cache_key(&session.token_hash))
        .ok_or(AppError::Unauthorized)?;
    if tokens::sha256_hex(&payload.code) != expected {
        return Err(AppError::Unauthorized);
    }
    cache.remove(&otp_cache_key(&session.token_hash));

    let profile = StagedProfile {
        first_name: payload.first_name.trim().to_string(),
        last_name: payload.last_name.trim().to_string(),
        password_hash: Some(auth::hash_password(&payload.password)?),
        via_oauth: false,
    };
    sqlx::query(
        "UPDATE onboarding_sessions SET stage = $1, profile = $2, updated_at = NOW() \
         WHERE token_hash = $3",
    )
    .bind(Stage::IdentityVerified.as_str())
    .bind(SqlJson(&profile))
    .bind(&session.token_hash)
    .execute(&pool)
    .await?;
    let session = load_session(&pool, &payload.session_token).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthVerifyRequest {
    pub session_token: String,
    pub code: String,
}

/// `POST /v1/onboarding/oauth/google` — the provider-verified email replaces
/// whatever was typed at start.
pub async fn verify_oauth_google(
    Extension(pool): Extension<PgPool>,
    Extension(oauth): Extension<Arc<GoogleOAuth>>,
    Json(payload): Json<OauthVerifyRequest>,
) -> AppResult<Json<SessionView>> {
    let session = load_session(&pool, &payload.session_token).await?;
    if session.stage().at_least(Stage::IdentityVerified) {
        return Ok(Json(SessionView::from(&session)));
    }
    let profile = oauth.exchange(&payload.code).await?;
    let staged = StagedProfile {
        first_name: profile.first_name,
        last_name: profile.last_name,
        password_hash: None,
        via_oauth: true,
    };
    sqlx::query(
        "UPDATE onboarding_sessions SET stage = $1, email = $2, profile = $3, updated_at = NOW() \
         WHERE token_hash = $4",
    )
    .bind(Stage::IdentityVerified.as_str())
    .bind(&profile.email)
    .bind(SqlJson(&staged))
    .bind(&session.token_hash)
    .execute(&pool)
    .await?;
    let session = load_session(&pool, &payload.session_token).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageBusinessRequest {
    pub session_token: String,
    pub name: String,
    pub descriptor: String,
    pub country: String,
    pub currency: String,
}

/// `POST /v1/onboarding/business`
pub async fn stage_business(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<StageBusinessRequest>,
) -> AppResult<Json<SessionView>> {
    let session = load_session(&pool, &payload.session_token).await?;
    if session.stage().at_least(Stage::BusinessStaged) {
        return Ok(Json(SessionView::from(&session)));
    }
    if !session.stage().at_least(Stage::IdentityVerified) {
        return Err(AppError::OnboardingNotReady(session.stage.clone()));
    }
    let mut check = Check::new();
    check
        .require_present("name", &payload.name)
        .require_descriptor("descriptor", &payload.descriptor)
        .require("country", payload.country.len() == 2, "must be ISO 3166-1 alpha-2")
        .require("currency", payload.currency.len() == 3, "must be ISO 4217");
    check.finish()?;

    let staged = StagedBusiness {
        name: payload.name.trim().to_string(),
        descriptor: payload.descriptor.clone(),
        country: payload.country.to_uppercase(),
        currency: payload.currency.to_uppercase(),
    };
    sqlx::query(
        "UPDATE onboarding_sessions SET stage = $1, business = $2, updated_at = NOW() \
         WHERE token_hash = $3",
    )
    .bind(Stage::BusinessStaged.as_str())
    .bind(SqlJson(&staged))
    .bind(&session.token_hash)
    .execute(&pool)
    .await?;
    let session = load_session(&pool, &payload.session_token).await?;
    Ok(Json(SessionView::from(&session)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPaymentRequest {
    pub session_token: String,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPaymentResponse {
    pub stage: Stage,
    pub checkout_url: Option<String>,
}

/// `POST /v1/onboarding/payment/start` — free plans jump straight to
/// ready_to_commit; paid plans get a provider-hosted checkout URL. The
/// confirmed stage is only ever set by the verified webhook.
pub async fn start_payment(
    Extension(pool): Extension<PgPool>,
    Extension(provider): Extension<Arc<dyn PaymentProvider>>,
    Json(payload): Json<StartPaymentRequest>,
) -> AppResult<Json<StartPaymentResponse>> {
    let session = load_session(&pool, &payload.session_token).await?;
    if session.stage().at_least(Stage::PaymentPending) {
        return Ok(Json(StartPaymentResponse {
            stage: session.stage(),
            checkout_url: session.checkout_url,
        }));
    }
    if !session.stage().at_least(Stage::BusinessStaged) {
        return Err(AppError::OnboardingNotReady(session.stage.clone()));
    }

    if !session.is_paid {
        set_stage(&pool, &session.token_hash, Stage::ReadyToCommit).await?;
        return Ok(Json(StartPaymentResponse {
            stage: Stage::ReadyToCommit,
            checkout_url: None,
        }));
    }

    let mut check = Check::new();
    check
        .require_present("successUrl", &payload.success_url)
        .require_present("cancelUrl", &payload.cancel_url);
    check.finish()?;

    let plan: Option<(String, i64, String)> = sqlx::query_as(
        "SELECT name, amount_cents, currency FROM plans WHERE id = $1",
    )
    .bind(session.plan_id)
    .fetch_optional(&pool)
    .await?;
    let (plan_name, amount_cents, currency) = plan.ok_or(AppError::NotFound("plan"))?;
    let checkout = provider
        .create_checkout_session(CheckoutParams {
            amount_cents,
            currency,
            description: format!("{plan_name} subscription"),
            success_url: payload.success_url.clone(),
            cancel_url: payload.cancel_url.clone(),
            metadata: json!({
                "purpose": "onboarding",
                "reference": session.token_hash.clone(),
            }),
        })
        .await?;
    sqlx::query(
        "UPDATE onboarding_sessions SET stage = $1, checkout_session_id = $2, checkout_url = $3, \
         updated_at = NOW() WHERE token_hash = $4",
    )
    .bind(Stage::PaymentPending.as_str())
    .bind(&checkout.id)
    .bind(&checkout.url)
    .bind(&session.token_hash)
    .execute(&pool)
    .await?;
    Ok(Json(StartPaymentResponse {
        stage: Stage::PaymentPending,
        checkout_url: Some(checkout.url),
    }))
}

/// `POST /v1/onboarding/complete` — the only place canonical rows appear.
/// One serializable transaction creates workspace, owner, business, and
/// subscription, and deletes the session; any failure leaves nothing behind.
pub async fn complete(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<SessionTokenBody>,
) -> AppResult<Json<LoginResponse>> {
    let token_hash = tokens::sha256_hex(&payload.session_token);
    let user = db::exec(&pool, ExecOptions::serializable(), move |tx| {
        let token_hash = token_hash.clone();
        async move {
            let session = sqlx::query_as::<_, Session>(
                "SELECT * FROM onboarding_sessions WHERE token_hash = $1 FOR UPDATE",
            )
            .bind(&token_hash)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(AppError::NotFound("onboarding_session"))?;
            if !session.stage().commit_ready() {
                return Err(AppError::OnboardingNotReady(session.stage.clone()));
            }
            let profile = session
                .profile
                .as_ref()
                .map(|p| p.0.clone())
                .ok_or_else(|| AppError::OnboardingNotReady(session.stage.clone()))?;
            let business = session
                .business
                .as_ref()
                .map(|b| b.0.clone())
                .ok_or_else(|| AppError::OnboardingNotReady(session.stage.clone()))?;

            let workspace_id = Uuid::new_v4();
            sqlx::query("INSERT INTO workspaces (id) VALUES ($1)")
                .bind(workspace_id)
                .execute(&mut **tx)
                .await?;

            let password_hash = match profile.password_hash {
                Some(hash) => hash,
                // OAuth identities get an unguessable placeholder; password
                // login stays closed until a reset sets a real one.
                None => auth::hash_password(&tokens::random_token())?,
            };
            let user = sqlx::query_as::<_, User>(
                "INSERT INTO users (id, workspace_id, email, password_hash, first_name, last_name, \
                 role, email_verified) VALUES ($1, $2, $3, $4, $5, $6, 'owner', TRUE) RETURNING *",
            )
            .bind(Uuid::new_v4())
            .bind(workspace_id)
            .bind(&session.email)
            .bind(&password_hash)
            .bind(&profile.first_name)
            .bind(&profile.last_name)
            .fetch_one(&mut **tx)
            .await?;

            sqlx::query("UPDATE workspaces SET owner_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(user.id)
                .bind(workspace_id)
                .execute(&mut **tx)
                .await?;

            sqlx::query(
                "INSERT INTO businesses (id, workspace_id, name, descriptor, currency, country) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(workspace_id)
            .bind(&business.name)
            .bind(&business.descriptor)
            .bind(&business.currency)
            .bind(&business.country)
            .execute(&mut **tx)
            .await?;

            let period_end: Option<DateTime<Utc>> = if session.is_paid {
                Utc::now().checked_add_months(Months::new(1))
            } else {
                None
            };
            sqlx::query(
                "INSERT INTO subscriptions (id, workspace_id, plan_id, status, current_period_end) \
                 VALUES ($1, $2, $3, 'active', $4)",
            )
            .bind(Uuid::new_v4())
            .bind(workspace_id)
            .bind(session.plan_id)
            .bind(period_end)
            .execute(&mut **tx)
            .await?;

            sqlx::query("DELETE FROM onboarding_sessions WHERE token_hash = $1")
                .bind(&token_hash)
                .execute(&mut **tx)
                .await?;

            Ok(user)
        }
        .boxed()
    })
    .await?;

    let pair = auth::issue_session(&pool, &user).await?;
    tracing::info!(workspace_id = %user.workspace_id, "onboarding committed");
    Ok(Json(LoginResponse {
        user: UserInfo::from(&user),
        token: pair.token,
        refresh_token: pair.refresh_token,
    }))
}

/// Post-commit side effects for paid onboarding: the webhook already made the
/// stage durable, so this only notifies.
pub fn spawn_subscribers(bus: &EventBus, mailer: Arc<dyn Mailer>) {
    bus.listen(TOPIC_ONBOARDING_PAYMENT_SUCCEEDED, move |event| {
        let mailer = Arc::clone(&mailer);
        async move {
            let email = event.payload["email"].as_str().unwrap_or_default().to_string();
            tracing::info!(
                request_id = ?event.request_id,
                "onboarding payment confirmed"
            );
            if email.is_empty() {
                return;
            }
            let mail = crate::mail::Outgoing {
                to: email,
                subject: "Payment received".into(),
                html: "<p>Your payment was received. Head back to finish setting up \
                       your workspace.</p>"
                    .into(),
            };
            if let Err(e) = mailer.send(mail).await {
                tracing::warn!(?e, "payment confirmation mail failed");
            }
        }
    });
}

/// Expiry duration for abandoned sessions; a periodic reaper deletes them.
pub const SESSION_TTL_HOURS: i64 = 72;

pub fn spawn_session_reaper(pool: PgPool) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(3600));
        loop {
            ticker.tick().await;
            if let Err(err) = reap_stale_sessions(&pool, Utc::now()).await {
                tracing::warn!(?err, "onboarding session reaper tick failed");
            }
        }
    });
}

pub async fn reap_stale_sessions(pool: &PgPool, now: DateTime<Utc>) -> anyhow::Result<u64> {
    let cutoff = now - Duration::hours(SESSION_TTL_HOURS);
    let result = sqlx::query("DELETE FROM onboarding_sessions WHERE updated_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    if result.rows_affected() > 0 {
        tracing::info!(count = result.rows_affected(), "reaped stale onboarding sessions");
    }
    Ok(result.rows_affected())
}

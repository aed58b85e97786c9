use axum::extract::Path;
use axum::{routing::get, Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json as SqlJson;
use sqlx::{PgExecutor, PgPool};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub descriptor: String,
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub amount_cents: i64,
    pub billing_period: String,
    pub features: SqlJson<Vec<String>>,
    pub limits: SqlJson<BTreeMap<String, i64>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_paid(&self) -> bool {
        self.amount_cents > 0
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.0.iter().any(|f| f == feature)
    }

    pub fn limit(&self, key: &str) -> Option<i64> {
        self.limits.0.get(key).copied()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub descriptor: String,
    pub name: String,
    pub description: Option<String>,
    pub currency: String,
    pub amount_cents: i64,
    pub billing_period: String,
    pub is_paid: bool,
    pub features: Vec<String>,
}

impl From<Plan> for PlanInfo {
    fn from(plan: Plan) -> Self {
        let is_paid = plan.is_paid();
        PlanInfo {
            descriptor: plan.descriptor,
            name: plan.name,
            description: plan.description,
            currency: plan.currency,
            amount_cents: plan.amount_cents,
            billing_period: plan.billing_period,
            is_paid,
            features: plan.features.0,
        }
    }
}

pub fn routes() -> Router {
    Router::new()
        .route("/v1/billing/plans", get(list_plans))
        .route("/v1/billing/plans/:descriptor", get(get_plan))
}

pub async fn list_plans(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<PlanInfo>>> {
    let plans = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE active ORDER BY amount_cents ASC, descriptor ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(plans.into_iter().map(PlanInfo::from).collect()))
}

pub async fn get_plan(
    Extension(pool): Extension<PgPool>,
    Path(descriptor): Path<String>,
) -> AppResult<Json<PlanInfo>> {
    let plan = find_plan_by_descriptor(&pool, &descriptor)
        .await?
        .ok_or(AppError::NotFound("plan"))?;
    Ok(Json(plan.into()))
}

pub async fn find_plan_by_descriptor<'e, E: PgExecutor<'e>>(
    ex: E,
    descriptor: &str,
) -> AppResult<Option<Plan>> {
    Ok(sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE descriptor = $1 AND active",
    )
    .bind(descriptor)
    .fetch_optional(ex)
    .await?)
}

/// The workspace's one active subscription joined with its plan.
pub async fn active_subscription<'e, E: PgExecutor<'e>>(
    ex: E,
    workspace_id: Uuid,
) -> AppResult<Option<(Subscription, Plan)>> {
    let row = sqlx::query(
        r#"
        SELECT
            s.id, s.workspace_id, s.plan_id, s.status, s.current_period_end,
            s.created_at, s.updated_at,
            p.id AS p_id, p.descriptor, p.name, p.description, p.currency,
            p.amount_cents, p.billing_period, p.features, p.limits, p.active,
            p.created_at AS p_created_at, p.updated_at AS p_updated_at
        FROM subscriptions s
        JOIN plans p ON p.id = s.plan_id
        WHERE s.workspace_id = $1 AND s.status = 'active'
        "#,
    )
    .bind(workspace_id)
    .fetch_optional(ex)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    use sqlx::Row;
    let subscription = Subscription {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        plan_id: row.get("plan_id"),
        status: row.get("status"),
        current_period_end: row.get("current_period_end"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };
    let plan = Plan {
        id: row.get("p_id"),
        descriptor: row.get("descriptor"),
        name: row.get("name"),
        description: row.get("description"),
        currency: row.get("currency"),
        amount_cents: row.get("amount_cents"),
        billing_period: row.get("billing_period"),
        features: row.get("features"),
        limits: row.get("limits"),
        active: row.get("active"),
        created_at: row.get("p_created_at"),
        updated_at: row.get("p_updated_at"),
    };
    Ok(Some((subscription, plan)))
}

/// Route-level feature gate.
pub async fn require_feature(
    pool: &PgPool,
    workspace_id: Uuid,
    feature: &'static str,
) -> AppResult<()> {
    let Some((_, plan)) = active_subscription(pool, workspace_id).await? else {
        return Err(AppError::FeatureLocked(feature));
    };
    if plan.has_feature(feature) {
        Ok(())
    } else {
        Err(AppError::FeatureLocked(feature))
    }
}

/// Mutation-time quantitative gate: rejects when the plan's limit would be
/// exceeded by adding `additional` to `current`. Absent limits are unlimited.
pub async fn check_limit(
    pool: &PgPool,
    workspace_id: Uuid,
    limit_key: &'static str,
    current: i64,
    additional: i64,
) -> AppResult<()> {
    let Some((_, plan)) = active_subscription(pool, workspace_id).await? else {
        return Err(AppError::LimitExceeded(limit_key));
    };
    match plan.limit(limit_key) {
        Some(limit) if current + additional > limit => Err(AppError::LimitExceeded(limit_key)),
        _ => Ok(()),
    }
}

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::billing;
use crate::bus::{EventBus, TOPIC_ORDER_PAYMENT_SUCCEEDED};
use crate::error::{AppError, AppResult};
use crate::extractor::Tenant;
use crate::payments::{CheckoutParams, PaymentProvider};
use crate::policy::{authorize, Action, Resource};
use crate::repo::{
    scope_business_id, scope_created_between, Entity, ListEnvelope, Page, PageQuery, Repo, SqlVal,
};
use crate::validate::Check;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub business_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub total_cents: i64,
    pub currency: String,
    pub status: String,
    pub payment_status: String,
    pub checkout_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const DOMAIN: &'static str = "order";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "business_id",
        "customer_id",
        "total_cents",
        "currency",
        "status",
        "payment_status",
        "checkout_session_id",
        "checkout_url",
    ];

    fn id(&self) -> Uuid {
        self.id
    }

    fn values(&self) -> Vec<SqlVal> {
        vec![
            SqlVal::Uuid(self.id),
            SqlVal::Uuid(self.business_id),
            SqlVal::OptUuid(self.customer_id),
            SqlVal::I64(self.total_cents),
            SqlVal::Str(self.currency.clone()),
            SqlVal::Str(self.status.clone()),
            SqlVal::Str(self.payment_status.clone()),
            SqlVal::OptStr(self.checkout_session_id.clone()),
            SqlVal::OptStr(self.checkout_url.clone()),
        ]
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ListEnvelope<Order>>> {
    authorize(tenant.actor.role, Resource::Orders, Action::Read)?;
    let repo = Repo::<Order>::new();
    let page = Page::from_query(&PageQuery {
        page: query.page,
        page_size: query.page_size,
    });
    let scopes = vec![scope_business_id(tenant.business.id)];
    let total = repo.count(&pool, &scopes).await?;
    let items = repo.list(&pool, &scopes, None, page).await?;
    Ok(Json(ListEnvelope::new(items, page, total)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub customer_id: Option<Uuid>,
    pub total_cents: i64,
}

pub async fn create(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Json(payload): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<Order>)> {
    authorize(tenant.actor.role, Resource::Orders, Action::Write)?;
    let mut check = Check::new();
    check.require("totalCents", payload.total_cents > 0, "must be positive");
    check.finish()?;

    let repo = Repo::<Order>::new();
    let month_start = month_start(Utc::now());
    let this_month = repo
        .count(
            &pool,
            &[
                scope_business_id(tenant.business.id),
                scope_created_between(Some(month_start), None),
            ],
        )
        .await?;
    billing::check_limit(
        &pool,
        tenant.actor.workspace_id,
        "max_orders_per_month",
        this_month,
        1,
    )
    .await?;

    let order = Order {
        id: Uuid::new_v4(),
        business_id: tenant.business.id,
        customer_id: payload.customer_id,
        total_cents: payload.total_cents,
        currency: tenant.business.currency.clone(),
        status: "confirmed".into(),
        payment_status: "none".into(),
        checkout_session_id: None,
        checkout_url: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    repo.create_one(&pool, &order).await?;
    let created = repo
        .find_by_id(&pool, order.id, &[scope_business_id(tenant.business.id)])
        .await?
        .ok_or(AppError::NotFound("order"))?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkRequest {
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLinkResponse {
    pub checkout_url: String,
}

/// Plan-gated payment link for an order; confirmation arrives via webhook.
pub async fn create_payment_link(
    Extension(pool): Extension<PgPool>,
    Extension(provider): Extension<Arc<dyn PaymentProvider>>,
    tenant: Tenant,
    Path((_, id)): Path<(String, Uuid)>,
    Json(payload): Json<PaymentLinkRequest>,
) -> AppResult<Json<PaymentLinkResponse>> {
    authorize(tenant.actor.role, Resource::Orders, Action::Write)?;
    billing::require_feature(&pool, tenant.actor.workspace_id, "order_payment_links").await?;
    let mut check = Check::new();
    check
        .require_present("successUrl", &payload.success_url)
        .require_present("cancelUrl", &payload.cancel_url);
    check.finish()?;

    let repo = Repo::<Order>::new();
    let order = repo
        .find_by_id(&pool, id, &[scope_business_id(tenant.business.id)])
        .await?
        .ok_or(AppError::NotFound("order"))?;
    if order.payment_status == "paid" {
        return Err(AppError::Conflict("order is already paid".into()));
    }
    if let Some(url) = order.checkout_url.clone() {
        if order.payment_status == "pending" {
            return Ok(Json(PaymentLinkResponse { checkout_url: url }));
        }
    }

    let checkout = provider
        .create_checkout_session(CheckoutParams {
            amount_cents: order.total_cents,
            currency: order.currency.clone(),
            description: format!("Order {} at {}", order.id, tenant.business.name),
            success_url: payload.success_url,
            cancel_url: payload.cancel_url,
            metadata: json!({
                "purpose": "order",
                "reference": order.id,
            }),
        })
        .await?;
    repo.patch_one(
        &pool,
        order.id,
        vec![
            ("payment_status", SqlVal::Str("pending".into())),
            ("checkout_session_id", SqlVal::OptStr(Some(checkout.id))),
            ("checkout_url", SqlVal::OptStr(Some(checkout.url.clone()))),
        ],
        &[scope_business_id(tenant.business.id)],
    )
    .await?;
    Ok(Json(PaymentLinkResponse {
        checkout_url: checkout.url,
    }))
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, TimeZone};
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Post-payment side effects, decoupled from the webhook request.
pub fn spawn_subscribers(bus: &EventBus, pool: PgPool) {
    bus.listen(TOPIC_ORDER_PAYMENT_SUCCEEDED, move |event| {
        let pool = pool.clone();
        async move {
            let Some(order_id) = event.payload["orderId"]
                .as_str()
                .and_then(|v| Uuid::parse_str(v).ok())
            else {
                tracing::warn!("order payment event without orderId");
                return;
            };
            tracing::info!(
                %order_id,
                request_id = ?event.request_id,
                "order payment confirmed"
            );
            if let Err(e) = sqlx::query(
                "UPDATE orders SET status = 'paid', updated_at = NOW() \
                 WHERE id = $1 AND payment_status = 'paid'",
            )
            .bind(order_id)
            .execute(&pool)
            .await
            {
                tracing::warn!(?e, %order_id, "post-payment order update failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn month_start_truncates_to_first_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 7, 19, 13, 45, 9).single().unwrap();
        let start = month_start(now);
        assert_eq!(
            start,
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).single().unwrap()
        );
    }
}

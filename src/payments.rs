use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::Extension;
use chrono::Utc;
use futures_util::FutureExt;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::bus::{Event, EventBus, TOPIC_ONBOARDING_PAYMENT_SUCCEEDED, TOPIC_ORDER_PAYMENT_SUCCEEDED};
use crate::config;
use crate::db::{self, ExecOptions};
use crate::error::{AppError, AppResult};

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Round-tripped by the provider into webhook events; carries the
    /// fulfillment target.
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// External checkout provider capability the core requires.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(&self, params: CheckoutParams) -> AppResult<CheckoutSession>;
}

pub struct HttpPaymentProvider {
    client: reqwest::Client,
    endpoint: String,
    secret_key: String,
}

impl HttpPaymentProvider {
    pub fn from_config() -> Arc<Self> {
        Self::new(
            config::PAYMENT_API_ENDPOINT.clone(),
            config::PAYMENT_SECRET_KEY.clone(),
        )
    }

    pub fn new(endpoint: String, secret_key: String) -> Arc<Self> {
        Arc::new(HttpPaymentProvider {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("client build"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            secret_key,
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_checkout_session(&self, params: CheckoutParams) -> AppResult<CheckoutSession> {
        if self.endpoint.is_empty() || self.secret_key.is_empty() {
            return Err(AppError::Message("payment provider is not configured".into()));
        }
        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.endpoint))
            .bearer_auth(&self.secret_key)
            .json(&json!({
                "amount": params.amount_cents,
                "currency": params.currency,
                "description": params.description,
                "success_url": params.success_url,
                "cancel_url": params.cancel_url,
                "metadata": params.metadata,
            }))
            .send()
            .await
            .map_err(upstream)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            tracing::error!(status, "payment provider rejected checkout session");
            return Err(AppError::Upstream {
                provider: "payment",
                status: Some(status),
                cause: "checkout session creation rejected".into(),
            });
        }
        response.json().await.map_err(upstream)
    }
}

/// Verifies `t=<unix>,v1=<hex hmac>` against `"{t}.{body}"`, rejecting
/// signatures outside the tolerance window. HMAC comparison is constant-time.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now_unix: i64,
    tolerance_secs: i64,
) -> AppResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<String> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(AppError::Unauthorized),
    };
    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(AppError::Unauthorized);
    }
    let provided = hex::decode(signature).map_err(|_| AppError::Unauthorized)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can use any key length");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| AppError::Unauthorized)
}

/// Test/tooling helper producing a header `verify_signature` accepts.
pub fn sign_payload(secret: &str, body: &[u8], timestamp: i64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can use any key length");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: WebhookData,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookData {
    #[serde(default)]
    object: Value,
}

#[derive(Debug)]
enum Fulfillment {
    /// First delivery: state advanced, event due.
    Onboarding { reference: String, email: String },
    Order { order_id: Uuid, business_id: Uuid },
    /// Replay or unknown target; acknowledged without side effects.
    None,
}

/// Provider webhook entry point. State is durably committed before the 2xx;
/// the provider may redeliver freely and fulfillment stays exactly-once.
pub async fn webhook(
    Extension(pool): Extension<PgPool>,
    Extension(bus): Extension<Arc<EventBus>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let secret = config::PAYMENT_WEBHOOK_SECRET.as_str();
    if secret.is_empty() {
        return Err(AppError::Message("PAYMENT_WEBHOOK_SECRET is not configured".into()));
    }
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    verify_signature(
        secret,
        header,
        &body,
        Utc::now().timestamp(),
        *config::PAYMENT_WEBHOOK_TOLERANCE_SECS,
    )?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|_| AppError::validation("body", "malformed webhook payload"))?;
    if event.kind != "checkout.session.completed" {
        tracing::debug!(kind = %event.kind, "ignoring webhook event type");
        return Ok(StatusCode::OK);
    }

    let fulfillment = fulfill(&pool, &event).await?;
    match fulfillment {
        Fulfillment::Onboarding { reference, email } => {
            bus.emit(Event::new(
                TOPIC_ONBOARDING_PAYMENT_SUCCEEDED,
                json!({ "reference": reference, "email": email }),
            ))
            .await;
        }
        Fulfillment::Order { order_id, business_id } => {
            bus.emit(Event::new(
                TOPIC_ORDER_PAYMENT_SUCCEEDED,
                json!({ "orderId": order_id, "businessId": business_id }),
            ))
            .await;
        }
        Fulfillment::None => {}
    }
    Ok(StatusCode::OK)
}

/// Idempotent on the provider event id: the first delivery claims the id and
/// advances the target inside one transaction; replays claim nothing.
async fn fulfill(pool: &PgPool, event: &WebhookEvent) -> AppResult<Fulfillment> {
    let event_id = event.id.clone();
    let kind = event.kind.clone();
    let object = event.data.object.clone();
    db::exec(pool, ExecOptions::default(), move |tx| {
        let event_id = event_id.clone();
        let kind = kind.clone();
        let object = object.clone();
        async move {
            let claimed = sqlx::query(
                "INSERT INTO payment_events (provider_event_id, kind) VALUES ($1, $2) \
                 ON CONFLICT (provider_event_id) DO NOTHING",
            )
            .bind(&event_id)
            .bind(&kind)
            .execute(&mut **tx)
            .await?
            .rows_affected();
            if claimed == 0 {
                tracing::info!(event_id = %event_id, "webhook replay acknowledged");
                return Ok(Fulfillment::None);
            }

            let metadata = object.get("metadata").cloned().unwrap_or(Value::Null);
            let purpose = metadata.get("purpose").and_then(Value::as_str).unwrap_or("");
            let reference = metadata
                .get("reference")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            match purpose {
                "onboarding" => {
                    let advanced: Option<String> = sqlx::query_scalar(
                        "UPDATE onboarding_sessions SET stage = 'payment_confirmed', updated_at = NOW() \
                         WHERE token_hash = $1 AND stage = 'payment_pending' RETURNING email",
                    )
                    .bind(&reference)
                    .fetch_optional(&mut **tx)
                    .await?;
                    match advanced {
                        Some(email) => Ok(Fulfillment::Onboarding { reference, email }),
                        None => {
                            tracing::warn!("onboarding webhook matched no pending session");
                            Ok(Fulfillment::None)
                        }
                    }
                }
                "order" => {
                    let order_id = Uuid::parse_str(&reference)
                        .map_err(|_| AppError::validation("reference", "invalid order reference"))?;
                    let business_id: Option<Uuid> = sqlx::query_scalar(
                        "UPDATE orders SET payment_status = 'paid', updated_at = NOW() \
                         WHERE id = $1 AND payment_status = 'pending' RETURNING business_id",
                    )
                    .bind(order_id)
                    .fetch_optional(&mut **tx)
                    .await?;
                    match business_id {
                        Some(business_id) => Ok(Fulfillment::Order { order_id, business_id }),
                        None => Ok(Fulfillment::None),
                    }
                }
                other => {
                    tracing::warn!(purpose = other, "webhook metadata without known purpose");
                    Ok(Fulfillment::None)
                }
            }
        }
        .boxed()
    })
    .await
}

fn upstream(e: reqwest::Error) -> AppError {
    tracing::error!(?e, "payment provider call failed");
    AppError::Upstream {
        provider: "payment",
        status: e.status().map(|s| s.as_u16()),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, body, 1_700_000_000);
        assert!(verify_signature(SECRET, &header, body, 1_700_000_010, 300).is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload("other", body, 1_700_000_000);
        assert!(verify_signature(SECRET, &header, body, 1_700_000_010, 300).is_err());
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign_payload(SECRET, br#"{"id":"evt_1"}"#, 1_700_000_000);
        assert!(
            verify_signature(SECRET, &header, br#"{"id":"evt_2"}"#, 1_700_000_010, 300).is_err()
        );
    }

    #[test]
    fn stale_timestamp_is_a_replay() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign_payload(SECRET, body, 1_700_000_000);
        assert!(verify_signature(SECRET, &header, body, 1_700_000_000 + 301, 300).is_err());
        assert!(verify_signature(SECRET, &header, body, 1_700_000_000 - 301, 300).is_err());
    }

    #[test]
    fn malformed_headers_fail_closed() {
        let body = b"{}";
        for header in ["", "t=,v1=", "v1=abc", "t=123", "t=123,v1=zz"] {
            assert!(verify_signature(SECRET, header, body, 123, 300).is_err());
        }
    }
}

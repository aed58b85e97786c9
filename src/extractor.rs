use axum::async_trait;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum::RequestPartsExt;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::jwt::{self, TokenKind};
use crate::policy::Role;
use crate::rate_limit::RateLimiter;

/// The authenticated user behind a request.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub role: Role,
    pub auth_version: i32,
    pub email: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;
        let claims = jwt::verify(token, TokenKind::Access)?;

        let pool = parts
            .extensions
            .get::<PgPool>()
            .cloned()
            .ok_or_else(|| AppError::Message("database pool missing from request".into()))?;
        let row: Option<(String, i32, String)> = sqlx::query_as(
            "SELECT role, auth_version, email FROM users WHERE id = $1 AND workspace_id = $2",
        )
        .bind(claims.sub)
        .bind(claims.wid)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error loading actor");
            AppError::Db(e)
        })?;
        let (role, auth_version, email) = row.ok_or(AppError::Unauthorized)?;
        // Logout-all bumps the stored version; older tokens die here.
        if auth_version > claims.ver {
            return Err(AppError::Unauthorized);
        }
        let role = Role::parse(&role).ok_or(AppError::Unauthorized)?;
        Ok(Actor {
            user_id: claims.sub,
            workspace_id: claims.wid,
            role,
            auth_version,
            email,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Business {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub descriptor: String,
    pub currency: String,
    pub country: String,
    pub storefront_enabled: bool,
    pub storefront_public_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Actor plus the business resolved from `:businessDescriptor`, verified to
/// live in the actor's workspace. Resolution failure is always a 404 so the
/// existence of foreign businesses never leaks.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub actor: Actor,
    pub business: Business,
}

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let actor = Actor::from_request_parts(parts, state).await?;
        let Path(params) = parts
            .extract::<Path<HashMap<String, String>>>()
            .await
            .map_err(|_| AppError::NotFound("business"))?;
        let descriptor = params
            .get("businessDescriptor")
            .ok_or(AppError::NotFound("business"))?
            .clone();

        if let Some(limiter) = parts.extensions.get::<Arc<RateLimiter>>() {
            let class = route_class(parts.uri.path());
            limiter.check(&RateLimiter::workspace_key(actor.workspace_id, class))?;
        }

        let pool = parts
            .extensions
            .get::<PgPool>()
            .cloned()
            .ok_or_else(|| AppError::Message("database pool missing from request".into()))?;
        let business = sqlx::query_as::<_, Business>(
            "SELECT * FROM businesses WHERE workspace_id = $1 AND descriptor = $2",
        )
        .bind(actor.workspace_id)
        .bind(&descriptor)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error resolving business");
            AppError::Db(e)
        })?
        .ok_or(AppError::NotFound("business"))?;
        Ok(Tenant { actor, business })
    }
}

/// Route class for rate limiting: the segment after the business descriptor,
/// e.g. `/v1/businesses/my-shop/customers/…` → `customers`.
fn route_class(path: &str) -> &str {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .nth(3)
        .unwrap_or("business")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn route_class_is_the_fourth_segment() {
        assert_eq!(route_class("/v1/businesses/my-shop/customers"), "customers");
        assert_eq!(
            route_class("/v1/businesses/my-shop/assets/presign"),
            "assets"
        );
        assert_eq!(route_class("/v1/businesses/my-shop"), "business");
    }

    #[tokio::test]
    async fn missing_bearer_is_unauthorized() {
        std::env::set_var("JWT_SECRET", "test-secret");
        let request = Request::builder()
            .uri("/v1/businesses/shop/customers")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let result = Actor::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() {
        std::env::set_var("JWT_SECRET", "test-secret");
        let request = Request::builder()
            .header("Authorization", "Bearer not-a-jwt")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let result = Actor::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AppError::Unauthorized)));
    }
}

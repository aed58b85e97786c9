use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing;
use crate::error::{AppError, AppResult};
use crate::extractor::Tenant;
use crate::policy::{authorize, Action, Resource};
use crate::repo::{
    scope_business_id, Entity, ListEnvelope, Page, PageQuery, Repo, SqlVal,
};
use crate::search::{web_search_rank_order, web_search_scope};
use crate::validate::Check;

const SEARCH_COLUMNS: &[&str] = &["search"];

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Customer {
    const TABLE: &'static str = "customers";
    const DOMAIN: &'static str = "customer";
    const COLUMNS: &'static [&'static str] =
        &["id", "business_id", "name", "email", "phone", "notes"];

    fn id(&self) -> Uuid {
        self.id
    }

    fn values(&self) -> Vec<SqlVal> {
        vec![
            SqlVal::Uuid(self.id),
            SqlVal::Uuid(self.business_id),
            SqlVal::Str(self.name.clone()),
            SqlVal::OptStr(self.email.clone()),
            SqlVal::OptStr(self.phone.clone()),
            SqlVal::OptStr(self.notes.clone()),
        ]
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ListEnvelope<Customer>>> {
    authorize(tenant.actor.role, Resource::Customers, Action::Read)?;
    let repo = Repo::<Customer>::new();
    let page = Page::from_query(&PageQuery {
        page: query.page,
        page_size: query.page_size,
    });
    let term = query.q.unwrap_or_default();
    let scopes = vec![
        scope_business_id(tenant.business.id),
        web_search_scope(&term, SEARCH_COLUMNS),
    ];
    let order = if term.trim().is_empty() {
        None
    } else {
        Some(web_search_rank_order(&term, SEARCH_COLUMNS))
    };
    let total = repo.count(&pool, &scopes).await?;
    let items = repo.list(&pool, &scopes, order.as_ref(), page).await?;
    Ok(Json(ListEnvelope::new(items, page, total)))
}

#[derive(Deserialize)]
pub struct CreateCustomerRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub async fn create(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Json(payload): Json<CreateCustomerRequest>,
) -> AppResult<(StatusCode, Json<Customer>)> {
    authorize(tenant.actor.role, Resource::Customers, Action::Write)?;
    let mut check = Check::new();
    check.require_present("name", &payload.name);
    if let Some(email) = payload.email.as_deref() {
        check.require_email("email", email);
    }
    check.finish()?;

    let repo = Repo::<Customer>::new();
    let current = repo
        .count(&pool, &[scope_business_id(tenant.business.id)])
        .await?;
    billing::check_limit(&pool, tenant.actor.workspace_id, "max_customers", current, 1).await?;

    let customer = Customer {
        id: Uuid::new_v4(),
        business_id: tenant.business.id,
        name: payload.name.trim().to_string(),
        email: payload.email.map(|e| e.trim().to_lowercase()),
        phone: payload.phone,
        notes: payload.notes,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    repo.create_one(&pool, &customer).await?;
    let created = repo
        .find_by_id(&pool, customer.id, &[scope_business_id(tenant.business.id)])
        .await?
        .ok_or(AppError::NotFound("customer"))?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<Json<Customer>> {
    authorize(tenant.actor.role, Resource::Customers, Action::Read)?;
    let customer = Repo::<Customer>::new()
        .find_by_id(&pool, id, &[scope_business_id(tenant.business.id)])
        .await?
        .ok_or(AppError::NotFound("customer"))?;
    Ok(Json(customer))
}

#[derive(Deserialize)]
pub struct PatchCustomerRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

pub async fn patch(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Path((_, id)): Path<(String, Uuid)>,
    Json(payload): Json<PatchCustomerRequest>,
) -> AppResult<Json<Customer>> {
    authorize(tenant.actor.role, Resource::Customers, Action::Write)?;
    let mut check = Check::new();
    if let Some(name) = payload.name.as_deref() {
        check.require_present("name", name);
    }
    if let Some(email) = payload.email.as_deref() {
        check.require_email("email", email);
    }
    check.finish()?;

    let mut patch: Vec<(&'static str, SqlVal)> = Vec::new();
    if let Some(name) = payload.name {
        patch.push(("name", SqlVal::Str(name.trim().to_string())));
    }
    if let Some(email) = payload.email {
        patch.push(("email", SqlVal::OptStr(Some(email.trim().to_lowercase()))));
    }
    if let Some(phone) = payload.phone {
        patch.push(("phone", SqlVal::OptStr(Some(phone))));
    }
    if let Some(notes) = payload.notes {
        patch.push(("notes", SqlVal::OptStr(Some(notes))));
    }
    if patch.is_empty() {
        return Err(AppError::validation("body", "no fields to update"));
    }
    let customer = Repo::<Customer>::new()
        .patch_one(&pool, id, patch, &[scope_business_id(tenant.business.id)])
        .await?;
    Ok(Json(customer))
}

pub async fn delete(
    Extension(pool): Extension<PgPool>,
    tenant: Tenant,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<StatusCode> {
    authorize(tenant.actor.role, Resource::Customers, Action::Delete)?;
    let deleted = Repo::<Customer>::new()
        .delete_one(&pool, id, &[scope_business_id(tenant.business.id)])
        .await?;
    if !deleted {
        return Err(AppError::NotFound("customer"));
    }
    Ok(StatusCode::NO_CONTENT)
}

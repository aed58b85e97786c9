use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::blob::{self, BlobStore, CompletedPart, PresignPut, PresignedUpload};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::Tenant;
use crate::policy::{authorize, Action, Resource};
use crate::repo::{scope_business_id, Entity, ListEnvelope, Page, PageQuery, Repo, SqlVal};
use crate::validate::Check;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: Uuid,
    pub business_id: Uuid,
    pub key: String,
    pub kind: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Asset {
    const TABLE: &'static str = "assets";
    const DOMAIN: &'static str = "asset";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "business_id",
        "key",
        "kind",
        "content_type",
        "size_bytes",
        "etag",
        "purchased_at",
    ];

    fn id(&self) -> Uuid {
        self.id
    }

    fn values(&self) -> Vec<SqlVal> {
        vec![
            SqlVal::Uuid(self.id),
            SqlVal::Uuid(self.business_id),
            SqlVal::Str(self.key.clone()),
            SqlVal::Str(self.kind.clone()),
            SqlVal::Str(self.content_type.clone()),
            SqlVal::I64(self.size_bytes),
            SqlVal::OptStr(self.etag.clone()),
            SqlVal::OptTimestamp(self.purchased_at),
        ]
    }
}

fn kind_for(content_type: &str) -> &'static str {
    if content_type.starts_with("image/") {
        "image"
    } else if content_type == "application/pdf" || content_type.starts_with("text/") {
        "document"
    } else {
        "other"
    }
}

fn store(
    store: &Option<Arc<dyn BlobStore>>,
) -> AppResult<&Arc<dyn BlobStore>> {
    store.as_ref().ok_or(AppError::BlobNotConfigured)
}

/// Tenant safety for client-echoed keys: a key must sit under the resolved
/// business's prefix.
fn require_owned_key(business_id: Uuid, key: &str) -> AppResult<()> {
    if key.starts_with(&format!("biz_{business_id}/")) {
        Ok(())
    } else {
        Err(AppError::NotFound("asset"))
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
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ListEnvelope<AssetView>>> {
    authorize(tenant.actor.role, Resource::Assets, Action::Read)?;
    let repo = Repo::<Asset>::new();
    let page = Page::from_query(&PageQuery {
        page: query.page,
        page_size: query.page_size,
    });
    let scopes = vec![scope_business_id(tenant.business.id)];
    let total = repo.count(&pool, &scopes).await?;
    let items = repo.list(&pool, &scopes, None, page).await?;
    let items = items
        .into_iter()
        .map(|asset| {
            let public_url = blob_store
                .as_ref()
                .and_then(|store| store.public_url(&asset.key));
            AssetView { asset, public_url }
        })
        .collect();
    Ok(Json(ListEnvelope::new(items, page, total)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    #[serde(flatten)]
    pub asset: Asset,
    pub public_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub content_type: String,
    pub size_bytes: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub key: String,
    pub upload: PresignedUpload,
}

/// Step one of the upload flow: the server picks the key and hands back a
/// short-lived direct-PUT URL.
pub async fn presign(
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<PresignRequest>,
) -> AppResult<Json<PresignResponse>> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    let mut check = Check::new();
    check.require_present("contentType", &payload.content_type);
    check.finish()?;
    let store = store(&blob_store)?;
    let key = blob::object_key(tenant.business.id, &payload.content_type);
    let upload = store
        .presign_put(PresignPut {
            key: key.clone(),
            content_type: payload.content_type,
            size_bytes: payload.size_bytes,
            expires_in: None,
        })
        .await?;
    Ok(Json(PresignResponse { key, upload }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub purchased_at: Option<DateTime<Utc>>,
}

/// Step two: only after the store confirms presence, declared content type,
/// and a size within tolerance does an asset row appear.
pub async fn confirm(
    Extension(pool): Extension<PgPool>,
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<ConfirmRequest>,
) -> AppResult<(StatusCode, Json<Asset>)> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    require_owned_key(tenant.business.id, &payload.key)?;
    let store = store(&blob_store)?;

    let meta = store.head(&payload.key).await?;
    if !meta.content_type.is_empty() && meta.content_type != payload.content_type {
        return Err(AppError::validation(
            "contentType",
            "does not match the uploaded object",
        ));
    }
    let delta = (meta.size_bytes - payload.size_bytes).abs();
    if delta > *config::BLOB_SIZE_TOLERANCE_BYTES {
        return Err(AppError::SizeMismatch {
            declared: payload.size_bytes,
            observed: meta.size_bytes,
        });
    }

    let asset = Asset {
        id: Uuid::new_v4(),
        business_id: tenant.business.id,
        key: payload.key,
        kind: kind_for(&payload.content_type).to_string(),
        content_type: payload.content_type,
        size_bytes: meta.size_bytes,
        etag: meta.etag,
        purchased_at: payload.purchased_at,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let repo = Repo::<Asset>::new();
    repo.create_one(&pool, &asset).await?;
    let created = repo
        .find_by_id(&pool, asset.id, &[scope_business_id(tenant.business.id)])
        .await?
        .ok_or(AppError::NotFound("asset"))?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Deleting is idempotent end to end: a missing row or missing object both
/// count as success.
pub async fn delete(
    Extension(pool): Extension<PgPool>,
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Path((_, id)): Path<(String, Uuid)>,
) -> AppResult<StatusCode> {
    authorize(tenant.actor.role, Resource::Assets, Action::Delete)?;
    let repo = Repo::<Asset>::new();
    let asset = repo
        .find_by_id(&pool, id, &[scope_business_id(tenant.business.id)])
        .await?;
    let Some(asset) = asset else {
        return Ok(StatusCode::NO_CONTENT);
    };
    store(&blob_store)?.delete(&asset.key).await?;
    repo.delete_one(&pool, asset.id, &[scope_business_id(tenant.business.id)])
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartStartRequest {
    pub content_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartStartResponse {
    pub key: String,
    pub upload_id: String,
}

pub async fn multipart_start(
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<MultipartStartRequest>,
) -> AppResult<Json<MultipartStartResponse>> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    let mut check = Check::new();
    check.require_present("contentType", &payload.content_type);
    check.finish()?;
    let store = store(&blob_store)?;
    let key = blob::object_key(tenant.business.id, &payload.content_type);
    let upload_id = store.create_multipart(&key, &payload.content_type).await?;
    Ok(Json(MultipartStartResponse { key, upload_id }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartPartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartPartResponse {
    pub url: String,
}

pub async fn multipart_part(
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<MultipartPartRequest>,
) -> AppResult<Json<MultipartPartResponse>> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    require_owned_key(tenant.business.id, &payload.key)?;
    let store = store(&blob_store)?;
    let url = store
        .presign_part(
            &payload.key,
            &payload.upload_id,
            payload.part_number,
            Duration::from_secs(blob::DEFAULT_PRESIGN_EXPIRY_SECS),
        )
        .await?;
    Ok(Json(MultipartPartResponse { url }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCompleteRequest {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

pub async fn multipart_complete(
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<MultipartCompleteRequest>,
) -> AppResult<StatusCode> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    require_owned_key(tenant.business.id, &payload.key)?;
    let store = store(&blob_store)?;
    store
        .complete_multipart(&payload.key, &payload.upload_id, &payload.parts)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartAbortRequest {
    pub key: String,
    pub upload_id: String,
}

pub async fn multipart_abort(
    Extension(blob_store): Extension<Option<Arc<dyn BlobStore>>>,
    tenant: Tenant,
    Json(payload): Json<MultipartAbortRequest>,
) -> AppResult<StatusCode> {
    authorize(tenant.actor.role, Resource::Assets, Action::Write)?;
    require_owned_key(tenant.business.id, &payload.key)?;
    let store = store(&blob_store)?;
    store.abort_multipart(&payload.key, &payload.upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_content_type() {
        assert_eq!(kind_for("image/png"), "image");
        assert_eq!(kind_for("application/pdf"), "document");
        assert_eq!(kind_for("text/csv"), "document");
        assert_eq!(kind_for("application/zip"), "other");
    }

    #[test]
    fn foreign_keys_read_as_missing() {
        let business = Uuid::new_v4();
        let own = format!("biz_{business}/img/a.jpg");
        assert!(require_owned_key(business, &own).is_ok());
        let foreign = format!("biz_{}/img/a.jpg", Uuid::new_v4());
        assert!(matches!(
            require_owned_key(business, &foreign),
            Err(AppError::NotFound("asset"))
        ));
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

pub const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 600;
pub const MIN_PART_NUMBER: i32 = 1;
pub const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Debug, Clone)]
pub struct PresignPut {
    pub key: String,
    pub content_type: String,
    pub size_bytes: Option<i64>,
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    pub method: &'static str,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size_bytes: i64,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Object store capability the platform core requires. Implementations own
/// the bytes; the database rows own the references.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn presign_put(&self, request: PresignPut) -> AppResult<PresignedUpload>;
    async fn head(&self, key: &str) -> AppResult<ObjectMeta>;
    /// Idempotent: deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> AppResult<()>;
    fn public_url(&self, key: &str) -> Option<String>;
    async fn create_multipart(&self, key: &str, content_type: &str) -> AppResult<String>;
    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> AppResult<String>;
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> AppResult<()>;
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> AppResult<()>;
}

/// Server-generated object key: business prefix, content-type subpath,
/// random stem. Clients never choose keys.
pub fn object_key(business_id: Uuid, content_type: &str) -> String {
    let (kind, ext) = match content_type {
        "image/jpeg" => ("img", "jpg"),
        "image/png" => ("img", "png"),
        "image/webp" => ("img", "webp"),
        "image/gif" => ("img", "gif"),
        "application/pdf" => ("doc", "pdf"),
        "text/csv" => ("doc", "csv"),
        _ => ("file", "bin"),
    };
    format!("biz_{business_id}/{kind}/{}.{ext}", Uuid::new_v4().simple())
}

/// None when no provider is configured; callers surface
/// `blob.provider_not_configured`.
pub fn from_config() -> Option<Arc<dyn BlobStore>> {
    match config::BLOB_PROVIDER.as_str() {
        "" | "local" => None,
        "s3" => Some(S3BlobStore::new(
            config::BLOB_S3_ENDPOINT.clone(),
            config::BLOB_S3_BUCKET.clone(),
            config::BLOB_S3_REGION.clone(),
            config::BLOB_S3_ACCESS_KEY.clone(),
            config::BLOB_S3_SECRET_KEY.clone(),
            if config::BLOB_PUBLIC_BASE_URL.is_empty() {
                None
            } else {
                Some(config::BLOB_PUBLIC_BASE_URL.clone())
            },
        )),
        other => {
            tracing::warn!(provider = other, "unknown BLOB_PROVIDER; blob storage disabled");
            None
        }
    }
}

static UPLOAD_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<UploadId>([^<]+)</UploadId>").expect("upload id regex"));

/// S3-compatible store. Always path-style (`endpoint/bucket/key`) so MinIO
/// and friends work unchanged; requests are SigV4-signed by hand.
pub struct S3BlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    public_base_url: Option<String>,
}

impl S3BlobStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        region: String,
        access_key: String,
        secret_key: String,
        public_base_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(S3BlobStore {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("client build"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            region,
            access_key,
            secret_key,
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn host(&self) -> String {
        url::Url::parse(&self.endpoint)
            .ok()
            .and_then(|parsed| {
                parsed.host_str().map(|host| match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })
            .unwrap_or_else(|| {
                self.endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string()
            })
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, uri_encode(key, false))
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}{}", self.endpoint, self.object_path(key))
    }

    fn credential_scope(&self, date: &str) -> String {
        format!("{date}/{}/s3/aws4_request", self.region)
    }

    /// Query-string presign (SigV4). `signed_headers` are lowercase
    /// name/value pairs the client must send verbatim.
    fn presign_url(
        &self,
        method: &str,
        key: &str,
        extra_query: &[(&str, String)],
        signed_headers: &[(&str, String)],
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = self.credential_scope(&date);

        let mut headers: BTreeMap<String, String> = signed_headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.trim().to_string()))
            .collect();
        headers.insert("host".into(), self.host());
        let signed_header_names = headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let mut query: BTreeMap<String, String> = extra_query
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        query.insert("X-Amz-Algorithm".into(), "AWS4-HMAC-SHA256".into());
        query.insert(
            "X-Amz-Credential".into(),
            format!("{}/{scope}", self.access_key),
        );
        query.insert("X-Amz-Date".into(), amz_date.clone());
        query.insert("X-Amz-Expires".into(), expires_in.as_secs().to_string());
        query.insert("X-Amz-SignedHeaders".into(), signed_header_names.clone());
        let canonical_query = canonical_query_string(&query);

        let canonical_request = format!(
            "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_header_names}\nUNSIGNED-PAYLOAD",
            path = self.object_path(key),
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));
        format!(
            "{}?{canonical_query}&X-Amz-Signature={signature}",
            self.object_url(key)
        )
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// Header-signed request for server-side calls (HEAD/DELETE/multipart
    /// control). The payload hash covers the body when one is sent.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(&str, String)],
        body: Option<String>,
    ) -> AppResult<reqwest::Response> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = self.credential_scope(&date);
        let payload_hash = match &body {
            Some(body) => hex_sha256(body.as_bytes()),
            None => hex_sha256(b""),
        };

        let query_map: BTreeMap<String, String> = query
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let canonical_query = canonical_query_string(&query_map);
        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n",
            self.host()
        );
        let signed_header_names = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
            method = method.as_str(),
            path = self.object_path(key),
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_header_names}, Signature={signature}",
            self.access_key
        );

        let url = if canonical_query.is_empty() {
            self.object_url(key)
        } else {
            format!("{}?{canonical_query}", self.object_url(key))
        };
        let mut request = self
            .client
            .request(method, &url)
            .header("authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash);
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.map_err(upstream)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn presign_put(&self, request: PresignPut) -> AppResult<PresignedUpload> {
        if request.key.trim().is_empty() {
            return Err(AppError::validation("key", "required"));
        }
        if request.content_type.trim().is_empty() {
            return Err(AppError::validation("contentType", "required"));
        }
        let expires_in = request
            .expires_in
            .unwrap_or(Duration::from_secs(DEFAULT_PRESIGN_EXPIRY_SECS));
        let now = Utc::now();
        let url = self.presign_url(
            "PUT",
            &request.key,
            &[],
            &[("content-type", request.content_type.clone())],
            expires_in,
            now,
        );
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), request.content_type);
        Ok(PresignedUpload {
            method: "PUT",
            url,
            headers,
            expires_at: now + chrono::Duration::seconds(expires_in.as_secs() as i64),
        })
    }

    async fn head(&self, key: &str) -> AppResult<ObjectMeta> {
        let response = self
            .signed_request(reqwest::Method::HEAD, key, &[], None)
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::BlobObjectNotFound);
        }
        if !response.status().is_success() {
            return Err(status_error(&response, "head"));
        }
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        Ok(ObjectMeta {
            size_bytes: header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header("content-type").unwrap_or_default(),
            etag: header("etag").map(|etag| etag.trim_matches('"').to_string()),
            last_modified: header("last-modified"),
        })
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let response = self
            .signed_request(reqwest::Method::DELETE, key, &[], None)
            .await?;
        // Missing objects delete cleanly; that is the idempotency contract.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(&response, "delete"))
        }
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{}", uri_encode(key, false)))
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> AppResult<String> {
        if key.trim().is_empty() || content_type.trim().is_empty() {
            return Err(AppError::validation("key", "key and contentType are required"));
        }
        let response = self
            .signed_request(
                reqwest::Method::POST,
                key,
                &[("uploads", String::new())],
                None,
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(&response, "create_multipart"));
        }
        let body = response.text().await.map_err(upstream)?;
        UPLOAD_ID
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str().to_string())
            .ok_or_else(|| AppError::Upstream {
                provider: "blob",
                status: None,
                cause: "multipart initiation response missing UploadId".into(),
            })
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> AppResult<String> {
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(AppError::validation(
                "partNumber",
                &format!("must be between {MIN_PART_NUMBER} and {MAX_PART_NUMBER}"),
            ));
        }
        Ok(self.presign_url(
            "PUT",
            key,
            &[
                ("partNumber", part_number.to_string()),
                ("uploadId", upload_id.to_string()),
            ],
            &[],
            expires_in,
            Utc::now(),
        ))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> AppResult<()> {
        if parts.is_empty() {
            return Err(AppError::validation("parts", "at least one part is required"));
        }
        let mut body = String::from("<CompleteMultipartUpload>");
        for part in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                part.part_number,
                part.etag.trim_matches('"')
            ));
        }
        body.push_str("</CompleteMultipartUpload>");
        let response = self
            .signed_request(
                reqwest::Method::POST,
                key,
                &[("uploadId", upload_id.to_string())],
                Some(body),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(&response, "complete_multipart"));
        }
        // S3 can return 200 with an error document.
        let text = response.text().await.map_err(upstream)?;
        if text.contains("<Error>") {
            return Err(AppError::Upstream {
                provider: "blob",
                status: Some(200),
                cause: "multipart completion returned an error document".into(),
            });
        }
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> AppResult<()> {
        let response = self
            .signed_request(
                reqwest::Method::DELETE,
                key,
                &[("uploadId", upload_id.to_string())],
                None,
            )
            .await?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(&response, "abort_multipart"))
        }
    }
}

fn canonical_query_string(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(name, value)| format!("{}={}", uri_encode(name, true), uri_encode(value, true)))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC can use any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn upstream(e: reqwest::Error) -> AppError {
    tracing::error!(?e, "blob provider call failed");
    AppError::Upstream {
        provider: "blob",
        status: e.status().map(|s| s.as_u16()),
        cause: e.to_string(),
    }
}

fn status_error(response: &reqwest::Response, op: &str) -> AppError {
    AppError::Upstream {
        provider: "blob",
        status: Some(response.status().as_u16()),
        cause: format!("{op} returned {}", response.status()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> Arc<S3BlobStore> {
        S3BlobStore::new(
            "http://minio.local:9000".into(),
            "souk-media".into(),
            "us-east-1".into(),
            "AKIDEXAMPLE".into(),
            "secret".into(),
            Some("https://cdn.example.com".into()),
        )
    }

    #[test]
    fn object_keys_are_business_prefixed_and_typed() {
        let business = Uuid::new_v4();
        let key = object_key(business, "image/jpeg");
        assert!(key.starts_with(&format!("biz_{business}/img/")));
        assert!(key.ends_with(".jpg"));
        let other = object_key(business, "application/zip");
        assert!(other.contains("/file/"));
        assert!(other.ends_with(".bin"));
    }

    #[test]
    fn presigned_url_is_path_style_and_complete() {
        let store = store();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let url = store.presign_url(
            "PUT",
            "biz_x/img/a.jpg",
            &[],
            &[("content-type", "image/jpeg".to_string())],
            Duration::from_secs(600),
            now,
        );
        assert!(url.starts_with("http://minio.local:9000/souk-media/biz_x/img/a.jpg?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-SignedHeaders=content-type%3Bhost"));
        assert!(url.contains("20260301%2Fus-east-1%2Fs3%2Faws4_request"));
        let signature = url.split("X-Amz-Signature=").nth(1).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn presigning_is_deterministic_for_fixed_inputs() {
        let store = store();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let first = store.presign_url("PUT", "k", &[], &[], Duration::from_secs(60), now);
        let second = store.presign_url("PUT", "k", &[], &[], Duration::from_secs(60), now);
        assert_eq!(first, second);
        let other_key = store.presign_url("PUT", "k2", &[], &[], Duration::from_secs(60), now);
        assert_ne!(first, other_key);
    }

    #[test]
    fn uri_encoding_preserves_slashes_only_in_paths() {
        assert_eq!(uri_encode("biz_1/img/a.jpg", false), "biz_1/img/a.jpg");
        assert_eq!(uri_encode("a b", true), "a%20b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("content-type;host", true), "content-type%3Bhost");
    }

    #[test]
    fn public_url_requires_configured_base() {
        let with_base = store();
        assert_eq!(
            with_base.public_url("biz_1/img/a.jpg").as_deref(),
            Some("https://cdn.example.com/biz_1/img/a.jpg")
        );
        let without = S3BlobStore::new(
            "http://minio.local:9000".into(),
            "souk-media".into(),
            "us-east-1".into(),
            "AKIDEXAMPLE".into(),
            "secret".into(),
            None,
        );
        assert!(without.public_url("biz_1/img/a.jpg").is_none());
    }

    #[tokio::test]
    async fn part_number_bounds_fail_before_any_call() {
        let store = store();
        for bad in [0, -1, 10_001] {
            let err = store
                .presign_part("k", "upload", bad, Duration::from_secs(60))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert!(store
            .presign_part("k", "upload", 10_000, Duration::from_secs(60))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn presign_put_validates_inputs() {
        let store = store();
        let err = store
            .presign_put(PresignPut {
                key: " ".into(),
                content_type: "image/jpeg".into(),
                size_bytes: None,
                expires_in: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = store
            .presign_put(PresignPut {
                key: "k".into(),
                content_type: "".into(),
                size_bytes: None,
                expires_in: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}

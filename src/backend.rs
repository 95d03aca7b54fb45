//! The upstream object store the cache fronts, expressed as a capability-interface trait.
//!
//! [`BackendObjectLayer`] is the single collaborator [`crate::coordinator::CacheCoordinator`]
//! is constructed with (§9 "function-pointer indirection to the backend" — here replaced by
//! an injected `Arc<dyn BackendObjectLayer>`, never a global). [`HttpBackend`] is the
//! production implementation, built on `reqwest` against an S3-compatible HTTP endpoint using
//! path-style requests. Tests substitute a `wiremock`-backed instance of the same trait.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use url::Url;

pub use crate::error::BackendError;
use crate::disk_cache::RangeSpec;
use crate::fingerprint::ObjectFingerprint;

/// A backend object's metadata, as reported by `get_object_info`/`get_object_n_info`.
#[derive(Debug, Clone)]
pub struct BackendObjectInfo {
    pub etag: String,
    pub size: Option<u64>,
    pub mod_time: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub cache_control: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub cacheable: Cacheability,
}

/// Whether the coordinator is allowed to admit this object into the cache at all (§4.4
/// admission rule (d), §9 open question 1: only fully-materialized, non-SSE-C,
/// non-in-progress objects are admitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    Cacheable,
    ClientProvidedEncryption,
    MultipartInProgress,
}

impl Cacheability {
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(self, Self::Cacheable)
    }
}

/// Caller-supplied options threaded through to the backend (range is handled separately so the
/// coordinator can reason about it before deciding whether to stream synchronously or tee).
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub if_none_match: Option<String>,
}

/// A backend body stream, boxed so different backend implementations don't need to share a
/// concrete reader type.
pub type BackendReader = Pin<Box<dyn AsyncRead + Send>>;

/// Aggregate free/total capacity as reported by the backend (distinct from
/// [`crate::stats::StorageInfo`], which aggregates the *cache drives*).
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStorageInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// The upstream object store. Every method is `async`, takes identifiers plus an options
/// struct, and returns a typed [`BackendError`]. Cancellation is implicit: dropping the
/// returned future aborts the in-flight call under tokio, so no explicit token parameter is
/// threaded through (§6).
#[async_trait]
pub trait BackendObjectLayer: Send + Sync {
    async fn get_object_n_info(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
    ) -> Result<(BackendReader, BackendObjectInfo), BackendError>;

    async fn get_object_info(
        &self,
        fp: &ObjectFingerprint,
        opts: &GetOptions,
    ) -> Result<BackendObjectInfo, BackendError>;

    async fn delete_object(&self, fp: &ObjectFingerprint) -> Result<(), BackendError>;

    async fn list_buckets(&self) -> Result<Vec<String>, BackendError>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BackendError>;

    async fn make_bucket_with_location(
        &self,
        bucket: &str,
        location: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn storage_info(&self) -> Result<BackendStorageInfo, BackendError>;

    async fn put_object(
        &self,
        fp: &ObjectFingerprint,
        reader: BackendReader,
        size: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<BackendObjectInfo, BackendError>;

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>, BackendError>;

    async fn set_bucket_policy(&self, bucket: &str, policy: &str) -> Result<(), BackendError>;

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<(), BackendError>;
}

/// Production [`BackendObjectLayer`] backed by `reqwest` over an S3-compatible HTTP endpoint,
/// using path-style requests (`{endpoint}/{bucket}/{object}`).
pub struct HttpBackend {
    client: Client,
    endpoint: Url,
}

impl HttpBackend {
    pub fn new(endpoint: Url) -> Result<Self, BackendError> {
        // Install ring as the process-wide rustls crypto provider; reqwest's
        // `rustls-no-provider` feature needs one installed before the first TLS handshake.
        // Idempotent, so repeated `HttpBackend::new` calls (e.g. in tests) are harmless.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub const fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    fn object_url(&self, fp: &ObjectFingerprint) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!(
            "{}/{}/{}",
            url.path().trim_end_matches('/'),
            fp.bucket(),
            fp.object()
        ));
        url
    }

    fn bucket_url(&self, bucket: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(&format!("{}/{}", url.path().trim_end_matches('/'), bucket));
        url
    }

    fn classify_status(status: StatusCode) -> BackendError {
        match status {
            StatusCode::NOT_FOUND => BackendError::NotFound,
            StatusCode::INSUFFICIENT_STORAGE => BackendError::StorageFull,
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                BackendError::BackendDown
            }
            StatusCode::NOT_IMPLEMENTED => BackendError::NotImplemented,
            other => BackendError::Io(std::io::Error::other(format!(
                "unexpected backend status {other}"
            ))),
        }
    }

    fn classify_transport_error(err: &reqwest::Error) -> BackendError {
        if err.is_timeout() || err.is_connect() {
            BackendError::BackendDown
        } else {
            BackendError::Io(std::io::Error::other(err.to_string()))
        }
    }

    fn headers_to_info(headers: &reqwest::header::HeaderMap, size: Option<u64>) -> BackendObjectInfo {
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header_str("etag").unwrap_or_default();
        let cache_control = header_str("cache-control");
        let mod_time = header_str("last-modified")
            .and_then(|raw| DateTime::parse_from_rfc2822(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let expires = header_str("expires")
            .and_then(|raw| DateTime::parse_from_rfc2822(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let mut user_metadata = HashMap::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix("x-amz-meta-")
                && let Ok(value) = value.to_str()
            {
                user_metadata.insert(key.to_string(), value.to_string());
            }
        }
        let cacheable = if headers.contains_key("x-amz-server-side-encryption-customer-algorithm")
        {
            Cacheability::ClientProvidedEncryption
        } else if header_str("x-amz-mp-parts-count").is_some() {
            Cacheability::MultipartInProgress
        } else {
            Cacheability::Cacheable
        };
        BackendObjectInfo {
            etag,
            size,
            mod_time,
            expires,
            cache_control,
            user_metadata,
            cacheable,
        }
    }
}

#[async_trait]
impl BackendObjectLayer for HttpBackend {
    async fn get_object_n_info(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
    ) -> Result<(BackendReader, BackendObjectInfo), BackendError> {
        let mut request = self.client.get(self.object_url(fp));
        if let Some(range) = range {
            let header = match range.end {
                Some(end) => format!("bytes={}-{}", range.start, end.saturating_sub(1)),
                None => format!("bytes={}-", range.start),
            };
            request = request.header(reqwest::header::RANGE, header);
        }
        if let Some(etag) = &opts.if_none_match {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(&e))?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status()));
        }
        let content_length = response.content_length();
        let info = Self::headers_to_info(response.headers(), content_length);
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));
        let reader = tokio_util::io::StreamReader::new(stream);
        Ok((Box::pin(reader), info))
    }

    async fn get_object_info(
        &self,
        fp: &ObjectFingerprint,
        opts: &GetOptions,
    ) -> Result<BackendObjectInfo, BackendError> {
        let mut request = self.client.head(self.object_url(fp));
        if let Some(etag) = &opts.if_none_match {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(&e))?;
        // A conditional HEAD answers 304 when the caller's `If-None-Match` still matches;
        // that's the revalidation-succeeded case, not an error, and the server is required to
        // echo the same `ETag` it would have sent on a 200.
        if response.status() != StatusCode::NOT_MODIFIED && !response.status().is_success() {
            return Err(Self::classify_status(response.status()));
        }
        let content_length = response.content_length();
        Ok(Self::headers_to_info(response.headers(), content_length))
    }

    async fn delete_object(&self, fp: &ObjectFingerprint) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.object_url(fp))
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(&e))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::classify_status(response.status()))
        }
    }

    async fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn list_objects(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn make_bucket_with_location(
        &self,
        bucket: &str,
        _location: Option<&str>,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .put(self.bucket_url(bucket))
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(&e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_status(response.status()))
        }
    }

    async fn storage_info(&self) -> Result<BackendStorageInfo, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn put_object(
        &self,
        fp: &ObjectFingerprint,
        reader: BackendReader,
        size: Option<u64>,
        content_type: Option<&str>,
    ) -> Result<BackendObjectInfo, BackendError> {
        let stream = ReaderStream::new(reader);
        let mut body = reqwest::Body::wrap_stream(stream);
        if let Some(size) = size {
            body = reqwest::Body::sized(body, size);
        }
        let mut request = self.client.put(self.object_url(fp)).body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type.to_string());
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::classify_transport_error(&e))?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status()));
        }
        Ok(Self::headers_to_info(response.headers(), size))
    }

    async fn get_bucket_policy(&self, _bucket: &str) -> Result<Option<String>, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn set_bucket_policy(&self, _bucket: &str, _policy: &str) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn delete_bucket_policy(&self, _bucket: &str) -> Result<(), BackendError> {
        Err(BackendError::NotImplemented)
    }
}

use futures::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cacheability_predicate() {
        assert!(Cacheability::Cacheable.is_cacheable());
        assert!(!Cacheability::ClientProvidedEncryption.is_cacheable());
        assert!(!Cacheability::MultipartInProgress.is_cacheable());
    }

    #[test]
    fn object_url_is_path_style() {
        let backend = HttpBackend::new(Url::parse("http://localhost:9000").unwrap()).unwrap();
        let fp = ObjectFingerprint::new("bucket", "path/to/obj");
        let url = backend.object_url(&fp);
        assert_eq!(url.as_str(), "http://localhost:9000/bucket/path/to/obj");
    }

    #[test]
    fn status_classification_maps_not_found() {
        assert!(matches!(
            HttpBackend::classify_status(StatusCode::NOT_FOUND),
            BackendError::NotFound
        ));
        assert!(matches!(
            HttpBackend::classify_status(StatusCode::SERVICE_UNAVAILABLE),
            BackendError::BackendDown
        ));
    }
}

//! End-to-end scenarios against [`CacheCoordinator`] using an in-memory [`BackendObjectLayer`]
//! double, covering the revalidation, backend-down, range-triggered-background-fill, and
//! concurrent-fill-coalescing behaviors that the inline coordinator unit tests don't reach.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use diskcache::backend::{
    BackendError, BackendObjectInfo, BackendObjectLayer, BackendReader, BackendStorageInfo,
    Cacheability, GetOptions,
};
use diskcache::{CacheConfig, CacheCoordinator, CacheError, ObjectFingerprint, RangeSpec};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex as AsyncMutex;

/// An in-memory backend whose body, etag, and reachability can be mutated mid-test, standing in
/// for the real S3-compatible endpoint the coordinator is built against in production.
struct ScriptedBackend {
    object: AsyncMutex<Option<(Vec<u8>, BackendObjectInfo)>>,
    down: AtomicBool,
    body_fetches: AtomicU32,
    head_calls: AtomicU32,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            object: AsyncMutex::new(None),
            down: AtomicBool::new(false),
            body_fetches: AtomicU32::new(0),
            head_calls: AtomicU32::new(0),
        }
    }

    /// No `cache_control`/`expires` set, so every cached copy of this object starts out stale
    /// and the coordinator must revalidate on every read past the first.
    async fn set(&self, body: &[u8], etag: &str) {
        *self.object.lock().await = Some((
            body.to_vec(),
            BackendObjectInfo {
                etag: etag.to_string(),
                size: Some(body.len() as u64),
                mod_time: Utc::now(),
                expires: None,
                cache_control: None,
                user_metadata: HashMap::new(),
                cacheable: Cacheability::Cacheable,
            },
        ));
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendObjectLayer for ScriptedBackend {
    async fn get_object_n_info(
        &self,
        _fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        _opts: &GetOptions,
    ) -> Result<(BackendReader, BackendObjectInfo), BackendError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::BackendDown);
        }
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        let guard = self.object.lock().await;
        let (body, info) = guard.as_ref().ok_or(BackendError::NotFound)?;
        let slice = match range {
            Some(r) => {
                let end = r.end.map_or(body.len(), |e| (e as usize).min(body.len()));
                body[(r.start as usize).min(body.len())..end].to_vec()
            }
            None => body.clone(),
        };
        Ok((Box::pin(std::io::Cursor::new(slice)), info.clone()))
    }

    async fn get_object_info(
        &self,
        _fp: &ObjectFingerprint,
        _opts: &GetOptions,
    ) -> Result<BackendObjectInfo, BackendError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(BackendError::BackendDown);
        }
        let guard = self.object.lock().await;
        guard.as_ref().map(|(_, info)| info.clone()).ok_or(BackendError::NotFound)
    }

    async fn delete_object(&self, _fp: &ObjectFingerprint) -> Result<(), BackendError> {
        *self.object.lock().await = None;
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn list_objects(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn make_bucket_with_location(
        &self,
        _bucket: &str,
        _location: Option<&str>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn storage_info(&self) -> Result<BackendStorageInfo, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn put_object(
        &self,
        _fp: &ObjectFingerprint,
        _reader: BackendReader,
        _size: Option<u64>,
        _content_type: Option<&str>,
    ) -> Result<BackendObjectInfo, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn get_bucket_policy(&self, _bucket: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn set_bucket_policy(&self, _bucket: &str, _policy: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn delete_bucket_policy(&self, _bucket: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

async fn coordinator_with(dir: &std::path::Path) -> (CacheCoordinator, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new());
    let config = CacheConfig {
        drives: vec![dir.to_path_buf()],
        atime_probe_delay_ms: 1,
        ..CacheConfig::default()
    };
    let coordinator = CacheCoordinator::new(config, backend.clone())
        .await
        .expect("coordinator");
    (coordinator, backend)
}

async fn read_all(mut reader: Pin<Box<dyn tokio::io::AsyncRead + Send>>) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.expect("read");
    out
}

/// Scenario 2 (§8): a stale entry whose ETag the backend still agrees with is served from cache
/// after a metadata-only revalidation — not re-downloaded.
#[tokio::test]
async fn stale_revalidation_with_matching_etag_serves_cached_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let fp = ObjectFingerprint::new("b", "stable");
    backend.set(b"unchanging content", "\"A\"").await;

    let (reader, _info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("cold miss");
    assert_eq!(read_all(reader).await, b"unchanging content");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let fetches_after_fill = backend.body_fetches.load(Ordering::SeqCst);

    // Every subsequent read is stale (no cache-control/expires), so this one revalidates.
    let (reader, info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("revalidated hit");
    assert_eq!(read_all(reader).await, b"unchanging content");
    assert_eq!(info.etag, "\"A\"");
    assert_eq!(
        backend.body_fetches.load(Ordering::SeqCst),
        fetches_after_fill,
        "matching-etag revalidation must not re-fetch the body"
    );
    assert!(backend.head_calls.load(Ordering::SeqCst) >= 1);
}

/// Scenario 3 (§8): a stale entry whose ETag the backend has moved past is replaced wholesale.
#[tokio::test]
async fn stale_revalidation_with_changed_etag_refills_the_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let fp = ObjectFingerprint::new("b", "mutable");
    backend.set(b"version A", "\"A\"").await;

    let (reader, _info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("cold miss");
    assert_eq!(read_all(reader).await, b"version A");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    backend.set(b"version B, now longer", "\"B\"").await;
    let (reader, info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("refilled after etag change");
    assert_eq!(read_all(reader).await, b"version B, now longer");
    assert_eq!(info.etag, "\"B\"");
}

/// Scenario 4 (§8): an unreachable backend during revalidation degrades to serving the stale
/// cached copy rather than surfacing `BackendDown` to the caller.
#[tokio::test]
async fn backend_down_during_revalidation_serves_stale_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let fp = ObjectFingerprint::new("b", "cached-while-backend-dies");
    backend.set(b"last known good", "\"A\"").await;

    let (reader, _info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("cold miss");
    assert_eq!(read_all(reader).await, b"last known good");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    backend.set_down(true);
    let (reader, info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("backend being down must not surface as an error when cache has a copy");
    assert_eq!(read_all(reader).await, b"last known good");
    assert_eq!(info.etag, "\"A\"");
}

/// Scenario 5 (§8): a range request against an uncached object is served directly from the
/// backend while a whole-object fill proceeds in the background.
#[tokio::test]
async fn range_request_on_a_miss_serves_directly_and_warms_the_cache_in_background() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let fp = ObjectFingerprint::new("b", "large-object");
    let full = vec![42u8; 64 * 1024];
    backend.set(&full, "\"A\"").await;

    let range = RangeSpec { start: 0, end: Some(1024) };
    let (reader, info) = coordinator
        .get_object_n_info(&fp, Some(range), &GetOptions::default())
        .await
        .expect("ranged read");
    let body = read_all(reader).await;
    assert_eq!(body.len(), 1024);
    assert_eq!(body, full[0..1024]);
    assert_eq!(info.size, Some(full.len() as u64));

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let fetches_after_background_fill = backend.body_fetches.load(Ordering::SeqCst);

    let (reader, _info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("now served from the warmed cache");
    let body = read_all(reader).await;
    assert_eq!(body, full);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(
        backend.body_fetches.load(Ordering::SeqCst),
        fetches_after_background_fill,
        "the non-range read that follows a completed background fill must be a cache hit"
    );
}

/// Scenario 6 (§8): two concurrent misses for the same fingerprint serialize on the namespace
/// write lock, so the object is fetched at most... in practice exactly... once and both callers
/// still see correct bytes.
#[tokio::test]
async fn concurrent_misses_for_the_same_fingerprint_coalesce() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let coordinator = Arc::new(coordinator);
    let fp = ObjectFingerprint::new("b", "racy");
    backend.set(b"raced but consistent", "\"A\"").await;

    let fp_a = fp.clone();
    let fp_b = fp.clone();
    let coordinator_a = coordinator.clone();
    let coordinator_b = coordinator.clone();
    let (result_a, result_b) = tokio::join!(
        tokio::spawn(async move {
            let (reader, _) = coordinator_a
                .get_object_n_info(&fp_a, None, &GetOptions::default())
                .await
                .expect("reader a");
            read_all(reader).await
        }),
        tokio::spawn(async move {
            let (reader, _) = coordinator_b
                .get_object_n_info(&fp_b, None, &GetOptions::default())
                .await
                .expect("reader b");
            read_all(reader).await
        }),
    );
    assert_eq!(result_a.expect("task a"), b"raced but consistent");
    assert_eq!(result_b.expect("task b"), b"raced but consistent");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let (reader, info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("quiescent read");
    assert_eq!(read_all(reader).await, b"raced but consistent");
    assert_eq!(info.size, Some(b"raced but consistent".len() as u64));
}

/// Backend-`NotFound` during revalidation must delete the stale copy and propagate `NotFound`
/// rather than silently serving a dangling cache entry forever.
#[tokio::test]
async fn backend_not_found_during_revalidation_deletes_the_stale_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (coordinator, backend) = coordinator_with(dir.path()).await;
    let fp = ObjectFingerprint::new("b", "later-deleted");
    backend.set(b"soon to be gone", "\"A\"").await;

    let (reader, _info) = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await
        .expect("cold miss");
    let _ = read_all(reader).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    *backend.object.lock().await = None;
    let result = coordinator
        .get_object_n_info(&fp, None, &GetOptions::default())
        .await;
    assert!(matches!(result, Err(CacheError::NotFound)));
}

//! The public cache facade: wires the backend, the router, the namespace lock table, and the
//! registered drives into the read/write/delete operations everything else calls.
//!
//! Lifecycle is explicit and mirrors the `new -> run -> shutdown` shape used elsewhere in this
//! workspace's servers: [`CacheCoordinator::new`] registers every drive and kicks off any
//! needed format migrations, [`CacheCoordinator::run`] starts the per-drive purgers, and
//! [`CacheCoordinator::shutdown`] signals them to stop and waits for them to exit.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{Duration as ChronoDuration, Utc};
use globset::GlobSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::backend::{BackendObjectLayer, BackendObjectInfo, BackendReader, Cacheability, GetOptions};
use crate::config::CacheConfig;
use crate::disk_cache::{DiskCache, FormatVersion, ObjectInfo, PutMetadata, RangeSpec};
use crate::error::CacheError;
use crate::fingerprint::ObjectFingerprint;
use crate::migrator::FormatMigrator;
use crate::namespace_lock::{NamespaceLockMap, ReadGuard, WriteGuard};
use crate::router::CacheRouter;
use crate::stats::StorageInfo;

/// A boxed, lock-carrying body stream returned by the read-path methods.
pub type CoordinatorReader = Pin<Box<dyn AsyncRead + Send>>;

const TEE_BUFFER_SIZE: usize = 64 * 1024;
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Coordinates reads, writes, and deletes across every registered drive.
pub struct CacheCoordinator {
    backend: Arc<dyn BackendObjectLayer>,
    router: CacheRouter,
    locks: NamespaceLockMap,
    config: Arc<CacheConfig>,
    exclude: GlobSet,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Validates `config`, registers every configured drive, and kicks off a background
    /// [`FormatMigrator`] for any drive still on the legacy layout. A drive that fails to
    /// register is logged and excluded from the rotation rather than aborting startup;
    /// startup only fails if *no* drive registers successfully.
    pub async fn new(
        config: CacheConfig,
        backend: Arc<dyn BackendObjectLayer>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let exclude = config.compile_exclude_set()?;
        let config = Arc::new(config);

        let mut drives = Vec::with_capacity(config.drives.len());
        let mut background = Vec::new();
        for path in &config.drives {
            let drive = Arc::new(DiskCache::new(path.clone(), config.clone()));
            match drive.register().await {
                Ok(FormatVersion::V1) => {
                    tracing::info!(drive = %path.display(), "legacy drive format detected, migrating in background");
                    let migrator = FormatMigrator::new(drive.clone());
                    background.push(tokio::spawn(async move {
                        if let Err(e) = migrator.run().await {
                            tracing::error!(error = %e, "drive migration failed");
                        }
                    }));
                    drives.push(drive);
                }
                Ok(FormatVersion::V2) => drives.push(drive),
                Err(e) => {
                    tracing::error!(
                        drive = %path.display(),
                        error = %e,
                        "drive registration failed, excluding from rotation",
                    );
                }
            }
        }
        if drives.is_empty() {
            return Err(CacheError::InvalidArgument(
                "no configured drive registered successfully".to_string(),
            ));
        }

        let router = CacheRouter::new(drives);
        let locks = NamespaceLockMap::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            backend,
            router,
            locks,
            config,
            exclude,
            shutdown_tx,
            shutdown_rx,
            background: Mutex::new(background),
        })
    }

    /// Starts one purger task per registered drive. Call once after [`CacheCoordinator::new`];
    /// calling it again before [`CacheCoordinator::shutdown`] spawns a second set of purgers.
    pub async fn run(&self) {
        let mut background = self.background.lock().await;
        for drive in self.router.drives() {
            let purger = crate::purger::Purger::new(drive.clone(), self.config.clone());
            let rx = self.shutdown_rx.clone();
            background.push(tokio::spawn(purger.run(rx)));
        }
    }

    /// Signals every background task to stop and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task panicked during shutdown");
            }
        }
    }

    /// Process-level "reload format" entrypoint (§6 "environment/admin signals"): re-probes
    /// every registered drive's `format.json` and kicks off a [`FormatMigrator`] for any drive
    /// that now reports V1. A no-op when every drive is already V2 — this exists so an operator
    /// signal (e.g. `SIGHUP`) can re-trigger detection without a full restart, not because the
    /// coordinator expects drives to regress to V1 on their own.
    pub async fn reload_format(&self) -> Result<(), CacheError> {
        let mut found_legacy = false;
        for drive in self.router.drives() {
            match drive.register().await {
                Ok(FormatVersion::V1) => {
                    found_legacy = true;
                    tracing::info!(
                        drive = %drive.root().display(),
                        "reload-format detected a legacy drive, migrating in background",
                    );
                    let migrator = FormatMigrator::new(drive.clone());
                    let mut background = self.background.lock().await;
                    background.push(tokio::spawn(async move {
                        if let Err(e) = migrator.run().await {
                            tracing::error!(error = %e, "drive migration failed");
                        }
                    }));
                }
                Ok(FormatVersion::V2) => {}
                Err(e) => {
                    tracing::error!(
                        drive = %drive.root().display(),
                        error = %e,
                        "reload-format failed to re-register drive",
                    );
                }
            }
        }
        if !found_legacy {
            tracing::debug!("reload-format: no legacy drives detected, nothing to do");
        }
        Ok(())
    }

    fn skip_cache(&self, fp: &ObjectFingerprint) -> bool {
        fp.is_directory() || self.exclude.is_match(fp.joined())
    }

    /// Reads an object's body and metadata, honoring `range`, preferring the local cache and
    /// falling back to (and warming from) the backend (§4.4).
    #[tracing::instrument(skip(self, opts), fields(fingerprint = %fp))]
    pub async fn get_object_n_info(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        if self.skip_cache(fp) {
            return self.proxy_from_backend(fp, range, opts).await;
        }

        let Some(slot) = self.router.locate_for_read(fp).await else {
            tracing::warn!("no online drive available, serving directly from backend");
            return self.proxy_from_backend(fp, range, opts).await;
        };
        let drive = self.router.drive(slot).expect("slot came from router").clone();

        let read_guard = self
            .locks
            .acquire_read(fp, self.config.namespace_lock_timeout())
            .await?;
        match drive.stat(fp).await {
            Ok(stat) if stat.is_fresh(Utc::now()) => {
                let (reader, info) = drive.get(fp, range).await?;
                Ok((lock_reader(Box::pin(reader), read_guard), info))
            }
            Ok(_stale) => {
                drop(read_guard);
                self.revalidate(fp, range, opts, &drive).await
            }
            Err(CacheError::NotFound) => {
                drop(read_guard);
                self.fill_miss(fp, range, opts, &drive).await
            }
            Err(e) => Err(e),
        }
    }

    /// Metadata-only counterpart to [`CacheCoordinator::get_object_n_info`]. A miss or a stale
    /// entry triggers the same revalidate/fill decisions, but the body is never streamed back.
    #[tracing::instrument(skip(self, opts), fields(fingerprint = %fp))]
    pub async fn get_object_info(
        &self,
        fp: &ObjectFingerprint,
        opts: &GetOptions,
    ) -> Result<ObjectInfo, CacheError> {
        if self.skip_cache(fp) {
            let info = self.backend.get_object_info(fp, opts).await?;
            return Ok(info_from_backend(fp, &info));
        }
        let Some(slot) = self.router.locate_for_read(fp).await else {
            let info = self.backend.get_object_info(fp, opts).await?;
            return Ok(info_from_backend(fp, &info));
        };
        let drive = self.router.drive(slot).expect("slot came from router").clone();

        let stat = {
            let _guard = self
                .locks
                .acquire_read(fp, self.config.namespace_lock_timeout())
                .await?;
            drive.stat(fp).await
        };
        match stat {
            Ok(stat) if stat.is_fresh(Utc::now()) => Ok(stat),
            Ok(stale) => {
                let mut backend_opts = opts.clone();
                backend_opts.if_none_match = Some(stale.etag.clone());
                match self.backend.get_object_info(fp, &backend_opts).await {
                    Ok(backend_info) if backend_info.etag == stale.etag => {
                        let refreshed = merge_unchanged(&stale, &backend_info);
                        let _guard = self
                            .locks
                            .acquire_write(fp, self.config.namespace_lock_timeout())
                            .await?;
                        drive.update_metadata_if_changed(fp, &refreshed).await?;
                        Ok(refreshed)
                    }
                    Ok(backend_info) => Ok(info_from_backend(fp, &backend_info)),
                    Err(e) => {
                        let mapped = CacheError::from(e);
                        if matches!(mapped, CacheError::BackendDown) {
                            Ok(stale)
                        } else if matches!(mapped, CacheError::NotFound) {
                            let _ = drive.delete(fp).await;
                            Err(CacheError::NotFound)
                        } else {
                            Err(mapped)
                        }
                    }
                }
            }
            Err(CacheError::NotFound) => {
                self.spawn_background_fill(fp.clone(), drive);
                let info = self.backend.get_object_info(fp, opts).await?;
                Ok(info_from_backend(fp, &info))
            }
            Err(e) => Err(e),
        }
    }

    async fn proxy_from_backend(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        let (reader, info) = self.backend.get_object_n_info(fp, range, opts).await?;
        Ok((reader, info_from_backend(fp, &info)))
    }

    async fn revalidate(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
        drive: &Arc<DiskCache>,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        let write_guard = self
            .locks
            .acquire_write(fp, self.config.namespace_lock_timeout())
            .await?;

        // Re-check under the write lock: another writer may have already revalidated or
        // refilled this entry while we waited (§8 "concurrent fills coalesce").
        let current = match drive.stat(fp).await {
            Ok(current) if current.is_fresh(Utc::now()) => {
                let (reader, info) = drive.get(fp, range).await?;
                return Ok((lock_reader(Box::pin(reader), write_guard), info));
            }
            Ok(current) => current,
            Err(CacheError::NotFound) => return self.do_fill(fp, range, opts, drive, write_guard).await,
            Err(e) => return Err(e),
        };

        let mut backend_opts = opts.clone();
        backend_opts.if_none_match = Some(current.etag.clone());
        match self.backend.get_object_info(fp, &backend_opts).await {
            Ok(backend_info) if backend_info.etag == current.etag => {
                let refreshed = merge_unchanged(&current, &backend_info);
                drive.update_metadata_if_changed(fp, &refreshed).await?;
                let (reader, info) = drive.get(fp, range).await?;
                Ok((lock_reader(Box::pin(reader), write_guard), info))
            }
            Ok(_changed) => self.do_fill(fp, range, opts, drive, write_guard).await,
            Err(e) => {
                let mapped = CacheError::from(e);
                if matches!(mapped, CacheError::BackendDown) {
                    tracing::warn!("backend unreachable during revalidation, serving stale entry");
                    let (reader, info) = drive.get(fp, range).await?;
                    Ok((lock_reader(Box::pin(reader), write_guard), info))
                } else if matches!(mapped, CacheError::NotFound) {
                    drop(write_guard);
                    let _ = drive.delete(fp).await;
                    Err(CacheError::NotFound)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn fill_miss(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
        drive: &Arc<DiskCache>,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        let write_guard = self
            .locks
            .acquire_write(fp, self.config.namespace_lock_timeout())
            .await?;
        match drive.stat(fp).await {
            Ok(fresh) if fresh.is_fresh(Utc::now()) => {
                let (reader, info) = drive.get(fp, range).await?;
                Ok((lock_reader(Box::pin(reader), write_guard), info))
            }
            _ => self.do_fill(fp, range, opts, drive, write_guard).await,
        }
    }

    /// A range request against an uncached object is served directly from the backend for
    /// *this* response while a whole-object fill runs in the background (§4.4 step 9,
    /// "range-request-triggers-background-fill"). A whole-object miss is filled via
    /// [`CacheCoordinator::tee_fill`] so the backend is only fetched once.
    async fn do_fill(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
        opts: &GetOptions,
        drive: &Arc<DiskCache>,
        write_guard: WriteGuard,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        if range.is_some() {
            drop(write_guard);
            self.spawn_background_fill(fp.clone(), drive.clone());
            return self.proxy_from_backend(fp, range, opts).await;
        }
        self.tee_fill(fp, drive, write_guard).await
    }

    /// Fetches the whole object once and splits the byte stream into the response returned to
    /// the caller and the body [`DiskCache::put`] writes to disk, so a whole-object cache miss
    /// never issues two backend requests (§9 "cyclic I/O plumbing").
    async fn tee_fill(
        &self,
        fp: &ObjectFingerprint,
        drive: &Arc<DiskCache>,
        write_guard: WriteGuard,
    ) -> Result<(CoordinatorReader, ObjectInfo), CacheError> {
        let (backend_reader, backend_info) = self
            .backend
            .get_object_n_info(fp, None, &GetOptions::default())
            .await?;
        let response_info = info_from_backend(fp, &backend_info);

        let drive_ready = drive.is_online()
            && backend_info.cacheable.is_cacheable()
            && match backend_info.size {
                Some(size) => drive.disk_available(size).await.unwrap_or(false),
                None => true,
            };
        if !drive_ready {
            drop(write_guard);
            return Ok((backend_reader, response_info));
        }

        if !drive.is_usage_low().await.unwrap_or(true) {
            drive.signal_purge();
        }

        let (client_tx, client_rx) = tokio::io::duplex(TEE_BUFFER_SIZE);
        let (fill_tx, fill_rx) = tokio::io::duplex(TEE_BUFFER_SIZE);
        tokio::spawn(pump_tee(backend_reader, client_tx, fill_tx));

        let drive = drive.clone();
        let fp_owned = fp.clone();
        let metadata = put_metadata_from_backend(&backend_info, self.config.expiry_days);
        let size = backend_info.size;
        tokio::spawn(async move {
            match drive.put(&fp_owned, fill_rx, size, metadata).await {
                Ok(_) => {}
                Err(e) if e.is_non_fatal_for_fill() => {
                    tracing::debug!(fingerprint = %fp_owned, error = %e, "background fill skipped");
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %fp_owned, error = %e, "background fill failed");
                }
            }
            drop(write_guard);
        });

        Ok((Box::pin(client_rx), response_info))
    }

    /// Fire-and-forget whole-object warm used by range and HEAD misses, which must not block
    /// their own (narrower) response on a full download.
    fn spawn_background_fill(&self, fp: ObjectFingerprint, drive: Arc<DiskCache>) {
        let backend = self.backend.clone();
        let locks = self.locks.clone();
        let timeout = self.config.namespace_lock_timeout();
        let expiry_days = self.config.expiry_days;
        tokio::spawn(async move {
            let guard = match locks.acquire_write(&fp, timeout).await {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::debug!(fingerprint = %fp, error = %e, "background fill could not acquire lock");
                    return;
                }
            };
            if drive.exists(&fp).await {
                return;
            }
            if !drive.is_usage_low().await.unwrap_or(true) {
                drive.signal_purge();
            }
            match backend.get_object_n_info(&fp, None, &GetOptions::default()).await {
                Ok((reader, info)) if info.cacheable.is_cacheable() => {
                    let metadata = put_metadata_from_backend(&info, expiry_days);
                    if let Err(e) = drive.put(&fp, reader, info.size, metadata).await {
                        tracing::debug!(fingerprint = %fp, error = %e, "background fill failed");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(fingerprint = %fp, error = %e, "background fill fetch failed"),
            }
            drop(guard);
        });
    }

    /// Deletes an object from the backend and purges any cached copy from every drive — not
    /// only the current canonical slot, since online-walk fallback can leave a stale copy
    /// behind on a drive that was offline at fill time (§4.4 `delete_object`).
    #[tracing::instrument(skip(self), fields(fingerprint = %fp))]
    pub async fn delete_object(&self, fp: &ObjectFingerprint) -> Result<(), CacheError> {
        let _guard = self
            .locks
            .acquire_write(fp, self.config.namespace_lock_timeout())
            .await?;
        self.backend.delete_object(fp).await?;
        for drive in self.router.drives() {
            if let Err(e) = drive.delete(fp).await {
                tracing::warn!(
                    drive = %drive.root().display(),
                    fingerprint = %fp,
                    error = %e,
                    "failed to purge cached copy",
                );
            }
        }
        Ok(())
    }

    /// Deletes every fingerprint in `fps`, continuing past individual failures and returning
    /// one result per input in the same order.
    pub async fn delete_objects(&self, fps: &[ObjectFingerprint]) -> Vec<Result<(), CacheError>> {
        let mut out = Vec::with_capacity(fps.len());
        for fp in fps {
            out.push(self.delete_object(fp).await);
        }
        out
    }

    /// Aggregate free/total capacity across every registered drive. A drive that fails to
    /// report usage contributes zero and is logged, not surfaced (§6).
    pub async fn storage_info(&self) -> StorageInfo {
        let mut info = StorageInfo::default();
        for drive in self.router.drives() {
            match drive.usage().await {
                Ok(usage) => info.push(usage),
                Err(e) => {
                    tracing::warn!(drive = %drive.root().display(), error = %e, "failed to read drive usage");
                    info.push(crate::stats::DriveUsage::default());
                }
            }
        }
        info
    }

    #[must_use]
    pub fn drive_count(&self) -> usize {
        self.router.drive_count()
    }
}

fn info_from_backend(fp: &ObjectFingerprint, info: &BackendObjectInfo) -> ObjectInfo {
    ObjectInfo {
        fingerprint: fp.clone(),
        etag: info.etag.clone(),
        size: info.size,
        mod_time: info.mod_time,
        expires: info.expires,
        cache_control: info.cache_control.clone(),
        user_metadata: info.user_metadata.clone(),
        stored_atime: Utc::now(),
    }
}

fn merge_unchanged(cached: &ObjectInfo, backend_info: &BackendObjectInfo) -> ObjectInfo {
    ObjectInfo {
        fingerprint: cached.fingerprint.clone(),
        etag: cached.etag.clone(),
        size: cached.size,
        mod_time: backend_info.mod_time,
        expires: backend_info.expires.or(cached.expires),
        cache_control: backend_info
            .cache_control
            .clone()
            .or_else(|| cached.cache_control.clone()),
        user_metadata: cached.user_metadata.clone(),
        stored_atime: cached.stored_atime,
    }
}

fn put_metadata_from_backend(info: &BackendObjectInfo, expiry_days: u32) -> PutMetadata {
    let expires = info
        .expires
        .or_else(|| Some(Utc::now() + ChronoDuration::days(i64::from(expiry_days))));
    PutMetadata {
        etag: info.etag.clone(),
        mod_time: info.mod_time,
        expires,
        cache_control: info.cache_control.clone(),
        user_metadata: info.user_metadata.clone(),
    }
}

/// Copies from `src` into both tee targets until EOF. A write failure on `client` (the caller
/// disconnected) doesn't stop the fill; a write failure on `fill` means the fill consumer gave
/// up, so there's no point reading further.
async fn pump_tee(
    mut src: BackendReader,
    mut client: tokio::io::DuplexStream,
    mut fill: tokio::io::DuplexStream,
) {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "tee source read failed");
                break;
            }
        };
        let _ = client.write_all(&buf[..n]).await;
        if fill.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = client.shutdown().await;
    let _ = fill.shutdown().await;
}

/// Wraps a [`CoordinatorReader`] together with the namespace lock guard that must outlive it,
/// so the lock releases only once the caller has finished reading (or dropped) the stream.
struct LockedReader<G> {
    inner: CoordinatorReader,
    _guard: G,
}

impl<G: Unpin> AsyncRead for LockedReader<G> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

fn lock_reader<G: Send + Unpin + 'static>(inner: CoordinatorReader, guard: G) -> CoordinatorReader {
    Box::pin(LockedReader {
        inner,
        _guard: guard,
    })
}

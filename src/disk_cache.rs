//! One physical cache drive: persists objects and metadata, enforces atime-driven eviction,
//! responds to purge signals.
//!
//! A [`DiskCache`] owns exactly one drive directory. It never talks to another drive or to
//! the backend; the [`crate::coordinator::CacheCoordinator`] composes a slice of these with a
//! [`crate::router::CacheRouter`] and a [`crate::namespace_lock::NamespaceLockMap`] to build
//! the public cache API.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::fingerprint::ObjectFingerprint;
use crate::stats::{DriveCounters, DriveCountersSnapshot, DriveUsage};

/// Data is chunked into blocks of this size to bound the cost of a range read or a partial
/// write; see spec §4.1 "storage format". There is no cross-object compaction.
pub const BLOCK_SIZE: u64 = 1024 * 1024;

/// Consecutive I/O errors on `get` after which the drive is marked `Offline` (§4.1 "failure").
/// Not part of the configuration surface: an operational constant, tunable only by rebuilding.
const CONSECUTIVE_IO_ERROR_THRESHOLD: u32 = 5;

/// On-disk layout version recorded in `format.json`.
///
/// Serializes as the bare integer (`1`/`2`), matching the documented `format.json` shape —
/// not the derived `"V1"`/`"V2"` strings the variant names would otherwise produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
}

impl Serialize for FormatVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for FormatVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(serde::de::Error::custom(format!(
                "unknown format version {other}"
            ))),
        }
    }
}

/// `/<drive>/format.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatFile {
    pub version: FormatVersion,
    pub id: String,
}

/// Runtime state of a registered drive. Only `Online` drives serve traffic; `Migrating`
/// drives are globally gated by the coordinator (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DriveState {
    Absent = 0,
    Online = 1,
    Offline = 2,
    Migrating = 3,
}

impl DriveState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Online,
            2 => Self::Offline,
            3 => Self::Migrating,
            _ => Self::Absent,
        }
    }
}

/// Metadata persisted in `meta.json`, co-located with the data blocks it describes.
///
/// `bucket`/`object` are stored alongside the hash-derived directory name so a 32-bit hash
/// collision between two different fingerprints is detectable rather than silently corrupting
/// an unrelated entry (see [`DiskCache::entry_dir`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub bucket: String,
    pub object: String,
    pub etag: String,
    pub size: Option<u64>,
    pub mod_time: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub cache_control: Option<String>,
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub stored_atime: DateTime<Utc>,
}

/// Public-facing object metadata, the union of [`CacheEntry`] and the fingerprint that names
/// it. Returned by `stat`, `get`, and surfaced to callers through [`crate::coordinator`].
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub fingerprint: ObjectFingerprint,
    pub etag: String,
    pub size: Option<u64>,
    pub mod_time: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub cache_control: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub stored_atime: DateTime<Utc>,
}

impl ObjectInfo {
    fn from_entry(fingerprint: ObjectFingerprint, entry: CacheEntry) -> Self {
        Self {
            fingerprint,
            etag: entry.etag,
            size: entry.size,
            mod_time: entry.mod_time,
            expires: entry.expires,
            cache_control: entry.cache_control,
            user_metadata: entry.user_metadata,
            stored_atime: entry.stored_atime,
        }
    }

    /// Cache-control freshness per spec §4.1: fresh when `max-age` hasn't elapsed since
    /// `mod_time`, or `expires` is still in the future. Anything else is stale and requires
    /// ETag revalidation against the backend.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if let Some(max_age) = self.max_age() {
            let age = now.signed_duration_since(self.mod_time);
            if age < max_age {
                return true;
            }
        }
        if let Some(expires) = self.expires
            && now < expires
        {
            return true;
        }
        false
    }

    fn max_age(&self) -> Option<chrono::Duration> {
        let directive = self.cache_control.as_ref()?;
        directive.split(',').find_map(|part| {
            let part = part.trim();
            let seconds = part.strip_prefix("max-age=")?;
            seconds.parse::<i64>().ok().map(chrono::Duration::seconds)
        })
    }
}

/// New metadata supplied to [`DiskCache::put`], before a `stored_atime` is assigned.
#[derive(Debug, Clone)]
pub struct PutMetadata {
    pub etag: String,
    pub mod_time: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub cache_control: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

impl Default for PutMetadata {
    fn default() -> Self {
        Self {
            etag: String::new(),
            mod_time: DateTime::<Utc>::UNIX_EPOCH,
            expires: None,
            cache_control: None,
            user_metadata: HashMap::new(),
        }
    }
}

/// An inclusive-start, exclusive-or-unbounded-end byte range, mirroring an HTTP `Range`
/// header with a single byte-range-spec.
#[derive(Debug, Clone, Copy)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

/// A streaming, `AsyncRead` reader over one or more 1 MiB block files, honoring a byte range.
pub type CacheReader = StreamReader<Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>, Bytes>;

/// The subset of drive state a streaming read needs to report back to after [`DiskCache::get`]
/// has already returned — kept behind its own `Arc` so a `'static` block stream can hold a
/// cheap clone without cloning the whole drive.
struct DriveHealth {
    state: AtomicU8,
    consecutive_io_errors: AtomicU32,
    counters: DriveCounters,
}

impl DriveHealth {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(DriveState::Absent as u8),
            consecutive_io_errors: AtomicU32::new(0),
            counters: DriveCounters::default(),
        }
    }

    fn state(&self) -> DriveState {
        DriveState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DriveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Records one failed block read and marks the drive `Offline` past the consecutive-error
    /// threshold (§4.1 "failure").
    fn record_io_error(&self, root: &Path) {
        self.counters.record_io_error();
        let count = self.consecutive_io_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= CONSECUTIVE_IO_ERROR_THRESHOLD {
            tracing::warn!(drive = %root.display(), count, "marking drive offline after repeated I/O errors");
            self.set_state(DriveState::Offline);
        }
    }

    fn reset_io_errors(&self) {
        self.consecutive_io_errors.store(0, Ordering::Relaxed);
    }
}

/// One registered cache drive.
pub struct DiskCache {
    root: PathBuf,
    config: Arc<CacheConfig>,
    health: Arc<DriveHealth>,
    drive_id: Mutex<Option<String>>,
    purge_tx: mpsc::Sender<()>,
    purge_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DiskCache {
    /// Builds a drive handle. Does not touch the filesystem; call [`DiskCache::register`]
    /// before serving traffic.
    #[must_use]
    pub fn new(root: PathBuf, config: Arc<CacheConfig>) -> Self {
        let (purge_tx, purge_rx) = mpsc::channel(1);
        Self {
            root,
            config,
            health: Arc::new(DriveHealth::new()),
            drive_id: Mutex::new(None),
            purge_tx,
            purge_rx: Mutex::new(Some(purge_rx)),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn state(&self) -> DriveState {
        self.health.state()
    }

    pub fn set_state(&self, state: DriveState) {
        self.health.set_state(state);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state() == DriveState::Online
    }

    #[must_use]
    pub fn counters(&self) -> DriveCountersSnapshot {
        self.health.counters.snapshot()
    }

    /// Non-blocking poke of this drive's purge channel; a full channel means a purge is
    /// already pending (§4.6, capacity-1 coalescing).
    pub fn signal_purge(&self) {
        let _ = self.purge_tx.try_send(());
    }

    /// Takes the receiving half of the purge channel, once, for the long-running purger task
    /// (§4.6) to own. Returns `None` if already taken.
    pub fn take_purge_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.purge_rx.try_lock().ok()?.take()
    }

    /// Loads `format.json`, creating a fresh V2 file if the drive is unformatted, then runs
    /// the atime probe (§4.1 "atime requirement"). On success the drive becomes `Online`
    /// (or `Migrating` if an existing V1 layout is detected — the coordinator's
    /// [`crate::migrator::FormatMigrator`] is responsible for driving that to completion).
    pub async fn register(&self) -> Result<FormatVersion, CacheError> {
        fs::create_dir_all(&self.root).await?;
        let format = self.load_or_init_format().await?;
        *self.drive_id.lock().await = Some(format.id.clone());
        self.probe_atime_support().await?;
        self.set_state(match format.version {
            FormatVersion::V2 => DriveState::Online,
            FormatVersion::V1 => DriveState::Migrating,
        });
        Ok(format.version)
    }

    async fn load_or_init_format(&self) -> Result<FormatFile, CacheError> {
        let path = self.format_path();
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CacheError::Corruption(format!("format.json: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let format = FormatFile {
                    version: FormatVersion::V2,
                    id: Uuid::new_v4().to_string(),
                };
                let bytes = serde_json::to_vec_pretty(&format)
                    .map_err(|e| CacheError::Corruption(e.to_string()))?;
                write_atomic(&path, &bytes).await?;
                Ok(format)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn format_path(&self) -> PathBuf {
        self.root.join("format.json")
    }

    /// Rewrites `format.json` with a new version, keeping the drive's existing id. Used by
    /// [`crate::migrator::FormatMigrator`] once it has finished rewriting every legacy entry.
    pub async fn rewrite_format(&self, version: FormatVersion) -> Result<(), CacheError> {
        let id = self
            .drive_id
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let format = FormatFile { version, id };
        let bytes = serde_json::to_vec_pretty(&format)
            .map_err(|e| CacheError::Corruption(e.to_string()))?;
        write_atomic(&self.format_path(), &bytes).await
    }

    /// Writes a probe file, sleeps for `atime_probe_delay`, reads it back, and verifies the
    /// access time advanced. Fails fast with `AtimeUnsupported` otherwise (§4.1, §9
    /// "atime-as-LRU").
    async fn probe_atime_support(&self) -> Result<(), CacheError> {
        let probe_path = self.root.join(".atime_probe");
        fs::write(&probe_path, b"probe").await?;
        let before = atime_of(&probe_path).await?;
        tokio::time::sleep(self.config.atime_probe_delay()).await;
        let mut buf = Vec::new();
        File::open(&probe_path)
            .await?
            .read_to_end(&mut buf)
            .await?;
        let after = atime_of(&probe_path).await?;
        if after > before {
            Ok(())
        } else {
            Err(CacheError::AtimeUnsupported)
        }
    }

    /// The directory an entry's data and metadata live in. Derived from the fingerprint hash
    /// rather than the raw bucket/object string so arbitrary object keys never collide with
    /// filesystem path limits; `bucket`/`object` are still recorded inside `meta.json` so a
    /// hash collision between two distinct fingerprints is detected rather than silently
    /// mixing up objects (§3 invariant 1).
    fn entry_dir(&self, fp: &ObjectFingerprint) -> PathBuf {
        let hash = fp.hash();
        let shard = format!("{:02x}", (hash >> 24) & 0xff);
        let name = format!("{hash:08x}");
        self.root.join(shard).join(name)
    }

    fn meta_path(dir: &Path) -> PathBuf {
        dir.join("meta.json")
    }

    fn block_path(dir: &Path, block_index: u64) -> PathBuf {
        dir.join(format!("part.{}", block_index + 1))
    }

    /// Returns the metadata for `fp`, without touching data blocks.
    pub async fn stat(&self, fp: &ObjectFingerprint) -> Result<ObjectInfo, CacheError> {
        let dir = self.entry_dir(fp);
        let entry = self.read_meta(&dir, fp).await?;
        Ok(ObjectInfo::from_entry(fp.clone(), entry))
    }

    #[must_use]
    pub async fn exists(&self, fp: &ObjectFingerprint) -> bool {
        let dir = self.entry_dir(fp);
        fs::metadata(Self::meta_path(&dir)).await.is_ok()
    }

    async fn read_meta(&self, dir: &Path, fp: &ObjectFingerprint) -> Result<CacheEntry, CacheError> {
        let bytes = match fs::read(Self::meta_path(dir)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, dir = %dir.display(), "corrupt cache metadata, deleting entry");
                let _ = fs::remove_dir_all(dir).await;
                return Err(CacheError::NotFound);
            }
        };
        if entry.bucket != fp.bucket() || entry.object != fp.object() {
            tracing::warn!(dir = %dir.display(), "fingerprint hash collision, treating as miss");
            return Err(CacheError::NotFound);
        }
        Ok(entry)
    }

    /// Streams at most `size` bytes from `reader` into a fresh entry for `fp`, then returns
    /// the committed metadata (§4.1 `put`). If `size` is `None` the writer reads until EOF and
    /// records the observed length. Any error aborts the write and leaves no trace.
    pub async fn put<R>(
        &self,
        fp: &ObjectFingerprint,
        mut reader: R,
        size: Option<u64>,
        metadata: PutMetadata,
    ) -> Result<ObjectInfo, CacheError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if let Some(estimated) = size
            && !self.disk_available(estimated).await?
        {
            return Err(CacheError::DriveFull);
        }

        let dir = self.entry_dir(fp);
        if let Err(e) = fs::create_dir_all(&dir).await {
            return Err(e.into());
        }

        match self.write_blocks(&dir, &mut reader, size).await {
            Ok(observed_size) => {
                let entry = CacheEntry {
                    bucket: fp.bucket().to_string(),
                    object: fp.object().to_string(),
                    etag: metadata.etag,
                    size: Some(observed_size),
                    mod_time: metadata.mod_time,
                    expires: metadata.expires,
                    cache_control: metadata.cache_control,
                    user_metadata: metadata.user_metadata,
                    stored_atime: Utc::now(),
                };
                let bytes = serde_json::to_vec(&entry)
                    .map_err(|e| CacheError::Corruption(e.to_string()))?;
                write_atomic(&Self::meta_path(&dir), &bytes).await?;
                self.health.counters.record_fill();
                Ok(ObjectInfo::from_entry(fp.clone(), entry))
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn write_blocks<R>(
        &self,
        dir: &Path,
        reader: &mut R,
        size_hint: Option<u64>,
    ) -> Result<u64, CacheError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut total = 0u64;
        let mut block_index = 0u64;
        loop {
            if let Some(limit) = size_hint
                && total >= limit
            {
                break;
            }
            let want = size_hint.map_or(BLOCK_SIZE, |limit| (limit - total).min(BLOCK_SIZE));
            let mut buf = BytesMut::zeroed(want as usize);
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            let path = Self::block_path(dir, block_index);
            let mut file = File::create(&path).await?;
            file.write_all(&buf[..filled]).await?;
            file.flush().await?;
            fsync(&file).await;
            total += filled as u64;
            block_index += 1;
            if filled < want as usize {
                break;
            }
        }
        Ok(total)
    }

    /// Opens a streaming reader over `fp`'s data, honoring `range`, and updates the drive's
    /// consecutive-I/O-error counter (marking the drive `Offline` past the threshold).
    /// Reading the underlying block files is itself what advances filesystem atime — the
    /// source of truth the purger sorts by (§4.1 "atime requirement", §9 "atime-as-LRU").
    pub async fn get(
        &self,
        fp: &ObjectFingerprint,
        range: Option<RangeSpec>,
    ) -> Result<(CacheReader, ObjectInfo), CacheError> {
        let dir = self.entry_dir(fp);
        let entry = match self.read_meta(&dir, fp).await {
            Ok(entry) => entry,
            Err(e) => return Err(e),
        };
        let total = entry.size.unwrap_or(0);
        let (start, end) = match range {
            Some(r) => {
                let end = r.end.map_or(total, |e| e.min(total));
                if r.start >= total && total > 0 {
                    return Err(CacheError::InvalidArgument(
                        "range start beyond object end".to_string(),
                    ));
                }
                (r.start, end)
            }
            None => (0, total),
        };
        let info = ObjectInfo::from_entry(fp.clone(), entry);
        let stream = block_range_stream(dir, start, end, self.root.clone(), self.health.clone());
        self.health.reset_io_errors();
        self.health.counters.record_hit();
        Ok((StreamReader::new(Box::pin(stream)), info))
    }

    /// Writes metadata only, used after a no-body revalidation hit when the backend's headers
    /// changed but the body did not (§4.4 step 5).
    pub async fn update_metadata_if_changed(
        &self,
        fp: &ObjectFingerprint,
        new_info: &ObjectInfo,
    ) -> Result<(), CacheError> {
        let dir = self.entry_dir(fp);
        let entry = CacheEntry {
            bucket: fp.bucket().to_string(),
            object: fp.object().to_string(),
            etag: new_info.etag.clone(),
            size: new_info.size,
            mod_time: new_info.mod_time,
            expires: new_info.expires,
            cache_control: new_info.cache_control.clone(),
            user_metadata: new_info.user_metadata.clone(),
            stored_atime: Utc::now(),
        };
        let bytes =
            serde_json::to_vec(&entry).map_err(|e| CacheError::Corruption(e.to_string()))?;
        write_atomic(&Self::meta_path(&dir), &bytes).await?;
        Ok(())
    }

    /// Removes data and metadata for `fp`. Removing the whole entry directory makes the
    /// deletion atomic from callers' perspective: either `meta.json` (and thus the entry)
    /// exists or it doesn't.
    pub async fn delete(&self, fp: &ObjectFingerprint) -> Result<(), CacheError> {
        let dir = self.entry_dir(fp);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Records one purger-driven eviction (§4.6). Does not itself delete anything.
    pub fn record_eviction(&self) {
        self.health.counters.record_eviction();
    }

    /// Records one failed block read against this drive, marking it `Offline` past the
    /// consecutive-error threshold (§4.1 "failure", §7 `DriveOffline`).
    pub fn record_io_error(&self) {
        self.health.record_io_error(&self.root);
    }

    /// Current total/free bytes for this drive's filesystem.
    pub async fn usage(&self) -> Result<DriveUsage, CacheError> {
        statvfs_usage(self.root.clone()).await
    }

    /// Whether the drive has enough free space for an `estimated_size`-byte write plus a
    /// safety margin (§4.1 `put`), and is itself below the high watermark.
    pub async fn disk_available(&self, estimated_size: u64) -> Result<bool, CacheError> {
        const SAFETY_MARGIN_PERCENT: u64 = 5;
        let usage = self.usage().await?;
        let margin = usage.total_bytes / 100 * SAFETY_MARGIN_PERCENT;
        Ok(usage.free_bytes > estimated_size.saturating_add(margin))
    }

    /// Whether this drive's usage is at or below the configured low watermark.
    pub async fn is_usage_low(&self) -> Result<bool, CacheError> {
        let usage = self.usage().await?;
        Ok(usage.percent_used() <= self.config.low_watermark_percent)
    }

    /// Enumerates every entry directory under this drive along with the filesystem atime of
    /// its first data block and `expires`, for the purger (§4.6) to sort and evict by.
    pub async fn enumerate_entries(&self) -> Result<Vec<PurgeCandidate>, CacheError> {
        let mut out = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry_dir) = entries.next_entry().await? {
                if !entry_dir.file_type().await?.is_dir() {
                    continue;
                }
                let dir = entry_dir.path();
                let meta_path = Self::meta_path(&dir);
                let Ok(bytes) = fs::read(&meta_path).await else {
                    continue;
                };
                let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                    continue;
                };
                let atime = atime_of(&Self::block_path(&dir, 0))
                    .await
                    .unwrap_or(entry.stored_atime);
                out.push(PurgeCandidate {
                    fingerprint: ObjectFingerprint::new(entry.bucket, entry.object),
                    dir,
                    atime,
                    expires: entry.expires,
                });
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn force_online_for_test(&self) {
        self.set_state(DriveState::Online);
    }

    #[cfg(test)]
    pub fn mark_offline_for_test(&self) {
        self.set_state(DriveState::Offline);
    }
}

/// One entry as seen by the purger's enumeration pass: enough to sort by atime and to delete.
pub struct PurgeCandidate {
    pub fingerprint: ObjectFingerprint,
    pub dir: PathBuf,
    pub atime: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

fn block_range_stream(
    dir: PathBuf,
    start: u64,
    end: u64,
    root: PathBuf,
    health: Arc<DriveHealth>,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    stream::unfold((dir, start, end), move |(dir, pos, end)| {
        let root = root.clone();
        let health = Arc::clone(&health);
        async move {
            if pos >= end {
                return None;
            }
            let block_index = pos / BLOCK_SIZE;
            let offset_in_block = pos % BLOCK_SIZE;
            let want = (BLOCK_SIZE - offset_in_block).min(end - pos);
            let path = DiskCache::block_path(&dir, block_index);
            match read_block_slice(&path, offset_in_block, want).await {
                Ok(bytes) if bytes.is_empty() => None,
                Ok(bytes) => {
                    let advanced = pos + bytes.len() as u64;
                    Some((Ok(bytes), (dir, advanced, end)))
                }
                Err(e) => {
                    health.record_io_error(&root);
                    Some((Err(e), (dir, end, end)))
                }
            }
        }
    })
}

async fn read_block_slice(path: &Path, offset: u64, want: u64) -> io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; want as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        fsync(&file).await;
    }
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn fsync(file: &File) {
    let _ = file.sync_all().await;
}

#[cfg(not(unix))]
async fn fsync(_file: &File) {}

async fn atime_of(path: &Path) -> Result<DateTime<Utc>, CacheError> {
    let metadata = fs::metadata(path).await?;
    atime_from_metadata(&metadata)
}

#[cfg(unix)]
fn atime_from_metadata(metadata: &std::fs::Metadata) -> Result<DateTime<Utc>, CacheError> {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(metadata.atime(), 0).ok_or(CacheError::AtimeUnsupported)
}

#[cfg(not(unix))]
fn atime_from_metadata(metadata: &std::fs::Metadata) -> Result<DateTime<Utc>, CacheError> {
    // No portable atime accessor outside unix; the probe in `register` always fails closed
    // here, surfacing `AtimeUnsupported` at drive registration rather than silently degrading
    // eviction to insertion order.
    let _ = metadata;
    Err(CacheError::AtimeUnsupported)
}

#[cfg(unix)]
async fn statvfs_usage(root: PathBuf) -> Result<DriveUsage, CacheError> {
    tokio::task::spawn_blocking(move || {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(root.as_os_str().as_bytes())
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: `c_path` is a valid NUL-terminated string and `stat` has the layout
        // `statvfs` expects to write into.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret != 0 {
            return Err(CacheError::Io(io::Error::last_os_error()));
        }
        // SAFETY: `statvfs` returned success, so `stat` was fully initialized.
        let stat = unsafe { stat.assume_init() };
        let block_size = stat.f_frsize as u64;
        Ok(DriveUsage {
            total_bytes: stat.f_blocks as u64 * block_size,
            free_bytes: stat.f_bavail as u64 * block_size,
        })
    })
    .await
    .map_err(|e| CacheError::InvalidArgument(e.to_string()))?
}

#[cfg(not(unix))]
async fn statvfs_usage(_root: PathBuf) -> Result<DriveUsage, CacheError> {
    Err(CacheError::AtimeUnsupported)
}

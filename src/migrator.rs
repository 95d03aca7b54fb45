//! One-time per-drive rewrite from the legacy V1 flat-file layout into the V2 block format
//! (§4.5, §9 "format migration").
//!
//! V1 drives predate `meta.json`/block-chunked storage: every object lived at
//! `<drive>/<bucket>/<object>` as a single flat file, with no etag or expiry recorded locally.
//! [`DiskCache::register`] already detects a V1 `format.json` and leaves the drive in
//! [`crate::disk_cache::DriveState::Migrating`]; [`FormatMigrator::run`] does the rewrite and
//! flips the drive `Online` (or `Offline` on failure), without blocking any other drive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::disk_cache::{DiskCache, DriveState, FormatVersion, PutMetadata};
use crate::error::CacheError;
use crate::fingerprint::ObjectFingerprint;

/// Drives the V1-to-V2 rewrite for one drive.
pub struct FormatMigrator {
    drive: Arc<DiskCache>,
}

impl FormatMigrator {
    #[must_use]
    pub fn new(drive: Arc<DiskCache>) -> Self {
        Self { drive }
    }

    /// Rewrites every legacy entry found under the drive root, then transitions the drive to
    /// `Online`. A per-entry failure is logged and skipped — the rest of the drive still
    /// migrates and the drive still comes online — but any error enumerating the tree at all
    /// leaves the drive `Offline` rather than serving a half-migrated view under `Migrating`
    /// forever.
    pub async fn run(self) -> Result<(), CacheError> {
        let root = self.drive.root().to_path_buf();
        let entries = match find_v1_entries(&root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(drive = %root.display(), error = %e, "V1 enumeration failed, leaving drive offline");
                self.drive.set_state(DriveState::Offline);
                return Err(e.into());
            }
        };

        tracing::info!(drive = %root.display(), count = entries.len(), "migrating legacy cache entries");
        for entry in &entries {
            if let Err(e) = self.migrate_one(entry).await {
                tracing::warn!(
                    drive = %root.display(),
                    bucket = %entry.bucket,
                    object = %entry.object,
                    error = %e,
                    "skipping legacy entry that failed to migrate",
                );
            }
        }

        self.drive.rewrite_format(FormatVersion::V2).await?;
        self.drive.set_state(DriveState::Online);
        Ok(())
    }

    async fn migrate_one(&self, entry: &V1Entry) -> Result<(), CacheError> {
        let bytes = tokio::fs::read(&entry.path).await?;
        let mod_time = file_mtime(&entry.path).await.unwrap_or_else(Utc::now);
        let etag = format!("\"{:08x}\"", crc32fast::hash(&bytes));
        let fp = ObjectFingerprint::new(entry.bucket.clone(), entry.object.clone());
        let metadata = PutMetadata {
            etag,
            mod_time,
            ..Default::default()
        };
        let len = bytes.len() as u64;
        self.drive.put(&fp, &bytes[..], Some(len), metadata).await?;
        tokio::fs::remove_file(&entry.path).await?;
        Ok(())
    }
}

struct V1Entry {
    bucket: String,
    object: String,
    path: PathBuf,
}

/// Legacy entries are plain files at least two path segments below the drive root whose
/// top-level directory is not a two-hex-digit V2 shard name, so a drive can be walked safely
/// even if migration is retried after a partial prior run.
fn find_v1_entries(root: &Path) -> Result<Vec<V1Entry>, std::io::Error> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).min_depth(2).into_iter() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let mut components = relative.components();
        let Some(bucket_component) = components.next() else {
            continue;
        };
        let bucket = bucket_component.as_os_str().to_string_lossy().to_string();
        if is_v2_shard_name(&bucket) {
            continue;
        }
        let object = components.as_path().to_string_lossy().to_string();
        if object.is_empty() {
            continue;
        }
        out.push(V1Entry {
            bucket,
            object,
            path: entry.path().to_path_buf(),
        });
    }
    Ok(out)
}

fn is_v2_shard_name(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit())
}

async fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let modified = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

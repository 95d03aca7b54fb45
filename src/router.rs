//! Deterministic hash-based placement across the configured drive set.
//!
//! [`CacheRouter`] answers two questions for a given [`ObjectFingerprint`]: where a fill
//! should be written (`locate_for_write`) and where an existing copy is most likely to be
//! found (`locate_for_read`). Both walk the same circular sequence of slots starting at
//! `crc32(bucket/object) mod N`; they differ only in what they accept as a match. Drives are
//! added and removed only at startup (§5 "shared-resource policy"), so the slot count `N` is
//! fixed for the lifetime of a router instance.

use std::sync::Arc;

use crate::disk_cache::DiskCache;
use crate::fingerprint::ObjectFingerprint;

/// Routes fingerprints onto drive slots.
///
/// Holds the same `Arc<DiskCache>` slice the coordinator owns so routing decisions can
/// consult live drive state (`DiskCache::is_online`, `DiskCache::exists`) rather than a
/// stale snapshot.
pub struct CacheRouter {
    drives: Vec<Arc<DiskCache>>,
}

impl CacheRouter {
    #[must_use]
    pub fn new(drives: Vec<Arc<DiskCache>>) -> Self {
        Self { drives }
    }

    #[must_use]
    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    #[must_use]
    pub fn drives(&self) -> &[Arc<DiskCache>] {
        &self.drives
    }

    #[must_use]
    pub fn drive(&self, slot: usize) -> Option<&Arc<DiskCache>> {
        self.drives.get(slot)
    }

    /// The canonical slot index for `fp`, before any online/offline walking.
    #[must_use]
    pub fn index_for(&self, fp: &ObjectFingerprint) -> Option<usize> {
        if self.drives.is_empty() {
            return None;
        }
        Some(fp.hash() as usize % self.drives.len())
    }

    /// Starting at `index_for(fp)`, circularly scan for the first online drive. This is the
    /// placement target for fills: it ignores existing content, so two different fingerprints
    /// whose canonical slot is offline can still both resolve to the same fallback drive.
    #[must_use]
    pub fn locate_for_write(&self, fp: &ObjectFingerprint) -> Option<usize> {
        let start = self.index_for(fp)?;
        let n = self.drives.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&slot| self.drives[slot].is_online())
    }

    /// Starting at `index_for(fp)`, prefer a drive that already holds `fp` (affinity
    /// override); otherwise fall back to the first online drive, which becomes a re-cache
    /// target for the next fill. Returns `None` only when no drive is online at all.
    pub async fn locate_for_read(&self, fp: &ObjectFingerprint) -> Option<usize> {
        let start = self.index_for(fp)?;
        let n = self.drives.len();
        let mut fallback = None;
        for offset in 0..n {
            let slot = (start + offset) % n;
            let drive = &self.drives[slot];
            if !drive.is_online() {
                continue;
            }
            if fallback.is_none() {
                fallback = Some(slot);
            }
            if drive.exists(fp).await {
                return Some(slot);
            }
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn drive_at(dir: &std::path::Path) -> Arc<DiskCache> {
        let config = Arc::new(CacheConfig {
            drives: vec![dir.to_path_buf()],
            ..CacheConfig::default()
        });
        Arc::new(DiskCache::new(dir.to_path_buf(), config))
    }

    #[test]
    fn index_is_stable_for_a_fixed_slot_count() {
        let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().expect("tempdir")).collect();
        let drives: Vec<_> = dirs.iter().map(|d| drive_at(d.path())).collect();
        let router = CacheRouter::new(drives);
        let fp = ObjectFingerprint::new("b", "o");
        let first = router.index_for(&fp);
        let second = router.index_for(&fp);
        assert_eq!(first, second);
        assert!(first.unwrap() < 4);
    }

    #[test]
    fn no_drives_means_no_route() {
        let router = CacheRouter::new(Vec::new());
        assert_eq!(router.index_for(&ObjectFingerprint::new("b", "o")), None);
        assert_eq!(router.locate_for_write(&ObjectFingerprint::new("b", "o")), None);
    }

    #[tokio::test]
    async fn locate_for_write_skips_offline_drives() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().expect("tempdir")).collect();
        let drives: Vec<_> = dirs.iter().map(|d| drive_at(d.path())).collect();
        for drive in &drives {
            drive.force_online_for_test();
        }
        let router = CacheRouter::new(drives.clone());
        let fp = ObjectFingerprint::new("b", "o");
        let index = router.index_for(&fp).expect("routable");
        drives[index].mark_offline_for_test();
        let target = router.locate_for_write(&fp).expect("fallback exists");
        assert_ne!(target, index);
    }

    #[tokio::test]
    async fn locate_for_read_prefers_drive_holding_the_object() {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().expect("tempdir")).collect();
        let drives: Vec<_> = dirs.iter().map(|d| drive_at(d.path())).collect();
        for drive in &drives {
            drive.force_online_for_test();
        }
        let router = CacheRouter::new(drives.clone());
        let fp = ObjectFingerprint::new("b", "o");
        // Put the object on a non-canonical slot and verify the router still finds it.
        let canonical = router.index_for(&fp).expect("routable");
        let other = (canonical + 1) % drives.len();
        drives[other]
            .put(&fp, &b"hello"[..], Some(5), Default::default())
            .await
            .expect("put");
        let found = router.locate_for_read(&fp).await.expect("found");
        assert_eq!(found, other);
    }
}

//! Per-drive background eviction (§4.6).
//!
//! One [`Purger`] runs for the lifetime of one [`DiskCache`], woken either by the drive's own
//! purge-signal channel (posted after a fill pushes usage up, §4.4 step 9) or by a periodic
//! timer, so a drive that nobody is actively filling still ages out expired entries.

use std::sync::Arc;

use chrono::Utc;

use crate::config::CacheConfig;
use crate::disk_cache::DiskCache;
use crate::error::CacheError;

/// Drives one drive's purge loop. Constructed once per drive by the coordinator at startup.
pub struct Purger {
    drive: Arc<DiskCache>,
    config: Arc<CacheConfig>,
}

impl Purger {
    #[must_use]
    pub fn new(drive: Arc<DiskCache>, config: Arc<CacheConfig>) -> Self {
        Self { drive, config }
    }

    /// Runs until `shutdown` fires. Expected to be spawned as its own task; the coordinator
    /// holds the `JoinHandle` and the send side of `shutdown` for its `shutdown()` method.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let Some(mut purge_rx) = self.drive.take_purge_receiver() else {
            tracing::error!(drive = %self.drive.root().display(), "purge receiver already taken, purger not running");
            return;
        };
        let mut interval = tokio::time::interval(self.config.purge_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = purge_rx.recv() => {}
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.sweep().await {
                tracing::warn!(drive = %self.drive.root().display(), error = %e, "purge sweep failed");
            }
        }
    }

    /// One pass: unconditionally evict anything past its `expires`, then — if the drive is
    /// still above the low watermark — evict by ascending atime (oldest first) until it isn't
    /// (§4.6).
    async fn sweep(&self) -> Result<(), CacheError> {
        let candidates = self.drive.enumerate_entries().await?;
        let now = Utc::now();
        let (expired, mut live): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| c.expires.is_some_and(|expires| expires <= now));

        for candidate in expired {
            if self.drive.delete(&candidate.fingerprint).await.is_ok() {
                self.drive.record_eviction();
            }
        }

        if self.drive.is_usage_low().await? {
            return Ok(());
        }

        live.sort_by_key(|c| c.atime);
        for candidate in live {
            if self.drive.is_usage_low().await? {
                break;
            }
            if self.drive.delete(&candidate.fingerprint).await.is_ok() {
                self.drive.record_eviction();
            }
        }
        Ok(())
    }
}

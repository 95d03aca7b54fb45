//! Cache configuration.
//!
//! [`CacheConfig`] is the single source of truth for a running [`crate::coordinator::CacheCoordinator`].
//! It is `serde`-deserializable (the CLI entrypoint loads it from JSON) and its per-field
//! defaults can be overridden individually, since every field has a `#[serde(default = ...)]`.

use std::path::PathBuf;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Structured configuration for the disk cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ordered list of drive directories. Slot order is stable and defines the router's
    /// `index` positions; reordering drives across restarts changes write placement for
    /// every fingerprint.
    pub drives: Vec<PathBuf>,

    /// Glob patterns matched against `"bucket/object"`; matches bypass the cache entirely.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Default expiration, in days, for entries lacking explicit cache-control.
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u32,

    /// High-watermark (percent of drive capacity) that triggers purging.
    #[serde(default = "default_max_use_percent")]
    pub max_use_percent: u8,

    /// Low-watermark (percent of drive capacity) the purger evicts down to.
    #[serde(default = "default_low_watermark_percent")]
    pub low_watermark_percent: u8,

    /// Deadline for acquiring a namespace lock before surfacing `CacheError::Timeout`.
    #[serde(default = "default_namespace_lock_timeout_secs")]
    pub namespace_lock_timeout_secs: u64,

    /// Interval between unconditional purger wake-ups, independent of the purge signal.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Delay between writing and re-reading the atime probe file at drive registration.
    #[serde(default = "default_atime_probe_delay_ms")]
    pub atime_probe_delay_ms: u64,
}

const fn default_expiry_days() -> u32 {
    90
}

const fn default_max_use_percent() -> u8 {
    80
}

const fn default_low_watermark_percent() -> u8 {
    70
}

const fn default_namespace_lock_timeout_secs() -> u64 {
    60
}

const fn default_purge_interval_secs() -> u64 {
    5 * 60
}

const fn default_atime_probe_delay_ms() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            drives: Vec::new(),
            exclude: Vec::new(),
            expiry_days: default_expiry_days(),
            max_use_percent: default_max_use_percent(),
            low_watermark_percent: default_low_watermark_percent(),
            namespace_lock_timeout_secs: default_namespace_lock_timeout_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            atime_probe_delay_ms: default_atime_probe_delay_ms(),
        }
    }
}

impl CacheConfig {
    /// Validates structural invariants that construction-time code relies on. Does not touch
    /// the filesystem beyond checking that configured drive paths exist and are directories.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.drives.is_empty() {
            return Err(CacheError::InvalidArgument(
                "at least one drive must be configured".to_string(),
            ));
        }
        for drive in &self.drives {
            if !drive.is_dir() {
                return Err(CacheError::InvalidArgument(format!(
                    "drive path {} is not a directory",
                    drive.display()
                )));
            }
        }
        if self.max_use_percent <= self.low_watermark_percent {
            return Err(CacheError::InvalidArgument(
                "max_use_percent must be greater than low_watermark_percent".to_string(),
            ));
        }
        if self.max_use_percent > 100 || self.low_watermark_percent > 100 {
            return Err(CacheError::InvalidArgument(
                "watermarks must be expressed as a percentage in 0..=100".to_string(),
            ));
        }
        self.compile_exclude_set().map(|_| ())
    }

    /// Compiles `exclude` into a matcher once; callers should cache the result rather than
    /// calling this on the hot path (see §9 "glob exclude matching").
    pub fn compile_exclude_set(&self) -> Result<GlobSet, CacheError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob = Glob::new(pattern)
                .map_err(|e| CacheError::InvalidArgument(format!("bad exclude glob: {e}")))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| CacheError::InvalidArgument(format!("bad exclude glob set: {e}")))
    }

    #[must_use]
    pub const fn namespace_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.namespace_lock_timeout_secs)
    }

    #[must_use]
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    #[must_use]
    pub const fn atime_probe_delay(&self) -> Duration {
        Duration::from_millis(self.atime_probe_delay_ms)
    }
}

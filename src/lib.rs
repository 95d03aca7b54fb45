//! Disk-backed object cache fronting an S3-compatible object storage backend.
//!
//! This crate accelerates repeated reads of immutable or slowly-changing objects by
//! persisting them on one or more local cache drives, while transparently falling back to
//! the backend for uncacheable, stale, or range-limited requests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   CacheCoordinator    │  admission, revalidation, tee-fill
//! └───────────┬───────────┘
//!             │
//!   ┌─────────┼─────────┐
//!   ▼         ▼         ▼
//! Router  LockMap   Migrator
//!   │
//!   ▼
//! DiskCache (one per drive) ── Purger
//! ```
//!
//! The coordinator ([`coordinator::CacheCoordinator`]) is the only type most callers need:
//! it is constructed with a [`config::CacheConfig`] and a [`backend::BackendObjectLayer`]
//! implementation and exposes the cache object API described in the crate documentation.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod disk_cache;
pub mod error;
pub mod fingerprint;
pub mod migrator;
pub mod namespace_lock;
pub mod purger;
pub mod router;
pub mod stats;

pub use backend::{BackendError, BackendObjectLayer, GetOptions, HttpBackend};
pub use config::CacheConfig;
pub use coordinator::CacheCoordinator;
pub use disk_cache::RangeSpec;
pub use error::CacheError;
pub use fingerprint::ObjectFingerprint;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use crate::backend::{BackendError, BackendObjectLayer, GetOptions};
    pub use crate::config::CacheConfig;
    pub use crate::coordinator::CacheCoordinator;
    pub use crate::disk_cache::RangeSpec;
    pub use crate::error::CacheError;
    pub use crate::fingerprint::ObjectFingerprint;
}

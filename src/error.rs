//! Error taxonomy shared by every component.

use std::io;

/// Errors produced by the cache layer.
///
/// Propagation policy is documented per variant; components that can degrade to a direct
/// backend call (see [`crate::coordinator`]) generally log `DriveOffline`/`DriveFull` instead
/// of surfacing them, while `NotFound`/`Timeout`/`MigrationInProgress` are passed through as-is.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation forbidden")]
    Forbidden,

    #[error("timed out waiting for namespace lock")]
    Timeout,

    #[error("backend is unreachable")]
    BackendDown,

    #[error("drive is offline")]
    DriveOffline,

    #[error("drive has insufficient free space")]
    DriveFull,

    #[error("cache entry is corrupt: {0}")]
    Corruption(String),

    #[error("drive filesystem does not support atime updates")]
    AtimeUnsupported,

    #[error("format migration is in progress")]
    MigrationInProgress,

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// True for errors that should cause a fill to fall back to the direct backend reader
    /// instead of surfacing to the caller (§7 propagation policy).
    #[must_use]
    pub const fn is_non_fatal_for_fill(&self) -> bool {
        matches!(self, Self::DriveOffline | Self::DriveFull)
    }
}

/// Errors returned by a [`crate::backend::BackendObjectLayer`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("backend is unreachable")]
    BackendDown,

    #[error("insufficient read quorum")]
    InsufficientReadQuorum,

    #[error("insufficient write quorum")]
    InsufficientWriteQuorum,

    #[error("backend storage is full")]
    StorageFull,

    #[error("operation not implemented by this backend")]
    NotImplemented,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound | BackendError::BucketNotFound => Self::NotFound,
            BackendError::BackendDown
            | BackendError::InsufficientReadQuorum
            | BackendError::InsufficientWriteQuorum => Self::BackendDown,
            BackendError::StorageFull => Self::DriveFull,
            BackendError::NotImplemented => Self::InvalidArgument("not implemented".to_string()),
            BackendError::Io(e) => Self::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fatal_classification() {
        assert!(CacheError::DriveOffline.is_non_fatal_for_fill());
        assert!(CacheError::DriveFull.is_non_fatal_for_fill());
        assert!(!CacheError::NotFound.is_non_fatal_for_fill());
    }

    #[test]
    fn backend_not_found_maps_to_cache_not_found() {
        let mapped: CacheError = BackendError::NotFound.into();
        assert!(matches!(mapped, CacheError::NotFound));
    }

    #[test]
    fn backend_down_maps_through() {
        let mapped: CacheError = BackendError::BackendDown.into();
        assert!(matches!(mapped, CacheError::BackendDown));
    }
}

//! Object identity: the `(bucket, object)` pair every other component keys on.

use std::fmt;
use std::sync::OnceLock;

/// Identifies a single object in the backend namespace.
///
/// Equality is byte-exact on `bucket` and `object`; ordering is irrelevant to the cache and
/// `ObjectFingerprint` deliberately does not implement `Ord`. A trailing `/` on `object` marks
/// a directory placeholder and is never cacheable (see [`ObjectFingerprint::is_directory`]).
///
/// `Clone`/`Eq`/`PartialEq`/`Hash` are implemented by hand rather than derived because the
/// `joined` memoization cache is an `OnceLock`, which carries none of those traits itself —
/// identity only ever depends on `bucket`/`object`.
#[derive(Eq)]
pub struct ObjectFingerprint {
    bucket: String,
    object: String,
    // Lazily built "bucket/object" form, reused by hashing and path sharding so callers that
    // hit the router and the disk cache for the same fingerprint don't reallocate it twice.
    joined: OnceLock<String>,
}

impl Clone for ObjectFingerprint {
    fn clone(&self) -> Self {
        let joined = OnceLock::new();
        if let Some(cached) = self.joined.get() {
            let _ = joined.set(cached.clone());
        }
        Self {
            bucket: self.bucket.clone(),
            object: self.object.clone(),
            joined,
        }
    }
}

impl PartialEq for ObjectFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.bucket == other.bucket && self.object == other.object
    }
}

impl std::hash::Hash for ObjectFingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bucket.hash(state);
        self.object.hash(state);
    }
}

impl ObjectFingerprint {
    /// Builds a fingerprint from owned parts.
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            joined: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    /// A trailing `/` marks a directory placeholder; directories are never cacheable.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.object.ends_with('/')
    }

    /// The canonical `"bucket/object"` form used for hashing, glob matching, and logging.
    #[must_use]
    pub fn joined(&self) -> &str {
        self.joined
            .get_or_init(|| format!("{}/{}", self.bucket, self.object))
    }

    /// CRC32 of the canonical joined form, the router's placement hash.
    #[must_use]
    pub fn hash(&self) -> u32 {
        crc32fast::hash(self.joined().as_bytes())
    }
}

impl fmt::Debug for ObjectFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectFingerprint")
            .field(&self.bucket)
            .field(&self.object)
            .finish()
    }
}

impl fmt::Display for ObjectFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.joined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_is_cached_and_correct() {
        let fp = ObjectFingerprint::new("bucket", "path/to/obj");
        assert_eq!(fp.joined(), "bucket/path/to/obj");
        // second call exercises the OnceLock fast path
        assert_eq!(fp.joined(), "bucket/path/to/obj");
    }

    #[test]
    fn directory_marker() {
        assert!(ObjectFingerprint::new("b", "dir/").is_directory());
        assert!(!ObjectFingerprint::new("b", "dir/file").is_directory());
    }

    #[test]
    fn hash_is_deterministic() {
        let a = ObjectFingerprint::new("b", "o");
        let b = ObjectFingerprint::new("b", "o");
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn equality_ignores_joined_cache_state() {
        let a = ObjectFingerprint::new("b", "o");
        let b = ObjectFingerprint::new("b", "o");
        let _ = a.joined();
        assert_eq!(a, b);
    }
}

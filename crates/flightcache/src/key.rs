use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// The identity of a cached value.
///
/// A [`CacheKey`] wraps an opaque identifier, and is used both as the index into a
/// [`Storage`](crate::storage::Storage) and as the membership token of the set of running
/// computations. Equality and hashing only consider the identifier.
#[derive(Clone, Eq)]
pub struct CacheKey {
    identifier: Arc<str>,
    hash: [u8; 32],
}

impl CacheKey {
    /// Creates a new [`CacheKey`] for the given identifier.
    pub fn new(identifier: impl Into<Arc<str>>) -> Self {
        let identifier = identifier.into();
        let hash = Sha256::digest(identifier.as_bytes()).into();
        Self { identifier, hash }
    }

    /// Returns the identifier this key wraps.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    ///
    /// This path never escapes the directory it is joined to, no matter which characters the
    /// identifier contains.
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            // writing into a `String` can not fail
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.identifier).finish()
    }
}

impl From<&str> for CacheKey {
    fn from(identifier: &str) -> Self {
        Self::new(identifier)
    }
}

impl From<String> for CacheKey {
    fn from(identifier: String) -> Self {
        Self::new(identifier)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.identifier)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let identifier = String::deserialize(deserializer)?;
        Ok(Self::new(identifier))
    }
}

//! # Storage backends
//!
//! A [`Storage`] holds the values that a [`Coordinator`](crate::Coordinator) has computed, keyed
//! by their [`CacheKey`]. There are two backends:
//!
//! - [`MemoryStorage`], a transient in-memory cache which may evict entries once it grows beyond
//!   its configured [`MemoryLimits`].
//! - [`DiskStorage`], which serializes values as JSON into a directory that is exclusively owned
//!   by one storage instance, and removed wholesale when that instance is dropped.
//!
//! Both backends are infallible from the point of view of their callers. A value that can not be
//! read is a miss, and a value that can not be written is logged and forgotten. A missed cache
//! write only means that the value will be computed again the next time it is requested.
//!
//! [`Backend`] selects one of the two at runtime, based on the [`CacheConfig`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfig;
use crate::key::CacheKey;

mod disk;
mod memory;

pub use disk::{DiskStorage, StorageError};
pub use memory::{MemoryLimits, MemoryStorage};

/// A value that can be stored in a [`Storage`].
pub trait CacheValue: Clone + Send + Sync + 'static {
    /// Gives a relative weight for the value, as not all values are created equal.
    ///
    /// This is only used by the [`MemoryStorage`] when it was configured with a cost limit.
    fn weight(&self) -> u32 {
        1
    }
}

/// Lookup and persistence of computed values.
///
/// Implementations need to be cheap enough to be called from within the coordinator's critical
/// section, and must never block on other coordinator operations.
pub trait Storage<V>: Send + Sync + 'static {
    /// The name of this storage, used to tag metrics.
    fn name(&self) -> &'static str;

    /// Looks up the value stored for `key`.
    fn get(&self, key: &CacheKey) -> Option<V>;

    /// Stores `value` for `key`, replacing any previous value.
    fn put(&self, key: CacheKey, value: V);
}

/// The available [`Storage`] implementations.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A [`MemoryStorage`].
    #[default]
    Memory,
    /// A [`DiskStorage`].
    Disk,
}

/// A [`Storage`] which is selected at runtime.
#[derive(Debug)]
pub enum Backend<V> {
    Memory(MemoryStorage<V>),
    /// A disk backend, along with the limits of the memory backend it falls back to.
    Disk(DiskStorage<V>, MemoryLimits),
}

impl<V> Backend<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Creates the configured backend.
    ///
    /// If the directory of a disk backend can not be created, this falls back to an in-memory
    /// backend, so the coordinator still works, just without persistence.
    pub fn from_config(config: &CacheConfig) -> Self {
        let limits = config.memory_limits();
        match config.backend {
            BackendKind::Memory => Self::Memory(MemoryStorage::new(limits)),
            BackendKind::Disk => Self::disk_or_memory(&config.cache_dir(), limits),
        }
    }

    /// Creates a new and empty backend of the same kind.
    ///
    /// A disk backend gets a new directory next to the current one. If that directory can not be
    /// created, the fresh backend is an in-memory one with the configured limits.
    pub fn fresh(&self) -> Self {
        match self {
            Self::Memory(memory) => Self::Memory(memory.fresh()),
            Self::Disk(disk, limits) => Self::disk_or_memory(disk.base_dir(), *limits),
        }
    }

    /// Returns which kind of backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory(_) => BackendKind::Memory,
            Self::Disk(..) => BackendKind::Disk,
        }
    }

    fn disk_or_memory(base_dir: &std::path::Path, limits: MemoryLimits) -> Self {
        match DiskStorage::new(base_dir) {
            Ok(disk) => Self::Disk(disk, limits),
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %base_dir.display(),
                    "Failed to create disk cache directory, falling back to memory",
                );
                Self::Memory(MemoryStorage::new(limits))
            }
        }
    }
}

impl<V> Storage<V> for Backend<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        match self {
            Self::Memory(memory) => memory.name(),
            Self::Disk(disk, _) => disk.name(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        match self {
            Self::Memory(memory) => memory.get(key),
            Self::Disk(disk, _) => disk.get(key),
        }
    }

    fn put(&self, key: CacheKey, value: V) {
        match self {
            Self::Memory(memory) => memory.put(key, value),
            Self::Disk(disk, _) => disk.put(key, value),
        }
    }
}

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::{CacheValue, Storage};
use crate::key::CacheKey;

/// Disambiguates directories created within the same nanosecond.
static DIRECTORY_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// The fs operations of this module are retried this many times.
const MAX_RETRIES: usize = 2;

/// Name of the directory holding not yet persisted files.
const TMP_DIR: &str = "tmp";

/// An error reading or writing a single cache file.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to access cache file")]
    Io(#[from] io::Error),
    #[error("failed to (de)serialize cache file")]
    Serialization(#[from] serde_json::Error),
    #[error("cache file belongs to `{found}` instead of `{expected}`")]
    KeyMismatch { expected: String, found: String },
}

/// The contents of a single cache file.
///
/// The key is stored next to the value, as the file name is only a hash of it.
#[derive(Serialize, Deserialize)]
struct StoredEntry<K, T> {
    key: K,
    value: T,
}

/// A [`Storage`] that writes values as JSON files into a private directory.
///
/// Every instance creates its own uniquely named directory, and removes it again when dropped.
/// The directory listing is the only index of stored entries.
pub struct DiskStorage<V> {
    dir: PathBuf,
    base_dir: PathBuf,
    tmp_dir: PathBuf,
    remove_on_drop: bool,
    _value: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for DiskStorage<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStorage")
            .field("dir", &self.dir)
            .field("remove_on_drop", &self.remove_on_drop)
            .finish()
    }
}

impl<V> DiskStorage<V> {
    /// Creates a new storage in a fresh directory below `base_dir`.
    ///
    /// `base_dir` itself is created if necessary, and is never removed.
    pub fn new(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)?;

        let mut retries = 0;
        let dir = loop {
            retries += 1;

            let dir = base_dir.join(unique_dir_name());
            match fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && retries <= MAX_RETRIES => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(path = %dir.display(), "Created cache directory");
        Self::with_dir(dir, base_dir.to_path_buf())
    }

    /// Adopts an existing directory, including all the entries stored in it.
    ///
    /// The returned storage owns the directory, and removes it when dropped.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let base_dir = dir.parent().map_or_else(|| dir.clone(), Path::to_path_buf);
        Self::with_dir(dir, base_dir)
    }

    fn with_dir(dir: PathBuf, base_dir: PathBuf) -> io::Result<Self> {
        let tmp_dir = dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            dir,
            base_dir,
            tmp_dir,
            remove_on_drop: true,
            _value: PhantomData,
        })
    }

    /// The directory this storage writes to.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// The directory this storage was created in.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Consumes the storage without removing its directory.
    pub fn keep(mut self) -> PathBuf {
        self.remove_on_drop = false;
        self.dir.clone()
    }

    /// Returns the keys of all the entries stored in the directory.
    ///
    /// Files that can not be decoded are skipped.
    pub fn keys(&self) -> Vec<CacheKey> {
        WalkDir::new(&self.dir)
            .into_iter()
            .filter_entry(|entry| entry.path() != self.tmp_dir.as_path())
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| match read_entry::<IgnoredAny>(entry.path()) {
                Ok(stored) => Some(stored.key),
                Err(e) => {
                    tracing::trace!(
                        error = &e as &dyn std::error::Error,
                        path = %entry.path().display(),
                        "Skipping unreadable cache file",
                    );
                    None
                }
            })
            .collect()
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.cache_path())
    }

    /// Create a new temporary file next to the cache files.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

impl<V> DiskStorage<V>
where
    V: Serialize + DeserializeOwned,
{
    fn load(&self, key: &CacheKey) -> Result<Option<V>, StorageError> {
        let path = self.entry_path(key);
        let stored = match read_entry::<V>(&path) {
            Ok(stored) => stored,
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if stored.key != *key {
            return Err(StorageError::KeyMismatch {
                expected: key.identifier().into(),
                found: stored.key.identifier().into(),
            });
        }
        Ok(Some(stored.value))
    }

    fn store(&self, key: &CacheKey, value: &V) -> Result<(), StorageError> {
        let temp_file = self.tempfile()?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            serde_json::to_writer(&mut writer, &StoredEntry { key, value })?;
            writer.flush()?;
        }

        let cache_path = self.entry_path(key);
        tracing::trace!("Creating cache file at path {:?}", cache_path.display());
        persist_tempfile(temp_file, &cache_path)?;
        Ok(())
    }
}

impl<V> Storage<V> for DiskStorage<V>
where
    V: CacheValue + Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "disk"
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        match self.load(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    %key,
                    "Failed to read cache file, treating as miss",
                );
                metric!(counter("storage.disk.read_failed") += 1, "storage" => self.name());
                None
            }
        }
    }

    fn put(&self, key: CacheKey, value: V) {
        if let Err(e) = self.store(&key, &value) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                %key,
                "Failed to write cache file",
            );
            metric!(counter("storage.disk.write_failed") += 1, "storage" => self.name());
        }
    }
}

impl<V> Drop for DiskStorage<V> {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!(path = %self.dir.display(), "Removed cache directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %self.dir.display(),
                "Failed to remove cache directory",
            ),
        }
    }
}

fn unique_dir_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_nanos())
        .unwrap_or_default();
    let n = DIRECTORY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("flightcache_{nanos}_{n}")
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Result<StoredEntry<CacheKey, T>, StorageError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}

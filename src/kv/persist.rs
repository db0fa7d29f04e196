//! Backends that a `KVStore` pages values out to.
use crate::error::LiquidError;
use crate::kv::Key;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// A byte-blob store keyed by `Key`. The medium is up to the implementation.
pub trait Persist: Send + Sync + Debug {
    /// Stores `bytes` under `key`, replacing anything stored before
    fn store(&self, key: &Key, bytes: &[u8]) -> Result<(), LiquidError>;

    /// Loads the bytes stored under `key`, `None` if there are none
    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>, LiquidError>;

    /// Deletes the bytes stored under `key`, if any
    fn delete(&self, key: &Key) -> Result<(), LiquidError>;
}

/// Keeps blobs in memory, mainly useful for tests
#[derive(Debug, Default)]
pub struct MemPersist {
    blobs: Mutex<HashMap<Key, Vec<u8>>>,
}

impl MemPersist {
    pub fn new() -> Self {
        MemPersist::default()
    }
}

impl Persist for MemPersist {
    fn store(&self, key: &Key, bytes: &[u8]) -> Result<(), LiquidError> {
        self.blobs.lock().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>, LiquidError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn delete(&self, key: &Key) -> Result<(), LiquidError> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Stores one file per key in a directory
#[derive(Debug)]
pub struct FilePersist {
    dir: PathBuf,
}

impl FilePersist {
    /// Creates the backend, creating `dir` if it does not exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LiquidError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FilePersist { dir })
    }

    /// Key names may hold any character, so file names are hex encoded
    fn path(&self, key: &Key) -> PathBuf {
        let name: String =
            key.name.bytes().map(|b| format!("{:02x}", b)).collect();
        let hint = key.home_hint.map_or(String::new(), |h| format!("-{}", h));
        self.dir.join(format!("{:?}{}-{}.bin", key.kind, hint, name))
    }
}

impl Persist for FilePersist {
    fn store(&self, key: &Key, bytes: &[u8]) -> Result<(), LiquidError> {
        Ok(fs::write(self.path(key), bytes)?)
    }

    fn load(&self, key: &Key) -> Result<Option<Vec<u8>>, LiquidError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &Key) -> Result<(), LiquidError> {
        match fs::remove_file(self.path(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

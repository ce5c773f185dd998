//! Durable key-value slots
//!
//! The engine keeps its whole persisted structure under one key. Hosts plug
//! in whatever backing store they have; two implementations ship here.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use worldloom_core::{Error, Result};

/// A durable string slot addressed by key.
///
/// The engine calls `set` synchronously after each mutation, from whichever
/// thread made it, including coordinator tasks on the tokio runtime. Writes
/// are ordered and never run under the engine's state lock. Slow backends
/// should buffer and return.
pub trait KvSlot: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, blob: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local slot. Used by tests and by hosts that persist elsewhere.
#[derive(Default)]
pub struct InMemorySlot {
    entries: DashMap<String, String>,
}

impl InMemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvSlot for InMemorySlot {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, blob: &str) -> Result<()> {
        self.entries.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory. Writes go through a temp file
/// and a rename so a crash never leaves a half-written blob.
pub struct FileSlot {
    dir: PathBuf,
}

impl FileSlot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(Error::storage(format!("invalid slot key: {key:?}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KvSlot for FileSlot {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, blob: &str) -> Result<()> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.dir)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, blob)?;
        std::fs::rename(&tmp_path, &path)?;
        debug!("Wrote slot {} ({} bytes)", path.display(), blob.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

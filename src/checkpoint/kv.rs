//! Key-value persistence surface for checkpoints.
//!
//! Keys are `/`-separated relative paths. `put` is atomic: a reader sees
//! either the previous value or the new one, never a partial write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Background write failed: {0}")]
    Join(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Keys starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Removes `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

fn validate_key(key: &str) -> Result<(), KvError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != ".." && !part.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(KvError::InvalidKey(key.to_string()))
    }
}

/// Stores each key as a file under a root directory.
///
/// Writes go to a temporary file in the destination directory which is then
/// renamed over the target. `list` looks one directory level below the
/// prefix's directory part.
#[derive(Debug, Clone)]
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).await?;

        let value = value.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".tmp-")
                .tempfile_in(&dir)?;
            tmp.write_all(&value)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| KvError::Join(e.to_string()))??;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let (dir_part, name_prefix) = match prefix.rfind('/') {
            Some(index) => (&prefix[..index], &prefix[index + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.starts_with(name_prefix) {
                continue;
            }
            keys.push(if dir_part.is_empty() {
                name
            } else {
                format!("{}/{}", dir_part, name)
            });
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

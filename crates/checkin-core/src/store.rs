//! Blob-store collaborator for dataset and artifact sync.
//!
//! Keys are `/`-separated object names (`dataset/alice/alice_1.png`).
//! [`LocalBlobStore`] treats a directory as the bucket, which is enough for
//! single-host deployments and for tests.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub trait BlobStore: Send {
    /// Create the bucket if it does not exist yet.
    fn ensure_bucket(&self) -> Result<(), StoreError>;

    fn put_file(&self, key: &str, local: &Path) -> Result<(), StoreError>;

    fn get_file(&self, key: &str, local: &Path) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Download every object under `prefix` into `local_dir`, with the
    /// prefix stripped from the local path. Returns the number of files.
    fn fetch_prefix(&self, prefix: &str, local_dir: &Path) -> Result<usize, StoreError> {
        let keys = self.list(prefix)?;
        for key in &keys {
            let relative = key[prefix.len()..].trim_start_matches('/');
            let target = local_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            self.get_file(key, &target)?;
        }
        tracing::info!(prefix, count = keys.len(), dir = %local_dir.display(), "fetched objects");
        Ok(keys.len())
    }
}

/// `prefix` + relative path with `/` separators.
pub fn join_key(prefix: &str, relative: &Path) -> String {
    let mut key = prefix.trim_end_matches('/').to_string();
    for part in relative.components() {
        if let Component::Normal(s) = part {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&s.to_string_lossy());
        }
    }
    key
}

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let bad = key.is_empty()
            || key.starts_with('/')
            || key.contains('\\')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
        if bad {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                out.push(join_key("", relative));
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn ensure_bucket(&self) -> Result<(), StoreError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
            tracing::info!(root = %self.root.display(), "created local bucket");
        }
        Ok(())
    }

    fn put_file(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::copy(local, &target).map_err(io_err(local))?;
        tracing::debug!(key, "object stored");
        Ok(())
    }

    fn get_file(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        let source = self.object_path(key)?;
        if !source.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        std::fs::copy(&source, local).map_err(io_err(local))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        self.walk(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

//! Filesystem-backed blob store for computed feature tables.
//!
//! Layout under the configured root:
//! - `static_features/{feature}/{fingerprint}.blob`
//! - `dynamic_features/{feature}/{fingerprint}/{YYYYMMDD}.blob`
//!
//! Entries are never expired. Deleting a directory is the only way to force a
//! recomputation.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};

use crate::observability::log_cache_config;
use crate::table::Table;

pub const STATIC_NAMESPACE: &str = "static_features";
pub const DYNAMIC_NAMESPACE: &str = "dynamic_features";
pub const BLOB_EXTENSION: &str = "blob";

const CACHE_DIR_ENV: &str = "FEATCACHE_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cache"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode table for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode cached table at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid cache path: {0}")]
    InvalidPath(PathBuf),
}

pub fn cache_config_from_env() -> CacheConfig {
    let mut config = CacheConfig::default();

    if let Ok(root) = env::var(CACHE_DIR_ENV) {
        let trimmed = root.trim();
        if !trimmed.is_empty() {
            config.root = PathBuf::from(trimmed);
        }
    }

    config
}

/// Handle to the cache root. Cloning is cheap; all state lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        log_cache_config(config);
        Self {
            root: config.root.clone(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(&cache_config_from_env())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn static_entry_path(&self, feature: &str, fingerprint: &str) -> PathBuf {
        self.root
            .join(STATIC_NAMESPACE)
            .join(feature)
            .join(format!("{fingerprint}.{BLOB_EXTENSION}"))
    }

    pub fn dynamic_entry_path(&self, feature: &str, fingerprint: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(DYNAMIC_NAMESPACE)
            .join(feature)
            .join(fingerprint)
            .join(format!("{}.{BLOB_EXTENSION}", date.format("%Y%m%d")))
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Reads the entry at `path`; `Ok(None)` when nothing is cached there.
    pub fn load(&self, path: &Path) -> Result<Option<Table>, CacheError> {
        if !self.contains(path) {
            debug!(
                component = "cache",
                event = "features.cache.miss",
                path = %path.display()
            );
            return Ok(None);
        }

        let bytes = fs::read(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = serde_json::from_slice(&bytes).map_err(|source| CacheError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            component = "cache",
            event = "features.cache.hit",
            path = %path.display(),
            bytes = bytes.len()
        );
        Ok(Some(table))
    }

    pub fn store(&self, path: &Path, table: &Table) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(table).map_err(|source| CacheError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        write_atomic(path, &bytes)?;

        info!(
            component = "cache",
            event = "features.cache.write",
            path = %path.display(),
            rows = table.len(),
            bytes = bytes.len()
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| CacheError::InvalidPath(path.to_path_buf()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    let io_err = |source| CacheError::Io {
        path: tmp_path.clone(),
        source,
    };

    {
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }

    fs::rename(&tmp_path, path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

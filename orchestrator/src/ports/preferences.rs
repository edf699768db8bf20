//! Durable `owner_key → port` hints.
//!
//! The file is a single JSON object rewritten wholesale on every save. Writes
//! go to a sibling `.json.tmp` file that is renamed over the target, so a
//! reader never observes a partially written map.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PreferenceStoreError {
    #[error("preference file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode preference map: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted map. A missing file is an empty map; a corrupt file
    /// is logged and treated as empty since the contents are only hints.
    pub async fn load(&self) -> Result<BTreeMap<String, u16>, PreferenceStoreError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(PreferenceStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring unreadable port preference file: {e}");
                Ok(BTreeMap::new())
            }
        }
    }

    pub async fn save(&self, map: &BTreeMap<String, u16>) -> Result<(), PreferenceStoreError> {
        let io_err = |source| PreferenceStoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let raw = serde_json::to_string_pretty(map)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, raw).await.map_err(io_err)?;
        fs::rename(&temp_path, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage for uploaded plugin binaries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reef_core::{PluginId, ReefError, plugin_id_from_filename};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One uploaded artifact, as described by its sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    pub id: PluginId,
    pub filename: String,
    pub upload_time: DateTime<Utc>,
}

impl StoredBlob {
    /// Key used to find this blob again. The filename is unique in a store.
    pub fn storage_id(&self) -> &str {
        &self.filename
    }
}

/// Where uploaded plugin binaries live between host runs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `filename`, overwriting an earlier upload of the same name.
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<StoredBlob, ReefError>;

    /// Deletes a blob and its sidecar. Deleting a missing blob is not an error.
    async fn delete(&self, storage_id: &str) -> Result<(), ReefError>;

    async fn list(&self) -> Result<Vec<StoredBlob>, ReefError>;

    /// Records the plugin id a stored blob turned out to carry.
    async fn relabel(&self, storage_id: &str, id: &str) -> Result<StoredBlob, ReefError>;

    /// Filesystem path a transport can load the blob from.
    fn path_of(&self, storage_id: &str) -> PathBuf;
}

fn io_err(e: std::io::Error) -> ReefError {
    ReefError::Storage {
        source: Box::new(e),
    }
}

/// Accepted upload extensions: this platform's library extension and `wasm`.
pub fn accepted_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            ext.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION)
                || ext.eq_ignore_ascii_case("wasm")
        })
}

/// Blob store backed by one directory.
///
/// Each upload is `<dir>/<filename>` plus a `<dir>/<stem>.json` sidecar.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    dir: PathBuf,
}

impl DirBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sidecar_path(&self, filename: &str) -> PathBuf {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        self.dir.join(format!("{stem}.json"))
    }

    fn check_filename(filename: &str) -> Result<(), ReefError> {
        let plain = Path::new(filename)
            .file_name()
            .is_some_and(|n| n == std::ffi::OsStr::new(filename));
        if !plain || filename.starts_with('.') {
            return Err(ReefError::Config(format!(
                "upload filename `{filename}` must be a plain file name"
            )));
        }
        if !accepted_extension(filename) {
            return Err(ReefError::Config(format!(
                "upload `{filename}` must be a .{} library or a .wasm module",
                std::env::consts::DLL_EXTENSION
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for DirBlobStore {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<StoredBlob, ReefError> {
        Self::check_filename(filename)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let blob = StoredBlob {
            id: plugin_id_from_filename(filename),
            filename: filename.to_string(),
            upload_time: Utc::now(),
        };
        tokio::fs::write(self.dir.join(filename), bytes)
            .await
            .map_err(io_err)?;
        let sidecar = serde_json::to_vec_pretty(&blob).map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })?;
        tokio::fs::write(self.sidecar_path(filename), sidecar)
            .await
            .map_err(io_err)?;

        debug!(plugin = %blob.id, filename, bytes = bytes.len(), "stored upload");
        Ok(blob)
    }

    async fn relabel(&self, storage_id: &str, id: &str) -> Result<StoredBlob, ReefError> {
        let sidecar_path = self.sidecar_path(storage_id);
        let raw = tokio::fs::read(&sidecar_path).await.map_err(io_err)?;
        let mut blob: StoredBlob = serde_json::from_slice(&raw).map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })?;
        blob.id = id.to_string();
        let sidecar = serde_json::to_vec_pretty(&blob).map_err(|e| ReefError::Storage {
            source: Box::new(e),
        })?;
        tokio::fs::write(&sidecar_path, sidecar)
            .await
            .map_err(io_err)?;
        debug!(plugin = %blob.id, filename = %blob.filename, "relabelled upload");
        Ok(blob)
    }

    async fn delete(&self, storage_id: &str) -> Result<(), ReefError> {
        for path in [self.dir.join(storage_id), self.sidecar_path(storage_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredBlob>, ReefError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await.map_err(io_err)?;
            let blob: StoredBlob = match serde_json::from_slice(&raw) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable upload sidecar");
                    continue;
                }
            };
            if tokio::fs::try_exists(self.dir.join(&blob.filename))
                .await
                .unwrap_or(false)
            {
                blobs.push(blob);
            } else {
                warn!(filename = %blob.filename, "upload sidecar without binary");
            }
        }
        blobs.sort_by(|a, b| a.upload_time.cmp(&b.upload_time).then(a.id.cmp(&b.id)));
        Ok(blobs)
    }

    fn path_of(&self, storage_id: &str) -> PathBuf {
        self.dir.join(storage_id)
    }
}

//! Status persistence contract and a JSON-document implementation.

use async_trait::async_trait;
use kiln_core::ImageBuild;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

pub const OP_REPLACE: &str = "replace";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object {expected} not found, document holds {found}")]
    NotFound { expected: String, found: String },

    #[error("unsupported patch operation {0:?}")]
    UnsupportedOperation(String),

    #[error("patch path {0:?} does not exist")]
    MissingPath(String),
}

/// One RFC 6902 operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    pub value: serde_json::Value,
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            op: OP_REPLACE.to_string(),
            path: path.into(),
            value,
        }
    }
}

/// Partial updates against the persisted status of an object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Applies a JSON patch (`patch` is the serialized operation list) to `object`'s status.
    async fn patch_status(&self, object: &ImageBuild, patch: &[u8]) -> Result<(), StoreError>;
}

/// Stores a single `ImageBuild` as a JSON document and patches it by read-modify-write.
/// Each write replaces the document by rename.
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    path: PathBuf,
}

impl FileObjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<ImageBuild, StoreError> {
        let content = self.read().await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn read(&self) -> Result<String, StoreError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn patch_status(&self, object: &ImageBuild, patch: &[u8]) -> Result<(), StoreError> {
        let operations: Vec<PatchOperation> = serde_json::from_slice(patch)?;
        let mut document: serde_json::Value = serde_json::from_str(&self.read().await?)?;

        let stored: ImageBuild = serde_json::from_value(document.clone())?;
        if stored.object_key() != object.object_key() {
            return Err(StoreError::NotFound {
                expected: object.object_key(),
                found: stored.object_key(),
            });
        }

        for operation in operations {
            if operation.op != OP_REPLACE {
                return Err(StoreError::UnsupportedOperation(operation.op));
            }
            if !operation.path.starts_with("/status") {
                return Err(StoreError::MissingPath(operation.path));
            }

            let target = document
                .pointer_mut(&operation.path)
                .ok_or_else(|| StoreError::MissingPath(operation.path.clone()))?;
            *target = operation.value;
            debug!("Patched {} at {}", object.object_key(), operation.path);
        }

        let content = serde_json::to_string_pretty(&document)?;
        self.replace_document(content).await
    }
}

impl FileObjectStore {
    /// Writes `content` to a sibling temp file and renames it over the document.
    async fn replace_document(&self, content: String) -> Result<(), StoreError> {
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut file = NamedTempFile::new_in(dir)?;
            file.write_all(content.as_bytes())?;
            file.as_file().sync_all()?;
            file.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|written| written);

        written.map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

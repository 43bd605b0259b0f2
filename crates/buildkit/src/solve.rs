//! Solve request model and the build daemon contract.
//!
//! The daemon's wire protocol lives behind [`SolveClient`]; this crate only
//! assembles requests and consumes the status stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialProvider;

pub const DOCKERFILE_FRONTEND: &str = "dockerfile.v0";
pub const LOCAL_CONTEXT: &str = "context";
pub const LOCAL_DOCKERFILE: &str = "dockerfile";

pub const EXPORTER_IMAGE: &str = "image";
pub const EXPORTER_OCI: &str = "oci";

pub const CACHE_INLINE: &str = "inline";
pub const CACHE_REGISTRY: &str = "registry";

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("solve failed: {0}")]
    Daemon(String),

    #[error("progress display failed: {0}")]
    Progress(String),

    #[error("solve cancelled")]
    Cancelled,
}

/// Where exported bytes go when the exporter streams output back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutput {
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportEntry {
    #[serde(rename = "type")]
    pub r#type: String,
    pub attrs: BTreeMap<String, String>,
    #[serde(skip)]
    pub output: Option<ExportOutput>,
}

impl ExportEntry {
    /// Pushes the result to the registry under `name`.
    pub fn push_image(name: &str) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("push".to_string(), "true".to_string());
        attrs.insert("name".to_string(), name.to_string());
        Self {
            r#type: EXPORTER_IMAGE.to_string(),
            attrs,
            output: None,
        }
    }

    pub fn discard(r#type: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            attrs: BTreeMap::new(),
            output: Some(ExportOutput::Discard),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheOptionsEntry {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl CacheOptionsEntry {
    pub fn inline() -> Self {
        Self {
            r#type: CACHE_INLINE.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn registry(reference: &str) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("ref".to_string(), reference.to_string());
        Self {
            r#type: CACHE_REGISTRY.to_string(),
            attrs,
        }
    }
}

/// Services the client exposes to the daemon over the solve session.
#[derive(Debug, Clone)]
pub enum SessionAttachable {
    Auth(Arc<dyn CredentialProvider>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveRequest {
    /// Unique job reference used to correlate the status stream.
    pub r#ref: String,
    pub frontend: String,
    pub frontend_attrs: BTreeMap<String, String>,
    pub local_dirs: BTreeMap<String, PathBuf>,
    pub exports: Vec<ExportEntry>,
    pub cache_exports: Vec<CacheOptionsEntry>,
    pub cache_imports: Vec<CacheOptionsEntry>,
    #[serde(skip)]
    pub session: Vec<SessionAttachable>,
}

impl SolveRequest {
    pub fn dockerfile() -> Self {
        Self {
            r#ref: uuid::Uuid::new_v4().simple().to_string(),
            frontend: DOCKERFILE_FRONTEND.to_string(),
            frontend_attrs: BTreeMap::new(),
            local_dirs: BTreeMap::new(),
            exports: Vec::new(),
            cache_exports: Vec::new(),
            cache_imports: Vec::new(),
            session: Vec::new(),
        }
    }

    pub fn with_attachable(mut self, attachable: SessionAttachable) -> Self {
        self.session.push(attachable);
        self
    }

    /// Binds `dir` as both the build context and the Dockerfile source.
    pub fn bind_context(&mut self, dir: PathBuf) {
        self.local_dirs.insert(LOCAL_DOCKERFILE.to_string(), dir.clone());
        self.local_dirs.insert(LOCAL_CONTEXT.to_string(), dir);
    }

    pub fn credentials(&self) -> Option<&Arc<dyn CredentialProvider>> {
        self.session.iter().find_map(|attachable| match attachable {
            SessionAttachable::Auth(provider) => Some(provider),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub digest: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub cached: bool,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexStatus {
    pub id: String,
    pub vertex: String,
    pub name: String,
    pub current: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexLog {
    pub vertex: String,
    pub stream: i64,
    pub msg: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexWarning {
    pub vertex: String,
    pub short: Vec<u8>,
}

/// One progress event of a running solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStatus {
    pub vertexes: Vec<Vertex>,
    pub statuses: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
    pub warnings: Vec<VertexWarning>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveResponse {
    pub exporter_response: HashMap<String, String>,
}

/// Contract of the remote build daemon.
///
/// Implementations send progress events on `status` while the solve runs and drop
/// the sender when the solve finishes, which ends the stream. They should stop
/// work promptly once `cancel` fires.
#[async_trait]
pub trait SolveClient: Send + Sync {
    async fn solve(
        &self,
        request: SolveRequest,
        cancel: CancellationToken,
        status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse, SolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DockerAuthProvider;

    #[test]
    fn test_push_image_entry() {
        let entry = ExportEntry::push_image("reg.example.com/app:v1");
        assert_eq!(entry.r#type, EXPORTER_IMAGE);
        assert_eq!(entry.attrs["push"], "true");
        assert_eq!(entry.attrs["name"], "reg.example.com/app:v1");
        assert!(entry.output.is_none());
    }

    #[test]
    fn test_discard_entry() {
        let entry = ExportEntry::discard(EXPORTER_OCI);
        assert_eq!(entry.output, Some(ExportOutput::Discard));
        assert!(entry.attrs.is_empty());
    }

    #[test]
    fn test_bind_context() {
        let mut request = SolveRequest::dockerfile();
        request.bind_context(PathBuf::from("/tmp/ctx"));

        assert_eq!(request.frontend, DOCKERFILE_FRONTEND);
        assert_eq!(request.local_dirs[LOCAL_CONTEXT], PathBuf::from("/tmp/ctx"));
        assert_eq!(request.local_dirs[LOCAL_DOCKERFILE], PathBuf::from("/tmp/ctx"));
    }

    #[test]
    fn test_unique_refs() {
        assert_ne!(SolveRequest::dockerfile().r#ref, SolveRequest::dockerfile().r#ref);
    }

    #[test]
    fn test_serialization_skips_session() {
        let mut request = SolveRequest::dockerfile()
            .with_attachable(SessionAttachable::Auth(Arc::new(DockerAuthProvider::anonymous())));
        request.cache_exports.push(CacheOptionsEntry::inline());
        request
            .cache_imports
            .push(CacheOptionsEntry::registry("reg.example.com/ns/app"));

        assert!(request.credentials().is_some());

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("session").is_none());
        assert_eq!(json["cacheExports"][0], serde_json::json!({"type": "inline"}));
        assert_eq!(
            json["cacheImports"][0]["attrs"]["ref"],
            "reg.example.com/ns/app"
        );
    }
}

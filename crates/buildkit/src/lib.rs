pub mod auth;
pub mod client;
pub mod context;
pub mod progress;
pub mod runner;
pub mod solve;

pub use auth::{AuthError, CredentialProvider, Credentials, DockerAuthProvider};
pub use client::{assemble_build, BuildError, BuildRequest, RemoteClient, CONTEXT_FETCH_TIMEOUT};
pub use context::{ArchiveContextFetcher, ContextFetcher, Extraction, FetchError};
pub use progress::{ProgressDisplay, ProgressTracker};
pub use runner::{run_solve, STATUS_CHANNEL_CAPACITY};
pub use solve::{
    CacheOptionsEntry, ExportEntry, ExportOutput, SessionAttachable, SolveClient, SolveError,
    SolveRequest, SolveResponse, SolveStatus, Vertex, VertexLog, VertexStatus, VertexWarning,
};

//! Remote build orchestration: turns build requests into solve requests and runs them.

use kiln_core::{ImageBuildSpec, ImageReference, ReferenceError};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{CredentialProvider, DockerAuthProvider};
use crate::context::{ContextFetcher, FetchError};
use crate::progress::ProgressTracker;
use crate::runner::run_solve;
use crate::solve::{
    CacheOptionsEntry, ExportEntry, SessionAttachable, SolveClient, SolveError, SolveRequest,
    SolveResponse, EXPORTER_OCI,
};

pub const CONTEXT_FETCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const BUILD_DIR_PREFIX: &str = "kiln-build-";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to create build dir: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("failed to fetch build context: {0}")]
    ContextFetch(#[from] FetchError),

    #[error("build context fetch exceeded {0:?}")]
    ContextTimeout(Duration),

    #[error("invalid image reference {image:?}: {source}")]
    InvalidImage {
        image: String,
        #[source]
        source: ReferenceError,
    },

    #[error("build request must name at least one image")]
    NoImages,

    #[error("invalid build arg {0:?}, expected KEY=VALUE")]
    InvalidBuildArg(String),

    #[error("failed to create dockerfile: {0}")]
    Dockerfile(#[source] std::io::Error),

    #[error("buildkit solve issue: {0}")]
    Solve(#[from] SolveError),

    #[error("build cancelled")]
    Cancelled,
}

/// What to build: a context archive, the images to push, and cache behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub context: String,
    pub images: Vec<String>,
    pub build_args: Vec<String>,
    pub cache_export: bool,
    pub cache_import: bool,
}

impl BuildRequest {
    pub fn new(context: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            context: context.into(),
            images,
            build_args: Vec::new(),
            cache_export: true,
            cache_import: true,
        }
    }

    pub fn with_build_args(mut self, build_args: Vec<String>) -> Self {
        self.build_args = build_args;
        self
    }

    pub fn without_cache_export(mut self) -> Self {
        self.cache_export = false;
        self
    }

    pub fn without_cache_import(mut self) -> Self {
        self.cache_import = false;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.images.is_empty() {
            return Err(BuildError::NoImages);
        }

        for image in &self.images {
            ImageReference::parse(image).map_err(|source| BuildError::InvalidImage {
                image: image.clone(),
                source,
            })?;
        }

        self.frontend_build_args().map(|_| ())
    }

    /// Registry reference layers are imported from when cache import is enabled.
    ///
    /// Derived from the first image only, with its tag stripped. This assumes every
    /// image in the request shares a repository; multi-repository pushes will only
    /// import cache from the first one.
    pub fn cache_import_ref(&self) -> Result<String, BuildError> {
        let first = self.images.first().ok_or(BuildError::NoImages)?;
        let reference = ImageReference::parse(first).map_err(|source| BuildError::InvalidImage {
            image: first.clone(),
            source,
        })?;
        Ok(reference.name())
    }

    /// Build args as `build-arg:KEY` frontend attributes.
    pub fn frontend_build_args(&self) -> Result<BTreeMap<String, String>, BuildError> {
        self.build_args
            .iter()
            .map(|arg| match arg.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((format!("build-arg:{}", key.trim()), value.to_string()))
                }
                _ => Err(BuildError::InvalidBuildArg(arg.clone())),
            })
            .collect()
    }
}

impl From<&ImageBuildSpec> for BuildRequest {
    fn from(spec: &ImageBuildSpec) -> Self {
        Self {
            context: spec.context.clone(),
            images: spec.images.clone(),
            build_args: spec.build_args.clone(),
            cache_export: !spec.disable_cache_export,
            cache_import: !spec.disable_cache_import,
        }
    }
}

/// Applies a build request to a base solve request whose context is `contents_dir`.
pub fn assemble_build(
    request: &BuildRequest,
    contents_dir: PathBuf,
    mut solve: SolveRequest,
) -> Result<SolveRequest, BuildError> {
    solve.bind_context(contents_dir);
    solve.frontend_attrs.extend(request.frontend_build_args()?);

    solve
        .exports
        .extend(request.images.iter().map(|name| ExportEntry::push_image(name)));

    if request.cache_export {
        solve.cache_exports = vec![CacheOptionsEntry::inline()];
    }

    if request.cache_import {
        let cache_ref = request.cache_import_ref()?;
        debug!(cache_ref = %cache_ref, "Importing registry cache");
        solve.cache_imports = vec![CacheOptionsEntry::registry(&cache_ref)];
    }

    Ok(solve)
}

/// Drives a remote build daemon. Collaborators are injected; the client holds no
/// per-call state and may be shared across concurrent builds.
pub struct RemoteClient {
    solver: Arc<dyn SolveClient>,
    fetcher: Arc<dyn ContextFetcher>,
    credentials: Arc<dyn CredentialProvider>,
    cancel: CancellationToken,
    temp_root: Option<PathBuf>,
    quiet: bool,
    verbose: bool,
}

impl RemoteClient {
    pub fn new(solver: Arc<dyn SolveClient>, fetcher: Arc<dyn ContextFetcher>) -> Self {
        Self {
            solver,
            fetcher,
            credentials: Arc::new(DockerAuthProvider::anonymous()),
            cancel: CancellationToken::new(),
            temp_root: None,
            quiet: false,
            verbose: false,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Cancelling `token` aborts in-flight context fetches and solves.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Parent directory for per-call build directories (defaults to the system temp dir).
    pub fn with_temp_root(mut self, root: PathBuf) -> Self {
        self.temp_root = Some(root);
        self
    }

    pub fn with_progress(mut self, quiet: bool, verbose: bool) -> Self {
        self.quiet = quiet;
        self.verbose = verbose;
        self
    }

    /// Primes the daemon's cache by solving `FROM image`; the output is discarded.
    #[instrument(skip(self))]
    pub async fn cache(&self, image: &str) -> Result<SolveResponse, BuildError> {
        ImageReference::parse(image).map_err(|source| {
            error!(error = %source, class = "image", "Invalid cache image");
            BuildError::InvalidImage {
                image: image.to_string(),
                source,
            }
        })?;

        info!("Caching image");
        self.solve_with(&format!("cache of {}", image), |build_dir, mut solve| async move {
            let dockerfile = build_dir.join("Dockerfile");
            tokio::fs::write(&dockerfile, format!("FROM {}", image))
                .await
                .map_err(BuildError::Dockerfile)?;

            solve.bind_context(build_dir);
            solve.exports = vec![ExportEntry::discard(EXPORTER_OCI)];
            Ok(solve)
        })
        .await
    }

    /// Fetches the request's context, builds it and pushes every requested image.
    #[instrument(skip(self, request), fields(context = %request.context, images = request.images.len()))]
    pub async fn build(&self, request: &BuildRequest) -> Result<SolveResponse, BuildError> {
        request.validate().map_err(|e| {
            error!(error = %e, class = "request", "Rejected build request");
            e
        })?;

        info!(cache_export = request.cache_export, cache_import = request.cache_import, "Building images");
        let description = format!("build of {}", request.images.join(", "));

        self.solve_with(&description, |build_dir, solve| async move {
            let extraction = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
                result = tokio::time::timeout(
                    CONTEXT_FETCH_TIMEOUT,
                    self.fetcher.fetch_and_extract(&request.context, &build_dir, CONTEXT_FETCH_TIMEOUT),
                ) => match result {
                    Ok(Ok(extraction)) => extraction,
                    Ok(Err(e)) => {
                        error!(error = %e, class = "context", "Failed to fetch build context");
                        return Err(BuildError::ContextFetch(e));
                    }
                    Err(_) => {
                        error!(timeout = ?CONTEXT_FETCH_TIMEOUT, class = "context", "Build context fetch timed out");
                        return Err(BuildError::ContextTimeout(CONTEXT_FETCH_TIMEOUT));
                    }
                },
            };
            debug!(contents_dir = %extraction.contents_dir.display(), "Extracted build context");

            assemble_build(request, extraction.contents_dir, solve)
        })
        .await
    }

    fn base_request(&self) -> SolveRequest {
        SolveRequest::dockerfile()
            .with_attachable(SessionAttachable::Auth(self.credentials.clone()))
    }

    fn create_build_dir(&self) -> Result<tempfile::TempDir, BuildError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(BUILD_DIR_PREFIX);
        match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(BuildError::TempDir)
    }

    /// Runs `assemble` against a fresh build directory, then solves the result.
    /// The directory is removed when this returns, whatever the outcome.
    async fn solve_with<F, Fut>(
        &self,
        description: &str,
        assemble: F,
    ) -> Result<SolveResponse, BuildError>
    where
        F: FnOnce(PathBuf, SolveRequest) -> Fut,
        Fut: Future<Output = Result<SolveRequest, BuildError>>,
    {
        let build_dir = self.create_build_dir().map_err(|e| {
            error!(error = %e, class = "io", "Failed to create build dir");
            e
        })?;
        debug!(build_dir = %build_dir.path().display(), "Created build dir");

        let result = self.assemble_and_run(&build_dir, description, assemble).await;
        if let Err(BuildError::Solve(e)) = &result {
            error!(error = %e, class = "solve", "Solve failed");
        }

        let path = build_dir.path().to_path_buf();
        if let Err(e) = build_dir.close() {
            warn!(error = %e, build_dir = %path.display(), "Failed to remove build dir");
        }

        result
    }

    async fn assemble_and_run<F, Fut>(
        &self,
        build_dir: &tempfile::TempDir,
        description: &str,
        assemble: F,
    ) -> Result<SolveResponse, BuildError>
    where
        F: FnOnce(PathBuf, SolveRequest) -> Fut,
        Fut: Future<Output = Result<SolveRequest, BuildError>>,
    {
        let solve = assemble(build_dir.path().to_path_buf(), self.base_request()).await?;
        debug!(
            solve_ref = %solve.r#ref,
            exports = solve.exports.len(),
            cache_exports = solve.cache_exports.len(),
            cache_imports = solve.cache_imports.len(),
            "Assembled solve request"
        );

        let tracker = ProgressTracker::new(self.quiet, self.verbose);
        tracker.solve_started(description);

        Ok(run_solve(self.solver.as_ref(), solve, &tracker, &self.cancel).await?)
    }
}

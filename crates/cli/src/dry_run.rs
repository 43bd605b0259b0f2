//! Solve client that prints requests instead of submitting them.

use async_trait::async_trait;
use kiln_buildkit::{SolveClient, SolveError, SolveRequest, SolveResponse, SolveStatus};
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct DryRunSolver<W> {
    out: Mutex<W>,
}

impl DryRunSolver<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DryRunSolver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<W: Write + Send> SolveClient for DryRunSolver<W> {
    async fn solve(
        &self,
        request: SolveRequest,
        cancel: CancellationToken,
        _status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse, SolveError> {
        if cancel.is_cancelled() {
            return Err(SolveError::Cancelled);
        }

        let json = serde_json::to_string_pretty(&request)
            .map_err(|e| SolveError::Daemon(format!("failed to render solve request: {}", e)))?;

        let mut out = self
            .out
            .lock()
            .map_err(|_| SolveError::Daemon("output lock poisoned".to_string()))?;
        writeln!(out, "{}", json).map_err(|e| SolveError::Progress(e.to_string()))?;
        out.flush().map_err(|e| SolveError::Progress(e.to_string()))?;

        debug!("Dry run of solve {} printed", request.r#ref);
        Ok(SolveResponse::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_buildkit::{
        run_solve, ArchiveContextFetcher, BuildRequest, ProgressTracker, RemoteClient,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prints_request_json() {
        let solver = DryRunSolver::new(Vec::new());
        let mut request = SolveRequest::dockerfile();
        request
            .frontend_attrs
            .insert("build-arg:A".to_string(), "1".to_string());

        run_solve(
            &solver,
            request,
            &ProgressTracker::new(true, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let printed: serde_json::Value = serde_json::from_slice(&solver.into_inner()).unwrap();
        assert_eq!(printed["frontend"], "dockerfile.v0");
        assert_eq!(printed["frontendAttrs"]["build-arg:A"], "1");
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_printed() {
        let solver = DryRunSolver::new(Vec::new());
        let token = CancellationToken::new();
        token.cancel();

        let (tx, _rx) = mpsc::channel(1);
        let result = solver.solve(SolveRequest::dockerfile(), token, tx).await;

        assert!(matches!(result, Err(SolveError::Cancelled)));
        assert!(solver.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_plan_with_local_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("ctx.tar");
        {
            let mut builder = tar::Builder::new(std::fs::File::create(&archive).unwrap());
            let content = b"FROM alpine\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, "Dockerfile", &content[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let solver = Arc::new(DryRunSolver::new(Vec::new()));
        let client = RemoteClient::new(solver.clone(), Arc::new(ArchiveContextFetcher::new()))
            .with_temp_root(dir.path().to_path_buf())
            .with_progress(true, false);

        let request = BuildRequest::new(
            archive.display().to_string(),
            vec!["reg.example.com/ns/app:v1".to_string()],
        );
        client.build(&request).await.unwrap();
        drop(client);

        let solver = Arc::try_unwrap(solver).ok().unwrap();
        let printed: serde_json::Value = serde_json::from_slice(&solver.into_inner()).unwrap();
        assert_eq!(printed["exports"][0]["attrs"]["name"], "reg.example.com/ns/app:v1");
        assert_eq!(
            printed["cacheImports"][0]["attrs"]["ref"],
            "reg.example.com/ns/app"
        );
    }
}

//! Runs a solve and its progress stream as one fail-fast pair.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::ProgressDisplay;
use crate::solve::{SolveClient, SolveError, SolveRequest, SolveResponse, SolveStatus};

pub const STATUS_CHANNEL_CAPACITY: usize = 100;

/// Shared cancellation plus first-error slot for a group of sibling futures.
struct FailFast {
    token: CancellationToken,
    first_error: Mutex<Option<SolveError>>,
}

impl FailFast {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            first_error: Mutex::new(None),
        }
    }

    /// Records `err` unless a sibling failed first, then cancels the group.
    fn fail(&self, err: SolveError) {
        let mut slot = self.first_error.lock().unwrap();
        if slot.is_none() {
            debug!("Solve group failing: {}", err);
            *slot = Some(err);
        }
        self.token.cancel();
    }

    fn take_error(&self) -> Option<SolveError> {
        self.first_error.lock().unwrap().take()
    }
}

/// Submits `request` and drains its status stream into `display` concurrently.
///
/// Whichever side fails first cancels the other. Both sides are driven on the
/// caller's task, so nothing keeps running once this returns. Cancelling
/// `parent` aborts the pair.
pub async fn run_solve(
    client: &dyn SolveClient,
    request: SolveRequest,
    display: &dyn ProgressDisplay,
    parent: &CancellationToken,
) -> Result<SolveResponse, SolveError> {
    let group = FailFast::new(parent.child_token());
    let (tx, mut rx) = mpsc::channel::<SolveStatus>(STATUS_CHANNEL_CAPACITY);

    let solve = async {
        let token = group.token.clone();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SolveError::Cancelled),
            result = client.solve(request, token.clone(), tx) => result,
        };

        match result {
            Ok(response) => Some(response),
            Err(err) => {
                group.fail(err);
                None
            }
        }
    };

    let progress = async {
        loop {
            tokio::select! {
                biased;
                _ = group.token.cancelled() => {
                    group.fail(SolveError::Cancelled);
                    break;
                }
                status = rx.recv() => match status {
                    Some(status) => {
                        if let Err(err) = display.display(status) {
                            group.fail(err);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    };

    let (response, ()) = tokio::join!(solve, progress);

    if let Some(err) = group.take_error() {
        display.solve_failed(&err.to_string());
        return Err(err);
    }

    display.solve_completed();
    response.ok_or(SolveError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted daemon: emits `events` statuses, then succeeds or fails.
    struct ScriptedSolver {
        events: usize,
        fail_with: Option<String>,
        hang: bool,
    }

    impl ScriptedSolver {
        fn succeeding(events: usize) -> Self {
            Self {
                events,
                fail_with: None,
                hang: false,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::succeeding(1)
            }
        }

        fn hanging(events: usize) -> Self {
            Self {
                hang: true,
                ..Self::succeeding(events)
            }
        }
    }

    #[async_trait]
    impl SolveClient for ScriptedSolver {
        async fn solve(
            &self,
            _request: SolveRequest,
            cancel: CancellationToken,
            status: mpsc::Sender<SolveStatus>,
        ) -> Result<SolveResponse, SolveError> {
            for _ in 0..self.events {
                if status.send(SolveStatus::default()).await.is_err() {
                    break;
                }
            }

            if let Some(message) = &self.fail_with {
                return Err(SolveError::Daemon(message.clone()));
            }

            if self.hang {
                cancel.cancelled().await;
                return Err(SolveError::Cancelled);
            }

            let mut response = SolveResponse::default();
            response
                .exporter_response
                .insert("containerimage.digest".to_string(), "sha256:abc".to_string());
            Ok(response)
        }
    }

    #[derive(Default)]
    struct CountingDisplay {
        seen: AtomicUsize,
        fail_after: Option<usize>,
        completed: AtomicBool,
        failed: AtomicBool,
    }

    impl ProgressDisplay for CountingDisplay {
        fn display(&self, _status: SolveStatus) -> Result<(), SolveError> {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_after {
                Some(limit) if seen >= limit => {
                    Err(SolveError::Progress("console closed".to_string()))
                }
                _ => Ok(()),
            }
        }

        fn solve_completed(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }

        fn solve_failed(&self, _error: &str) {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_success_drains_every_event() {
        let solver = ScriptedSolver::succeeding(5);
        let display = CountingDisplay::default();

        let response = run_solve(
            &solver,
            SolveRequest::dockerfile(),
            &display,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.exporter_response["containerimage.digest"], "sha256:abc");
        assert_eq!(display.seen.load(Ordering::SeqCst), 5);
        assert!(display.completed.load(Ordering::SeqCst));
        assert!(!display.failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_daemon_error_is_returned() {
        let solver = ScriptedSolver::failing("failed to push");
        let display = CountingDisplay::default();

        let err = run_solve(
            &solver,
            SolveRequest::dockerfile(),
            &display,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SolveError::Daemon(ref m) if m == "failed to push"));
        assert!(display.failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_display_failure_cancels_solve() {
        let solver = ScriptedSolver::hanging(3);
        let display = CountingDisplay {
            fail_after: Some(1),
            ..Default::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_solve(
                &solver,
                SolveRequest::dockerfile(),
                &display,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("solve pair should stop after the display fails");

        assert!(matches!(result, Err(SolveError::Progress(_))));
        assert_eq!(display.seen.load(Ordering::SeqCst), 1);
        assert!(display.failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_both() {
        let solver = ScriptedSolver::hanging(0);
        let display = CountingDisplay::default();
        let parent = CancellationToken::new();

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_solve(&solver, SolveRequest::dockerfile(), &display, &parent),
        )
        .await
        .expect("cancellation should stop the solve");

        assert!(matches!(result, Err(SolveError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_token_does_not_cancel_parent() {
        let solver = ScriptedSolver::failing("boom");
        let display = CountingDisplay::default();
        let parent = CancellationToken::new();

        let _ = run_solve(&solver, SolveRequest::dockerfile(), &display, &parent).await;

        assert!(!parent.is_cancelled());
    }
}

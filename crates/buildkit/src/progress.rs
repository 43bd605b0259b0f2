//! Rendering of the solve status stream.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::solve::{SolveError, SolveStatus, Vertex};

/// Sink for the solve status stream.
pub trait ProgressDisplay: Send + Sync {
    fn display(&self, status: SolveStatus) -> Result<(), SolveError>;

    fn solve_completed(&self) {}

    fn solve_failed(&self, _error: &str) {}
}

#[derive(Debug, Copy, Clone)]
enum LogStream {
    Stdout = 1,
    Stderr = 2,
}

impl LogStream {
    fn from_i64(value: i64) -> Self {
        if value == 2 {
            Self::Stderr
        } else {
            Self::Stdout
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn log_line(&self, vertex: &str, line: &str) {
        let msg = format!("  [{}:{}] {}", vertex, self.label(), line);
        match self {
            Self::Stdout => info!("{}", msg),
            Self::Stderr => warn!("{}", msg),
        }
    }
}

#[derive(Default)]
struct ProgressState {
    vertices: HashMap<String, Vertex>,
    total_started: usize,
    total_cached: usize,
    total_completed: usize,
    total_errored: usize,
}

/// Renders solve status events as log lines.
pub struct ProgressTracker {
    start_time: Instant,
    quiet: bool,
    verbose: bool,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
            verbose,
            state: Mutex::new(ProgressState::default()),
        }
    }

    pub fn solve_started(&self, description: &str) {
        if !self.quiet {
            info!("Starting {}", description);
        }
        debug!("Solve started");
    }

    fn vertex_name<'a>(state: &'a ProgressState, digest: &str) -> &'a str {
        state
            .vertices
            .get(digest)
            .map(|v| v.name.as_str())
            .unwrap_or("<unknown>")
    }

    fn process_status(&self, status: SolveStatus) {
        let mut state = self.state.lock().unwrap();

        for vertex in status.vertexes {
            let digest = vertex.digest.clone();
            let previous = state.vertices.get(&digest);

            let was_started = previous.is_some();
            let was_cached = previous.map(|v| v.cached).unwrap_or(false);
            let was_completed = previous.map(|v| v.completed.is_some()).unwrap_or(false);
            let had_error = previous.map(|v| !v.error.is_empty()).unwrap_or(false);

            if vertex.started.is_some() && !was_started {
                state.total_started += 1;
                if !self.quiet {
                    info!("Started [{}] {}", state.total_started, vertex.name);
                }
            }

            if vertex.cached && !was_cached {
                state.total_cached += 1;
                if !self.quiet {
                    info!("  CACHED {}", vertex.name);
                }
            }

            if vertex.completed.is_some() && !was_completed {
                state.total_completed += 1;
                if !self.quiet {
                    info!("  DONE {}", vertex.name);
                }
            }

            if !vertex.error.is_empty() && !had_error {
                state.total_errored += 1;
                error!("  ERROR {} - {}", vertex.name, vertex.error);
            }

            state.vertices.insert(digest, vertex);
        }

        if self.verbose {
            for status_update in status.statuses.iter().filter(|s| s.total > 0) {
                info!(
                    "  {} {} / {} {}",
                    Self::vertex_name(&state, &status_update.vertex),
                    status_update.current,
                    status_update.total,
                    status_update.name
                );
            }
        }

        for log in status.logs {
            let msg = std::str::from_utf8(&log.msg)
                .map(Cow::Borrowed)
                .unwrap_or_else(|_| String::from_utf8_lossy(&log.msg));
            let vertex_name = Self::vertex_name(&state, &log.vertex);

            if !self.quiet {
                let stream = LogStream::from_i64(log.stream);
                for line in msg.lines().filter(|l| !l.trim().is_empty()) {
                    stream.log_line(vertex_name, line);
                }
            }

            debug!(
                "Vertex {} log (stream {}) {}",
                log.vertex,
                log.stream,
                msg.trim_end()
            );
        }

        for warning in status.warnings {
            let msg = String::from_utf8_lossy(&warning.short);
            let vertex_name = Self::vertex_name(&state, &warning.vertex);

            if !self.quiet {
                warn!("  WARNING [{}] {}", vertex_name, msg.trim_end());
            }
        }
    }
}

impl ProgressDisplay for ProgressTracker {
    fn display(&self, status: SolveStatus) -> Result<(), SolveError> {
        self.process_status(status);
        Ok(())
    }

    fn solve_completed(&self) {
        let duration = self.start_time.elapsed();
        let state = self.state.lock().unwrap();

        if !self.quiet {
            info!("Solve completed in {:.2}s", duration.as_secs_f64());
            info!(
                "  Vertices {} started, {} cached, {} completed, {} errors",
                state.total_started, state.total_cached, state.total_completed, state.total_errored
            );

            if state.total_cached > 0 && state.total_completed > 0 {
                let cache_ratio =
                    (state.total_cached as f64 / state.total_completed as f64) * 100.0;
                info!("  Cache hit ratio {:.1}%", cache_ratio);
            }
        }
    }

    fn solve_failed(&self, error: &str) {
        let duration = self.start_time.elapsed();
        let state = self.state.lock().unwrap();

        error!("Solve failed after {:.2}s", duration.as_secs_f64());
        error!("  Error {}", error);

        if state.total_errored > 0 {
            error!("  {} vertices reported errors", state.total_errored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solve::{VertexLog, VertexWarning};
    use chrono::Utc;

    fn mock_vertex(digest: &str, name: &str) -> Vertex {
        Vertex {
            digest: digest.to_string(),
            name: name.to_string(),
            inputs: vec![],
            cached: false,
            started: Some(Utc::now()),
            completed: None,
            error: String::new(),
        }
    }

    fn mock_cached_vertex(digest: &str, name: &str) -> Vertex {
        Vertex {
            cached: true,
            completed: Some(Utc::now()),
            ..mock_vertex(digest, name)
        }
    }

    fn mock_status(vertexes: Vec<Vertex>) -> SolveStatus {
        SolveStatus {
            vertexes,
            ..Default::default()
        }
    }

    #[test]
    fn test_vertex_tracking() {
        let tracker = ProgressTracker::new(true, false);
        tracker
            .display(mock_status(vec![mock_vertex("sha256:abc", "FROM alpine")]))
            .unwrap();

        let state = tracker.state.lock().unwrap();
        assert_eq!(state.total_started, 1);
        assert_eq!(state.total_cached, 0);
        assert_eq!(state.total_completed, 0);
    }

    #[test]
    fn test_cached_vertex() {
        let tracker = ProgressTracker::new(true, false);
        tracker
            .display(mock_status(vec![mock_cached_vertex("sha256:c", "cached")]))
            .unwrap();

        let state = tracker.state.lock().unwrap();
        assert_eq!(state.total_started, 1);
        assert_eq!(state.total_cached, 1);
        assert_eq!(state.total_completed, 1);
    }

    #[test]
    fn test_vertex_state_transitions_do_not_double_count() {
        let tracker = ProgressTracker::new(true, false);
        let vertex = mock_vertex("t", "RUN make");
        tracker.display(mock_status(vec![vertex.clone()])).unwrap();

        let completed = Vertex {
            completed: Some(Utc::now()),
            ..vertex
        };
        tracker.display(mock_status(vec![completed.clone()])).unwrap();
        tracker.display(mock_status(vec![completed])).unwrap();

        let state = tracker.state.lock().unwrap();
        assert_eq!(state.total_started, 1);
        assert_eq!(state.total_completed, 1);
    }

    #[test]
    fn test_error_counted_once() {
        let tracker = ProgressTracker::new(true, false);
        let mut vertex = mock_vertex("e", "RUN false");
        vertex.error = "exit code 1".to_string();
        tracker.display(mock_status(vec![vertex.clone()])).unwrap();

        vertex.error = "still failing".to_string();
        tracker.display(mock_status(vec![vertex])).unwrap();

        assert_eq!(tracker.state.lock().unwrap().total_errored, 1);
    }

    #[test]
    fn test_vertex_without_started_time() {
        let tracker = ProgressTracker::new(true, false);
        let vertex = Vertex {
            started: None,
            ..mock_vertex("pending", "queued")
        };
        tracker.display(mock_status(vec![vertex])).unwrap();

        assert_eq!(tracker.state.lock().unwrap().total_started, 0);
    }

    #[test]
    fn test_logs_and_warnings_for_unknown_vertex() {
        let tracker = ProgressTracker::new(false, true);
        let status = SolveStatus {
            logs: vec![VertexLog {
                vertex: "missing".to_string(),
                stream: 2,
                msg: b"line one\n\nline two".to_vec(),
            }],
            warnings: vec![VertexWarning {
                vertex: "missing".to_string(),
                short: b"deprecated syntax".to_vec(),
            }],
            ..Default::default()
        };

        assert!(tracker.display(status).is_ok());
        tracker.solve_completed();
        tracker.solve_failed("boom");
    }
}

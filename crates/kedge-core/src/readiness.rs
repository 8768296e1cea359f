//! Readiness detection for asynchronously-starting background services.
//!
//! A dev dependency (database, queue, cache) runs as a named detached
//! container whose startup completion is only observable as a marker
//! substring in its log stream. [`ReadinessEnsurer::ensure`] drives the
//! Absent/Stopped -> Starting -> Ready transitions and blocks until the
//! marker appears or the wait policy's deadline expires.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::engine::{ContainerEngine, ContainerState, RunSpec};
use crate::error::{KedgeError, Result};
use crate::process::LogStream;

/// One ensured background service: identity is `name`; at most one
/// logical instance per name exists in the target environment.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Substring expected in the log stream once startup has finished.
    pub ready_marker: String,
    pub log_stream: LogStream,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        ready_marker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            args: Vec::new(),
            env: Vec::new(),
            ready_marker: ready_marker.into(),
            log_stream: LogStream::Stdout,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn on_stderr(mut self) -> Self {
        self.log_stream = LogStream::Stderr;
        self
    }

    fn run_spec(&self) -> RunSpec {
        let mut spec = RunSpec::new(&self.name, &self.image);
        spec.args = self.args.clone();
        spec.env = self.env.clone();
        spec.restart_always = true;
        spec
    }
}

/// Bound on the marker wait. Blocking forever is available via
/// [`WaitPolicy::indefinite`], but the default is a 300 second deadline
/// surfaced as [`KedgeError::ReadinessTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl WaitPolicy {
    pub fn indefinite() -> Self {
        Self { timeout: None }
    }

    pub fn bounded(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub struct ReadinessEnsurer<'a> {
    engine: &'a dyn ContainerEngine,
    wait: WaitPolicy,
}

impl<'a> ReadinessEnsurer<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self {
            engine,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait(engine: &'a dyn ContainerEngine, wait: WaitPolicy) -> Self {
        Self { engine, wait }
    }

    /// Ensure the named service is running and has logged its readiness
    /// marker. Idempotent and keyed on the service name: an already
    /// running instance is left untouched. No lock is taken; concurrent
    /// callers racing on absent -> start rely on the engine's own
    /// duplicate-name rejection.
    pub fn ensure(&self, spec: &ServiceSpec) -> Result<()> {
        tracing::debug!(service = %spec.name, "checking if service is running");
        match self.engine.inspect(&spec.name) {
            ContainerState::Running => {
                tracing::debug!(service = %spec.name, "already running");
                Ok(())
            }
            state @ (ContainerState::Stopped | ContainerState::Absent) => {
                if state == ContainerState::Stopped {
                    tracing::debug!(service = %spec.name, "found stopped instance, recreating");
                }
                self.start_and_wait(spec)
            }
        }
    }

    fn start_and_wait(&self, spec: &ServiceSpec) -> Result<()> {
        // Best-effort removal of any stale instance; "No such container"
        // and friends are not actionable here.
        if let Err(e) = self.engine.remove(&spec.name) {
            tracing::debug!(service = %spec.name, "stale removal skipped: {e}");
        }
        tracing::debug!(service = %spec.name, "starting");
        self.engine.run_detached(&spec.run_spec())?;
        tracing::debug!(
            service = %spec.name,
            marker = %spec.ready_marker,
            "waiting for readiness marker (possibly downloading image)"
        );
        let lines = self.engine.log_lines(&spec.name, spec.log_stream)?;
        wait_for_marker(lines, &spec.ready_marker, self.wait, &spec.name)?;
        tracing::debug!(service = %spec.name, "ready");
        Ok(())
    }
}

/// How often a bounded scan wakes up to notice a pending interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// Scan `lines` until one contains `marker`.
///
/// With a bounded policy the reader runs on a helper thread and the scan
/// polls a channel, so a stream that goes silent (not just one that keeps
/// printing unrelated lines) still hits the deadline.
///
/// A SIGINT delivered during the wait surfaces as
/// [`KedgeError::Interrupted`]: the handler forwards the signal to the
/// registered log follower, and the scan checks the flag between lines,
/// on every wakeup, and when the stream ends.
pub fn wait_for_marker(
    lines: impl Iterator<Item = std::io::Result<String>> + Send + 'static,
    marker: &str,
    wait: WaitPolicy,
    name: &str,
) -> Result<()> {
    wait_for_marker_inner(lines, marker, wait, name, crate::process::take_interrupted)
}

fn wait_for_marker_inner(
    lines: impl Iterator<Item = std::io::Result<String>> + Send + 'static,
    marker: &str,
    wait: WaitPolicy,
    name: &str,
    interrupted: impl Fn() -> bool,
) -> Result<()> {
    match wait.timeout {
        None => {
            for line in lines {
                if interrupted() {
                    return Err(KedgeError::Interrupted);
                }
                let line = line?;
                if line.contains(marker) {
                    return Ok(());
                }
            }
            if interrupted() {
                return Err(KedgeError::Interrupted);
            }
            Err(KedgeError::LogStreamEnded(name.to_string()))
        }
        Some(timeout) => {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                for line in lines {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
            let deadline = Instant::now() + timeout;
            loop {
                if interrupted() {
                    return Err(KedgeError::Interrupted);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(KedgeError::ReadinessTimeout {
                        name: name.to_string(),
                        marker: marker.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                match rx.recv_timeout(remaining.min(INTERRUPT_POLL)) {
                    Ok(Ok(line)) => {
                        if line.contains(marker) {
                            return Ok(());
                        }
                    }
                    Ok(Err(e)) => return Err(KedgeError::Io(e)),
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        // A stream cut short by the interrupt forwarding is
                        // a cancellation, not a startup failure.
                        if interrupted() {
                            return Err(KedgeError::Interrupted);
                        }
                        return Err(KedgeError::LogStreamEnded(name.to_string()));
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;

    fn spec() -> ServiceSpec {
        ServiceSpec::new("dev-postgres", "postgres:14", "ready for start up")
    }

    #[test]
    fn already_running_is_a_noop() {
        let engine = FakeEngine::new();
        engine.set_state("dev-postgres", ContainerState::Running);
        ReadinessEnsurer::new(&engine).ensure(&spec()).unwrap();
        assert_eq!(engine.call_count("run "), 0);
        assert_eq!(engine.call_count("logs"), 0);
    }

    #[test]
    fn absent_service_is_started_and_waited_on() {
        let engine = FakeEngine::new();
        engine.set_logs(
            "dev-postgres",
            LogStream::Stdout,
            &["booting", "init done; ready for start up."],
        );
        ReadinessEnsurer::new(&engine).ensure(&spec()).unwrap();
        let calls = engine.calls();
        assert!(calls.contains(&"run dev-postgres postgres:14".to_string()));
        assert!(calls.contains(&"logs dev-postgres".to_string()));
    }

    #[test]
    fn stopped_service_is_removed_then_recreated() {
        let engine = FakeEngine::new();
        engine.set_state("dev-postgres", ContainerState::Stopped);
        engine.set_logs("dev-postgres", LogStream::Stdout, &["ready for start up"]);
        ReadinessEnsurer::new(&engine).ensure(&spec()).unwrap();
        assert_eq!(engine.call_count("rm dev-postgres"), 1);
        assert_eq!(engine.call_count("run dev-postgres"), 1);
    }

    #[test]
    fn ensure_twice_converges_on_one_instance() {
        let engine = FakeEngine::new();
        engine.set_logs("dev-postgres", LogStream::Stdout, &["ready for start up"]);
        let ensurer = ReadinessEnsurer::new(&engine);
        ensurer.ensure(&spec()).unwrap();
        ensurer.ensure(&spec()).unwrap();
        // Second ensure found the instance running and started nothing.
        assert_eq!(engine.call_count("run dev-postgres"), 1);
    }

    #[test]
    fn marker_scan_consumes_only_up_to_the_marker() {
        let lines = vec!["a", "b", "marker here", "never read"];
        let mut consumed = 0usize;
        let iter = lines.into_iter().map(move |l| {
            consumed += 1;
            assert!(consumed <= 3, "read past the marker");
            Ok(l.to_string())
        });
        wait_for_marker(iter, "marker", WaitPolicy::indefinite(), "svc").unwrap();
    }

    #[test]
    fn marker_never_appearing_in_finite_stream_is_an_error() {
        let iter = vec!["a", "b"].into_iter().map(|l| Ok(l.to_string()));
        let err =
            wait_for_marker(iter, "marker", WaitPolicy::indefinite(), "svc").unwrap_err();
        assert!(matches!(err, KedgeError::LogStreamEnded(_)));
    }

    #[test]
    fn silent_stream_hits_the_deadline() {
        // An iterator that blocks forever: recv on a channel whose sender
        // is parked in a leaked thread.
        let (tx, rx) = mpsc::channel::<std::io::Result<String>>();
        std::thread::spawn(move || {
            let _tx = tx;
            std::thread::sleep(Duration::from_secs(3600));
        });
        let iter = std::iter::from_fn(move || rx.recv().ok());
        let err = wait_for_marker(
            iter,
            "marker",
            WaitPolicy::bounded(Duration::from_millis(50)),
            "svc",
        )
        .unwrap_err();
        assert!(matches!(err, KedgeError::ReadinessTimeout { .. }));
    }

    #[test]
    fn slow_stream_still_finds_marker_within_deadline() {
        let (tx, rx) = mpsc::channel::<std::io::Result<String>>();
        std::thread::spawn(move || {
            for line in ["warming up", "almost", "now ready"] {
                std::thread::sleep(Duration::from_millis(10));
                if tx.send(Ok(line.to_string())).is_err() {
                    return;
                }
            }
        });
        let iter = std::iter::from_fn(move || rx.recv().ok());
        wait_for_marker(
            iter,
            "ready",
            WaitPolicy::bounded(Duration::from_secs(5)),
            "svc",
        )
        .unwrap();
    }

    #[test]
    fn interrupt_during_bounded_wait_cancels_promptly() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let flag = Arc::new(AtomicBool::new(false));
        let raised = flag.clone();
        // Silent stream; the interrupt flag flips partway into a deadline
        // that is far from expiring.
        let (tx, rx) = mpsc::channel::<std::io::Result<String>>();
        std::thread::spawn(move || {
            let _tx = tx;
            std::thread::sleep(Duration::from_millis(150));
            raised.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_secs(3600));
        });
        let iter = std::iter::from_fn(move || rx.recv().ok());
        let start = Instant::now();
        let err = wait_for_marker_inner(
            iter,
            "marker",
            WaitPolicy::bounded(Duration::from_secs(30)),
            "svc",
            move || flag.swap(false, Ordering::SeqCst),
        )
        .unwrap_err();
        assert!(matches!(err, KedgeError::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn interrupt_that_ends_the_stream_is_reported_as_interrupted() {
        // Forwarding SIGINT kills the log follower, which ends the stream;
        // that must not be mistaken for a startup failure.
        let iter = std::iter::empty();
        let err = wait_for_marker_inner(
            iter,
            "marker",
            WaitPolicy::bounded(Duration::from_secs(30)),
            "svc",
            || true,
        )
        .unwrap_err();
        assert!(matches!(err, KedgeError::Interrupted));
    }

    #[test]
    fn interrupt_cancels_an_indefinite_wait() {
        let iter = vec!["still booting"].into_iter().map(|l| Ok(l.to_string()));
        let err = wait_for_marker_inner(iter, "marker", WaitPolicy::indefinite(), "svc", || {
            true
        })
        .unwrap_err();
        assert!(matches!(err, KedgeError::Interrupted));
    }

    #[test]
    fn marker_is_scanned_on_the_configured_stream() {
        // Marker present on stderr only; a spec watching stdout must not
        // see it.
        let engine = FakeEngine::new();
        engine.set_logs("dev-postgres", LogStream::Stderr, &["ready for start up"]);
        let err = ReadinessEnsurer::new(&engine).ensure(&spec()).unwrap_err();
        assert!(matches!(err, KedgeError::LogStreamEnded(_)));

        let engine = FakeEngine::new();
        engine.set_logs("dev-postgres", LogStream::Stderr, &["ready for start up"]);
        ReadinessEnsurer::new(&engine)
            .ensure(&spec().on_stderr())
            .unwrap();
    }
}

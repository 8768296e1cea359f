//! Container engine seam.
//!
//! The orchestrator depends on a small set of engine verbs (`run`, `rm`,
//! `inspect`, `logs --follow`, `exec`, `volume create/remove`) and on three
//! facts about the engine CLI: exit code 0 means success, `inspect` emits
//! JSON exposing a `State.Running` boolean, and `logs --follow` is
//! line-oriented. [`CliEngine`] shells out to the real binary through
//! [`ProcessRunner`]; tests use the in-memory fake from [`testing`].

use crate::error::{KedgeError, Result};
use crate::process::{LogStream, ProcessResult, ProcessRunner};

/// Observed state of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    /// Unknown to the engine, including the case where the status query
    /// itself failed.
    Absent,
}

/// How to start a named, detached container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Arguments passed to the image entry point, after the image name.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `--net` value; None leaves the engine default.
    pub network: Option<String>,
    pub restart_always: bool,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            args: Vec::new(),
            env: Vec::new(),
            network: None,
            restart_always: false,
        }
    }
}

pub trait ContainerEngine {
    /// Current state of the named container. A failed status query is
    /// reported as [`ContainerState::Absent`], never as an error.
    fn inspect(&self, name: &str) -> ContainerState;

    /// Start a detached container per `spec`. The name is the identity:
    /// at most one logical instance per name exists at a time.
    fn run_detached(&self, spec: &RunSpec) -> Result<()>;

    /// Restart a stopped container in place.
    fn start(&self, name: &str) -> Result<()>;

    /// Force-remove a container together with its attached volumes.
    fn remove(&self, name: &str) -> Result<()>;

    /// Run a command inside a running container, capturing output.
    fn exec(&self, name: &str, cmd: &[&str]) -> Result<ProcessResult>;

    /// Run a one-shot `--rm` container on the given network with output
    /// inherited by the caller (migrations, test runs).
    fn run_oneshot(
        &self,
        network: &str,
        volumes: &[String],
        image: &str,
        cmd: &[&str],
    ) -> Result<()>;

    /// Follow a container's log stream line by line.
    fn log_lines(
        &self,
        name: &str,
        stream: LogStream,
    ) -> Result<Box<dyn Iterator<Item = std::io::Result<String>> + Send>>;

    /// Create an anonymous named volume, returning its name.
    fn volume_create(&self) -> Result<String>;

    fn volume_remove(&self, name: &str) -> Result<()>;
}

/// Create a temporary volume, pass its name to `f`, and remove the volume
/// on every exit path.
pub fn with_temporary_volume<T>(
    engine: &dyn ContainerEngine,
    f: impl FnOnce(&str) -> Result<T>,
) -> Result<T> {
    let volume = engine.volume_create()?;
    tracing::debug!(volume = %volume, "created temporary volume");
    let result = f(&volume);
    if let Err(e) = engine.volume_remove(&volume) {
        tracing::warn!(volume = %volume, "failed to remove temporary volume: {e}");
    }
    result
}

// ---------------------------------------------------------------------------
// CliEngine
// ---------------------------------------------------------------------------

const ENGINE_BIN: &str = "docker";

pub struct CliEngine {
    runner: ProcessRunner,
}

impl CliEngine {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

impl ContainerEngine for CliEngine {
    fn inspect(&self, name: &str) -> ContainerState {
        let output = match self.runner.run(ENGINE_BIN, &["inspect", name]) {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(container = %name, "inspect failed, treating as absent: {e}");
                return ContainerState::Absent;
            }
        };
        match parse_inspect_running(&output.stdout) {
            Some(true) => ContainerState::Running,
            Some(false) => ContainerState::Stopped,
            None => ContainerState::Absent,
        }
    }

    fn run_detached(&self, spec: &RunSpec) -> Result<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        if spec.restart_always {
            args.push("--restart".into());
            args.push("always".into());
        }
        if let Some(net) = &spec.network {
            args.push("--net".into());
            args.push(net.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(ENGINE_BIN, &args)?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.runner.run(ENGINE_BIN, &["start", name])?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.runner
            .run(ENGINE_BIN, &["rm", "--force", "--volumes", name])?;
        Ok(())
    }

    fn exec(&self, name: &str, cmd: &[&str]) -> Result<ProcessResult> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(cmd);
        self.runner.run(ENGINE_BIN, &args)
    }

    fn run_oneshot(
        &self,
        network: &str,
        volumes: &[String],
        image: &str,
        cmd: &[&str],
    ) -> Result<()> {
        let mut args: Vec<&str> = vec!["run", "--rm", "--net", network];
        for volume in volumes {
            args.push("-v");
            args.push(volume);
        }
        args.push(image);
        args.extend_from_slice(cmd);
        self.runner.run_with_output(ENGINE_BIN, &args)
    }

    fn log_lines(
        &self,
        name: &str,
        stream: LogStream,
    ) -> Result<Box<dyn Iterator<Item = std::io::Result<String>> + Send>> {
        let lines = self
            .runner
            .run_streaming(ENGINE_BIN, &["logs", "--follow", name], stream)?;
        Ok(Box::new(lines))
    }

    fn volume_create(&self) -> Result<String> {
        let output = self.runner.run(ENGINE_BIN, &["volume", "create"])?;
        let name = output.stdout.trim().to_string();
        if name.is_empty() {
            return Err(KedgeError::InvalidConfig(
                "volume create returned no name".to_string(),
            ));
        }
        Ok(name)
    }

    fn volume_remove(&self, name: &str) -> Result<()> {
        self.runner.run(ENGINE_BIN, &["volume", "remove", name])?;
        Ok(())
    }
}

/// Extract the `State.Running` boolean from `inspect` JSON output.
/// Returns None when the output does not describe a container.
fn parse_inspect_running(stdout: &str) -> Option<bool> {
    let parsed: serde_json::Value = serde_json::from_str(stdout).ok()?;
    parsed
        .as_array()?
        .first()?
        .get("State")?
        .get("Running")?
        .as_bool()
}

// ---------------------------------------------------------------------------
// FakeEngine (crate-internal test double)
// ---------------------------------------------------------------------------

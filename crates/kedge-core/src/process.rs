//! Synchronous subprocess invocation with interrupt interposition.
//!
//! Every external tool (container engine, cluster CLI) is invoked through
//! [`ProcessRunner`], which injects the merged context as the child's
//! environment and converts a SIGINT delivered while blocking on a child
//! into graceful cancellation: the signal is forwarded to the child *and*
//! to each of the child's direct sub-processes (some tools fork workers
//! that do not receive the parent's signal), and the runner then surfaces
//! [`KedgeError::Interrupted`] so callers unwind through scoped cleanup.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, OnceLock};

use crate::context::Context;
use crate::error::{KedgeError, Result};

// ---------------------------------------------------------------------------
// Interrupt interposition
// ---------------------------------------------------------------------------

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static ACTIVE_CHILD: OnceLock<Mutex<Option<u32>>> = OnceLock::new();
static HANDLER_INIT: Once = Once::new();

fn active_child() -> &'static Mutex<Option<u32>> {
    ACTIVE_CHILD.get_or_init(|| Mutex::new(None))
}

fn install_interrupt_handler() {
    HANDLER_INIT.call_once(|| {
        let result = ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
            let pid = active_child().lock().ok().and_then(|guard| *guard);
            if let Some(pid) = pid {
                forward_interrupt(pid);
            }
        });
        if let Err(e) = result {
            tracing::warn!("could not install interrupt handler: {e}");
        }
    });
}

/// Forward SIGINT to `pid` and to each of its direct children, enumerated
/// via the OS process table filtered by parent pid.
fn forward_interrupt(pid: u32) {
    // SAFETY: kill(2) with SIGINT on a pid we spawned (or its children).
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
    let listing = Command::new("ps")
        .args(["-o", "pid", "--ppid", &pid.to_string(), "--no-headers"])
        .output();
    if let Ok(output) = listing {
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Ok(child_pid) = line.trim().parse::<libc::pid_t>() {
                unsafe {
                    libc::kill(child_pid, libc::SIGINT);
                }
            }
        }
    }
}

fn register_child(pid: u32) {
    if let Ok(mut guard) = active_child().lock() {
        *guard = Some(pid);
    }
}

/// Clear the slot only if it still holds `pid`; a long-lived log follower
/// must not unregister a child that replaced it.
fn unregister_child(pid: u32) {
    if let Ok(mut guard) = active_child().lock() {
        if *guard == Some(pid) {
            *guard = None;
        }
    }
}

/// Consume a pending interrupt. Checked after every blocking wait and by
/// the readiness marker scan.
pub(crate) fn take_interrupted() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Which stream of a child process a line iterator should follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Captured result of a completed foreground invocation.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    env: Vec<(String, String)>,
}

impl ProcessRunner {
    /// A runner that injects `context` into every child's environment.
    pub fn new(context: &Context) -> Self {
        Self {
            env: context.as_environment(),
        }
    }

    /// Run `program` to completion, capturing stdout and stderr.
    ///
    /// The child is spawned in the background and then waited on, so a
    /// SIGINT arriving during the wait can be interposed and forwarded.
    /// Non-zero exit surfaces as [`KedgeError::CommandFailed`].
    pub fn run(&self, program: &str, args: &[&str]) -> Result<ProcessResult> {
        self.run_inner(program, args, Stdio::piped(), Stdio::piped())
    }

    /// Run `program` with stdout/stderr inherited from the caller, for
    /// commands whose output belongs on the user's terminal (test runs,
    /// migrations).
    pub fn run_with_output(&self, program: &str, args: &[&str]) -> Result<()> {
        self.run_inner(program, args, Stdio::inherit(), Stdio::inherit())
            .map(|_| ())
    }

    fn run_inner(
        &self,
        program: &str,
        args: &[&str],
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<ProcessResult> {
        install_interrupt_handler();
        let mut child = self
            .command(program, args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| spawn_failed(program, e))?;

        let pid = child.id();
        register_child(pid);
        let outcome = child.wait_with_output();
        unregister_child(pid);

        let output = outcome.map_err(KedgeError::Io)?;
        if take_interrupted() {
            tracing::info!("stopping running command...");
            return Err(KedgeError::Interrupted);
        }

        let result = ProcessResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            Ok(result)
        } else {
            Err(KedgeError::CommandFailed {
                program: program.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: result.stderr,
            })
        }
    }

    /// Start `program` and return a line iterator over one of its streams
    /// without buffering the whole stream in memory. The child is killed
    /// when the iterator is dropped.
    pub fn run_streaming(
        &self,
        program: &str,
        args: &[&str],
        stream: LogStream,
    ) -> Result<LineStream> {
        install_interrupt_handler();
        let mut cmd = self.command(program, args);
        cmd.stdin(Stdio::null());
        match stream {
            LogStream::Stdout => cmd.stdout(Stdio::piped()).stderr(Stdio::null()),
            LogStream::Stderr => cmd.stdout(Stdio::null()).stderr(Stdio::piped()),
        };
        let mut child = cmd.spawn().map_err(|e| spawn_failed(program, e))?;
        // Registered for the life of the stream so a SIGINT during a
        // readiness wait reaches the log follower and ends the stream.
        register_child(child.id());

        let reader: Box<dyn Read + Send> = match stream {
            LogStream::Stdout => Box::new(child.stdout.take().ok_or_else(|| {
                KedgeError::SpawnFailed {
                    program: program.to_string(),
                    reason: "stdout not captured".to_string(),
                }
            })?),
            LogStream::Stderr => Box::new(child.stderr.take().ok_or_else(|| {
                KedgeError::SpawnFailed {
                    program: program.to_string(),
                    reason: "stderr not captured".to_string(),
                }
            })?),
        };

        Ok(LineStream {
            child,
            lines: BufReader::new(reader).lines(),
        })
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn spawn_failed(program: &str, e: std::io::Error) -> KedgeError {
    KedgeError::SpawnFailed {
        program: program.to_string(),
        reason: e.to_string(),
    }
}

/// True when `name` resolves to an executable on PATH.
pub fn is_command_available(name: &str) -> bool {
    which::which(name).is_ok()
}

// ---------------------------------------------------------------------------
// LineStream
// ---------------------------------------------------------------------------

/// Line iterator over a running child's stdout or stderr.
pub struct LineStream {
    child: Child,
    lines: std::io::Lines<BufReader<Box<dyn Read + Send>>>,
}

impl Iterator for LineStream {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next()
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        // The stream may be abandoned mid-follow (marker found); reap the child.
        let pid = self.child.id();
        let _ = self.child.kill();
        let _ = self.child.wait();
        unregister_child(pid);
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KedgeError {
    #[error("not initialized: no .kedge/config.yaml found (run from a kedge project)")]
    NotInitialized,

    #[error("missing context key: {0}")]
    MissingContextKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("'{program}' exited with code {code}{}", stderr_hint(.stderr))]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("timed out after {seconds}s waiting for '{name}' to log \"{marker}\"")]
    ReadinessTimeout {
        name: String,
        marker: String,
        seconds: u64,
    },

    #[error("log stream for '{0}' ended before the readiness marker appeared")]
    LogStreamEnded(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn stderr_hint(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        // Keep error messages single-screen: first 500 chars of stderr.
        let hint: String = trimmed.chars().take(500).collect();
        format!(": {hint}")
    }
}

impl KedgeError {
    /// True when a failed command's stderr contains `needle`. Callers use
    /// this to whitelist expected failures ("already exists" from
    /// idempotent creation, "No such container" from best-effort removal),
    /// matching the backend tools' own wording.
    pub fn stderr_contains(&self, needle: &str) -> bool {
        match self {
            KedgeError::CommandFailed { stderr, .. } => stderr.contains(needle),
            _ => false,
        }
    }

    /// Exit code to surface from the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            KedgeError::CommandFailed { code, .. } => *code,
            KedgeError::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KedgeError>;

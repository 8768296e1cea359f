use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const KEDGE_DIR: &str = ".kedge";
pub const CONFIG_FILE: &str = ".kedge/config.yaml";
pub const SECRETS_DIR: &str = ".kedge/secrets";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn kedge_dir(root: &Path) -> PathBuf {
    root.join(KEDGE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn secrets_dir(root: &Path) -> PathBuf {
    root.join(SECRETS_DIR)
}

/// On-disk YAML mapping for one named secret (e.g. `redis-urls`).
pub fn secret_file(root: &Path, secret_name: &str) -> PathBuf {
    secrets_dir(root).join(format!("{secret_name}.yaml"))
}

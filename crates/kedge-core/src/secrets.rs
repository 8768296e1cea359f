//! Shared secret key/value store.
//!
//! A secret is a YAML mapping on disk (logical name -> literal value, e.g.
//! a connection URL), read fully into memory, mutated, and rewritten in
//! full. The redis provisioner uses it to hand every logical service its
//! own backing database index; indices are assigned monotonically and
//! never reused, so services never collide even if an entry is deleted by
//! hand. Installation into the deployment target is a collaborator seam
//! ([`SecretInstaller`]).

use crate::error::Result;
use crate::io;
use crate::process::ProcessRunner;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full mapping; an absent file is an empty mapping.
    pub fn mapping(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Insert or replace one entry, rewriting the whole file atomically.
    pub fn set(&self, key: &str, value: &str) -> Result<BTreeMap<String, String>> {
        let mut mapping = self.mapping()?;
        mapping.insert(key.to_string(), value.to_string());
        let content = serde_yaml::to_string(&mapping)?;
        io::atomic_write(&self.path, content.as_bytes())?;
        Ok(mapping)
    }
}

static DB_INDEX_RE: OnceLock<Regex> = OnceLock::new();

fn db_index_re() -> &'static Regex {
    DB_INDEX_RE.get_or_init(|| Regex::new(r"/(\d+)$").unwrap())
}

/// Next unused database index for a redis-style URL mapping.
///
/// max(assigned) + 1, not len(): counting entries would re-hand-out an
/// index after an entry is removed out-of-band, and an index must never
/// be reused once assigned.
pub fn next_database_index(mapping: &BTreeMap<String, String>) -> u32 {
    mapping
        .values()
        .filter_map(|url| {
            db_index_re()
                .captures(url)
                .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok())
        })
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// SecretInstaller
// ---------------------------------------------------------------------------

/// Installs a secret mapping into the deployment target. Collaborator
/// seam: the orchestrator only triggers installation, it does not own the
/// target's secret format.
pub trait SecretInstaller {
    fn install(&self, secret_name: &str, mapping: &BTreeMap<String, String>) -> Result<()>;
}

/// kubectl-backed installer: recreates the named secret from literals.
pub struct KubectlSecretInstaller {
    runner: ProcessRunner,
}

impl KubectlSecretInstaller {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

impl SecretInstaller for KubectlSecretInstaller {
    fn install(&self, secret_name: &str, mapping: &BTreeMap<String, String>) -> Result<()> {
        tracing::info!(secret = %secret_name, "installing secret");
        match self.runner.run("kubectl", &["delete", "secret", secret_name]) {
            Ok(_) => {}
            Err(e) if e.stderr_contains("NotFound") => {}
            Err(e) => return Err(e),
        }
        let mut args: Vec<String> =
            vec!["create".into(), "secret".into(), "generic".into(), secret_name.into()];
        for (key, value) in mapping {
            args.push(format!("--from-literal={key}={value}"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run("kubectl", &args)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SecretStore {
        SecretStore::open(dir.path().join("redis-urls.yaml"))
    }

    #[test]
    fn missing_file_is_empty_mapping() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).mapping().unwrap().is_empty());
    }

    #[test]
    fn set_round_trips_through_the_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set("orders", "redis://dev-redis:6379/0").unwrap();
        store.set("billing", "redis://dev-redis:6379/1").unwrap();
        let mapping = store.mapping().unwrap();
        assert_eq!(mapping["orders"], "redis://dev-redis:6379/0");
        assert_eq!(mapping["billing"], "redis://dev-redis:6379/1");
    }

    #[test]
    fn index_assignment_is_dense_from_zero() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for name in ["a", "b", "c"] {
            let mapping = store.mapping().unwrap();
            let index = next_database_index(&mapping);
            store
                .set(name, &format!("redis://dev-redis:6379/{index}"))
                .unwrap();
        }
        let mapping = store.mapping().unwrap();
        assert_eq!(mapping["a"], "redis://dev-redis:6379/0");
        assert_eq!(mapping["b"], "redis://dev-redis:6379/1");
        assert_eq!(mapping["c"], "redis://dev-redis:6379/2");
    }

    #[test]
    fn removed_entries_never_free_their_index() {
        let mut mapping = BTreeMap::new();
        mapping.insert("a".to_string(), "redis://dev-redis:6379/0".to_string());
        mapping.insert("c".to_string(), "redis://dev-redis:6379/2".to_string());
        // "b" (index 1) was deleted out-of-band; the next index must be 3.
        assert_eq!(next_database_index(&mapping), 3);
    }

    #[test]
    fn index_ignores_values_without_a_numeric_suffix() {
        let mut mapping = BTreeMap::new();
        mapping.insert("odd".to_string(), "redis://dev-redis:6379".to_string());
        assert_eq!(next_database_index(&mapping), 0);
    }
}

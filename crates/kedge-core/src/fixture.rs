//! Ephemeral test-database fixture.
//!
//! A test run that needs a database gets a throwaway container named
//! `db-test-<image>-<tag>`, created on entry and removed on exit. In
//! development mode the container is deliberately left running between
//! invocations so the next run finds it and skips create + migrate; the
//! dominant cost is database startup, not disk.

use std::path::Path;

use serde_yaml::Value;

use crate::context::Context;
use crate::engine::{ContainerEngine, ContainerState, RunSpec};
use crate::error::{KedgeError, Result};
use crate::process::LogStream;
use crate::readiness::{wait_for_marker, WaitPolicy};

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Per-engine startup and database-creation capabilities. The lifecycle
/// state machine is identical across backends; only the start command,
/// readiness marker, and create-database step differ.
pub trait DatabaseBackend {
    fn kind(&self) -> &'static str;

    fn ready_marker(&self) -> &'static str;

    /// Arguments passed to the database image's entry point.
    fn start_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment for the database container.
    fn start_env(&self, _database_name: &str) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Post-start step for backends that cannot create the database
    /// declaratively at container start.
    fn post_start(
        &self,
        _engine: &dyn ContainerEngine,
        _config: &FixtureConfig,
        _network: &str,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct PostgresBackend;

impl DatabaseBackend for PostgresBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn ready_marker(&self) -> &'static str {
        "PostgreSQL init process complete; ready for start up."
    }

    fn start_env(&self, database_name: &str) -> Vec<(String, String)> {
        vec![("POSTGRES_DB".to_string(), database_name.to_string())]
    }
}

pub struct CockroachBackend;

impl DatabaseBackend for CockroachBackend {
    fn kind(&self) -> &'static str {
        "cockroach"
    }

    fn ready_marker(&self) -> &'static str {
        "initialized new cluster"
    }

    fn start_args(&self) -> Vec<String> {
        ["start-single-node", "--insecure", "--host=localhost", "--logtostderr"]
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    fn post_start(
        &self,
        engine: &dyn ContainerEngine,
        config: &FixtureConfig,
        network: &str,
    ) -> Result<()> {
        engine.run_oneshot(
            network,
            &[],
            &config.database_image,
            &[
                "sql",
                "--insecure",
                "-e",
                &format!("CREATE DATABASE {}", config.database_name),
            ],
        )
    }
}

/// Select a backend by the `TEST_DATABASE_TYPE` context value.
/// Unknown types fall back to postgres with a warning, matching the
/// permissive configuration policy elsewhere.
pub fn backend_for(kind: Option<&str>) -> Box<dyn DatabaseBackend> {
    match kind {
        None | Some("postgres") => Box::new(PostgresBackend),
        Some("cockroach") => Box::new(CockroachBackend),
        Some(other) => {
            tracing::warn!(
                "unknown test database type \"{other}\", falling back to postgres"
            );
            Box::new(PostgresBackend)
        }
    }
}

// ---------------------------------------------------------------------------
// FixtureConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FixtureConfig {
    /// Logical image name; part of the deterministic container name.
    pub image_name: String,
    pub tag: String,
    /// Workload image providing the migration entry point.
    pub tested_image: String,
    pub database_image: String,
    pub database_name: String,
    pub migration_command: String,
    /// Extra `-v` mounts for migration and test containers.
    pub volumes: Vec<String>,
    pub is_development: bool,
    pub force_recreate: bool,
    pub force_migrate: bool,
    pub wait: WaitPolicy,
}

impl FixtureConfig {
    pub fn from_context(
        context: &Context,
        tested_image: &str,
        tag: &str,
        is_development: bool,
        force_recreate: bool,
        force_migrate: bool,
    ) -> Result<Self> {
        Ok(Self {
            image_name: context.require_str("DOCKER_IMAGE_NAME")?.to_string(),
            tag: tag.to_string(),
            tested_image: tested_image.to_string(),
            database_image: context.require_str("TEST_DATABASE_IMAGE")?.to_string(),
            database_name: context
                .get_str("TEST_DATABASE_NAME")
                .unwrap_or("test")
                .to_string(),
            migration_command: context.require_str("TEST_MIGRATION_COMMAND")?.to_string(),
            volumes: Vec::new(),
            is_development,
            force_recreate,
            force_migrate,
            wait: WaitPolicy::default(),
        })
    }
}

/// `-v` mounts for migration and test containers: the `DEV_MOUNTED_PATHS`
/// entries carrying a `mount-in-tests` section for `image_name`, rendered
/// as `host:container:mode` with host paths resolved against the project
/// root. Development-mode only; callers pass no mounts outside it.
pub fn test_mount_volumes(
    context: &Context,
    root: &Path,
    image_name: &str,
) -> Result<Vec<String>> {
    let Some(Value::Sequence(entries)) = context.get("DEV_MOUNTED_PATHS") else {
        return Ok(Vec::new());
    };
    let mut volumes = Vec::new();
    for entry in entries {
        let Some(volume) = entry.as_mapping() else {
            continue;
        };
        let Some(in_tests) = volume.get("mount-in-tests").and_then(Value::as_mapping) else {
            continue;
        };
        if in_tests.get("image-name").and_then(Value::as_str) != Some(image_name) {
            continue;
        }
        let host_path = volume
            .get("host-path")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_mount_key("host-path"))?;
        let container_path = in_tests
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_mount_key("path"))?;
        let mode = in_tests
            .get("mount-mode")
            .and_then(Value::as_str)
            .unwrap_or("ro");
        if !matches!(mode, "ro" | "rw") {
            return Err(KedgeError::InvalidConfig(format!(
                "volume \"mount-mode\" should be one of: \"ro\", \"rw\" (got \"{mode}\")"
            )));
        }
        volumes.push(format!(
            "{}:{container_path}:{mode}",
            root.join(host_path).display()
        ));
    }
    Ok(volumes)
}

fn missing_mount_key(key: &str) -> KedgeError {
    KedgeError::InvalidConfig(format!("DEV_MOUNTED_PATHS entry is missing \"{key}\""))
}

// ---------------------------------------------------------------------------
// TestDatabase
// ---------------------------------------------------------------------------

pub struct TestDatabase<'a> {
    engine: &'a dyn ContainerEngine,
    backend: Box<dyn DatabaseBackend>,
    config: FixtureConfig,
    migrated: bool,
}

impl<'a> TestDatabase<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        backend: Box<dyn DatabaseBackend>,
        config: FixtureConfig,
    ) -> Self {
        Self {
            engine,
            backend,
            config,
            migrated: false,
        }
    }

    /// Deterministic container name, the fixture's identity across
    /// invocations: `db-test-<image>-<tag>`.
    pub fn container_name(&self) -> String {
        format!("db-test-{}-{}", self.config.image_name, self.config.tag)
    }

    /// Network for containers that address the database as `localhost`:
    /// they share the database container's network namespace, so no port
    /// mapping is needed.
    pub fn network(&self) -> String {
        format!("container:{}", self.container_name())
    }

    /// Acquire the fixture, run `f`, and release on every exit path of
    /// `f`, including errors and interrupts propagating out of it.
    pub fn scope<T>(mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.acquire()?;
        let result = f(&mut self);
        let released = self.release();
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    fn acquire(&mut self) -> Result<()> {
        if !self.config.is_development || self.config.force_recreate {
            self.remove()?;
        }
        match self.engine.inspect(&self.container_name()) {
            ContainerState::Running => {}
            ContainerState::Stopped => {
                tracing::info!("found stopped test database, restarting it");
                self.engine.start(&self.container_name())?;
            }
            ContainerState::Absent => {
                self.create()?;
                self.wait_until_ready()?;
                self.backend
                    .post_start(self.engine, &self.config, &self.network())?;
                self.migrate(false)?;
            }
        }
        if self.config.force_migrate {
            self.migrate(true)?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if !self.config.is_development {
            self.remove()?;
        }
        Ok(())
    }

    fn create(&self) -> Result<()> {
        tracing::info!(backend = self.backend.kind(), "setting up test database");
        let mut spec = RunSpec::new(self.container_name(), &self.config.database_image);
        spec.args = self.backend.start_args();
        spec.env = self.backend.start_env(&self.config.database_name);
        spec.network = Some("none".to_string());
        spec.restart_always = true;
        self.engine.run_detached(&spec)
    }

    fn wait_until_ready(&self) -> Result<()> {
        tracing::info!("waiting for test database");
        let name = self.container_name();
        // Database engines log startup progress on stderr.
        let lines = self.engine.log_lines(&name, LogStream::Stderr)?;
        wait_for_marker(lines, self.backend.ready_marker(), self.config.wait, &name)?;
        tracing::info!("test database ready");
        Ok(())
    }

    /// Run migrations inside the database's network namespace. At most
    /// once per fixture instance unless `force` is set; the underlying
    /// migration command's own idempotence is the workload image's
    /// responsibility.
    pub fn migrate(&mut self, force: bool) -> Result<()> {
        if self.migrated && !force {
            tracing::debug!("already migrated in this scope, skipping");
            return Ok(());
        }
        tracing::info!("running migrations");
        self.engine.run_oneshot(
            &self.network(),
            &self.config.volumes,
            &self.config.tested_image,
            &[&self.config.migration_command],
        )?;
        self.migrated = true;
        tracing::info!("migrations done");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        tracing::info!("removing test database");
        match self.engine.remove(&self.container_name()) {
            Ok(()) => Ok(()),
            Err(e) if e.stderr_contains("No such container") => {
                tracing::debug!("test database does not exist yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

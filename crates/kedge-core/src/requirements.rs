//! Declarative development requirements.
//!
//! `DEV_REQUIREMENTS` in the context is a list of `{kind, ...arguments}`
//! records describing the development-time dependencies a service needs.
//! The dispatcher routes each record to its kind's provisioner. Unknown
//! kinds and out-of-whitelist arguments are configuration-shaped problems:
//! they warn and skip, never fail the command. Any other provisioning
//! error aborts the remaining records (fail-fast).

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde_yaml::Value;

use crate::context::Context;
use crate::engine::ContainerEngine;
use crate::error::Result;
use crate::provision;
use crate::readiness::WaitPolicy;
use crate::secrets::SecretInstaller;

// ---------------------------------------------------------------------------
// RequirementKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Postgres,
    Cockroachdb,
    Redis,
    Elastic,
    Pubsub,
    Cassandra,
    Rabbitmq,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::Postgres => "postgres",
            RequirementKind::Cockroachdb => "cockroachdb",
            RequirementKind::Redis => "redis",
            RequirementKind::Elastic => "elastic",
            RequirementKind::Pubsub => "pubsub",
            RequirementKind::Cassandra => "cassandra",
            RequirementKind::Rabbitmq => "rabbitmq",
        }
    }

    /// Accepted argument keys for this kind. Anything else in a record is
    /// a configuration mistake and skips the record with a warning.
    pub fn valid_arguments(&self) -> &'static [&'static str] {
        match self {
            RequirementKind::Postgres
            | RequirementKind::Cockroachdb
            | RequirementKind::Redis => &["name"],
            RequirementKind::Elastic | RequirementKind::Rabbitmq => &[],
            RequirementKind::Pubsub => &["topic", "subscription"],
            RequirementKind::Cassandra => &["keyspace"],
        }
    }
}

/// Unknown kind names carry the offending string for the warning.
pub struct UnknownKind(pub String);

impl FromStr for RequirementKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownKind> {
        match s {
            "postgres" => Ok(RequirementKind::Postgres),
            "cockroachdb" => Ok(RequirementKind::Cockroachdb),
            "redis" => Ok(RequirementKind::Redis),
            "elastic" => Ok(RequirementKind::Elastic),
            "pubsub" => Ok(RequirementKind::Pubsub),
            "cassandra" => Ok(RequirementKind::Cassandra),
            "rabbitmq" => Ok(RequirementKind::Rabbitmq),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RequirementRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementRecord {
    pub kind: String,
    pub arguments: BTreeMap<String, String>,
}

impl RequirementRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        self.arguments.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse the `DEV_REQUIREMENTS` list from the context. Entries that
    /// are not mappings or lack a `kind` are skipped with a warning.
    pub fn list_from_context(context: &Context) -> Vec<RequirementRecord> {
        let Some(Value::Sequence(entries)) = context.get("DEV_REQUIREMENTS") else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for entry in entries {
            match parse_record(entry) {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(
                        "skipping requirement without specified kind: {entry:?}"
                    );
                }
            }
        }
        records
    }
}

fn parse_record(entry: &Value) -> Option<RequirementRecord> {
    let mapping = entry.as_mapping()?;
    let mut kind = None;
    let mut arguments = BTreeMap::new();
    for (key, value) in mapping {
        let key = key.as_str()?;
        let value = scalar_to_string(value)?;
        if key == "kind" {
            kind = Some(value);
        } else {
            arguments.insert(key.to_string(), value);
        }
    }
    Some(RequirementRecord {
        kind: kind?,
        arguments,
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RequirementsDispatcher
// ---------------------------------------------------------------------------

pub struct RequirementsDispatcher<'a> {
    pub(crate) engine: &'a dyn ContainerEngine,
    pub(crate) context: &'a Context,
    pub(crate) root: &'a Path,
    pub(crate) installer: &'a dyn SecretInstaller,
    pub(crate) wait: WaitPolicy,
}

impl<'a> RequirementsDispatcher<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        context: &'a Context,
        root: &'a Path,
        installer: &'a dyn SecretInstaller,
    ) -> Self {
        Self {
            engine,
            context,
            root,
            installer,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Provision every record in list order. Order matters only for the
    /// redis secret-index assignment, which hands out indices in first-use
    /// order.
    pub fn dispatch_all(&self, records: &[RequirementRecord]) -> Result<()> {
        for record in records {
            self.dispatch(record)?;
        }
        Ok(())
    }

    pub fn dispatch(&self, record: &RequirementRecord) -> Result<()> {
        let kind = match record.kind.parse::<RequirementKind>() {
            Ok(kind) => kind,
            Err(UnknownKind(other)) => {
                tracing::warn!("kind \"{other}\" is not supported");
                return Ok(());
            }
        };
        tracing::info!("checking requirement of kind \"{}\"", kind.as_str());
        let whitelist = kind.valid_arguments();
        if !record.arguments.keys().all(|k| whitelist.contains(&k.as_str())) {
            tracing::warn!(
                "requirement configuration is not valid: {:?}; available options are: {:?}",
                record.arguments,
                whitelist
            );
            return Ok(());
        }
        provision::provision(self, kind, &record.arguments)?;
        tracing::info!("requirement of kind \"{}\" satisfied", kind.as_str());
        Ok(())
    }
}

//! Merged key/value context passed into every orchestrator call.
//!
//! The context is an ordered mapping from uppercase string keys to YAML
//! values, assembled from `.kedge/config.yaml` plus overrides merged in
//! by command setup. Provisioners only read it; discovered endpoints go
//! to the secret store instead.

use crate::error::{KedgeError, Result};
use crate::paths;
use serde_yaml::{Mapping, Value};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct Context {
    values: Mapping,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the project context from `.kedge/config.yaml` under `root`.
    /// Keys are case-normalized to uppercase.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(KedgeError::NotInitialized);
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: Mapping = serde_yaml::from_str(content)?;
        let mut ctx = Self::new();
        for (key, value) in raw {
            let Value::String(key) = key else {
                return Err(KedgeError::InvalidConfig(
                    "context keys must be strings".to_string(),
                ));
            };
            ctx.set(&key, value);
        }
        Ok(ctx)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(Value::String(key.to_uppercase()))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// String value with a `MissingContextKey` error when absent.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key)
            .ok_or_else(|| KedgeError::MissingContextKey(key.to_uppercase()))
    }

    /// Truthiness for flag-style keys: YAML booleans, or the strings
    /// "true"/"yes"/"1" in any case. Absent keys are false.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => {
                matches!(s.to_lowercase().as_str(), "true" | "yes" | "1")
            }
            _ => false,
        }
    }

    /// Insert a value, case-normalizing the key to uppercase.
    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(Value::String(key.to_uppercase()), value);
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    /// Merge `other` into self; keys in `other` win.
    pub fn merge(&mut self, other: Context) {
        for (key, value) in other.values {
            self.values.insert(key, value);
        }
    }

    /// Project the context into child-process environment variables.
    ///
    /// Strings pass through verbatim; other scalars render with their YAML
    /// display form; structured values (lists of mappings, e.g.
    /// DEV_REQUIREMENTS) are serialized as YAML documents so child
    /// processes can parse them back.
    pub fn as_environment(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .filter_map(|(key, value)| {
                let key = key.as_str()?.to_string();
                Some((key, flatten_value(value)))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_uppercased_on_load() {
        let ctx = Context::from_yaml("kube_service_name: orders\n").unwrap();
        assert_eq!(ctx.get_str("KUBE_SERVICE_NAME"), Some("orders"));
        assert_eq!(ctx.get_str("kube_service_name"), Some("orders"));
    }

    #[test]
    fn set_uppercases_keys() {
        let mut ctx = Context::new();
        ctx.set_str("docker_image_name", "sw-project");
        assert_eq!(ctx.get_str("DOCKER_IMAGE_NAME"), Some("sw-project"));
    }

    #[test]
    fn merge_overrides_existing_keys() {
        let mut base = Context::from_yaml("A: one\nB: two\n").unwrap();
        let overlay = Context::from_yaml("B: three\nC: four\n").unwrap();
        base.merge(overlay);
        assert_eq!(base.get_str("A"), Some("one"));
        assert_eq!(base.get_str("B"), Some("three"));
        assert_eq!(base.get_str("C"), Some("four"));
    }

    #[test]
    fn bool_keys_accept_yaml_and_string_forms() {
        let ctx = Context::from_yaml("A: true\nB: 'yes'\nC: '1'\nD: 'no'\n").unwrap();
        assert!(ctx.get_bool("A"));
        assert!(ctx.get_bool("B"));
        assert!(ctx.get_bool("C"));
        assert!(!ctx.get_bool("D"));
        assert!(!ctx.get_bool("MISSING"));
    }

    #[test]
    fn environment_flattens_scalars_and_serializes_structures() {
        let ctx = Context::from_yaml(
            "NAME: orders\nPORT: 5432\nDEV_REQUIREMENTS:\n- kind: postgres\n",
        )
        .unwrap();
        let env: std::collections::HashMap<_, _> =
            ctx.as_environment().into_iter().collect();
        assert_eq!(env["NAME"], "orders");
        assert_eq!(env["PORT"], "5432");
        assert!(env["DEV_REQUIREMENTS"].contains("kind: postgres"));
    }

    #[test]
    fn environment_preserves_insertion_order() {
        let ctx = Context::from_yaml("Z: 1\nA: 2\nM: 3\n").unwrap();
        let keys: Vec<String> = ctx
            .as_environment()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["Z", "A", "M"]);
    }

    #[test]
    fn require_str_reports_missing_key() {
        let ctx = Context::new();
        let err = ctx.require_str("kube_service_name").unwrap_err();
        assert!(matches!(err, KedgeError::MissingContextKey(k) if k == "KUBE_SERVICE_NAME"));
    }

    #[test]
    fn load_missing_config_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Context::load(dir.path()).unwrap_err();
        assert!(matches!(err, KedgeError::NotInitialized));
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on node visits for an unbounded run (0 disables the cap).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Buffer size of each instance's event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// Gate nodes whose metadata names an actor attribute.
    #[default]
    Actor,
    /// Gate every activity node.
    Block,
    /// Never gate.
    NotBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub controller: ControllerKind,
    /// Metadata/context keys compared by the actor controller.
    #[serde(default = "default_actor_keys")]
    pub actor_keys: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            controller: ControllerKind::default(),
            actor_keys: default_actor_keys(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Resolve the store path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_max_steps() -> usize { 10_000 }
fn default_event_capacity() -> usize { 256 }
fn default_actor_keys() -> Vec<String> { vec!["actor".to_string()] }
fn default_store_path() -> String { "~/.flowgraph/state.db".to_string() }
fn default_log_filter() -> String { "flowgraph=info,warn".to_string() }

impl FlowConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workflow.controller == ControllerKind::Actor && self.workflow.actor_keys.is_empty()
        {
            return Err(FlowError::Config(
                "workflow.actor_keys must not be empty for the actor controller".into(),
            ));
        }
        if self.store.kind == StoreKind::Sqlite && self.store.path.trim().is_empty() {
            return Err(FlowError::Config("store.path is required for sqlite".into()));
        }
        Ok(())
    }

    /// Default config file location (`~/.flowgraph/config.toml`).
    pub fn default_path() -> PathBuf {
        expand_home("~/.flowgraph/config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Unset variables stay verbatim
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWGRAPH_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWGRAPH_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWGRAPH_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWGRAPH_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWGRAPH_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = FlowConfig::parse("").unwrap();
        assert_eq!(config.engine.max_steps, 10_000);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.workflow.controller, ControllerKind::Actor);
        assert_eq!(config.workflow.actor_keys, vec!["actor"]);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.log.filter, "flowgraph=info,warn");
    }

    #[test]
    fn test_partial_sections() {
        let config = FlowConfig::parse(
            r#"
[engine]
max_steps = 50

[workflow]
controller = "not_block"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.max_steps, 50);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.workflow.controller, ControllerKind::NotBlock);
    }

    #[test]
    fn test_rejects_empty_actor_keys() {
        let err = FlowConfig::parse("[workflow]\nactor_keys = []\n").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_store_kind() {
        let err = FlowConfig::parse("[store]\nkind = \"redis\"\n").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}

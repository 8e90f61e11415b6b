//! Agent registry: the static agent-to-queue mapping.
//!
//! Loaded once at scheduler start from the agent control file, a JSON
//! array of `{"agentName": ..., "agentType": ...}` objects. The agent
//! type doubles as the queue name; many agents can share one queue.
//! When the control file is absent the scheduler falls back to legacy
//! per-agent-limit processing.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::validate::{self, ValidationError};

/// Size bound for the control file before parsing.
pub const MAX_CONTROL_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// One entry of the agent control file. Unknown fields are collected and
/// warned about rather than rejected.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "agentType")]
    pub agent_type: String,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read agent control file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in agent control file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("agent control file must contain a JSON array")]
    NotAnArray,

    #[error("entry {index}: {field} must be a non-empty string")]
    EmptyField { index: usize, field: &'static str },

    #[error("duplicate agent name '{0}' in control file")]
    DuplicateAgent(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Indexed view of the agent control file.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentEntry>,
    by_queue: BTreeMap<String, Vec<String>>,
    by_name: HashMap<String, String>,
}

impl AgentRegistry {
    /// Load and index the control file.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        validate::validate_json_file_size(path, MAX_CONTROL_FILE_BYTES)?;
        let content = fs::read_to_string(path).map_err(|e| RegistryError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        let value: Value = serde_json::from_str(&content)?;
        let Value::Array(items) = value else {
            return Err(RegistryError::NotAnArray);
        };

        let mut agents = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let entry: AgentEntry = serde_json::from_value(item)?;
            if entry.agent_name.trim().is_empty() {
                return Err(RegistryError::EmptyField {
                    index,
                    field: "agentName",
                });
            }
            if entry.agent_type.trim().is_empty() {
                return Err(RegistryError::EmptyField {
                    index,
                    field: "agentType",
                });
            }
            if !entry.extra.is_empty() {
                let mut fields: Vec<&str> = entry.extra.keys().map(|k| k.as_str()).collect();
                fields.sort_unstable();
                warn!(
                    agent = %entry.agent_name,
                    fields = fields.join(", "),
                    "ignoring unexpected fields in agent control entry"
                );
            }
            agents.push(entry);
        }

        let mut by_queue: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut by_name: HashMap<String, String> = HashMap::new();
        for entry in &agents {
            if by_name
                .insert(entry.agent_name.clone(), entry.agent_type.clone())
                .is_some()
            {
                return Err(RegistryError::DuplicateAgent(entry.agent_name.clone()));
            }
            by_queue
                .entry(entry.agent_type.clone())
                .or_default()
                .push(entry.agent_name.clone());
        }

        Ok(Self {
            agents,
            by_queue,
            by_name,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Queue names in deterministic (sorted) order.
    pub fn queues(&self) -> Vec<&str> {
        self.by_queue.keys().map(|s| s.as_str()).collect()
    }

    /// Agent names mapped to a queue, in control-file order.
    pub fn agents_for_queue(&self, queue: &str) -> Vec<&str> {
        self.by_queue
            .get(queue)
            .map(|names| names.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Queue for an agent name.
    pub fn queue_for_agent(&self, agent: &str) -> Option<&str> {
        self.by_name.get(agent).map(|s| s.as_str())
    }

    /// All agent names, in control-file order.
    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.agent_name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_control(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("agent-control.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_and_index() {
        let dir = TempDir::new().unwrap();
        let path = write_control(
            &dir,
            r#"[
                {"agentName": "vaela", "agentType": "dev"},
                {"agentName": "damien", "agentType": "dev"},
                {"agentName": "oscar", "agentType": "qa"}
            ]"#,
        );

        let registry = AgentRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.queues(), vec!["dev", "qa"]);
        assert_eq!(registry.agents_for_queue("dev"), vec!["vaela", "damien"]);
        assert_eq!(registry.agents_for_queue("qa"), vec!["oscar"]);
        assert_eq!(registry.queue_for_agent("oscar"), Some("qa"));
        assert_eq!(registry.queue_for_agent("nobody"), None);
        assert_eq!(registry.agent_names(), vec!["vaela", "damien", "oscar"]);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let dir = TempDir::new().unwrap();
        let path = write_control(
            &dir,
            r#"[{"agentName": "vaela", "agentType": "dev", "maxConcurrency": 4}]"#,
        );
        let registry = AgentRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_agent_is_error() {
        let dir = TempDir::new().unwrap();
        let path = write_control(
            &dir,
            r#"[
                {"agentName": "vaela", "agentType": "dev"},
                {"agentName": "vaela", "agentType": "qa"}
            ]"#,
        );
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(RegistryError::DuplicateAgent(_))
        ));
    }

    #[test]
    fn test_missing_required_field() {
        let dir = TempDir::new().unwrap();
        let path = write_control(&dir, r#"[{"agentName": "vaela"}]"#);
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_control(&dir, r#"[{"agentName": "  ", "agentType": "dev"}]"#);
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(RegistryError::EmptyField { field: "agentName", .. })
        ));
    }

    #[test]
    fn test_not_an_array() {
        let dir = TempDir::new().unwrap();
        let path = write_control(&dir, r#"{"agents": []}"#);
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(RegistryError::NotAnArray)
        ));
    }

    #[test]
    fn test_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = write_control(&dir, "not json at all");
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_empty_array_is_empty_registry() {
        let dir = TempDir::new().unwrap();
        let path = write_control(&dir, "[]");
        let registry = AgentRegistry::load(&path).unwrap();
        assert!(registry.is_empty());
        assert!(registry.queues().is_empty());
    }
}

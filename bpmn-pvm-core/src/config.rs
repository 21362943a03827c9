//! Engine configuration, loaded from YAML or built in code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How much of the execution is written to the history log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryLevel {
    None,
    /// Process and activity start/end, deletions with reasons.
    #[default]
    Activity,
    /// Everything in `Activity` plus taken sequence flows and subscription changes.
    Full,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub history_level: HistoryLevel,
    /// Hard cap on operations drained in one transaction. `None` drains to quiescence.
    pub max_operations_per_transaction: Option<usize>,
    /// Tenant stamped on new process instances that don't name one.
    pub default_tenant_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::Activity,
            max_operations_per_transaction: None,
            default_tenant_id: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Parsing engine config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub(crate) fn records(&self, level: HistoryLevel) -> bool {
        self.history_level != HistoryLevel::None && self.history_level >= level
    }
}

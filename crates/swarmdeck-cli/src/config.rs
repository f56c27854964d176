//! `swarmdeck.toml` schema.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use swarmdeck_core::{
    AlertAction, Comparison, MonitoringRule, Severity, SwarmdeckError, SwarmdeckResult,
};
use swarmdeck_orchestrator::OrchestratorConfig;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
    #[serde(default)]
    pub actions: Vec<ActionCommandConfig>,
    #[serde(default)]
    pub reports: ReportConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// An agent registered at start-up if none with the same name exists.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub capabilities: Vec<String>,
}

/// A monitoring rule as written in the config file.
///
/// Rules are keyed by name so that reloading the file updates a rule in
/// place instead of replacing it (which would resolve its open alerts).
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Agent name; omitted for system-wide rules.
    #[serde(default)]
    pub agent: Option<String>,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

fn default_true() -> bool {
    true
}

impl RuleConfig {
    /// Build the rule, reusing `existing` ids by name and resolving agent
    /// names through `agents`.
    pub fn to_rule(
        &self,
        existing: &HashMap<String, Uuid>,
        agents: &HashMap<String, Uuid>,
    ) -> SwarmdeckResult<MonitoringRule> {
        let mut rule = MonitoringRule::new(
            &self.name,
            &self.metric,
            self.comparison,
            self.threshold,
            self.severity,
        );
        if let Some(id) = existing.get(&self.name) {
            rule.id = *id;
        }
        if let Some(agent) = &self.agent {
            let id = agents.get(agent).ok_or_else(|| {
                SwarmdeckError::Config(format!(
                    "Rule '{}' targets unknown agent '{agent}'",
                    self.name
                ))
            })?;
            rule.agent_id = Some(*id);
        }
        if let Some(secs) = self.cooldown_secs {
            rule.cooldown_secs = secs;
        }
        rule.enabled = self.enabled;
        rule.auto_resolve = self.auto_resolve;
        rule.actions = self.actions.clone();
        Ok(rule)
    }
}

/// Shell command run for tasks of one type.
///
/// The command sees `SWARMDECK_TASK_ID`, `SWARMDECK_TASK_TITLE`,
/// `SWARMDECK_AGENT`, and the task input as JSON on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub capability: String,
    pub command: String,
}

/// Shell command run for one alert action type.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionCommandConfig {
    #[serde(rename = "type")]
    pub action_type: swarmdeck_core::ActionType,
    pub command: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
    /// 7-field cron expression; no periodic reports when unset.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> SwarmdeckResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SwarmdeckError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> SwarmdeckResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SwarmdeckError::Config(format!("Failed to parse config: {e}")))?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> SwarmdeckResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.store.data_dir.join("reports")
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use swarmdeck_core::{SwarmdeckError, SwarmdeckResult};

/// What the dispatcher does when no idle agent declares a task's type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Leave the task pending until a capable agent is idle.
    #[default]
    Strict,
    /// Degraded matching: hand the task to any idle agent.
    AnyIdleFallback,
}

/// Where an alert rule's cooldown window is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownAnchor {
    /// From the moment the previous alert for the same target was resolved.
    #[default]
    Resolution,
    /// From the moment the previous alert was opened.
    Creation,
}

fn default_scheduler_interval_ms() -> u64 {
    5_000
}
fn default_metrics_interval_ms() -> u64 {
    30_000
}
fn default_alert_interval_ms() -> u64 {
    60_000
}
fn default_metrics_window_secs() -> u64 {
    3_600
}
fn default_history_retention() -> usize {
    500
}
fn default_event_capacity() -> usize {
    1_024
}

/// Tunables for the orchestrator loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_alert_interval_ms")]
    pub alert_interval_ms: u64,
    /// Trailing window used for per-agent and system metrics.
    #[serde(default = "default_metrics_window_secs")]
    pub metrics_window_secs: u64,
    /// Snapshots kept in metrics history per scope.
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    /// Upper bound on a single execution. None means executions may run forever.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cooldown_anchor: CooldownAnchor,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: default_scheduler_interval_ms(),
            metrics_interval_ms: default_metrics_interval_ms(),
            alert_interval_ms: default_alert_interval_ms(),
            metrics_window_secs: default_metrics_window_secs(),
            history_retention: default_history_retention(),
            match_policy: MatchPolicy::default(),
            task_timeout_secs: None,
            cooldown_anchor: CooldownAnchor::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse from a TOML fragment (the `[orchestrator]` table's contents).
    pub fn from_toml(source: &str) -> SwarmdeckResult<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| SwarmdeckError::Config(format!("Invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwarmdeckResult<()> {
        for (name, value) in [
            ("scheduler_interval_ms", self.scheduler_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("alert_interval_ms", self.alert_interval_ms),
            ("metrics_window_secs", self.metrics_window_secs),
        ] {
            if value == 0 {
                return Err(SwarmdeckError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.task_timeout_secs == Some(0) {
            return Err(SwarmdeckError::Config(
                "task_timeout_secs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_millis(self.alert_interval_ms)
    }

    pub fn metrics_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.metrics_window_secs as i64)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.scheduler_interval(), Duration::from_secs(5));
        assert_eq!(config.match_policy, MatchPolicy::Strict);
        assert_eq!(config.cooldown_anchor, CooldownAnchor::Resolution);
        assert!(config.task_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = OrchestratorConfig::from_toml(
            r#"
scheduler_interval_ms = 250
match_policy = "any_idle_fallback"
task_timeout_secs = 90
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler_interval_ms, 250);
        assert_eq!(config.match_policy, MatchPolicy::AnyIdleFallback);
        assert_eq!(config.task_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.alert_interval_ms, 60_000);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = OrchestratorConfig::from_toml("metrics_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("metrics_interval_ms"));
    }
}

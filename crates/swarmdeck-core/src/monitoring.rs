//! Monitoring rules and the alerts they raise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Comparison applied as `current <op> threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[serde(alias = ">")]
    GreaterThan,
    #[serde(alias = ">=")]
    GreaterOrEqual,
    #[serde(alias = "<")]
    LessThan,
    #[serde(alias = "<=")]
    LessOrEqual,
    #[serde(alias = "==")]
    Equal,
    #[serde(alias = "!=")]
    NotEqual,
}

impl Comparison {
    pub fn holds(self, current: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => current > threshold,
            Comparison::GreaterOrEqual => current >= threshold,
            Comparison::LessThan => current < threshold,
            Comparison::LessOrEqual => current <= threshold,
            Comparison::Equal => (current - threshold).abs() < f64::EPSILON,
            Comparison::NotEqual => (current - threshold).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::GreaterThan => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::LessThan => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Remediation performed through the action collaborator when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RestartAgent,
    ScaleResources,
    Notify,
    RunScript,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::RestartAgent => "restart_agent",
            ActionType::ScaleResources => "scale_resources",
            ActionType::Notify => "notify",
            ActionType::RunScript => "run_script",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl AlertAction {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            parameters: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> u64 {
    300
}

/// A threshold check evaluated against the metrics cache.
///
/// A rule without `agent_id` is evaluated against system-wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_enabled")]
    pub auto_resolve: bool,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

impl MonitoringRule {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            agent_id: None,
            metric: metric.into(),
            comparison,
            threshold,
            severity,
            enabled: true,
            cooldown_secs: default_cooldown(),
            auto_resolve: true,
            actions: Vec::new(),
        }
    }

    pub fn for_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn manual_resolve(mut self) -> Self {
        self.auto_resolve = false;
        self
    }

    pub fn with_action(mut self, action: AlertAction) -> Self {
        self.actions.push(action);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Active and acknowledged alerts both occupy the (rule, target) slot.
    pub fn is_open(self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// Outcome of one remediation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Position of the action in the rule's action list.
    #[serde(default)]
    pub action_index: usize,
    pub action_type: ActionType,
    pub success: bool,
    pub detail: String,
    pub executed_at: DateTime<Utc>,
}

/// An alert opened when a rule's condition held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub agent_id: Option<Uuid>,
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub current_value: f64,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    #[serde(default)]
    pub actions_taken: Vec<ActionRecord>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Snapshot a rule firing at `current_value`.
    pub fn from_rule(rule: &MonitoringRule, current_value: f64) -> Self {
        let target = rule
            .agent_id
            .map(|id| format!("agent {id}"))
            .unwrap_or_else(|| "system".to_string());
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            agent_id: rule.agent_id,
            metric: rule.metric.clone(),
            comparison: rule.comparison,
            threshold: rule.threshold,
            current_value,
            severity: rule.severity,
            status: AlertStatus::Active,
            message: format!(
                "{}: {} {} {} on {} (current {:.2})",
                rule.name, rule.metric, rule.comparison, rule.threshold, target, current_value
            ),
            actions_taken: Vec::new(),
            created_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_comparisons() {
        assert!(Comparison::GreaterThan.holds(0.6, 0.5));
        assert!(!Comparison::GreaterThan.holds(0.5, 0.5));
        assert!(Comparison::GreaterOrEqual.holds(0.5, 0.5));
        assert!(Comparison::LessThan.holds(79.0, 80.0));
        assert!(Comparison::LessOrEqual.holds(80.0, 80.0));
        assert!(Comparison::Equal.holds(3.0, 3.0));
        assert!(Comparison::NotEqual.holds(3.0, 4.0));
    }

    #[test]
    fn test_rule_deserialize_defaults() {
        let rule: MonitoringRule = serde_json::from_value(serde_json::json!({
            "name": "high error rate",
            "metric": "error_rate",
            "comparison": ">",
            "threshold": 20.0,
            "severity": "warning",
            "actions": [{"type": "notify", "parameters": {"channel": "ops"}}]
        }))
        .unwrap();
        assert!(rule.enabled);
        assert!(rule.auto_resolve);
        assert_eq!(rule.cooldown_secs, 300);
        assert_eq!(rule.comparison, Comparison::GreaterThan);
        assert_eq!(rule.actions[0].action_type, ActionType::Notify);
        assert!(rule.agent_id.is_none());
    }

    #[test]
    fn test_alert_from_rule() {
        let agent = Uuid::new_v4();
        let rule = MonitoringRule::new(
            "slow",
            "avg_execution_time_ms",
            Comparison::GreaterThan,
            1000.0,
            Severity::Error,
        )
        .for_agent(agent);
        let alert = Alert::from_rule(&rule, 1500.0);
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.agent_id, Some(agent));
        assert!(alert.message.contains("avg_execution_time_ms > 1000"));
        assert!(alert.status.is_open());
    }
}

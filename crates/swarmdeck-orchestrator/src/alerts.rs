use crate::bus::CollaborationBus;
use crate::config::CooldownAnchor;
use crate::metrics::{is_known_metric, MetricsCollector};
use crate::registry::AgentRegistry;
use crate::tick::{TickGuard, TickOutcome};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use swarmdeck_core::{
    ActionExecutor, ActionRecord, ActionType, AgentStatus, Alert, AlertAction, AlertStatus,
    EventBus, MonitoringRule, OrchestratorEvent, SwarmdeckError, SwarmdeckResult, SYSTEM_SENDER,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A rule whose evaluation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleError {
    pub rule_id: Uuid,
    pub error: String,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub evaluated: usize,
    /// Alerts opened this pass.
    pub opened: Vec<Uuid>,
    /// Alerts auto-resolved this pass.
    pub resolved: Vec<Uuid>,
    /// Rules whose condition held but which were still cooling down.
    pub suppressed: Vec<Uuid>,
    /// Rules with no sample for their metric yet.
    pub no_data: Vec<Uuid>,
    pub actions_run: usize,
    pub action_failures: usize,
    pub errors: Vec<RuleError>,
}

enum RuleOutcome {
    Opened { alert_id: Uuid, runs: usize, failures: usize },
    Retried { runs: usize, failures: usize },
    Resolved(Uuid),
    Suppressed,
    NoData,
    Unchanged,
}

/// Evaluates monitoring rules against the metrics cache, opens and resolves
/// alerts, and runs remediation actions.
pub struct AlertEngine {
    db: Arc<dyn Persistence>,
    metrics: Arc<MetricsCollector>,
    agents: Arc<AgentRegistry>,
    bus: Arc<CollaborationBus>,
    executor: Arc<dyn ActionExecutor>,
    events: EventBus,
    anchor: CooldownAnchor,
    guard: TickGuard,
    lock: Mutex<()>,
}

impl AlertEngine {
    pub fn new(
        db: Arc<dyn Persistence>,
        metrics: Arc<MetricsCollector>,
        agents: Arc<AgentRegistry>,
        bus: Arc<CollaborationBus>,
        executor: Arc<dyn ActionExecutor>,
        events: EventBus,
        anchor: CooldownAnchor,
    ) -> Self {
        Self {
            db,
            metrics,
            agents,
            bus,
            executor,
            events,
            anchor,
            guard: TickGuard::new(),
            lock: Mutex::new(()),
        }
    }

    pub async fn add_rule(&self, rule: MonitoringRule) -> SwarmdeckResult<MonitoringRule> {
        validate_rule(&rule)?;
        self.db.save_new(&rule).await?;
        info!(rule_id = %rule.id, name = %rule.name, metric = %rule.metric, "Monitoring rule added");
        Ok(rule)
    }

    /// Replace a rule. An alert left open for the rule's previous target
    /// agent is resolved.
    pub async fn update_rule(&self, rule: MonitoringRule) -> SwarmdeckResult<MonitoringRule> {
        validate_rule(&rule)?;
        let _guard = self.lock.lock().await;
        self.rule(rule.id).await?;
        self.resolve_retargeted(std::slice::from_ref(&rule)).await?;
        self.db.save(&rule).await?;
        info!(rule_id = %rule.id, name = %rule.name, "Monitoring rule updated");
        Ok(rule)
    }

    /// Delete a rule and resolve any alert it still has open.
    pub async fn remove_rule(&self, rule_id: Uuid) -> SwarmdeckResult<()> {
        let _guard = self.lock.lock().await;
        self.rule(rule_id).await?;
        self.resolve_open_for(&[rule_id].into_iter().collect()).await?;
        self.db.delete::<MonitoringRule>(&rule_id.to_string()).await?;
        info!(rule_id = %rule_id, "Monitoring rule removed");
        Ok(())
    }

    /// Swap the whole rule set, e.g. after a config reload.
    ///
    /// Every rule is validated before anything changes. Rules missing from
    /// the new set are removed and their open alerts resolved, as are open
    /// alerts of rules whose target agent changed.
    pub async fn replace_rules(&self, rules: Vec<MonitoringRule>) -> SwarmdeckResult<usize> {
        for rule in &rules {
            validate_rule(rule)?;
        }
        let mut seen = HashSet::new();
        if let Some(dup) = rules.iter().find(|r| !seen.insert(r.id)) {
            return Err(SwarmdeckError::Validation(format!(
                "duplicate rule id {}",
                dup.id
            )));
        }

        let _guard = self.lock.lock().await;
        let dropped: HashSet<Uuid> = self
            .db
            .load_all::<MonitoringRule>()
            .await?
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !seen.contains(id))
            .collect();
        self.resolve_open_for(&dropped).await?;
        self.resolve_retargeted(&rules).await?;
        for id in &dropped {
            self.db.delete::<MonitoringRule>(&id.to_string()).await?;
        }
        for rule in &rules {
            self.db.save(rule).await?;
        }
        info!(rules = rules.len(), removed = dropped.len(), "Monitoring rules replaced");
        Ok(rules.len())
    }

    pub async fn rule(&self, rule_id: Uuid) -> SwarmdeckResult<MonitoringRule> {
        self.db
            .load::<MonitoringRule>(&rule_id.to_string())
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("rule", rule_id))
    }

    /// All rules, by name.
    pub async fn rules(&self) -> SwarmdeckResult<Vec<MonitoringRule>> {
        let mut rules: Vec<MonitoringRule> = self.db.load_all().await?;
        rules.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    /// Evaluate every enabled rule once.
    ///
    /// Rules are isolated from each other: one failing rule is reported and
    /// the pass continues.
    pub async fn evaluate(&self) -> SwarmdeckResult<TickOutcome<EvaluationReport>> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Alert evaluation still running, skipping");
            return Ok(TickOutcome::Skipped);
        };
        let _guard = self.lock.lock().await;

        let rules: Vec<MonitoringRule> = self
            .rules()
            .await?
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        let alerts: Vec<Alert> = self.db.load_all().await?;
        let mut report = EvaluationReport {
            evaluated: rules.len(),
            ..EvaluationReport::default()
        };

        for rule in &rules {
            let history: Vec<&Alert> = alerts
                .iter()
                .filter(|a| a.rule_id == rule.id && a.agent_id == rule.agent_id)
                .collect();
            match self.evaluate_rule(rule, &history).await {
                Ok(RuleOutcome::Opened {
                    alert_id,
                    runs,
                    failures,
                }) => {
                    report.opened.push(alert_id);
                    report.actions_run += runs;
                    report.action_failures += failures;
                }
                Ok(RuleOutcome::Retried { runs, failures }) => {
                    report.actions_run += runs;
                    report.action_failures += failures;
                }
                Ok(RuleOutcome::Resolved(alert_id)) => report.resolved.push(alert_id),
                Ok(RuleOutcome::Suppressed) => report.suppressed.push(rule.id),
                Ok(RuleOutcome::NoData) => report.no_data.push(rule.id),
                Ok(RuleOutcome::Unchanged) => {}
                Err(e) => {
                    warn!(rule_id = %rule.id, rule = %rule.name, error = %e, "Rule evaluation failed");
                    report.errors.push(RuleError {
                        rule_id: rule.id,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(TickOutcome::Completed(report))
    }

    async fn evaluate_rule(
        &self,
        rule: &MonitoringRule,
        history: &[&Alert],
    ) -> SwarmdeckResult<RuleOutcome> {
        if let Some(agent_id) = rule.agent_id {
            match self.agents.get(agent_id).await {
                Ok(_) => {}
                Err(SwarmdeckError::NotFound { .. }) => {
                    // The target is gone; nothing will ever clear the condition.
                    let Some(open) = history.iter().find(|a| a.status.is_open()) else {
                        return Ok(RuleOutcome::NoData);
                    };
                    let mut alert = (*open).clone();
                    info!(alert_id = %alert.id, agent_id = %agent_id, "Rule target agent is gone");
                    self.close(&mut alert).await?;
                    return Ok(RuleOutcome::Resolved(alert.id));
                }
                Err(e) => return Err(e),
            }
        }
        let Some(value) = self.metrics.metric_value(rule.agent_id, &rule.metric) else {
            return Ok(RuleOutcome::NoData);
        };
        let holds = rule.comparison.holds(value, rule.threshold);
        let open = history.iter().find(|a| a.status.is_open());

        match (holds, open) {
            (true, None) => {
                if self.cooling_down(rule, history) {
                    debug!(rule_id = %rule.id, value, "Rule matched during cooldown");
                    return Ok(RuleOutcome::Suppressed);
                }
                let mut alert = Alert::from_rule(rule, value);
                self.db.save_new(&alert).await?;
                warn!(
                    alert_id = %alert.id,
                    rule = %rule.name,
                    severity = %alert.severity,
                    value,
                    threshold = rule.threshold,
                    "Alert opened"
                );
                self.events.publish(OrchestratorEvent::AlertOpened {
                    alert_id: alert.id,
                    rule_id: rule.id,
                    agent_id: rule.agent_id,
                    severity: alert.severity,
                });

                let indices: Vec<usize> = (0..rule.actions.len()).collect();
                let failures = self.run_actions(rule, &mut alert, &indices).await;
                if !indices.is_empty() {
                    self.db.save(&alert).await?;
                }
                Ok(RuleOutcome::Opened {
                    alert_id: alert.id,
                    runs: indices.len(),
                    failures,
                })
            }
            (true, Some(open)) => {
                // Still firing: retry only the actions whose last attempt failed.
                let mut alert = (*open).clone();
                let indices = failed_actions(rule, &alert);
                if indices.is_empty() {
                    return Ok(RuleOutcome::Unchanged);
                }
                let failures = self.run_actions(rule, &mut alert, &indices).await;
                self.db.save(&alert).await?;
                Ok(RuleOutcome::Retried {
                    runs: indices.len(),
                    failures,
                })
            }
            (false, Some(open)) if rule.auto_resolve => {
                let mut alert = (*open).clone();
                self.close(&mut alert).await?;
                Ok(RuleOutcome::Resolved(alert.id))
            }
            (false, _) => Ok(RuleOutcome::Unchanged),
        }
    }

    fn cooling_down(&self, rule: &MonitoringRule, history: &[&Alert]) -> bool {
        if rule.cooldown_secs == 0 {
            return false;
        }
        let last = history
            .iter()
            .filter_map(|a| match self.anchor {
                CooldownAnchor::Resolution => a.resolved_at,
                CooldownAnchor::Creation => Some(a.created_at),
            })
            .max();
        let cooldown = Duration::seconds(rule.cooldown_secs as i64);
        last.is_some_and(|at| Utc::now() - at < cooldown)
    }

    /// Run the listed actions in order, appending a record for each.
    /// Returns the number that failed.
    async fn run_actions(
        &self,
        rule: &MonitoringRule,
        alert: &mut Alert,
        indices: &[usize],
    ) -> usize {
        let mut failures = 0;
        for &index in indices {
            let Some(action) = rule.actions.get(index) else {
                continue;
            };
            let outcome = self.run_action(action, alert).await;
            let record = ActionRecord {
                action_index: index,
                action_type: action.action_type,
                success: outcome.is_ok(),
                detail: match &outcome {
                    Ok(detail) => detail.clone(),
                    Err(e) => e.to_string(),
                },
                executed_at: Utc::now(),
            };
            match &outcome {
                Ok(detail) => info!(
                    alert_id = %alert.id,
                    action = %action.action_type,
                    detail = %detail,
                    "Alert action executed"
                ),
                Err(e) => {
                    failures += 1;
                    warn!(
                        alert_id = %alert.id,
                        action = %action.action_type,
                        error = %e,
                        "Alert action failed"
                    );
                }
            }
            alert.actions_taken.push(record);
        }
        failures
    }

    async fn run_action(&self, action: &AlertAction, alert: &Alert) -> SwarmdeckResult<String> {
        match action.action_type {
            ActionType::RestartAgent => {
                let target = action_target(action, alert)?;
                let detail = self.executor.execute(action, alert).await?;
                let agent = self.agents.get(target).await?;
                if agent.workload.total() > 0 {
                    debug!(agent_id = %target, status = %agent.status, "Agent has work in flight, not restarting");
                    return Ok(format!("{detail}; agent {target} busy, status kept"));
                }
                if agent.status != AgentStatus::Idle {
                    self.agents.set_status(target, AgentStatus::Idle).await?;
                }
                Ok(detail)
            }
            ActionType::Notify => {
                let detail = self.executor.execute(action, alert).await?;
                let payload = serde_json::json!({
                    "alert_id": alert.id,
                    "rule": alert.rule_name,
                    "severity": alert.severity,
                    "message": alert.message,
                    "parameters": action.parameters,
                });
                self.bus.broadcast(SYSTEM_SENDER, payload).await?;
                Ok(detail)
            }
            ActionType::ScaleResources | ActionType::RunScript => {
                self.executor.execute(action, alert).await
            }
        }
    }

    /// Mark an active alert as seen. It stays open.
    pub async fn acknowledge(&self, alert_id: Uuid) -> SwarmdeckResult<Alert> {
        let _guard = self.lock.lock().await;
        let mut alert = self.alert(alert_id).await?;
        match alert.status {
            AlertStatus::Active => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(Utc::now());
                self.db.save(&alert).await?;
                info!(alert_id = %alert_id, "Alert acknowledged");
                self.events
                    .publish(OrchestratorEvent::AlertAcknowledged { alert_id });
                Ok(alert)
            }
            AlertStatus::Acknowledged => Ok(alert),
            AlertStatus::Resolved => Err(SwarmdeckError::Validation(format!(
                "alert {alert_id} is already resolved"
            ))),
        }
    }

    /// Resolve an open alert by hand.
    pub async fn resolve(&self, alert_id: Uuid) -> SwarmdeckResult<Alert> {
        let _guard = self.lock.lock().await;
        let mut alert = self.alert(alert_id).await?;
        if !alert.status.is_open() {
            return Err(SwarmdeckError::Validation(format!(
                "alert {alert_id} is already resolved"
            )));
        }
        self.close(&mut alert).await?;
        Ok(alert)
    }

    pub async fn alert(&self, alert_id: Uuid) -> SwarmdeckResult<Alert> {
        self.db
            .load::<Alert>(&alert_id.to_string())
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("alert", alert_id))
    }

    /// Open alerts, most severe first.
    pub async fn active_alerts(&self) -> SwarmdeckResult<Vec<Alert>> {
        let mut open: Vec<Alert> = self
            .db
            .load_all::<Alert>()
            .await?
            .into_iter()
            .filter(|a| a.status.is_open())
            .collect();
        open.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(open)
    }

    /// Every alert, newest first.
    pub async fn alerts(&self) -> SwarmdeckResult<Vec<Alert>> {
        let mut all: Vec<Alert> = self.db.load_all().await?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    async fn close(&self, alert: &mut Alert) -> SwarmdeckResult<()> {
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(Utc::now());
        self.db.save(&*alert).await?;
        info!(alert_id = %alert.id, rule = %alert.rule_name, "Alert resolved");
        self.events.publish(OrchestratorEvent::AlertResolved {
            alert_id: alert.id,
            rule_id: alert.rule_id,
        });
        Ok(())
    }

    /// Resolve open alerts raised for a different agent than the one each
    /// rule now targets.
    async fn resolve_retargeted(&self, rules: &[MonitoringRule]) -> SwarmdeckResult<()> {
        let targets: HashMap<Uuid, Option<Uuid>> =
            rules.iter().map(|r| (r.id, r.agent_id)).collect();
        for mut alert in self.db.load_all::<Alert>().await? {
            let moved = targets
                .get(&alert.rule_id)
                .is_some_and(|target| *target != alert.agent_id);
            if alert.status.is_open() && moved {
                self.close(&mut alert).await?;
            }
        }
        Ok(())
    }

    async fn resolve_open_for(&self, rule_ids: &HashSet<Uuid>) -> SwarmdeckResult<()> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        for mut alert in self.db.load_all::<Alert>().await? {
            if alert.status.is_open() && rule_ids.contains(&alert.rule_id) {
                self.close(&mut alert).await?;
            }
        }
        Ok(())
    }
}

fn validate_rule(rule: &MonitoringRule) -> SwarmdeckResult<()> {
    if rule.name.trim().is_empty() {
        return Err(SwarmdeckError::Validation("rule name must not be empty".into()));
    }
    if !rule.threshold.is_finite() {
        return Err(SwarmdeckError::Validation(format!(
            "rule '{}' has a non-finite threshold",
            rule.name
        )));
    }
    if !is_known_metric(&rule.metric, rule.agent_id.is_some()) {
        let scope = if rule.agent_id.is_some() { "agent" } else { "system" };
        return Err(SwarmdeckError::Validation(format!(
            "rule '{}' uses unknown {scope} metric '{}'",
            rule.name, rule.metric
        )));
    }
    Ok(())
}

/// Indices of actions whose most recent attempt failed.
fn failed_actions(rule: &MonitoringRule, alert: &Alert) -> Vec<usize> {
    (0..rule.actions.len())
        .filter(|index| {
            alert
                .actions_taken
                .iter()
                .rev()
                .find(|r| r.action_index == *index)
                .is_some_and(|r| !r.success)
        })
        .collect()
}

/// The agent an action targets: its `agent_id` parameter, else the alert's.
fn action_target(action: &AlertAction, alert: &Alert) -> SwarmdeckResult<Uuid> {
    if let Some(raw) = action.parameters.get("agent_id").and_then(|v| v.as_str()) {
        return raw.parse().map_err(|_| {
            SwarmdeckError::Action(format!("invalid agent_id parameter '{raw}'"))
        });
    }
    alert.agent_id.ok_or_else(|| {
        SwarmdeckError::Action(format!(
            "{} needs a target agent on system-wide alert {}",
            action.action_type, alert.id
        ))
    })
}

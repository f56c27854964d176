use crate::registry::AgentRegistry;
use crate::report_store::JsonReportStore;
use crate::task_store::TaskStore;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use swarmdeck_core::{
    metrics::rates, AgentStatus, SwarmdeckError, SwarmdeckResult, Task, TaskStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Agents need at least this many finished tasks before their success rate
/// or speed is judged.
const MIN_SAMPLE: u64 = 3;
const LOW_SUCCESS_RATE: f64 = 80.0;
const SLOW_FACTOR: f64 = 2.0;
const BUSIEST_TYPES: usize = 5;

/// Per-agent figures for a report period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Volume and outcome of one task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTypeStats {
    pub task_type: String,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    LowSuccessRate,
    SlowExecution,
    IdleCapacity,
    CapabilityGap,
    FailureHeavy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub agent_id: Option<Uuid>,
    pub message: String,
}

/// Summary of agent and task performance over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    /// Tasks created during the period.
    pub tasks_submitted: u64,
    /// Tasks that finished during the period.
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Pending tasks at generation time.
    pub tasks_pending: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub agents: Vec<AgentReport>,
    pub busiest_task_types: Vec<TaskTypeStats>,
    pub recommendations: Vec<Recommendation>,
}

/// Derives [`PerformanceReport`]s from task history. Read-only.
pub struct ReportGenerator {
    tasks: Arc<TaskStore>,
    agents: Arc<AgentRegistry>,
}

impl ReportGenerator {
    pub fn new(tasks: Arc<TaskStore>, agents: Arc<AgentRegistry>) -> Self {
        Self { tasks, agents }
    }

    /// Build a report for `[start, end)`.
    pub async fn generate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SwarmdeckResult<PerformanceReport> {
        if start >= end {
            return Err(SwarmdeckError::Validation(format!(
                "report period start {start} is not before end {end}"
            )));
        }
        let tasks = self.tasks.list().await?;
        let agents = self.agents.list().await?;

        let finished: Vec<&Task> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
            .filter(|t| t.completed_at.is_some_and(|at| at >= start && at < end))
            .collect();
        let (completed, failed, avg) = summarize(finished.iter().copied());
        let (success_rate, _) = rates(completed, failed);

        let agent_reports: Vec<AgentReport> = agents
            .iter()
            .map(|agent| {
                let (done, bad, avg) = summarize(
                    finished
                        .iter()
                        .copied()
                        .filter(|t| t.assigned_agent == Some(agent.id)),
                );
                AgentReport {
                    agent_id: agent.id,
                    name: agent.name.clone(),
                    status: agent.status,
                    tasks_completed: done,
                    tasks_failed: bad,
                    success_rate: rates(done, bad).0,
                    avg_duration_ms: avg,
                }
            })
            .collect();

        let mut by_type: BTreeMap<&str, TaskTypeStats> = BTreeMap::new();
        for task in &tasks {
            let submitted = task.created_at >= start && task.created_at < end;
            let done = finished.iter().any(|t| t.id == task.id);
            if !submitted && !done {
                continue;
            }
            let stats = by_type
                .entry(task.task_type.as_str())
                .or_insert_with(|| TaskTypeStats {
                    task_type: task.task_type.clone(),
                    submitted: 0,
                    completed: 0,
                    failed: 0,
                });
            if submitted {
                stats.submitted += 1;
            }
            if done {
                match task.status {
                    TaskStatus::Completed => stats.completed += 1,
                    _ => stats.failed += 1,
                }
            }
        }
        let mut busiest: Vec<TaskTypeStats> = by_type.into_values().collect();
        busiest.sort_by(|a, b| {
            (b.submitted + b.completed + b.failed)
                .cmp(&(a.submitted + a.completed + a.failed))
                .then_with(|| a.task_type.cmp(&b.task_type))
        });
        busiest.truncate(BUSIEST_TYPES);

        let pending: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        let declared: HashSet<&str> = agents
            .iter()
            .flat_map(|a| a.capabilities.iter().map(String::as_str))
            .collect();

        let mut recommendations = Vec::new();
        for agent in &agent_reports {
            let total = agent.tasks_completed + agent.tasks_failed;
            if total >= MIN_SAMPLE && agent.success_rate < LOW_SUCCESS_RATE {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::LowSuccessRate,
                    agent_id: Some(agent.agent_id),
                    message: format!(
                        "Agent '{}' succeeded on {:.0}% of {total} tasks; review its configuration",
                        agent.name, agent.success_rate
                    ),
                });
            }
            if agent.tasks_completed >= MIN_SAMPLE
                && avg > 0.0
                && agent.avg_duration_ms > avg * SLOW_FACTOR
            {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::SlowExecution,
                    agent_id: Some(agent.agent_id),
                    message: format!(
                        "Agent '{}' averages {:.0}ms per task against {avg:.0}ms overall",
                        agent.name, agent.avg_duration_ms
                    ),
                });
            }
            if total == 0 && !pending.is_empty() {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::IdleCapacity,
                    agent_id: Some(agent.agent_id),
                    message: format!(
                        "Agent '{}' finished no tasks while {} are pending; consider broadening its capabilities",
                        agent.name,
                        pending.len()
                    ),
                });
            }
        }

        let unmatched: Vec<&str> = pending
            .iter()
            .map(|t| t.task_type.as_str())
            .filter(|t| !declared.contains(t))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for task_type in unmatched {
            recommendations.push(Recommendation {
                kind: RecommendationKind::CapabilityGap,
                agent_id: None,
                message: format!("No registered agent declares capability '{task_type}'"),
            });
        }

        if failed > completed {
            recommendations.push(Recommendation {
                kind: RecommendationKind::FailureHeavy,
                agent_id: None,
                message: format!(
                    "{failed} tasks failed against {completed} completed in this period"
                ),
            });
        }

        Ok(PerformanceReport {
            id: Uuid::new_v4(),
            period_start: start,
            period_end: end,
            generated_at: Utc::now(),
            tasks_submitted: tasks
                .iter()
                .filter(|t| t.created_at >= start && t.created_at < end)
                .count() as u64,
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_pending: pending.len() as u64,
            success_rate,
            avg_duration_ms: avg,
            agents: agent_reports,
            busiest_task_types: busiest,
            recommendations,
        })
    }

    /// Report on the trailing `period` ending now.
    pub async fn generate_trailing(&self, period: Duration) -> SwarmdeckResult<PerformanceReport> {
        let end = Utc::now();
        self.generate(end - period, end).await
    }
}

/// `(completed, failed, avg completed duration in ms)`.
fn summarize<'a>(finished: impl Iterator<Item = &'a Task>) -> (u64, u64, f64) {
    let (mut completed, mut failed, mut total_ms, mut timed) = (0u64, 0u64, 0u64, 0u64);
    for task in finished {
        if task.status == TaskStatus::Completed {
            completed += 1;
            if let Some(ms) = task.actual_duration_ms {
                total_ms += ms;
                timed += 1;
            }
        } else {
            failed += 1;
        }
    }
    let avg = if timed == 0 {
        0.0
    } else {
        total_ms as f64 / timed as f64
    };
    (completed, failed, avg)
}

/// Cron schedule for periodic reports.
///
/// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
#[derive(Debug, Clone)]
pub struct ReportSchedule {
    expression: String,
    schedule: Schedule,
}

impl ReportSchedule {
    pub fn new(expression: &str) -> SwarmdeckResult<Self> {
        Ok(Self {
            expression: expression.to_string(),
            schedule: parse_cron(expression)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> SwarmdeckResult<DateTime<Utc>> {
        self.schedule.after(&after).next().ok_or_else(|| {
            SwarmdeckError::Config(format!(
                "Cron expression '{}' has no upcoming fire times",
                self.expression
            ))
        })
    }

    /// Generate and save a report at every fire time until cancelled.
    ///
    /// Each report covers the span since the previous fire time.
    pub async fn run(
        self,
        generator: Arc<ReportGenerator>,
        store: JsonReportStore,
        token: CancellationToken,
    ) {
        let mut last = Utc::now();
        loop {
            let next = match self.next_after(last) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "Report schedule exhausted");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            match generator.generate(last, next).await {
                Ok(report) => match store.save_report(&report).await {
                    Ok(path) => info!(
                        path = %path.display(),
                        recommendations = report.recommendations.len(),
                        "Performance report written"
                    ),
                    Err(e) => warn!(error = %e, "Failed to save performance report"),
                },
                Err(e) => warn!(error = %e, "Failed to generate performance report"),
            }
            last = next;
        }
    }
}

/// Parse a cron expression into a [`cron::Schedule`].
pub fn parse_cron(expression: &str) -> SwarmdeckResult<Schedule> {
    Schedule::from_str(expression).map_err(|e| {
        SwarmdeckError::Config(format!("Invalid cron expression '{expression}': {e}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use swarmdeck_core::EventBus;
    use swarmdeck_store::{MemoryStore, Persistence};

    fn setup() -> (ReportGenerator, Arc<TaskStore>, Arc<AgentRegistry>) {
        let db: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let events = EventBus::new(64);
        let tasks = Arc::new(TaskStore::new(db.clone(), events.clone()));
        let agents = Arc::new(AgentRegistry::new(db, tasks.clone(), events));
        (ReportGenerator::new(tasks.clone(), agents.clone()), tasks, agents)
    }

    async fn run(tasks: &TaskStore, agent: Uuid, task_type: &str, ok: bool) {
        let task = tasks.submit(Task::new("t", task_type)).await.unwrap();
        tasks.assign(task.id, agent).await.unwrap();
        tasks.start(task.id).await.unwrap();
        if ok {
            tasks.complete(task.id, serde_json::json!(null)).await.unwrap();
        } else {
            tasks.fail(task.id, "nope").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_period() {
        let (generator, _, _) = setup();
        let now = Utc::now();
        assert!(generator.generate(now, now).await.is_err());
    }

    #[tokio::test]
    async fn test_report_totals_and_recommendations() {
        let (generator, tasks, agents) = setup();
        let flaky = agents.register("flaky", ["review"]).await.unwrap();
        let idle = agents.register("idle", ["docs"]).await.unwrap();
        for ok in [true, false, false, false] {
            run(&tasks, flaky.id, "review", ok).await;
        }
        tasks.submit(Task::new("scan", "security-scan")).await.unwrap();

        let report = generator.generate_trailing(Duration::hours(1)).await.unwrap();
        assert_eq!(report.tasks_submitted, 5);
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(report.tasks_failed, 3);
        assert_eq!(report.tasks_pending, 1);
        assert_eq!(report.success_rate, 25.0);
        assert_eq!(report.busiest_task_types[0].task_type, "review");

        let kinds: Vec<(RecommendationKind, Option<Uuid>)> = report
            .recommendations
            .iter()
            .map(|r| (r.kind, r.agent_id))
            .collect();
        assert!(kinds.contains(&(RecommendationKind::LowSuccessRate, Some(flaky.id))));
        assert!(kinds.contains(&(RecommendationKind::IdleCapacity, Some(idle.id))));
        assert!(kinds.contains(&(RecommendationKind::CapabilityGap, None)));
        assert!(kinds.contains(&(RecommendationKind::FailureHeavy, None)));
    }

    #[tokio::test]
    async fn test_period_excludes_older_work() {
        let (generator, tasks, agents) = setup();
        let agent = agents.register("a", ["x"]).await.unwrap();
        run(&tasks, agent.id, "x", true).await;
        let start = Utc::now() + Duration::seconds(1);
        let report = generator
            .generate(start, start + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.tasks_completed, 0);
        assert!(report.busiest_task_types.is_empty());
    }

    #[test]
    fn test_schedule_parsing() {
        assert!(ReportSchedule::new("not a cron expression").is_err());
        let schedule = ReportSchedule::new("0 0 * * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::hours(1));
        assert_eq!(schedule.expression(), "0 0 * * * * *");
    }

    #[tokio::test]
    async fn test_schedule_run_stops_on_cancel() {
        let (generator, _, _) = setup();
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let schedule = ReportSchedule::new("0 0 0 1 1 * *").unwrap();
        let handle = tokio::spawn(schedule.run(
            Arc::new(generator),
            JsonReportStore::new(dir.path()),
            token.clone(),
        ));
        token.cancel();
        handle.await.unwrap();
    }
}

use crate::alerts::AlertEngine;
use crate::bus::CollaborationBus;
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::metrics::MetricsCollector;
use crate::registry::AgentRegistry;
use crate::report::ReportGenerator;
use crate::resources::SharedResourceStore;
use crate::task_store::TaskStore;
use crate::tick::TickOutcome;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use swarmdeck_core::{
    ActionExecutor, AgentStatus, CollaborationMessage, EventBus, LoggingActionExecutor,
    ResourceProbe, SwarmdeckError, SwarmdeckResult, Task, TaskExecutor, TaskStatus, SYSTEM_SENDER,
};
use swarmdeck_store::Persistence;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Assembles an [`Orchestrator`] from its collaborators.
pub struct OrchestratorBuilder {
    store: Arc<dyn Persistence>,
    executor: Arc<dyn TaskExecutor>,
    action_executor: Option<Arc<dyn ActionExecutor>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Collaborator for alert actions. Defaults to [`LoggingActionExecutor`].
    pub fn action_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.action_executor = Some(executor);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SwarmdeckResult<Orchestrator> {
        self.config.validate()?;
        let config = self.config;
        let db = self.store;
        let events = EventBus::new(config.event_capacity);

        let tasks = Arc::new(TaskStore::new(db.clone(), events.clone()));
        let agents = Arc::new(AgentRegistry::new(db.clone(), tasks.clone(), events.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            tasks.clone(),
            agents.clone(),
            self.executor,
            config.match_policy,
            config.task_timeout(),
        ));
        let bus = Arc::new(CollaborationBus::new(db.clone(), events.clone()));
        let resources = Arc::new(SharedResourceStore::new(db.clone(), events.clone()));
        let metrics = Arc::new(MetricsCollector::new(
            db.clone(),
            agents.clone(),
            tasks.clone(),
            self.probe,
            events.clone(),
            config.metrics_window(),
            config.history_retention,
        ));
        let alerts = Arc::new(AlertEngine::new(
            db,
            metrics.clone(),
            agents.clone(),
            bus.clone(),
            self.action_executor
                .unwrap_or_else(|| Arc::new(LoggingActionExecutor)),
            events.clone(),
            config.cooldown_anchor,
        ));
        let reports = Arc::new(ReportGenerator::new(tasks.clone(), agents.clone()));

        Ok(Orchestrator {
            config,
            events,
            tasks,
            agents,
            dispatcher,
            bus,
            resources,
            metrics,
            alerts,
            reports,
        })
    }
}

/// The wired-up orchestration service.
///
/// Components share one persistence collaborator and one event bus. Running
/// two orchestrators against the same store is not supported.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBus,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<CollaborationBus>,
    resources: Arc<SharedResourceStore>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertEngine>,
    reports: Arc<ReportGenerator>,
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn Persistence>,
        executor: Arc<dyn TaskExecutor>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            executor,
            action_executor: None,
            probe: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn bus(&self) -> &Arc<CollaborationBus> {
        &self.bus
    }

    pub fn resources(&self) -> &Arc<SharedResourceStore> {
        &self.resources
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn reports(&self) -> &Arc<ReportGenerator> {
        &self.reports
    }

    pub async fn submit_task(&self, task: Task) -> SwarmdeckResult<Task> {
        self.tasks.submit(task).await
    }

    /// Cancel a task, aborting its execution if it is running.
    pub async fn cancel_task(&self, task_id: Uuid, reason: Option<String>) -> SwarmdeckResult<Task> {
        self.dispatcher.cancel(task_id, reason).await
    }

    /// Remove an agent. Its assigned and running tasks are cancelled first
    /// and their executions aborted; its urgent-message handler is dropped.
    pub async fn unregister_agent(&self, agent_id: Uuid) -> SwarmdeckResult<()> {
        self.agents.get(agent_id).await?;
        let reason = format!("agent {agent_id} unregistered");
        for task in self.tasks.in_flight_for(agent_id).await? {
            match self.dispatcher.cancel(task.id, Some(reason.clone())).await {
                Ok(_) => info!(task_id = %task.id, agent_id = %agent_id, "Cancelled task of unregistered agent"),
                // Finished concurrently.
                Err(SwarmdeckError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.bus.unregister_handler(agent_id);
        self.agents.unregister(agent_id).await
    }

    /// Send a message on the collaboration bus, stamping the sending
    /// agent's last activity.
    pub async fn send_message(
        &self,
        message: CollaborationMessage,
    ) -> SwarmdeckResult<CollaborationMessage> {
        let sent = self.bus.send(message).await?;
        if sent.sender != SYSTEM_SENDER {
            match self.agents.touch(sent.sender).await {
                Ok(_) | Err(SwarmdeckError::NotFound { .. }) => {}
                Err(e) => warn!(agent_id = %sent.sender, error = %e, "Failed to record sender activity"),
            }
        }
        Ok(sent)
    }

    /// Settle work left in flight by a previous process on the same store.
    ///
    /// Running tasks are failed and assigned ones cancelled, then every
    /// agent's workload is cleared. Call before [`Orchestrator::start`].
    pub async fn recover(&self) -> SwarmdeckResult<usize> {
        let mut settled = 0;
        for task in self.tasks.list_by_status(TaskStatus::Running).await? {
            self.tasks
                .fail(task.id, "interrupted by orchestrator restart")
                .await?;
            settled += 1;
        }
        for task in self.tasks.list_by_status(TaskStatus::Assigned).await? {
            self.tasks
                .cancel(task.id, Some("orchestrator restarted before start".into()))
                .await?;
            settled += 1;
        }
        for agent in self.agents.list().await? {
            if agent.workload.total() > 0 || agent.status == AgentStatus::Running {
                self.agents.reset_workload(agent.id).await?;
            }
        }
        if settled > 0 {
            warn!(tasks = settled, "Settled tasks interrupted by a previous run");
        }
        Ok(settled)
    }

    /// Spawn the scheduling, metrics, and alert loops.
    ///
    /// Each loop ticks on its own interval; a tick that overruns its period
    /// causes the missed ticks to be skipped, not queued.
    pub fn start(&self) -> RuntimeHandle {
        let token = CancellationToken::new();
        let mut handles = Vec::with_capacity(3);

        let dispatcher = self.dispatcher.clone();
        handles.push(spawn_loop(
            "scheduler",
            self.config.scheduler_interval(),
            token.clone(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    match dispatcher.tick().await {
                        Ok(TickOutcome::Completed(report)) if !report.started.is_empty() => {
                            debug!(started = report.started.len(), "Scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
            },
        ));

        let metrics = self.metrics.clone();
        handles.push(spawn_loop(
            "metrics",
            self.config.metrics_interval(),
            token.clone(),
            move || {
                let metrics = metrics.clone();
                async move {
                    if let Err(e) = metrics.collect().await {
                        error!(error = %e, "Metrics collection failed");
                    }
                }
            },
        ));

        let alerts = self.alerts.clone();
        handles.push(spawn_loop(
            "alerts",
            self.config.alert_interval(),
            token.clone(),
            move || {
                let alerts = alerts.clone();
                async move {
                    match alerts.evaluate().await {
                        Ok(TickOutcome::Completed(report)) if !report.errors.is_empty() => {
                            warn!(errors = report.errors.len(), "Rule evaluation had errors");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Rule evaluation failed"),
                    }
                }
            },
        ));

        info!(
            scheduler_ms = self.config.scheduler_interval_ms,
            metrics_ms = self.config.metrics_interval_ms,
            alerts_ms = self.config.alert_interval_ms,
            "Orchestrator started"
        );
        RuntimeHandle {
            token,
            handles,
            dispatcher: self.dispatcher.clone(),
        }
    }
}

/// Control handle for the loops spawned by [`Orchestrator::start`].
pub struct RuntimeHandle {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl RuntimeHandle {
    /// Token cancelled on shutdown; other background work can hang off it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop the loops and wait up to `grace` for running executions.
    ///
    /// Executions still running after `grace` are aborted and their tasks are
    /// left in `running` status.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orchestrator loop ended abnormally");
            }
        }
        self.dispatcher.drain(grace).await;
        info!("Orchestrator stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => tick().await,
            }
        }
        debug!(loop_name = name, "Loop stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use swarmdeck_core::{Agent, ExecutionFailure};
    use swarmdeck_store::MemoryStore;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(
            &self,
            _agent: &Agent,
            task: &Task,
        ) -> Result<serde_json::Value, ExecutionFailure> {
            Ok(task.input.clone())
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            scheduler_interval_ms: 10,
            metrics_interval_ms: 10,
            alert_interval_ms: 10,
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OrchestratorConfig {
            scheduler_interval_ms: 0,
            ..OrchestratorConfig::default()
        };
        let result = Orchestrator::builder(Arc::new(MemoryStore::new()), Arc::new(Echo))
            .config(config)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loops_run_tasks_to_completion() {
        let orchestrator = Orchestrator::builder(Arc::new(MemoryStore::new()), Arc::new(Echo))
            .config(fast_config())
            .build()
            .unwrap();
        orchestrator.agents().register("worker", ["build"]).await.unwrap();
        let task = orchestrator
            .submit_task(Task::new("compile", "build").with_input(serde_json::json!(7)))
            .await
            .unwrap();

        let runtime = orchestrator.start();
        let mut done = None;
        for _ in 0..100 {
            let current = orchestrator.tasks().get(task.id).await.unwrap();
            if current.status == TaskStatus::Completed {
                done = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(done.unwrap().output, Some(serde_json::json!(7)));
        assert!(orchestrator.metrics().system_metrics().is_some());

        runtime.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_recover_settles_interrupted_work() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let first = Orchestrator::builder(store.clone(), Arc::new(Echo))
            .build()
            .unwrap();
        let agent = first.agents().register("w", ["x"]).await.unwrap();
        let running = first.submit_task(Task::new("a", "x")).await.unwrap();
        let assigned = first.submit_task(Task::new("b", "x")).await.unwrap();
        first.tasks().assign(running.id, agent.id).await.unwrap();
        first.tasks().start(running.id).await.unwrap();
        first.agents().mark_assigned(agent.id).await.unwrap();
        first.agents().mark_started(agent.id).await.unwrap();
        first.tasks().assign(assigned.id, agent.id).await.unwrap();
        drop(first);

        let second = Orchestrator::builder(store, Arc::new(Echo)).build().unwrap();
        assert_eq!(second.recover().await.unwrap(), 2);
        assert_eq!(
            second.tasks().get(running.id).await.unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(
            second.tasks().get(assigned.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        let agent = second.agents().get(agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.workload.total(), 0);
        assert_eq!(second.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let orchestrator = Orchestrator::builder(Arc::new(MemoryStore::new()), Arc::new(Echo))
            .config(fast_config())
            .build()
            .unwrap();
        let runtime = orchestrator.start();
        let token = runtime.token();
        assert!(runtime.is_running());
        runtime.shutdown(Duration::from_millis(100)).await;
        assert!(token.is_cancelled());
    }
}

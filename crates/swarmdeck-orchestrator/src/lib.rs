//! Task scheduling, agent matching, collaboration, metrics, and alerting.
//!
//! Every component is a thin stateful service over the [`Persistence`]
//! collaborator; the [`Orchestrator`] wires them together and drives the
//! scheduling, metrics, and alert loops.
//!
//! # Main types
//!
//! - [`Orchestrator`] - Wires the components and spawns the periodic loops.
//! - [`TaskStore`] - Task lifecycle state machine with dependency checks.
//! - [`AgentRegistry`] - Agent records, workload, and capability matching.
//! - [`Dispatcher`] - Matches eligible tasks to idle agents and runs them.
//! - [`CollaborationBus`] / [`SharedResourceStore`] - Messaging and shared state.
//! - [`MetricsCollector`] - Per-agent and system metric sampling.
//! - [`AlertEngine`] - Rule evaluation, alerts, and remediation actions.
//! - [`ReportGenerator`] - Periodic performance summaries.
//!
//! [`Persistence`]: swarmdeck_store::Persistence

/// Alert rule evaluation and remediation.
pub mod alerts;
/// Inter-agent messaging.
pub mod bus;
/// Orchestrator tunables.
pub mod config;
/// Task dispatch and execution.
pub mod dispatcher;
/// Orchestrator service and loops.
pub mod engine;
/// Metrics sampling and history.
pub mod metrics;
/// Agent registry and capability matching.
pub mod registry;
/// Performance reports and their schedule.
pub mod report;
/// JSON persistence for performance reports.
pub mod report_store;
/// Permissioned shared key/value state.
pub mod resources;
/// Task lifecycle and dependencies.
pub mod task_store;
/// Re-entrancy guard for periodic passes.
pub mod tick;

pub use alerts::{AlertEngine, EvaluationReport, RuleError};
pub use bus::CollaborationBus;
pub use config::{CooldownAnchor, MatchPolicy, OrchestratorConfig};
pub use dispatcher::{Assignment, DispatchError, Dispatcher, TickReport};
pub use engine::{Orchestrator, OrchestratorBuilder, RuntimeHandle};
pub use metrics::MetricsCollector;
pub use registry::AgentRegistry;
pub use report::{
    AgentReport, PerformanceReport, Recommendation, RecommendationKind, ReportGenerator,
    ReportSchedule, TaskTypeStats,
};
pub use report_store::JsonReportStore;
pub use resources::SharedResourceStore;
pub use task_store::{TaskStore, TaskSummary};
pub use tick::{TickGuard, TickOutcome};

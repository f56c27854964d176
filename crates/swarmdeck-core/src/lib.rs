//! Core types and error definitions for Swarmdeck.
//!
//! This crate provides the entity model shared by every Swarmdeck crate, the
//! unified error type, the typed event bus, and the contracts for the
//! external collaborators (task execution, alert actions, resource probes).
//!
//! # Main types
//!
//! - [`SwarmdeckError`] - Unified error enum.
//! - [`Agent`] - A registered worker with a capability set.
//! - [`Task`] - A unit of work and its lifecycle status.
//! - [`CollaborationMessage`] / [`SharedResource`] - Inter-agent messaging and state.
//! - [`MonitoringRule`] / [`Alert`] - Threshold rules and the alerts they raise.
//! - [`AgentMetrics`] / [`SystemMetrics`] - Metric snapshots and health classification.
//! - [`EventBus`] - Broadcast of [`OrchestratorEvent`]s.

/// Agent records, status, and performance counters.
pub mod agent;
/// Collaboration messages and shared resources.
pub mod collab;
/// External collaborator contracts.
pub mod contract;
/// Error types.
pub mod error;
/// Typed change events.
pub mod event;
/// Metric snapshots and health classification.
pub mod metrics;
/// Monitoring rules and alerts.
pub mod monitoring;
/// Tasks and the task state machine.
pub mod task;

pub use agent::{Agent, AgentStatus, PerformanceSummary, Workload};
pub use collab::{
    Access, CollaborationMessage, MessageKind, MessagePriority, ResourcePermissions,
    SharedResource, SYSTEM_SENDER,
};
pub use contract::{
    ActionExecutor, ExecutionFailure, LoggingActionExecutor, MessageHandler, ResourceProbe,
    TaskExecutor,
};
pub use error::{SwarmdeckError, SwarmdeckResult};
pub use event::{EventBus, OrchestratorEvent};
pub use metrics::{
    classify_health, AgentMetrics, HealthStatus, MetricScope, MetricsRecord, MetricsSnapshot,
    ResourceUsage, SystemMetrics,
};
pub use monitoring::{
    ActionRecord, ActionType, Alert, AlertAction, AlertStatus, Comparison, MonitoringRule,
    Severity,
};
pub use task::{Task, TaskPriority, TaskStatus};

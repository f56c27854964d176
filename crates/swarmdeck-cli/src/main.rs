mod config;
mod config_watcher;
mod executors;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use config::{AppConfig, RuleConfig, StoreKind};
use config_watcher::ConfigWatcher;
use executors::{ShellActionExecutor, ShellTaskExecutor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmdeck_core::{Task, TaskPriority, TaskStatus};
use swarmdeck_orchestrator::{JsonReportStore, Orchestrator, ReportSchedule};
use swarmdeck_store::{FileStore, MemoryStore, Persistence};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "swarmdeck", about = "Swarmdeck multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "swarmdeck.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, metrics, and alert loops until Ctrl-C
    Run,
    /// List registered agents
    Agents,
    /// Submit a task
    Submit {
        /// Task title
        title: String,
        /// Task type; must match an agent capability
        #[arg(short = 't', long = "type")]
        task_type: String,
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Ids of tasks that must complete first
        #[arg(long = "depends-on")]
        depends_on: Vec<Uuid>,
        /// Task input as JSON
        #[arg(long)]
        input: Option<String>,
    },
    /// List tasks
    Tasks {
        /// Only tasks in this status
        #[arg(short, long)]
        status: Option<String>,
    },
    /// List alerts
    Alerts {
        /// Include resolved alerts
        #[arg(long)]
        all: bool,
    },
    /// Generate a performance report
    Report {
        /// Length of the reporting period ending now
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// Also write the report to the reports directory
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    let orchestrator = Arc::new(build(&config).await?);
    ensure_agents(&orchestrator, &config).await?;

    match cli.command {
        Commands::Run => run(orchestrator, config, cli.config).await?,
        Commands::Agents => {
            for agent in orchestrator.agents().list().await? {
                let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
                println!(
                    "{}  {:<20} {:<8} load={} done={} failed={}  [{}]",
                    agent.id,
                    agent.name,
                    agent.status.to_string(),
                    agent.workload.total(),
                    agent.performance.tasks_completed,
                    agent.performance.tasks_failed,
                    caps.join(", ")
                );
            }
        }
        Commands::Submit {
            title,
            task_type,
            priority,
            depends_on,
            input,
        } => {
            warn_if_ephemeral(&config);
            let priority: TaskPriority = priority.parse().map_err(anyhow::Error::msg)?;
            let mut task = Task::new(title, task_type)
                .with_priority(priority)
                .with_dependencies(depends_on)
                .requested_by("cli");
            if let Some(raw) = input {
                task = task.with_input(
                    serde_json::from_str(&raw).context("--input is not valid JSON")?,
                );
            }
            let task = orchestrator.submit_task(task).await?;
            println!("{}", task.id);
        }
        Commands::Tasks { status } => {
            let tasks = match status {
                Some(raw) => {
                    let status: TaskStatus = raw.parse().map_err(anyhow::Error::msg)?;
                    orchestrator.tasks().list_by_status(status).await?
                }
                None => orchestrator.tasks().list().await?,
            };
            for task in tasks {
                println!(
                    "{}  {:<9} {:<8} {:<16} {}",
                    task.id,
                    task.status.to_string(),
                    task.priority.to_string(),
                    task.task_type,
                    task.title
                );
            }
        }
        Commands::Alerts { all } => {
            let alerts = if all {
                orchestrator.alerts().alerts().await?
            } else {
                orchestrator.alerts().active_alerts().await?
            };
            for alert in alerts {
                println!(
                    "{}  {:<8} {:?}  {}",
                    alert.id,
                    alert.severity.to_string(),
                    alert.status,
                    alert.message
                );
            }
        }
        Commands::Report { hours, save } => {
            let report = orchestrator
                .reports()
                .generate_trailing(chrono::Duration::hours(hours))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if save {
                let path = JsonReportStore::new(config.reports_dir())
                    .save_report(&report)
                    .await?;
                info!(path = %path.display(), "Report saved");
            }
        }
    }
    Ok(())
}

async fn build(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let store: Arc<dyn Persistence> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(
            FileStore::new(&config.store.data_dir)
                .await
                .with_context(|| {
                    format!("opening data dir {}", config.store.data_dir.display())
                })?,
        ),
    };
    let executor = Arc::new(ShellTaskExecutor::new(&config.executors));
    let orchestrator = Orchestrator::builder(store, executor)
        .action_executor(Arc::new(ShellActionExecutor::new(&config.actions)))
        .config(config.orchestrator.clone())
        .build()?;
    Ok(orchestrator)
}

/// Register configured agents that are not registered yet.
async fn ensure_agents(orchestrator: &Orchestrator, config: &AppConfig) -> anyhow::Result<()> {
    let existing: Vec<String> = orchestrator
        .agents()
        .list()
        .await?
        .into_iter()
        .map(|a| a.name)
        .collect();
    for agent in &config.agents {
        if !existing.contains(&agent.name) {
            orchestrator
                .agents()
                .register(&agent.name, agent.capabilities.iter().map(String::as_str))
                .await
                .with_context(|| format!("registering agent '{}'", agent.name))?;
        }
    }
    Ok(())
}

/// Make the stored rule set match `rules`, keeping ids of rules by name.
async fn sync_rules(orchestrator: &Orchestrator, rules: &[RuleConfig]) -> anyhow::Result<usize> {
    let existing: HashMap<String, Uuid> = orchestrator
        .alerts()
        .rules()
        .await?
        .into_iter()
        .map(|r| (r.name, r.id))
        .collect();
    let agents: HashMap<String, Uuid> = orchestrator
        .agents()
        .list()
        .await?
        .into_iter()
        .map(|a| (a.name, a.id))
        .collect();
    let rules = rules
        .iter()
        .map(|r| r.to_rule(&existing, &agents))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orchestrator.alerts().replace_rules(rules).await?)
}

async fn run(
    orchestrator: Arc<Orchestrator>,
    config: AppConfig,
    config_path: PathBuf,
) -> anyhow::Result<()> {
    orchestrator.recover().await?;
    let loaded = sync_rules(&orchestrator, &config.rules).await?;
    info!(rules = loaded, "Monitoring rules loaded");

    let runtime = orchestrator.start();

    let _watcher = if config_path.exists() {
        let handle = tokio::runtime::Handle::current();
        let target = orchestrator.clone();
        Some(ConfigWatcher::start(config_path, 500, move |rules| {
            let target = target.clone();
            handle.spawn(async move {
                match sync_rules(&target, &rules).await {
                    Ok(count) => info!(rules = count, "Monitoring rules reloaded"),
                    Err(e) => warn!(error = %e, "Rule reload rejected"),
                }
            });
        })?)
    } else {
        None
    };

    if let Some(expression) = &config.reports.schedule {
        let schedule = ReportSchedule::new(expression)?;
        info!(schedule = schedule.expression(), "Periodic reports enabled");
        tokio::spawn(schedule.run(
            orchestrator.reports().clone(),
            JsonReportStore::new(config.reports_dir()),
            runtime.token(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    runtime.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn warn_if_ephemeral(config: &AppConfig) {
    if config.store.kind == StoreKind::Memory {
        warn!("Store kind is 'memory'; the submitted task is lost when this command exits");
    }
}

//! Shell-command collaborators for task execution and alert actions.

use crate::config::{ActionCommandConfig, ExecutorConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use swarmdeck_core::{
    ActionExecutor, ActionType, Agent, Alert, AlertAction, ExecutionFailure,
    LoggingActionExecutor, SwarmdeckError, SwarmdeckResult, Task, TaskExecutor,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

struct CommandOutput {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Run `command` under `sh -c` with extra environment and optional stdin.
async fn run_shell(
    command: &str,
    env: &[(String, String)],
    stdin: Option<Vec<u8>>,
) -> std::io::Result<CommandOutput> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Commands that ignore their input may exit before reading it.
        if let Err(e) = pipe.write_all(&bytes).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: truncate_output(&String::from_utf8_lossy(&output.stdout), MAX_STDOUT),
        stderr: truncate_output(&String::from_utf8_lossy(&output.stderr), MAX_STDERR),
    })
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..cut], s.len())
}

/// Executes tasks by running the shell command configured for their type.
///
/// Stdout is the task output (parsed as JSON when it is JSON). A non-zero
/// exit fails the task; a command that cannot be spawned, or a task type
/// with no command, is an agent fault.
pub struct ShellTaskExecutor {
    commands: HashMap<String, String>,
}

impl ShellTaskExecutor {
    pub fn new(configs: &[ExecutorConfig]) -> Self {
        Self {
            commands: configs
                .iter()
                .map(|c| (c.capability.clone(), c.command.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ShellTaskExecutor {
    async fn execute(
        &self,
        agent: &Agent,
        task: &Task,
    ) -> Result<serde_json::Value, ExecutionFailure> {
        let Some(command) = self.commands.get(&task.task_type) else {
            return Err(ExecutionFailure::agent(format!(
                "no command configured for task type '{}'",
                task.task_type
            )));
        };
        info!(task_id = %task.id, agent = %agent.name, command = %command, "Running task command");

        let env = vec![
            ("SWARMDECK_TASK_ID".to_string(), task.id.to_string()),
            ("SWARMDECK_TASK_TITLE".to_string(), task.title.clone()),
            ("SWARMDECK_TASK_TYPE".to_string(), task.task_type.clone()),
            ("SWARMDECK_AGENT".to_string(), agent.name.clone()),
        ];
        let input = serde_json::to_vec(&task.input)
            .map_err(|e| ExecutionFailure::task(format!("unserializable input: {e}")))?;
        let output = run_shell(command, &env, Some(input))
            .await
            .map_err(|e| ExecutionFailure::agent(format!("failed to spawn command: {e}")))?;

        if !output.success {
            return Err(ExecutionFailure::task(format!(
                "command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let trimmed = output.stdout.trim();
        Ok(serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string())))
    }
}

/// Runs alert actions as shell commands, per action type.
///
/// Action types with no command fall back to logging only.
pub struct ShellActionExecutor {
    commands: HashMap<ActionType, String>,
}

impl ShellActionExecutor {
    pub fn new(configs: &[ActionCommandConfig]) -> Self {
        Self {
            commands: configs
                .iter()
                .map(|c| (c.action_type, c.command.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl ActionExecutor for ShellActionExecutor {
    async fn execute(&self, action: &AlertAction, alert: &Alert) -> SwarmdeckResult<String> {
        let Some(command) = self.commands.get(&action.action_type) else {
            return LoggingActionExecutor.execute(action, alert).await;
        };

        let mut env = vec![
            ("SWARMDECK_ALERT_ID".to_string(), alert.id.to_string()),
            ("SWARMDECK_RULE".to_string(), alert.rule_name.clone()),
            ("SWARMDECK_SEVERITY".to_string(), alert.severity.to_string()),
            ("SWARMDECK_METRIC".to_string(), alert.metric.clone()),
            ("SWARMDECK_VALUE".to_string(), alert.current_value.to_string()),
            ("SWARMDECK_MESSAGE".to_string(), alert.message.clone()),
        ];
        if let Some(agent_id) = alert.agent_id {
            env.push(("SWARMDECK_AGENT_ID".to_string(), agent_id.to_string()));
        }
        for (key, value) in &action.parameters {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.push((format!("SWARMDECK_PARAM_{}", key.to_uppercase()), value));
        }

        let output = run_shell(command, &env, None)
            .await
            .map_err(|e| SwarmdeckError::Action(format!("failed to spawn '{command}': {e}")))?;
        if output.success {
            Ok(format!("{} ran: {}", action.action_type, output.stdout.trim()))
        } else {
            warn!(
                action = %action.action_type,
                exit_code = output.exit_code,
                "Action command failed"
            );
            Err(SwarmdeckError::Action(format!(
                "{} exited with {}: {}",
                action.action_type,
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use swarmdeck_core::{Comparison, MonitoringRule, Severity};

    fn executor(command: &str) -> ShellTaskExecutor {
        ShellTaskExecutor::new(&[ExecutorConfig {
            capability: "shell".into(),
            command: command.into(),
        }])
    }

    #[tokio::test]
    async fn test_task_output_from_stdin() {
        let agent = Agent::new("a", ["shell"]);
        let task = Task::new("echo", "shell").with_input(serde_json::json!({"n": 3}));
        let output = executor("cat").execute(&agent, &task).await.unwrap();
        assert_eq!(output, serde_json::json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_plain_text_output_and_env() {
        let agent = Agent::new("worker-7", ["shell"]);
        let task = Task::new("hello", "shell");
        let output = executor("echo \"$SWARMDECK_AGENT:$SWARMDECK_TASK_TITLE\"")
            .execute(&agent, &task)
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!("worker-7:hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_task_fault() {
        let agent = Agent::new("a", ["shell"]);
        let err = executor("echo broken >&2; exit 3")
            .execute(&agent, &Task::new("t", "shell"))
            .await
            .unwrap_err();
        assert!(!err.agent_fault);
        assert!(err.message.contains("exited with 3"));
        assert!(err.message.contains("broken"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_agent_fault() {
        let agent = Agent::new("a", ["other"]);
        let err = executor("true")
            .execute(&agent, &Task::new("t", "other"))
            .await
            .unwrap_err();
        assert!(err.agent_fault);
    }

    #[tokio::test]
    async fn test_action_command_and_fallback() {
        let rule = MonitoringRule::new(
            "cpu",
            "cpu_usage",
            Comparison::GreaterThan,
            90.0,
            Severity::Warning,
        );
        let alert = Alert::from_rule(&rule, 95.0);
        let actions = ShellActionExecutor::new(&[
            ActionCommandConfig {
                action_type: ActionType::RunScript,
                command: "echo \"$SWARMDECK_RULE $SWARMDECK_PARAM_SCRIPT\"".into(),
            },
            ActionCommandConfig {
                action_type: ActionType::ScaleResources,
                command: "exit 1".into(),
            },
        ]);

        let detail = actions
            .execute(
                &AlertAction::new(ActionType::RunScript)
                    .with_param("script", serde_json::json!("cleanup.sh")),
                &alert,
            )
            .await
            .unwrap();
        assert_eq!(detail, "run_script ran: cpu cleanup.sh");

        assert!(actions
            .execute(&AlertAction::new(ActionType::ScaleResources), &alert)
            .await
            .is_err());
        let logged = actions
            .execute(&AlertAction::new(ActionType::Notify), &alert)
            .await
            .unwrap();
        assert_eq!(logged, "notify logged");
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short", 10), "short");
        assert!(truncate_output(&"x".repeat(20), 10).contains("truncated, 20 total bytes"));
    }
}

//! Rule hot-reload.
//!
//! Watches `swarmdeck.toml` and hands the freshly parsed `[[rules]]` list to
//! a callback after a debounce window. Only rules are reloadable; other
//! sections take effect on restart.

use crate::config::RuleConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use swarmdeck_core::{SwarmdeckError, SwarmdeckResult};

#[derive(Debug, Clone, Deserialize)]
struct RulesOnly {
    #[serde(default)]
    rules: Vec<RuleConfig>,
}

/// Keeps the file watch alive; dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread for every burst of writes
    /// that yields a parseable file. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> SwarmdeckResult<Self>
    where
        F: Fn(Vec<RuleConfig>) + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| SwarmdeckError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| SwarmdeckError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);
            while rx.recv().is_ok() {
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match parse_rules(&path) {
                    Ok(rules) => on_reload(rules),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload rules"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Rule hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Read only the `[[rules]]` tables from a config file.
pub fn parse_rules(path: &Path) -> SwarmdeckResult<Vec<RuleConfig>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SwarmdeckError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    let parsed: RulesOnly = toml::from_str(&content).map_err(|e| {
        SwarmdeckError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })?;
    Ok(parsed.rules)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_rules_ignores_other_sections() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[store]
kind = "memory"

[[rules]]
name = "backlog"
metric = "pending_tasks"
comparison = "greater_than"
threshold = 100.0
severity = "warning"
"#
        )
        .unwrap();
        let rules = parse_rules(tmp.path()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].metric, "pending_tasks");
    }

    #[test]
    fn test_parse_invalid_toml_returns_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = parse_rules(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_parse_nonexistent_file_returns_error() {
        let err = parse_rules(Path::new("/nonexistent/swarmdeck.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_reload_fires_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarmdeck.toml");
        std::fs::write(&path, "").unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watcher = ConfigWatcher::start(path.clone(), 50, move |rules| {
            sink.lock().unwrap().push(rules.len());
        })
        .unwrap();

        std::fs::write(
            &path,
            r#"
[[rules]]
name = "errors"
metric = "error_rate"
comparison = ">"
threshold = 10.0
severity = "error"
"#,
        )
        .unwrap();

        for _ in 0..50 {
            if seen.lock().unwrap().contains(&1) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        panic!("reload callback did not fire");
    }
}

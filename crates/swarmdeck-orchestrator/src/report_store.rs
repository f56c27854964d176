use crate::report::PerformanceReport;
use std::path::PathBuf;
use swarmdeck_core::SwarmdeckResult;

/// JSON-file persistence for performance reports.
#[derive(Debug, Clone)]
pub struct JsonReportStore {
    base_dir: PathBuf,
}

impl JsonReportStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Write a report as pretty JSON and return its path.
    ///
    /// File names start with the period end, so name order is period order.
    pub async fn save_report(&self, report: &PerformanceReport) -> SwarmdeckResult<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let filename = format!(
            "report_{}_{}.json",
            report.period_end.format("%Y%m%d_%H%M%S"),
            &report.id.simple().to_string()[..8]
        );
        let path = self.base_dir.join(filename);
        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// The report with the latest period end, if any.
    pub async fn load_latest(&self) -> SwarmdeckResult<Option<PerformanceReport>> {
        match self.list_reports().await?.last() {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }

    /// Report files sorted by name, oldest first.
    pub async fn list_reports(&self) -> SwarmdeckResult<Vec<PathBuf>> {
        if !tokio::fs::try_exists(&self.base_dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("report_") && name.ends_with(".json") {
                    entries.push(path);
                }
            }
        }
        entries.sort();
        Ok(entries)
    }
}

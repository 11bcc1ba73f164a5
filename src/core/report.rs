use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(rename = "identification")]
    Identify,
    Download,
    #[serde(rename = "detection")]
    Detect,
    #[serde(rename = "verification")]
    Verify,
    #[serde(rename = "deduplication")]
    Dedupe,
    Save,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Identify,
        Stage::Download,
        Stage::Detect,
        Stage::Verify,
        Stage::Dedupe,
        Stage::Save,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Identify => "identification",
            Stage::Download => "download",
            Stage::Detect => "detection",
            Stage::Verify => "verification",
            Stage::Dedupe => "deduplication",
            Stage::Save => "save",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Partial,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
    Error,
}

impl RunOutcome {
    /// Final outcome from the saved count: success at or above target,
    /// partial below it, failed with nothing saved.
    pub fn from_saved(saved: usize, target: usize) -> Self {
        if saved == 0 {
            RunOutcome::Failed
        } else if saved >= target {
            RunOutcome::Success
        } else {
            RunOutcome::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub counters: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StageReport {
    pub fn new(stage: Stage, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            counters: BTreeMap::new(),
            detail: None,
        }
    }

    pub fn counter(mut self, key: &str, value: impl TryInto<u64>) -> Self {
        self.counters
            .insert(key.to_string(), value.try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.counters.get(key).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<u64>,
    pub status: RunOutcome,
    /// Stages that actually ran, in execution order.
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            canonical_id: None,
            status: RunOutcome::Failed,
            stages: Vec::new(),
            reason: None,
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn push(&mut self, stage: StageReport) {
        self.stages.push(stage);
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn finish(&mut self, status: RunOutcome, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.finished_at = Some(Utc::now());
    }

    /// Process exit code: 0 success, 1 partial, 2 failure or error,
    /// 3 user interrupt.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            return 3;
        }
        match self.status {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 1,
            RunOutcome::Failed | RunOutcome::Error => 2,
        }
    }

    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(72);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "DATASET REPORT");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Identity:    {}", self.identity);
        if let Some(id) = self.canonical_id {
            let _ = writeln!(out, "Canonical:   {id}");
        }
        let _ = writeln!(out, "Status:      {:?}", self.status);
        let _ = writeln!(out, "Started:     {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "Finished:    {}", finished.to_rfc3339());
        }
        if let Some(reason) = &self.reason {
            let _ = writeln!(out, "Reason:      {reason}");
        }
        if self.interrupted {
            let _ = writeln!(out, "Interrupted: yes (resume with the same command)");
        }
        let _ = writeln!(out, "\nStages:");
        for stage in &self.stages {
            let icon = match stage.status {
                StageStatus::Success => "✓",
                StageStatus::Partial => "◐",
                StageStatus::Skipped => "⊘",
                StageStatus::Failed => "✗",
            };
            let _ = writeln!(
                out,
                " {} {:<16} {:?}",
                icon,
                stage.stage.as_str(),
                stage.status
            );
            for (key, value) in &stage.counters {
                let _ = writeln!(out, "     └─ {key:<22} {value}");
            }
            if let Some(detail) = &stage.detail {
                let _ = writeln!(out, "     └─ {detail}");
            }
        }
        let _ = writeln!(out, "{rule}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_saved() {
        assert_eq!(RunOutcome::from_saved(50, 50), RunOutcome::Success);
        assert_eq!(RunOutcome::from_saved(60, 50), RunOutcome::Success);
        assert_eq!(RunOutcome::from_saved(1, 50), RunOutcome::Partial);
        assert_eq!(RunOutcome::from_saved(0, 50), RunOutcome::Failed);
    }

    #[test]
    fn test_exit_codes() {
        let mut report = RunReport::new("nani");
        report.finish(RunOutcome::Success, None);
        assert_eq!(report.exit_code(), 0);
        report.finish(RunOutcome::Partial, None);
        assert_eq!(report.exit_code(), 1);
        report.finish(RunOutcome::Error, Some("boom".to_string()));
        assert_eq!(report.exit_code(), 2);
        report.interrupted = true;
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn test_stage_keys_serialize_by_name() {
        let mut report = RunReport::new("nani");
        report.push(StageReport::new(Stage::Verify, StageStatus::Skipped).detail("disabled"));
        report.push(StageReport::new(Stage::Download, StageStatus::Failed).counter("downloaded", 0usize));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"][0]["stage"], "verification");
        assert_eq!(json["stages"][0]["status"], "skipped");
        assert_eq!(json["stages"][1]["stage"], "download");
        assert_eq!(json["stages"][1]["counters"]["downloaded"], 0);

        let rendered = report.render();
        assert!(rendered.contains("verification"));
        assert!(rendered.contains("disabled"));
    }
}

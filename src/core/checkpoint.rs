use crate::core::report::Stage;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub counters: BTreeMap<String, u64>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(stage: Stage, counters: BTreeMap<String, u64>) -> Self {
        Self {
            stage,
            counters,
            timestamp: Utc::now(),
        }
    }
}

/// Reads and writes `checkpoint.json`. Writes go through a temp file and a
/// rename so an interrupted write never leaves a truncated checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable checkpoint is treated as "no checkpoint";
    /// files on disk are authoritative anyway.
    pub fn load(&self) -> Option<Checkpoint> {
        let text = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                log::warn!(
                    "Ignoring unreadable checkpoint {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!(
            "Checkpoint written: stage={} counters={:?}",
            checkpoint.stage,
            checkpoint.counters
        );
        Ok(())
    }

    pub fn record(&self, stage: Stage, counters: &BTreeMap<String, u64>) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(stage, counters.clone());
        self.save(&checkpoint)?;
        Ok(checkpoint)
    }
}

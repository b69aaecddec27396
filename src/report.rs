use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ScenarioKind;
use crate::runner::{BenchOutcome, TrialResult};

const HISTORY_FILE: &str = "runs.jsonl";

/// Persisted record of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scenario: ScenarioKind,
    pub slug: String,
    pub url: String,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trials: Vec<TrialResult>,
    pub average_ms: f64,
}

impl RunReport {
    pub fn from_outcome(outcome: BenchOutcome, base_url: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scenario: outcome.kind,
            slug: outcome.scenario.slug,
            url: outcome.scenario.url,
            base_url: base_url.to_string(),
            started_at,
            finished_at: Utc::now(),
            trials: outcome.trials,
            average_ms: outcome.average_ms,
        }
    }
}

/// Writes run reports next to the raw traces and keeps a JSON-L history.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }

    /// Persist `report` as `<root>/<slug>/<scenario>-report.json` and append it
    /// to the run history.
    pub fn record(&self, report: &RunReport) -> Result<PathBuf> {
        let dir = self.root.join(&report.slug);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Unable to create report directory {}", dir.display()))?;
        let path = dir.join(format!("{}-report.json", report.scenario));
        let serialised = serde_json::to_string_pretty(report)?;
        fs::write(&path, serialised)
            .with_context(|| format!("Failed to write report {}", path.display()))?;

        let line = serde_json::to_string(report)?;
        let history = self.history_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&history)
            .with_context(|| format!("Failed to open run history {}", history.display()))?;
        writeln!(file, "{}", line)?;
        Ok(path)
    }

    /// Read the most recent `limit` reports from the run history.
    pub fn read_history(&self, limit: usize) -> Result<Vec<RunReport>> {
        let history = self.history_path();
        if limit == 0 || !history.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&history)
            .with_context(|| format!("Failed to open run history {}", history.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<RunReport> = VecDeque::with_capacity(limit);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let report: RunReport = serde_json::from_str(&line)?;
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(report);
        }

        Ok(buffer.into_iter().collect())
    }
}

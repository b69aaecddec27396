pub mod audit;
pub mod chrome;
pub mod config;
pub mod driver;
pub mod interaction;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod telemetry;
pub mod timeline;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, info_span};

use crate::audit::LighthouseAudit;
use crate::chrome::ChromeDriver;
use crate::config::{BenchSettings, ScenarioKind, default_config_path};
use crate::driver::{BrowserDriver, SessionOptions};
use crate::report::{ReportStore, RunReport};
use crate::runner::BenchRunner;
use crate::scenario::Scenario;

pub use crate::runner::{bench_create, bench_delete, bench_edit, bench_page_load};

/// Wires settings, the browser driver and report persistence together.
pub struct Harness {
    settings: BenchSettings,
    driver: Box<dyn BrowserDriver>,
    reports: ReportStore,
}

impl Harness {
    pub fn new(settings: BenchSettings, driver: Box<dyn BrowserDriver>) -> Self {
        let reports = ReportStore::new(settings.output_root.clone());
        Self {
            settings,
            driver,
            reports,
        }
    }

    /// Harness driving headless Chromium with settings loaded from disk.
    pub fn bootstrap(config_path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = BenchSettings::load_or_default(&config_path)?;
        Ok(Self::new(settings, Box::new(ChromeDriver)))
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut BenchSettings {
        &mut self.settings
    }

    /// Point reports and traces at another directory.
    pub fn set_output_root(&mut self, root: PathBuf) {
        self.reports = ReportStore::new(root.clone());
        self.settings.output_root = root;
    }

    pub fn reports(&self) -> &ReportStore {
        &self.reports
    }

    /// Run one scenario and persist its report.
    pub fn run(&self, kind: ScenarioKind, scenario: &Scenario) -> Result<(RunReport, PathBuf)> {
        let started_at = Utc::now();
        let outcome = BenchRunner::new(self.driver.as_ref(), &self.settings).run(kind, scenario)?;
        let report = RunReport::from_outcome(outcome, &self.settings.browser.base_url, started_at);
        let path = self.reports.record(&report)?;
        info!(
            scenario = %kind,
            slug = %scenario.slug,
            average_ms = report.average_ms,
            report = %path.display(),
            "recorded benchmark report"
        );
        Ok((report, path))
    }

    /// Run the four scenarios in order; the first failure stops the sweep.
    pub fn run_all(&self, scenario: &Scenario) -> Result<Vec<(RunReport, PathBuf)>> {
        ScenarioKind::ALL
            .into_iter()
            .map(|kind| self.run(kind, scenario))
            .collect()
    }

    /// Open the scenario page in a fresh session and audit it with Lighthouse.
    ///
    /// The stripped report is written to `<output_root>/<slug>/lighthouse.json`.
    pub fn audit(&self, scenario: &Scenario, config: &Value) -> Result<(Value, PathBuf)> {
        let span = info_span!("bench.audit", slug = %scenario.slug);
        let _guard = span.enter();

        let slug_dir = self.settings.slug_dir(&scenario.slug);
        let auditor = LighthouseAudit::from_settings(&self.settings.audit, slug_dir.clone())?;
        let url = scenario.target_url(&self.settings.browser.base_url)?;
        let options = SessionOptions::from_settings(&self.settings.browser);

        let mut session = self.driver.launch(&options)?;
        let gathered = session
            .navigate(&url)
            .and_then(|_| auditor.gather(session.as_mut(), config));
        let closed = session.close();
        let report = gathered?;
        closed?;

        std::fs::create_dir_all(&slug_dir)
            .with_context(|| format!("Failed to create {}", slug_dir.display()))?;
        let path = slug_dir.join("lighthouse.json");
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write audit report {}", path.display()))?;
        Ok((report, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{Call, RecordingDriver};
    use tempfile::tempdir;

    fn harness(root: PathBuf, driver: RecordingDriver) -> Harness {
        let mut settings = BenchSettings::default();
        settings.workload.trials = 2;
        settings.workload.items = 3;
        let mut harness = Harness::new(settings, Box::new(driver));
        harness.set_output_root(root);
        harness
    }

    #[test]
    fn run_records_report() {
        let temp = tempdir().unwrap();
        let driver = RecordingDriver::new().with_trace_totals(vec![Some(3.0), Some(5.0)]);
        let harness = harness(temp.path().to_path_buf(), driver);

        let (report, path) = harness
            .run(ScenarioKind::Create, &Scenario::new("vanilla", "vanilla/"))
            .unwrap();
        assert_eq!(report.average_ms, 4.0);
        assert_eq!(path, temp.path().join("vanilla/create-report.json"));
        assert_eq!(harness.reports().read_history(5).unwrap().len(), 1);
    }

    #[test]
    fn run_all_covers_every_scenario() {
        let temp = tempdir().unwrap();
        let driver = RecordingDriver::new();
        let harness = harness(temp.path().to_path_buf(), driver.clone());

        let reports = harness
            .run_all(&Scenario::new("lit", "lit/"))
            .unwrap();
        let kinds: Vec<_> = reports.iter().map(|(report, _)| report.scenario).collect();
        assert_eq!(kinds, ScenarioKind::ALL.to_vec());
        assert_eq!(driver.launches(), 8);
    }

    #[test]
    fn audit_closes_session_on_failure() {
        let temp = tempdir().unwrap();
        let driver = RecordingDriver::new();
        let mut harness = harness(temp.path().to_path_buf(), driver.clone());
        harness.settings_mut().audit.lighthouse_binary =
            Some(temp.path().join("no-such-lighthouse"));

        let result = harness.audit(&Scenario::new("vanilla", "vanilla/"), &Value::Null);
        assert!(result.is_err());
        assert_eq!(driver.calls().last(), Some(&Call::Close));
    }
}

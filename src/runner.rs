use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::config::{BenchSettings, ScenarioKind};
use crate::driver::{BrowserDriver, BrowserSession, SessionOptions};
use crate::scenario::{Scenario, ScenarioScript};
use crate::timeline;

/// Scalar contributed by one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub index: u32,
    pub trace_path: PathBuf,
    /// Top-down total time of the trace, zero when the trace was unusable.
    pub total_time_ms: f64,
}

/// Every trial of one scenario run and their mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchOutcome {
    pub kind: ScenarioKind,
    pub scenario: Scenario,
    pub trials: Vec<TrialResult>,
    pub average_ms: f64,
}

/// Path of the raw trace written by trial `index`.
pub fn trial_trace_path(slug_dir: &Path, index: u32) -> PathBuf {
    slug_dir.join(format!("load-page_{index}.json"))
}

/// Arithmetic mean of the trial scalars; zero for an empty run.
pub fn mean(trials: &[TrialResult]) -> f64 {
    if trials.is_empty() {
        return 0.0;
    }
    let sum = trials
        .iter()
        .fold(0.0, |acc, trial| acc + trial.total_time_ms);
    sum / trials.len() as f64
}

/// Runs scenarios as a sequence of isolated trials.
pub struct BenchRunner<'a> {
    driver: &'a dyn BrowserDriver,
    settings: &'a BenchSettings,
}

impl<'a> BenchRunner<'a> {
    pub fn new(driver: &'a dyn BrowserDriver, settings: &'a BenchSettings) -> Self {
        Self { driver, settings }
    }

    /// Run every trial of `kind` against `scenario`.
    ///
    /// The first failing trial aborts the run; results gathered so far are
    /// discarded.
    pub fn run(&self, kind: ScenarioKind, scenario: &Scenario) -> Result<BenchOutcome> {
        let trials = self.settings.workload.trials;
        if trials == 0 {
            bail!("trial count must be at least 1");
        }

        let span = info_span!("bench.run", scenario = %kind, slug = %scenario.slug);
        let _guard = span.enter();

        let url = scenario.target_url(&self.settings.browser.base_url)?;
        let script = ScenarioScript::from_settings(kind, self.settings);
        let options = SessionOptions::from_settings(&self.settings.browser);
        info!(%url, trials, "starting benchmark");

        let results = (0..trials)
            .map(|index| self.run_trial(&script, &options, scenario, &url, index))
            .collect::<Result<Vec<_>>>()?;
        let average_ms = mean(&results);

        info!(average_ms, "benchmark finished");
        Ok(BenchOutcome {
            kind,
            scenario: scenario.clone(),
            trials: results,
            average_ms,
        })
    }

    fn run_trial(
        &self,
        script: &ScenarioScript,
        options: &SessionOptions,
        scenario: &Scenario,
        url: &str,
        index: u32,
    ) -> Result<TrialResult> {
        let span = info_span!("bench.trial", trial = index);
        let _guard = span.enter();

        let slug_dir = self.settings.slug_dir(&scenario.slug);
        fs::create_dir_all(&slug_dir).with_context(|| {
            format!("Failed to create results directory {}", slug_dir.display())
        })?;
        let trace_path = trial_trace_path(&slug_dir, index);

        let mut session = self
            .driver
            .launch(options)
            .with_context(|| format!("Failed to launch browser for trial {index}"))?;
        let driven = drive(session.as_mut(), script, url, &trace_path);
        let closed = session.close();
        let written = match driven {
            Ok(path) => path,
            Err(err) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "failed to close browser after trial error");
                }
                return Err(err.context(format!("Trial {index} failed")));
            }
        };
        closed.with_context(|| format!("Failed to close browser for trial {index}"))?;

        let total_time_ms = timeline::total_time(&written);
        debug!(path = %written.display(), total_time_ms, "trial complete");
        Ok(TrialResult {
            index,
            trace_path: written,
            total_time_ms,
        })
    }
}

fn drive(
    session: &mut dyn BrowserSession,
    script: &ScenarioScript,
    url: &str,
    trace_path: &Path,
) -> Result<PathBuf> {
    if script.traces_navigation() {
        session.start_tracing(trace_path)?;
        session.navigate(url)?;
    } else {
        session.navigate(url)?;
        script.setup(session)?;
        session.start_tracing(trace_path)?;
    }
    script.measured(session)?;
    session.stop_tracing()
}

/// Average page-load cost of `url` over the configured trials.
pub fn bench_page_load(
    driver: &dyn BrowserDriver,
    settings: &BenchSettings,
    slug: &str,
    url: &str,
) -> Result<f64> {
    bench(driver, settings, ScenarioKind::PageLoad, slug, url)
}

/// Average cost of creating the configured number of items.
pub fn bench_create(
    driver: &dyn BrowserDriver,
    settings: &BenchSettings,
    slug: &str,
    url: &str,
) -> Result<f64> {
    bench(driver, settings, ScenarioKind::Create, slug, url)
}

/// Average cost of deleting pre-populated items one at a time.
pub fn bench_delete(
    driver: &dyn BrowserDriver,
    settings: &BenchSettings,
    slug: &str,
    url: &str,
) -> Result<f64> {
    bench(driver, settings, ScenarioKind::Delete, slug, url)
}

/// Average cost of entering edit mode on pre-populated items.
pub fn bench_edit(
    driver: &dyn BrowserDriver,
    settings: &BenchSettings,
    slug: &str,
    url: &str,
) -> Result<f64> {
    bench(driver, settings, ScenarioKind::Edit, slug, url)
}

fn bench(
    driver: &dyn BrowserDriver,
    settings: &BenchSettings,
    kind: ScenarioKind,
    slug: &str,
    url: &str,
) -> Result<f64> {
    let outcome = BenchRunner::new(driver, settings).run(kind, &Scenario::new(slug, url))?;
    Ok(outcome.average_ms)
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Interaction scripts the harness knows how to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Cold navigation to the application.
    PageLoad,
    /// Add items through the input control.
    Create,
    /// Remove pre-populated items one by one.
    Delete,
    /// Enter edit mode on pre-populated items.
    Edit,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::PageLoad,
        ScenarioKind::Create,
        ScenarioKind::Delete,
        ScenarioKind::Edit,
    ];
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioKind::PageLoad => write!(f, "page-load"),
            ScenarioKind::Create => write!(f, "create"),
            ScenarioKind::Delete => write!(f, "delete"),
            ScenarioKind::Edit => write!(f, "edit"),
        }
    }
}

/// How the edit scenario reaches list rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EditStrategyKind {
    /// Mouse clicks at fixed row offsets.
    Coordinate,
    /// Clicks dispatched through a shadow-piercing locator.
    Locator,
}

impl Default for EditStrategyKind {
    fn default() -> Self {
        EditStrategyKind::Coordinate
    }
}

/// User configuration for the benchmark harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchSettings {
    /// Directory receiving raw traces and reports.
    #[serde(default = "BenchSettings::default_output_root")]
    pub output_root: PathBuf,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub workload: WorkloadSettings,
    #[serde(default)]
    pub selectors: SelectorSettings,
    #[serde(default)]
    pub edit: EditSettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl BenchSettings {
    fn default_output_root() -> PathBuf {
        PathBuf::from("benchmarks-results")
    }

    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Directory holding every artifact produced for `slug`.
    pub fn slug_dir(&self, slug: &str) -> PathBuf {
        self.output_root.join(slug)
    }
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            output_root: Self::default_output_root(),
            browser: BrowserSettings::default(),
            workload: WorkloadSettings::default(),
            selectors: SelectorSettings::default(),
            edit: EditSettings::default(),
            audit: AuditSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

fn bool_true() -> bool {
    true
}

/// Chromium launch parameters shared by every trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    /// Address the application under test is served from.
    #[serde(default = "BrowserSettings::default_base_url")]
    pub base_url: String,
    /// Explicit Chromium binary; auto-detected when unset.
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
    #[serde(default = "bool_true")]
    pub headless: bool,
    /// The local endpoint serves a self-signed certificate.
    #[serde(default = "bool_true")]
    pub ignore_certificate_errors: bool,
    #[serde(default = "BrowserSettings::default_window_width")]
    pub window_width: u32,
    #[serde(default = "BrowserSettings::default_window_height")]
    pub window_height: u32,
    #[serde(default = "BrowserSettings::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound on waiting for Chrome to flush a trace after `Tracing.end`.
    #[serde(default = "BrowserSettings::default_trace_timeout_secs")]
    pub trace_timeout_secs: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl BrowserSettings {
    fn default_base_url() -> String {
        "https://localhost:3001".into()
    }

    const fn default_window_width() -> u32 {
        800
    }

    const fn default_window_height() -> u32 {
        600
    }

    const fn default_idle_timeout_secs() -> u64 {
        120
    }

    const fn default_trace_timeout_secs() -> u64 {
        30
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            chrome_path: None,
            headless: true,
            ignore_certificate_errors: true,
            window_width: Self::default_window_width(),
            window_height: Self::default_window_height(),
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            trace_timeout_secs: Self::default_trace_timeout_secs(),
            extra_args: Vec::new(),
        }
    }
}

/// Repetition counts and item content used by the scenario scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSettings {
    #[serde(default = "WorkloadSettings::default_trials")]
    pub trials: u32,
    /// Items created, deleted or edited per trial.
    #[serde(default = "WorkloadSettings::default_items")]
    pub items: u32,
    #[serde(default = "WorkloadSettings::default_item_text")]
    pub item_text: String,
    #[serde(default = "WorkloadSettings::default_submit_key")]
    pub submit_key: String,
}

impl WorkloadSettings {
    const fn default_trials() -> u32 {
        10
    }

    const fn default_items() -> u32 {
        50
    }

    fn default_item_text() -> String {
        "New todo".into()
    }

    fn default_submit_key() -> String {
        "Enter".into()
    }
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            trials: Self::default_trials(),
            items: Self::default_items(),
            item_text: Self::default_item_text(),
            submit_key: Self::default_submit_key(),
        }
    }
}

/// Shadow-piercing selector paths into the application.
///
/// Each entry is one `querySelector` hop; every hop after the first is
/// resolved inside the previous element's shadow root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSettings {
    #[serde(default = "SelectorSettings::default_input")]
    pub input: Vec<String>,
    #[serde(default = "SelectorSettings::default_delete_button")]
    pub delete_button: Vec<String>,
    /// Path whose final hop matches every list row.
    #[serde(default = "SelectorSettings::default_items")]
    pub items: Vec<String>,
}

impl SelectorSettings {
    fn default_input() -> Vec<String> {
        vec!["my-todo".into(), "todo-input".into(), "input".into()]
    }

    fn default_delete_button() -> Vec<String> {
        vec!["my-todo".into(), "todo-item".into(), "button".into()]
    }

    fn default_items() -> Vec<String> {
        vec!["my-todo".into(), "todo-item".into()]
    }
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            input: Self::default_input(),
            delete_button: Self::default_delete_button(),
            items: Self::default_items(),
        }
    }
}

/// Edit scenario interaction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditSettings {
    #[serde(default)]
    pub strategy: EditStrategyKind,
    #[serde(default = "EditSettings::default_x")]
    pub x: f64,
    /// Vertical position of the first row.
    #[serde(default = "EditSettings::default_start_y")]
    pub start_y: f64,
    /// Row height.
    #[serde(default = "EditSettings::default_step_y")]
    pub step_y: f64,
    #[serde(default = "EditSettings::default_viewport_width")]
    pub viewport_width: u32,
    /// Tall enough to lay out every pre-populated row.
    #[serde(default = "EditSettings::default_viewport_height")]
    pub viewport_height: u32,
}

impl EditSettings {
    const fn default_x() -> f64 {
        140.0
    }

    const fn default_start_y() -> f64 {
        364.0
    }

    const fn default_step_y() -> f64 {
        59.0
    }

    const fn default_viewport_width() -> u32 {
        800
    }

    const fn default_viewport_height() -> u32 {
        6000
    }
}

impl Default for EditSettings {
    fn default() -> Self {
        Self {
            strategy: EditStrategyKind::default(),
            x: Self::default_x(),
            start_y: Self::default_start_y(),
            step_y: Self::default_step_y(),
            viewport_width: Self::default_viewport_width(),
            viewport_height: Self::default_viewport_height(),
        }
    }
}

/// Lighthouse integration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditSettings {
    #[serde(default)]
    pub lighthouse_binary: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Controls the optional JSON log file written next to console output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub json_file: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "LogSettings::default_max_files")]
    pub max_files: usize,
}

impl LogSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json_file: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Default location of the harness configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("sh", "ghostkellz", "TodoBench")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("bench.json"))
}

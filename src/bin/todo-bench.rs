use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use serde_json::Value;
use todo_bench::Harness;
use todo_bench::config::{BenchSettings, EditStrategyKind, ScenarioKind, default_config_path};
use todo_bench::scenario::Scenario;
use todo_bench::telemetry::{current_log_file, init_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "todo-bench", author, version, about = "TodoMVC trace benchmark harness", long_about = None)]
struct BenchCli {
    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Override the default harness configuration path.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    config: Option<PathBuf>,

    /// Location to write traces and reports (defaults to ./benchmarks-results).
    #[arg(long, value_parser = value_parser!(PathBuf))]
    output: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    command: BenchCommand,
}

#[derive(Subcommand, Debug)]
enum BenchCommand {
    /// Measure the initial navigation to the application.
    PageLoad(RunCommand),
    /// Measure creating items through the input control.
    Create(RunCommand),
    /// Measure deleting pre-populated items.
    Delete(RunCommand),
    /// Measure entering edit mode on pre-populated items.
    Edit(EditCommand),
    /// Run page-load, create, delete and edit in sequence.
    All(RunCommand),
    /// Run a Lighthouse audit against the application.
    Audit(AuditCommand),
    /// Print the resolved settings.
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Identifier used to namespace result files.
    #[arg(long)]
    slug: String,

    /// Path of the build variant relative to the base address.
    #[arg(long, default_value = "")]
    url: String,

    /// Override the base address of the application.
    #[arg(long)]
    base_url: Option<String>,
}

impl TargetArgs {
    fn scenario(&self) -> Scenario {
        Scenario::new(&self.slug, &self.url)
    }
}

#[derive(Args, Debug)]
struct RunCommand {
    #[command(flatten)]
    target: TargetArgs,

    /// Number of trials per scenario.
    #[arg(long)]
    trials: Option<u32>,

    /// Items created, deleted or edited per trial.
    #[arg(long)]
    items: Option<u32>,

    /// Show the browser window.
    #[arg(long, action = ArgAction::SetTrue)]
    headed: bool,
}

#[derive(Args, Debug)]
struct EditCommand {
    #[command(flatten)]
    run: RunCommand,

    /// How rows are reached.
    #[arg(long, value_enum)]
    strategy: Option<EditStrategyKind>,
}

#[derive(Args, Debug)]
struct AuditCommand {
    #[command(flatten)]
    target: TargetArgs,

    /// Lighthouse configuration file (JSON).
    #[arg(long, value_parser = value_parser!(PathBuf))]
    config_json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConfigCommand {
    /// Only print the configuration path.
    #[arg(long, action = ArgAction::SetTrue)]
    print_path: bool,
}

fn apply_run_overrides(settings: &mut BenchSettings, cmd: &RunCommand) {
    apply_target_overrides(settings, &cmd.target);
    if let Some(trials) = cmd.trials {
        settings.workload.trials = trials;
    }
    if let Some(items) = cmd.items {
        settings.workload.items = items;
    }
    if cmd.headed {
        settings.browser.headless = false;
    }
}

fn apply_target_overrides(settings: &mut BenchSettings, target: &TargetArgs) {
    if let Some(base_url) = &target.base_url {
        settings.browser.base_url = base_url.clone();
    }
}

fn main() -> Result<()> {
    let cli = BenchCli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };

    if let BenchCommand::Config(cmd) = &cli.command {
        return handle_config(cmd, &config_path);
    }

    let mut harness = Harness::bootstrap(Some(config_path.clone()))?;
    init_tracing(cli.verbose, &harness.settings().logging)?;
    if let Some(path) = current_log_file() {
        info!(path = %path.display(), "writing JSON log");
    }
    info!(path = %config_path.display(), "using harness config");

    if let Some(output) = cli.output.clone() {
        harness.set_output_root(output);
    }
    info!(path = %harness.settings().output_root.display(), "benchmark output root");

    match &cli.command {
        BenchCommand::PageLoad(cmd) => handle_run(&mut harness, ScenarioKind::PageLoad, cmd),
        BenchCommand::Create(cmd) => handle_run(&mut harness, ScenarioKind::Create, cmd),
        BenchCommand::Delete(cmd) => handle_run(&mut harness, ScenarioKind::Delete, cmd),
        BenchCommand::Edit(cmd) => {
            if let Some(strategy) = cmd.strategy {
                harness.settings_mut().edit.strategy = strategy;
            }
            handle_run(&mut harness, ScenarioKind::Edit, &cmd.run)
        }
        BenchCommand::All(cmd) => handle_all(&mut harness, cmd),
        BenchCommand::Audit(cmd) => handle_audit(&mut harness, cmd),
        BenchCommand::Config(_) => Ok(()),
    }
}

fn handle_run(harness: &mut Harness, kind: ScenarioKind, cmd: &RunCommand) -> Result<()> {
    apply_run_overrides(harness.settings_mut(), cmd);
    let (report, path) = harness.run(kind, &cmd.target.scenario())?;
    println!(
        "[{kind}] {}: {:.2} ms average over {} trials (report: {})",
        report.slug,
        report.average_ms,
        report.trials.len(),
        path.display()
    );
    Ok(())
}

fn handle_all(harness: &mut Harness, cmd: &RunCommand) -> Result<()> {
    apply_run_overrides(harness.settings_mut(), cmd);
    for (report, path) in harness.run_all(&cmd.target.scenario())? {
        println!(
            "[{}] {}: {:.2} ms average over {} trials (report: {})",
            report.scenario,
            report.slug,
            report.average_ms,
            report.trials.len(),
            path.display()
        );
    }
    Ok(())
}

fn handle_audit(harness: &mut Harness, cmd: &AuditCommand) -> Result<()> {
    apply_target_overrides(harness.settings_mut(), &cmd.target);
    let config = match &cmd.config_json {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read audit config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Malformed audit config {}", path.display()))?
        }
        None => Value::Null,
    };
    let (report, path) = harness.audit(&cmd.target.scenario(), &config)?;
    let score = report
        .pointer("/lhr/categories/performance/score")
        .or_else(|| report.pointer("/categories/performance/score"))
        .and_then(Value::as_f64);
    match score {
        Some(score) => println!(
            "[audit] {}: performance score {:.0} (report: {})",
            cmd.target.slug,
            score * 100.0,
            path.display()
        ),
        None => println!("[audit] {}: report written to {}", cmd.target.slug, path.display()),
    }
    Ok(())
}

fn handle_config(cmd: &ConfigCommand, config_path: &PathBuf) -> Result<()> {
    if cmd.print_path {
        println!("{}", config_path.display());
        return Ok(());
    }
    let settings = BenchSettings::load_or_default(config_path)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_page_load_target() {
        let cli = BenchCli::parse_from([
            "todo-bench",
            "page-load",
            "--slug",
            "vanilla",
            "--url",
            "vanilla/index.html",
        ]);
        match cli.command {
            BenchCommand::PageLoad(cmd) => {
                assert_eq!(cmd.target.slug, "vanilla");
                assert_eq!(cmd.target.url, "vanilla/index.html");
                assert_eq!(cmd.trials, None);
                assert!(!cmd.headed);
            }
            _ => panic!("expected page-load command"),
        }
    }

    #[test]
    fn parses_edit_strategy() {
        let cli = BenchCli::parse_from([
            "todo-bench",
            "--verbose",
            "edit",
            "--slug",
            "lit",
            "--strategy",
            "locator",
            "--trials",
            "3",
        ]);
        assert!(cli.verbose);
        match cli.command {
            BenchCommand::Edit(cmd) => {
                assert_eq!(cmd.strategy, Some(EditStrategyKind::Locator));
                assert_eq!(cmd.run.trials, Some(3));
                assert_eq!(cmd.run.target.url, "");
            }
            _ => panic!("expected edit command"),
        }
    }

    #[test]
    fn run_overrides_apply_to_settings() {
        let cli = BenchCli::parse_from([
            "todo-bench",
            "delete",
            "--slug",
            "stencil",
            "--trials",
            "4",
            "--items",
            "20",
            "--headed",
            "--base-url",
            "https://127.0.0.1:8443",
        ]);
        let BenchCommand::Delete(cmd) = cli.command else {
            panic!("expected delete command");
        };
        let mut settings = BenchSettings::default();
        apply_run_overrides(&mut settings, &cmd);
        assert_eq!(settings.workload.trials, 4);
        assert_eq!(settings.workload.items, 20);
        assert!(!settings.browser.headless);
        assert_eq!(settings.browser.base_url, "https://127.0.0.1:8443");
    }

    #[test]
    fn slug_is_required() {
        assert!(BenchCli::try_parse_from(["todo-bench", "create"]).is_err());
    }
}

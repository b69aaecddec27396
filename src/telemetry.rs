use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LogSettings;

const LOG_SUFFIX: &str = ".log.jsonl";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_LOG_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the console subscriber, plus a JSON log file when enabled.
pub fn init_tracing(verbose: bool, logging: &LogSettings) -> Result<()> {
    let default_level = if verbose {
        "todo_bench=debug"
    } else {
        "todo_bench=info"
    };
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match build_log_file_layer(logging)? {
        Some((writer, guard, path)) => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            let _ = LOG_GUARD.set(guard);
            let _ = ACTIVE_LOG_FILE.set(path);
            install_subscriber(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

/// Log file receiving JSON output for the current process, if any.
pub fn current_log_file() -> Option<&'static PathBuf> {
    ACTIVE_LOG_FILE.get()
}

fn build_log_file_layer(
    settings: &LogSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.json_file {
        return Ok(None);
    }

    let directory = resolve_log_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file, path) = create_log_file(&directory)?;
    prune_old_logs(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn resolve_log_directory(settings: &LogSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.directory {
        return Ok(dir.clone());
    }
    let dirs = ProjectDirs::from("sh", "ghostkellz", "TodoBench")
        .context("Unable to resolve platform log directory")?;
    Ok(dirs.cache_dir().join("logs"))
}

fn create_log_file(directory: &Path) -> Result<(fs::File, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut candidate = directory.join(format!("todo-bench-{timestamp}{LOG_SUFFIX}"));
    let mut counter = 0;
    while candidate.exists() {
        counter += 1;
        candidate = directory.join(format!("todo-bench-{timestamp}-{counter}{LOG_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&candidate)
        .with_context(|| format!("Failed to open log file {}", candidate.display()))?;
    Ok((file, candidate))
}

fn prune_old_logs(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read log directory {}", directory.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path == keep || !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if !name.ends_with(LOG_SUFFIX) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        entries.push((modified, path));
    }

    entries.sort_by_key(|(modified, _)| Reverse(*modified));

    let retain = max_files.saturating_sub(1);
    for (_, path) in entries.into_iter().skip(retain) {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prune_keeps_newest_logs() {
        let temp = tempdir().unwrap();
        for index in 0..5 {
            let path = temp.path().join(format!("old-{index}{LOG_SUFFIX}"));
            fs::write(&path, "{}").unwrap();
        }
        fs::write(temp.path().join("unrelated.txt"), "x").unwrap();
        let keep = temp.path().join(format!("current{LOG_SUFFIX}"));
        fs::write(&keep, "{}").unwrap();

        prune_old_logs(temp.path(), 3, &keep).unwrap();

        let remaining: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(LOG_SUFFIX))
            .collect();
        assert_eq!(remaining.len(), 3);
        assert!(keep.exists());
        assert!(temp.path().join("unrelated.txt").exists());
    }

    #[test]
    fn disabled_file_logging_builds_no_layer() {
        let settings = LogSettings::default();
        assert!(build_log_file_layer(&settings).unwrap().is_none());
    }
}

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::config::AuditSettings;
use crate::driver::BrowserSession;

const LIGHTHOUSE_ENV: &str = "TODO_BENCH_LIGHTHOUSE";

/// Remote debugging port out of a DevTools endpoint such as
/// `ws://127.0.0.1:52046/devtools/browser/<id>`.
pub fn debugging_port(ws_endpoint: &str) -> Result<u16> {
    let endpoint = Url::parse(ws_endpoint)
        .with_context(|| format!("Malformed DevTools endpoint {ws_endpoint}"))?;
    endpoint
        .port()
        .with_context(|| format!("DevTools endpoint {ws_endpoint} carries no port"))
}

/// Drop the raw artifact payload Lighthouse attaches to its report.
pub fn strip_artifacts(mut report: Value) -> Value {
    if let Some(fields) = report.as_object_mut() {
        fields.remove("artifacts");
    }
    report
}

/// Runs the Lighthouse CLI against a page that a session already has open.
#[derive(Debug, Clone)]
pub struct LighthouseAudit {
    binary: PathBuf,
    extra_args: Vec<String>,
    work_dir: PathBuf,
}

impl LighthouseAudit {
    pub fn new(binary: PathBuf, extra_args: Vec<String>, work_dir: PathBuf) -> Self {
        Self {
            binary,
            extra_args,
            work_dir,
        }
    }

    /// Resolve the Lighthouse binary from settings, the environment or `PATH`.
    pub fn from_settings(settings: &AuditSettings, work_dir: PathBuf) -> Result<Self> {
        let binary = resolve_binary(settings)?;
        Ok(Self::new(binary, settings.extra_args.clone(), work_dir))
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn arguments(&self, url: &str, port: u16, config_path: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            url.to_string(),
            format!("--port={port}"),
            "--output=json".into(),
            "--output-path=stdout".into(),
            "--quiet".into(),
        ];
        if let Some(path) = config_path {
            args.push(format!("--config-path={}", path.display()));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Audit the session's current page with `config`; `Null` uses the
    /// Lighthouse defaults.
    pub fn gather(&self, session: &mut dyn BrowserSession, config: &Value) -> Result<Value> {
        let url = session.current_url()?;
        let endpoint = session.ws_endpoint()?;
        let port = debugging_port(&endpoint)?;

        let config_path = if config.is_null() {
            None
        } else {
            fs::create_dir_all(&self.work_dir).with_context(|| {
                format!("Failed to create audit directory {}", self.work_dir.display())
            })?;
            let path = self.work_dir.join("lighthouse-config.json");
            fs::write(&path, serde_json::to_string_pretty(config)?)
                .with_context(|| format!("Failed to write audit config {}", path.display()))?;
            Some(path)
        };

        let args = self.arguments(&url, port, config_path.as_deref());
        info!(%url, port, binary = %self.binary.display(), "running Lighthouse audit");
        debug!(?args, "lighthouse arguments");
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;
        if !output.status.success() {
            bail!(
                "Lighthouse exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let report: Value = serde_json::from_slice(&output.stdout)
            .context("Lighthouse did not produce a JSON report")?;
        Ok(strip_artifacts(report))
    }
}

fn resolve_binary(settings: &AuditSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.lighthouse_binary {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var(LIGHTHOUSE_ENV) {
        return Ok(PathBuf::from(path));
    }
    which::which("lighthouse").with_context(|| {
        format!("lighthouse not found; set {LIGHTHOUSE_ENV} or configure audit.lighthouse_binary")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::RecordingDriver;
    use crate::driver::{BrowserDriver, SessionOptions};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn port_is_parsed_from_endpoint() {
        let port = debugging_port(
            "ws://127.0.0.1:52046/devtools/browser/675a2fad-4ccf-412b-81bb-170fdb2cc39c",
        )
        .unwrap();
        assert_eq!(port, 52046);
    }

    #[test]
    fn endpoint_without_port_is_rejected() {
        assert!(debugging_port("ws://localhost/devtools/browser/abc").is_err());
        assert!(debugging_port("not an endpoint").is_err());
    }

    #[test]
    fn artifacts_are_removed() {
        let report = json!({
            "lhr": { "categories": { "performance": { "score": 0.97 } } },
            "artifacts": { "traces": { "defaultPass": { "traceEvents": [] } } },
            "report": "{}"
        });
        let stripped = strip_artifacts(report);
        assert!(stripped.get("artifacts").is_none());
        assert_eq!(stripped["lhr"]["categories"]["performance"]["score"], 0.97);
        assert_eq!(strip_artifacts(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn arguments_include_port_and_config() {
        let audit = LighthouseAudit::new(
            PathBuf::from("/usr/bin/lighthouse"),
            vec!["--chrome-flags=--headless".into()],
            PathBuf::from("/tmp/audit"),
        );
        let args = audit.arguments(
            "https://localhost:3001/vanilla/",
            9333,
            Some(Path::new("/tmp/audit/lighthouse-config.json")),
        );
        assert_eq!(args[0], "https://localhost:3001/vanilla/");
        assert!(args.contains(&"--port=9333".to_string()));
        assert!(args.contains(&"--output=json".to_string()));
        assert!(args.contains(&"--config-path=/tmp/audit/lighthouse-config.json".to_string()));
        assert_eq!(args.last().unwrap(), "--chrome-flags=--headless");
    }

    #[test]
    fn configured_binary_wins() {
        let settings = AuditSettings {
            lighthouse_binary: Some(PathBuf::from("/opt/lighthouse/cli.js")),
            extra_args: vec![],
        };
        let audit = LighthouseAudit::from_settings(&settings, PathBuf::from("/tmp")).unwrap();
        assert_eq!(audit.binary(), Path::new("/opt/lighthouse/cli.js"));
    }

    #[test]
    fn failing_binary_surfaces_error() {
        let temp = tempdir().unwrap();
        let audit = LighthouseAudit::new(
            temp.path().join("missing-lighthouse"),
            vec![],
            temp.path().to_path_buf(),
        );
        let driver = RecordingDriver::new();
        let mut session = driver.launch(&SessionOptions::default()).unwrap();
        session.navigate("https://localhost:3001/vanilla/").unwrap();

        let err = audit
            .gather(session.as_mut(), &json!({ "extends": "lighthouse:default" }))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
        assert!(temp.path().join("lighthouse-config.json").exists());
    }
}

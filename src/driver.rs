use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use crate::config::BrowserSettings;

/// Launch parameters for one isolated browser session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headless: bool,
    pub ignore_certificate_errors: bool,
    pub window_size: (u32, u32),
    pub chrome_path: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub trace_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl SessionOptions {
    pub fn from_settings(settings: &BrowserSettings) -> Self {
        Self {
            headless: settings.headless,
            ignore_certificate_errors: settings.ignore_certificate_errors,
            window_size: (settings.window_width, settings.window_height),
            chrome_path: settings.chrome_path.clone(),
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            trace_timeout: Duration::from_secs(settings.trace_timeout_secs),
            extra_args: settings.extra_args.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_settings(&BrowserSettings::default())
    }
}

/// One browser process with a single page, owned by exactly one trial.
pub trait BrowserSession {
    /// Load `url` and wait for the navigation to settle.
    fn navigate(&mut self, url: &str) -> Result<()>;
    /// Evaluate a JavaScript expression in the page; `Null` when it yields nothing.
    fn evaluate(&mut self, expression: &str) -> Result<Value>;
    /// Type into whatever element currently has focus.
    fn type_text(&mut self, text: &str) -> Result<()>;
    fn press_key(&mut self, key: &str) -> Result<()>;
    /// Left click at page coordinates.
    fn click_at(&mut self, x: f64, y: f64) -> Result<()>;
    fn set_viewport(&mut self, width: u32, height: u32) -> Result<()>;
    /// Begin recording a DevTools trace destined for `path`.
    fn start_tracing(&mut self, path: &Path) -> Result<()>;
    /// Finish the active trace and flush it to disk, returning its path.
    fn stop_tracing(&mut self) -> Result<PathBuf>;
    fn current_url(&mut self) -> Result<String>;
    /// DevTools browser endpoint, e.g. `ws://127.0.0.1:9222/devtools/browser/<id>`.
    fn ws_endpoint(&mut self) -> Result<String>;
    /// Tear the browser down. Calling it twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Factory for fresh browser sessions.
pub trait BrowserDriver {
    fn launch(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording driver used to check call order without a browser.

    use std::fs;
    use std::sync::{Arc, Mutex};

    use anyhow::{Context, bail};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Launch(usize),
        Navigate(String),
        Evaluate(String),
        Type(String),
        Press(String),
        Click { x: f64, y: f64 },
        Viewport(u32, u32),
        StartTracing(PathBuf),
        StopTracing,
        Close,
    }

    #[derive(Debug, Default)]
    struct Behaviour {
        /// Top-down total written into each launch's trace; `None` writes garbage.
        trace_totals: Vec<Option<f64>>,
        fail_navigation_on: Option<usize>,
        elements_missing: bool,
        /// Bounding box (left, top, width, height) reported for every element.
        element_box: Option<(f64, f64, f64, f64)>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct RecordingDriver {
        calls: Arc<Mutex<Vec<Call>>>,
        launches: Arc<Mutex<usize>>,
        behaviour: Arc<Mutex<Behaviour>>,
    }

    impl RecordingDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_trace_totals(self, totals: Vec<Option<f64>>) -> Self {
            self.behaviour.lock().unwrap().trace_totals = totals;
            self
        }

        /// Make navigation fail in the session created by launch number `launch`.
        pub fn failing_navigation_on(self, launch: usize) -> Self {
            self.behaviour.lock().unwrap().fail_navigation_on = Some(launch);
            self
        }

        pub fn with_missing_elements(self) -> Self {
            self.behaviour.lock().unwrap().elements_missing = true;
            self
        }

        pub fn with_element_box(self, left: f64, top: f64, width: f64, height: f64) -> Self {
            self.behaviour.lock().unwrap().element_box = Some((left, top, width, height));
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn launches(&self) -> usize {
            *self.launches.lock().unwrap()
        }
    }

    impl BrowserDriver for RecordingDriver {
        fn launch(&self, _options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
            let launch = {
                let mut launches = self.launches.lock().unwrap();
                let current = *launches;
                *launches += 1;
                current
            };
            self.calls.lock().unwrap().push(Call::Launch(launch));
            Ok(Box::new(RecordingSession {
                launch,
                calls: Arc::clone(&self.calls),
                behaviour: Arc::clone(&self.behaviour),
                trace_path: None,
                url: String::from("about:blank"),
                closed: false,
            }))
        }
    }

    struct RecordingSession {
        launch: usize,
        calls: Arc<Mutex<Vec<Call>>>,
        behaviour: Arc<Mutex<Behaviour>>,
        trace_path: Option<PathBuf>,
        url: String,
        closed: bool,
    }

    impl RecordingSession {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl BrowserSession for RecordingSession {
        fn navigate(&mut self, url: &str) -> Result<()> {
            self.record(Call::Navigate(url.to_string()));
            if self.behaviour.lock().unwrap().fail_navigation_on == Some(self.launch) {
                bail!("net::ERR_CONNECTION_REFUSED at {url}");
            }
            self.url = url.to_string();
            Ok(())
        }

        fn evaluate(&mut self, expression: &str) -> Result<Value> {
            self.record(Call::Evaluate(expression.to_string()));
            let behaviour = self.behaviour.lock().unwrap();
            if behaviour.elements_missing {
                return Ok(if expression.contains("getBoundingClientRect") {
                    Value::Null
                } else {
                    Value::Bool(false)
                });
            }
            if expression.contains("getBoundingClientRect") {
                let (left, top, width, height) =
                    behaviour.element_box.unwrap_or((0.0, 0.0, 20.0, 20.0));
                return Ok(json!({ "x": left + width / 2.0, "y": top + height / 2.0 }));
            }
            Ok(Value::Bool(true))
        }

        fn type_text(&mut self, text: &str) -> Result<()> {
            self.record(Call::Type(text.to_string()));
            Ok(())
        }

        fn press_key(&mut self, key: &str) -> Result<()> {
            self.record(Call::Press(key.to_string()));
            Ok(())
        }

        fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
            self.record(Call::Click { x, y });
            Ok(())
        }

        fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
            self.record(Call::Viewport(width, height));
            Ok(())
        }

        fn start_tracing(&mut self, path: &Path) -> Result<()> {
            self.record(Call::StartTracing(path.to_path_buf()));
            self.trace_path = Some(path.to_path_buf());
            Ok(())
        }

        fn stop_tracing(&mut self) -> Result<PathBuf> {
            self.record(Call::StopTracing);
            let path = self.trace_path.take().context("tracing was not started")?;
            let total = self
                .behaviour
                .lock()
                .unwrap()
                .trace_totals
                .get(self.launch)
                .copied()
                .unwrap_or(Some(1.0));
            let body = match total {
                Some(total_ms) => json!({
                    "traceEvents": [
                        { "name": "thread_name", "ph": "M", "pid": 1, "tid": 1, "args": { "name": "CrRendererMain" } },
                        { "name": "RunTask", "ph": "X", "pid": 1, "tid": 1, "ts": 0.0, "dur": total_ms * 1000.0 }
                    ]
                })
                .to_string(),
                None => String::from("{ truncated"),
            };
            fs::write(&path, body)?;
            Ok(path)
        }

        fn current_url(&mut self) -> Result<String> {
            Ok(self.url.clone())
        }

        fn ws_endpoint(&mut self) -> Result<String> {
            Ok(String::from(
                "ws://127.0.0.1:52046/devtools/browser/675a2fad-4ccf-412b-81bb-170fdb2cc39c",
            ))
        }

        fn close(&mut self) -> Result<()> {
            if !self.closed {
                self.closed = true;
                self.record(Call::Close);
            }
            Ok(())
        }
    }
}

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::{Emulation, IO, Runtime, Tracing};
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use serde_json::Value;
use tracing::{debug, warn};

use crate::driver::{BrowserDriver, BrowserSession, SessionOptions};

/// Categories recorded for every trace, matching the DevTools performance panel.
const TRACE_CATEGORIES: &[&str] = &[
    "-*",
    "devtools.timeline",
    "v8.execute",
    "disabled-by-default-devtools.timeline",
    "disabled-by-default-devtools.timeline.frame",
    "toplevel",
    "blink.console",
    "blink.user_timing",
    "latencyInfo",
    "disabled-by-default-devtools.timeline.stack",
    "disabled-by-default-v8.cpu_profiler",
];

/// Launches a dedicated headless Chromium per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeDriver;

impl BrowserDriver for ChromeDriver {
    fn launch(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
        Ok(Box::new(ChromeSession::launch(options)?))
    }
}

/// What the tab listener has seen of the current recording.
#[derive(Debug, Default)]
struct TraceState {
    recording: bool,
    complete: bool,
    data_loss: bool,
    stream: Option<IO::StreamHandle>,
}

type SharedTrace = Arc<(Mutex<TraceState>, Condvar)>;

/// `Tracing.start` parameters: JSON trace data handed back as an IO stream.
fn trace_start() -> Tracing::Start {
    Tracing::Start {
        categories: Some(TRACE_CATEGORIES.join(",")),
        options: None,
        buffer_usage_reporting_interval: None,
        transfer_mode: Some(Tracing::StartTransfer_modeOption::ReturnAsStream),
        stream_format: Some(Tracing::StreamFormat::Json),
        stream_compression: Some(Tracing::StreamCompression::None),
        trace_config: None,
        perfetto_config: None,
        tracing_backend: None,
    }
}

/// Layout viewport override of `width` x `height` CSS pixels at scale 1.
fn viewport_override(width: u32, height: u32) -> Emulation::SetDeviceMetricsOverride {
    Emulation::SetDeviceMetricsOverride {
        width,
        height,
        device_scale_factor: 1.0,
        mobile: false,
        scale: None,
        screen_width: None,
        screen_height: None,
        position_x: None,
        position_y: None,
        dont_set_visible_size: None,
        screen_orientation: None,
        viewport: None,
        display_feature: None,
        device_posture: None,
    }
}

/// `Runtime.evaluate` returning the result as JSON rather than a remote handle.
fn evaluate_by_value(expression: &str) -> Runtime::Evaluate {
    Runtime::Evaluate {
        expression: expression.to_string(),
        return_by_value: Some(true),
        generate_preview: None,
        silent: Some(false),
        await_promise: Some(false),
        include_command_line_api: Some(false),
        user_gesture: Some(false),
        object_group: None,
        context_id: None,
        throw_on_side_effect: None,
        timeout: None,
        disable_breaks: None,
        repl_mode: None,
        allow_unsafe_eval_blocked_by_csp: None,
        unique_context_id: None,
        serialization_options: None,
    }
}

/// Drain an `IO.read` stream into memory, decoding base64 chunks.
///
/// `read` is called until a chunk reports `eof`.
fn collect_stream<F>(mut read: F) -> Result<Vec<u8>>
where
    F: FnMut() -> Result<IO::ReadReturnObject>,
{
    let mut bytes = Vec::new();
    loop {
        let chunk = read()?;
        if chunk.base_64_encoded.unwrap_or(false) {
            let decoded = STANDARD
                .decode(chunk.data.as_bytes())
                .context("Trace chunk is not valid base64")?;
            bytes.extend_from_slice(&decoded);
        } else {
            bytes.extend_from_slice(chunk.data.as_bytes());
        }
        if chunk.eof {
            return Ok(bytes);
        }
    }
}

fn write_trace(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create trace directory {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("Failed to write trace {}", path.display()))
}

/// A Chromium process and the single tab the scenario drives.
pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    trace: SharedTrace,
    trace_path: Option<PathBuf>,
    trace_timeout: Duration,
}

impl ChromeSession {
    pub fn launch(options: &SessionOptions) -> Result<Self> {
        let args: Vec<&OsStr> = options.extra_args.iter().map(OsStr::new).collect();
        let launch_opts = LaunchOptionsBuilder::default()
            .headless(options.headless)
            .ignore_certificate_errors(options.ignore_certificate_errors)
            .window_size(Some(options.window_size))
            .port(None)
            .path(options.chrome_path.clone())
            .idle_browser_timeout(options.idle_timeout)
            .args(args)
            .build()?;
        let browser = Browser::new(launch_opts).context("Failed to launch Chromium")?;
        let tab = browser.new_tab().context("Failed to open a page")?;

        let trace: SharedTrace = Arc::new((Mutex::new(TraceState::default()), Condvar::new()));
        let sink = Arc::clone(&trace);
        tab.add_event_listener(Arc::new(move |event: &Event| {
            let Event::TracingComplete(done) = event else {
                return;
            };
            let (lock, ready) = &*sink;
            let Ok(mut state) = lock.lock() else {
                return;
            };
            if state.recording {
                state.stream = done.params.stream.clone();
                state.data_loss = done.params.data_loss_occurred;
                state.complete = true;
                ready.notify_all();
            }
        }))
        .context("Failed to subscribe to trace events")?;

        debug!(
            pid = ?browser.get_process_id(),
            headless = options.headless,
            "launched Chromium session"
        );
        Ok(Self {
            browser: Some(browser),
            tab,
            trace,
            trace_path: None,
            trace_timeout: options.trace_timeout,
        })
    }

    /// Block until Chromium announces the trace stream.
    fn await_stream(&self) -> Result<IO::StreamHandle> {
        let (lock, ready) = &*self.trace;
        let guard = lock.lock().map_err(|_| anyhow!("trace state poisoned"))?;
        let (mut state, waited) = ready
            .wait_timeout_while(guard, self.trace_timeout, |state| !state.complete)
            .map_err(|_| anyhow!("trace state poisoned"))?;
        state.recording = false;
        if waited.timed_out() {
            bail!(
                "trace did not complete within {}s",
                self.trace_timeout.as_secs()
            );
        }
        if state.data_loss {
            warn!("Chromium reported trace data loss");
        }
        state
            .stream
            .take()
            .context("Tracing completed without a data stream")
    }

    fn read_stream(&self, handle: &IO::StreamHandle) -> Result<Vec<u8>> {
        let collected = collect_stream(|| {
            self.tab
                .call_method(IO::Read {
                    handle: handle.clone(),
                    offset: None,
                    size: None,
                })
                .context("IO.read failed")
        });
        if let Err(err) = self.tab.call_method(IO::Close {
            handle: handle.clone(),
        }) {
            warn!(error = %err, "failed to close trace stream");
        }
        collected
    }
}

impl BrowserSession for ChromeSession {
    fn navigate(&mut self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .with_context(|| format!("Navigation to {url} failed"))?
            .wait_until_navigated()
            .with_context(|| format!("Navigation to {url} did not settle"))?;
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let evaluated = self
            .tab
            .call_method(evaluate_by_value(expression))
            .context("Script evaluation failed")?;
        if let Some(exception) = evaluated.exception_details {
            bail!("Script threw: {}", exception.text);
        }
        Ok(evaluated.result.value.unwrap_or(Value::Null))
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        self.tab.type_str(text)?;
        Ok(())
    }

    fn press_key(&mut self, key: &str) -> Result<()> {
        self.tab.press_key(key)?;
        Ok(())
    }

    fn click_at(&mut self, x: f64, y: f64) -> Result<()> {
        self.tab
            .click_point(Point { x, y })
            .with_context(|| format!("Click at ({x}, {y}) failed"))?;
        Ok(())
    }

    fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.tab
            .call_method(viewport_override(width, height))
            .with_context(|| format!("Resizing viewport to {width}x{height} failed"))?;
        Ok(())
    }

    fn start_tracing(&mut self, path: &Path) -> Result<()> {
        if self.trace_path.is_some() {
            bail!("a trace is already being recorded");
        }
        {
            let mut state = self
                .trace
                .0
                .lock()
                .map_err(|_| anyhow!("trace state poisoned"))?;
            *state = TraceState {
                recording: true,
                ..TraceState::default()
            };
        }
        self.tab
            .call_method(trace_start())
            .context("Tracing.start failed")?;
        self.trace_path = Some(path.to_path_buf());
        Ok(())
    }

    fn stop_tracing(&mut self) -> Result<PathBuf> {
        let path = self
            .trace_path
            .take()
            .context("stop_tracing called without an active trace")?;
        self.tab
            .call_method(Tracing::End(None))
            .context("Tracing.end failed")?;

        let handle = self.await_stream()?;
        let bytes = self.read_stream(&handle)?;
        debug!(path = %path.display(), bytes = bytes.len(), "writing trace");
        write_trace(&path, &bytes)?;
        Ok(path)
    }

    fn current_url(&mut self) -> Result<String> {
        Ok(self.tab.get_url())
    }

    fn ws_endpoint(&mut self) -> Result<String> {
        let browser = self.browser.as_ref().context("Chromium session is closed")?;
        let endpoint = browser.get_ws_url();
        if !endpoint.starts_with("ws") {
            bail!("Chromium exposes no DevTools endpoint: {endpoint}");
        }
        Ok(endpoint)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(browser) = self.browser.take() {
            let pid = browser.get_process_id();
            drop(browser);
            debug!(pid = ?pid, "closed Chromium session");
        }
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{TimelineModel, try_total_time};
    use base64::Engine as _;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    fn chunk(data: &str, encoded: Option<bool>, eof: bool) -> IO::ReadReturnObject {
        IO::ReadReturnObject {
            base_64_encoded: encoded,
            data: data.to_string(),
            eof,
        }
    }

    fn replay(chunks: Vec<IO::ReadReturnObject>) -> Result<Vec<u8>> {
        let mut queue: VecDeque<_> = chunks.into();
        collect_stream(|| queue.pop_front().context("stream read past eof"))
    }

    const MAIN_THREAD: &str = r#"{"name":"thread_name","ph":"M","pid":1,"tid":1,"args":{"name":"CrRendererMain"}}"#;
    const RUN_TASK: &str = r#"{"name":"RunTask","ph":"X","pid":1,"tid":1,"ts":0,"dur":2500}"#;

    #[test]
    fn plain_chunks_concatenate_until_eof() {
        let bytes = replay(vec![
            chunk(r#"{"traceEvents":["#, None, false),
            chunk(MAIN_THREAD, Some(false), false),
            chunk("]}", None, true),
        ])
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            format!(r#"{{"traceEvents":[{MAIN_THREAD}]}}"#)
        );
    }

    #[test]
    fn base64_chunks_are_decoded() {
        let encoded = STANDARD.encode(format!(",{RUN_TASK}"));
        let bytes = replay(vec![
            chunk(&format!(r#"{{"traceEvents":[{MAIN_THREAD}"#), None, false),
            chunk(&encoded, Some(true), false),
            chunk("]}", Some(false), true),
        ])
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(r#""dur":2500"#));
        assert!(TimelineModel::parse(&text).is_ok());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = replay(vec![chunk("%%%not base64", Some(true), true)]).unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn read_errors_stop_collection() {
        assert!(replay(vec![chunk("{", None, false)]).is_err());
    }

    #[test]
    fn streamed_trace_is_measurable_once_written() {
        let temp = tempdir().unwrap();
        let body = format!(r#"{{"traceEvents":[{MAIN_THREAD},{RUN_TASK}],"metadata":{{}}}}"#);
        let (head, tail) = body.split_at(body.len() / 2);
        let bytes = replay(vec![
            chunk(&STANDARD.encode(head), Some(true), false),
            chunk(tail, None, true),
        ])
        .unwrap();

        let path = temp.path().join("vanilla/load-page_0.json");
        write_trace(&path, &bytes).unwrap();
        assert_eq!(try_total_time(&path).unwrap(), 2.5);
    }

    #[test]
    fn tracing_streams_json_with_categories() {
        let start = serde_json::to_value(trace_start()).unwrap();
        assert_eq!(start["transferMode"], "ReturnAsStream");
        assert_eq!(start["streamFormat"], "json");
        assert_eq!(start["streamCompression"], "none");
        let categories = start["categories"].as_str().unwrap();
        assert!(categories.starts_with("-*,"));
        assert!(categories.contains("devtools.timeline"));
    }

    #[test]
    fn evaluation_returns_values() {
        let params = serde_json::to_value(evaluate_by_value("1 + 1")).unwrap();
        assert_eq!(params["expression"], "1 + 1");
        assert_eq!(params["returnByValue"], true);
        assert_eq!(params["awaitPromise"], false);
    }

    #[test]
    fn viewport_override_sets_layout_size() {
        let params = serde_json::to_value(viewport_override(800, 6000)).unwrap();
        assert_eq!(params["width"], 800);
        assert_eq!(params["height"], 6000);
        assert_eq!(params["deviceScaleFactor"], 1.0);
        assert_eq!(params["mobile"], false);
    }
}

//! Minimal DevTools timeline model.
//!
//! Only what the harness needs: pick the renderer main thread out of a
//! Chrome trace, nest its duration events and aggregate them top-down by
//! event name. The root total is the scalar every trial contributes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

const MAIN_THREAD_NAME: &str = "CrRendererMain";

type ThreadKey = (i64, i64);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TraceFile {
    Events(Vec<Value>),
    Object {
        #[serde(rename = "traceEvents")]
        trace_events: Vec<Value>,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    name: String,
    #[serde(default)]
    ph: String,
    #[serde(default)]
    pid: i64,
    #[serde(default)]
    tid: i64,
    /// Microseconds.
    #[serde(default)]
    ts: Option<f64>,
    /// Microseconds.
    #[serde(default)]
    dur: Option<f64>,
    #[serde(default)]
    args: Option<Value>,
}

impl RawEvent {
    fn thread(&self) -> ThreadKey {
        (self.pid, self.tid)
    }

    fn is_duration(&self) -> bool {
        matches!(self.ph.as_str(), "X" | "B" | "E")
    }

    fn names_main_thread(&self) -> bool {
        self.ph == "M"
            && self.name == "thread_name"
            && self
                .args
                .as_ref()
                .and_then(|args| args.get("name"))
                .and_then(Value::as_str)
                == Some(MAIN_THREAD_NAME)
    }
}

#[derive(Debug, Clone)]
struct Span {
    name: String,
    start: f64,
    end: f64,
    children: Vec<usize>,
}

impl Span {
    fn duration(&self) -> f64 {
        self.end - self.start
    }

    fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end <= self.end
    }
}

/// Aggregated node of the top-down tree. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TopDownNode {
    pub name: String,
    pub total_time: f64,
    pub self_time: f64,
    pub children: BTreeMap<String, TopDownNode>,
}

impl TopDownNode {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_time: 0.0,
            self_time: 0.0,
            children: BTreeMap::new(),
        }
    }

    fn finish(&mut self) {
        let mut nested = 0.0;
        for child in self.children.values_mut() {
            child.finish();
            nested += child.total_time;
        }
        self.self_time = (self.total_time - nested).max(0.0);
    }
}

/// Duration events of the renderer main thread, nested by containment.
#[derive(Debug, Clone)]
pub struct TimelineModel {
    thread: ThreadKey,
    spans: Vec<Span>,
    roots: Vec<usize>,
}

impl TimelineModel {
    /// Build a model from the raw contents of a trace file.
    pub fn parse(raw: &str) -> Result<Self> {
        let file: TraceFile =
            serde_json::from_str(raw).context("trace is not a JSON event list")?;
        let values = match file {
            TraceFile::Events(events) => events,
            TraceFile::Object { trace_events } => trace_events,
        };
        let events: Vec<RawEvent> = values
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect();
        if events.is_empty() {
            bail!("trace contains no events");
        }

        let thread = select_main_thread(&events)?;
        let mut spans = collect_spans(&events, thread);
        if spans.is_empty() {
            bail!("main thread {thread:?} recorded no complete duration events");
        }
        spans.sort_by(|a, b| {
            a.start
                .total_cmp(&b.start)
                .then_with(|| b.end.total_cmp(&a.end))
        });

        let mut roots = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        for index in 0..spans.len() {
            while let Some(&top) = stack.last() {
                if spans[top].contains(&spans[index]) {
                    break;
                }
                stack.pop();
            }
            match stack.last() {
                Some(&parent) => spans[parent].children.push(index),
                None => roots.push(index),
            }
            stack.push(index);
        }

        debug!(
            pid = thread.0,
            tid = thread.1,
            spans = spans.len(),
            top_level = roots.len(),
            "built timeline model"
        );
        Ok(Self {
            thread,
            spans,
            roots,
        })
    }

    /// `(pid, tid)` of the thread the model was built from.
    pub fn thread(&self) -> (i64, i64) {
        self.thread
    }

    /// Aggregate the nested spans into a top-down tree keyed by event name.
    pub fn top_down(&self) -> TopDownNode {
        let mut root = TopDownNode::new("root");
        for &index in &self.roots {
            root.total_time += self.spans[index].duration();
            self.merge(&mut root, index);
        }
        root.finish();
        root
    }

    fn merge(&self, parent: &mut TopDownNode, index: usize) {
        let span = &self.spans[index];
        let node = parent
            .children
            .entry(span.name.clone())
            .or_insert_with(|| TopDownNode::new(span.name.clone()));
        node.total_time += span.duration();
        for &child in &span.children {
            self.merge(node, child);
        }
    }
}

fn select_main_thread(events: &[RawEvent]) -> Result<ThreadKey> {
    let main_threads: HashSet<ThreadKey> = events
        .iter()
        .filter(|event| event.names_main_thread())
        .map(RawEvent::thread)
        .collect();

    let mut counts: HashMap<ThreadKey, usize> = HashMap::new();
    for event in events.iter().filter(|event| event.is_duration()) {
        if main_threads.is_empty() || main_threads.contains(&event.thread()) {
            *counts.entry(event.thread()).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|(key_a, count_a), (key_b, count_b)| {
            count_a.cmp(count_b).then_with(|| key_b.cmp(key_a))
        })
        .map(|(key, _)| key)
        .context("trace contains no duration events")
}

fn collect_spans(events: &[RawEvent], thread: ThreadKey) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Vec<(&str, f64)> = Vec::new();

    for event in events.iter().filter(|event| event.thread() == thread) {
        let Some(ts) = event.ts.filter(|ts| ts.is_finite()) else {
            continue;
        };
        match event.ph.as_str() {
            "X" => {
                let Some(dur) = event.dur.filter(|dur| dur.is_finite() && *dur >= 0.0) else {
                    continue;
                };
                spans.push(Span {
                    name: event.name.clone(),
                    start: ts / 1000.0,
                    end: (ts + dur) / 1000.0,
                    children: Vec::new(),
                });
            }
            "B" => open.push((event.name.as_str(), ts)),
            "E" => {
                let Some((name, begin)) = open.pop() else {
                    continue;
                };
                if ts < begin {
                    continue;
                }
                spans.push(Span {
                    name: name.to_string(),
                    start: begin / 1000.0,
                    end: ts / 1000.0,
                    children: Vec::new(),
                });
            }
            _ => {}
        }
    }

    spans
}

/// Top-down total time of the trace at `path`, fallible variant.
pub fn try_total_time(path: &Path) -> Result<f64> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Unable to read trace {}", path.display()))?;
    let model = TimelineModel::parse(&raw)
        .with_context(|| format!("Malformed trace {}", path.display()))?;
    Ok(model.top_down().total_time)
}

/// Top-down total time of the trace at `path` in milliseconds.
///
/// Never fails: an unreadable or malformed trace counts as zero so one bad
/// trial cannot abort a run.
pub fn total_time(path: &Path) -> f64 {
    match try_total_time(path) {
        Ok(total) if total.is_finite() && total >= 0.0 => total,
        Ok(total) => {
            warn!(path = %path.display(), total, "discarding non-finite trace total");
            0.0
        }
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "trace unusable, counting as zero");
            0.0
        }
    }
}

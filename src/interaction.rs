use std::fmt;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::config::{EditSettings, EditStrategyKind};
use crate::driver::BrowserSession;

/// Chain of selectors where each hop after the first is looked up inside the
/// previous element's shadow root.
///
/// Locators are resolved against the live document on every action, so a
/// locator stays valid while the page removes the elements it matched before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    hops: Vec<String>,
}

impl Locator {
    pub fn new<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hops: hops.into_iter().map(Into::into).collect(),
        }
    }

    /// Expression yielding the first matching element, or `undefined`.
    pub fn expression(&self) -> String {
        let mut expression = String::from("document");
        for (index, hop) in self.hops.iter().enumerate() {
            if index > 0 {
                expression.push_str("?.shadowRoot?");
            }
            expression.push_str(&format!(".querySelector({})", js_string(hop)));
        }
        expression
    }

    /// Expression yielding every element matched by the final hop as an array.
    pub fn all_expression(&self) -> String {
        let Some((last, parents)) = self.hops.split_last() else {
            return String::from("[]");
        };
        let scope = if parents.is_empty() {
            String::from("document")
        } else {
            format!("{}?.shadowRoot?", Locator::new(parents.iter().cloned()).expression())
        };
        format!(
            "Array.from({scope}.querySelectorAll({}) ?? [])",
            js_string(last)
        )
    }

    /// Move keyboard focus to the first match.
    pub fn focus(&self, session: &mut dyn BrowserSession) -> Result<()> {
        self.act(session, &self.expression(), "el.focus()")
    }

    /// Click the centre of the first match with real mouse events.
    pub fn click(&self, session: &mut dyn BrowserSession) -> Result<()> {
        self.click_center(session, &self.expression())
    }

    /// Click the centre of the match at `index` with real mouse events.
    pub fn click_nth(&self, session: &mut dyn BrowserSession, index: u32) -> Result<()> {
        let target = format!("{}[{index}]", self.all_expression());
        self.click_center(session, &target)
    }

    fn act(&self, session: &mut dyn BrowserSession, target: &str, action: &str) -> Result<()> {
        let script =
            format!("(() => {{ const el = {target}; if (!el) {{ return false; }} {action}; return true; }})()");
        match session.evaluate(&script)? {
            Value::Bool(true) => Ok(()),
            _ => bail!("no element matches {self}"),
        }
    }

    /// Scroll the target into view, then press and release the mouse over
    /// the centre of its bounding box.
    fn click_center(&self, session: &mut dyn BrowserSession, target: &str) -> Result<()> {
        let center = session.evaluate(&center_script(target))?;
        match (
            center.get("x").and_then(Value::as_f64),
            center.get("y").and_then(Value::as_f64),
        ) {
            (Some(x), Some(y)) => session.click_at(x, y),
            _ => bail!("no element matches {self}"),
        }
    }
}

/// Expression yielding `{ x, y }` viewport coordinates of the target's centre,
/// or `null` when nothing matches.
fn center_script(target: &str) -> String {
    format!(
        "(() => {{ const el = {target}; if (!el) {{ return null; }} \
         el.scrollIntoView({{ block: \"nearest\", inline: \"nearest\" }}); \
         const box = el.getBoundingClientRect(); \
         return {{ x: box.left + box.width / 2, y: box.top + box.height / 2 }}; }})()"
    )
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hops.join(" >>> "))
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""))
}

/// Puts the list row at a given index into edit mode.
pub trait EditInteraction {
    fn edit(&self, session: &mut dyn BrowserSession, row: u32) -> Result<()>;
}

/// Clicks at fixed row offsets.
///
/// Works when rows live in shadow trees the driver cannot query directly,
/// provided the viewport is tall enough to lay every row out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateClicks {
    pub x: f64,
    pub start_y: f64,
    pub step_y: f64,
}

impl CoordinateClicks {
    pub fn position(&self, row: u32) -> (f64, f64) {
        (self.x, self.start_y + self.step_y * f64::from(row))
    }
}

impl EditInteraction for CoordinateClicks {
    fn edit(&self, session: &mut dyn BrowserSession, row: u32) -> Result<()> {
        let (x, y) = self.position(row);
        session.click_at(x, y)
    }
}

/// Clicks rows through a shadow-piercing locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorClicks {
    pub rows: Locator,
}

impl EditInteraction for LocatorClicks {
    fn edit(&self, session: &mut dyn BrowserSession, row: u32) -> Result<()> {
        self.rows.click_nth(session, row)
    }
}

/// Build the configured edit strategy.
pub fn edit_strategy(settings: &EditSettings, rows: Locator) -> Box<dyn EditInteraction> {
    match settings.strategy {
        EditStrategyKind::Coordinate => Box::new(CoordinateClicks {
            x: settings.x,
            start_y: settings.start_y,
            step_y: settings.step_y,
        }),
        EditStrategyKind::Locator => Box::new(LocatorClicks { rows }),
    }
}

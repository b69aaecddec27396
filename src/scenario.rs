use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::{BenchSettings, ScenarioKind, WorkloadSettings};
use crate::driver::BrowserSession;
use crate::interaction::{EditInteraction, Locator, edit_strategy};

/// Build variant of the application under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Namespaces every file the run writes.
    pub slug: String,
    /// Path of the build variant relative to the base address.
    pub url: String,
}

impl Scenario {
    pub fn new(slug: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            url: url.into(),
        }
    }

    /// Absolute address of the variant below `base_url`.
    pub fn target_url(&self, base_url: &str) -> Result<String> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("Invalid base url {base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let target = base
            .join(self.url.trim_start_matches('/'))
            .with_context(|| format!("Invalid scenario url {}", self.url))?;
        Ok(target.into())
    }
}

/// Interaction script for one scenario kind.
///
/// Setup runs before the trace starts and is never measured; only
/// [`ScenarioScript::measured`] runs inside the trace window.
pub struct ScenarioScript {
    kind: ScenarioKind,
    workload: WorkloadSettings,
    input: Locator,
    delete_button: Locator,
    edit: Box<dyn EditInteraction>,
    edit_viewport: (u32, u32),
}

impl ScenarioScript {
    pub fn from_settings(kind: ScenarioKind, settings: &BenchSettings) -> Self {
        let selectors = &settings.selectors;
        Self {
            kind,
            workload: settings.workload.clone(),
            input: Locator::new(selectors.input.iter().cloned()),
            delete_button: Locator::new(selectors.delete_button.iter().cloned()),
            edit: edit_strategy(&settings.edit, Locator::new(selectors.items.iter().cloned())),
            edit_viewport: (settings.edit.viewport_width, settings.edit.viewport_height),
        }
    }

    /// Page load measures the navigation itself, so its trace opens first.
    pub fn traces_navigation(&self) -> bool {
        self.kind == ScenarioKind::PageLoad
    }

    /// Unmeasured preparation after navigation.
    pub fn setup(&self, session: &mut dyn BrowserSession) -> Result<()> {
        match self.kind {
            ScenarioKind::PageLoad | ScenarioKind::Create => Ok(()),
            ScenarioKind::Delete => self.populate(session),
            ScenarioKind::Edit => {
                let (width, height) = self.edit_viewport;
                session.set_viewport(width, height)?;
                self.populate(session)
            }
        }
    }

    /// Interactions recorded in the trace.
    pub fn measured(&self, session: &mut dyn BrowserSession) -> Result<()> {
        match self.kind {
            ScenarioKind::PageLoad => Ok(()),
            ScenarioKind::Create => self.populate(session),
            ScenarioKind::Delete => {
                for index in 0..self.workload.items {
                    self.delete_button
                        .click(session)
                        .with_context(|| format!("Deleting item {index} failed"))?;
                }
                Ok(())
            }
            ScenarioKind::Edit => {
                for row in 0..self.workload.items {
                    self.edit
                        .edit(session, row)
                        .with_context(|| format!("Editing row {row} failed"))?;
                }
                Ok(())
            }
        }
    }

    fn populate(&self, session: &mut dyn BrowserSession) -> Result<()> {
        for index in 0..self.workload.items {
            self.create_item(session)
                .with_context(|| format!("Creating item {index} failed"))?;
        }
        debug!(items = self.workload.items, kind = %self.kind, "created items");
        Ok(())
    }

    fn create_item(&self, session: &mut dyn BrowserSession) -> Result<()> {
        self.input.focus(session)?;
        session.type_text(&self.workload.item_text)?;
        session.press_key(&self.workload.submit_key)
    }
}

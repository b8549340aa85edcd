//! Per-site toggle action

use std::rc::Rc;

use ext_ipc::Message;
use ext_storage::{is_valid_script_id, ScriptStore};
use ext_tabs::{tab_hostname, Tab, TabsApi};
use tracing::{debug, error, warn};

use crate::PopupError;

/// New enabled list after switching `script_id` on or off. Enabling keeps
/// the existing order and appends only when absent.
pub fn apply_toggle(current: &[String], script_id: &str, enabled: bool) -> Vec<String> {
    let mut next = current.to_vec();
    if enabled {
        if !next.iter().any(|id| id == script_id) {
            next.push(script_id.to_string());
        }
    } else {
        next.retain(|id| id != script_id);
    }
    next
}

pub struct PopupController {
    store: Rc<dyn ScriptStore>,
    tabs: Rc<dyn TabsApi>,
}

impl PopupController {
    pub fn new(store: Rc<dyn ScriptStore>, tabs: Rc<dyn TabsApi>) -> Self {
        Self { store, tabs }
    }

    /// Hostname of the active tab and its enabled scripts
    pub async fn enabled_for(&self, tab: &Tab) -> Result<(String, Vec<String>), PopupError> {
        let hostname = tab_hostname(tab).ok_or_else(PopupError::no_active_host)?;
        let enabled = self.store.enabled_scripts(&hostname).await?;
        Ok((hostname, enabled))
    }

    /// Switch one script on or off for the tab's hostname.
    ///
    /// The store write is the only step that can fail the toggle; mirroring
    /// into the page and notifying it are best effort.
    pub async fn toggle(
        &self,
        tab: &Tab,
        script_id: &str,
        enabled: bool,
    ) -> Result<Vec<String>, PopupError> {
        if !is_valid_script_id(script_id) {
            error!(script_id, "Invalid script ID in change event");
            return Err(PopupError::invalid_script_id(script_id));
        }

        let (hostname, current) = self.enabled_for(tab).await?;
        let next = apply_toggle(&current, script_id, enabled);
        self.store.set_enabled_scripts(&hostname, &next).await?;
        debug!(hostname = %hostname, script_id, enabled, "popup.toggle");

        if let Some(tab_id) = tab.id {
            if let Err(e) = self.tabs.write_page_cache(tab_id, &hostname, &next).await {
                warn!(tab_id, error = %e, "Failed to update page cache");
            }

            let notify = Message::ScriptsUpdated {
                hostname: hostname.clone(),
                enabled_scripts: next.clone(),
            };
            if let Err(e) = self.tabs.send_message(tab_id, notify).await {
                warn!(tab_id, error = %e, "Failed to notify page");
            }
        }

        Ok(next)
    }
}

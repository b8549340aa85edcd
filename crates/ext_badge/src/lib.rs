//! Toolbar badge showing how many breaker scripts a tab's hostname has enabled.

use async_trait::async_trait;
use ext_storage::ScriptStore;
use ext_tabs::{tab_hostname, tabs_on_hostname, Tab, TabId, TabsApi};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Badge background used when none is configured
pub const DEFAULT_BADGE_COLOR: &str = "#4688F1";

// ============================================================================
// Error Types (7500+ range)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BadgeErrorCode {
    /// Setting badge state on the action failed
    ActionFailed = 7500,
}

#[derive(Debug, thiserror::Error)]
pub enum BadgeError {
    #[error("[{code}] Badge update failed for tab {tab_id}: {message}")]
    ActionFailed {
        code: u32,
        tab_id: TabId,
        message: String,
    },
}

impl BadgeError {
    pub fn action_failed(tab_id: TabId, message: impl Into<String>) -> Self {
        Self::ActionFailed {
            code: BadgeErrorCode::ActionFailed as u32,
            tab_id,
            message: message.into(),
        }
    }
}

// ============================================================================
// Action Surface
// ============================================================================

/// The extension's toolbar action
#[async_trait(?Send)]
pub trait ActionSurface {
    async fn set_badge_text(&self, tab_id: TabId, text: &str) -> Result<(), BadgeError>;

    async fn set_badge_background_color(&self, tab_id: TabId, color: &str)
        -> Result<(), BadgeError>;
}

/// Badge state of one tab
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Badge {
    pub text: String,
    pub color: Option<String>,
}

/// Action surface that remembers the last badge set on each tab
#[derive(Default)]
pub struct MemoryAction {
    badges: RefCell<BTreeMap<TabId, Badge>>,
}

impl MemoryAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn badge(&self, tab_id: TabId) -> Option<Badge> {
        self.badges.borrow().get(&tab_id).cloned()
    }

    /// Badge text for a tab, empty when never set
    pub fn text(&self, tab_id: TabId) -> String {
        self.badge(tab_id).map(|badge| badge.text).unwrap_or_default()
    }
}

#[async_trait(?Send)]
impl ActionSurface for MemoryAction {
    async fn set_badge_text(&self, tab_id: TabId, text: &str) -> Result<(), BadgeError> {
        self.badges.borrow_mut().entry(tab_id).or_default().text = text.to_string();
        Ok(())
    }

    async fn set_badge_background_color(
        &self,
        tab_id: TabId,
        color: &str,
    ) -> Result<(), BadgeError> {
        self.badges.borrow_mut().entry(tab_id).or_default().color = Some(color.to_string());
        Ok(())
    }
}

// ============================================================================
// Badge Updater
// ============================================================================

/// Derives badge counts from the authoritative store
pub struct BadgeUpdater {
    store: Rc<dyn ScriptStore>,
    tabs: Rc<dyn TabsApi>,
    action: Rc<dyn ActionSurface>,
    color: String,
}

impl BadgeUpdater {
    pub fn new(
        store: Rc<dyn ScriptStore>,
        tabs: Rc<dyn TabsApi>,
        action: Rc<dyn ActionSurface>,
    ) -> Self {
        Self {
            store,
            tabs,
            action,
            color: DEFAULT_BADGE_COLOR.to_string(),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Recompute the badge of one tab from its current URL.
    ///
    /// Tabs without an id, a URL, or an http-style host are left alone.
    pub async fn update_badge_for_tab(&self, tab: &Tab) {
        let Some(tab_id) = tab.id else {
            return;
        };
        let Some(hostname) = tab_hostname(tab) else {
            return;
        };

        match self.store.enabled_scripts(&hostname).await {
            Ok(enabled) => self.update_badge(tab_id, enabled.len()).await,
            Err(e) => warn!(tab_id, hostname = %hostname, error = %e, "Error updating badge for tab"),
        }
    }

    /// Set `count` on every open tab currently showing `hostname`
    pub async fn update_badge_for_hostname(&self, hostname: &str, count: usize) {
        let tabs = match self.tabs.query().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!(hostname, error = %e, "Could not list tabs for badge update");
                return;
            }
        };

        for tab_id in tabs_on_hostname(&tabs, hostname) {
            self.update_badge(tab_id, count).await;
        }
    }

    /// Show `count` on the tab, or clear the badge when it is zero
    pub async fn update_badge(&self, tab_id: TabId, count: usize) {
        debug!(tab_id, count, "badge.update");

        let result = if count > 0 {
            match self.action.set_badge_text(tab_id, &count.to_string()).await {
                Ok(()) => self.action.set_badge_background_color(tab_id, &self.color).await,
                Err(e) => Err(e),
            }
        } else {
            self.action.set_badge_text(tab_id, "").await
        };

        if let Err(e) = result {
            warn!(tab_id, error = %e, "Badge update failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ext_storage::MemoryScriptStore;
    use ext_tabs::MemoryTabs;
    use serde_json::json;

    fn updater(
        entries: Vec<(&str, serde_json::Value)>,
        tabs: Vec<Tab>,
    ) -> (Rc<MemoryAction>, BadgeUpdater) {
        let store = Rc::new(MemoryScriptStore::with_entries(
            entries.into_iter().map(|(k, v)| (k.to_string(), v)),
        ));
        let tabs = Rc::new(MemoryTabs::new(tabs));
        let action = Rc::new(MemoryAction::new());
        let updater = BadgeUpdater::new(store, tabs, action.clone());
        (action, updater)
    }

    #[tokio::test]
    async fn test_badge_counts_valid_ids() {
        let (action, updater) = updater(vec![("example.com", json!(["a", "b", ""]))], vec![]);

        updater
            .update_badge_for_tab(&Tab::new(1, "https://example.com/page"))
            .await;

        assert_eq!(
            action.badge(1),
            Some(Badge {
                text: "2".to_string(),
                color: Some(DEFAULT_BADGE_COLOR.to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_badge_cleared_when_nothing_enabled() {
        let (action, updater) = updater(vec![("example.com", json!(["", " "]))], vec![]);
        action.set_badge_text(1, "5").await.unwrap();

        updater
            .update_badge_for_tab(&Tab::new(1, "https://example.com/"))
            .await;
        updater
            .update_badge_for_tab(&Tab::new(2, "https://unknown.example/"))
            .await;

        assert_eq!(action.text(1), "");
        assert_eq!(action.badge(2).map(|b| b.text), Some(String::new()));
    }

    #[tokio::test]
    async fn test_non_http_tabs_ignored() {
        let (action, updater) = updater(vec![], vec![]);

        updater.update_badge_for_tab(&Tab::new(1, "about:blank")).await;
        updater
            .update_badge_for_tab(&Tab {
                id: Some(2),
                url: None,
            })
            .await;

        assert_eq!(action.badge(1), None);
        assert_eq!(action.badge(2), None);
    }

    #[tokio::test]
    async fn test_update_for_hostname_touches_matching_tabs() {
        let (action, updater) = updater(
            vec![],
            vec![
                Tab::new(1, "https://a.example/x"),
                Tab::new(2, "https://b.example/"),
                Tab::new(3, "http://a.example/y"),
            ],
        );

        updater.update_badge_for_hostname("a.example", 3).await;

        assert_eq!(action.text(1), "3");
        assert_eq!(action.text(3), "3");
        assert_eq!(action.badge(2), None);
    }

    #[tokio::test]
    async fn test_custom_color() {
        let (action, updater) = updater(vec![("a.example", json!(["x"]))], vec![]);
        let updater = updater.with_color("#FF0000");

        updater.update_badge_for_tab(&Tab::new(4, "https://a.example/")).await;

        assert_eq!(action.badge(4).unwrap().color.as_deref(), Some("#FF0000"));
    }
}

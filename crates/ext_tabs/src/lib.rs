//! Browser tab access for the background and popup.
//!
//! Wraps the host's tab facilities: listing tabs, looking one up, running the
//! page-cache update inside a tab, and delivering a message to a tab's page
//! context.

use async_trait::async_trait;
use ext_ipc::Message;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

pub use ext_ipc::{TabId, TabInfo as Tab};

// ============================================================================
// Error Types (7100+ range)
// ============================================================================

/// Error codes for tab operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TabsErrorCode {
    /// Generic tab error
    Generic = 7100,
    /// Tab not found
    TabNotFound = 7101,
    /// Script execution inside the tab failed
    ScriptExecution = 7102,
    /// Message could not be delivered to the tab
    MessageDelivery = 7103,
}

#[derive(Debug, thiserror::Error)]
pub enum TabsError {
    #[error("[{code}] Tabs error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Tab not found: {tab_id}")]
    TabNotFound { code: u32, tab_id: TabId },

    #[error("[{code}] Script execution failed in tab {tab_id}: {message}")]
    ScriptExecution {
        code: u32,
        tab_id: TabId,
        message: String,
    },

    #[error("[{code}] Message delivery failed to tab {tab_id}: {message}")]
    MessageDelivery {
        code: u32,
        tab_id: TabId,
        message: String,
    },
}

impl TabsError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: TabsErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn tab_not_found(tab_id: TabId) -> Self {
        Self::TabNotFound {
            code: TabsErrorCode::TabNotFound as u32,
            tab_id,
        }
    }

    pub fn script_execution(tab_id: TabId, message: impl Into<String>) -> Self {
        Self::ScriptExecution {
            code: TabsErrorCode::ScriptExecution as u32,
            tab_id,
            message: message.into(),
        }
    }

    pub fn message_delivery(tab_id: TabId, message: impl Into<String>) -> Self {
        Self::MessageDelivery {
            code: TabsErrorCode::MessageDelivery as u32,
            tab_id,
            message: message.into(),
        }
    }
}

// ============================================================================
// Hostnames
// ============================================================================

/// Hostname of a URL, or `None` when it does not parse or has no host
/// (`about:blank`, `chrome://` pages without authority, `data:` URLs).
pub fn hostname_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// Hostname of the page a tab currently shows
pub fn tab_hostname(tab: &Tab) -> Option<String> {
    tab.url.as_deref().and_then(hostname_from_url)
}

/// Ids of tabs currently showing `hostname`. Tabs without an id or a
/// parseable URL never match.
pub fn tabs_on_hostname(tabs: &[Tab], hostname: &str) -> Vec<TabId> {
    tabs.iter()
        .filter_map(|tab| {
            let id = tab.id?;
            match tab_hostname(tab) {
                Some(host) if host == hostname => Some(id),
                _ => None,
            }
        })
        .collect()
}

// ============================================================================
// Tabs API
// ============================================================================

#[async_trait(?Send)]
pub trait TabsApi {
    /// Every open tab
    async fn query(&self) -> Result<Vec<Tab>, TabsError>;

    /// Look up one tab
    async fn get(&self, tab_id: TabId) -> Result<Tab, TabsError>;

    /// Run the page-cache update inside the tab's page, replacing the entry
    /// for `hostname` with `scripts`
    async fn write_page_cache(
        &self,
        tab_id: TabId,
        hostname: &str,
        scripts: &[String],
    ) -> Result<(), TabsError>;

    /// Deliver a message to the tab's page context
    async fn send_message(&self, tab_id: TabId, message: Message) -> Result<(), TabsError>;
}

/// In-memory tabs whose page caches and deliveries can be inspected
#[derive(Default)]
pub struct MemoryTabs {
    tabs: RefCell<Vec<Tab>>,
    page_caches: RefCell<BTreeMap<TabId, BTreeMap<String, Vec<String>>>>,
    delivered: RefCell<Vec<(TabId, Message)>>,
    unreachable: RefCell<BTreeSet<TabId>>,
}

impl MemoryTabs {
    pub fn new(tabs: impl IntoIterator<Item = Tab>) -> Self {
        let memory = Self::default();
        memory.tabs.borrow_mut().extend(tabs);
        memory
    }

    pub fn add_tab(&self, tab: Tab) {
        self.tabs.borrow_mut().push(tab);
    }

    /// Make page-context operations on a tab fail, as for privileged pages
    pub fn set_unreachable(&self, tab_id: TabId) {
        self.unreachable.borrow_mut().insert(tab_id);
    }

    pub fn page_cache(&self, tab_id: TabId, hostname: &str) -> Option<Vec<String>> {
        self.page_caches
            .borrow()
            .get(&tab_id)
            .and_then(|cache| cache.get(hostname).cloned())
    }

    pub fn delivered(&self) -> Vec<(TabId, Message)> {
        self.delivered.borrow().clone()
    }

    fn ensure_reachable(&self, tab_id: TabId) -> Result<(), TabsError> {
        if !self.tabs.borrow().iter().any(|tab| tab.id == Some(tab_id)) {
            return Err(TabsError::tab_not_found(tab_id));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl TabsApi for MemoryTabs {
    async fn query(&self) -> Result<Vec<Tab>, TabsError> {
        Ok(self.tabs.borrow().clone())
    }

    async fn get(&self, tab_id: TabId) -> Result<Tab, TabsError> {
        self.tabs
            .borrow()
            .iter()
            .find(|tab| tab.id == Some(tab_id))
            .cloned()
            .ok_or_else(|| TabsError::tab_not_found(tab_id))
    }

    async fn write_page_cache(
        &self,
        tab_id: TabId,
        hostname: &str,
        scripts: &[String],
    ) -> Result<(), TabsError> {
        self.ensure_reachable(tab_id)?;
        if self.unreachable.borrow().contains(&tab_id) {
            return Err(TabsError::script_execution(
                tab_id,
                "Cannot access contents of the page",
            ));
        }

        trace!(tab_id, hostname, "tabs.write_page_cache");
        self.page_caches
            .borrow_mut()
            .entry(tab_id)
            .or_default()
            .insert(hostname.to_string(), scripts.to_vec());
        Ok(())
    }

    async fn send_message(&self, tab_id: TabId, message: Message) -> Result<(), TabsError> {
        self.ensure_reachable(tab_id)?;
        if self.unreachable.borrow().contains(&tab_id) {
            return Err(TabsError::message_delivery(
                tab_id,
                "Receiving end does not exist",
            ));
        }

        self.delivered.borrow_mut().push((tab_id, message));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

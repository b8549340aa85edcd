//! Page-load sequence
//!
//! 1. inject what the page-local cache lists for this hostname
//! 2. ask the authoritative store and inject whatever is still missing
//! 3. write the store's list back into the page-local cache
//! 4. tell the background this tab may need a new badge
//! 5. on `scripts_updated` for this hostname, inject and re-cache
//!
//! Injection is append-only within one load: an id goes in at most once and
//! is never taken back, even when a later list no longer contains it.

use std::cell::RefCell;
use std::rc::Rc;

use ext_ipc::{Message, TabId, TabInfo};
use ext_storage::{filter_script_ids, ScriptStore};
use ext_tabs::hostname_from_url;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{BackgroundMessenger, PageDocument, PageLocalCache, ScriptTag};

/// Identity of the page being loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub hostname: String,
    pub tab: TabInfo,
    /// Base URL of the extension's bundled resources
    pub resource_base: String,
}

impl PageContext {
    /// Context for a page URL; `None` when the URL has no hostname
    pub fn from_url(url: &str, tab_id: Option<TabId>, resource_base: impl Into<String>) -> Option<Self> {
        let hostname = hostname_from_url(url)?;
        Some(Self {
            hostname,
            tab: TabInfo {
                id: tab_id,
                url: Some(url.to_string()),
            },
            resource_base: resource_base.into(),
        })
    }
}

/// What one page load injected, and from where
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLoadReport {
    pub from_cache: Vec<String>,
    pub from_store: Vec<String>,
    pub failed: Vec<String>,
}

enum Injection {
    Injected,
    AlreadyPresent,
    Failed,
}

pub struct InjectionBridge {
    context: PageContext,
    cache: PageLocalCache,
    document: Rc<dyn PageDocument>,
    store: Rc<dyn ScriptStore>,
    messenger: Rc<dyn BackgroundMessenger>,
    injected: RefCell<Vec<String>>,
}

impl InjectionBridge {
    pub fn new(
        context: PageContext,
        cache: PageLocalCache,
        document: Rc<dyn PageDocument>,
        store: Rc<dyn ScriptStore>,
        messenger: Rc<dyn BackgroundMessenger>,
    ) -> Self {
        Self {
            context,
            cache,
            document,
            store,
            messenger,
            injected: RefCell::new(Vec::new()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.context.hostname
    }

    /// Ids injected so far, in injection order
    pub fn injected(&self) -> Vec<String> {
        self.injected.borrow().clone()
    }

    fn inject(&self, script_id: &str) -> Injection {
        if self.injected.borrow().iter().any(|id| id == script_id) {
            return Injection::AlreadyPresent;
        }

        let tag = ScriptTag::breaker(&self.context.resource_base, script_id);
        match self.document.append_script(&tag) {
            Ok(()) => {
                debug!(hostname = %self.context.hostname, script_id, "page.inject");
                self.injected.borrow_mut().push(script_id.to_string());
                Injection::Injected
            }
            Err(e) => {
                warn!(script_id, error = %e, "Failed to inject script");
                Injection::Failed
            }
        }
    }

    fn inject_all(&self, scripts: &[String], injected: &mut Vec<String>, failed: &mut Vec<String>) {
        for id in scripts {
            match self.inject(id) {
                Injection::Injected => injected.push(id.clone()),
                Injection::AlreadyPresent => {}
                Injection::Failed => failed.push(id.clone()),
            }
        }
    }

    /// Run steps 1-4 of the page-load sequence
    pub async fn start(&self) -> PageLoadReport {
        let mut report = PageLoadReport::default();
        let hostname = self.context.hostname.clone();

        let cached = self.cache.read(&hostname);
        self.inject_all(&cached, &mut report.from_cache, &mut report.failed);

        match self.store.enabled_scripts(&hostname).await {
            Ok(latest) => {
                self.inject_all(&latest, &mut report.from_store, &mut report.failed);
                self.cache.write(&hostname, &latest);
            }
            Err(e) => warn!(hostname = %hostname, error = %e, "Failed to read enabled scripts"),
        }

        let notify = Message::TabUpdated {
            tab: self.context.tab.clone(),
        };
        if let Err(e) = self
            .messenger
            .send_message(notify, Some(self.context.tab.clone()))
            .await
        {
            warn!(hostname = %hostname, error = %e, "Failed to notify background");
        }

        report
    }

    /// Handle a message delivered to this page. Returns whether it applied.
    pub fn handle_message(&self, message: &Message) -> bool {
        match message {
            Message::ScriptsUpdated {
                hostname,
                enabled_scripts,
            } if *hostname == self.context.hostname => {
                let scripts = filter_script_ids(enabled_scripts);
                let (mut injected, mut failed) = (Vec::new(), Vec::new());
                self.inject_all(&scripts, &mut injected, &mut failed);
                self.cache.write(hostname, &scripts);
                true
            }
            Message::ScriptsUpdated { .. }
            | Message::UpdateScriptsRegistration { .. }
            | Message::TabUpdated { .. } => false,
        }
    }

    /// Apply messages until the sending side goes away
    pub async fn listen(&self, mut messages: mpsc::Receiver<Message>) {
        while let Some(message) = messages.recv().await {
            self.handle_message(&message);
        }
    }
}

//! Background service
//!
//! Owns the script registry and badge updater and routes every host event
//! to them: lifecycle events, storage changes, page messages and tab
//! activity. All handlers run on one thread; an await point is the only
//! place another event can interleave.

use std::rc::Rc;

use ext_badge::{ActionSurface, BadgeUpdater};
use ext_ipc::{IpcEnvelope, Message, MessageResponse};
use ext_scripting::{ReconcileReport, RegistrationFacility, ScriptRegistry};
use ext_storage::{valid_script_ids, ScriptStore, StorageChange};
use ext_tabs::{tabs_on_hostname, Tab, TabId, TabsApi};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, CapabilityError};
use crate::config::Config;

/// Load state reported with a tab update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Host events delivered to the background
#[derive(Debug, Clone)]
pub enum BackgroundEvent {
    /// Browser session started
    Startup,
    /// Extension installed or updated
    Installed,
    /// A key in the authoritative store changed
    StorageChanged(StorageChange),
    /// A message without a reply slot
    Message { message: Message, sender: Option<Tab> },
    /// The user switched to a tab
    TabActivated { tab_id: TabId },
    /// A tab navigated or finished loading
    TabUpdated { tab: Tab, status: Option<TabStatus> },
}

/// Result of mirroring a list into one tab's page cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutOutcome {
    pub tab_id: TabId,
    pub result: Result<(), String>,
}

/// Host services the background drives
pub struct HostApis {
    pub store: Rc<dyn ScriptStore>,
    pub tabs: Rc<dyn TabsApi>,
    pub facility: Rc<dyn RegistrationFacility>,
    pub action: Rc<dyn ActionSurface>,
}

pub struct Background {
    registry: ScriptRegistry,
    badge: BadgeUpdater,
    store: Rc<dyn ScriptStore>,
    tabs: Rc<dyn TabsApi>,
    capabilities: Capabilities,
}

impl Background {
    pub fn new(apis: HostApis, capabilities: Capabilities, badge_color: &str) -> Self {
        let HostApis {
            store,
            tabs,
            facility,
            action,
        } = apis;

        Self {
            registry: ScriptRegistry::new(facility),
            badge: BadgeUpdater::new(store.clone(), tabs.clone(), action).with_color(badge_color),
            store,
            tabs,
            capabilities,
        }
    }

    /// Background configured from `breaker.toml`: host permissions and badge
    /// colour
    pub fn from_config(
        apis: HostApis,
        config: &Config,
        dev_mode: bool,
    ) -> Result<Self, CapabilityError> {
        let capabilities = Capabilities::from_permissions(config.permissions.as_ref(), dev_mode)?;
        Ok(Self::new(apis, capabilities, config.badge_color()))
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    /// Process load: flush stale registrations, then bring every stored
    /// hostname back into effect. Returns the number of hostnames swept.
    pub async fn start(&self) -> usize {
        self.registry.initialize().await;

        let entries = match self.store.get_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to read stored script lists");
                return 0;
            }
        };

        let mut swept = 0;
        for (hostname, value) in entries {
            if !value.is_array() {
                continue;
            }
            let ids = valid_script_ids(&value);
            self.badge.update_badge_for_hostname(&hostname, ids.len()).await;
            self.reconcile(&hostname, &ids).await;
            swept += 1;
        }

        info!(hostnames = swept, "Background started");
        swept
    }

    /// Reconcile one hostname if host permissions allow it
    pub async fn reconcile(&self, hostname: &str, ids: &[String]) -> ReconcileReport {
        if let Err(e) = self.capabilities.check_host(hostname) {
            debug!(hostname, error = %e, "Not registering scripts");
            return ReconcileReport::skipped();
        }
        self.registry.reconcile(hostname, ids).await
    }

    /// Dispatch one host event. Only messages produce a response.
    pub async fn handle(&self, event: BackgroundEvent) -> Option<MessageResponse> {
        match event {
            BackgroundEvent::Startup | BackgroundEvent::Installed => {
                self.registry.initialize().await;
                None
            }
            BackgroundEvent::StorageChanged(change) => {
                self.handle_storage_change(change).await;
                None
            }
            BackgroundEvent::Message { message, sender } => {
                Some(self.handle_message(message, sender).await)
            }
            BackgroundEvent::TabActivated { tab_id } => {
                match self.tabs.get(tab_id).await {
                    Ok(tab) => self.badge.update_badge_for_tab(&tab).await,
                    Err(e) => debug!(tab_id, error = %e, "Activated tab is gone"),
                }
                None
            }
            BackgroundEvent::TabUpdated { tab, status } => {
                if status == Some(TabStatus::Complete) {
                    self.badge.update_badge_for_tab(&tab).await;
                }
                None
            }
        }
    }

    pub async fn handle_message(&self, message: Message, sender: Option<Tab>) -> MessageResponse {
        debug!(kind = message.kind(), "background.message");
        match message {
            Message::UpdateScriptsRegistration {
                hostname,
                enabled_scripts,
            } => {
                self.reconcile(&hostname, &enabled_scripts).await;
                MessageResponse::ok()
            }
            Message::TabUpdated { mut tab } => {
                if tab.id.is_none() {
                    tab.id = sender.and_then(|sender| sender.id);
                }
                self.badge.update_badge_for_tab(&tab).await;
                MessageResponse::ok()
            }
            // Addressed to pages
            Message::ScriptsUpdated { .. } => MessageResponse::unhandled(),
        }
    }

    /// Apply a store change: re-register and mirror into open pages.
    ///
    /// A removed key counts as an empty list. Values that are not lists are
    /// not ours and are ignored.
    pub async fn handle_storage_change(&self, change: StorageChange) -> Vec<FanOutOutcome> {
        let ids = match &change.new_value {
            None => Vec::new(),
            Some(value @ Value::Array(_)) => valid_script_ids(value),
            Some(_) => {
                debug!(key = %change.key, "Ignoring non-list storage value");
                return Vec::new();
            }
        };

        self.reconcile(&change.key, &ids).await;
        self.sync_page_caches(&change.key, &ids).await
    }

    /// Write `ids` into the page cache of every open tab on `hostname`.
    ///
    /// Tabs are written concurrently and one failure does not affect the
    /// others.
    pub async fn sync_page_caches(&self, hostname: &str, ids: &[String]) -> Vec<FanOutOutcome> {
        let tabs = match self.tabs.query().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!(error = %e, "Failed to list tabs");
                return Vec::new();
            }
        };

        let writes = tabs_on_hostname(&tabs, hostname).into_iter().map(|tab_id| async move {
            let result = self
                .tabs
                .write_page_cache(tab_id, hostname, ids)
                .await
                .map_err(|e| e.to_string());
            if let Err(e) = &result {
                warn!(tab_id, error = %e, "Failed to update page cache");
            }
            FanOutOutcome { tab_id, result }
        });

        join_all(writes).await
    }

    /// Serve events until the host event channel closes.
    ///
    /// Store changes are drained before messages and messages before host
    /// events.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<BackgroundEvent>,
        mut messages: mpsc::Receiver<IpcEnvelope>,
        mut changes: broadcast::Receiver<StorageChange>,
    ) {
        let mut messages_open = true;
        let mut changes_open = true;

        loop {
            tokio::select! {
                biased;

                change = changes.recv(), if changes_open => match change {
                    Ok(change) => {
                        self.handle_storage_change(change).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Storage change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },

                envelope = messages.recv(), if messages_open => match envelope {
                    Some(envelope) => {
                        let response = self
                            .handle_message(envelope.message.clone(), envelope.sender.clone())
                            .await;
                        envelope.reply(response);
                    }
                    None => messages_open = false,
                },

                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                    }
                    None => break,
                },
            }
        }

        debug!("Background event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_badge::MemoryAction;
    use ext_ipc::ipc_channel;
    use ext_page::{
        InjectionBridge, MemoryDocument, MemoryPageStorage, PageContext, PageLocalCache,
    };
    use ext_scripting::{ContentScriptDescriptor, FacilityCall, MemoryFacility, ScriptingError};
    use ext_storage::MemoryScriptStore;
    use ext_tabs::MemoryTabs;
    use serde_json::json;

    use crate::capabilities::{HostPermissions, Permissions};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    struct Harness {
        store: Rc<MemoryScriptStore>,
        tabs: Rc<MemoryTabs>,
        facility: Rc<MemoryFacility>,
        action: Rc<MemoryAction>,
    }

    impl Harness {
        fn new(store: MemoryScriptStore, tabs: MemoryTabs, facility: MemoryFacility) -> Self {
            Self {
                store: Rc::new(store),
                tabs: Rc::new(tabs),
                facility: Rc::new(facility),
                action: Rc::new(MemoryAction::new()),
            }
        }

        fn background(&self, capabilities: Capabilities) -> Background {
            Background::new(
                HostApis {
                    store: self.store.clone(),
                    tabs: self.tabs.clone(),
                    facility: self.facility.clone(),
                    action: self.action.clone(),
                },
                capabilities,
                ext_badge::DEFAULT_BADGE_COLOR,
            )
        }
    }

    #[tokio::test]
    async fn test_start_flushes_then_restores_stored_hosts() {
        let stale = ContentScriptDescriptor::breaker("ad_1_deadbeef", "old.example", "gone");
        let foreign = ContentScriptDescriptor::breaker("other-extension", "x.example", "keep");
        let h = Harness::new(
            MemoryScriptStore::with_entries([
                ("a.example".to_string(), json!(["x", "y", ""])),
                ("localhost".to_string(), json!(["x"])),
                ("settings".to_string(), json!({"theme": "dark"})),
            ]),
            MemoryTabs::new([Tab::new(1, "https://a.example/home")]),
            MemoryFacility::with_registered([stale, foreign]),
        );
        let background = h.background(Capabilities::permissive());

        assert_eq!(background.start().await, 2);

        let calls = h.facility.calls();
        assert_eq!(calls[0], FacilityCall::List);
        assert_eq!(calls[1], FacilityCall::Unregister(ids(&["ad_1_deadbeef"])));
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x", "y"]));
        assert!(h.facility.script_ids_for("localhost").is_empty());
        assert_eq!(h.facility.script_ids_for("x.example"), ids(&["keep"]));
        assert_eq!(h.action.text(1), "2");

        // Lifecycle events after start do not flush again
        background.handle(BackgroundEvent::Startup).await;
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x", "y"]));
    }

    #[tokio::test]
    async fn test_start_survives_failed_flush() {
        let h = Harness::new(
            MemoryScriptStore::with_entries([("a.example".to_string(), json!(["x"]))]),
            MemoryTabs::default(),
            MemoryFacility::new(),
        );
        h.facility
            .fail_next_list(ScriptingError::query_failed("scripting unavailable"));
        let background = h.background(Capabilities::permissive());

        background.start().await;
        assert!(!background.registry().is_initialized());
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x"]));

        background.handle(BackgroundEvent::Installed).await;
        assert!(background.registry().is_initialized());
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x"]));

        // The registry still tracks the live registration
        background
            .handle_storage_change(StorageChange {
                key: "a.example".to_string(),
                new_value: Some(json!([])),
            })
            .await;
        assert!(h.facility.script_ids_for("a.example").is_empty());
    }

    #[tokio::test]
    async fn test_from_config_applies_badge_color_and_permissions() {
        let config = Config::from_toml(
            r##"
            [badge]
            color = "#FF8800"

            [permissions.hosts]
            deny = ["*.internal.example"]
            "##,
        )
        .unwrap();
        let h = Harness::new(
            MemoryScriptStore::with_entries([
                ("a.example".to_string(), json!(["x"])),
                ("wiki.internal.example".to_string(), json!(["x"])),
            ]),
            MemoryTabs::new([Tab::new(1, "https://a.example/")]),
            MemoryFacility::new(),
        );
        let background = Background::from_config(
            HostApis {
                store: h.store.clone(),
                tabs: h.tabs.clone(),
                facility: h.facility.clone(),
                action: h.action.clone(),
            },
            &config,
            false,
        )
        .unwrap();

        background.start().await;

        let badge = h.action.badge(1).unwrap();
        assert_eq!(badge.text, "1");
        assert_eq!(badge.color.as_deref(), Some("#FF8800"));
        assert!(h.facility.script_ids_for("wiki.internal.example").is_empty());
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x"]));
    }

    #[tokio::test]
    async fn test_storage_change_reconciles_and_mirrors() {
        let h = Harness::new(
            MemoryScriptStore::new(),
            MemoryTabs::new([
                Tab::new(1, "https://a.example/one"),
                Tab::new(2, "https://a.example/two"),
                Tab::new(3, "https://b.example/"),
            ]),
            MemoryFacility::new(),
        );
        h.tabs.set_unreachable(2);
        let background = h.background(Capabilities::permissive());
        background.start().await;

        let outcomes = background
            .handle_storage_change(StorageChange {
                key: "a.example".to_string(),
                new_value: Some(json!(["x", 5, "y"])),
            })
            .await;

        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x", "y"]));
        assert_eq!(h.tabs.page_cache(1, "a.example"), Some(ids(&["x", "y"])));
        assert_eq!(h.tabs.page_cache(3, "a.example"), None);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.tab_id == 1 && o.result.is_ok()));
        assert!(outcomes.iter().any(|o| o.tab_id == 2 && o.result.is_err()));

        // Removing the key clears the hostname
        background
            .handle_storage_change(StorageChange {
                key: "a.example".to_string(),
                new_value: None,
            })
            .await;
        assert!(h.facility.script_ids_for("a.example").is_empty());
        assert_eq!(h.tabs.page_cache(1, "a.example"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_storage_change_ignores_non_list_values() {
        let h = Harness::new(
            MemoryScriptStore::new(),
            MemoryTabs::new([Tab::new(1, "https://a.example/")]),
            MemoryFacility::new(),
        );
        let background = h.background(Capabilities::permissive());
        background.start().await;
        let before = h.facility.calls().len();

        let outcomes = background
            .handle_storage_change(StorageChange {
                key: "a.example".to_string(),
                new_value: Some(json!("x")),
            })
            .await;

        assert!(outcomes.is_empty());
        assert_eq!(h.facility.calls().len(), before);
        assert_eq!(h.tabs.page_cache(1, "a.example"), None);
    }

    #[tokio::test]
    async fn test_messages() {
        let h = Harness::new(
            MemoryScriptStore::with_entries([("a.example".to_string(), json!(["x"]))]),
            MemoryTabs::default(),
            MemoryFacility::new(),
        );
        let background = h.background(Capabilities::permissive());
        background.start().await;

        let response = background
            .handle_message(
                Message::UpdateScriptsRegistration {
                    hostname: "a.example".to_string(),
                    enabled_scripts: ids(&["x", "z"]),
                },
                None,
            )
            .await;
        assert!(response.success);
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x", "z"]));

        let response = background
            .handle_message(
                Message::TabUpdated {
                    tab: Tab {
                        id: None,
                        url: Some("https://a.example/".to_string()),
                    },
                },
                Some(Tab::new(9, "https://a.example/")),
            )
            .await;
        assert!(response.success);
        assert_eq!(h.action.text(9), "1");

        let response = background
            .handle_message(
                Message::ScriptsUpdated {
                    hostname: "a.example".to_string(),
                    enabled_scripts: ids(&["x"]),
                },
                None,
            )
            .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_denied_hosts_are_not_registered() {
        let permissions = Permissions {
            hosts: Some(HostPermissions {
                allow: None,
                deny: Some(vec!["*.bank.example".to_string()]),
            }),
        };
        let capabilities = Capabilities::from_permissions(Some(&permissions), false).unwrap();
        let h = Harness::new(
            MemoryScriptStore::with_entries([
                ("www.bank.example".to_string(), json!(["x"])),
                ("a.example".to_string(), json!(["x"])),
            ]),
            MemoryTabs::new([Tab::new(1, "https://www.bank.example/")]),
            MemoryFacility::new(),
        );
        let background = h.background(capabilities);

        background.start().await;

        assert!(h.facility.script_ids_for("www.bank.example").is_empty());
        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x"]));
        // The badge still reflects what the user enabled
        assert_eq!(h.action.text(1), "1");
    }

    #[tokio::test]
    async fn test_tab_events_update_badge() {
        let h = Harness::new(
            MemoryScriptStore::with_entries([("a.example".to_string(), json!(["x", "y"]))]),
            MemoryTabs::new([Tab::new(4, "https://a.example/")]),
            MemoryFacility::new(),
        );
        let background = h.background(Capabilities::permissive());

        background
            .handle(BackgroundEvent::TabUpdated {
                tab: Tab::new(5, "https://a.example/"),
                status: Some(TabStatus::Loading),
            })
            .await;
        assert!(h.action.badge(5).is_none());

        background
            .handle(BackgroundEvent::TabUpdated {
                tab: Tab::new(5, "https://a.example/"),
                status: Some(TabStatus::Complete),
            })
            .await;
        assert_eq!(h.action.text(5), "2");

        background.handle(BackgroundEvent::TabActivated { tab_id: 4 }).await;
        assert_eq!(h.action.text(4), "2");

        // Unknown tab is ignored
        background.handle(BackgroundEvent::TabActivated { tab_id: 40 }).await;
        assert!(h.action.badge(40).is_none());
    }

    #[tokio::test]
    async fn test_page_load_round_trip() {
        let h = Harness::new(
            MemoryScriptStore::with_entries([("foo.example".to_string(), json!(["alpha"]))]),
            MemoryTabs::new([Tab::new(7, "https://foo.example/app")]),
            MemoryFacility::new(),
        );
        let background = h.background(Capabilities::permissive());
        background.start().await;
        assert_eq!(h.facility.script_ids_for("foo.example"), ids(&["alpha"]));

        let (ipc_tx, ipc_rx) = ipc_channel(8);
        let (events_tx, events_rx) = mpsc::channel(8);
        let document = Rc::new(MemoryDocument::at_document_start());
        let page_storage = Rc::new(MemoryPageStorage::new());
        let context =
            PageContext::from_url("https://foo.example/app", Some(7), "chrome-extension://id/")
                .unwrap();
        let bridge = InjectionBridge::new(
            context,
            PageLocalCache::new(page_storage.clone()),
            document.clone(),
            h.store.clone(),
            Rc::new(ipc_tx),
        );

        let page = async move {
            let report = bridge.start().await;
            drop(events_tx);
            report
        };
        let (report, ()) = tokio::join!(page, background.run(events_rx, ipc_rx, h.store.subscribe()));

        assert_eq!(report.from_store, ids(&["alpha"]));
        assert_eq!(document.script_ids(), ids(&["alpha"]));
        assert_eq!(
            PageLocalCache::new(page_storage).read("foo.example"),
            ids(&["alpha"])
        );
        assert_eq!(h.action.text(7), "1");
    }

    #[tokio::test]
    async fn test_run_applies_store_writes() {
        let h = Harness::new(
            MemoryScriptStore::new(),
            MemoryTabs::new([Tab::new(2, "https://a.example/")]),
            MemoryFacility::new(),
        );
        let background = h.background(Capabilities::permissive());
        background.start().await;

        let (_ipc_tx, ipc_rx) = ipc_channel(8);
        let (events_tx, events_rx) = mpsc::channel(8);
        let changes = h.store.subscribe();
        let store = h.store.clone();

        let writer = async move {
            store
                .set_enabled_scripts("a.example", &ids(&["x"]))
                .await
                .unwrap();
            events_tx
                .send(BackgroundEvent::TabActivated { tab_id: 2 })
                .await
                .unwrap();
        };
        tokio::join!(writer, background.run(events_rx, ipc_rx, changes));

        assert_eq!(h.facility.script_ids_for("a.example"), ids(&["x"]));
        assert_eq!(h.tabs.page_cache(2, "a.example"), Some(ids(&["x"])));
        assert_eq!(h.action.text(2), "1");
    }
}

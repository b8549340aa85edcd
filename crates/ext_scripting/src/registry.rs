//! Reconciliation of desired script ids against registered content scripts

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, error, info, trace, warn};

use crate::{
    generate_handle, is_own_handle, is_valid_hostname, ContentScriptDescriptor,
    RegistrationFacility, ScriptingError,
};

/// Composite key of one registration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationKey {
    pub hostname: String,
    pub script_id: String,
}

impl RegistrationKey {
    pub fn new(hostname: impl Into<String>, script_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            script_id: script_id.into(),
        }
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The hostname was rejected and nothing was attempted
    pub skipped: bool,
    /// Script ids whose registration call succeeded
    pub registered: Vec<String>,
    /// Script ids no longer registered
    pub unregistered: Vec<String>,
    /// Facility calls that failed and were logged
    pub failures: usize,
}

impl ReconcileReport {
    /// Report for a hostname that was not acted on
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// No facility call was needed
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.unregistered.is_empty() && self.failures == 0
    }
}

/// Registration record for one process lifetime.
///
/// Constructed empty at startup; [`ScriptRegistry::initialize`] removes host
/// registrations left behind by earlier processes before anything is
/// reconciled.
pub struct ScriptRegistry {
    facility: Rc<dyn RegistrationFacility>,
    records: RefCell<BTreeMap<RegistrationKey, String>>,
    initialized: Cell<bool>,
}

impl ScriptRegistry {
    pub fn new(facility: Rc<dyn RegistrationFacility>) -> Self {
        Self {
            facility,
            records: RefCell::new(BTreeMap::new()),
            initialized: Cell::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    /// Script ids currently recorded for a hostname
    pub fn registered_ids(&self, hostname: &str) -> Vec<String> {
        self.records
            .borrow()
            .keys()
            .filter(|key| key.hostname == hostname)
            .map(|key| key.script_id.clone())
            .collect()
    }

    /// Handle recorded for one (hostname, script id) pair
    pub fn handle(&self, hostname: &str, script_id: &str) -> Option<String> {
        self.records
            .borrow()
            .get(&RegistrationKey::new(hostname, script_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Unregister every host registration carrying our handle prefix that
    /// this registry did not create.
    ///
    /// Runs at most once successfully per registry; returns whether the flush
    /// happened on this call. A failed flush is logged and may be retried;
    /// registrations made in between are recorded and survive the retry.
    pub async fn initialize(&self) -> bool {
        if self.initialized.get() {
            return false;
        }

        let registered = match self.facility.get_registered_content_scripts().await {
            Ok(registered) => registered,
            Err(e) => {
                error!(error = %e, "Script registry initialization failed");
                return false;
            }
        };

        let ours: Vec<String> = {
            let records = self.records.borrow();
            registered
                .into_iter()
                .map(|script| script.id)
                .filter(|id| is_own_handle(id) && !records.values().any(|handle| handle == id))
                .collect()
        };

        if !ours.is_empty() {
            let count = ours.len();
            if let Err(e) = self.facility.unregister_content_scripts(ours).await {
                error!(error = %e, "Script registry initialization failed");
                return false;
            }
            info!(count, "Cleared stale script registrations");
        }

        self.initialized.set(true);
        true
    }

    /// Bring the registrations for `hostname` in line with `desired`.
    ///
    /// Invalid hostnames are ignored without any facility call. Blank ids are
    /// dropped and duplicates collapse. Removals are issued before additions
    /// and a failed removal does not stop the additions.
    pub async fn reconcile<S: AsRef<str>>(&self, hostname: &str, desired: &[S]) -> ReconcileReport {
        if !is_valid_hostname(hostname) {
            trace!(hostname, "Skipping script registration for invalid hostname");
            return ReconcileReport::skipped();
        }

        let mut wanted: Vec<&str> = Vec::new();
        for id in desired.iter().map(AsRef::as_ref) {
            if !id.trim().is_empty() && !wanted.contains(&id) {
                wanted.push(id);
            }
        }

        let mut report = ReconcileReport::default();
        self.remove_stale(hostname, &wanted, &mut report).await;
        self.register_missing(hostname, &wanted, &mut report).await;

        debug!(
            hostname,
            registered = report.registered.len(),
            unregistered = report.unregistered.len(),
            failures = report.failures,
            "scripting.reconcile"
        );
        report
    }

    async fn remove_stale(&self, hostname: &str, wanted: &[&str], report: &mut ReconcileReport) {
        let stale: Vec<(RegistrationKey, String)> = self
            .records
            .borrow()
            .iter()
            .filter(|(key, _)| {
                key.hostname == hostname && !wanted.contains(&key.script_id.as_str())
            })
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();

        if stale.is_empty() {
            return;
        }

        let handles: Vec<String> = stale.iter().map(|(_, handle)| handle.clone()).collect();
        let result = match self.facility.unregister_content_scripts(handles.clone()).await {
            // The host rejects the whole batch when one handle is missing
            Err(e) if e.is_nonexistent() => {
                debug!(hostname, "Some stale registrations were already gone");
                self.unregister_present(&handles).await
            }
            other => other,
        };

        if let Err(e) = result {
            warn!(hostname, error = %e, "Failed to unregister old scripts");
            report.failures += 1;
            return;
        }

        let mut records = self.records.borrow_mut();
        for (key, _) in stale {
            records.remove(&key);
            report.unregistered.push(key.script_id);
        }
    }

    /// Unregister those of `handles` the host still has
    async fn unregister_present(&self, handles: &[String]) -> Result<(), ScriptingError> {
        let present: Vec<String> = self
            .facility
            .get_registered_content_scripts()
            .await?
            .into_iter()
            .map(|script| script.id)
            .filter(|id| handles.contains(id))
            .collect();

        if present.is_empty() {
            return Ok(());
        }
        self.facility.unregister_content_scripts(present).await
    }

    async fn register_missing(&self, hostname: &str, wanted: &[&str], report: &mut ReconcileReport) {
        let mut descriptors = Vec::new();
        let mut added = Vec::new();
        {
            let mut records = self.records.borrow_mut();
            for id in wanted {
                let key = RegistrationKey::new(hostname, *id);
                if records.contains_key(&key) {
                    continue;
                }

                let handle = loop {
                    let candidate = generate_handle();
                    if !records.values().any(|existing| *existing == candidate) {
                        break candidate;
                    }
                };
                descriptors.push(ContentScriptDescriptor::breaker(handle.clone(), hostname, id));
                records.insert(key, handle);
                added.push(id.to_string());
            }
        }

        if descriptors.is_empty() {
            return;
        }

        // Records stay in place on failure; the host may disagree until the
        // next process restart flushes everything.
        match self.facility.register_content_scripts(descriptors).await {
            Ok(()) => report.registered = added,
            Err(e) => {
                error!(hostname, error = %e, "Failed to register scripts");
                report.failures += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

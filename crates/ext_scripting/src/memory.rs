//! In-memory registration facility
//!
//! Mirrors the host's behavior closely enough for tests and headless runs:
//! both bulk calls are all-or-nothing, a duplicate handle rejects the whole
//! registration, and an unknown handle rejects the whole removal with a
//! "Nonexistent" error.

use std::cell::RefCell;
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{ContentScriptDescriptor, RegistrationFacility, ScriptingError, SCRIPTS_DIR};

/// One call received by [`MemoryFacility`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityCall {
    List,
    Register(Vec<String>),
    Unregister(Vec<String>),
}

#[derive(Default)]
pub struct MemoryFacility {
    scripts: RefCell<BTreeMap<String, ContentScriptDescriptor>>,
    calls: RefCell<Vec<FacilityCall>>,
    list_failure: RefCell<Option<ScriptingError>>,
    register_failure: RefCell<Option<ScriptingError>>,
    unregister_failure: RefCell<Option<ScriptingError>>,
}

impl MemoryFacility {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with registrations left over from an earlier process
    pub fn with_registered(scripts: impl IntoIterator<Item = ContentScriptDescriptor>) -> Self {
        let facility = Self::default();
        facility
            .scripts
            .borrow_mut()
            .extend(scripts.into_iter().map(|script| (script.id.clone(), script)));
        facility
    }

    pub fn calls(&self) -> Vec<FacilityCall> {
        self.calls.borrow().clone()
    }

    pub fn registered(&self) -> Vec<ContentScriptDescriptor> {
        self.scripts.borrow().values().cloned().collect()
    }

    /// Sorted script ids registered to run on `hostname`
    pub fn script_ids_for(&self, hostname: &str) -> Vec<String> {
        let pattern = format!("*://{hostname}/*");
        let prefix = format!("{SCRIPTS_DIR}/");
        let mut ids: Vec<String> = self
            .scripts
            .borrow()
            .values()
            .filter(|script| script.matches.contains(&pattern))
            .flat_map(|script| script.js.clone())
            .filter_map(|path| {
                path.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".js"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn fail_next_list(&self, error: ScriptingError) {
        *self.list_failure.borrow_mut() = Some(error);
    }

    pub fn fail_next_register(&self, error: ScriptingError) {
        *self.register_failure.borrow_mut() = Some(error);
    }

    pub fn fail_next_unregister(&self, error: ScriptingError) {
        *self.unregister_failure.borrow_mut() = Some(error);
    }
}

#[async_trait(?Send)]
impl RegistrationFacility for MemoryFacility {
    async fn get_registered_content_scripts(
        &self,
    ) -> Result<Vec<ContentScriptDescriptor>, ScriptingError> {
        self.calls.borrow_mut().push(FacilityCall::List);
        if let Some(error) = self.list_failure.borrow_mut().take() {
            return Err(error);
        }
        Ok(self.registered())
    }

    async fn register_content_scripts(
        &self,
        scripts: Vec<ContentScriptDescriptor>,
    ) -> Result<(), ScriptingError> {
        self.calls.borrow_mut().push(FacilityCall::Register(
            scripts.iter().map(|script| script.id.clone()).collect(),
        ));
        if let Some(error) = self.register_failure.borrow_mut().take() {
            return Err(error);
        }

        let mut registered = self.scripts.borrow_mut();
        if let Some(duplicate) = scripts
            .iter()
            .find(|script| registered.contains_key(&script.id))
        {
            return Err(ScriptingError::registration_failed(format!(
                "Duplicate script ID '{}'",
                duplicate.id
            )));
        }
        for script in scripts {
            registered.insert(script.id.clone(), script);
        }
        Ok(())
    }

    async fn unregister_content_scripts(&self, ids: Vec<String>) -> Result<(), ScriptingError> {
        self.calls
            .borrow_mut()
            .push(FacilityCall::Unregister(ids.clone()));
        if let Some(error) = self.unregister_failure.borrow_mut().take() {
            return Err(error);
        }

        let mut registered = self.scripts.borrow_mut();
        if let Some(missing) = ids.iter().find(|id| !registered.contains_key(*id)) {
            return Err(ScriptingError::unregistration_failed(format!(
                "Nonexistent script ID '{missing}'"
            )));
        }
        for id in &ids {
            registered.remove(id);
        }
        Ok(())
    }
}

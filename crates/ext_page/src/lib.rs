//! Page-side injection of enabled breaker scripts
//!
//! Runs once per page load before the page parses: scripts listed in the
//! page-local cache go in immediately, then anything the authoritative store
//! adds on top. See [`InjectionBridge`] for the load sequence.

use async_trait::async_trait;
use ext_ipc::{IpcSender, Message, MessageResponse, TabInfo};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

mod bridge;
mod cache;

pub use bridge::{InjectionBridge, PageContext, PageLoadReport};
pub use cache::{MemoryPageStorage, PageLocalCache, PAGE_CACHE_KEY};

/// Attribute marking script tags added by the extension
pub const INJECTED_ATTRIBUTE: &str = "data-antidebug-breaker";

// ============================================================================
// Error Types (7300+ range)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageErrorCode {
    /// Page-local storage rejected a write
    StorageWrite = 7300,
    /// A script tag could not be added to the document
    Injection = 7301,
    /// The background could not be reached
    Messaging = 7302,
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("[{code}] Page storage write failed: {message}")]
    StorageWrite { code: u32, message: String },

    #[error("[{code}] Injection of {script_id} failed: {message}")]
    Injection {
        code: u32,
        script_id: String,
        message: String,
    },

    #[error("[{code}] Messaging failed: {message}")]
    Messaging { code: u32, message: String },
}

impl PageError {
    pub fn storage_write(message: impl Into<String>) -> Self {
        Self::StorageWrite {
            code: PageErrorCode::StorageWrite as u32,
            message: message.into(),
        }
    }

    pub fn injection(script_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Injection {
            code: PageErrorCode::Injection as u32,
            script_id: script_id.into(),
            message: message.into(),
        }
    }

    pub fn messaging(message: impl Into<String>) -> Self {
        Self::Messaging {
            code: PageErrorCode::Messaging as u32,
            message: message.into(),
        }
    }
}

// ============================================================================
// Page Facilities
// ============================================================================

/// Origin-scoped string storage of the page (`localStorage`)
pub trait PageStorage {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), PageError>;
}

/// A `<script>` element pointing at a bundled breaker script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTag {
    pub script_id: String,
    pub src: String,
    pub attributes: BTreeMap<String, String>,
}

impl ScriptTag {
    /// Tag for `script_id`, resolved against the extension's resource base URL
    pub fn breaker(resource_base: &str, script_id: &str) -> Self {
        let path = ext_scripting::script_resource_path(script_id);
        let src = if resource_base.ends_with('/') {
            format!("{resource_base}{path}")
        } else {
            format!("{resource_base}/{path}")
        };

        let mut attributes = BTreeMap::new();
        attributes.insert(INJECTED_ATTRIBUTE.to_string(), script_id.to_string());

        Self {
            script_id: script_id.to_string(),
            src,
            attributes,
        }
    }
}

/// The page's document, as far as injection needs it
pub trait PageDocument {
    /// Append the tag to the earliest node available at this point of the
    /// load
    fn append_script(&self, tag: &ScriptTag) -> Result<(), PageError>;
}

/// Where a script tag ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Head,
    DocumentElement,
}

/// Document that records appended tags
#[derive(Default)]
pub struct MemoryDocument {
    has_head: bool,
    appended: RefCell<Vec<(InsertionPoint, ScriptTag)>>,
    rejected: RefCell<BTreeSet<String>>,
}

impl MemoryDocument {
    /// A document still being constructed: no `<head>` yet
    pub fn at_document_start() -> Self {
        Self::default()
    }

    pub fn with_head() -> Self {
        Self {
            has_head: true,
            ..Self::default()
        }
    }

    /// Make appending this script id fail
    pub fn reject(&self, script_id: &str) {
        self.rejected.borrow_mut().insert(script_id.to_string());
    }

    pub fn appended(&self) -> Vec<(InsertionPoint, ScriptTag)> {
        self.appended.borrow().clone()
    }

    /// Script ids in injection order
    pub fn script_ids(&self) -> Vec<String> {
        self.appended
            .borrow()
            .iter()
            .map(|(_, tag)| tag.script_id.clone())
            .collect()
    }
}

impl PageDocument for MemoryDocument {
    fn append_script(&self, tag: &ScriptTag) -> Result<(), PageError> {
        if self.rejected.borrow().contains(&tag.script_id) {
            return Err(PageError::injection(&tag.script_id, "blocked by page policy"));
        }
        let point = if self.has_head {
            InsertionPoint::Head
        } else {
            InsertionPoint::DocumentElement
        };
        self.appended.borrow_mut().push((point, tag.clone()));
        Ok(())
    }
}

/// Channel from the page to the background
#[async_trait(?Send)]
pub trait BackgroundMessenger {
    async fn send_message(
        &self,
        message: Message,
        sender: Option<TabInfo>,
    ) -> Result<MessageResponse, PageError>;
}

#[async_trait(?Send)]
impl BackgroundMessenger for IpcSender {
    async fn send_message(
        &self,
        message: Message,
        sender: Option<TabInfo>,
    ) -> Result<MessageResponse, PageError> {
        self.send(message, sender)
            .await
            .map_err(|e| PageError::messaging(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

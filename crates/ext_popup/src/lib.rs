//! Popup surface
//!
//! Lists the available breaker scripts for the active tab's hostname and
//! flips them on or off. A toggle writes the authoritative store, mirrors the
//! new list into the tab's page-local cache and tells the page right away;
//! registration follows from the store change on the background side.

mod catalog;
mod controller;

pub use catalog::{
    render_entries, truncate_description, ScriptCatalog, ScriptEntry, ScriptMeta,
    DESCRIPTION_LIMIT,
};
pub use controller::{apply_toggle, PopupController};

// ============================================================================
// Error Types (7400+ range)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PopupErrorCode {
    /// Script catalog could not be read
    CatalogLoad = 7400,
    /// Active tab has no usable hostname
    NoActiveHost = 7401,
    /// Toggled script id is blank
    InvalidScriptId = 7402,
    /// Store access failed
    Storage = 7403,
}

#[derive(Debug, thiserror::Error)]
pub enum PopupError {
    #[error("[{code}] Failed to load script catalog: {message}")]
    CatalogLoad { code: u32, message: String },

    #[error("[{code}] Active tab has no hostname")]
    NoActiveHost { code: u32 },

    #[error("[{code}] Invalid script ID: {script_id:?}")]
    InvalidScriptId { code: u32, script_id: String },

    #[error("[{code}] Storage error: {source}")]
    Storage {
        code: u32,
        #[source]
        source: ext_storage::StorageError,
    },
}

impl PopupError {
    pub fn catalog_load(message: impl Into<String>) -> Self {
        Self::CatalogLoad {
            code: PopupErrorCode::CatalogLoad as u32,
            message: message.into(),
        }
    }

    pub fn no_active_host() -> Self {
        Self::NoActiveHost {
            code: PopupErrorCode::NoActiveHost as u32,
        }
    }

    pub fn invalid_script_id(script_id: impl Into<String>) -> Self {
        Self::InvalidScriptId {
            code: PopupErrorCode::InvalidScriptId as u32,
            script_id: script_id.into(),
        }
    }
}

impl From<ext_storage::StorageError> for PopupError {
    fn from(source: ext_storage::StorageError) -> Self {
        Self::Storage {
            code: PopupErrorCode::Storage as u32,
            source,
        }
    }
}

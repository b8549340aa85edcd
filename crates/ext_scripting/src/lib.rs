//! Content script registration for breaker scripts
//!
//! The host keeps its own list of registered content scripts, addressed by
//! handle. [`ScriptRegistry`] owns the in-memory record of which
//! (hostname, script id) pairs we registered under which handle, and
//! reconciles that record against a desired id list with bulk add/remove
//! calls on a [`RegistrationFacility`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod memory;
mod registry;

pub use memory::{FacilityCall, MemoryFacility};
pub use registry::{ReconcileReport, RegistrationKey, ScriptRegistry};

/// Prefix carried by every handle this extension generates
pub const HANDLE_PREFIX: &str = "ad_";

/// Directory holding the bundled breaker scripts
pub const SCRIPTS_DIR: &str = "scripts";

// ============================================================================
// Error Types (7200+ range)
// ============================================================================

/// Error codes for registration facility failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScriptingErrorCode {
    /// Registering content scripts failed
    RegistrationFailed = 7200,
    /// Unregistering content scripts failed
    UnregistrationFailed = 7201,
    /// Listing registered content scripts failed
    QueryFailed = 7202,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptingError {
    #[error("[{code}] Registration failed: {message}")]
    RegistrationFailed { code: u32, message: String },

    #[error("[{code}] Unregistration failed: {message}")]
    UnregistrationFailed { code: u32, message: String },

    #[error("[{code}] Query failed: {message}")]
    QueryFailed { code: u32, message: String },
}

impl ScriptingError {
    pub fn registration_failed(message: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            code: ScriptingErrorCode::RegistrationFailed as u32,
            message: message.into(),
        }
    }

    pub fn unregistration_failed(message: impl Into<String>) -> Self {
        Self::UnregistrationFailed {
            code: ScriptingErrorCode::UnregistrationFailed as u32,
            message: message.into(),
        }
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed {
            code: ScriptingErrorCode::QueryFailed as u32,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::RegistrationFailed { message, .. }
            | Self::UnregistrationFailed { message, .. }
            | Self::QueryFailed { message, .. } => message,
        }
    }

    /// The host reports the handle is not registered: already gone.
    pub fn is_nonexistent(&self) -> bool {
        self.message().to_ascii_lowercase().contains("nonexistent")
    }
}

// ============================================================================
// Registration Descriptors
// ============================================================================

/// Document lifecycle point at which a content script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    DocumentIdle,
}

/// JavaScript world a content script executes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionWorld {
    /// Extension's isolated world
    Isolated,
    /// The page's own world
    Main,
}

/// One content script registration, as handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentScriptDescriptor {
    /// Registration handle
    pub id: String,
    pub js: Vec<String>,
    pub matches: Vec<String>,
    pub run_at: RunAt,
    pub world: ExecutionWorld,
}

impl ContentScriptDescriptor {
    /// Breaker script `script_id` on `hostname`, over http and https, in the
    /// page world at document start
    pub fn breaker(handle: impl Into<String>, hostname: &str, script_id: &str) -> Self {
        Self {
            id: handle.into(),
            js: vec![script_resource_path(script_id)],
            matches: vec![format!("*://{hostname}/*")],
            run_at: RunAt::DocumentStart,
            world: ExecutionWorld::Main,
        }
    }
}

/// Bundled resource path of a breaker script
pub fn script_resource_path(script_id: &str) -> String {
    format!("{SCRIPTS_DIR}/{script_id}.js")
}

/// Hostnames we register for are non-blank and contain a dot
pub fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.trim().is_empty() && hostname.contains('.')
}

/// Whether a registration handle was generated by this extension
pub fn is_own_handle(handle: &str) -> bool {
    handle.starts_with(HANDLE_PREFIX)
}

/// Fresh handle: prefix, unix millis, eight random hex chars.
pub fn generate_handle() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{HANDLE_PREFIX}{millis}_{}", &suffix[..8])
}

// ============================================================================
// Registration Facility
// ============================================================================

/// Host-managed content script registration
#[async_trait(?Send)]
pub trait RegistrationFacility {
    async fn get_registered_content_scripts(
        &self,
    ) -> Result<Vec<ContentScriptDescriptor>, ScriptingError>;

    async fn register_content_scripts(
        &self,
        scripts: Vec<ContentScriptDescriptor>,
    ) -> Result<(), ScriptingError>;

    async fn unregister_content_scripts(&self, ids: Vec<String>) -> Result<(), ScriptingError>;
}

// ============================================================================
// Tests
// ============================================================================

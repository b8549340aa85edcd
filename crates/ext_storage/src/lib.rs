//! Authoritative store for enabled breaker scripts
//!
//! One key per hostname, each holding a JSON array of script ids. The SQLite
//! backend lives at <data dir>/.antidebug/<app-identifier>/storage.db by default; an
//! in-memory backend with the same contract is provided for tests and
//! headless runs. Every successful write is published as a [`StorageChange`].

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Error Types with Structured Codes
// ============================================================================

/// Error codes for storage operations (8100-8109)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StorageErrorCode {
    /// Generic storage error
    Generic = 8100,
    /// Serialization error
    SerializationError = 8102,
    /// Deserialization error
    DeserializationError = 8103,
    /// Database error
    DatabaseError = 8104,
    /// Invalid key
    InvalidKey = 8106,
    /// Connection failed
    ConnectionFailed = 8108,
}

/// Custom error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("[{code}] Storage error: {message}")]
    Generic { code: u32, message: String },

    #[error("[{code}] Serialization error: {message}")]
    SerializationError { code: u32, message: String },

    #[error("[{code}] Deserialization error: {message}")]
    DeserializationError { code: u32, message: String },

    #[error("[{code}] Database error: {message}")]
    DatabaseError { code: u32, message: String },

    #[error("[{code}] Invalid key: {message}")]
    InvalidKey { code: u32, message: String },

    #[error("[{code}] Connection failed: {message}")]
    ConnectionFailed { code: u32, message: String },
}

impl StorageError {
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            code: StorageErrorCode::Generic as u32,
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            code: StorageErrorCode::SerializationError as u32,
            message: message.into(),
        }
    }

    pub fn deserialization_error(message: impl Into<String>) -> Self {
        Self::DeserializationError {
            code: StorageErrorCode::DeserializationError as u32,
            message: message.into(),
        }
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::DatabaseError {
            code: StorageErrorCode::DatabaseError as u32,
            message: message.into(),
        }
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            code: StorageErrorCode::InvalidKey as u32,
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            code: StorageErrorCode::ConnectionFailed as u32,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::database_error(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_error(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::generic(e.to_string())
    }
}

// ============================================================================
// Script Id Validation
// ============================================================================

/// A script id is usable when it is a string with non-whitespace content.
pub fn is_valid_script_id(id: &str) -> bool {
    !id.trim().is_empty()
}

/// Valid script ids held in a raw stored value.
///
/// Anything other than an array yields nothing; non-string and blank
/// entries are dropped. Order is preserved.
pub fn valid_script_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| is_valid_script_id(id))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Drop blank ids from an already-typed list.
pub fn filter_script_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    ids.iter()
        .map(AsRef::as_ref)
        .filter(|id| is_valid_script_id(id))
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Store Contract
// ============================================================================

/// A committed write to the store. `new_value` is `None` for removals.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<Value>,
}

/// Persistent key-value store holding one JSON value per hostname.
#[async_trait(?Send)]
pub trait ScriptStore {
    /// Raw stored value for a key
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Every stored key and value
    async fn get_all(&self) -> Result<BTreeMap<String, Value>, StorageError>;

    /// Insert or replace a value
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Remove a key, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Subscribe to committed writes
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;

    /// Valid script ids enabled for a hostname; missing keys yield an empty list
    async fn enabled_scripts(&self, hostname: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .get(hostname)
            .await?
            .map(|value| valid_script_ids(&value))
            .unwrap_or_default())
    }

    /// Replace the enabled list for a hostname
    async fn set_enabled_scripts(&self, hostname: &str, ids: &[String]) -> Result<(), StorageError> {
        self.set(hostname, Value::from(ids.to_vec())).await
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::invalid_key("Key cannot be empty"));
    }
    Ok(())
}

// ============================================================================
// SQLite Backend
// ============================================================================

/// Default database location for an app identifier
pub fn default_db_path(app_identifier: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".antidebug")
        .join(app_identifier)
        .join("storage.db")
}

/// SQLite-backed store
pub struct SqliteScriptStore {
    db_path: PathBuf,
    connection: Mutex<Connection>,
    changes: broadcast::Sender<StorageChange>,
}

impl SqliteScriptStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db_path_clone = db_path.clone();
        let connection = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = Connection::open(&db_path_clone)?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    created_at INTEGER DEFAULT (strftime('%s', 'now')),
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                )",
                [],
            )?;

            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::connection_failed(e.to_string()))??;

        debug!(path = %db_path.display(), "storage.open");

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db_path,
            connection: Mutex::new(connection),
            changes,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn publish(&self, key: &str, new_value: Option<Value>) {
        // No receivers is not an error
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value,
        });
    }
}

#[async_trait(?Send)]
impl ScriptStore for SqliteScriptStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        debug!(key = %key, "storage.get");

        let conn = self.connection.lock().await;
        let result: Result<String, rusqlite::Error> = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value_str) => {
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| StorageError::deserialization_error(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::from(e)),
        }
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        debug!("storage.get_all");

        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = BTreeMap::new();
        for row in rows {
            let (key, value_str) = row?;
            match serde_json::from_str(&value_str) {
                Ok(value) => {
                    result.insert(key, value);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable stored value"),
            }
        }

        Ok(result)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        debug!(key = %key, "storage.set");
        validate_key(key)?;

        let value_str = serde_json::to_string(&value)?;
        {
            let conn = self.connection.lock().await;
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, strftime('%s', 'now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = strftime('%s', 'now')",
                rusqlite::params![key, value_str],
            )?;
        }

        self.publish(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        debug!(key = %key, "storage.remove");

        let rows_affected = {
            let conn = self.connection.lock().await;
            conn.execute("DELETE FROM kv_store WHERE key = ?", [key])?
        };

        if rows_affected > 0 {
            self.publish(key, None);
        }
        Ok(rows_affected > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// Store kept entirely in process memory
pub struct MemoryScriptStore {
    entries: RefCell<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for MemoryScriptStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RefCell::new(BTreeMap::new()),
            changes,
        }
    }
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed entries without publishing change notifications
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::default();
        store.entries.borrow_mut().extend(entries);
        store
    }
}

#[async_trait(?Send)]
impl ScriptStore for MemoryScriptStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        Ok(self.entries.borrow().clone())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            new_value: Some(value),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.entries.borrow_mut().remove(key).is_some();
        if existed {
            let _ = self.changes.send(StorageChange {
                key: key.to_string(),
                new_value: None,
            });
        }
        Ok(existed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================

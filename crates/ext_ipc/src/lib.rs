//! Messages exchanged between page contexts, the popup and the background.
//!
//! Every message carries a `type` tag on the wire; [`Message`] is the single
//! tagged type all contexts decode into, so each handler matches it
//! exhaustively.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Browser tab identifier
pub type TabId = i32;

// ============================================================================
// Error Types (7000+ range)
// ============================================================================

/// Error codes for IPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpcErrorCode {
    /// Channel send error
    ChannelSend = 7000,
    /// Channel receive error
    ChannelRecv = 7001,
    /// Message could not be decoded
    InvalidMessage = 7002,
}

/// Custom error type for IPC operations
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("[{code}] Channel send error: {message}")]
    ChannelSend { code: u32, message: String },

    #[error("[{code}] Channel receive error: {message}")]
    ChannelRecv { code: u32, message: String },

    #[error("[{code}] Invalid message: {message}")]
    InvalidMessage { code: u32, message: String },
}

impl IpcError {
    pub fn channel_send(message: impl Into<String>) -> Self {
        Self::ChannelSend {
            code: IpcErrorCode::ChannelSend as u32,
            message: message.into(),
        }
    }

    pub fn channel_recv(message: impl Into<String>) -> Self {
        Self::ChannelRecv {
            code: IpcErrorCode::ChannelRecv as u32,
            message: message.into(),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            code: IpcErrorCode::InvalidMessage as u32,
            message: message.into(),
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// The parts of a browser tab that travel inside messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TabInfo {
    pub fn new(id: TabId, url: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            url: Some(url.into()),
        }
    }
}

/// Script id lists arrive from untyped contexts; non-string entries are dropped.
fn lenient_script_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| match value {
            Value::String(id) => Some(id),
            _ => None,
        })
        .collect())
}

/// Every message understood by the extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Popup or page asks the background to reconcile registrations
    UpdateScriptsRegistration {
        hostname: String,
        #[serde(
            rename = "enabledScripts",
            default,
            deserialize_with = "lenient_script_ids"
        )]
        enabled_scripts: Vec<String>,
    },
    /// A tab's enabled state may have changed; recompute its badge
    TabUpdated { tab: TabInfo },
    /// Pushed to one page when its hostname's list changes
    ScriptsUpdated {
        hostname: String,
        #[serde(
            rename = "enabledScripts",
            default,
            deserialize_with = "lenient_script_ids"
        )]
        enabled_scripts: Vec<String>,
    },
}

impl Message {
    pub fn from_value(value: Value) -> Result<Self, IpcError> {
        serde_json::from_value(value).map_err(|e| IpcError::invalid_message(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, IpcError> {
        serde_json::from_str(json).map_err(|e| IpcError::invalid_message(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        // Serializing a plain enum of strings cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::UpdateScriptsRegistration { .. } => "update_scripts_registration",
            Message::TabUpdated { .. } => "tab_updated",
            Message::ScriptsUpdated { .. } => "scripts_updated",
        }
    }
}

/// Reply sent back to the message's originator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }

    pub fn unhandled() -> Self {
        Self { success: false }
    }
}

// ============================================================================
// Channels
// ============================================================================

/// A message in flight towards the background, with an optional reply slot
#[derive(Debug)]
pub struct IpcEnvelope {
    pub message: Message,
    /// Tab the message came from, when sent by a page
    pub sender: Option<TabInfo>,
    pub respond: Option<oneshot::Sender<MessageResponse>>,
}

impl IpcEnvelope {
    /// Deliver the reply; a dropped requester is not an error
    pub fn reply(self, response: MessageResponse) {
        if let Some(respond) = self.respond {
            let _ = respond.send(response);
        }
    }
}

/// Sending half handed to pages and the popup
#[derive(Debug, Clone)]
pub struct IpcSender {
    tx: mpsc::Sender<IpcEnvelope>,
}

/// Create the channel carrying messages into the background
pub fn ipc_channel(capacity: usize) -> (IpcSender, mpsc::Receiver<IpcEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (IpcSender { tx }, rx)
}

impl IpcSender {
    /// Send a message and wait for the background's reply
    pub async fn send(
        &self,
        message: Message,
        sender: Option<TabInfo>,
    ) -> Result<MessageResponse, IpcError> {
        tracing::debug!(kind = message.kind(), "Sending message to background");

        let (respond_tx, respond_rx) = oneshot::channel();
        self.tx
            .send(IpcEnvelope {
                message,
                sender,
                respond: Some(respond_tx),
            })
            .await
            .map_err(|e| IpcError::channel_send(e.to_string()))?;

        respond_rx
            .await
            .map_err(|e| IpcError::channel_recv(e.to_string()))
    }

    /// Send without waiting for a reply
    pub async fn post(&self, message: Message, sender: Option<TabInfo>) -> Result<(), IpcError> {
        tracing::debug!(kind = message.kind(), "Posting message to background");

        self.tx
            .send(IpcEnvelope {
                message,
                sender,
                respond: None,
            })
            .await
            .map_err(|e| IpcError::channel_send(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Payload types for the relay topic protocol.
//!
//! These are the JSON bodies that cross process boundaries: client
//! command frames, error replies, the welcome greeting, and the
//! activity reports a User Hub posts to the Central Hub.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable error codes delivered to clients on the `error` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Join metadata carries no `user_id`.
    MissingUserId,
    /// The per-user connection limit is reached.
    MaxConnectionsReached,
    /// A User Hub could not be started.
    HubCreationFailed,
    /// A `ws.message` body is not a decodable client frame.
    InvalidJson,
    /// A client frame carries no command `type`.
    UnknownCommand,
    /// No plugin prefix matches the command.
    PluginNotFound,
    /// The matched plugin could not serve the command.
    PluginFailed,
}

impl ErrorCode {
    /// The wire spelling of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingUserId => "missing_user_id",
            ErrorCode::MaxConnectionsReached => "max_connections_reached",
            ErrorCode::HubCreationFailed => "hub_creation_failed",
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::UnknownCommand => "unknown_command",
            ErrorCode::PluginNotFound => "plugin_not_found",
            ErrorCode::PluginFailed => "plugin_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded client command frame (the JSON body of `ws.message`).
///
/// Only `type` is required; everything else is optional and opaque to
/// the hubs. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Full command name; a plugin prefix selects the target plugin.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Echoed back in error replies when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Opaque session handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Plugin-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Opaque continuation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_token: Option<String>,

    /// Opaque caller context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Body of an `error` topic message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub error: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Request id of the failing frame, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    /// Create an error body.
    #[must_use]
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request id to echo, if any.
    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Body of the `welcome` greeting sent to a freshly rebound client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeBody {
    /// Owner of the hub the client is now bound to.
    pub user_id: String,
    /// Connections currently attached to the hub, this one included.
    pub client_count: usize,
    /// Descriptor table of the plugins the hub can route to.
    pub plugins: Value,
}

/// Body of a `hub.activity_update` report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub user_id: String,
    pub client_count: usize,
    /// RFC 3339 UTC timestamp of the hub's last activity.
    pub last_activity: String,
}

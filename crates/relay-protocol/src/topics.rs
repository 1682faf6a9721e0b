//! The fixed topic-name set.

/// New connection announced by the transport.
pub const WS_JOIN: &str = "ws.join";

/// Connection departure announced by the transport.
pub const WS_LEAVE: &str = "ws.leave";

/// A client frame (JSON bytes) relayed by the transport.
pub const WS_MESSAGE: &str = "ws.message";

/// Transport-initiated shutdown of a User Hub.
pub const WS_CANCEL: &str = "ws.cancel";

/// Rebind instruction sent to the transport.
pub const WS_CONTROL: &str = "ws.control";

/// Error reply to a client.
pub const ERROR: &str = "error";

/// Greeting sent to a freshly rebound client.
pub const WELCOME: &str = "welcome";

/// Liveness report from a User Hub to the Central Hub.
pub const HUB_ACTIVITY_UPDATE: &str = "hub.activity_update";

/// Session-plugin signal: a client is attached again.
pub const RESUME: &str = "resume";

/// Session-plugin signal: the last client detached.
pub const SHUTDOWN: &str = "shutdown";

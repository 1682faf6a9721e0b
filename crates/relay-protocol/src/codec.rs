//! Decoding of client `ws.message` bodies.
//!
//! The transport relays client frames as raw JSON bytes; hubs decode
//! them here. Two failure classes matter to callers: a body that is
//! not a client frame at all (`invalid_json`), and a well-formed
//! frame that carries no usable command `type` (`unknown_command`).

use crate::frames::{ClientFrame, ErrorCode};
use thiserror::Error;

/// Why a `ws.message` body could not be dispatched.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The body is not a decodable client frame.
    #[error("invalid client frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The frame decoded but carries no command `type`.
    #[error("client frame has no command type")]
    MissingCommand {
        /// Request id recovered from the frame, for the error reply.
        request_id: Option<String>,
    },
}

impl FrameError {
    /// The stable error code for the reply to the sender.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::InvalidJson(_) => ErrorCode::InvalidJson,
            FrameError::MissingCommand { .. } => ErrorCode::UnknownCommand,
        }
    }

    /// Request id to echo, when the frame got far enough to carry one.
    #[must_use]
    pub fn request_id(&self) -> Option<String> {
        match self {
            FrameError::MissingCommand { request_id } => request_id.clone(),
            FrameError::InvalidJson(_) => None,
        }
    }
}

/// Decode a `ws.message` body and require its command `type`.
///
/// Returns the command name alongside the decoded frame. An empty
/// `type` counts as missing.
///
/// # Errors
///
/// [`FrameError::InvalidJson`] when the body is not a client frame;
/// [`FrameError::MissingCommand`] when it decodes without a usable
/// `type` (preserving the `request_id` for the error reply).
pub fn decode_command(data: &[u8]) -> Result<(String, ClientFrame), FrameError> {
    let frame: ClientFrame = serde_json::from_slice(data)?;

    match frame.command.clone() {
        Some(command) if !command.is_empty() => Ok((command, frame)),
        _ => Err(FrameError::MissingCommand {
            request_id: frame.request_id,
        }),
    }
}

//! # relay-protocol
//!
//! Topic names, payload schemas, and client-frame decoding for the
//! relay's message protocol.
//!
//! Every message in the system is a topic-tagged envelope. The topic
//! set is fixed:
//!
//! - `ws.join` / `ws.leave` / `ws.message` / `ws.cancel` - inbound
//!   from the transport
//! - `ws.control` - rebind instruction back to the transport
//! - `welcome` / `error` - hub replies to clients
//! - `hub.activity_update` - User Hub to Central Hub
//! - `resume` / `shutdown` - session-plugin signals
//!
//! Client commands arrive as JSON bodies on `ws.message`; see
//! [`codec::decode_command`] for the decoding rules.

pub mod codec;
pub mod frames;
pub mod topics;

pub use codec::{decode_command, FrameError};
pub use frames::{ActivityUpdate, ClientFrame, ErrorBody, ErrorCode, WelcomeBody};

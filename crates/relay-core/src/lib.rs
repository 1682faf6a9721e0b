//! # relay-core
//!
//! Supervised hub hierarchy for the relay. This crate provides the
//! building blocks and both hub processes:
//!
//! - **process** - pids, mailboxes, links, graceful cancel
//! - **registry** - well-known process names
//! - **plugin** - descriptors, prefix routing, supervision state
//! - **security** - actor/scope credential seam
//! - **hub** - the per-user User Hub process
//! - **central** - the singleton Central Hub process
//!
//! ## Architecture
//!
//! ```text
//!              ws.join                 spawn+link              spawn+link
//! transport ────────────▶ Central Hub ────────────▶ User Hub ────────────▶ Plugin
//!     ▲                        │                        │                     │
//!     └──── ws.control ────────┘       welcome/errors ──┤◀── topic replies ───┘
//!                                      broadcasts       ▼
//!                                                  connections
//! ```
//!
//! Each process owns its state and drains its mailbox sequentially;
//! coordination happens only by message.

pub mod central;
pub mod clock;
pub mod config;
pub mod hub;
pub mod metrics;
pub mod plugin;
pub mod process;
pub mod registry;
pub mod security;

pub use central::{CentralHub, CentralStats};
pub use config::HubConfig;
pub use hub::{UserHub, UserHubInit};
pub use plugin::{PluginDescriptor, PluginHost, PluginTable};
pub use process::{Body, Child, Context, Envelope, ExitReason, Pid, SystemEvent};
pub use registry::ProcessRegistry;
pub use security::{SecurityService, StaticScopes};

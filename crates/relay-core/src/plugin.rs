//! Plugin descriptors, prefix routing, and supervision state.
//!
//! A plugin is identified by its command prefix: a client command
//! `type` that starts with the prefix is routed to that plugin, with
//! the prefix stripped off. Prefixes are expected to be prefix-unique;
//! where they are not, the longest match wins.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::HubConfig;
use crate::process::{Child, Pid, SystemSender};

/// Prefix of the session-keeper plugin.
///
/// The User Hub signals it with `resume` / `shutdown` when the client
/// count leaves or reaches zero. No other prefix gets these signals.
pub const SESSION_PREFIX: &str = "session_";

/// How many times a crashed plugin is restarted before it is
/// permanently failed.
pub const MAX_PLUGIN_RESTARTS: u32 = 1;

/// Immutable description of a plugin discovered at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Command namespace; client `type` fields must start with it.
    pub prefix: String,
    /// Process id the host resolves to something runnable.
    pub process_id: String,
    /// Host the plugin is spawned on.
    pub host: String,
    /// Spawn eagerly at User Hub start.
    #[serde(default)]
    pub auto_start: bool,
}

/// The boot-time plugin set, ordered for longest-prefix matching.
#[derive(Debug, Clone, Default)]
pub struct PluginTable {
    entries: Vec<PluginDescriptor>,
}

impl PluginTable {
    /// Build a table.
    ///
    /// Descriptors are ordered by descending prefix length so that an
    /// ambiguous command (`session_x` against `s_` and `session_`)
    /// resolves to the longest match. Shadowed prefix pairs are
    /// reported at construction.
    #[must_use]
    pub fn new(mut entries: Vec<PluginDescriptor>) -> Self {
        entries.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });

        for (i, longer) in entries.iter().enumerate() {
            for shorter in entries.iter().skip(i + 1) {
                if longer.prefix.starts_with(&shorter.prefix) {
                    warn!(
                        longer = %longer.prefix,
                        shorter = %shorter.prefix,
                        "plugin prefixes shadow each other; longest match wins"
                    );
                }
            }
        }

        Self { entries }
    }

    /// Descriptor of the longest prefix `command` starts with.
    #[must_use]
    pub fn match_command(&self, command: &str) -> Option<&PluginDescriptor> {
        self.entries
            .iter()
            .find(|descriptor| command.starts_with(&descriptor.prefix))
    }

    /// Descriptor with exactly this prefix.
    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<&PluginDescriptor> {
        self.entries
            .iter()
            .find(|descriptor| descriptor.prefix == prefix)
    }

    /// Descriptors marked for eager spawn.
    pub fn auto_start(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.entries.iter().filter(|descriptor| descriptor.auto_start)
    }

    /// All descriptors, longest prefix first.
    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.entries.iter()
    }

    /// Number of plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor table as embedded in `welcome` and `ws.control`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|descriptor| {
                (
                    descriptor.prefix.clone(),
                    serde_json::to_value(descriptor).unwrap_or(Value::Null),
                )
            })
            .collect();
        Value::Object(map)
    }
}

/// Lifecycle of one supervised plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PluginStatus {
    /// Entry exists, no spawn attempted yet.
    #[default]
    Pending,
    /// Live process.
    Running,
    /// Exited cleanly; terminal for supervision.
    Stopped,
    /// Spawn failed or restart budget exhausted; terminal.
    Failed,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginStatus::Pending => "pending",
            PluginStatus::Running => "running",
            PluginStatus::Stopped => "stopped",
            PluginStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supervision record for one `(user, prefix)` plugin.
#[derive(Debug, Default)]
pub struct PluginEntry {
    pub child: Option<Child>,
    pub status: PluginStatus,
    pub restart_count: u32,
}

impl PluginEntry {
    /// Pid of the live process, if any.
    #[must_use]
    pub fn pid(&self) -> Option<&Pid> {
        self.child.as_ref().map(Child::pid)
    }

    /// Whether the plugin is live and addressable.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == PluginStatus::Running && self.child.is_some()
    }
}

/// Init arguments handed to a plugin process at spawn.
#[derive(Debug, Clone)]
pub struct PluginInit {
    pub user_id: String,
    pub user_metadata: Value,
    /// The hub that owns the plugin; unsolicited topics sent here are
    /// broadcast to the user's connections.
    pub user_hub: Pid,
    pub config: HubConfig,
}

/// Why a plugin spawn failed.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The host cannot resolve the descriptor's process id.
    #[error("unknown plugin process: {0}")]
    UnknownProcess(String),

    /// The host refused the spawn.
    #[error("host rejected spawn: {0}")]
    Rejected(String),

    /// Spawning the underlying process failed.
    #[error("i/o failure spawning plugin: {0}")]
    Io(#[from] io::Error),
}

/// Spawns plugin processes on behalf of a User Hub.
///
/// Implementations bridge to whatever actually runs the plugin. The
/// returned child must be linked to `monitor` so the hub observes its
/// termination.
pub trait PluginHost: Send + Sync {
    /// Spawn `descriptor` with `init`, linked to `monitor`.
    ///
    /// # Errors
    ///
    /// A spawn failure marks the plugin `failed` and answers the
    /// triggering command with `plugin_failed`.
    fn spawn(
        &self,
        descriptor: &PluginDescriptor,
        init: PluginInit,
        monitor: &SystemSender,
    ) -> Result<Child, SpawnError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(prefix: &str, auto_start: bool) -> PluginDescriptor {
        PluginDescriptor {
            prefix: prefix.to_string(),
            process_id: format!("app:plugins.{prefix}"),
            host: "local".to_string(),
            auto_start,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = PluginTable::new(vec![descriptor("s_", false), descriptor("session_", false)]);

        assert_eq!(
            table.match_command("session_resume").unwrap().prefix,
            "session_"
        );
        assert_eq!(table.match_command("s_ping").unwrap().prefix, "s_");
        assert!(table.match_command("ops_restart").is_none());
    }

    #[test]
    fn test_match_is_order_independent() {
        let a = PluginTable::new(vec![descriptor("session_", false), descriptor("s_", false)]);
        let b = PluginTable::new(vec![descriptor("s_", false), descriptor("session_", false)]);

        assert_eq!(
            a.match_command("session_x").unwrap().prefix,
            b.match_command("session_x").unwrap().prefix
        );
    }

    #[test]
    fn test_auto_start_filter() {
        let table = PluginTable::new(vec![
            descriptor("ops_", false),
            descriptor("session_", true),
        ]);

        let eager: Vec<_> = table.auto_start().map(|d| d.prefix.as_str()).collect();
        assert_eq!(eager, vec!["session_"]);
    }

    #[test]
    fn test_to_value_keys_by_prefix() {
        let table = PluginTable::new(vec![descriptor("ops_", false)]);
        let value = table.to_value();

        assert_eq!(value["ops_"]["process_id"], "app:plugins.ops_");
        assert_eq!(value["ops_"]["auto_start"], false);
    }

    #[test]
    fn test_entry_defaults_pending() {
        let entry = PluginEntry::default();
        assert_eq!(entry.status, PluginStatus::Pending);
        assert_eq!(entry.restart_count, 0);
        assert!(!entry.is_running());
        assert!(entry.pid().is_none());
    }
}

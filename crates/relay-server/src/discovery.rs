//! Plugin discovery against the external registry.
//!
//! The registry is queried once at server start for entries of kind
//! `process.lua` whose metadata marks them `type = "relay.plugin"`.
//! Each surviving entry yields one immutable [`PluginDescriptor`];
//! the set never changes for the lifetime of the process.

use anyhow::{Context, Result};
use relay_core::plugin::PluginDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Registry kind plugin processes are filed under.
pub const PLUGIN_KIND: &str = "process.lua";

/// Metadata `type` marking relay plugins.
pub const PLUGIN_TYPE: &str = "relay.plugin";

/// One raw registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Registry id; becomes the plugin's `process_id`.
    pub id: String,
    /// Entry kind.
    pub kind: String,
    /// Free-form metadata.
    #[serde(default)]
    pub meta: Value,
}

/// Read access to the external registry.
pub trait RegistryClient: Send + Sync {
    /// All entries of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry is unreachable or its data
    /// is unreadable; fatal at startup.
    fn entries_of_kind(&self, kind: &str) -> Result<Vec<RegistryEntry>>;
}

/// Registry snapshot stored as a JSON array on disk.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    /// Client reading the snapshot at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegistryClient for FileRegistry {
    fn entries_of_kind(&self, kind: &str) -> Result<Vec<RegistryEntry>> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read registry snapshot: {}", self.path.display()))?;
        let entries: Vec<RegistryEntry> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse registry snapshot: {}", self.path.display()))?;

        Ok(entries.into_iter().filter(|entry| entry.kind == kind).collect())
    }
}

/// In-memory registry for tests and embedders.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    entries: Vec<RegistryEntry>,
}

impl StaticRegistry {
    /// Registry holding the given entries.
    #[must_use]
    pub fn with_entries(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }
}

impl RegistryClient for StaticRegistry {
    fn entries_of_kind(&self, kind: &str) -> Result<Vec<RegistryEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .cloned()
            .collect())
    }
}

/// Discover the plugin set.
///
/// Entries without a non-empty `command_prefix` are skipped with a
/// warning. `default_host` fills in for entries without a
/// `default_host` of their own.
///
/// # Errors
///
/// Propagates registry access failures.
pub fn discover_plugins(
    client: &dyn RegistryClient,
    default_host: &str,
) -> Result<Vec<PluginDescriptor>> {
    let mut plugins = Vec::new();

    for entry in client.entries_of_kind(PLUGIN_KIND)? {
        if entry.meta.get("type").and_then(Value::as_str) != Some(PLUGIN_TYPE) {
            continue;
        }

        let Some(prefix) = entry
            .meta
            .get("command_prefix")
            .and_then(Value::as_str)
            .filter(|prefix| !prefix.is_empty())
        else {
            warn!(entry = %entry.id, "plugin entry has no command_prefix, skipping");
            continue;
        };

        let host = entry
            .meta
            .get("default_host")
            .and_then(Value::as_str)
            .unwrap_or(default_host)
            .to_string();
        let auto_start = entry
            .meta
            .get("auto_start")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        debug!(
            prefix = %prefix,
            process = %entry.id,
            host = %host,
            auto_start,
            "discovered plugin"
        );
        plugins.push(PluginDescriptor {
            prefix: prefix.to_string(),
            process_id: entry.id,
            host,
            auto_start,
        });
    }

    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, kind: &str, meta: Value) -> RegistryEntry {
        RegistryEntry {
            id: id.to_string(),
            kind: kind.to_string(),
            meta,
        }
    }

    #[test]
    fn test_discovery_filters_kind_and_type() {
        let registry = StaticRegistry::with_entries(vec![
            entry(
                "app:plugins.ops",
                PLUGIN_KIND,
                json!({ "type": PLUGIN_TYPE, "command_prefix": "ops_" }),
            ),
            entry(
                "app:plugins.other",
                PLUGIN_KIND,
                json!({ "type": "something.else", "command_prefix": "x_" }),
            ),
            entry("app:http.handler", "http.handler", json!({ "type": PLUGIN_TYPE })),
        ]);

        let plugins = discover_plugins(&registry, "local").unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].prefix, "ops_");
        assert_eq!(plugins[0].process_id, "app:plugins.ops");
    }

    #[test]
    fn test_missing_prefix_skipped() {
        let registry = StaticRegistry::with_entries(vec![
            entry("app:plugins.broken", PLUGIN_KIND, json!({ "type": PLUGIN_TYPE })),
            entry(
                "app:plugins.empty",
                PLUGIN_KIND,
                json!({ "type": PLUGIN_TYPE, "command_prefix": "" }),
            ),
        ]);

        let plugins = discover_plugins(&registry, "local").unwrap();
        assert!(plugins.is_empty());
    }

    #[test]
    fn test_host_and_auto_start_defaults() {
        let registry = StaticRegistry::with_entries(vec![
            entry(
                "app:plugins.session",
                PLUGIN_KIND,
                json!({
                    "type": PLUGIN_TYPE,
                    "command_prefix": "session_",
                    "default_host": "sessions-1",
                    "auto_start": true,
                }),
            ),
            entry(
                "app:plugins.ops",
                PLUGIN_KIND,
                json!({ "type": PLUGIN_TYPE, "command_prefix": "ops_" }),
            ),
        ]);

        let plugins = discover_plugins(&registry, "node-1").unwrap();
        let session = plugins.iter().find(|p| p.prefix == "session_").unwrap();
        let ops = plugins.iter().find(|p| p.prefix == "ops_").unwrap();

        assert_eq!(session.host, "sessions-1");
        assert!(session.auto_start);
        assert_eq!(ops.host, "node-1");
        assert!(!ops.auto_start);
    }
}

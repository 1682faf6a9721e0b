//! Well-known process names.
//!
//! The Central Hub registers itself under [`CENTRAL_NAME`]; every
//! User Hub is registered under `user.<user_id>` while it lives.

use dashmap::DashMap;
use thiserror::Error;

use crate::process::Pid;

/// Name the Central Hub is registered under.
pub const CENTRAL_NAME: &str = "wippy.central";

/// Name a User Hub is registered under.
#[must_use]
pub fn user_hub_name(user_id: &str) -> String {
    format!("user.{user_id}")
}

/// Registration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name is held by a different process.
    #[error("name already registered: {0}")]
    NameTaken(String),
}

/// Concurrent name-to-pid directory.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    names: DashMap<String, Pid>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pid` under `name`.
    ///
    /// Re-registering the same pid is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NameTaken`] if a different process
    /// holds the name.
    pub fn register(&self, name: impl Into<String>, pid: Pid) -> Result<(), RegistryError> {
        let name = name.into();
        match self.names.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().id() == pid.id() {
                    Ok(())
                } else {
                    Err(RegistryError::NameTaken(name))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(pid);
                Ok(())
            }
        }
    }

    /// Resolve a name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Pid> {
        self.names.get(name).map(|pid| pid.clone())
    }

    /// Remove `name`, but only while it still maps to `pid`.
    pub fn unregister(&self, name: &str, pid: &Pid) {
        self.names.remove_if(name, |_, registered| registered.id() == pid.id());
    }

    /// Number of registered names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

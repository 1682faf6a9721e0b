//! Security credentials attached to User Hubs at spawn.
//!
//! The actor/scope service itself is external; this module defines
//! the opaque credential tokens and the lookup seam. Credentials are
//! materialized once per User Hub and never mutated afterwards.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Opaque credential identifying a user to downstream services.
#[derive(Debug, Clone)]
pub struct Actor {
    user_id: Arc<str>,
    metadata: Arc<Value>,
}

impl Actor {
    /// Build an actor token from the join metadata.
    #[must_use]
    pub fn new(user_id: impl Into<String>, metadata: Value) -> Self {
        Self {
            user_id: user_id.into().into(),
            metadata: Arc::new(metadata),
        }
    }

    /// The user the token stands for.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The metadata captured at construction.
    #[must_use]
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }
}

/// Opaque named capability scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    name: Arc<str>,
}

impl Scope {
    /// Mint a scope token.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into(),
        }
    }

    /// The scope's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Actor and scope bound to one User Hub.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub actor: Actor,
    pub scope: Scope,
}

/// Credential service failures.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// No scope is registered under the configured name.
    #[error("security scope not found: {0}")]
    ScopeNotFound(String),

    /// The service refused to mint an actor for the user.
    #[error("actor rejected for {user_id}: {reason}")]
    ActorRejected { user_id: String, reason: String },
}

/// Seam to the external actor/scope service.
pub trait SecurityService: Send + Sync {
    /// Construct the actor credential for a user.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ActorRejected`] when the service
    /// refuses the user; the join is then answered with
    /// `hub_creation_failed`.
    fn actor(&self, user_id: &str, metadata: &Value) -> Result<Actor, SecurityError>;

    /// Look up a scope by its registered name.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ScopeNotFound`] for unknown names;
    /// fatal at Central Hub startup.
    fn named_scope(&self, name: &str) -> Result<Scope, SecurityError>;
}

/// Scope directory backed by a fixed name list; mints an actor for
/// every user. The default deployment.
#[derive(Debug, Default)]
pub struct StaticScopes {
    scopes: Vec<String>,
}

impl StaticScopes {
    /// Directory holding the given scope names.
    #[must_use]
    pub fn with_scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

impl SecurityService for StaticScopes {
    fn actor(&self, user_id: &str, metadata: &Value) -> Result<Actor, SecurityError> {
        Ok(Actor::new(user_id, metadata.clone()))
    }

    fn named_scope(&self, name: &str) -> Result<Scope, SecurityError> {
        if self.scopes.iter().any(|scope| scope == name) {
            Ok(Scope::new(name))
        } else {
            Err(SecurityError::ScopeNotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_scopes_lookup() {
        let service = StaticScopes::with_scopes(["user.default", "admin"]);
        assert_eq!(service.named_scope("user.default").unwrap().name(), "user.default");
        assert!(matches!(
            service.named_scope("missing"),
            Err(SecurityError::ScopeNotFound(_))
        ));
    }

    #[test]
    fn test_actor_captures_metadata() {
        let service = StaticScopes::default();
        let actor = service
            .actor("u1", &json!({"user_id": "u1", "plan": "pro"}))
            .unwrap();
        assert_eq!(actor.user_id(), "u1");
        assert_eq!(actor.metadata()["plan"], json!("pro"));
    }
}

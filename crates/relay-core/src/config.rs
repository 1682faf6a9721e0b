//! Hub configuration.
//!
//! One [`HubConfig`] is materialized at server start and shared by
//! the Central Hub and every User Hub it spawns. The server crate
//! maps its file/environment configuration onto this struct.

use std::time::Duration;

/// Default grace attached to every cancel.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration of the hub hierarchy.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connection limit enforced per user at admission.
    pub max_connections_per_user: usize,
    /// Idle span after which a clientless User Hub is evicted.
    pub inactivity_timeout: Duration,
    /// Inbox depth factor: `message_queue_size = max_connections_per_user * queue_multiplier`.
    pub queue_multiplier: usize,
    /// Host plugins are spawned on unless their descriptor overrides it.
    pub host: String,
    /// Name of the security scope user hubs run under.
    pub user_security_scope: String,
    /// Grace period attached to cancels issued by the hubs.
    pub cancel_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 10,
            inactivity_timeout: Duration::from_secs(300),
            queue_multiplier: 100,
            host: "local".to_string(),
            user_security_scope: "user.default".to_string(),
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }
}

impl HubConfig {
    /// GC ticker period: `⌊inactivity / 2.5⌋` seconds, at least one.
    #[must_use]
    pub fn gc_check_interval(&self) -> Duration {
        let secs = (self.inactivity_timeout.as_secs_f64() / 2.5).floor() as u64;
        Duration::from_secs(secs.max(1))
    }

    /// Heartbeat period advertised to transports: `⌊inactivity / 5⌋`
    /// seconds, at least one.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        let secs = self.inactivity_timeout.as_secs() / 5;
        Duration::from_secs(secs.max(1))
    }

    /// Inbox depth for hub processes.
    #[must_use]
    pub fn message_queue_size(&self) -> usize {
        (self.max_connections_per_user * self.queue_multiplier).max(1)
    }
}

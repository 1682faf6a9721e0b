//! The singleton admission and supervision process.
//!
//! The Central Hub accepts `ws.join` announcements from the
//! transport, lazily creates the right User Hub, and answers with a
//! `ws.control` rebind so subsequent frames flow to the hub directly.
//! It enforces the per-user connection limit, garbage-collects idle
//! hubs on a ticker, observes hub terminations through its link
//! events, and forwards unknown topics to every live hub as a
//! best-effort administrative broadcast.
//!
//! A User Hub is never auto-restarted: the next connection by that
//! user lazily recreates one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use relay_protocol::{topics, ActivityUpdate, ErrorBody, ErrorCode};

use crate::clock;
use crate::config::HubConfig;
use crate::hub::{UserHub, UserHubInit};
use crate::metrics;
use crate::plugin::{PluginHost, PluginTable};
use crate::process::{
    self, Body, Child, Context, Envelope, ExitReason, PeerInfo, Pid, ProcessError, Rebind,
    SpawnOpts, SystemEvent, SystemSender,
};
use crate::registry::{self, ProcessRegistry};
use crate::security::{Credentials, Scope, SecurityError, SecurityService};

/// Supervision record for one User Hub.
struct UserHubEntry {
    child: Child,
    created_at: Instant,
    /// Monotonic receipt time of the last join or activity report;
    /// drives the idle computation.
    last_activity: Option<Instant>,
    /// Wall-clock timestamp the hub itself reported last.
    last_reported: Option<OffsetDateTime>,
    client_count: usize,
    terminating: bool,
    termination_started_at: Option<Instant>,
}

/// Snapshot of the Central Hub's bookkeeping, published after every
/// mutation of the hub set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CentralStats {
    /// Running hub counter.
    pub total_hubs: usize,
    /// Entries actually tracked; always equals `total_hubs`.
    pub tracked_hubs: usize,
    /// Entries awaiting their exit event after a cancel.
    pub terminating_hubs: usize,
}

/// The singleton admission/supervision process.
pub struct CentralHub {
    config: HubConfig,
    plugins: Arc<PluginTable>,
    security: Arc<dyn SecurityService>,
    host: Arc<dyn PluginHost>,
    names: Arc<ProcessRegistry>,
    scope: Scope,
    user_hubs: HashMap<String, UserHubEntry>,
    total_hubs: usize,
    stats: watch::Sender<CentralStats>,
}

impl CentralHub {
    /// Build the Central Hub.
    ///
    /// Resolves the configured security scope once; a missing scope is
    /// a structural error that must abort startup.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ScopeNotFound`] when the configured
    /// `user_security_scope` is not registered.
    pub fn new(
        config: HubConfig,
        plugins: Arc<PluginTable>,
        security: Arc<dyn SecurityService>,
        host: Arc<dyn PluginHost>,
        names: Arc<ProcessRegistry>,
    ) -> Result<(Self, watch::Receiver<CentralStats>), SecurityError> {
        let scope = security.named_scope(&config.user_security_scope)?;
        let (stats, stats_rx) = watch::channel(CentralStats::default());

        Ok((
            Self {
                config,
                plugins,
                security,
                host,
                names,
                scope,
                user_hubs: HashMap::new(),
                total_hubs: 0,
                stats,
            },
            stats_rx,
        ))
    }

    /// Spawn the Central Hub linked to `monitor` and register it under
    /// its well-known name.
    #[must_use]
    pub fn spawn(self, monitor: &SystemSender) -> Child {
        let names = self.names.clone();
        let queue = self.config.message_queue_size();
        let child = process::spawn(SpawnOpts::new("central").queue(queue), monitor, |ctx| {
            self.run(ctx)
        });
        if let Err(error) = names.register(registry::CENTRAL_NAME, child.pid().clone()) {
            warn!(error = %error, "central hub name registration failed");
        }
        child
    }

    async fn run(mut self, mut ctx: Context) -> Result<Value, ProcessError> {
        info!(
            plugins = self.plugins.len(),
            gc_interval = ?self.config.gc_check_interval(),
            inactivity_timeout = ?self.config.inactivity_timeout,
            "central hub started"
        );

        let mut gc = tokio::time::interval(self.config.gc_check_interval());
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(envelope) = ctx.mailbox.messages.recv() => self.handle_message(&ctx, envelope),
                Some(event) = ctx.mailbox.system.recv() => match event {
                    SystemEvent::Cancel { grace } => return Ok(self.shutdown(&ctx, grace)),
                    SystemEvent::Exit { pid, reason } => self.handle_hub_exit(&pid, &reason),
                },
                _ = gc.tick() => self.collect_idle(),
            }
        }
    }

    fn handle_message(&mut self, ctx: &Context, envelope: Envelope) {
        metrics::record_message("inbound");
        match envelope.topic.as_str() {
            topics::WS_JOIN => match envelope.body {
                Body::Peer(peer) => self.handle_join(ctx, &peer),
                body => warn!(body = ?body, "malformed ws.join"),
            },
            // Advisory only; hubs learn about departures from the
            // transport directly.
            topics::WS_LEAVE => debug!("ws.leave observed"),
            topics::HUB_ACTIVITY_UPDATE => self.handle_activity(envelope.body),
            _ => self.forward_to_hubs(&envelope),
        }
    }

    fn handle_join(&mut self, ctx: &Context, peer: &PeerInfo) {
        let Some(user_id) = peer
            .metadata
            .get("user_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            self.send_error(
                &peer.client,
                ErrorCode::MissingUserId,
                "join metadata carries no user_id",
            );
            return;
        };

        if let Some(entry) = self.user_hubs.get(&user_id) {
            if entry.client_count >= self.config.max_connections_per_user {
                info!(
                    user = %user_id,
                    clients = entry.client_count,
                    "connection rejected at limit"
                );
                self.send_error(
                    &peer.client,
                    ErrorCode::MaxConnectionsReached,
                    format!("connection limit reached ({} connections)", entry.client_count),
                );
                return;
            }
        }

        let Some(hub) = self.get_or_create_user_hub(ctx, &user_id, &peer.metadata) else {
            self.send_error(
                &peer.client,
                ErrorCode::HubCreationFailed,
                format!("could not start a hub for {user_id}"),
            );
            return;
        };

        peer.client.send(Envelope::new(
            topics::WS_CONTROL,
            Body::Control(Rebind {
                target: hub,
                metadata: peer.metadata.clone(),
                plugins: self.plugins.clone(),
            }),
        ));

        if let Some(entry) = self.user_hubs.get_mut(&user_id) {
            entry.last_activity = Some(Instant::now());
        }
    }

    /// Return the user's hub pid, creating the hub if needed.
    ///
    /// Idempotent: concurrent joins observe the same pid because this
    /// runs inside the hub's single handler loop.
    fn get_or_create_user_hub(
        &mut self,
        ctx: &Context,
        user_id: &str,
        metadata: &Value,
    ) -> Option<Pid> {
        if let Some(entry) = self.user_hubs.get(user_id) {
            return Some(entry.child.pid().clone());
        }

        let actor = match self.security.actor(user_id, metadata) {
            Ok(actor) => actor,
            Err(error) => {
                warn!(user = %user_id, error = %error, "actor construction failed");
                return None;
            }
        };

        let child = UserHub::new(UserHubInit {
            user_id: user_id.to_string(),
            user_metadata: metadata.clone(),
            plugins: self.plugins.clone(),
            config: self.config.clone(),
            central: ctx.pid.clone(),
            credentials: Credentials {
                actor,
                scope: self.scope.clone(),
            },
            host: self.host.clone(),
        })
        .spawn(ctx.monitor());

        let pid = child.pid().clone();
        if let Err(error) = self.names.register(registry::user_hub_name(user_id), pid.clone()) {
            warn!(user = %user_id, error = %error, "user hub name registration failed");
        }

        self.user_hubs.insert(
            user_id.to_string(),
            UserHubEntry {
                child,
                created_at: Instant::now(),
                last_activity: None,
                last_reported: None,
                client_count: 0,
                terminating: false,
                termination_started_at: None,
            },
        );
        self.total_hubs += 1;
        metrics::record_hub_created();
        info!(user = %user_id, hub = %pid, hubs = self.total_hubs, "user hub created");
        self.publish_stats();

        Some(pid)
    }

    fn handle_activity(&mut self, body: Body) {
        let Body::Json(value) = body else {
            warn!("malformed activity update");
            return;
        };
        let update: ActivityUpdate = match serde_json::from_value(value) {
            Ok(update) => update,
            Err(error) => {
                warn!(error = %error, "undecodable activity update");
                return;
            }
        };

        let Some(entry) = self.user_hubs.get_mut(&update.user_id) else {
            debug!(user = %update.user_id, "activity update for unknown user");
            return;
        };

        entry.client_count = update.client_count;
        entry.last_activity = Some(Instant::now());
        match clock::parse_rfc3339(&update.last_activity) {
            Ok(reported) => entry.last_reported = Some(reported),
            Err(error) => {
                warn!(user = %update.user_id, error = %error, "unparseable activity timestamp");
            }
        }
        debug!(
            user = %update.user_id,
            clients = update.client_count,
            "activity update"
        );
    }

    fn handle_hub_exit(&mut self, pid: &Pid, reason: &ExitReason) {
        let Some(user_id) = self
            .user_hubs
            .iter()
            .find(|(_, entry)| entry.child.pid().id() == pid.id())
            .map(|(user_id, _)| user_id.clone())
        else {
            debug!(process = %pid, "exit event for untracked process");
            return;
        };

        if let Some(entry) = self.user_hubs.remove(&user_id) {
            if let Some(started) = entry.termination_started_at {
                debug!(
                    user = %user_id,
                    elapsed = ?Instant::now().duration_since(started),
                    "terminating hub exited"
                );
            }
        }
        self.total_hubs = self.total_hubs.saturating_sub(1);
        self.names.unregister(&registry::user_hub_name(&user_id), pid);
        metrics::record_hub_removed();

        if reason.is_crash() {
            warn!(user = %user_id, reason = %reason, hubs = self.total_hubs, "user hub crashed");
        } else {
            info!(user = %user_id, hubs = self.total_hubs, "user hub exited");
        }
        self.publish_stats();
    }

    fn collect_idle(&mut self) {
        let now = Instant::now();
        let mut evicted = false;

        for (user_id, entry) in &mut self.user_hubs {
            if entry.client_count > 0 || entry.terminating {
                continue;
            }
            let idle = now.duration_since(entry.last_activity.unwrap_or(entry.created_at));
            if idle > self.config.inactivity_timeout {
                info!(
                    user = %user_id,
                    idle = ?idle,
                    last_reported = ?entry.last_reported,
                    "evicting idle user hub"
                );
                entry.child.cancel(self.config.cancel_timeout);
                entry.terminating = true;
                entry.termination_started_at = Some(now);
                metrics::record_eviction();
                evicted = true;
            }
        }

        if evicted {
            self.publish_stats();
        }
    }

    fn forward_to_hubs(&self, envelope: &Envelope) {
        debug!(
            topic = %envelope.topic,
            hubs = self.user_hubs.len(),
            "forwarding to user hubs"
        );
        metrics::record_message("forwarded");
        for entry in self.user_hubs.values() {
            entry.child.pid().send(envelope.clone());
        }
    }

    fn send_error(&self, client: &Pid, code: ErrorCode, message: impl Into<String>) {
        metrics::record_client_error(code.as_str());
        client.send(Envelope::json(topics::ERROR, &ErrorBody::new(code, message)));
    }

    fn shutdown(&mut self, ctx: &Context, grace: Duration) -> Value {
        info!(hubs = self.total_hubs, "central hub shutting down");
        for entry in self.user_hubs.values() {
            entry.child.cancel(grace);
        }
        self.names.unregister(registry::CENTRAL_NAME, &ctx.pid);
        json!({ "status": "shutdown", "hubs": self.total_hubs })
    }

    fn publish_stats(&self) {
        self.stats.send_replace(CentralStats {
            total_hubs: self.total_hubs,
            tracked_hubs: self.user_hubs.len(),
            terminating_hubs: self
                .user_hubs
                .values()
                .filter(|entry| entry.terminating)
                .count(),
        });
    }
}

//! The per-user hub process.
//!
//! A User Hub owns every live connection for one user. It welcomes
//! freshly rebound clients, routes their commands to plugins by
//! longest command-prefix, supervises those plugins with a bounded
//! restart budget, and broadcasts plugin output back to all
//! connections. It reports its liveness to the Central Hub with
//! `hub.activity_update` on every join and leave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use relay_protocol::{codec, topics, ActivityUpdate, ErrorCode, ErrorBody, WelcomeBody};

use crate::clock;
use crate::config::HubConfig;
use crate::metrics;
use crate::plugin::{
    PluginDescriptor, PluginEntry, PluginHost, PluginInit, PluginStatus, PluginTable,
    MAX_PLUGIN_RESTARTS, SESSION_PREFIX,
};
use crate::process::{
    self, Body, Child, Context, Delivery, Envelope, ExitReason, PeerInfo, Pid, ProcessError,
    SpawnOpts, SystemEvent, SystemSender,
};
use crate::registry;
use crate::security::Credentials;

/// Arguments a User Hub is spawned with.
pub struct UserHubInit {
    pub user_id: String,
    pub user_metadata: Value,
    pub plugins: Arc<PluginTable>,
    pub config: HubConfig,
    /// The Central Hub, for activity reports.
    pub central: Pid,
    pub credentials: Credentials,
    pub host: Arc<dyn PluginHost>,
}

/// One user's hub: connection set, plugin supervision, broadcast.
pub struct UserHub {
    user_id: String,
    user_metadata: Value,
    plugins: Arc<PluginTable>,
    config: HubConfig,
    central: Pid,
    credentials: Credentials,
    host: Arc<dyn PluginHost>,
    active_plugins: HashMap<String, PluginEntry>,
    clients: HashMap<u64, Pid>,
}

impl UserHub {
    /// Build a hub from its init arguments.
    #[must_use]
    pub fn new(init: UserHubInit) -> Self {
        Self {
            user_id: init.user_id,
            user_metadata: init.user_metadata,
            plugins: init.plugins,
            config: init.config,
            central: init.central,
            credentials: init.credentials,
            host: init.host,
            active_plugins: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Spawn the hub process linked to `monitor`.
    #[must_use]
    pub fn spawn(self, monitor: &SystemSender) -> Child {
        let opts = SpawnOpts::new(registry::user_hub_name(&self.user_id))
            .queue(self.config.message_queue_size());
        process::spawn(opts, monitor, |ctx| self.run(ctx))
    }

    async fn run(mut self, mut ctx: Context) -> Result<Value, ProcessError> {
        info!(
            user = %self.user_id,
            scope = %self.credentials.scope.name(),
            plugins = self.plugins.len(),
            "user hub started"
        );

        let eager: Vec<PluginDescriptor> = self.plugins.auto_start().cloned().collect();
        for descriptor in eager {
            if let Err(error) = self.spawn_plugin(&ctx, &descriptor) {
                warn!(
                    user = %self.user_id,
                    plugin = %descriptor.prefix,
                    error = %error,
                    "auto-start spawn failed"
                );
            }
        }

        let result = loop {
            tokio::select! {
                Some(envelope) = ctx.mailbox.messages.recv() => {
                    if envelope.topic == topics::WS_CANCEL {
                        info!(user = %self.user_id, "transport requested shutdown");
                        break self.shutdown(self.config.cancel_timeout);
                    }
                    self.handle_message(&ctx, envelope);
                }
                Some(event) = ctx.mailbox.system.recv() => match event {
                    SystemEvent::Cancel { grace } => break self.shutdown(grace),
                    SystemEvent::Exit { pid, reason } => self.handle_plugin_exit(&ctx, &pid, reason),
                }
            }
        };

        Ok(result)
    }

    fn handle_message(&mut self, ctx: &Context, envelope: Envelope) {
        metrics::record_message("inbound");
        match envelope.topic.as_str() {
            topics::WS_JOIN => match envelope.body {
                Body::Peer(peer) => self.handle_join(&peer),
                body => warn!(user = %self.user_id, body = ?body, "malformed ws.join"),
            },
            topics::WS_LEAVE => match envelope.body {
                Body::Peer(peer) => self.handle_leave(&peer),
                body => warn!(user = %self.user_id, body = ?body, "malformed ws.leave"),
            },
            topics::WS_MESSAGE => {
                let Some(sender) = envelope.sender else {
                    warn!(user = %self.user_id, "ws.message without a sender");
                    return;
                };
                let Body::Raw(raw) = envelope.body else {
                    warn!(user = %self.user_id, "ws.message without raw bytes");
                    return;
                };
                self.dispatch(ctx, sender, &raw);
            }
            // Anything else is plugin output: fan it out verbatim.
            _ => self.broadcast(&envelope),
        }
    }

    fn handle_join(&mut self, peer: &PeerInfo) {
        let was_empty = self.clients.is_empty();
        if self
            .clients
            .insert(peer.client.id(), peer.client.clone())
            .is_none()
        {
            metrics::record_client_joined();
        }
        debug!(
            user = %self.user_id,
            client = %peer.client,
            clients = self.clients.len(),
            "client joined"
        );

        let welcome = WelcomeBody {
            user_id: self.user_id.clone(),
            client_count: self.clients.len(),
            plugins: self.plugins.to_value(),
        };
        peer.client.send(Envelope::json(topics::WELCOME, &welcome));

        if was_empty && !self.clients.is_empty() {
            self.signal_session(topics::RESUME);
        }
        self.post_activity();
    }

    fn handle_leave(&mut self, peer: &PeerInfo) {
        if self.clients.remove(&peer.client.id()).is_none() {
            debug!(user = %self.user_id, client = %peer.client, "leave for unknown client");
            return;
        }
        metrics::record_client_left();
        debug!(
            user = %self.user_id,
            client = %peer.client,
            clients = self.clients.len(),
            "client left"
        );

        if self.clients.is_empty() {
            self.signal_session(topics::SHUTDOWN);
        }
        self.post_activity();
    }

    fn dispatch(&mut self, ctx: &Context, sender: Pid, raw: &[u8]) {
        let (command, frame) = match codec::decode_command(raw) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(user = %self.user_id, client = %sender, error = %error, "undecodable frame");
                self.send_error(&sender, error.code(), error.to_string(), error.request_id());
                return;
            }
        };

        let Some(descriptor) = self.plugins.match_command(&command).cloned() else {
            self.send_error(
                &sender,
                ErrorCode::PluginNotFound,
                format!("no plugin handles {command}"),
                frame.request_id,
            );
            return;
        };

        let plugin = match self.ensure_plugin(ctx, &descriptor) {
            Ok(pid) => pid,
            Err(reason) => {
                self.send_error(&sender, ErrorCode::PluginFailed, reason, frame.request_id);
                return;
            }
        };

        let stripped = command[descriptor.prefix.len()..].to_string();
        let delivery = Delivery {
            conn_pid: sender,
            request_id: frame.request_id,
            session_id: frame.session_id,
            command,
            data: frame.data,
            start_token: frame.start_token,
            context: frame.context,
        };
        plugin.send(Envelope::new(stripped, Body::Delivery(delivery)).with_sender(ctx.pid.clone()));
        metrics::record_message("routed");
    }

    /// Return a live pid for the plugin, spawning it on first use.
    ///
    /// `stopped` and `failed` are terminal: the restart budget only
    /// applies to crashes, so a command can never revive either.
    fn ensure_plugin(&mut self, ctx: &Context, descriptor: &PluginDescriptor) -> Result<Pid, String> {
        let state = self
            .active_plugins
            .get(&descriptor.prefix)
            .map(|entry| (entry.status, entry.pid().cloned()));

        match state {
            Some((PluginStatus::Failed, _)) => Err("plugin permanently failed".to_string()),
            Some((PluginStatus::Stopped, _)) => Err("plugin stopped".to_string()),
            Some((PluginStatus::Running, Some(pid))) => Ok(pid),
            _ => self
                .spawn_plugin(ctx, descriptor)
                .map_err(|error| error.to_string()),
        }
    }

    fn spawn_plugin(
        &mut self,
        ctx: &Context,
        descriptor: &PluginDescriptor,
    ) -> Result<Pid, crate::plugin::SpawnError> {
        let init = PluginInit {
            user_id: self.user_id.clone(),
            user_metadata: self.user_metadata.clone(),
            user_hub: ctx.pid.clone(),
            config: self.config.clone(),
        };

        match self.host.spawn(descriptor, init, ctx.monitor()) {
            Ok(child) => {
                metrics::record_plugin_spawn();
                let pid = child.pid().clone();
                debug!(
                    user = %self.user_id,
                    plugin = %descriptor.prefix,
                    process = %pid,
                    host = %descriptor.host,
                    "plugin spawned"
                );
                let entry = self
                    .active_plugins
                    .entry(descriptor.prefix.clone())
                    .or_default();
                entry.child = Some(child);
                entry.status = PluginStatus::Running;
                Ok(pid)
            }
            Err(error) => {
                warn!(
                    user = %self.user_id,
                    plugin = %descriptor.prefix,
                    error = %error,
                    "plugin spawn failed"
                );
                metrics::record_plugin_failure();
                let entry = self
                    .active_plugins
                    .entry(descriptor.prefix.clone())
                    .or_default();
                entry.child = None;
                entry.status = PluginStatus::Failed;
                Err(error)
            }
        }
    }

    fn handle_plugin_exit(&mut self, ctx: &Context, pid: &Pid, reason: ExitReason) {
        let Some(prefix) = self
            .active_plugins
            .iter()
            .find(|(_, entry)| entry.pid().map(Pid::id) == Some(pid.id()))
            .map(|(prefix, _)| prefix.clone())
        else {
            debug!(user = %self.user_id, process = %pid, "exit event for untracked process");
            return;
        };

        let restart = {
            let Some(entry) = self.active_plugins.get_mut(&prefix) else {
                return;
            };
            entry.child = None;

            if !reason.is_crash() {
                entry.status = PluginStatus::Stopped;
                info!(user = %self.user_id, plugin = %prefix, "plugin stopped");
                return;
            }

            warn!(user = %self.user_id, plugin = %prefix, reason = %reason, "plugin crashed");
            if entry.restart_count < MAX_PLUGIN_RESTARTS {
                entry.restart_count += 1;
                Some(entry.restart_count)
            } else {
                entry.status = PluginStatus::Failed;
                metrics::record_plugin_failure();
                warn!(
                    user = %self.user_id,
                    plugin = %prefix,
                    restarts = entry.restart_count,
                    "plugin permanently failed"
                );
                None
            }
        };

        if let Some(attempt) = restart {
            metrics::record_plugin_restart();
            let Some(descriptor) = self.plugins.get(&prefix).cloned() else {
                warn!(user = %self.user_id, plugin = %prefix, "no descriptor for restart");
                return;
            };
            match self.spawn_plugin(ctx, &descriptor) {
                Ok(_) => {
                    info!(user = %self.user_id, plugin = %prefix, restart = attempt, "plugin restarted");
                }
                Err(error) => {
                    warn!(user = %self.user_id, plugin = %prefix, error = %error, "plugin restart failed");
                }
            }
        }
    }

    /// Signal the session keeper, when one is running.
    fn signal_session(&self, topic: &str) {
        let Some(entry) = self.active_plugins.get(SESSION_PREFIX) else {
            return;
        };
        if !entry.is_running() {
            return;
        }
        if let Some(pid) = entry.pid() {
            debug!(user = %self.user_id, signal = %topic, "signalling session plugin");
            pid.send(Envelope::empty(topic));
        }
    }

    fn post_activity(&self) {
        let update = ActivityUpdate {
            user_id: self.user_id.clone(),
            client_count: self.clients.len(),
            last_activity: clock::now_rfc3339(),
        };
        self.central
            .send(Envelope::json(topics::HUB_ACTIVITY_UPDATE, &update));
    }

    fn broadcast(&self, envelope: &Envelope) {
        metrics::record_message("broadcast");
        for client in self.clients.values() {
            client.send(envelope.clone());
        }
    }

    fn send_error(
        &self,
        client: &Pid,
        code: ErrorCode,
        message: impl Into<String>,
        request_id: Option<String>,
    ) {
        metrics::record_client_error(code.as_str());
        let body = ErrorBody::new(code, message).with_request_id(request_id);
        client.send(Envelope::json(topics::ERROR, &body));
    }

    fn shutdown(&mut self, grace: Duration) -> Value {
        info!(
            user = %self.user_id,
            plugins = self.active_plugins.len(),
            "user hub shutting down"
        );
        for (prefix, entry) in &self.active_plugins {
            if let Some(child) = &entry.child {
                debug!(user = %self.user_id, plugin = %prefix, "cancelling plugin");
                child.cancel(grace);
            }
        }
        json!({ "status": "shutdown", "user_id": self.user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Actor, Scope};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn descriptor(prefix: &str, auto_start: bool) -> PluginDescriptor {
        PluginDescriptor {
            prefix: prefix.to_string(),
            process_id: format!("app:plugins.{prefix}"),
            host: "local".to_string(),
            auto_start,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            actor: Actor::new("u1", json!({})),
            scope: Scope::new("user.default"),
        }
    }

    /// Host whose plugins forward every envelope they receive to the
    /// test, crash on a `boom` topic, and exit cleanly on cancel.
    struct ScriptedHost {
        deliveries: mpsc::UnboundedSender<Envelope>,
        spawns: Arc<AtomicUsize>,
        reject: bool,
    }

    impl ScriptedHost {
        fn new(reject: bool) -> (Self, mpsc::UnboundedReceiver<Envelope>, Arc<AtomicUsize>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let spawns = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    deliveries: tx,
                    spawns: spawns.clone(),
                    reject,
                },
                rx,
                spawns,
            )
        }
    }

    impl PluginHost for ScriptedHost {
        fn spawn(
            &self,
            descriptor: &PluginDescriptor,
            init: PluginInit,
            monitor: &SystemSender,
        ) -> Result<Child, crate::plugin::SpawnError> {
            if self.reject {
                return Err(crate::plugin::SpawnError::Rejected("scripted".to_string()));
            }
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let deliveries = self.deliveries.clone();
            let tag = format!("plugin.{}.{}", init.user_id, descriptor.prefix);
            Ok(process::spawn(
                SpawnOpts::new(tag),
                monitor,
                move |mut ctx| async move {
                    loop {
                        tokio::select! {
                            Some(envelope) = ctx.mailbox.messages.recv() => {
                                if envelope.topic == "boom" {
                                    return Err(ProcessError::new("boom"));
                                }
                                let _ = deliveries.send(envelope);
                            }
                            Some(event) = ctx.mailbox.system.recv() => {
                                if matches!(event, SystemEvent::Cancel { .. }) {
                                    return Ok(Value::Null);
                                }
                            }
                        }
                    }
                },
            ))
        }
    }

    struct Fixture {
        hub: Child,
        central_rx: mpsc::Receiver<Envelope>,
        deliveries: mpsc::UnboundedReceiver<Envelope>,
        spawns: Arc<AtomicUsize>,
        _events: mpsc::UnboundedReceiver<SystemEvent>,
    }

    fn boot(plugins: Vec<PluginDescriptor>, reject: bool) -> Fixture {
        let (central, central_rx) = process::endpoint("central", 64);
        let (host, deliveries, spawns) = ScriptedHost::new(reject);
        let hub = UserHub::new(UserHubInit {
            user_id: "u1".to_string(),
            user_metadata: json!({"plan": "pro"}),
            plugins: Arc::new(PluginTable::new(plugins)),
            config: HubConfig::default(),
            central,
            credentials: credentials(),
            host: Arc::new(host),
        });
        let (monitor, events) = process::system_channel();
        let hub = hub.spawn(&monitor);
        Fixture {
            hub,
            central_rx,
            deliveries,
            spawns,
            _events: events,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn recv_unbounded(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn join(hub: &Pid, client: &Pid) {
        hub.send(Envelope::new(
            topics::WS_JOIN,
            Body::Peer(PeerInfo {
                client: client.clone(),
                metadata: json!({"user_id": "u1"}),
            }),
        ));
    }

    fn leave(hub: &Pid, client: &Pid) {
        hub.send(Envelope::new(
            topics::WS_LEAVE,
            Body::Peer(PeerInfo {
                client: client.clone(),
                metadata: json!({"user_id": "u1"}),
            }),
        ));
    }

    fn message(hub: &Pid, client: &Pid, body: &str) {
        hub.send(
            Envelope::new(topics::WS_MESSAGE, Body::Raw(bytes::Bytes::copy_from_slice(body.as_bytes())))
                .with_sender(client.clone()),
        );
    }

    fn json_body(envelope: &Envelope) -> Value {
        match &envelope.body {
            Body::Json(value) => value.clone(),
            body => panic!("expected json body, got {body:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_welcomes_and_reports_activity() {
        let mut fx = boot(vec![descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);

        join(fx.hub.pid(), &client);

        let welcome = recv(&mut client_rx).await;
        assert_eq!(welcome.topic, topics::WELCOME);
        let body = json_body(&welcome);
        assert_eq!(body["user_id"], json!("u1"));
        assert_eq!(body["client_count"], json!(1));
        assert!(body["plugins"]["ops_"].is_object());

        let activity = recv(&mut fx.central_rx).await;
        assert_eq!(activity.topic, topics::HUB_ACTIVITY_UPDATE);
        let update: ActivityUpdate = serde_json::from_value(json_body(&activity)).unwrap();
        assert_eq!(update.client_count, 1);
        assert!(clock::parse_rfc3339(&update.last_activity).is_ok());
    }

    #[tokio::test]
    async fn test_leave_reports_zero_clients() {
        let mut fx = boot(vec![], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);

        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;
        let _ = recv(&mut fx.central_rx).await;

        leave(fx.hub.pid(), &client);
        let activity = recv(&mut fx.central_rx).await;
        let update: ActivityUpdate = serde_json::from_value(json_body(&activity)).unwrap();
        assert_eq!(update.client_count, 0);
    }

    #[tokio::test]
    async fn test_prefix_routing_strips_topic() {
        let mut fx = boot(vec![descriptor("s_", false), descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(
            fx.hub.pid(),
            &client,
            r#"{"type":"ops_restart","request_id":"r1","data":{}}"#,
        );

        let delivered = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(delivered.topic, "restart");
        match delivered.body {
            Body::Delivery(delivery) => {
                assert_eq!(delivery.command, "ops_restart");
                assert_eq!(delivery.request_id.as_deref(), Some("r1"));
                assert_eq!(delivery.conn_pid.id(), client.id());
                assert_eq!(delivery.data, Some(json!({})));
            }
            body => panic!("expected delivery, got {body:?}"),
        }
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_longest_prefix_dispatch() {
        let mut fx = boot(
            vec![descriptor("s_", false), descriptor("session_", false)],
            false,
        );
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(fx.hub.pid(), &client, r#"{"type":"session_touch"}"#);

        let delivered = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(delivered.topic, "touch");
    }

    #[tokio::test]
    async fn test_invalid_json_reply() {
        let fx = boot(vec![descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(fx.hub.pid(), &client, "{not json");

        let reply = recv(&mut client_rx).await;
        assert_eq!(reply.topic, topics::ERROR);
        assert_eq!(json_body(&reply)["error"], json!("invalid_json"));
    }

    #[tokio::test]
    async fn test_missing_type_reply_echoes_request_id() {
        let fx = boot(vec![descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(fx.hub.pid(), &client, r#"{"request_id":"r2"}"#);

        let reply = recv(&mut client_rx).await;
        let body = json_body(&reply);
        assert_eq!(body["error"], json!("unknown_command"));
        assert_eq!(body["request_id"], json!("r2"));
    }

    #[tokio::test]
    async fn test_unmatched_prefix_leaves_no_plugin_state() {
        let fx = boot(vec![descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(fx.hub.pid(), &client, r#"{"type":"other_cmd","request_id":"r3"}"#);

        let reply = recv(&mut client_rx).await;
        let body = json_body(&reply);
        assert_eq!(body["error"], json!("plugin_not_found"));
        assert_eq!(body["request_id"], json!("r3"));
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_replies_plugin_failed() {
        let fx = boot(vec![descriptor("ops_", false)], true);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        message(fx.hub.pid(), &client, r#"{"type":"ops_restart"}"#);
        let reply = recv(&mut client_rx).await;
        assert_eq!(json_body(&reply)["error"], json!("plugin_failed"));

        // The failure is terminal: the next command does not retry.
        message(fx.hub.pid(), &client, r#"{"type":"ops_restart"}"#);
        let reply = recv(&mut client_rx).await;
        assert_eq!(json_body(&reply)["error"], json!("plugin_failed"));
    }

    #[tokio::test]
    async fn test_crash_restarts_once_then_fails() {
        let mut fx = boot(vec![descriptor("ops_", false)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);
        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;

        // First crash: restarted.
        message(fx.hub.pid(), &client, r#"{"type":"ops_boom"}"#);
        timeout(Duration::from_secs(5), async {
            while fx.spawns.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("plugin was not restarted");

        // The restarted plugin serves commands.
        message(fx.hub.pid(), &client, r#"{"type":"ops_status"}"#);
        let delivered = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(delivered.topic, "status");

        // Second crash: budget exhausted, permanently failed. The exit
        // event races our next command, so poll until the terminal
        // state answers.
        message(fx.hub.pid(), &client, r#"{"type":"ops_boom"}"#);
        let body = timeout(Duration::from_secs(5), async {
            loop {
                message(fx.hub.pid(), &client, r#"{"type":"ops_status","request_id":"r4"}"#);
                if let Ok(Some(reply)) =
                    timeout(Duration::from_millis(200), client_rx.recv()).await
                {
                    break json_body(&reply);
                }
            }
        })
        .await
        .expect("plugin never reported failure");
        assert_eq!(body["error"], json!("plugin_failed"));
        assert_eq!(body["request_id"], json!("r4"));
        assert_eq!(fx.spawns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_session_plugin_signals() {
        let mut fx = boot(vec![descriptor("session_", true)], false);
        let (client, mut client_rx) = process::endpoint("c1", 16);

        join(fx.hub.pid(), &client);
        let _ = recv(&mut client_rx).await;
        let signal = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(signal.topic, topics::RESUME);

        leave(fx.hub.pid(), &client);
        let signal = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(signal.topic, topics::SHUTDOWN);
    }

    #[tokio::test]
    async fn test_second_join_gets_no_resume() {
        let mut fx = boot(vec![descriptor("session_", true)], false);
        let (c1, mut c1_rx) = process::endpoint("c1", 16);
        let (c2, mut c2_rx) = process::endpoint("c2", 16);

        join(fx.hub.pid(), &c1);
        let _ = recv(&mut c1_rx).await;
        let signal = recv_unbounded(&mut fx.deliveries).await;
        assert_eq!(signal.topic, topics::RESUME);

        join(fx.hub.pid(), &c2);
        let welcome = recv(&mut c2_rx).await;
        assert_eq!(json_body(&welcome)["client_count"], json!(2));

        // Only a 0 -> 1 transition resumes; drain must stay empty.
        leave(fx.hub.pid(), &c2);
        let signal = timeout(Duration::from_millis(200), fx.deliveries.recv()).await;
        assert!(signal.is_err(), "unexpected session signal: {signal:?}");
    }

    #[tokio::test]
    async fn test_plugin_output_broadcast_to_all_clients() {
        let fx = boot(vec![], false);
        let (c1, mut c1_rx) = process::endpoint("c1", 16);
        let (c2, mut c2_rx) = process::endpoint("c2", 16);
        join(fx.hub.pid(), &c1);
        join(fx.hub.pid(), &c2);
        let _ = recv(&mut c1_rx).await;
        let _ = recv(&mut c2_rx).await;

        // Unsolicited topic, as a plugin would emit it.
        fx.hub
            .pid()
            .send(Envelope::json("chat.update", &json!({"line": 7})));

        for rx in [&mut c1_rx, &mut c2_rx] {
            let envelope = recv(rx).await;
            assert_eq!(envelope.topic, "chat.update");
            assert_eq!(json_body(&envelope)["line"], json!(7));
        }
    }

    #[tokio::test]
    async fn test_ws_cancel_shuts_down_and_cancels_plugins() {
        let (monitor, mut events) = process::system_channel();
        let (central, _central_rx) = process::endpoint("central", 64);
        let (host, mut deliveries, _spawns) = ScriptedHost::new(false);
        let hub = UserHub::new(UserHubInit {
            user_id: "u1".to_string(),
            user_metadata: json!({}),
            plugins: Arc::new(PluginTable::new(vec![descriptor("session_", true)])),
            config: HubConfig::default(),
            central,
            credentials: credentials(),
            host: Arc::new(host),
        })
        .spawn(&monitor);

        hub.pid().send(Envelope::empty(topics::WS_CANCEL));

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("closed");
        match event {
            SystemEvent::Exit { pid, reason } => {
                assert_eq!(pid.id(), hub.pid().id());
                assert_eq!(reason, ExitReason::Normal);
            }
            event => panic!("unexpected event: {event:?}"),
        }
        // The session plugin exited through its cancel path, so its
        // delivery channel closes without ever carrying a signal.
        loop {
            match timeout(Duration::from_secs(5), deliveries.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }
}

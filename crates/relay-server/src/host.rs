//! Stdio plugin host.
//!
//! Runs each plugin as a child executable and bridges its mailbox to
//! the process over JSON lines: envelopes addressed to the plugin are
//! written to the child's stdin as `{"topic": ..., "payload": ...}`,
//! and every line the child prints in the same shape is forwarded to
//! the owning User Hub as a topic message (which the hub broadcasts
//! to the user's connections). The child's exit status decides
//! between a clean exit and a crash.

use relay_core::plugin::{PluginDescriptor, PluginHost, PluginInit, SpawnError};
use relay_core::process::{
    self, Body, Child, Envelope, ProcessError, SpawnOpts, SystemEvent, SystemSender,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

/// Wire shape of a line the plugin prints.
#[derive(Debug, Deserialize)]
struct PluginLine {
    topic: String,
    #[serde(default)]
    payload: Value,
}

/// Plugin host resolving `process_id`s to executables in one
/// directory.
#[derive(Debug)]
pub struct StdioPluginHost {
    bin_dir: PathBuf,
}

impl StdioPluginHost {
    /// Host resolving executables under `bin_dir`.
    #[must_use]
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }
}

impl PluginHost for StdioPluginHost {
    fn spawn(
        &self,
        descriptor: &PluginDescriptor,
        init: PluginInit,
        monitor: &SystemSender,
    ) -> Result<Child, SpawnError> {
        let executable = self.bin_dir.join(&descriptor.process_id);
        if !executable.exists() {
            return Err(SpawnError::UnknownProcess(descriptor.process_id.clone()));
        }

        let mut command = Command::new(&executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env("RELAY_USER_ID", &init.user_id)
            .env("RELAY_PLUGIN_PREFIX", &descriptor.prefix)
            .env("RELAY_PLUGIN_HOST", &descriptor.host);
        let mut child = command.spawn()?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(SpawnError::Rejected("plugin stdin unavailable".to_string()));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(SpawnError::Rejected("plugin stdout unavailable".to_string()));
        };

        debug!(
            plugin = %descriptor.prefix,
            executable = %executable.display(),
            user = %init.user_id,
            "plugin process launched"
        );

        let hub = init.user_hub.clone();
        let tag = format!("plugin.{}.{}", init.user_id, descriptor.prefix);
        let queue = init.config.message_queue_size();
        let user_id = init.user_id;
        let user_metadata = init.user_metadata;

        Ok(process::spawn(
            SpawnOpts::new(tag).queue(queue),
            monitor,
            move |mut ctx| async move {
                let hello = json!({
                    "topic": "init",
                    "payload": { "user_id": user_id, "user_metadata": user_metadata },
                });
                write_line(&mut stdin, &hello)
                    .await
                    .map_err(|error| ProcessError::new(format!("plugin init write failed: {error}")))?;

                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        Some(envelope) = ctx.mailbox.messages.recv() => {
                            if let Err(error) = write_line(&mut stdin, &envelope_line(&envelope)).await {
                                return Err(ProcessError::new(format!("plugin stdin closed: {error}")));
                            }
                        }
                        Some(event) = ctx.mailbox.system.recv() => {
                            if let SystemEvent::Cancel { grace } = event {
                                let _ = write_line(&mut stdin, &json!({ "topic": "shutdown" })).await;
                                return match tokio::time::timeout(grace, child.wait()).await {
                                    Ok(Ok(status)) if status.success() => Ok(Value::Null),
                                    Ok(Ok(status)) => {
                                        Err(ProcessError::new(format!("plugin exited with {status}")))
                                    }
                                    Ok(Err(error)) => {
                                        Err(ProcessError::new(format!("plugin wait failed: {error}")))
                                    }
                                    Err(_) => {
                                        let _ = child.kill().await;
                                        Err(ProcessError::new("plugin ignored shutdown"))
                                    }
                                };
                            }
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) if !line.trim().is_empty() => {
                                match serde_json::from_str::<PluginLine>(&line) {
                                    Ok(output) => {
                                        hub.send(
                                            Envelope::new(output.topic, Body::Json(output.payload))
                                                .with_sender(ctx.pid.clone()),
                                        );
                                    }
                                    Err(error) => {
                                        warn!(process = %ctx.pid, error = %error, "undecodable plugin line");
                                    }
                                }
                            }
                            Ok(Some(_)) => {}
                            Ok(None) | Err(_) => {
                                // stdout closed: the child is gone.
                                let status = child.wait().await.map_err(|error| {
                                    ProcessError::new(format!("plugin wait failed: {error}"))
                                })?;
                                return if status.success() {
                                    Ok(Value::Null)
                                } else {
                                    Err(ProcessError::new(format!("plugin exited with {status}")))
                                };
                            }
                        }
                    }
                }
            },
        ))
    }
}

fn envelope_line(envelope: &Envelope) -> Value {
    let payload = match &envelope.body {
        Body::Empty => Value::Null,
        Body::Json(value) => value.clone(),
        Body::Raw(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        Body::Delivery(delivery) => serde_json::to_value(delivery).unwrap_or(Value::Null),
        // Transport-facing bodies never reach a plugin.
        Body::Peer(_) | Body::Control(_) => Value::Null,
    };
    json!({ "topic": envelope.topic, "payload": payload })
}

async fn write_line(stdin: &mut ChildStdin, value: &Value) -> std::io::Result<()> {
    stdin.write_all(value.to_string().as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::HubConfig;
    use serde_json::json;

    fn descriptor(process_id: &str) -> PluginDescriptor {
        PluginDescriptor {
            prefix: "ops_".to_string(),
            process_id: process_id.to_string(),
            host: "local".to_string(),
            auto_start: false,
        }
    }

    fn init(hub: relay_core::Pid) -> PluginInit {
        PluginInit {
            user_id: "u1".to_string(),
            user_metadata: json!({}),
            user_hub: hub,
            config: HubConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_unknown_process_id() {
        let host = StdioPluginHost::new("/nonexistent-bin-dir");
        let (hub, _hub_rx) = process::endpoint("hub", 16);
        let (monitor, _events) = process::system_channel();

        let result = host.spawn(&descriptor("no-such-plugin"), init(hub), &monitor);
        assert!(matches!(result, Err(SpawnError::UnknownProcess(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bridge_forwards_plugin_lines() {
        use tokio::time::{timeout, Duration};

        // `cat` echoes the init line straight back, which the bridge
        // forwards to the hub as a topic message.
        let host = StdioPluginHost::new("/bin");
        let (hub, mut hub_rx) = process::endpoint("hub", 16);
        let (monitor, mut events) = process::system_channel();

        let child = host
            .spawn(&descriptor("cat"), init(hub), &monitor)
            .expect("cat should spawn");

        let envelope = timeout(Duration::from_secs(5), hub_rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert_eq!(envelope.topic, "init");
        match envelope.body {
            Body::Json(payload) => assert_eq!(payload["user_id"], json!("u1")),
            body => panic!("expected json body, got {body:?}"),
        }

        // `cat` ignores the shutdown line; the grace watchdog kills it.
        child.cancel(Duration::from_millis(200));
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("closed");
        assert!(matches!(event, SystemEvent::Exit { .. }));
    }
}

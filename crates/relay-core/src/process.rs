//! Process primitives: pids, mailboxes, links, and graceful cancel.
//!
//! Every hub and plugin runs as an independent tokio task that owns a
//! [`Mailbox`]. A mailbox multiplexes two sources: a bounded inbox of
//! topic-tagged [`Envelope`]s and an unbounded system-event stream
//! (exit notifications from linked children, cancellation requests).
//! Handler bodies execute sequentially per process, so process state
//! needs no locking.
//!
//! Sends are non-blocking and fire-and-forget: a full inbox drops the
//! envelope (and counts the drop), a dead inbox discards it silently.
//! Delivery order is FIFO per sender; nothing is promised across
//! senders.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::metrics;
use crate::plugin::PluginTable;

/// Default inbox depth for processes spawned without an explicit one.
const DEFAULT_QUEUE: usize = 64;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Error a process body may exit with; the text rides in the exit
/// event as the crash reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessError(String);

impl ProcessError {
    /// Create a process error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Why a process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The body returned `Ok`.
    Normal,
    /// The body returned `Err`.
    Error(String),
    /// The link broke without an orderly exit (panic or forced kill).
    LinkDown,
}

impl ExitReason {
    /// Whether this termination counts as a crash.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        !matches!(self, ExitReason::Normal)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Error(reason) => write!(f, "error: {reason}"),
            ExitReason::LinkDown => f.write_str("link down"),
        }
    }
}

/// Events delivered on a process's system stream.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// A linked process terminated.
    Exit { pid: Pid, reason: ExitReason },
    /// Graceful cancellation with a grace period.
    Cancel { grace: Duration },
}

/// Handle of a process inbox.
///
/// Cheap to clone; equality and hashing use the unique id only.
#[derive(Clone)]
pub struct Pid {
    id: u64,
    tag: Arc<str>,
    inbox: mpsc::Sender<Envelope>,
}

impl Pid {
    /// Runtime-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable label (`central`, `user.u1`, ...).
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Deliver an envelope, never blocking.
    ///
    /// Returns `false` when the inbox is full (the envelope is dropped
    /// and counted) or the process is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.inbox.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                metrics::record_dropped_envelope();
                warn!(process = %self, topic = %envelope.topic, "inbox full, dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(process = %self, "send to dead process");
                false
            }
        }
    }

    /// Whether the inbox still accepts mail.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }
}

impl PartialEq for Pid {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Pid {}

impl std::hash::Hash for Pid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({}#{})", self.tag, self.id)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tag, self.id)
    }
}

impl Serialize for Pid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A topic-tagged message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub body: Body,
    /// Originating process, when the receiver needs to know it
    /// (`ws.message` carries the client endpoint here).
    pub sender: Option<Pid>,
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub fn new(topic: impl Into<String>, body: Body) -> Self {
        Self {
            topic: topic.into(),
            body,
            sender: None,
        }
    }

    /// Envelope with a serialized JSON body.
    #[must_use]
    pub fn json<T: Serialize>(topic: impl Into<String>, payload: &T) -> Self {
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::new(topic, Body::Json(value))
    }

    /// Envelope with no payload (`resume`, `shutdown`, `ws.cancel`).
    #[must_use]
    pub fn empty(topic: impl Into<String>) -> Self {
        Self::new(topic, Body::Empty)
    }

    /// Attach the originating process.
    #[must_use]
    pub fn with_sender(mut self, sender: Pid) -> Self {
        self.sender = Some(sender);
        self
    }
}

/// Body of a topic message.
#[derive(Debug, Clone)]
pub enum Body {
    /// No payload.
    Empty,
    /// Structured payload (replies, broadcasts, activity reports).
    Json(Value),
    /// Undecoded client-frame bytes (`ws.message`).
    Raw(Bytes),
    /// Connection attach/detach (`ws.join` / `ws.leave`).
    Peer(PeerInfo),
    /// Rebind instruction for the transport (`ws.control`).
    Control(Rebind),
    /// Routed client command handed to a plugin.
    Delivery(Delivery),
}

/// `ws.join` / `ws.leave` payload.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Transport endpoint of the connection.
    pub client: Pid,
    /// Connection metadata (`user_id`, optional `user_metadata`).
    pub metadata: Value,
}

/// `ws.control` payload instructing the transport to retarget a
/// connection's frames at a User Hub.
#[derive(Debug, Clone)]
pub struct Rebind {
    pub target: Pid,
    pub metadata: Value,
    pub plugins: Arc<PluginTable>,
}

/// A routed client command, stripped of its plugin prefix.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    /// Transport endpoint the command arrived on.
    pub conn_pid: Pid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The full, unstripped command name.
    #[serde(rename = "type")]
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// The two receive sides owned by a process.
#[derive(Debug)]
pub struct Mailbox {
    /// Topic-tagged envelopes, FIFO per sender.
    pub messages: mpsc::Receiver<Envelope>,
    /// Exit and cancel events.
    pub system: mpsc::UnboundedReceiver<SystemEvent>,
}

/// Everything a process body runs with: its own pid, its mailbox, and
/// the system sender its children link against.
#[derive(Debug)]
pub struct Context {
    pub pid: Pid,
    pub mailbox: Mailbox,
    system: SystemSender,
}

impl Context {
    /// System sender to link children against.
    #[must_use]
    pub fn monitor(&self) -> &SystemSender {
        &self.system
    }
}

/// Sending side of a process's system stream.
#[derive(Debug, Clone)]
pub struct SystemSender {
    tx: mpsc::UnboundedSender<SystemEvent>,
}

impl SystemSender {
    fn notify(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }
}

/// Stand-alone system stream for the runtime root (and tests).
#[must_use]
pub fn system_channel() -> (SystemSender, mpsc::UnboundedReceiver<SystemEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SystemSender { tx }, rx)
}

/// Spawn options.
#[derive(Debug, Clone)]
pub struct SpawnOpts {
    tag: String,
    queue: usize,
}

impl SpawnOpts {
    /// Options with the default inbox depth.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            queue: DEFAULT_QUEUE,
        }
    }

    /// Override the inbox depth.
    #[must_use]
    pub fn queue(mut self, queue: usize) -> Self {
        self.queue = queue.max(1);
        self
    }
}

/// Parent-side handle of a linked process.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
    ctl: SystemSender,
    abort: AbortHandle,
    done: Arc<AtomicBool>,
    monitor: SystemSender,
}

impl Child {
    /// Pid of the linked process.
    #[must_use]
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Whether the process has already exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Ask the process to shut down; kill it if `grace` elapses first.
    ///
    /// A process that exits naturally inside the grace window may race
    /// the watchdog into a duplicate exit event; exit handlers match
    /// pids and ignore events for processes they no longer track.
    pub fn cancel(&self, grace: Duration) {
        self.ctl.notify(SystemEvent::Cancel { grace });

        let abort = self.abort.clone();
        let done = self.done.clone();
        let monitor = self.monitor.clone();
        let pid = self.pid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !done.load(Ordering::Acquire) {
                warn!(process = %pid, grace = ?grace, "grace elapsed, killing process");
                abort.abort();
                monitor.notify(SystemEvent::Exit {
                    pid,
                    reason: ExitReason::LinkDown,
                });
            }
        });
    }

    /// Kill immediately, without grace.
    pub fn kill(&self) {
        if !self.done.load(Ordering::Acquire) {
            self.abort.abort();
            self.monitor.notify(SystemEvent::Exit {
                pid: self.pid.clone(),
                reason: ExitReason::LinkDown,
            });
        }
    }
}

/// Spawn a process linked to `monitor`.
///
/// The monitor receives exactly one `Exit` event when the body
/// resolves: `Normal` on `Ok`, `Error` on `Err`, `LinkDown` on panic
/// (or later, on a forced kill).
pub fn spawn<F, Fut>(opts: SpawnOpts, monitor: &SystemSender, body: F) -> Child
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
{
    let (inbox_tx, inbox_rx) = mpsc::channel(opts.queue);
    let (sys_tx, sys_rx) = mpsc::unbounded_channel();

    let pid = Pid {
        id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        tag: opts.tag.into(),
        inbox: inbox_tx,
    };
    let ctl = SystemSender { tx: sys_tx };
    let done = Arc::new(AtomicBool::new(false));

    let ctx = Context {
        pid: pid.clone(),
        mailbox: Mailbox {
            messages: inbox_rx,
            system: sys_rx,
        },
        system: ctl.clone(),
    };
    let fut = body(ctx);

    let handle = {
        let monitor = monitor.clone();
        let pid = pid.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let reason = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(result)) => {
                    debug!(process = %pid, result = %result, "process exited");
                    ExitReason::Normal
                }
                Ok(Err(error)) => ExitReason::Error(error.to_string()),
                Err(_) => ExitReason::LinkDown,
            };
            monitor.notify(SystemEvent::Exit { pid, reason });
            done.store(true, Ordering::Release);
        })
    };

    Child {
        pid,
        ctl,
        abort: handle.abort_handle(),
        done,
        monitor: monitor.clone(),
    }
}

/// A bare inbox with no process behind it.
///
/// Transport-side client handles are endpoints: hubs address them by
/// `Pid`, the transport drains the receiver.
#[must_use]
pub fn endpoint(tag: impl Into<String>, queue: usize) -> (Pid, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let pid = Pid {
        id: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        tag: tag.into().into(),
        inbox: tx,
    };
    (pid, rx)
}

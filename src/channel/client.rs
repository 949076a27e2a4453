//! Channel Client with Automatic Reconnection
//!
//! Single responsibility: Own the socket and drive the state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    ChannelClient                        │
//! │  - connect() / disconnect() / reconnect()               │
//! │  - send(): registers a pending request, then writes     │
//! │  - status snapshots via a watch channel                 │
//! └────────────────────────────────────────────────────────┘
//!                 │ requests             │ outbound frames
//!                 ▼                      ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                   connection task                       │
//! │  - exclusively owns the socket and the reconnect timer  │
//! │  - feeds socket events to ConnectionMachine             │
//! │  - routes inbound frames through Router                 │
//! │  - runs inbound commands on spawned executor tasks      │
//! └────────────────────────────────────────────────────────┘
//!               │              │              │
//!               ▼              ▼              ▼
//!          Transport    ConnectionMachine   Router ──► PendingTable
//!                                                 └──► ProgressSink
//! ```
//!
//! Frames from one socket are handled one at a time, in order. Sending never
//! waits on the network: a caller suspends only on the response.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::pending::{PendingTable, DEFAULT_REQUEST_TIMEOUT};
use super::protocol::{
    encode_command, encode_error, encode_join, encode_progress, encode_response,
    generate_channel_name, generate_request_id, InboundCommand, JoinAck, ABNORMAL_CLOSURE,
    JOIN_REJECTED, NORMAL_CLOSURE,
};
use super::router::{Routed, Router};
use super::state::{
    CloseOutcome, ConnectDecision, ConnectionMachine, ConnectionStatus,
    DEFAULT_MAX_RECONNECT_ATTEMPTS,
};
use super::transport::{SocketEvent, Transport};
use crate::delegate::{CommandContext, CommandExecutor, ProgressReporter};
use crate::error::{ChannelError, Result};
use crate::progress::{ProgressEvent, ProgressSink};

/// Default relay server
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3055";

/// Configuration for the channel client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server WebSocket URL
    pub server_url: String,
    /// Channel to join (None = random)
    pub channel: Option<String>,
    /// Reconnect after abnormal closes
    pub auto_reconnect: bool,
    /// Consecutive reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Timeout for individual requests
    pub request_timeout: Duration,
    /// How long to wait for a join acknowledgement
    pub join_timeout: Duration,
    /// Delay between reconnect attempts
    pub backoff: BackoffPolicy,
    /// Re-broadcast progress received from an inner hop
    pub relay_progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            channel: None,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            join_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            relay_progress: true,
        }
    }
}

/// Everything an observer may want to know about the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub auto_reconnect: bool,
    /// Most recent transport or join error
    pub last_error: Option<String>,
}

enum Request {
    Connect {
        server_url: Option<String>,
        channel: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<String>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetAutoReconnect(bool),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A frame for the wire. `request_id` is set for frames that have a pending
/// request waiting on them.
struct Outbound {
    request_id: Option<String>,
    frame: String,
}

/// Delivers progress locally and forwards it to the counterparty.
struct WireProgressSink {
    local: Arc<dyn ProgressSink>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
}

impl ProgressSink for WireProgressSink {
    fn deliver(&self, event: ProgressEvent) {
        let channel = self
            .snapshot_rx
            .borrow()
            .status
            .channel()
            .map(str::to_string);
        if let Some(channel) = channel {
            match encode_progress(&channel, &event) {
                Ok(frame) => {
                    let _ = self.outbound_tx.send(Outbound {
                        request_id: None,
                        frame,
                    });
                }
                Err(e) => warn!(error = %e, "Failed to encode progress"),
            }
        } else {
            debug!(command_id = %event.command_id, "Not connected, progress kept local");
        }
        self.local.deliver(event);
    }
}

/// Builder for [`ChannelClient`].
pub struct ChannelClientBuilder {
    config: ClientConfig,
    progress: Arc<dyn ProgressSink>,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl ChannelClientBuilder {
    /// Where progress events end up (default: dropped)
    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Who executes inbound commands (default: nobody; they are answered with an error)
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Start the connection task. Does not connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> ChannelClient {
        let machine = ConnectionMachine::new(
            self.config.auto_reconnect,
            self.config.max_reconnect_attempts,
            self.config.backoff,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&machine, None));
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending = PendingTable::new();

        let wire_progress: Arc<dyn ProgressSink> = Arc::new(WireProgressSink {
            local: Arc::clone(&self.progress),
            outbound_tx: outbound_tx.clone(),
            snapshot_rx: snapshot_rx.clone(),
        });

        let task = ConnectionTask {
            router: Router::new(
                pending.clone(),
                Arc::clone(&self.progress),
                self.config.relay_progress,
            ),
            config: self.config.clone(),
            machine,
            pending: pending.clone(),
            executor: self.executor,
            wire_progress: Arc::clone(&wire_progress),
            outbound_tx: outbound_tx.clone(),
            snapshot_tx,
            socket: None,
            opening: None,
            reconnect_timer: None,
            join_deadline: None,
            connect_waiters: Vec::new(),
            last_error: None,
        };
        let handle = tokio::spawn(task.run(request_rx, outbound_rx));

        info!(server_url = %self.config.server_url, "Channel client started");

        ChannelClient {
            config: self.config,
            request_tx,
            outbound_tx,
            snapshot_rx,
            pending,
            wire_progress,
            task: Mutex::new(Some(handle)),
        }
    }
}

/// Handle to a reconnecting command channel.
///
/// # Guarantees
///
/// - `send()` fails fast with `NotConnected` unless a channel is joined
/// - every request settles exactly once (response, error, timeout, or
///   connection-wide rejection)
/// - an intentional `disconnect()` never triggers a reconnect
///
/// # Non-Guarantees
///
/// - Connections can drop between calls
/// - Reconnection can fail
pub struct ChannelClient {
    config: ClientConfig,
    request_tx: mpsc::UnboundedSender<Request>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    pending: PendingTable,
    wire_progress: Arc<dyn ProgressSink>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelClient {
    pub fn builder(config: ClientConfig) -> ChannelClientBuilder {
        ChannelClientBuilder {
            config,
            progress: Arc::new(|_event: ProgressEvent| {}),
            executor: None,
        }
    }

    /// Connect to the configured server and join a channel.
    ///
    /// Resolves with the joined channel once the server acknowledges the
    /// join, or with the error of the first failed attempt (automatic
    /// reconnection may still continue in the background).
    pub async fn connect(&self) -> Result<String> {
        self.connect_request(None, None).await
    }

    /// Connect to `server_url` instead of the configured server.
    pub async fn connect_to(&self, server_url: impl Into<String>) -> Result<String> {
        self.connect_request(Some(server_url.into()), None).await
    }

    /// Connect and join `channel`.
    ///
    /// # Errors
    /// `AlreadyJoined` if connected to a different channel.
    pub async fn connect_with_channel(&self, channel: impl Into<String>) -> Result<String> {
        self.connect_request(None, Some(channel.into())).await
    }

    async fn connect_request(
        &self,
        server_url: Option<String>,
        channel: Option<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect {
            server_url,
            channel,
            reply,
        })?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Reconnect now, with a zeroed attempt counter.
    ///
    /// This is how a `failed` connection is resumed.
    pub async fn reconnect(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Reconnect { reply })?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Intentionally close the connection. Pending requests are rejected.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect { reply })?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Turn automatic reconnection on or off.
    ///
    /// Turning it off cancels a scheduled reconnect and zeroes the attempt counter.
    pub fn set_auto_reconnect(&self, enabled: bool) -> Result<()> {
        self.request(Request::SetAutoReconnect(enabled))
    }

    /// Send `command` and wait for its result.
    ///
    /// # Errors
    /// - `NotConnected` if no channel is joined (nothing is sent)
    /// - `Timeout` if no response arrives within the request timeout
    /// - `Remote` if the counterparty reported a failure
    /// - `Transport` / `ReconnectExhausted` / `Disconnected` if the connection went away
    /// - `Closed` after [`ChannelClient::close`]
    pub async fn send(&self, command: &str, params: Value) -> Result<Value> {
        self.send_with_id(generate_request_id(), command, params).await
    }

    /// Like [`ChannelClient::send`], with a caller-chosen request id.
    pub async fn send_with_id(
        &self,
        id: impl Into<String>,
        command: &str,
        params: Value,
    ) -> Result<Value> {
        let id = id.into();
        if self.request_tx.is_closed() {
            return Err(ChannelError::Closed);
        }
        let channel = self.channel().ok_or(ChannelError::NotConnected)?;
        let frame = encode_command(&id, &channel, command, &params)?;

        let response = self.pending.register(id.clone(), self.config.request_timeout);
        debug!(id = %id, command = %command, "Sending command");

        let outbound = Outbound {
            request_id: Some(id.clone()),
            frame,
        };
        if self.outbound_tx.send(outbound).is_err() {
            self.pending.reject(&id, ChannelError::Closed);
        }
        response.wait().await
    }

    /// Deliver a progress event locally and, if connected, to the counterparty.
    pub fn emit_progress(&self, event: ProgressEvent) {
        self.wire_progress.deliver(event);
    }

    /// A reporter for progress about `command_id`.
    pub fn progress_reporter(
        &self,
        command_id: impl Into<String>,
        command_type: impl Into<String>,
    ) -> ProgressReporter {
        ProgressReporter::new(command_id, command_type, Arc::clone(&self.wire_progress))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot_rx.borrow().status.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Observe every connection state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// The joined channel, if connected.
    pub fn channel(&self) -> Option<String> {
        self.snapshot_rx
            .borrow()
            .status
            .channel()
            .map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().status.is_connected()
    }

    /// Number of requests waiting for an outcome
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Disconnect and stop the connection task.
    ///
    /// Every later call on this client fails with `Closed`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Request::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn request(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .map_err(|_| ChannelError::Closed)
    }
}

fn snapshot_of(machine: &ConnectionMachine, last_error: Option<String>) -> ConnectionSnapshot {
    ConnectionSnapshot {
        status: machine.status().clone(),
        reconnect_attempts: machine.reconnect_attempts(),
        auto_reconnect: machine.auto_reconnect(),
        last_error,
    }
}

/// The connection task. Runs until the client shuts it down or is dropped.
struct ConnectionTask {
    config: ClientConfig,
    machine: ConnectionMachine,
    router: Router,
    pending: PendingTable,
    executor: Option<Arc<dyn CommandExecutor>>,
    wire_progress: Arc<dyn ProgressSink>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    socket: Option<Transport>,
    opening: Option<BoxFuture<'static, Result<Transport>>>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    join_deadline: Option<Pin<Box<Sleep>>>,
    connect_waiters: Vec<oneshot::Sender<Result<String>>>,
    last_error: Option<String>,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut request_rx: mpsc::UnboundedReceiver<Request>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        debug!("Connection task started");

        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        // Every client handle is gone
                        self.shutdown().await;
                        break;
                    }
                },
                Some(outbound) = outbound_rx.recv() => self.write(outbound).await,
                opened = poll_opening(&mut self.opening) => self.on_opened(opened).await,
                event = next_event(&mut self.socket) => self.on_socket_event(event).await,
                _ = fire(&mut self.reconnect_timer) => self.on_reconnect_timer(),
                _ = fire(&mut self.join_deadline) => self.on_join_timeout().await,
            }
            self.publish();
        }

        self.publish();
        debug!("Connection task ended");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect {
                server_url,
                channel,
                reply,
            } => {
                let attempt_in_flight = *self.machine.status() == ConnectionStatus::Connecting
                    && (self.opening.is_some() || self.socket.is_some());
                if attempt_in_flight && channel.is_none() && server_url.is_none() {
                    self.connect_waiters.push(reply);
                    return;
                }
                match self.machine.request_connect(channel) {
                    Ok(ConnectDecision::AlreadyConnected(channel)) => {
                        let _ = reply.send(Ok(channel));
                    }
                    Ok(ConnectDecision::Open) => {
                        if let Some(url) = server_url {
                            self.config.server_url = url;
                        }
                        self.connect_waiters.push(reply);
                        self.open_socket();
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::Reconnect { reply } => {
                self.machine.request_reconnect();
                self.connect_waiters.push(reply);
                self.open_socket();
            }
            Request::Disconnect { reply } => {
                self.teardown(ChannelError::Disconnected).await;
                self.publish();
                let _ = reply.send(());
            }
            Request::SetAutoReconnect(enabled) => {
                if self.machine.set_auto_reconnect(enabled) {
                    self.reconnect_timer = None;
                    info!("Auto-reconnect disabled, scheduled reconnect cancelled");
                    self.fail_waiters(|| ChannelError::Disconnected);
                }
            }
            Request::Shutdown { .. } => {}
        }
    }

    /// Drop any existing socket and start opening a new one.
    fn open_socket(&mut self) {
        self.reconnect_timer = None;
        self.join_deadline = None;
        if let Some(old) = self.socket.take() {
            debug!("Replacing existing socket");
            tokio::spawn(old.close(NORMAL_CLOSURE, "replaced"));
            self.pending
                .reject_all(|| ChannelError::Transport("connection replaced".into()));
        }
        info!(server_url = %self.config.server_url, "Opening connection");
        self.opening = Some(Transport::connect(self.config.server_url.clone()).boxed());
    }

    async fn on_opened(&mut self, opened: Result<Transport>) {
        self.opening = None;
        let mut transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.last_error = Some(e.to_string());
                self.on_closed(ABNORMAL_CLOSURE, failure_detail(e));
                return;
            }
        };

        let channel = match self.machine.socket_opened(generate_channel_name()) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "Discarding socket opened while joined");
                tokio::spawn(transport.close(NORMAL_CLOSURE, "duplicate"));
                return;
            }
        };

        let sent = match encode_join(&channel) {
            Ok(join) => transport.send_text(join).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, channel = %channel, "Failed to send join");
            self.last_error = Some(e.to_string());
            self.on_closed(ABNORMAL_CLOSURE, failure_detail(e));
            return;
        }

        debug!(channel = %channel, "Join sent, awaiting acknowledgement");
        self.socket = Some(transport);
        self.join_deadline = Some(Box::pin(tokio::time::sleep(self.config.join_timeout)));
    }

    async fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Text(text) => {
                let channel = self.machine.status().channel().map(str::to_string);
                match self.router.route(&text, channel.as_deref()) {
                    Routed::JoinAck(ack) => self.on_join_ack(ack).await,
                    Routed::Dispatch(command) => self.dispatch(command, channel),
                    Routed::Relay(frame) => {
                        self.write(Outbound {
                            request_id: None,
                            frame,
                        })
                        .await
                    }
                    Routed::Settled { .. } | Routed::Delivered | Routed::Dropped => {}
                }
            }
            SocketEvent::Error(e) => {
                // The close event that follows drives reconnection
                warn!(error = %e, "WebSocket error");
                self.last_error = Some(e);
            }
            SocketEvent::Closed { code, reason } => {
                info!(code = code, reason = %reason, "Connection closed");
                self.socket = None;
                self.on_closed(code, reason);
            }
        }
    }

    async fn on_join_ack(&mut self, ack: JoinAck) {
        match self.machine.join_acknowledged(&ack) {
            Ok(channel) => {
                self.join_deadline = None;
                self.last_error = None;
                // Observers see `connected` before any waiter resumes
                self.publish();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(channel.clone()));
                }
            }
            Err(ChannelError::AlreadyJoined { channel }) => {
                warn!(channel = %channel, "Ignoring join acknowledgement while joined");
            }
            Err(e) => {
                self.join_deadline = None;
                let reason = match e {
                    ChannelError::JoinRejected(reason) => reason,
                    other => other.to_string(),
                };
                self.abandon_join(reason).await;
            }
        }
    }

    async fn on_join_timeout(&mut self) {
        self.join_deadline = None;
        if self.machine.status().is_connected() || self.socket.is_none() {
            return;
        }
        warn!(timeout_ms = self.config.join_timeout.as_millis() as u64, "Join timed out");
        self.abandon_join("join acknowledgement timed out".to_string()).await;
    }

    /// Close a socket whose join failed and hand it to close handling.
    async fn abandon_join(&mut self, reason: String) {
        self.last_error = Some(format!("join rejected: {}", reason));
        self.fail_waiters(|| ChannelError::JoinRejected(reason.clone()));
        if let Some(socket) = self.socket.take() {
            socket.close(JOIN_REJECTED, "join failed").await;
        }
        self.on_closed(JOIN_REJECTED, reason);
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        self.join_deadline = None;
        let closed = || {
            ChannelError::Transport(format!("connection closed (code {}): {}", code, reason))
        };
        let rejected = self.pending.reject_all(closed);
        if rejected > 0 {
            warn!(rejected = rejected, "Rejected pending requests on close");
        }

        match self.machine.socket_closed(code) {
            CloseOutcome::Idle => self.fail_waiters(closed),
            CloseOutcome::Reconnect { attempt, delay } => {
                debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Reconnect armed");
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
                self.fail_waiters(closed);
            }
            CloseOutcome::Exhausted { attempts } => {
                error!(attempts = attempts, "Giving up on reconnection");
                self.reconnect_timer = None;
                self.last_error = Some(ChannelError::ReconnectExhausted { attempts }.to_string());
                self.fail_waiters(|| ChannelError::ReconnectExhausted { attempts });
            }
        }
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_timer = None;
        if self.machine.reconnect_due() {
            self.open_socket();
        }
    }

    /// Intentional close: cancel the timer, close normally, reject everything.
    async fn teardown(&mut self, error: ChannelError) {
        self.reconnect_timer = None;
        self.join_deadline = None;
        self.opening = None;
        if let Some(socket) = self.socket.take() {
            socket.close(NORMAL_CLOSURE, "client disconnect").await;
        }
        self.machine.disconnect();

        let closed = matches!(error, ChannelError::Closed);
        let remake = move || {
            if closed {
                ChannelError::Closed
            } else {
                ChannelError::Disconnected
            }
        };
        let rejected = self.pending.reject_all(remake);
        self.fail_waiters(remake);
        debug!(rejected = rejected, reason = %error, "Connection torn down");
    }

    async fn shutdown(&mut self) {
        self.teardown(ChannelError::Closed).await;
    }

    async fn write(&mut self, outbound: Outbound) {
        let Outbound { request_id, frame } = outbound;
        let joined = self.machine.status().is_connected();
        match self.socket.as_mut() {
            Some(socket) if joined => {
                if let Err(e) = socket.send_text(frame).await {
                    warn!(error = %e, "Failed to write frame");
                    self.last_error = Some(e.to_string());
                    if let Some(id) = request_id {
                        self.pending.reject(&id, e);
                    }
                }
            }
            _ => match request_id {
                Some(id) => {
                    self.pending.reject(&id, ChannelError::NotConnected);
                }
                None => debug!("Dropping outbound frame while not connected"),
            },
        }
    }

    /// Run an inbound command on its own task and relay the outcome.
    fn dispatch(&self, command: InboundCommand, channel: Option<String>) {
        let Some(channel) = channel else {
            warn!(id = %command.id, "Ignoring command received outside a channel");
            return;
        };
        let InboundCommand {
            id,
            command,
            params,
        } = command;
        let executor = self.executor.clone();
        let outbound_tx = self.outbound_tx.clone();
        let ctx = CommandContext {
            id: id.clone(),
            command: command.clone(),
            progress: ProgressReporter::new(&id, &command, Arc::clone(&self.wire_progress)),
        };

        tokio::spawn(async move {
            let outcome = match executor {
                Some(executor) => AssertUnwindSafe(executor.execute(ctx, params))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_message(panic))),
                None => Err(format!("No executor registered for command: {}", command)),
            };
            if let Err(e) = &outcome {
                warn!(id = %id, command = %command, error = %e, "Command failed");
            } else {
                debug!(id = %id, command = %command, "Command completed");
            }

            let frame = encode_response(&id, &channel, &outcome)
                .or_else(|e| encode_error(&id, &e.to_string()));
            match frame {
                Ok(frame) => {
                    let _ = outbound_tx.send(Outbound {
                        request_id: None,
                        frame,
                    });
                }
                Err(e) => error!(id = %id, error = %e, "Failed to encode command outcome"),
            }
        });
    }

    fn fail_waiters(&mut self, make_error: impl Fn() -> ChannelError) {
        self.publish();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(make_error()));
        }
    }

    fn publish(&self) {
        let snapshot = snapshot_of(&self.machine, self.last_error.clone());
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// The message of a transport failure, without the variant prefix.
fn failure_detail(error: ChannelError) -> String {
    match error {
        ChannelError::Transport(detail) => detail,
        other => other.to_string(),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Command panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Command panicked: {}", s)
    } else {
        "Command panicked".to_string()
    }
}

async fn poll_opening(opening: &mut Option<BoxFuture<'static, Result<Transport>>>) -> Result<Transport> {
    match opening {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_event(socket: &mut Option<Transport>) -> SocketEvent {
    match socket {
        Some(socket) => socket.next_event().await,
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

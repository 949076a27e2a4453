//! Channel client integration tests against an in-process relay

use futures_util::{SinkExt, StreamExt};
use plugin_bridge::channel::{BackoffPolicy, ConnectionSnapshot, ConnectionStatus};
use plugin_bridge::{
    ChannelClient, ChannelError, ClientConfig, CommandContext, CommandRegistry, ProgressEvent,
    ProgressHub, ProgressHubConfig, ProgressStatus,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Mock relay
// ============================================================================

enum Control {
    Frame(String),
    /// Drop the TCP connection without a close handshake
    Drop,
}

/// Accepts joins (or rejects them), records every frame clients send, and
/// lets the test push frames to the most recent connection.
struct MockRelay {
    url: String,
    frames: mpsc::UnboundedReceiver<Value>,
    control: Arc<Mutex<Option<mpsc::UnboundedSender<Control>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockRelay {
    async fn start(accept_joins: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let control = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));

        let control_slot = Arc::clone(&control);
        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                *control_slot.lock().unwrap() = Some(control_tx);
                tokio::spawn(serve(ws, accept_joins, frames_tx.clone(), control_rx));
            }
        });

        Self {
            url,
            frames,
            control,
            connections,
        }
    }

    fn push(&self, frame: Value) {
        self.send_control(Control::Frame(frame.to_string()));
    }

    fn drop_connection(&self) {
        self.send_control(Control::Drop);
    }

    fn send_control(&self, control: Control) {
        let slot = self.control.lock().unwrap();
        let sent = slot.as_ref().unwrap().send(control);
        assert!(sent.is_ok(), "relay connection is gone");
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next frame a client sent with the given `type`.
    async fn next_of_type(&mut self, kind: &str) -> Value {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.frames.recv().await.unwrap();
                if frame["type"] == kind {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} frame within {:?}", kind, WAIT))
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    accept_joins: bool,
    frames_tx: mpsc::UnboundedSender<Value>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    if frame["type"] == "join" {
                        let channel = frame["channel"].as_str().unwrap_or_default().to_string();
                        let ack = if accept_joins {
                            json!({
                                "type": "system",
                                "channel": channel,
                                "message": { "result": format!("Connected to channel: {}", channel) }
                            })
                        } else {
                            json!({ "type": "system", "message": { "error": "channel full" } })
                        };
                        let _ = sink.send(Message::Text(ack.to_string())).await;
                    }
                    let _ = frames_tx.send(frame);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            control = control_rx.recv() => match control {
                Some(Control::Frame(text)) => {
                    let _ = sink.send(Message::Text(text)).await;
                }
                Some(Control::Drop) | None => break,
            },
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(relay_url: &str) -> ClientConfig {
    ClientConfig {
        server_url: relay_url.to_string(),
        request_timeout: Duration::from_secs(5),
        join_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy::new(Duration::from_millis(50), 1.0, Duration::from_millis(50)),
        ..Default::default()
    }
}

fn unreachable_url() -> String {
    // Reserve a port, then free it so connections are refused
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    format!("ws://{}", listener.local_addr().unwrap())
}

async fn explode(_ctx: CommandContext, _params: Value) -> Result<Value, String> {
    panic!("handler blew up")
}

async fn wait_for_status(client: &ChannelClient, matches: impl FnMut(&ConnectionSnapshot) -> bool) {
    let mut rx = client.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(matches))
        .await
        .expect("status not reached in time")
        .expect("connection task ended");
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_connect_joins_channel_and_round_trips() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();

    let channel = client.connect().await.unwrap();
    assert_eq!(channel.len(), 8);
    assert_eq!(client.channel().as_deref(), Some(channel.as_str()));

    let join = relay.next_of_type("join").await;
    assert_eq!(join["channel"], channel.as_str());

    let (result, ()) = tokio::join!(
        client.send_with_id("r1", "get_document_info", json!({"depth": 1})),
        async {
            let frame = relay.next_of_type("message").await;
            assert_eq!(frame["id"], "r1");
            assert_eq!(frame["channel"], channel.as_str());
            assert_eq!(frame["message"]["command"], "get_document_info");
            assert_eq!(frame["message"]["params"]["depth"], 1);
            relay.push(json!({
                "type": "message",
                "channel": channel,
                "message": { "id": "r1", "result": { "ok": true } }
            }));
        }
    );

    assert_eq!(result.unwrap(), json!({"ok": true}));
    assert_eq!(client.pending_requests(), 0);
    client.close().await;
}

#[tokio::test]
async fn test_remote_error_rejects_request() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    let channel = client.connect().await.unwrap();

    let (result, ()) = tokio::join!(client.send_with_id("r2", "get_node_info", json!({})), async {
        relay.next_of_type("message").await;
        relay.push(json!({
            "type": "message",
            "channel": channel,
            "message": { "id": "r2", "error": "Node not found" }
        }));
    });

    match result {
        Err(ChannelError::Remote(msg)) => assert_eq!(msg, "Node not found"),
        other => panic!("Expected Remote error, got {:?}", other),
    }
    // The connection is unaffected
    assert!(client.is_connected());
    client.close().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(ClientConfig {
        request_timeout: Duration::from_millis(200),
        ..config(&relay.url)
    })
    .spawn();
    client.connect().await.unwrap();

    let result = client.send("slow_command", json!({})).await;
    assert!(matches!(result, Err(ChannelError::Timeout { .. })));
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());
    client.close().await;
}

// ============================================================================
// Joining
// ============================================================================

#[tokio::test]
async fn test_join_rejection_never_connects() {
    let relay = MockRelay::start(false).await;
    let client = ChannelClient::builder(ClientConfig {
        auto_reconnect: false,
        ..config(&relay.url)
    })
    .spawn();

    let result = client.connect().await;
    match result {
        Err(ChannelError::JoinRejected(reason)) => assert!(reason.contains("channel full")),
        other => panic!("Expected JoinRejected, got {:?}", other),
    }
    assert!(!client.is_connected());
    assert!(matches!(
        client.send("noop", json!({})).await,
        Err(ChannelError::NotConnected)
    ));
    client.close().await;
}

#[tokio::test]
async fn test_explicit_channel_and_second_join() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();

    assert_eq!(client.connect_with_channel("team0001").await.unwrap(), "team0001");
    assert_eq!(relay.next_of_type("join").await["channel"], "team0001");

    match client.connect_with_channel("other000").await {
        Err(ChannelError::AlreadyJoined { channel }) => assert_eq!(channel, "team0001"),
        other => panic!("Expected AlreadyJoined, got {:?}", other),
    }
    // Connecting again without a channel is a no-op
    assert_eq!(client.connect().await.unwrap(), "team0001");
    assert_eq!(relay.connections(), 1);
    client.close().await;
}

// ============================================================================
// Inbound commands and progress
// ============================================================================

#[tokio::test]
async fn test_inbound_command_is_executed_and_answered() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url))
        .executor(Arc::new(CommandRegistry::with_builtins()))
        .spawn();
    let channel = client.connect().await.unwrap();

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c1", "command": "echo", "params": { "x": 1 } }
    }));
    let response = relay.next_of_type("message").await;
    assert_eq!(response["channel"], channel.as_str());
    assert_eq!(response["message"]["id"], "c1");
    assert_eq!(response["message"]["result"], json!({"x": 1}));

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c2", "command": "create_rectangle", "params": {} }
    }));
    let response = relay.next_of_type("message").await;
    assert_eq!(response["message"]["id"], "c2");
    assert_eq!(response["message"]["error"], "Unknown command: create_rectangle");
    client.close().await;
}

#[tokio::test]
async fn test_panicking_command_is_answered_and_channel_survives() {
    let mut relay = MockRelay::start(true).await;
    let registry = CommandRegistry::with_builtins().register("explode", explode);
    let client = ChannelClient::builder(config(&relay.url))
        .executor(Arc::new(registry))
        .spawn();
    let channel = client.connect().await.unwrap();

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c1", "command": "explode", "params": {} }
    }));
    let response = relay.next_of_type("message").await;
    assert_eq!(response["message"]["id"], "c1");
    let error = response["message"]["error"].as_str().unwrap();
    assert!(error.contains("Command panicked"), "got {}", error);
    assert!(error.contains("handler blew up"), "got {}", error);
    assert!(client.is_connected());

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c2", "command": "echo", "params": { "still": "here" } }
    }));
    let response = relay.next_of_type("message").await;
    assert_eq!(response["message"]["id"], "c2");
    assert_eq!(response["message"]["result"], json!({"still": "here"}));
    assert!(client.is_connected());
    assert_eq!(relay.connections(), 1);
    client.close().await;
}

#[tokio::test]
async fn test_command_without_executor_is_answered_with_error() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    let channel = client.connect().await.unwrap();

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c1", "command": "echo", "params": {} }
    }));
    let response = relay.next_of_type("message").await;
    assert!(response["message"]["error"].as_str().unwrap().contains("echo"));
    client.close().await;
}

#[tokio::test]
async fn test_progress_is_streamed_before_the_result() {
    let mut relay = MockRelay::start(true).await;
    let hub = Arc::new(ProgressHub::new(ProgressHubConfig::default()));
    let client = ChannelClient::builder(config(&relay.url))
        .progress_sink(hub.clone())
        .executor(Arc::new(CommandRegistry::with_builtins()))
        .spawn();
    let channel = client.connect().await.unwrap();

    relay.push(json!({
        "type": "message",
        "channel": channel,
        "message": { "id": "c1", "command": "count", "params": { "total": 3 } }
    }));

    let mut statuses = Vec::new();
    loop {
        let frame = tokio::time::timeout(WAIT, relay.frames.recv())
            .await
            .unwrap()
            .unwrap();
        match frame["type"].as_str() {
            Some("progress_update") => {
                let data = &frame["message"]["data"];
                assert_eq!(data["commandId"], "c1");
                statuses.push(data["status"].as_str().unwrap().to_string());
            }
            Some("message") => {
                assert_eq!(frame["message"]["result"], json!({"counted": 3}));
                break;
            }
            _ => {}
        }
    }
    assert_eq!(
        statuses,
        vec!["started", "in_progress", "in_progress", "in_progress", "completed"]
    );
    assert_eq!(hub.latest("c1").unwrap().status, ProgressStatus::Completed);
    client.close().await;
}

#[tokio::test]
async fn test_emit_progress_reaches_the_wire() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    let channel = client.connect().await.unwrap();

    client.emit_progress(ProgressEvent::new(
        "job1",
        "import",
        ProgressStatus::InProgress,
        50,
        "Halfway",
    ));
    let frame = relay.next_of_type("progress_update").await;
    assert_eq!(frame["channel"], channel.as_str());
    assert_eq!(frame["message"]["data"]["commandId"], "job1");
    assert_eq!(frame["message"]["data"]["progress"], 50);
    client.close().await;
}

#[tokio::test]
async fn test_command_progress_is_relayed_once() {
    let mut relay = MockRelay::start(true).await;
    let hub = Arc::new(ProgressHub::new(ProgressHubConfig::default()));
    let client = ChannelClient::builder(config(&relay.url))
        .progress_sink(hub.clone())
        .spawn();
    let channel = client.connect().await.unwrap();

    relay.push(json!({
        "type": "command_progress",
        "id": "c9",
        "channel": channel,
        "data": { "commandId": "c9", "status": "in_progress", "progress": 30 }
    }));
    let frame = relay.next_of_type("progress_update").await;
    assert_eq!(frame["message"]["data"]["commandId"], "c9");
    assert_eq!(frame["message"]["data"]["progress"], 30);
    assert_eq!(hub.latest("c9").unwrap().progress, 30);
    client.close().await;
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_abrupt_drop_rejects_pending_and_rejoins_same_channel() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    let channel = client.connect().await.unwrap();
    relay.next_of_type("join").await;

    let (result, ()) = tokio::join!(client.send_with_id("r1", "slow", json!({})), async {
        relay.next_of_type("message").await;
        relay.drop_connection();
    });
    assert!(matches!(result, Err(ChannelError::Transport(_))));

    let connections = Arc::clone(&relay.connections);
    wait_for_status(&client, |s| {
        s.status.is_connected() && connections.load(Ordering::SeqCst) >= 2
    })
    .await;

    let rejoin = relay.next_of_type("join").await;
    assert_eq!(rejoin["channel"], channel.as_str());
    assert_eq!(client.channel().as_deref(), Some(channel.as_str()));
    assert_eq!(client.snapshot().reconnect_attempts, 0);
    client.close().await;
}

#[tokio::test]
async fn test_unreachable_server_exhausts_to_failed() {
    let url = unreachable_url();

    let client = ChannelClient::builder(ClientConfig {
        max_reconnect_attempts: 2,
        ..config(&url)
    })
    .spawn();

    match client.connect().await {
        Err(ChannelError::Transport(msg)) => {
            assert!(msg.contains("WebSocket connect failed"), "got {}", msg)
        }
        other => panic!("Expected Transport error, got {:?}", other),
    }
    wait_for_status(&client, |s| {
        matches!(s.status, ConnectionStatus::Failed { .. })
    })
    .await;

    let snapshot = client.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Failed { attempts: 2 });
    assert!(snapshot.last_error.is_some());
    assert!(matches!(
        client.send("noop", json!({})).await,
        Err(ChannelError::NotConnected)
    ));
    client.close().await;
}

#[tokio::test]
async fn test_connect_after_failed_starts_a_fresh_attempt_budget() {
    let url = unreachable_url();
    let client = ChannelClient::builder(ClientConfig {
        max_reconnect_attempts: 2,
        backoff: BackoffPolicy::new(Duration::from_millis(500), 1.0, Duration::from_millis(500)),
        ..config(&url)
    })
    .spawn();

    assert!(client.connect().await.is_err());
    wait_for_status(&client, |s| s.status == ConnectionStatus::Failed { attempts: 2 }).await;

    // The manual attempt fails too, but a new reconnect cycle is armed
    assert!(matches!(
        client.connect().await,
        Err(ChannelError::Transport(_))
    ));
    let snapshot = client.snapshot();
    assert!(
        matches!(snapshot.status, ConnectionStatus::Reconnecting { attempt: 1, .. }),
        "got {:?}",
        snapshot.status
    );
    assert_eq!(snapshot.reconnect_attempts, 1);

    wait_for_status(&client, |s| s.status == ConnectionStatus::Failed { attempts: 2 }).await;
    client.close().await;
}

#[tokio::test]
async fn test_disconnect_rejects_pending_and_stays_down() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    client.connect().await.unwrap();

    let (result, ()) = tokio::join!(client.send_with_id("r1", "slow", json!({})), async {
        relay.next_of_type("message").await;
        client.disconnect().await.unwrap();
    });
    assert!(matches!(result, Err(ChannelError::Disconnected)));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);

    // Well past the backoff delay
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(relay.connections(), 1);
    client.close().await;
}

#[tokio::test]
async fn test_manual_reconnect_after_drop_without_auto_reconnect() {
    let mut relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(ClientConfig {
        auto_reconnect: false,
        ..config(&relay.url)
    })
    .spawn();
    let channel = client.connect().await.unwrap();
    relay.next_of_type("join").await;

    relay.drop_connection();
    wait_for_status(&client, |s| s.status == ConnectionStatus::Disconnected).await;
    assert_eq!(relay.connections(), 1);

    assert_eq!(client.reconnect().await.unwrap(), channel);
    assert_eq!(relay.connections(), 2);
    client.close().await;
}

#[tokio::test]
async fn test_close_shuts_the_client_down() {
    let relay = MockRelay::start(true).await;
    let client = ChannelClient::builder(config(&relay.url)).spawn();
    client.connect().await.unwrap();

    client.close().await;
    assert!(matches!(client.connect().await, Err(ChannelError::Closed)));
    assert!(matches!(
        client.send("noop", json!({})).await,
        Err(ChannelError::Closed)
    ));
}

//! Message Router
//!
//! Single responsibility: Decide what each inbound frame means and deliver it.
//!
//! | Frame                                   | Destination                       |
//! |-----------------------------------------|-----------------------------------|
//! | `system` with an object payload         | Connection state machine (join)   |
//! | `message` with `result` / `error`       | Pending request table             |
//! | `message` with `command`, id not ours   | Execution delegate                |
//! | `progress_update` / `command_progress`  | Progress sink (and maybe relayed) |
//! | `{id, error}`                           | Pending request table             |
//! | anything else                           | Logged and dropped                |
//!
//! Routing never fails: a bad frame is logged and dropped so the receive
//! loop keeps running.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::pending::PendingTable;
use super::protocol::{classify, encode_progress, Inbound, InboundCommand, JoinAck};
use crate::error::ChannelError;
use crate::progress::ProgressSink;

/// What the connection task must do with a routed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Join acknowledgement for the state machine
    JoinAck(JoinAck),
    /// A pending request was settled
    Settled { id: String },
    /// Execute this command and answer it
    Dispatch(InboundCommand),
    /// Progress was delivered locally
    Delivered,
    /// Progress was delivered locally and this frame must be sent onward
    Relay(String),
    /// Nothing to do
    Dropped,
}

pub struct Router {
    pending: PendingTable,
    progress: Arc<dyn ProgressSink>,
    relay_progress: bool,
}

impl Router {
    pub fn new(pending: PendingTable, progress: Arc<dyn ProgressSink>, relay_progress: bool) -> Self {
        Self {
            pending,
            progress,
            relay_progress,
        }
    }

    /// Route one text frame received while joined to `channel` (if any).
    pub fn route(&self, text: &str, channel: Option<&str>) -> Routed {
        let inbound = match classify(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Dropping inbound frame");
                return Routed::Dropped;
            }
        };

        match inbound {
            Inbound::JoinAck(ack) => Routed::JoinAck(ack),

            Inbound::Notice(notice) => {
                info!(notice = %notice, "Server notice");
                Routed::Dropped
            }

            Inbound::Response {
                id,
                outcome,
                channel: frame_channel,
            } => {
                if is_foreign(frame_channel.as_deref(), channel) {
                    debug!(id = %id, "Dropping response for another channel");
                    return Routed::Dropped;
                }
                let settled = match outcome {
                    Ok(result) => self.pending.resolve(&id, result),
                    Err(error) => self.pending.reject(&id, ChannelError::Remote(error)),
                };
                if settled {
                    debug!(id = %id, "Request settled");
                    Routed::Settled { id }
                } else {
                    // Already timed out, or never ours
                    debug!(id = %id, "Dropping response with no pending request");
                    Routed::Dropped
                }
            }

            Inbound::Command {
                command,
                channel: frame_channel,
            } => {
                if is_foreign(frame_channel.as_deref(), channel) {
                    debug!(id = %command.id, "Dropping command for another channel");
                    return Routed::Dropped;
                }
                if self.pending.contains(&command.id) {
                    // Echo of a command this side sent
                    debug!(id = %command.id, "Ignoring echo of outbound command");
                    return Routed::Dropped;
                }
                debug!(id = %command.id, command = %command.command, "Inbound command");
                Routed::Dispatch(command)
            }

            Inbound::Unaddressed { command } => {
                warn!(command = %command, "Dropping command frame without an id");
                Routed::Dropped
            }

            Inbound::Progress {
                event,
                relayable,
                channel: frame_channel,
            } => {
                if is_foreign(frame_channel.as_deref(), channel) {
                    debug!(command_id = %event.command_id, "Dropping progress for another channel");
                    return Routed::Dropped;
                }
                let relay = match (relayable && self.relay_progress, channel) {
                    (true, Some(channel)) => match encode_progress(channel, &event) {
                        Ok(frame) => Some(frame),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode relayed progress");
                            None
                        }
                    },
                    _ => None,
                };
                self.progress.deliver(event);
                match relay {
                    Some(frame) => Routed::Relay(frame),
                    None => Routed::Delivered,
                }
            }

            Inbound::Error { id, error } => {
                if self.pending.reject(&id, ChannelError::Remote(error.clone())) {
                    Routed::Settled { id }
                } else {
                    warn!(id = %id, error = %error, "Error frame for unknown request");
                    Routed::Dropped
                }
            }
        }
    }
}

fn is_foreign(frame_channel: Option<&str>, joined: Option<&str>) -> bool {
    matches!((frame_channel, joined), (Some(frame), Some(joined)) if frame != joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pending::DEFAULT_REQUEST_TIMEOUT;
    use crate::progress::ProgressEvent;
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        router: Router,
        pending: PendingTable,
        events: Arc<Mutex<Vec<ProgressEvent>>>,
    }

    fn fixture(relay_progress: bool) -> Fixture {
        let pending = PendingTable::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |event: ProgressEvent| events_clone.lock().unwrap().push(event));
        Fixture {
            router: Router::new(pending.clone(), sink, relay_progress),
            pending,
            events,
        }
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let f = fixture(true);
        let waiter = f.pending.register("r1", DEFAULT_REQUEST_TIMEOUT);

        let routed = f.router.route(
            r#"{"id":"r1","type":"message","channel":"ab12cd34","message":{"id":"r1","result":{"ok":true}}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(routed, Routed::Settled { id: "r1".into() });
        assert!(!f.pending.contains("r1"));
        assert_eq!(waiter.wait().await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_remote_error() {
        let f = fixture(true);
        let waiter = f.pending.register("r1", DEFAULT_REQUEST_TIMEOUT);

        f.router.route(
            r#"{"type":"message","message":{"id":"r1","error":"Node not found"}}"#,
            Some("ab12cd34"),
        );
        match waiter.wait().await {
            Err(ChannelError::Remote(msg)) => assert_eq!(msg, "Node not found"),
            other => panic!("Expected RemoteError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let f = fixture(true);
        let _waiter = f.pending.register("r1", DEFAULT_REQUEST_TIMEOUT);
        let frame = r#"{"type":"message","message":{"id":"r1","result":1}}"#;

        assert!(matches!(f.router.route(frame, None), Routed::Settled { .. }));
        assert_eq!(f.router.route(frame, None), Routed::Dropped);
    }

    #[tokio::test]
    async fn test_foreign_channel_is_dropped() {
        let f = fixture(true);
        let _waiter = f.pending.register("r1", DEFAULT_REQUEST_TIMEOUT);

        let routed = f.router.route(
            r#"{"type":"message","channel":"other000","message":{"id":"r1","result":1}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(routed, Routed::Dropped);
        assert!(f.pending.contains("r1"));
    }

    #[tokio::test]
    async fn test_inbound_command_is_dispatched() {
        let f = fixture(true);
        let routed = f.router.route(
            r#"{"id":"c1","type":"message","channel":"ab12cd34","message":{"id":"c1","command":"get_selection","params":{"depth":1}}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(
            routed,
            Routed::Dispatch(InboundCommand {
                id: "c1".into(),
                command: "get_selection".into(),
                params: json!({"depth": 1}),
            })
        );
    }

    #[tokio::test]
    async fn test_echo_of_own_command_is_ignored() {
        let f = fixture(true);
        let _waiter = f.pending.register("r1", DEFAULT_REQUEST_TIMEOUT);
        let routed = f.router.route(
            r#"{"type":"message","message":{"id":"r1","command":"noop","params":{}}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(routed, Routed::Dropped);
        assert!(f.pending.contains("r1"));
    }

    #[tokio::test]
    async fn test_progress_update_is_delivered_not_relayed() {
        let f = fixture(true);
        let routed = f.router.route(
            r#"{"id":"c1","type":"progress_update","message":{"type":"progress_update","data":{"commandId":"c1","status":"in_progress","progress":50}}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(routed, Routed::Delivered);
        assert_eq!(f.events.lock().unwrap()[0].progress, 50);
    }

    #[tokio::test]
    async fn test_command_progress_is_relayed() {
        let f = fixture(true);
        let routed = f.router.route(
            r#"{"type":"command_progress","id":"c1","data":{"commandId":"c1","status":"started"}}"#,
            Some("ab12cd34"),
        );
        match routed {
            Routed::Relay(frame) => {
                let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(frame["type"], "progress_update");
                assert_eq!(frame["channel"], "ab12cd34");
                assert_eq!(frame["message"]["data"]["commandId"], "c1");
            }
            other => panic!("Expected Relay, got {:?}", other),
        }
        assert_eq!(f.events.lock().unwrap().len(), 1);

        let quiet = fixture(false);
        let routed = quiet.router.route(
            r#"{"type":"command_progress","id":"c1","data":{"commandId":"c1","status":"started"}}"#,
            Some("ab12cd34"),
        );
        assert_eq!(routed, Routed::Delivered);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let f = fixture(true);
        assert_eq!(f.router.route("{not json", None), Routed::Dropped);
        assert_eq!(f.router.route(r#"{"type":"unknown"}"#, None), Routed::Dropped);
        assert_eq!(
            f.router.route(r#"{"type":"system","message":"Please join a channel"}"#, None),
            Routed::Dropped
        );
    }

    #[tokio::test]
    async fn test_bare_error_frame_rejects_pending() {
        let f = fixture(true);
        let waiter = f.pending.register("r5", DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(
            f.router.route(r#"{"id":"r5","error":"rate limited"}"#, None),
            Routed::Settled { id: "r5".into() }
        );
        assert!(matches!(waiter.wait().await, Err(ChannelError::Remote(_))));
        assert_eq!(
            f.router.route(r#"{"id":"r6","error":"nobody"}"#, None),
            Routed::Dropped
        );
    }
}

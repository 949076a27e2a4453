//! Channel Wire Protocol
//!
//! Single responsibility: Encode and classify JSON frames exchanged with the relay server.
//!
//! # Wire Format
//!
//! ## Join (outbound)
//! ```text
//! {"type": "join", "channel": "<8-char lowercase alnum>"}
//! ```
//!
//! ## Join acknowledgement (inbound)
//! ```text
//! {"type": "system", "channel": "<name>", "message": {"result": true | false, ...}}
//! ```
//!
//! ## Command / response
//! ```text
//! {"id": "<id>", "type": "message", "channel": "<channel>",
//!  "message": {"id": "<id>", "command": "<name>", "params": {...}}}
//!
//! {"id": "<id>", "type": "message", "channel": "<channel>",
//!  "message": {"id": "<id>", "result": {...}}}          // or "error": "<string>"
//! ```
//!
//! ## Progress
//! ```text
//! {"id": "<commandId>", "type": "progress_update", "channel": "<channel>",
//!  "message": {"type": "progress_update", "data": {commandId, status, progress, ...}}}
//! ```
//!
//! ## Error (fire-and-forget)
//! ```text
//! {"id": "<id>", "error": "<string>"}
//! ```

use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ChannelError, Result};
use crate::progress::ProgressEvent;

/// Close code for an intentional disconnect. Suppresses auto-reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close frame carried no status code
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code used when the server refuses (or never acknowledges) a join
pub const JOIN_REJECTED: u16 = 4001;

/// Length of generated channel names
pub const CHANNEL_NAME_LEN: usize = 8;

const CHANNEL_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random channel name: fixed-length lowercase alphanumeric.
pub fn generate_channel_name() -> String {
    let mut rng = rand::thread_rng();
    (0..CHANNEL_NAME_LEN)
        .map(|_| CHANNEL_ALPHABET[rng.gen_range(0..CHANNEL_ALPHABET.len())] as char)
        .collect()
}

/// Generate a caller-unguessable request id.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Serialize)]
struct JoinFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'a str,
}

#[derive(Serialize)]
struct Envelope<'a, M: Serialize> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'a str,
    message: M,
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    id: &'a str,
    command: &'a str,
    params: &'a Value,
}

#[derive(Serialize)]
struct ResultPayload<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct ProgressPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a ProgressEvent,
}

#[derive(Serialize)]
struct ErrorFrame<'a> {
    id: &'a str,
    error: &'a str,
}

/// Encode the join request for `channel`.
pub fn encode_join(channel: &str) -> Result<String> {
    Ok(serde_json::to_string(&JoinFrame {
        kind: "join",
        channel,
    })?)
}

/// Encode an outbound command addressed to `channel`.
pub fn encode_command(id: &str, channel: &str, command: &str, params: &Value) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        id,
        kind: "message",
        channel,
        message: CommandPayload {
            id,
            command,
            params,
        },
    })?)
}

/// Encode the outcome of a command executed on this side.
pub fn encode_response(
    id: &str,
    channel: &str,
    outcome: &std::result::Result<Value, String>,
) -> Result<String> {
    let message = match outcome {
        Ok(result) => ResultPayload {
            id,
            result: Some(result),
            error: None,
        },
        Err(error) => ResultPayload {
            id,
            result: None,
            error: Some(error),
        },
    };
    Ok(serde_json::to_string(&Envelope {
        id,
        kind: "message",
        channel,
        message,
    })?)
}

/// Encode a progress event as a `progress_update` frame.
pub fn encode_progress(channel: &str, event: &ProgressEvent) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        id: &event.command_id,
        kind: "progress_update",
        channel,
        message: ProgressPayload {
            kind: "progress_update",
            data: event,
        },
    })?)
}

/// Encode a bare error frame. No response is expected.
pub fn encode_error(id: &str, error: &str) -> Result<String> {
    Ok(serde_json::to_string(&ErrorFrame { id, error })?)
}

/// Result of a `system` frame that answers a join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAck {
    /// Channel name as the server recorded it
    pub channel: Option<String>,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// A command the counterparty wants this side to execute
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    pub id: String,
    pub command: String,
    pub params: Value,
}

/// A structurally classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    JoinAck(JoinAck),
    /// Informational `system` frame, not an acknowledgement
    Notice(String),
    Response {
        id: String,
        outcome: std::result::Result<Value, String>,
        channel: Option<String>,
    },
    Command {
        command: InboundCommand,
        channel: Option<String>,
    },
    /// A `command` frame without an id. Nothing can be answered.
    Unaddressed { command: String },
    Progress {
        event: ProgressEvent,
        /// `command_progress` frames come from an inner hop and may be relayed
        relayable: bool,
        channel: Option<String>,
    },
    Error { id: String, error: String },
}

fn malformed(reason: impl Into<String>) -> ChannelError {
    ChannelError::MalformedFrame(reason.into())
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Classify one text frame by its discriminant.
///
/// # Errors
/// `MalformedFrame` for invalid JSON, non-object frames and unknown types.
pub fn classify(text: &str) -> Result<Inbound> {
    let frame: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    let obj = frame
        .as_object()
        .ok_or_else(|| malformed("frame is not a JSON object"))?;

    match str_field(obj, "type") {
        Some("system") => Ok(classify_system(obj)),
        Some("message") | Some("broadcast") => classify_message(obj),
        Some("progress_update") => classify_progress(obj, false),
        Some("command_progress") => classify_progress(obj, true),
        Some(other) => Err(malformed(format!("unrecognized frame type: {}", other))),
        None => match (str_field(obj, "id"), str_field(obj, "error")) {
            (Some(id), Some(error)) => Ok(Inbound::Error {
                id: id.to_string(),
                error: error.to_string(),
            }),
            _ => Err(malformed("frame has no type")),
        },
    }
}

fn classify_system(obj: &Map<String, Value>) -> Inbound {
    let top_channel = str_field(obj, "channel").map(str::to_string);
    let message = match obj.get("message") {
        Some(Value::Object(message)) => message,
        Some(Value::String(text)) => return Inbound::Notice(text.clone()),
        _ => return Inbound::Notice(String::new()),
    };

    let channel = top_channel.or_else(|| str_field(message, "channel").map(str::to_string));
    let accepted = match message.get("result") {
        Some(Value::Bool(ok)) => *ok,
        // Some relays answer with a human-readable confirmation
        Some(Value::String(text)) => !text.is_empty(),
        _ => false,
    };
    let reason = if accepted {
        None
    } else {
        Some(
            str_field(message, "error")
                .unwrap_or("join was not acknowledged")
                .to_string(),
        )
    };

    Inbound::JoinAck(JoinAck {
        channel,
        accepted,
        reason,
    })
}

fn classify_message(obj: &Map<String, Value>) -> Result<Inbound> {
    let channel = str_field(obj, "channel").map(str::to_string);
    let payload = obj
        .get("message")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("message frame without an object payload"))?;
    let id = str_field(payload, "id").or_else(|| str_field(obj, "id"));

    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let id = id.ok_or_else(|| malformed("error payload without an id"))?;
        let error = match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Ok(Inbound::Response {
            id: id.to_string(),
            outcome: Err(error),
            channel,
        });
    }

    if let Some(result) = payload.get("result") {
        let id = id.ok_or_else(|| malformed("result payload without an id"))?;
        return Ok(Inbound::Response {
            id: id.to_string(),
            outcome: Ok(result.clone()),
            channel,
        });
    }

    if let Some(command) = str_field(payload, "command") {
        let Some(id) = id else {
            return Ok(Inbound::Unaddressed {
                command: command.to_string(),
            });
        };
        let params = payload
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        return Ok(Inbound::Command {
            command: InboundCommand {
                id: id.to_string(),
                command: command.to_string(),
                params,
            },
            channel,
        });
    }

    Err(malformed("message payload has neither result, error nor command"))
}

fn classify_progress(obj: &Map<String, Value>, relayable: bool) -> Result<Inbound> {
    let channel = str_field(obj, "channel").map(str::to_string);
    let message = obj.get("message").and_then(Value::as_object);
    let mut data = message
        .and_then(|m| m.get("data"))
        .or_else(|| obj.get("data"))
        .or_else(|| obj.get("message"))
        .cloned()
        .ok_or_else(|| malformed("progress frame without data"))?;

    // Frames from an inner hop may leave commandId to the envelope id
    if let (Some(fields), Some(id)) = (data.as_object_mut(), str_field(obj, "id")) {
        fields
            .entry("commandId")
            .or_insert_with(|| Value::String(id.to_string()));
    }

    let event: ProgressEvent =
        serde_json::from_value(data).map_err(|e| malformed(format!("bad progress data: {}", e)))?;

    Ok(Inbound::Progress {
        event,
        relayable,
        channel,
    })
}

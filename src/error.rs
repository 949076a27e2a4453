//! Error types for plugin-bridge

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Not connected to a channel")]
    NotConnected,

    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnection attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Already joined channel {channel}")]
    AlreadyJoined { channel: String },

    #[error("Request {id} superseded by a newer request with the same id")]
    Superseded { id: String },

    #[error("Disconnected")]
    Disconnected,

    #[error("Connection task has shut down")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error belongs to one request only, as opposed to the
    /// connection as a whole.
    pub fn is_request_local(&self) -> bool {
        matches!(
            self,
            ChannelError::NotConnected
                | ChannelError::Timeout { .. }
                | ChannelError::Remote(_)
                | ChannelError::Superseded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

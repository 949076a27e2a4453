//! Connection State Machine
//!
//! Single responsibility: Decide connection transitions. No I/O.
//!
//! ```text
//!  disconnected ──connect──► connecting ──join-ack──► connected
//!       ▲                        ▲                        │
//!       │ disconnect             │ timer                  │ abnormal close
//!       │                        │                        ▼
//!       └──────────────────── reconnecting ◄──────────────┘
//!                                │
//!                                │ attempts >= max
//!                                ▼
//!                             failed  (manual reconnect only)
//! ```
//!
//! The connection task feeds socket events in and carries out the returned
//! decisions. Keeping the rules here means every transition can be tested
//! without a socket.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::protocol::{JoinAck, NORMAL_CLOSURE};
use crate::error::ChannelError;

/// Default cap on consecutive reconnect attempts
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Observable connection status.
///
/// The joined channel lives inside `Connected`, so a channel exists exactly
/// when the connection is usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { channel: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Failed { attempts: u32 },
}

impl ConnectionStatus {
    pub fn channel(&self) -> Option<&str> {
        match self {
            ConnectionStatus::Connected { channel } => Some(channel),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }
}

/// What the connection task must do after a socket close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing further; stay where the machine landed
    Idle,
    /// Arm the reconnect timer
    Reconnect { attempt: u32, delay: Duration },
    /// Attempts exhausted; report terminal failure
    Exhausted { attempts: u32 },
}

/// What the connection task must do after a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// Already joined; resolve immediately with this channel
    AlreadyConnected(String),
    /// Drop any existing socket and open a new one
    Open,
}

/// Pure connection state machine.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    status: ConnectionStatus,
    auto_reconnect: bool,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    backoff: BackoffPolicy,
    /// Channel requested by the caller, reused across reconnects
    preferred_channel: Option<String>,
    /// Channel of the current session, rejoined after automatic reconnects
    session_channel: Option<String>,
    /// Channel named in the join we are waiting on
    joining: Option<String>,
    reconnect_scheduled: bool,
}

impl ConnectionMachine {
    pub fn new(auto_reconnect: bool, max_reconnect_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            auto_reconnect,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            backoff,
            preferred_channel: None,
            session_channel: None,
            joining: None,
            reconnect_scheduled: false,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn has_scheduled_reconnect(&self) -> bool {
        self.reconnect_scheduled
    }

    pub fn preferred_channel(&self) -> Option<&str> {
        self.preferred_channel.as_deref()
    }

    /// A caller asked to connect.
    ///
    /// `channel` pins the channel to join. While connected, asking for a
    /// different channel is an error: there is no rejoin. From `failed` the
    /// attempt counter starts over.
    pub fn request_connect(
        &mut self,
        channel: Option<String>,
    ) -> Result<ConnectDecision, ChannelError> {
        if let ConnectionStatus::Connected { channel: current } = &self.status {
            return match channel {
                Some(wanted) if wanted != *current => Err(ChannelError::AlreadyJoined {
                    channel: current.clone(),
                }),
                _ => Ok(ConnectDecision::AlreadyConnected(current.clone())),
            };
        }

        if channel.is_some() {
            self.preferred_channel = channel;
        }
        if matches!(self.status, ConnectionStatus::Failed { .. }) {
            // Resuming from failed is a manual reconnect
            self.reconnect_attempts = 0;
        }
        self.reconnect_scheduled = false;
        self.joining = None;
        self.status = ConnectionStatus::Connecting;
        debug!("Connecting");
        Ok(ConnectDecision::Open)
    }

    /// Manual reconnect: a fresh start with a zeroed attempt counter.
    ///
    /// Works from any state, including `failed`.
    pub fn request_reconnect(&mut self) -> ConnectDecision {
        self.reconnect_attempts = 0;
        self.reconnect_scheduled = false;
        self.joining = None;
        self.status = ConnectionStatus::Connecting;
        info!("Manual reconnect requested");
        ConnectDecision::Open
    }

    /// The reconnect timer fired.
    ///
    /// Returns false when the timer is stale and should be ignored.
    pub fn reconnect_due(&mut self) -> bool {
        if !self.reconnect_scheduled || !matches!(self.status, ConnectionStatus::Reconnecting { .. })
        {
            return false;
        }
        self.reconnect_scheduled = false;
        self.joining = None;
        self.status = ConnectionStatus::Connecting;
        debug!(attempt = self.reconnect_attempts, "Reconnect timer fired");
        true
    }

    /// The socket opened. Returns the channel to name in the join frame.
    ///
    /// # Errors
    /// `AlreadyJoined` if a join is attempted while connected.
    pub fn socket_opened(&mut self, generated: String) -> Result<String, ChannelError> {
        if let ConnectionStatus::Connected { channel } = &self.status {
            return Err(ChannelError::AlreadyJoined {
                channel: channel.clone(),
            });
        }
        let channel = self
            .preferred_channel
            .clone()
            .or_else(|| self.session_channel.clone())
            .unwrap_or(generated);
        self.joining = Some(channel.clone());
        Ok(channel)
    }

    /// A join acknowledgement arrived.
    ///
    /// On success returns the authoritative channel name.
    ///
    /// # Errors
    /// - `JoinRejected` if the ack reports failure or no join was outstanding
    /// - `AlreadyJoined` if already connected
    pub fn join_acknowledged(&mut self, ack: &JoinAck) -> Result<String, ChannelError> {
        if let ConnectionStatus::Connected { channel } = &self.status {
            return Err(ChannelError::AlreadyJoined {
                channel: channel.clone(),
            });
        }
        let requested = self
            .joining
            .take()
            .ok_or_else(|| ChannelError::JoinRejected("no join outstanding".into()))?;

        if !ack.accepted {
            let reason = ack
                .reason
                .clone()
                .unwrap_or_else(|| "join was not acknowledged".into());
            warn!(channel = %requested, reason = %reason, "Join rejected");
            return Err(ChannelError::JoinRejected(reason));
        }

        let channel = ack.channel.clone().unwrap_or(requested);
        self.session_channel = Some(channel.clone());
        self.reconnect_attempts = 0;
        self.reconnect_scheduled = false;
        self.status = ConnectionStatus::Connected {
            channel: channel.clone(),
        };
        info!(channel = %channel, "Joined channel");
        Ok(channel)
    }

    /// The socket closed with `code`.
    pub fn socket_closed(&mut self, code: u16) -> CloseOutcome {
        self.joining = None;

        if matches!(self.status, ConnectionStatus::Failed { .. }) {
            return CloseOutcome::Idle;
        }

        if code == NORMAL_CLOSURE || !self.auto_reconnect {
            debug!(code = code, "Connection closed, not reconnecting");
            self.reconnect_scheduled = false;
            self.status = ConnectionStatus::Disconnected;
            return CloseOutcome::Idle;
        }

        if self.reconnect_attempts >= self.max_reconnect_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "Reconnection attempts exhausted"
            );
            self.reconnect_scheduled = false;
            self.status = ConnectionStatus::Failed {
                attempts: self.reconnect_attempts,
            };
            return CloseOutcome::Exhausted {
                attempts: self.reconnect_attempts,
            };
        }

        self.reconnect_attempts += 1;
        let delay = self.backoff.delay(self.reconnect_attempts);
        self.reconnect_scheduled = true;
        self.status = ConnectionStatus::Reconnecting {
            attempt: self.reconnect_attempts,
            delay_ms: delay.as_millis() as u64,
        };
        info!(
            code = code,
            attempt = self.reconnect_attempts,
            max = self.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Connection lost, scheduling reconnect"
        );
        CloseOutcome::Reconnect {
            attempt: self.reconnect_attempts,
            delay,
        }
    }

    /// Intentional disconnect.
    pub fn disconnect(&mut self) {
        self.reconnect_attempts = 0;
        self.reconnect_scheduled = false;
        self.joining = None;
        self.session_channel = None;
        self.status = ConnectionStatus::Disconnected;
        info!("Disconnected");
    }

    /// Toggle auto-reconnect.
    ///
    /// Turning it off cancels a scheduled reconnect and zeroes the attempt
    /// counter. Returns true if a scheduled reconnect was cancelled.
    pub fn set_auto_reconnect(&mut self, enabled: bool) -> bool {
        self.auto_reconnect = enabled;
        if enabled {
            return false;
        }
        self.reconnect_attempts = 0;
        let cancelled = std::mem::take(&mut self.reconnect_scheduled);
        if cancelled {
            // No attempt is coming, so "reconnecting" would be a lie
            self.status = ConnectionStatus::Disconnected;
        }
        cancelled
    }
}

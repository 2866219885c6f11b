use crate::types::{ConnectionState, KickInfo};
use std::time::Duration;

/// Lifecycle of one `TransportClient`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportPhase {
    /// Never connected
    Idle,
    /// GET /token in flight
    FetchingToken,
    /// Socket opening / handshake being sent
    Handshaking,
    /// Socket open, framed traffic flowing
    Open,
    /// Lost the socket (or the connect attempt failed)
    Disconnected,
    /// Waiting out the backoff before the next attempt
    ReconnectWait,
    /// Explicitly disconnected; nothing will reconnect on its own
    Closed,
}

/// Notifications from a `TransportClient` to its handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and the handshake was sent.
    Opened { generation: u64, reconnect: bool },
    /// An open socket failed (receive error, write error, missed ping).
    /// Emitted once per failure.
    Disconnected { generation: u64, reason: String },
    /// A reconnect attempt will run after `delay`.
    ReconnectScheduled {
        generation: u64,
        attempt: u32,
        delay: Duration,
    },
}

/// Errors surfaced by `TransportClient::connect`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("token fetch failed: {0}")]
    TokenFetch(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("socket error: {0}")]
    Socket(String),
    /// A newer `connect` or a `disconnect` replaced this attempt.
    #[error("connection attempt superseded")]
    Superseded,
}

/// Errors from the session arbitration API. Callers treat these as
/// "unknown", never as a claim or eviction outcome.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    #[error("session claim failed: {0}")]
    Claim(String),
    #[error("session check failed: {0}")]
    Check(String),
}

/// Errors from the tmux routes of the control API.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("control request failed: {0}")]
    Request(String),
    #[error("control API answered HTTP {0}")]
    Status(u16),
    #[error("invalid control response: {0}")]
    Body(String),
}

/// A successfully claimed session. Absent = unmanaged mode, no polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
}

/// Read model published by an orchestrator on every change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub kick: Option<KickInfo>,
    pub session_id: Option<String>,
}

/// Event sent from orchestrator tasks to whoever drives the UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection state changed
    StatusChanged {
        connection_id: String,
        state: ConnectionState,
        kick: Option<KickInfo>,
    },
    /// Transport lost the socket and will retry after `delay`
    Reconnecting {
        connection_id: String,
        attempt: u32,
        delay: Duration,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            ConnectionEvent::StatusChanged { connection_id, .. }
            | ConnectionEvent::Reconnecting { connection_id, .. } => connection_id,
        }
    }
}

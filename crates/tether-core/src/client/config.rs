use crate::types::TerminalSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default ttyd port.
pub const DEFAULT_TTYD_PORT: u16 = 7681;
/// Default port of the companion control API.
pub const DEFAULT_API_PORT: u16 = 8080;

/// A remote machine the client can attach to.
/// Persisted in settings.json as part of `profiles`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Stable UUID, unique across sessions
    pub id: String,
    /// User-friendly label (e.g. "Studio Mac")
    pub name: String,
    /// Hostname or IP address of the remote machine
    #[serde(alias = "tailscale_ip")]
    pub host: String,
    /// Port of the ttyd transport server
    #[serde(default = "default_ttyd_port")]
    pub ttyd_port: u16,
    /// Port of the session arbitration / control API
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// tmux session the remote shell is attached to
    #[serde(default = "default_tmux_session")]
    pub tmux_session: String,
}

fn default_ttyd_port() -> u16 {
    DEFAULT_TTYD_PORT
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_tmux_session() -> String {
    "claude".to_string()
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            ttyd_port: DEFAULT_TTYD_PORT,
            api_port: DEFAULT_API_PORT,
            tmux_session: default_tmux_session(),
        }
    }

    pub fn target(&self, size: TerminalSize) -> ConnectionTarget {
        ConnectionTarget {
            host: self.host.clone(),
            port: self.ttyd_port,
            api_port: self.api_port,
            size,
        }
    }
}

/// Endpoint and initial geometry for one orchestrator. Fixed for its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    /// ttyd port
    pub port: u16,
    /// Control API port (same host)
    pub api_port: u16,
    /// Size used for the handshake when nothing was staged with `send_resize`
    pub size: TerminalSize,
}

impl ConnectionTarget {
    /// Base URL of the control API, e.g. `http://100.64.0.2:8080`.
    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.api_port)
    }

    /// Whether `profile` points somewhere else, so a fresh connection is needed.
    /// Name and tmux session do not matter.
    pub fn differs_from(&self, profile: &DeviceProfile) -> bool {
        self.host != profile.host
            || self.port != profile.ttyd_port
            || self.api_port != profile.api_port
    }
}

/// Timings shared by the transport and the orchestrator.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Interval between protocol pings on an open socket.
    pub keepalive_interval: Duration,
    /// Interval between session checks while connected.
    pub session_poll_interval: Duration,
    /// Timeout for token, claim and check requests.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            session_poll_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

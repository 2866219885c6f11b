use serde::{Deserialize, Serialize};

// ── Transport server (ttyd) ─────────────────────────────────────────────────

/// GET /token response
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// ── Session arbitration API ─────────────────────────────────────────────────

/// POST /session/claim request
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub device: String,
}

/// POST /session/claim response
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub session_id: String,
}

/// GET /session/check/{session_id} response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub active: bool,
    #[serde(default)]
    pub current_device: Option<String>,
}

// ── tmux control API ───────────────────────────────────────────────────────

/// One window of the remote tmux session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmuxWindow {
    pub index: u32,
    pub name: String,
    pub active: bool,
    /// Command currently running in the window's active pane
    #[serde(default)]
    pub command: String,
}

/// GET /tmux/windows response
#[derive(Debug, Serialize, Deserialize)]
pub struct TmuxWindowsResponse {
    pub windows: Vec<TmuxWindow>,
}

/// POST /tmux/window/select and /tmux/window/close request
#[derive(Debug, Serialize, Deserialize)]
pub struct WindowIndexRequest {
    pub index: u32,
}

/// POST /tmux/window/new request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NewWindowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// POST /tmux/exec request
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

/// GET /copy response: the visible contents of the active pane
#[derive(Debug, Serialize, Deserialize)]
pub struct CopyResponse {
    pub text: String,
}

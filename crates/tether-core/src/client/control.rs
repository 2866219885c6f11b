use crate::api::{
    CopyResponse, ExecRequest, NewWindowRequest, TmuxWindow, TmuxWindowsResponse,
    WindowIndexRequest,
};
use crate::client::types::ControlError;

use serde::Serialize;
use std::time::Duration;

/// Pause between creating a window and typing into it, so tmux has focused it.
pub const NEW_WINDOW_SETTLE: Duration = Duration::from_millis(300);

/// Request helper for the tmux routes of the control API: window list and
/// selection, pane capture and command execution.
///
/// Lives on the same base URL as the session arbitration routes.
#[derive(Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Windows of the remote tmux session, in index order.
    pub async fn list_windows(&self) -> Result<Vec<TmuxWindow>, ControlError> {
        let resp: TmuxWindowsResponse = self.get("/tmux/windows").await?;
        let mut windows = resp.windows;
        windows.sort_by_key(|w| w.index);
        Ok(windows)
    }

    pub async fn select_window(&self, index: u32) -> Result<(), ControlError> {
        self.post("/tmux/window/select", &WindowIndexRequest { index })
            .await
    }

    /// Open a new window, optionally running `command` in it.
    pub async fn new_window(&self, command: Option<&str>) -> Result<(), ControlError> {
        let body = NewWindowRequest {
            command: command.map(str::to_string),
        };
        self.post("/tmux/window/new", &body).await
    }

    pub async fn close_window(&self, index: u32) -> Result<(), ControlError> {
        self.post("/tmux/window/close", &WindowIndexRequest { index })
            .await
    }

    /// Type `command` into a window (the active one when `window` is `None`)
    /// and press enter.
    pub async fn exec(&self, command: &str, window: Option<&str>) -> Result<(), ControlError> {
        let body = ExecRequest {
            command: command.to_string(),
            window: window.map(str::to_string),
        };
        self.post("/tmux/exec", &body).await
    }

    /// Run `command`, in a fresh window when `new_window` is set.
    pub async fn run_command(&self, command: &str, new_window: bool) -> Result<(), ControlError> {
        if new_window {
            self.new_window(None).await?;
            tokio::time::sleep(NEW_WINDOW_SETTLE).await;
        }
        self.exec(command, None).await
    }

    /// Text currently visible in the active pane.
    pub async fn capture_pane(&self) -> Result<String, ControlError> {
        let resp: CopyResponse = self.get("/copy").await?;
        Ok(resp.text)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, route: &str) -> Result<T, ControlError> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, route))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ControlError::Request(format!("GET {}: {}", route, e)))?;

        if !resp.status().is_success() {
            return Err(ControlError::Status(resp.status().as_u16()));
        }

        resp.json()
            .await
            .map_err(|e| ControlError::Body(format!("GET {}: {}", route, e)))
    }

    async fn post<B: Serialize>(&self, route: &str, body: &B) -> Result<(), ControlError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, route))
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ControlError::Request(format!("POST {}: {}", route, e)))?;

        if !resp.status().is_success() {
            return Err(ControlError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

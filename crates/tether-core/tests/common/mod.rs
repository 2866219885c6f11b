//! In-process stand-ins for ttyd and the control API (session arbitration
//! and tmux routes).

#![allow(dead_code)]

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether_core::api::{
    ClaimRequest, ClaimResponse, CopyResponse, ExecRequest, NewWindowRequest, SessionStatus,
    TmuxWindow, TmuxWindowsResponse, WindowIndexRequest,
};
use tether_core::client::ClientConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "abc";

/// Fast timings so tests do not wait on production intervals.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        keepalive_interval: Duration::from_secs(5),
        session_poll_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn serve(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock server address");
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, task)
}

// ── ttyd ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum Push {
    Binary(Vec<u8>),
    Text(String),
    /// Send a close frame and end the socket
    Close,
    /// End the socket without a close frame
    Drop,
}

pub struct TtydState {
    pub token_ok: AtomicBool,
    pub token_requests: AtomicUsize,
    pub handshakes: Mutex<Vec<serde_json::Value>>,
    /// Binary frames received after the handshake, in order.
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub open_sockets: AtomicUsize,
    pub sockets_accepted: AtomicUsize,
    /// Stop reading from sockets, so pings go unanswered.
    pub stall: AtomicBool,
    push: broadcast::Sender<Push>,
}

pub struct MockTtyd {
    pub addr: SocketAddr,
    pub state: Arc<TtydState>,
    task: JoinHandle<()>,
}

impl MockTtyd {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(TtydState {
            token_ok: AtomicBool::new(true),
            token_requests: AtomicUsize::new(0),
            handshakes: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            open_sockets: AtomicUsize::new(0),
            sockets_accepted: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            push,
        });
        let app = Router::new()
            .route("/token", get(token_handler))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let (addr, task) = serve(app).await;
        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Send to every open socket.
    pub fn push(&self, msg: Push) {
        let _ = self.state.push.send(msg);
    }

    pub fn handshakes(&self) -> Vec<serde_json::Value> {
        self.state.handshakes.lock().clone()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.frames.lock().clone()
    }

    pub fn open_sockets(&self) -> usize {
        self.state.open_sockets.load(Ordering::SeqCst)
    }

    pub fn sockets_accepted(&self) -> usize {
        self.state.sockets_accepted.load(Ordering::SeqCst)
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn set_token_ok(&self, ok: bool) {
        self.state.token_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::SeqCst);
    }
}

impl Drop for MockTtyd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn token_handler(State(state): State<Arc<TtydState>>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    if !state.token_ok.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(serde_json::json!({ "token": TOKEN })).into_response()
}

async fn ws_handler(State(state): State<Arc<TtydState>>, ws: WebSocketUpgrade) -> Response {
    ws.protocols(["tty"])
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<TtydState>) {
    state.sockets_accepted.fetch_add(1, Ordering::SeqCst);
    let mut push = state.push.subscribe();

    // The handshake comes first, as text
    match socket.recv().await {
        Some(Ok(Message::Text(text))) => {
            let value = serde_json::from_str(text.as_str()).unwrap_or(serde_json::Value::Null);
            state.handshakes.lock().push(value);
        }
        _ => return,
    }
    state.open_sockets.fetch_add(1, Ordering::SeqCst);

    loop {
        if state.stall.load(Ordering::SeqCst) {
            match push.recv().await {
                Ok(Push::Close) | Ok(Push::Drop) | Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
                _ => continue,
            }
        }

        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Binary(data))) => state.frames.lock().push(data.to_vec()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            pushed = push.recv() => match pushed {
                Ok(Push::Binary(data)) => {
                    if socket.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(Push::Drop) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.open_sockets.fetch_sub(1, Ordering::SeqCst);
}

// ── Control API ─────────────────────────────────────────────────────────────

pub struct ArbiterState {
    /// When false, every route answers 404 (server without a control API).
    pub enabled: AtomicBool,
    pub check_fails: AtomicBool,
    /// Counted when a check arrives, before any delay.
    pub checks: AtomicUsize,
    pub claim_delay_ms: AtomicU64,
    pub check_delay_ms: AtomicU64,
    /// Devices that claimed, in order.
    pub claims: Mutex<Vec<String>>,
    /// Current holder: (session id, device)
    holder: Mutex<Option<(String, String)>>,
    next_id: AtomicUsize,
    pub windows: Mutex<Vec<TmuxWindow>>,
    pub pane_text: Mutex<String>,
    /// tmux POSTs received: (route, body)
    pub control_calls: Mutex<Vec<(String, serde_json::Value)>>,
}

fn window(index: u32, name: &str, active: bool) -> TmuxWindow {
    TmuxWindow {
        index,
        name: name.to_string(),
        active,
        command: name.to_string(),
    }
}

pub struct MockArbiter {
    pub addr: SocketAddr,
    pub state: Arc<ArbiterState>,
    task: JoinHandle<()>,
}

impl MockArbiter {
    pub async fn start() -> Self {
        let state = Arc::new(ArbiterState {
            enabled: AtomicBool::new(true),
            check_fails: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
            claim_delay_ms: AtomicU64::new(0),
            check_delay_ms: AtomicU64::new(0),
            claims: Mutex::new(Vec::new()),
            holder: Mutex::new(None),
            next_id: AtomicUsize::new(1),
            // Deliberately out of order
            windows: Mutex::new(vec![window(1, "logs", false), window(0, "zsh", true)]),
            pane_text: Mutex::new("$ ".to_string()),
            control_calls: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/session/claim", post(claim_handler))
            .route("/session/check/{session_id}", get(check_handler))
            .route("/tmux/windows", get(windows_handler))
            .route("/tmux/window/select", post(select_handler))
            .route("/tmux/window/new", post(new_window_handler))
            .route("/tmux/window/close", post(close_handler))
            .route("/tmux/exec", post(exec_handler))
            .route("/copy", get(copy_handler))
            .with_state(state.clone());
        let (addr, task) = serve(app).await;
        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Another device takes the session over.
    pub fn claim_as(&self, device: &str) -> String {
        claim(&self.state, device)
    }

    pub fn claims(&self) -> Vec<String> {
        self.state.claims.lock().clone()
    }

    pub fn checks(&self) -> usize {
        self.state.checks.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_check_fails(&self, fails: bool) {
        self.state.check_fails.store(fails, Ordering::SeqCst);
    }

    /// Hold every claim response for `delay`.
    pub fn set_claim_delay(&self, delay: Duration) {
        self.state
            .claim_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every check response for `delay`. The holder is read afterwards.
    pub fn set_check_delay(&self, delay: Duration) {
        self.state
            .check_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn windows(&self) -> Vec<TmuxWindow> {
        self.state.windows.lock().clone()
    }

    pub fn control_calls(&self) -> Vec<(String, serde_json::Value)> {
        self.state.control_calls.lock().clone()
    }

    pub fn set_pane_text(&self, text: &str) {
        *self.state.pane_text.lock() = text.to_string();
    }
}

async fn delay(ms: &AtomicU64) {
    let ms = ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

impl Drop for MockArbiter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn claim(state: &ArbiterState, device: &str) -> String {
    let session_id = format!("s{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    state.claims.lock().push(device.to_string());
    *state.holder.lock() = Some((session_id.clone(), device.to_string()));
    session_id
}

async fn claim_handler(
    State(state): State<Arc<ArbiterState>>,
    Json(req): Json<ClaimRequest>,
) -> Response {
    if !state.enabled.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    delay(&state.claim_delay_ms).await;
    let session_id = claim(&state, &req.device);
    Json(ClaimResponse { session_id }).into_response()
}

async fn check_handler(
    State(state): State<Arc<ArbiterState>>,
    Path(session_id): Path<String>,
) -> Response {
    state.checks.fetch_add(1, Ordering::SeqCst);
    delay(&state.check_delay_ms).await;
    if !state.enabled.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.check_fails.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let holder = state.holder.lock().clone();
    let status = match holder {
        Some((id, _)) if id == session_id => SessionStatus {
            active: true,
            current_device: None,
        },
        Some((_, device)) => SessionStatus {
            active: false,
            current_device: Some(device),
        },
        None => SessionStatus {
            active: false,
            current_device: None,
        },
    };
    Json(status).into_response()
}

fn record(state: &ArbiterState, route: &str, body: impl serde::Serialize) {
    let body = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
    state.control_calls.lock().push((route.to_string(), body));
}

async fn windows_handler(State(state): State<Arc<ArbiterState>>) -> Response {
    if !state.enabled.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let windows = state.windows.lock().clone();
    Json(TmuxWindowsResponse { windows }).into_response()
}

async fn select_handler(
    State(state): State<Arc<ArbiterState>>,
    Json(req): Json<WindowIndexRequest>,
) -> Response {
    record(&state, "select", &req);
    let mut windows = state.windows.lock();
    if !windows.iter().any(|w| w.index == req.index) {
        return StatusCode::NOT_FOUND.into_response();
    }
    for w in windows.iter_mut() {
        w.active = w.index == req.index;
    }
    StatusCode::OK.into_response()
}

async fn new_window_handler(
    State(state): State<Arc<ArbiterState>>,
    Json(req): Json<NewWindowRequest>,
) -> Response {
    record(&state, "new", &req);
    let mut windows = state.windows.lock();
    let index = windows.iter().map(|w| w.index + 1).max().unwrap_or(0);
    for w in windows.iter_mut() {
        w.active = false;
    }
    windows.push(window(index, req.command.as_deref().unwrap_or("zsh"), true));
    StatusCode::OK.into_response()
}

async fn close_handler(
    State(state): State<Arc<ArbiterState>>,
    Json(req): Json<WindowIndexRequest>,
) -> Response {
    record(&state, "close", &req);
    state.windows.lock().retain(|w| w.index != req.index);
    StatusCode::OK.into_response()
}

async fn exec_handler(
    State(state): State<Arc<ArbiterState>>,
    Json(req): Json<ExecRequest>,
) -> Response {
    record(&state, "exec", &req);
    StatusCode::OK.into_response()
}

async fn copy_handler(State(state): State<Arc<ArbiterState>>) -> Response {
    let text = state.pane_text.lock().clone();
    Json(CopyResponse { text }).into_response()
}

use crate::api::TokenResponse;
use crate::client::config::ClientConfig;
use crate::client::types::{TransportError, TransportEvent, TransportPhase};
use crate::frame::{self, ServerFrame};
use crate::types::TerminalSize;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

/// WebSocket subprotocol ttyd insists on.
pub const SUBPROTOCOL: &str = "tty";
/// Upper bound for the reconnect backoff.
pub const MAX_BACKOFF_SECS: u64 = 30;

/// Receives what the transport produces.
///
/// Called from the transport's tokio tasks; implementations must not block.
/// Events arrive in order and never while the transport's state lock is
/// held, so a handler may call back into the `TransportClient`.
pub trait TransportHandler: Send + Sync + 'static {
    /// Terminal output bytes, exactly as the server sent them.
    fn on_output(&self, data: &[u8]);
    /// Lifecycle notification.
    fn on_event(&self, event: TransportEvent);
}

/// Backoff before reconnect attempt number `attempt` (0-based):
/// `min(2^attempt, 30)` seconds.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

#[derive(Clone)]
struct Endpoint {
    host: String,
    port: u16,
    default_size: TerminalSize,
}

struct Inner {
    phase: TransportPhase,
    endpoint: Option<Endpoint>,
    reconnect_enabled: bool,
    reconnect_attempt: u32,
    pending_size: Option<TerminalSize>,
    /// Bumped by `connect` and `disconnect`. Delayed work compares against it.
    generation: u64,
    /// Bumped per opened socket so a failure is handled once.
    socket_id: u64,
    outbound: Option<async_channel::Sender<Message>>,
    socket_tasks: Vec<AbortHandle>,
    reconnect_task: Option<AbortHandle>,
    /// Events waiting for `deliver_events`.
    events: Vec<TransportEvent>,
}

impl Inner {
    /// Drop the current socket (if any) and cancel a pending reconnect.
    ///
    /// The writer task is not aborted: it drains the queued close frame and
    /// exits once the outbound channel is closed.
    fn teardown(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        for task in self.socket_tasks.drain(..) {
            task.abort();
        }
        if let Some(tx) = self.outbound.take() {
            let _ = tx.try_send(Message::Close(None));
            tx.close();
        }
    }
}

struct Shared<H: TransportHandler> {
    config: ClientConfig,
    http: reqwest::Client,
    runtime: Handle,
    handler: Arc<H>,
    title: watch::Sender<String>,
    inner: Mutex<Inner>,
    /// Serializes delivery so queued events reach the handler in order.
    delivery: Mutex<()>,
}

/// One ttyd connection to one `(host, port)` endpoint.
///
/// Cheap to clone; all clones drive the same socket. Token fetch, handshake,
/// framing, keepalive and reconnect-with-backoff live here. Output bytes and
/// lifecycle events go to the `TransportHandler`.
pub struct TransportClient<H: TransportHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: TransportHandler> Clone for TransportClient<H> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<H: TransportHandler> TransportClient<H> {
    pub fn new(config: ClientConfig, runtime: Handle, handler: Arc<H>) -> Self {
        let (title, _) = watch::channel(String::new());
        Self {
            shared: Arc::new(Shared {
                config,
                http: reqwest::Client::new(),
                runtime,
                handler,
                title,
                inner: Mutex::new(Inner {
                    phase: TransportPhase::Idle,
                    endpoint: None,
                    reconnect_enabled: false,
                    reconnect_attempt: 0,
                    pending_size: None,
                    generation: 0,
                    socket_id: 0,
                    outbound: None,
                    socket_tasks: Vec::new(),
                    reconnect_task: None,
                    events: Vec::new(),
                }),
                delivery: Mutex::new(()),
            }),
        }
    }

    /// Connect to `host:port`, replacing any existing socket.
    ///
    /// 1. GET /token
    /// 2. Open ws://host:port/ws with the `tty` subprotocol
    /// 3. Send the handshake with the staged size, or `default_size`
    ///
    /// A failure here is returned to the caller and does not schedule a
    /// reconnect; only a socket that drops after opening is retried.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        default_size: TerminalSize,
    ) -> Result<(), TransportError> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            inner.teardown();
            inner.generation += 1;
            inner.reconnect_enabled = true;
            inner.reconnect_attempt = 0;
            inner.endpoint = Some(Endpoint {
                host: host.to_string(),
                port,
                default_size,
            });
            inner.phase = TransportPhase::FetchingToken;
            inner.generation
        };
        log::info!("Connecting to ttyd at {}:{}", host, port);
        self.shared.open(generation, false).await
    }

    /// Queue terminal input. Silently dropped unless the socket is open.
    pub fn send_input(&self, data: &[u8]) {
        let inner = self.shared.inner.lock();
        if inner.phase != TransportPhase::Open {
            return;
        }
        if let Some(tx) = &inner.outbound {
            let _ = tx.try_send(Message::Binary(frame::encode_input(data).into()));
        }
    }

    /// Record the terminal size for the next handshake and, if open, send it now.
    pub fn send_resize(&self, columns: u16, rows: u16) {
        let size = TerminalSize::new(columns, rows);
        let mut inner = self.shared.inner.lock();
        inner.pending_size = Some(size);
        if inner.phase != TransportPhase::Open {
            return;
        }
        if let Some(tx) = &inner.outbound {
            let _ = tx.try_send(Message::Binary(frame::encode_resize(size).into()));
        }
    }

    /// Close the socket and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        inner.reconnect_enabled = false;
        inner.generation += 1;
        inner.teardown();
        if !matches!(inner.phase, TransportPhase::Idle | TransportPhase::Closed) {
            log::info!("ttyd transport closed");
        }
        inner.phase = TransportPhase::Closed;
    }

    pub fn phase(&self) -> TransportPhase {
        self.shared.inner.lock().phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == TransportPhase::Open
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.inner.lock().reconnect_attempt
    }

    /// Current generation. Every event a later socket reports carries a
    /// larger one.
    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    pub fn pending_size(&self) -> Option<TerminalSize> {
        self.shared.inner.lock().pending_size
    }

    /// Last window title sent by the server.
    pub fn title(&self) -> String {
        self.shared.title.borrow().clone()
    }

    pub fn subscribe_title(&self) -> watch::Receiver<String> {
        self.shared.title.subscribe()
    }
}

impl<H: TransportHandler> Shared<H> {
    /// Run one connection attempt for `generation`.
    async fn open(self: &Arc<Self>, generation: u64, reconnect: bool) -> Result<(), TransportError> {
        let endpoint = {
            let inner = self.inner.lock();
            if inner.generation != generation {
                return Err(TransportError::Superseded);
            }
            inner.endpoint.clone().ok_or(TransportError::Superseded)?
        };

        let result = self.establish(generation, &endpoint, reconnect).await;
        if let Err(e) = &result {
            let mut inner = self.inner.lock();
            if *e != TransportError::Superseded && inner.generation == generation {
                log::warn!(
                    "Connection to ttyd at {}:{} failed: {}",
                    endpoint.host,
                    endpoint.port,
                    e
                );
                inner.phase = TransportPhase::Disconnected;
            }
        }
        result
    }

    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        endpoint: &Endpoint,
        reconnect: bool,
    ) -> Result<(), TransportError> {
        // Step 1: one-time auth token
        let token = self.fetch_token(endpoint).await?;

        let size = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Err(TransportError::Superseded);
            }
            inner.phase = TransportPhase::Handshaking;
            inner.pending_size.unwrap_or(endpoint.default_size)
        };

        // Step 2: open the socket
        let url = format!("ws://{}:{}/ws", endpoint.host, endpoint.port);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("invalid URL {}: {}", url, e)))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Socket(format!("WebSocket connect failed: {}", e)))?;
        let (mut ws_write, ws_read) = ws_stream.split();

        // Step 3: handshake, before any framed traffic
        ws_write
            .send(Message::Text(frame::encode_handshake(&token, size).into()))
            .await
            .map_err(|e| TransportError::Handshake(format!("failed to send handshake: {}", e)))?;

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return Err(TransportError::Superseded);
        }

        inner.phase = TransportPhase::Open;
        inner.reconnect_attempt = 0;
        inner.socket_id += 1;
        let socket_id = inner.socket_id;

        let (tx, rx) = async_channel::unbounded::<Message>();
        // A resize staged while the handshake was in flight still has to reach the server.
        if let Some(staged) = inner.pending_size.take().filter(|staged| *staged != size) {
            let _ = tx.try_send(Message::Binary(frame::encode_resize(staged).into()));
        }

        let pong_pending = Arc::new(AtomicBool::new(false));
        self.runtime
            .spawn(self.clone().write_loop(generation, socket_id, ws_write, rx));
        let reader = self.runtime.spawn(self.clone().read_loop(
            generation,
            socket_id,
            ws_read,
            pong_pending.clone(),
        ));
        let keepalive = self.runtime.spawn(self.clone().keepalive_loop(
            generation,
            socket_id,
            tx.clone(),
            pong_pending,
        ));
        inner.socket_tasks = vec![reader.abort_handle(), keepalive.abort_handle()];
        inner.outbound = Some(tx);

        log::info!(
            "Connected to ttyd at {}:{} ({}x{})",
            endpoint.host,
            endpoint.port,
            size.columns,
            size.rows
        );
        inner
            .events
            .push(TransportEvent::Opened { generation, reconnect });
        drop(inner);
        self.deliver_events();
        Ok(())
    }

    async fn fetch_token(&self, endpoint: &Endpoint) -> Result<String, TransportError> {
        let url = format!("http://{}:{}/token", endpoint.host, endpoint.port);
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| TransportError::TokenFetch(format!("cannot reach {}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(TransportError::TokenFetch(format!("HTTP {}", resp.status())));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::TokenFetch(format!("invalid token response: {}", e)))?;
        Ok(body.token)
    }

    async fn write_loop(
        self: Arc<Self>,
        generation: u64,
        socket_id: u64,
        mut ws_write: WsWrite,
        rx: async_channel::Receiver<Message>,
    ) {
        while let Ok(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_write.send(msg).await {
                if !closing {
                    self.handle_failure(generation, socket_id, format!("write failed: {}", e));
                }
                return;
            }
            if closing {
                break;
            }
        }
        let _ = ws_write.close().await;
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        socket_id: u64,
        mut ws_read: WsRead,
        pong_pending: Arc<AtomicBool>,
    ) {
        let reason = loop {
            match ws_read.next().await {
                Some(Ok(Message::Binary(data))) => self.dispatch(&data),
                // ttyd may send text frames with the same tag scheme
                Some(Ok(Message::Text(text))) => self.dispatch(text.as_bytes()),
                Some(Ok(Message::Pong(_))) => pong_pending.store(false, Ordering::Release),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(close))) => {
                    break format!("server closed connection ({:?})", close);
                }
                Some(Err(e)) => break format!("receive failed: {}", e),
                None => break "stream ended".to_string(),
            }
        };
        self.handle_failure(generation, socket_id, reason);
    }

    async fn keepalive_loop(
        self: Arc<Self>,
        generation: u64,
        socket_id: u64,
        outbound: async_channel::Sender<Message>,
        pong_pending: Arc<AtomicBool>,
    ) {
        let mut interval = tokio::time::interval(self.config.keepalive_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if pong_pending.swap(true, Ordering::AcqRel) {
                self.handle_failure(generation, socket_id, "keepalive ping not answered".into());
                return;
            }
            // Write errors surface through the writer task.
            if outbound.send(Message::Ping(Vec::new().into())).await.is_err() {
                return;
            }
        }
    }

    fn dispatch(&self, data: &[u8]) {
        match frame::decode(data) {
            Some(ServerFrame::Output(payload)) => self.handler.on_output(payload),
            Some(ServerFrame::Title(title)) => {
                self.title.send_replace(title.to_string());
            }
            Some(ServerFrame::Preferences(_)) => log::trace!("Ignoring preferences frame"),
            Some(ServerFrame::Unknown(tag)) => log::debug!("Unknown frame tag: {:#04x}", tag),
            None => log::trace!("Dropping short or undecodable frame ({} bytes)", data.len()),
        }
    }

    /// Hand queued events to the handler, outside the state lock.
    fn deliver_events(&self) {
        let _delivery = self.delivery.lock();
        loop {
            let events = std::mem::take(&mut self.inner.lock().events);
            if events.is_empty() {
                return;
            }
            for event in events {
                self.handler.on_event(event);
            }
        }
    }

    /// Common path for receive errors, write errors and missed pings.
    fn handle_failure(self: &Arc<Self>, generation: u64, socket_id: u64, reason: String) {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.socket_id != socket_id
            || inner.phase != TransportPhase::Open
        {
            return;
        }

        log::warn!("ttyd connection lost: {}", reason);
        inner.phase = TransportPhase::Disconnected;
        inner.teardown();
        inner
            .events
            .push(TransportEvent::Disconnected { generation, reason });

        if inner.reconnect_enabled {
            self.schedule_reconnect(&mut inner, generation);
        }
        drop(inner);
        self.deliver_events();
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, generation: u64) {
        let attempt = inner.reconnect_attempt;
        let delay = reconnect_delay(attempt);
        inner.reconnect_attempt = attempt.saturating_add(1);
        inner.phase = TransportPhase::ReconnectWait;

        log::info!(
            "Reconnecting in {}s (attempt {})",
            delay.as_secs(),
            attempt + 1
        );
        inner.events.push(TransportEvent::ReconnectScheduled {
            generation,
            attempt,
            delay,
        });

        let shared = self.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.reconnect(generation).await;
        });
        inner.reconnect_task = Some(task.abort_handle());
    }

    async fn reconnect(self: Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if !inner.reconnect_enabled
                || inner.generation != generation
                || inner.phase != TransportPhase::ReconnectWait
            {
                log::debug!("Skipping stale reconnect for generation {}", generation);
                return;
            }
            inner.phase = TransportPhase::FetchingToken;
        }

        match self.open(generation, true).await {
            Ok(()) | Err(TransportError::Superseded) => {}
            Err(_) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.reconnect_enabled && inner.generation == generation {
                        self.schedule_reconnect(&mut inner, generation);
                    }
                }
                self.deliver_events();
            }
        }
    }
}

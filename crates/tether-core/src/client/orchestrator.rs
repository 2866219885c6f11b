use crate::api::SessionStatus;
use crate::client::arbiter::SessionArbiter;
use crate::client::config::{ClientConfig, ConnectionTarget};
use crate::client::control::ControlClient;
use crate::client::transport::{TransportClient, TransportHandler};
use crate::client::types::{
    ArbiterError, ConnectionEvent, ConnectionSnapshot, SessionHandle, TransportError,
    TransportEvent, TransportPhase,
};
use crate::types::{ConnectionState, KickInfo};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Everything that can change an orchestrator's state, in arrival order.
enum Event {
    Connect,
    Disconnect,
    Reclaim,
    Claimed {
        epoch: u64,
        session: Option<SessionHandle>,
    },
    ConnectFailed {
        epoch: u64,
        error: TransportError,
    },
    Checked {
        poll: u64,
        session_id: String,
        result: Result<SessionStatus, ArbiterError>,
    },
    Transport(TransportEvent),
}

/// Routes transport callbacks into the orchestrator's queue.
struct ForwardingHandler {
    events: async_channel::Sender<Event>,
    /// Current output subscriber. Output is discarded while there is none.
    output: Mutex<Option<async_channel::Sender<Vec<u8>>>>,
}

impl ForwardingHandler {
    fn subscribe_output(&self) -> async_channel::Receiver<Vec<u8>> {
        let (tx, rx) = async_channel::unbounded();
        *self.output.lock() = Some(tx);
        rx
    }
}

impl TransportHandler for ForwardingHandler {
    fn on_output(&self, data: &[u8]) {
        let mut output = self.output.lock();
        if let Some(tx) = output.as_ref() {
            if tx.try_send(data.to_vec()).is_err() {
                log::debug!("Output subscriber went away");
                *output = None;
            }
        }
    }

    fn on_event(&self, event: TransportEvent) {
        let _ = self.events.try_send(Event::Transport(event));
    }
}

/// Claim → connect → poll → kick/reclaim lifecycle for one remote target.
///
/// All state lives in a single actor task; the methods here only enqueue
/// commands or read the published snapshot, so they never block and may be
/// called from any thread.
pub struct ConnectionOrchestrator {
    id: String,
    target: ConnectionTarget,
    events: async_channel::Sender<Event>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    transport: TransportClient<ForwardingHandler>,
    handler: Arc<ForwardingHandler>,
    control: ControlClient,
    actor: AbortHandle,
}

impl ConnectionOrchestrator {
    /// Create the orchestrator and spawn its actor on `runtime`.
    ///
    /// State changes are reported on `notify` tagged with `id`.
    pub fn new(
        id: impl Into<String>,
        target: ConnectionTarget,
        device_name: impl Into<String>,
        config: ClientConfig,
        runtime: Handle,
        notify: async_channel::Sender<ConnectionEvent>,
    ) -> Self {
        let id = id.into();
        let (events_tx, events_rx) = async_channel::unbounded();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let handler = Arc::new(ForwardingHandler {
            events: events_tx.clone(),
            output: Mutex::new(None),
        });
        let transport = TransportClient::new(config.clone(), runtime.clone(), handler.clone());
        let arbiter = SessionArbiter::new(target.api_base_url(), config.request_timeout);
        let control = ControlClient::new(target.api_base_url(), config.request_timeout);

        let actor = Actor {
            id: id.clone(),
            target: target.clone(),
            device_name: device_name.into(),
            config,
            runtime: runtime.clone(),
            transport: transport.clone(),
            arbiter,
            events: events_tx.clone(),
            snapshot: snapshot_tx,
            notify,
            state: ConnectionState::Disconnected,
            kick: None,
            session: None,
            epoch: 0,
            want_connected: false,
            transport_generation: None,
            generation_floor: 0,
            connect_task: None,
            poll_task: None,
            poll_epoch: 0,
        };
        let task = runtime.spawn(actor.run(events_rx));

        Self {
            id,
            target,
            events: events_tx,
            snapshot: snapshot_rx,
            transport,
            handler,
            control,
            actor: task.abort_handle(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Claim the session and connect. Ignored while `Kicked`; use `reclaim`.
    pub fn connect(&self) {
        let _ = self.events.try_send(Event::Connect);
    }

    /// Drop the connection. Reconnect timers are cancelled before this returns.
    pub fn disconnect(&self) {
        self.transport.disconnect();
        let _ = self.events.try_send(Event::Disconnect);
    }

    /// Leave `Kicked`, take the session back and connect.
    pub fn reclaim(&self) {
        let _ = self.events.try_send(Event::Reclaim);
    }

    pub fn send_input(&self, data: &[u8]) {
        self.transport.send_input(data);
    }

    pub fn send_resize(&self, columns: u16, rows: u16) {
        self.transport.send_resize(columns, rows);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn kick_info(&self) -> Option<KickInfo> {
        self.snapshot.borrow().kick.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to terminal output, in arrival order.
    ///
    /// Replaces the previous subscriber, whose channel closes. Output that
    /// arrives while nobody is subscribed is discarded.
    pub fn output(&self) -> async_channel::Receiver<Vec<u8>> {
        self.handler.subscribe_output()
    }

    pub fn title(&self) -> String {
        self.transport.title()
    }

    pub fn subscribe_title(&self) -> watch::Receiver<String> {
        self.transport.subscribe_title()
    }

    /// tmux helpers on the same control API as the session routes.
    pub fn control(&self) -> &ControlClient {
        &self.control
    }

    pub fn transport_phase(&self) -> TransportPhase {
        self.transport.phase()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.transport.reconnect_attempt()
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        self.actor.abort();
        self.transport.disconnect();
    }
}

struct Actor {
    id: String,
    target: ConnectionTarget,
    device_name: String,
    config: ClientConfig,
    runtime: Handle,
    transport: TransportClient<ForwardingHandler>,
    arbiter: SessionArbiter,
    events: async_channel::Sender<Event>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    notify: async_channel::Sender<ConnectionEvent>,

    state: ConnectionState,
    kick: Option<KickInfo>,
    session: Option<SessionHandle>,
    /// Bumped by every connect and disconnect; tags claim/connect results.
    epoch: u64,
    /// True between `connect()` and the next disconnect, kick or failure.
    want_connected: bool,
    /// Transport generation of the socket this orchestrator is tracking.
    transport_generation: Option<u64>,
    /// Sockets at or below this generation belong to a dropped connection.
    generation_floor: u64,
    connect_task: Option<AbortHandle>,
    poll_task: Option<AbortHandle>,
    /// Bumped whenever polling starts or stops; tags check results.
    poll_epoch: u64,
}

impl Actor {
    async fn run(mut self, events: async_channel::Receiver<Event>) {
        while let Ok(event) = events.recv().await {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Connect => self.start_connect(),
            Event::Disconnect => self.disconnect(),
            Event::Reclaim => {
                log::info!("[{}] Reclaiming session", self.id);
                self.kick = None;
                self.set_state(ConnectionState::Disconnected);
                self.start_connect();
            }
            Event::Claimed { epoch, session } => {
                if epoch == self.epoch && self.want_connected {
                    self.session = session;
                    self.publish();
                    if self.state == ConnectionState::Connected && self.poll_task.is_none() {
                        self.start_polling();
                    }
                }
            }
            Event::ConnectFailed { epoch, error } => self.on_connect_failed(epoch, error),
            Event::Checked {
                poll,
                session_id,
                result,
            } => self.on_checked(poll, session_id, result),
            Event::Transport(event) => self.on_transport(event),
        }
    }

    fn start_connect(&mut self) {
        if self.target.host.is_empty() {
            log::warn!("[{}] No host configured, not connecting", self.id);
            return;
        }
        if self.state == ConnectionState::Kicked {
            log::info!("[{}] Session was taken over; reclaim to connect", self.id);
            return;
        }

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.stop_polling();
        // A pending auto-reconnect must not open a socket this attempt did not ask for.
        self.drop_transport();
        self.epoch += 1;
        self.session = None;
        self.kick = None;
        self.want_connected = true;
        self.set_state(ConnectionState::Connecting);

        let epoch = self.epoch;
        let arbiter = self.arbiter.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();
        let device = self.device_name.clone();
        let target = self.target.clone();
        let id = self.id.clone();

        let task = self.runtime.spawn(async move {
            let session = match arbiter.claim(&device).await {
                Ok(session_id) => {
                    log::info!("[{}] Claimed session {}", id, session_id);
                    Some(SessionHandle { session_id })
                }
                Err(e) => {
                    // Servers without arbitration still get a connection, just unmanaged.
                    log::warn!("[{}] {}; connecting without session tracking", id, e);
                    None
                }
            };
            let _ = events.send(Event::Claimed { epoch, session }).await;

            if let Err(error) = transport
                .connect(&target.host, target.port, target.size)
                .await
            {
                let _ = events.send(Event::ConnectFailed { epoch, error }).await;
            }
        });
        self.connect_task = Some(task.abort_handle());
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.stop_polling();
        self.epoch += 1;
        self.session = None;
        self.want_connected = false;
        self.drop_transport();

        if self.state == ConnectionState::Kicked {
            // Keep the kick visible
            self.publish();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn on_connect_failed(&mut self, epoch: u64, error: TransportError) {
        if epoch != self.epoch || error == TransportError::Superseded {
            return;
        }
        log::warn!("[{}] Connection failed: {}", self.id, error);
        self.want_connected = false;
        self.session = None;
        if self.state != ConnectionState::Kicked {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                generation,
                reconnect,
            } => {
                if !self.want_connected || generation <= self.generation_floor {
                    log::trace!("[{}] Ignoring open of stale socket", self.id);
                    return;
                }
                self.transport_generation = Some(generation);
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Disconnected
                ) {
                    if reconnect {
                        log::info!("[{}] Reconnected", self.id);
                    }
                    self.set_state(ConnectionState::Connected);
                    self.start_polling();
                }
            }
            TransportEvent::Disconnected { generation, reason } => {
                if self.transport_generation != Some(generation) {
                    return;
                }
                self.stop_polling();
                if self.state != ConnectionState::Kicked {
                    log::info!("[{}] Connection lost: {}", self.id, reason);
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TransportEvent::ReconnectScheduled {
                generation,
                attempt,
                delay,
            } => {
                if self.transport_generation != Some(generation) || !self.want_connected {
                    return;
                }
                let _ = self.notify.try_send(ConnectionEvent::Reconnecting {
                    connection_id: self.id.clone(),
                    attempt,
                    delay,
                });
            }
        }
    }

    /// Close the transport and stop tracking everything it opened so far.
    fn drop_transport(&mut self) {
        self.transport.disconnect();
        self.generation_floor = self.transport.generation();
        self.transport_generation = None;
    }

    fn start_polling(&mut self) {
        self.stop_polling();
        let Some(session) = &self.session else {
            return;
        };

        let poll = self.poll_epoch;
        let session_id = session.session_id.clone();
        let arbiter = self.arbiter.clone();
        let events = self.events.clone();
        let interval = self.config.session_poll_interval;

        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let result = arbiter.check(&session_id).await;
                let checked = Event::Checked {
                    poll,
                    session_id: session_id.clone(),
                    result,
                };
                if events.send(checked).await.is_err() {
                    break;
                }
            }
        });
        self.poll_task = Some(task.abort_handle());
    }

    fn stop_polling(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.poll_epoch += 1;
    }

    fn on_checked(
        &mut self,
        poll: u64,
        session_id: String,
        result: Result<SessionStatus, ArbiterError>,
    ) {
        let current = self.session.as_ref().map(|s| s.session_id.as_str());
        if poll != self.poll_epoch
            || self.state != ConnectionState::Connected
            || current != Some(session_id.as_str())
        {
            log::trace!("[{}] Ignoring stale session check", self.id);
            return;
        }

        match result {
            Err(e) => log::debug!("[{}] {}; will retry next tick", self.id, e),
            Ok(status) if status.active => {}
            Ok(status) => self.kicked(status.current_device),
        }
    }

    fn kicked(&mut self, evicting_device: Option<String>) {
        log::warn!(
            "[{}] Session taken over by {}",
            self.id,
            evicting_device.as_deref().unwrap_or("another device")
        );
        self.stop_polling();
        self.epoch += 1;
        self.session = None;
        self.want_connected = false;
        self.kick = Some(KickInfo { evicting_device });
        self.drop_transport();
        self.set_state(ConnectionState::Kicked);
    }

    fn set_state(&mut self, state: ConnectionState) {
        let changed = self.state != state;
        self.state = state;
        self.publish();
        if changed {
            log::debug!("[{}] State -> {}", self.id, state.display_name());
            let _ = self.notify.try_send(ConnectionEvent::StatusChanged {
                connection_id: self.id.clone(),
                state,
                kick: self.kick.clone(),
            });
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(ConnectionSnapshot {
            state: self.state,
            kick: self.kick.clone(),
            session_id: self.session.as_ref().map(|s| s.session_id.clone()),
        });
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.transport.disconnect();
    }
}

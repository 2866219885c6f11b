pub mod arbiter;
pub mod config;
pub mod control;
pub mod orchestrator;
pub mod registry;
pub mod transport;
pub mod types;

pub use arbiter::SessionArbiter;
pub use config::{ClientConfig, ConnectionTarget, DeviceProfile};
pub use control::ControlClient;
pub use orchestrator::ConnectionOrchestrator;
pub use registry::ConnectionRegistry;
pub use transport::{reconnect_delay, TransportClient, TransportHandler};
pub use types::{
    ArbiterError, ConnectionEvent, ConnectionSnapshot, ControlError, SessionHandle,
    TransportError, TransportEvent, TransportPhase,
};

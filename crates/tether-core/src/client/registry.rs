use crate::client::config::{ClientConfig, DeviceProfile};
use crate::client::orchestrator::ConnectionOrchestrator;
use crate::client::types::ConnectionEvent;
use crate::types::TerminalSize;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;

/// One orchestrator per device profile, created on first use.
///
/// Every orchestrator reports on the same event channel; the receiver is
/// handed out by `new`.
pub struct ConnectionRegistry {
    runtime: Handle,
    device_name: String,
    config: ClientConfig,
    event_tx: async_channel::Sender<ConnectionEvent>,
    connections: RwLock<HashMap<String, Arc<ConnectionOrchestrator>>>,
}

impl ConnectionRegistry {
    pub fn new(
        runtime: Handle,
        device_name: impl Into<String>,
        config: ClientConfig,
    ) -> (Self, async_channel::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = async_channel::unbounded();
        let registry = Self {
            runtime,
            device_name: device_name.into(),
            config,
            event_tx,
            connections: RwLock::new(HashMap::new()),
        };
        (registry, event_rx)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The orchestrator for `profile`, creating it if needed.
    ///
    /// `size` only applies to a newly created orchestrator.
    pub fn connection_for(
        &self,
        profile: &DeviceProfile,
        size: TerminalSize,
    ) -> Arc<ConnectionOrchestrator> {
        if let Some(existing) = self.connections.read().get(&profile.id) {
            return existing.clone();
        }

        let mut connections = self.connections.write();
        connections
            .entry(profile.id.clone())
            .or_insert_with(|| {
                log::info!(
                    "Creating connection for profile '{}' ({}:{})",
                    profile.name,
                    profile.host,
                    profile.ttyd_port
                );
                Arc::new(ConnectionOrchestrator::new(
                    profile.id.clone(),
                    profile.target(size),
                    self.device_name.clone(),
                    self.config.clone(),
                    self.runtime.clone(),
                    self.event_tx.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectionOrchestrator>> {
        self.connections.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Drop the orchestrator for `profile` if its endpoint changed.
    ///
    /// Returns true when an orchestrator was discarded; the next
    /// `connection_for` builds a fresh one.
    pub fn update_profile(&self, profile: &DeviceProfile) -> bool {
        let stale = {
            let connections = self.connections.read();
            match connections.get(&profile.id) {
                Some(existing) => existing.target().differs_from(profile),
                None => false,
            }
        };
        if stale {
            log::info!(
                "Connection parameters for '{}' changed, dropping old connection",
                profile.name
            );
            self.remove(&profile.id);
        }
        stale
    }

    /// Disconnect and discard one orchestrator.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.connections.write().remove(id);
        match removed {
            Some(orchestrator) => {
                orchestrator.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect and discard every orchestrator.
    pub fn disconnect_all(&self) {
        let drained: Vec<_> = self.connections.write().drain().collect();
        for (id, orchestrator) in drained {
            log::debug!("Disconnecting {}", id);
            orchestrator.disconnect();
        }
    }
}

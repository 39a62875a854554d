// Cluster topology model
//
// The host registry is the single authority on which endpoints exist and
// what state they are in. Mutations are serialized through one lock so
// up/down transitions fire their events at most once per actual change;
// readers get cheap snapshots.

pub mod host;
pub mod token;

pub use host::{Host, HostDistance, HostState};
pub use token::{ReplicaOracle, StaticReplicaMap, Token, TokenRange, TokenRing};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Host lifecycle notifications, in transition order.
#[derive(Debug, Clone)]
pub enum HostEvent {
    Added(Arc<Host>),
    Removed(Arc<Host>),
    Up(Arc<Host>),
    Down(Arc<Host>),
}

impl HostEvent {
    pub fn host(&self) -> &Arc<Host> {
        match self {
            HostEvent::Added(host)
            | HostEvent::Removed(host)
            | HostEvent::Up(host)
            | HostEvent::Down(host) => host,
        }
    }
}

/// Process-wide map of address to host. Constructed once per session, torn
/// down on shutdown.
pub struct HostRegistry {
    hosts: RwLock<HashMap<SocketAddr, Arc<Host>>>,
    /// Serializes state transitions so each Up/Down fires exactly once.
    transition: Mutex<()>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
}

impl HostRegistry {
    pub fn new() -> (Arc<HostRegistry>, mpsc::UnboundedReceiver<HostEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(HostRegistry {
                hosts: RwLock::new(HashMap::new()),
                transition: Mutex::new(()),
                event_tx,
            }),
            event_rx,
        )
    }

    /// Add a host if absent; returns the canonical instance either way.
    pub fn add(&self, address: SocketAddr) -> Arc<Host> {
        if let Some(existing) = self.hosts.read().get(&address) {
            return Arc::clone(existing);
        }
        let _serialized = self.transition.lock();
        let mut hosts = self.hosts.write();
        if let Some(existing) = hosts.get(&address) {
            return Arc::clone(existing);
        }
        let host = Host::new(address);
        hosts.insert(address, Arc::clone(&host));
        drop(hosts);
        debug!(%address, "host added");
        let _ = self.event_tx.send(HostEvent::Added(Arc::clone(&host)));
        host
    }

    /// Remove a host entirely; its pool must be drained by the listener.
    pub fn remove(&self, address: SocketAddr) -> Option<Arc<Host>> {
        let _serialized = self.transition.lock();
        let removed = self.hosts.write().remove(&address)?;
        removed.transition(HostState::Removed);
        info!(%address, "host removed");
        let _ = self.event_tx.send(HostEvent::Removed(Arc::clone(&removed)));
        Some(removed)
    }

    pub fn set_up(&self, address: SocketAddr) {
        let _serialized = self.transition.lock();
        let Some(host) = self.hosts.read().get(&address).cloned() else {
            return;
        };
        if host.transition(HostState::Up) {
            info!(%address, "host is up");
            let _ = self.event_tx.send(HostEvent::Up(host));
        }
    }

    pub fn set_down(&self, address: SocketAddr) {
        let _serialized = self.transition.lock();
        let Some(host) = self.hosts.read().get(&address).cloned() else {
            return;
        };
        if host.transition(HostState::Down) {
            info!(%address, "host is down");
            let _ = self.event_tx.send(HostEvent::Down(host));
        }
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.hosts.read().get(&address).cloned()
    }

    /// Consistent snapshot of every known host.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().values().cloned().collect()
    }

    pub fn up_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .values()
            .filter(|host| host.is_up())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Reconcile against a discovery snapshot: add unknown addresses,
    /// remove ones that vanished. Returns the removed hosts so callers can
    /// drain their pools.
    pub fn reconcile(&self, discovered: &[SocketAddr]) -> Vec<Arc<Host>> {
        for address in discovered {
            self.add(*address);
        }
        let known: Vec<SocketAddr> = self.hosts.read().keys().copied().collect();
        let mut removed = Vec::new();
        for address in known {
            if !discovered.contains(&address) {
                if let Some(host) = self.remove(address) {
                    removed.push(host);
                }
            }
        }
        removed
    }
}

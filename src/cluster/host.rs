// Cluster host representation
//
// One `Host` per endpoint, owned by the registry. The host owns its
// connection pool (strong reference); the pool points back with a weak
// handle, so tearing a host down drops the whole chain.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::token::Token;
use crate::pool::HostPool;

/// Host lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Up,
    Down,
    Added,
    Removed,
}

/// The load balancer's classification of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

pub struct Host {
    address: SocketAddr,
    datacenter: RwLock<Option<String>>,
    rack: RwLock<Option<String>>,
    tokens: RwLock<Vec<Token>>,
    cassandra_version: RwLock<Option<String>>,
    state: RwLock<HostState>,
    pool: RwLock<Option<Arc<HostPool>>>,
}

impl Host {
    pub fn new(address: SocketAddr) -> Arc<Host> {
        Arc::new(Host {
            address,
            datacenter: RwLock::new(None),
            rack: RwLock::new(None),
            tokens: RwLock::new(Vec::new()),
            cassandra_version: RwLock::new(None),
            state: RwLock::new(HostState::Added),
            pool: RwLock::new(None),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn datacenter(&self) -> Option<String> {
        self.datacenter.read().clone()
    }

    pub fn rack(&self) -> Option<String> {
        self.rack.read().clone()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.read().clone()
    }

    pub fn cassandra_version(&self) -> Option<String> {
        self.cassandra_version.read().clone()
    }

    pub fn state(&self) -> HostState {
        *self.state.read()
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state(), HostState::Up)
    }

    /// Refresh discovery metadata (dc, rack, tokens, server version).
    pub fn set_metadata(
        &self,
        datacenter: Option<String>,
        rack: Option<String>,
        tokens: Vec<Token>,
        cassandra_version: Option<String>,
    ) {
        *self.datacenter.write() = datacenter;
        *self.rack.write() = rack;
        *self.tokens.write() = tokens;
        *self.cassandra_version.write() = cassandra_version;
    }

    /// Transition guard: returns true only when the state actually changed.
    /// Callers must hold the registry's transition serializer.
    pub(crate) fn transition(&self, next: HostState) -> bool {
        let mut state = self.state.write();
        if *state == next {
            return false;
        }
        if *state == HostState::Removed {
            return false;
        }
        *state = next;
        true
    }

    pub fn attach_pool(&self, pool: Arc<HostPool>) {
        *self.pool.write() = Some(pool);
    }

    pub fn pool(&self) -> Option<Arc<HostPool>> {
        self.pool.read().clone()
    }

    pub(crate) fn detach_pool(&self) -> Option<Arc<HostPool>> {
        self.pool.write().take()
    }

    #[cfg(test)]
    pub fn for_tests(address: &str, tokens: &[&str]) -> Arc<Host> {
        let host = Host::new(address.parse().unwrap());
        host.set_metadata(
            Some("dc1".to_string()),
            Some("rack1".to_string()),
            tokens.iter().filter_map(|t| Token::parse(t)).collect(),
            None,
        );
        host.transition(HostState::Up);
        host
    }

    #[cfg(test)]
    pub fn for_tests_in_dc(address: &str, datacenter: &str) -> Arc<Host> {
        let host = Host::new(address.parse().unwrap());
        host.set_metadata(
            Some(datacenter.to_string()),
            Some("rack1".to_string()),
            Vec::new(),
            None,
        );
        host.transition(HostState::Up);
        host
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("datacenter", &self.datacenter.read())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

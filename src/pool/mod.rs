// Per-host connection pools
//
// Each host owns one pool. The pool keeps between core and max connections
// for the host's distance, hands out the least-loaded Ready connection
// (round-robin on ties), grows when every connection is saturated, and
// schedules reconnection through the reconnection policy when connections
// die. Losing the last open connection marks the host Down in the registry;
// a successful reconnection marks it Up again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::cluster::{Host, HostDistance, HostRegistry};
use crate::connection::{Connection, ConnectionConfig, ConnectionState, Connector};
use crate::error::{DriverError, Result};
use crate::policy::ReconnectionPolicy;

/// Pool sizing, per distance.
#[derive(Clone)]
pub struct PoolConfig {
    pub core_local: usize,
    pub max_local: usize,
    pub core_remote: usize,
    pub max_remote: usize,
    /// Load on a connection beyond which the pool tries to grow.
    pub max_requests_per_connection: usize,
    /// Open core connections eagerly at session start.
    pub warmup: bool,
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            core_local: 2,
            max_local: 8,
            core_remote: 1,
            max_remote: 2,
            max_requests_per_connection: 1024,
            warmup: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolConfig {
    fn core_for(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.core_local,
            HostDistance::Remote => self.core_remote,
            HostDistance::Ignored => 0,
        }
    }

    fn max_for(&self, distance: HostDistance) -> usize {
        match distance {
            HostDistance::Local => self.max_local,
            HostDistance::Remote => self.max_remote,
            HostDistance::Ignored => 0,
        }
    }
}

pub struct HostPool {
    host: Weak<Host>,
    endpoint: SocketAddr,
    distance: RwLock<HostDistance>,
    connections: RwLock<Vec<Arc<Connection>>>,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    registry: Weak<HostRegistry>,
    /// Session-wide keyspace; borrows re-pin connections that drifted.
    keyspace: Arc<RwLock<Option<String>>>,
    round_robin: AtomicUsize,
    opening: AtomicUsize,
    reconnecting: AtomicBool,
    shut_down: AtomicBool,
}

impl HostPool {
    pub fn new(
        host: &Arc<Host>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        registry: &Arc<HostRegistry>,
        keyspace: Arc<RwLock<Option<String>>>,
    ) -> Arc<HostPool> {
        Arc::new(HostPool {
            host: Arc::downgrade(host),
            endpoint: host.address(),
            distance: RwLock::new(HostDistance::Local),
            connections: RwLock::new(Vec::new()),
            config,
            connector,
            reconnection_policy,
            registry: Arc::downgrade(registry),
            keyspace,
            round_robin: AtomicUsize::new(0),
            opening: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The owning host; pools only hold a weak back-reference.
    pub fn host(&self) -> Option<Arc<Host>> {
        self.host.upgrade()
    }

    pub fn distance(&self) -> HostDistance {
        *self.distance.read()
    }

    /// Reclassify the host. Ignored hosts hold no connections.
    pub async fn set_distance(self: &Arc<Self>, distance: HostDistance) {
        let previous = {
            let mut current = self.distance.write();
            let previous = *current;
            *current = distance;
            previous
        };
        if distance == HostDistance::Ignored {
            self.drain().await;
        } else if previous != distance {
            self.fill_to_core();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn total_in_flight(&self) -> usize {
        self.connections
            .read()
            .iter()
            .map(|connection| connection.in_flight())
            .sum()
    }

    /// Open core connections eagerly; returns how many are open. Partial
    /// failures are logged, total failure surfaces the last error.
    pub async fn warmup(self: &Arc<Self>) -> Result<usize> {
        let target = self.config.core_for(self.distance());
        let deficit = target.saturating_sub(self.connection_count());
        if deficit == 0 {
            return Ok(self.connection_count());
        }
        let attempts = (0..deficit).map(|_| self.open_one());
        let results = join_all(attempts).await;
        let mut last_error = None;
        for result in results {
            if let Err(error) = result {
                warn!(endpoint = %self.endpoint, %error, "warmup connection failed");
                last_error = Some(error);
            }
        }
        let open = self.connection_count();
        if open == 0 {
            if let Some(error) = last_error {
                // Keep trying in the background on the policy's schedule
                self.ensure_reconnecting();
                return Err(error);
            }
        }
        Ok(open)
    }

    /// Borrow the least-loaded Ready connection, re-pinning its keyspace if
    /// the session moved on. Saturation triggers growth and reports
    /// `Saturated`; an empty pool reports a connection error. Both make the
    /// executor advance to the next host.
    pub async fn borrow_connection(self: &Arc<Self>) -> Result<Arc<Connection>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DriverError::Shutdown);
        }
        if self.distance() == HostDistance::Ignored {
            return Err(DriverError::ConnectionClosed(format!(
                "host {} is ignored by the load-balancing policy",
                self.endpoint
            )));
        }

        let chosen = {
            let connections = self.connections.read();
            let ready: Vec<&Arc<Connection>> = connections
                .iter()
                .filter(|connection| connection.is_ready())
                .collect();
            if ready.is_empty() {
                None
            } else {
                let min_load = ready.iter().map(|c| c.in_flight()).min().unwrap_or(0);
                let tied: Vec<&&Arc<Connection>> = ready
                    .iter()
                    .filter(|c| c.in_flight() == min_load)
                    .collect();
                let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % tied.len();
                let connection = Arc::clone(tied[pick]);

                // Everything at or above the per-connection ceiling: ask for
                // one more connection, up to the distance maximum
                if min_load >= self.config.max_requests_per_connection {
                    let max = self.config.max_for(self.distance());
                    if connections.len() + self.opening.load(Ordering::SeqCst) < max {
                        self.spawn_open();
                    }
                    if min_load >= self.config.connection.version.max_stream_id() as usize {
                        None
                    } else {
                        Some(connection)
                    }
                } else {
                    Some(connection)
                }
            }
        };

        let Some(connection) = chosen else {
            if self.connection_count() == 0 {
                self.fill_to_core();
                return Err(DriverError::ConnectionClosed(format!(
                    "pool for {} has no open connections",
                    self.endpoint
                )));
            }
            return Err(DriverError::Saturated);
        };

        let wanted = self.keyspace.read().clone();
        if let Some(keyspace) = wanted {
            if connection.keyspace().as_deref() != Some(keyspace.as_str()) {
                connection.set_keyspace(&keyspace).await?;
            }
        }
        Ok(connection)
    }

    /// Close every connection cooperatively and refuse further borrows.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.drain().await;
    }

    async fn drain(self: &Arc<Self>) {
        let connections: Vec<Arc<Connection>> = self.connections.write().drain(..).collect();
        join_all(connections.iter().map(|connection| connection.close())).await;
        trace!(endpoint = %self.endpoint, closed = connections.len(), "pool drained");
    }

    /// Spawn background opens until core size is met.
    pub fn fill_to_core(self: &Arc<Self>) {
        let target = self.config.core_for(self.distance());
        let current = self.connection_count() + self.opening.load(Ordering::SeqCst);
        for _ in current..target {
            self.spawn_open();
        }
    }

    fn spawn_open(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = pool.open_one().await {
                debug!(endpoint = %pool.endpoint, %error, "pool expansion failed");
                pool.ensure_reconnecting();
            }
        });
    }

    async fn open_one(self: &Arc<Self>) -> Result<()> {
        self.opening.fetch_add(1, Ordering::SeqCst);
        let result = Connection::establish(
            self.endpoint,
            self.connector.as_ref(),
            self.config.connection.clone(),
            None,
        )
        .await;
        self.opening.fetch_sub(1, Ordering::SeqCst);

        let connection = result?;
        if self.shut_down.load(Ordering::SeqCst) || self.distance() == HostDistance::Ignored {
            connection.close().await;
            return Ok(());
        }
        self.register(connection);
        Ok(())
    }

    fn register(self: &Arc<Self>, connection: Arc<Connection>) {
        self.connections.write().push(Arc::clone(&connection));
        if let Some(registry) = self.registry.upgrade() {
            registry.set_up(self.endpoint);
        }
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut states = connection.state_changes();
            loop {
                let state = *states.borrow();
                if matches!(
                    state,
                    ConnectionState::Defunct | ConnectionState::Closing | ConnectionState::Closed
                ) {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
            if let Some(pool) = pool.upgrade() {
                pool.on_connection_down(&connection);
            }
        });
    }

    /// A connection died: drop it, mark the host Down when the pool is now
    /// empty, and kick off policy-scheduled reconnection.
    fn on_connection_down(self: &Arc<Self>, connection: &Arc<Connection>) {
        {
            let mut connections = self.connections.write();
            connections.retain(|candidate| !Arc::ptr_eq(candidate, connection));
        }
        if self.shut_down.load(Ordering::SeqCst) || self.distance() == HostDistance::Ignored {
            return;
        }
        let remaining = self.connection_count();
        debug!(endpoint = %self.endpoint, remaining, "pool lost a connection");
        if remaining == 0 {
            if let Some(registry) = self.registry.upgrade() {
                registry.set_down(self.endpoint);
            }
            self.ensure_reconnecting();
        } else {
            self.fill_to_core();
        }
    }

    /// At most one reconnection loop per pool, pacing attempts with the
    /// reconnection policy's schedule.
    fn ensure_reconnecting(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::downgrade(self);
        let mut schedule = self.reconnection_policy.new_schedule();
        tokio::spawn(async move {
            loop {
                let delay_ms = schedule.next().unwrap_or(u64::MAX);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let Some(pool) = pool.upgrade() else { return };
                if pool.shut_down.load(Ordering::SeqCst)
                    || pool.distance() == HostDistance::Ignored
                {
                    pool.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                match pool.open_one().await {
                    Ok(()) => {
                        debug!(endpoint = %pool.endpoint, "reconnection succeeded");
                        pool.reconnecting.store(false, Ordering::SeqCst);
                        pool.fill_to_core();
                        return;
                    }
                    Err(error) => {
                        trace!(endpoint = %pool.endpoint, %error, "reconnection attempt failed");
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("endpoint", &self.endpoint)
            .field("distance", &self.distance())
            .field("connections", &self.connection_count())
            .finish()
    }
}

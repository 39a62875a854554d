// Control connection
//
// One privileged connection per session. It negotiates the protocol
// version (downgrading on protocol errors until a floor), discovers the
// cluster through the local/peers catalogue, subscribes to topology,
// status and schema events, and periodically re-polls the catalogue to
// reconcile the host registry. When it dies it fails over to another Up
// host in the background.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::cluster::{HostRegistry, Token};
use crate::codec::CqlValue;
use crate::connection::{Connection, ConnectionConfig, Connector};
use crate::error::{DriverError, ErrorCode, Result};
use crate::frame::response::{Response, ResultResponse, RowsResult, ServerEvent};
use crate::frame::{ProtocolVersion, Request};
use crate::policy::{AddressTranslator, ReconnectionPolicy};

const LOCAL_QUERY: &str = "SELECT * FROM system.local";
const PEERS_QUERY: &str = "SELECT * FROM system.peers";
const EVENT_TYPES: [&str; 3] = ["TOPOLOGY_CHANGE", "STATUS_CHANGE", "SCHEMA_CHANGE"];

/// Control-connection tuning.
#[derive(Clone)]
pub struct ControlConfig {
    pub connection: ConnectionConfig,
    /// Port assumed for peers discovered without one.
    pub default_port: u16,
    /// How often the peers catalogue is re-polled.
    pub reconcile_interval: Duration,
    pub address_translator: Arc<dyn AddressTranslator>,
    pub reconnection: Arc<dyn ReconnectionPolicy>,
}

/// Resolve `host[:port]` contact points through DNS and the address
/// translator.
pub async fn resolve_contact_points(
    contact_points: &[String],
    default_port: u16,
    translator: &Arc<dyn AddressTranslator>,
) -> Result<Vec<SocketAddr>> {
    let mut resolved = Vec::new();
    for point in contact_points {
        if let Ok(addr) = point.parse::<SocketAddr>() {
            resolved.push(addr);
            continue;
        }
        let (name, port) = match point.rsplit_once(':') {
            Some((name, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    DriverError::Argument(format!("invalid port in contact point '{point}'"))
                })?;
                (name.to_string(), port)
            }
            None => (point.clone(), default_port),
        };
        let lookup_target = format!("{name}:{port}");
        match tokio::net::lookup_host(lookup_target).await {
            Ok(addrs) => {
                // Prefer IPv4, keeping one address per contact point
                let mut picked: Option<SocketAddr> = None;
                for addr in addrs {
                    if addr.is_ipv4() {
                        picked = Some(addr);
                        break;
                    }
                    picked.get_or_insert(addr);
                }
                if let Some(addr) = picked {
                    resolved.push(addr);
                }
            }
            Err(error) => {
                warn!(contact_point = point, %error, "failed to resolve contact point");
            }
        }
    }
    if resolved.is_empty() {
        return Err(DriverError::NoHostAvailable(HashMap::new()));
    }
    let mut translated = Vec::with_capacity(resolved.len());
    for addr in resolved {
        translated.push(translator.translate(addr).await);
    }
    Ok(translated)
}

pub struct ControlConnection {
    connector: Arc<dyn Connector>,
    registry: Arc<HostRegistry>,
    config: ControlConfig,
    contact_points: Vec<SocketAddr>,
    connection: RwLock<Option<Arc<Connection>>>,
    negotiated: RwLock<ProtocolVersion>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("contact_points", &self.contact_points)
            .field("negotiated", &self.negotiated)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

impl ControlConnection {
    /// Connect to the first reachable contact point, negotiate the
    /// protocol version, discover the cluster and start the event and
    /// reconcile loops.
    pub async fn init(
        contact_points: Vec<SocketAddr>,
        connector: Arc<dyn Connector>,
        registry: Arc<HostRegistry>,
        config: ControlConfig,
    ) -> Result<Arc<ControlConnection>> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let control = Arc::new(ControlConnection {
            connector,
            registry,
            negotiated: RwLock::new(config.connection.version),
            config,
            contact_points: contact_points.clone(),
            connection: RwLock::new(None),
            event_tx,
            shut_down: AtomicBool::new(false),
        });

        let mut inner_errors = HashMap::new();
        let mut connected = false;
        for endpoint in &contact_points {
            match control.connect_to(*endpoint).await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(error) => {
                    warn!(%endpoint, %error, "contact point failed");
                    inner_errors.insert(*endpoint, error);
                }
            }
        }
        if !connected {
            return Err(DriverError::NoHostAvailable(inner_errors));
        }

        control.refresh_hosts().await?;

        tokio::spawn(event_loop(Arc::downgrade(&control), event_rx));
        tokio::spawn(reconcile_loop(Arc::downgrade(&control)));
        Ok(control)
    }

    pub fn negotiated_version(&self) -> ProtocolVersion {
        *self.negotiated.read()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.connection.read().as_ref().map(|c| c.endpoint())
    }

    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Open a negotiated connection to one endpoint, register for events
    /// and install it as the current control connection.
    async fn connect_to(self: &Arc<Self>, endpoint: SocketAddr) -> Result<()> {
        let mut version = self.config.connection.version;
        let connection = loop {
            let mut config = self.config.connection.clone();
            config.version = version;
            match Connection::establish(
                endpoint,
                self.connector.as_ref(),
                config,
                Some(self.event_tx.clone()),
            )
            .await
            {
                Ok(connection) => break connection,
                Err(error) if is_protocol_rejection(&error) => {
                    let Some(lower) = version.downgrade() else {
                        return Err(error);
                    };
                    info!(%endpoint, from = %version, to = %lower, "downgrading protocol version");
                    version = lower;
                }
                Err(error) => return Err(error),
            }
        };

        connection
            .request(&Request::Register {
                events: EVENT_TYPES.iter().map(|e| e.to_string()).collect(),
            })
            .await?;

        *self.negotiated.write() = version;
        let previous = self.connection.write().replace(Arc::clone(&connection));
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.registry.add(endpoint);
        self.registry.set_up(endpoint);
        self.watch_connection(connection);
        info!(%endpoint, %version, "control connection established");
        Ok(())
    }

    fn watch_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let control = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut states = connection.state_changes();
            loop {
                if !matches!(
                    *states.borrow(),
                    crate::connection::ConnectionState::Opening
                        | crate::connection::ConnectionState::Ready
                ) {
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
            let Some(control) = control.upgrade() else { return };
            if control.shut_down.load(Ordering::SeqCst) {
                return;
            }
            let still_current = control
                .connection
                .read()
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &connection));
            if still_current {
                warn!(endpoint = %connection.endpoint(), "control connection lost, failing over");
                control.failover().await;
            }
        });
    }

    /// Replace a dead control connection with one to another Up host,
    /// retrying on the reconnection policy's schedule until shutdown.
    async fn failover(self: &Arc<Self>) {
        let mut schedule = self.config.reconnection.new_schedule();
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return;
            }
            // Up hosts first, then anything else the registry knows, then
            // the original contact points
            let mut candidates: Vec<SocketAddr> = self
                .registry
                .up_hosts()
                .iter()
                .map(|host| host.address())
                .collect();
            for host in self.registry.hosts() {
                if !candidates.contains(&host.address()) {
                    candidates.push(host.address());
                }
            }
            for addr in &self.contact_points {
                if !candidates.contains(addr) {
                    candidates.push(*addr);
                }
            }
            // The endpoint that just died goes last
            if let Some(current) = self.endpoint() {
                candidates.retain(|addr| *addr != current);
                candidates.push(current);
            }

            for endpoint in candidates {
                match self.connect_to(endpoint).await {
                    Ok(()) => {
                        if let Err(error) = self.refresh_hosts().await {
                            warn!(%error, "host refresh after failover failed");
                        }
                        return;
                    }
                    Err(error) => {
                        debug!(%endpoint, %error, "control failover candidate failed");
                    }
                }
            }

            let delay = schedule.next().unwrap_or(u64::MAX);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn current_connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| DriverError::ConnectionClosed("no control connection".to_string()))
    }

    /// Poll the catalogue and reconcile the registry: refresh metadata,
    /// add unknown peers, remove vanished ones.
    pub async fn refresh_hosts(self: &Arc<Self>) -> Result<()> {
        let connection = self.current_connection()?;
        let control_port = connection.endpoint().port();

        let local_rows = self.query_rows(&connection, LOCAL_QUERY).await?;
        let peer_rows = self.query_rows(&connection, PEERS_QUERY).await?;

        let mut discovered = vec![connection.endpoint()];
        if let Some(row) = local_rows.rows.first() {
            self.apply_host_metadata(connection.endpoint(), &local_rows, row);
        }

        for row in &peer_rows.rows {
            let Some(ip) = peer_address(&peer_rows, row) else {
                continue;
            };
            let endpoint = self
                .config
                .address_translator
                .translate(SocketAddr::new(ip, control_port))
                .await;
            discovered.push(endpoint);
            self.registry.add(endpoint);
            self.apply_host_metadata(endpoint, &peer_rows, row);
        }

        let removed = self.registry.reconcile(&discovered);
        for host in removed {
            debug!(address = %host.address(), "peer vanished from catalogue");
        }
        Ok(())
    }

    fn apply_host_metadata(
        &self,
        endpoint: SocketAddr,
        rows: &RowsResult,
        row: &[Option<CqlValue>],
    ) {
        let Some(host) = self.registry.get(endpoint) else {
            return;
        };
        let datacenter = text_column(rows, row, "data_center");
        let rack = text_column(rows, row, "rack");
        let version = text_column(rows, row, "release_version");
        let tokens = tokens_column(rows, row);
        host.set_metadata(datacenter, rack, tokens, version);
    }

    async fn query_rows(
        &self,
        connection: &Arc<Connection>,
        query: &str,
    ) -> Result<RowsResult> {
        let response = connection
            .request(&Request::Query {
                query: query.to_string(),
                parameters: Default::default(),
            })
            .await?;
        match response.parsed.response {
            Response::Result(ResultResponse::Rows(rows)) => Ok(rows),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to '{query}': {other:?}"
            ))),
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::StatusChange { change, address } => {
                let endpoint = self.config.address_translator.translate(address).await;
                match change.as_str() {
                    "UP" => self.registry.set_up(endpoint),
                    "DOWN" => self.registry.set_down(endpoint),
                    other => debug!(change = other, "unknown status change"),
                }
            }
            ServerEvent::TopologyChange { change, address } => {
                let endpoint = self.config.address_translator.translate(address).await;
                match change.as_str() {
                    "NEW_NODE" => {
                        self.registry.add(endpoint);
                        // Pick up dc/rack/tokens for the newcomer
                        if let Err(error) = self.refresh_hosts().await {
                            debug!(%error, "refresh after NEW_NODE failed");
                        }
                    }
                    "REMOVED_NODE" => {
                        self.registry.remove(endpoint);
                    }
                    other => debug!(change = other, "unknown topology change"),
                }
            }
            ServerEvent::SchemaChange(change) => {
                debug!(?change, "schema change event");
            }
        }
    }
}

fn is_protocol_rejection(error: &DriverError) -> bool {
    match error {
        DriverError::Response(response) => response.error_code() == ErrorCode::ProtocolError,
        DriverError::Protocol(_) => true,
        _ => false,
    }
}

fn column_index(rows: &RowsResult, name: &str) -> Option<usize> {
    rows.columns.iter().position(|column| column.name == name)
}

fn text_column(rows: &RowsResult, row: &[Option<CqlValue>], name: &str) -> Option<String> {
    let index = column_index(rows, name)?;
    match row.get(index)? {
        Some(CqlValue::Text(text)) | Some(CqlValue::Ascii(text)) => Some(text.clone()),
        _ => None,
    }
}

fn tokens_column(rows: &RowsResult, row: &[Option<CqlValue>]) -> Vec<Token> {
    let Some(index) = column_index(rows, "tokens") else {
        return Vec::new();
    };
    match row.get(index) {
        Some(Some(CqlValue::Set(values))) | Some(Some(CqlValue::List(values))) => values
            .iter()
            .filter_map(|value| match value {
                CqlValue::Text(text) => Token::parse(text),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn peer_address(rows: &RowsResult, row: &[Option<CqlValue>]) -> Option<std::net::IpAddr> {
    for column in ["rpc_address", "peer"] {
        if let Some(index) = column_index(rows, column) {
            if let Some(Some(CqlValue::Inet(ip))) = row.get(index) {
                return Some(*ip);
            }
        }
    }
    None
}

/// Applies server events to the registry, serialized in arrival order.
async fn event_loop(
    control: Weak<ControlConnection>,
    mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        let Some(control) = control.upgrade() else { return };
        if control.shut_down.load(Ordering::SeqCst) {
            return;
        }
        control.handle_event(event).await;
    }
}

/// Periodic peers-catalogue reconciliation.
async fn reconcile_loop(control: Weak<ControlConnection>) {
    loop {
        let interval = {
            let Some(control) = control.upgrade() else { return };
            control.config.reconcile_interval
        };
        tokio::time::sleep(interval).await;
        let Some(control) = control.upgrade() else { return };
        if control.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if let Err(error) = control.refresh_hosts().await {
            debug!(%error, "periodic host reconciliation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ConstantReconnectionPolicy, IdentityTranslator};
    use crate::testing::{MockBehavior, MockCluster, NodeMeta};
    use tokio::time::sleep;

    fn control_config() -> ControlConfig {
        ControlConfig {
            connection: ConnectionConfig {
                heartbeat_interval: Duration::ZERO,
                ..Default::default()
            },
            default_port: 9042,
            reconcile_interval: Duration::from_secs(3600),
            address_translator: Arc::new(IdentityTranslator),
            reconnection: Arc::new(ConstantReconnectionPolicy::new(20)),
        }
    }

    fn dc_behavior(dc: &str, tokens: &[String]) -> MockBehavior {
        MockBehavior {
            meta: NodeMeta {
                data_center: dc.to_string(),
                rack: "rack1".to_string(),
                tokens: tokens.to_vec(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_discovers_peers() {
        let cluster = MockCluster::homogeneous(3, |i| {
            dc_behavior("dc1", &[format!("{}", i * 100)])
        });
        let (registry, _events) = HostRegistry::new();
        let contact = vec![cluster.nodes()[0].endpoint()];

        let control = ControlConnection::init(
            contact,
            Arc::new(cluster.clone()),
            Arc::clone(&registry),
            control_config(),
        )
        .await
        .unwrap();

        assert_eq!(registry.len(), 3);
        let host = registry.get(cluster.nodes()[1].endpoint()).unwrap();
        assert_eq!(host.datacenter().as_deref(), Some("dc1"));
        assert_eq!(host.tokens().len(), 1);
        assert_eq!(control.negotiated_version(), ProtocolVersion::MAX);
    }

    #[tokio::test]
    async fn test_version_downgrade() {
        let cluster = MockCluster::homogeneous(1, |_| MockBehavior {
            reject_versions_above: Some(3),
            ..dc_behavior("dc1", &["0".to_string()])
        });
        let (registry, _events) = HostRegistry::new();

        let control = ControlConnection::init(
            vec![cluster.nodes()[0].endpoint()],
            Arc::new(cluster.clone()),
            registry,
            control_config(),
        )
        .await
        .unwrap();
        assert_eq!(control.negotiated_version(), ProtocolVersion::V3);
    }

    #[tokio::test]
    async fn test_all_contact_points_down() {
        let cluster = MockCluster::homogeneous(2, |_| MockBehavior::default());
        for node in cluster.nodes() {
            node.set_alive(false);
        }
        let (registry, _events) = HostRegistry::new();
        let contact: Vec<SocketAddr> =
            cluster.nodes().iter().map(|node| node.endpoint()).collect();

        let result = ControlConnection::init(
            contact,
            Arc::new(cluster.clone()),
            registry,
            control_config(),
        )
        .await;
        match result {
            Err(DriverError::NoHostAvailable(inner)) => assert_eq!(inner.len(), 2),
            other => panic!("expected NoHostAvailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_events_update_registry() {
        let cluster = MockCluster::homogeneous(2, |_| dc_behavior("dc1", &["0".to_string()]));
        let (registry, _events) = HostRegistry::new();
        let control = ControlConnection::init(
            vec![cluster.nodes()[0].endpoint()],
            Arc::new(cluster.clone()),
            Arc::clone(&registry),
            control_config(),
        )
        .await
        .unwrap();

        let peer = cluster.nodes()[1].endpoint();
        registry.set_up(peer);
        assert!(registry.get(peer).unwrap().is_up());

        cluster.nodes()[0].push_status_event("DOWN", peer);
        for _ in 0..100 {
            if !registry.get(peer).unwrap().is_up() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(!registry.get(peer).unwrap().is_up());

        cluster.nodes()[0].push_status_event("UP", peer);
        for _ in 0..100 {
            if registry.get(peer).unwrap().is_up() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(peer).unwrap().is_up());
        drop(control);
    }

    #[tokio::test]
    async fn test_removed_node_topology_event() {
        let cluster = MockCluster::homogeneous(3, |_| dc_behavior("dc1", &["0".to_string()]));
        let (registry, _events) = HostRegistry::new();
        let control = ControlConnection::init(
            vec![cluster.nodes()[0].endpoint()],
            Arc::new(cluster.clone()),
            Arc::clone(&registry),
            control_config(),
        )
        .await
        .unwrap();
        assert_eq!(registry.len(), 3);

        let removed = cluster.nodes()[2].endpoint();
        cluster.nodes()[0].push_topology_event("REMOVED_NODE", removed);
        for _ in 0..100 {
            if registry.get(removed).is_none() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(removed).is_none());
        assert_eq!(registry.len(), 2);
        drop(control);
    }

    #[tokio::test]
    async fn test_failover_to_peer() {
        let cluster = MockCluster::homogeneous(2, |_| dc_behavior("dc1", &["0".to_string()]));
        let (registry, _events) = HostRegistry::new();
        let control = ControlConnection::init(
            vec![cluster.nodes()[0].endpoint()],
            Arc::new(cluster.clone()),
            Arc::clone(&registry),
            control_config(),
        )
        .await
        .unwrap();
        assert_eq!(control.endpoint(), Some(cluster.nodes()[0].endpoint()));

        // Kill the control connection's node entirely
        cluster.nodes()[0].set_alive(false);
        cluster.nodes()[0].kill_connections();

        for _ in 0..200 {
            if control.endpoint() == Some(cluster.nodes()[1].endpoint()) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(control.endpoint(), Some(cluster.nodes()[1].endpoint()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_control() {
        let cluster = MockCluster::homogeneous(1, |_| dc_behavior("dc1", &["0".to_string()]));
        let (registry, _events) = HostRegistry::new();
        let control = ControlConnection::init(
            vec![cluster.nodes()[0].endpoint()],
            Arc::new(cluster.clone()),
            registry,
            control_config(),
        )
        .await
        .unwrap();
        control.shutdown().await;
        assert!(control.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_resolve_contact_points_literal() {
        let translator: Arc<dyn AddressTranslator> = Arc::new(IdentityTranslator);
        let resolved = resolve_contact_points(
            &["127.0.0.1:9042".to_string(), "127.0.0.2:19042".to_string()],
            9042,
            &translator,
        )
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].port(), 19042);
    }
}

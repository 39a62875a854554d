// Session
//
// The session owns the host registry, the control connection, the policy
// set, the prepared cache and one pool per host, and exposes
// execute/batch/prepare/use_keyspace/shutdown on top of the request
// executor. It is the only place the pieces are wired together; everything
// below it stays independently testable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::cluster::{Host, HostDistance, HostEvent, HostRegistry, Token, TokenRing};
use crate::codec::QueryValue;
use crate::connection::{Connection, ConnectionConfig, Connector, TcpConnector};
use crate::control::{resolve_contact_points, ControlConfig, ControlConnection};
use crate::error::{DriverError, Result};
use crate::executor::{ExecutorShared, RequestExecutor, ResultSet, Statement};
use crate::frame::response::{Response, ResultResponse};
use crate::frame::{BatchChild, BatchKind, Request};
use crate::options::{verify_keyspace_name, ClientOptions, ExecutionOptions};
use crate::policy::{DefaultLoadBalancingPolicy, LoadBalancingPolicy, QueryPlan, RequestInfo};
use crate::pool::{HostPool, PoolConfig};
use crate::prepared::{PrepareBackend, PreparedCache, PreparedStatement};

pub struct Session {
    options: ClientOptions,
    registry: Arc<HostRegistry>,
    control: Arc<ControlConnection>,
    executor: RequestExecutor,
    prepared: Arc<PreparedCache>,
    backend: Arc<dyn PrepareBackend>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    token_ring: Arc<TokenRing>,
    keyspace: Arc<RwLock<Option<String>>>,
    connector: Arc<dyn Connector>,
    pool_config: PoolConfig,
    shut_down: AtomicBool,
}

impl Session {
    /// Connect over TCP.
    pub async fn connect(options: ClientOptions) -> Result<Arc<Session>> {
        let connect_timeout = Duration::from_millis(options.socket.connect_timeout_ms);
        let connector = Arc::new(TcpConnector {
            connect_timeout,
            tcp_nodelay: options.socket.tcp_nodelay,
        });
        Session::connect_with(options, connector).await
    }

    /// Connect through a custom transport connector.
    pub async fn connect_with(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Session>> {
        options.validate()?;

        let contact_points = resolve_contact_points(
            &options.contact_points,
            options.default_port,
            &options.policies.address_translator,
        )
        .await?;

        let (registry, host_events) = HostRegistry::new();

        // The control connection negotiates with the configured maximum;
        // pools then reuse whatever version it settled on
        let control_connection_config = ConnectionConfig {
            version: options.protocol_max_version,
            compressor: options.compressor.clone(),
            auth_provider: options.auth_provider.clone(),
            read_timeout: Duration::from_millis(options.socket.read_timeout_ms),
            heartbeat_interval: Duration::from_millis(options.pooling.heart_beat_interval_ms),
            defunct_read_timeout_threshold: options.socket.defunct_read_timeout_threshold,
            coalesce_flush_bytes: 64 * 1024,
        };
        let control = ControlConnection::init(
            contact_points,
            Arc::clone(&connector),
            Arc::clone(&registry),
            ControlConfig {
                connection: control_connection_config.clone(),
                default_port: options.default_port,
                reconcile_interval: Duration::from_secs(60),
                address_translator: Arc::clone(&options.policies.address_translator),
                reconnection: Arc::clone(&options.policies.reconnection),
            },
        )
        .await?;

        let token_ring = Arc::new(TokenRing::new());
        token_ring.rebuild(&registry.hosts());

        let load_balancing: Arc<dyn LoadBalancingPolicy> =
            match &options.policies.load_balancing {
                Some(policy) => Arc::clone(policy),
                None => Arc::new(DefaultLoadBalancingPolicy::new(
                    options.local_data_center.clone(),
                    Arc::clone(&token_ring) as Arc<dyn crate::cluster::ReplicaOracle>,
                )),
            };
        load_balancing.init(&registry)?;

        let pool_config = PoolConfig {
            core_local: options.pooling.core_connections_local,
            max_local: options.pooling.max_connections_local,
            core_remote: options.pooling.core_connections_remote,
            max_remote: options.pooling.max_connections_remote,
            max_requests_per_connection: options.pooling.max_requests_per_connection,
            warmup: options.pooling.warmup,
            connection: ConnectionConfig {
                version: control.negotiated_version(),
                ..control_connection_config
            },
        };

        let keyspace = Arc::new(RwLock::new(None));
        let prepared = PreparedCache::new(options.prepare_on_all_hosts);
        let backend: Arc<dyn PrepareBackend> = Arc::new(SessionPrepareBackend {
            load_balancing: Arc::clone(&load_balancing),
        });

        let shared = Arc::new(ExecutorShared {
            registry: Arc::clone(&registry),
            load_balancing: Arc::clone(&load_balancing),
            retry: Arc::clone(&options.policies.retry),
            speculative: Arc::clone(&options.policies.speculative_execution),
            timestamp_generator: options.policies.timestamp_generation.clone(),
            prepared: Arc::clone(&prepared),
            prepare_backend: Arc::clone(&backend),
            tracker: options.request_tracker.clone(),
            query_defaults: options.query.clone(),
            default_read_timeout: Duration::from_millis(options.socket.read_timeout_ms),
            profiles: options.profiles.clone(),
        });

        let session = Arc::new(Session {
            executor: RequestExecutor::new(Arc::clone(&shared)),
            options,
            registry: Arc::clone(&registry),
            control,
            prepared,
            backend,
            load_balancing,
            token_ring,
            keyspace,
            connector,
            pool_config,
            shut_down: AtomicBool::new(false),
        });

        // Pools for everything discovered so far
        for host in registry.hosts() {
            session.create_pool(&host).await;
        }
        if session.pool_config.warmup {
            let warmups = registry
                .hosts()
                .into_iter()
                .filter_map(|host| host.pool())
                .map(|pool| async move { pool.warmup().await });
            join_all(warmups).await;
        }

        tokio::spawn(host_event_loop(Arc::downgrade(&session), host_events));
        info!(
            hosts = registry.len(),
            version = %session.control.negotiated_version(),
            "session connected"
        );
        Ok(session)
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn keyspace(&self) -> Option<String> {
        self.keyspace.read().clone()
    }

    /// Record a keyspace's replica count, the opaque input the token-aware
    /// routing consumes (normally fed by a schema reader).
    pub fn set_replication(&self, keyspace: &str, replicas: usize) {
        self.token_ring.set_replication(keyspace, replicas);
    }

    /// Execute a statement. `options.prepare` (or the session default)
    /// switches transparent preparation on.
    pub async fn execute(
        &self,
        query: &str,
        values: Vec<QueryValue>,
        options: &ExecutionOptions,
    ) -> Result<ResultSet> {
        self.check_running()?;
        let statement = Statement::with_values(query, values);
        self.execute_statement(statement, options).await
    }

    pub async fn execute_statement(
        &self,
        statement: Statement,
        options: &ExecutionOptions,
    ) -> Result<ResultSet> {
        self.check_running()?;
        let prepare = options.prepare.unwrap_or(self.options.query.prepare);
        let prepared = if prepare {
            Some(
                self.prepared
                    .get_or_prepare(
                        &self.backend,
                        self.routing_keyspace(options).as_deref(),
                        &statement.query,
                    )
                    .await?,
            )
        } else {
            None
        };
        let result = self
            .executor
            .execute(statement, prepared, options, self.keyspace())
            .await?;
        if let Some(keyspace) = &result.keyspace_set {
            *self.keyspace.write() = Some(keyspace.clone());
        }
        Ok(result)
    }

    /// Prepare a statement explicitly.
    pub async fn prepare(&self, query: &str) -> Result<Arc<PreparedStatement>> {
        self.check_running()?;
        self.prepared
            .get_or_prepare(&self.backend, self.keyspace().as_deref(), query)
            .await
    }

    /// Execute a batch. Statements are prepared transparently when the
    /// options ask for it; the routing token of a logged batch comes from
    /// the first statement that produces one.
    pub async fn batch(
        &self,
        statements: Vec<Statement>,
        options: &ExecutionOptions,
    ) -> Result<ResultSet> {
        self.check_running()?;
        if statements.is_empty() {
            return Err(DriverError::Argument(
                "batch requires at least one statement".to_string(),
            ));
        }
        let prepare = options.prepare.unwrap_or(self.options.query.prepare);
        let keyspace = self.routing_keyspace(options);

        let mut children = Vec::with_capacity(statements.len());
        let mut routing_token = options.routing_token;
        if routing_token.is_none() {
            if let Some(key) = &options.routing_key {
                routing_token = Some(Token::from_routing_key(key));
            }
        }

        for statement in statements {
            if prepare {
                let prepared = self
                    .prepared
                    .get_or_prepare(&self.backend, keyspace.as_deref(), &statement.query)
                    .await?;
                if routing_token.is_none() && !prepared.pk_indexes.is_empty() {
                    routing_token = batch_child_token(&statement.values, &prepared);
                }
                let value_types = if prepared.parameters.is_empty() {
                    None
                } else {
                    Some(
                        prepared
                            .parameters
                            .iter()
                            .map(|column| column.cql_type.clone())
                            .collect(),
                    )
                };
                children.push(BatchChild::Prepared {
                    id: prepared.id.clone(),
                    values: statement.values,
                    value_types,
                });
            } else {
                children.push(BatchChild::Simple {
                    query: statement.query,
                    values: statement.values,
                });
            }
        }

        let kind = match options.logged {
            Some(false) => BatchKind::Unlogged,
            _ => BatchKind::Logged,
        };
        self.executor
            .execute_batch(kind, children, routing_token, options, self.keyspace())
            .await
    }

    /// Switch the active keyspace; subsequent borrows re-pin connections.
    pub async fn use_keyspace(&self, keyspace: &str) -> Result<()> {
        self.check_running()?;
        verify_keyspace_name(keyspace)?;
        let result = self
            .execute(
                &format!("USE \"{keyspace}\""),
                Vec::new(),
                &ExecutionOptions::default(),
            )
            .await?;
        match result.keyspace_set {
            Some(_) => Ok(()),
            None => Err(DriverError::Protocol(
                "USE did not switch the keyspace".to_string(),
            )),
        }
    }

    /// Idempotent shutdown: stop accepting work, drain every pool, close
    /// the control connection and notify the tracker.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("session shutting down");
        self.control.shutdown().await;
        let pools: Vec<Arc<HostPool>> = self
            .registry
            .hosts()
            .into_iter()
            .filter_map(|host| host.detach_pool())
            .collect();
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
        if let Some(tracker) = &self.options.request_tracker {
            tracker.shutdown();
        }
        info!("session shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(DriverError::Shutdown);
        }
        Ok(())
    }

    fn routing_keyspace(&self, options: &ExecutionOptions) -> Option<String> {
        options.keyspace.clone().or_else(|| self.keyspace())
    }

    async fn create_pool(self: &Arc<Self>, host: &Arc<Host>) {
        let distance = self.load_balancing.distance(host);
        if distance == HostDistance::Ignored {
            return;
        }
        if host.pool().is_some() {
            return;
        }
        let pool = HostPool::new(
            host,
            self.pool_config.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.options.policies.reconnection),
            &self.registry,
            Arc::clone(&self.keyspace),
        );
        pool.set_distance(distance).await;
        host.attach_pool(Arc::clone(&pool));
    }
}

/// Produces query plans and runs PREPARE for the prepared cache and the
/// executor's re-preparation flow.
struct SessionPrepareBackend {
    load_balancing: Arc<dyn LoadBalancingPolicy>,
}

#[async_trait::async_trait]
impl PrepareBackend for SessionPrepareBackend {
    fn new_plan(&self, keyspace: Option<&str>) -> QueryPlan {
        self.load_balancing.new_query_plan(&RequestInfo {
            keyspace,
            routing_token: None,
        })
    }

    async fn prepare_on(
        &self,
        host: &Arc<Host>,
        _keyspace: Option<&str>,
        query: &str,
    ) -> Result<crate::frame::response::PreparedResult> {
        let pool = host.pool().ok_or_else(|| {
            DriverError::ConnectionClosed(format!("host {} has no pool", host.address()))
        })?;
        let connection: Arc<Connection> = pool.borrow_connection().await?;
        let response = connection
            .request(&Request::Prepare {
                query: query.to_string(),
            })
            .await?;
        match response.parsed.response {
            Response::Result(ResultResponse::Prepared(prepared)) => Ok(prepared),
            other => Err(DriverError::Protocol(format!(
                "unexpected response to PREPARE: {other:?}"
            ))),
        }
    }
}

fn batch_child_token(values: &[QueryValue], prepared: &Arc<PreparedStatement>) -> Option<Token> {
    let mut components = Vec::new();
    for &index in &prepared.pk_indexes {
        let QueryValue::Value(value) = values.get(index as usize)? else {
            return None;
        };
        let hint = prepared
            .parameters
            .get(index as usize)
            .map(|column| &column.cql_type);
        components.push(
            crate::codec::serialize(value, hint, crate::frame::ProtocolVersion::MAX).ok()?,
        );
    }
    match components.len() {
        0 => None,
        1 => Some(Token::from_routing_key(&components[0])),
        _ => {
            let mut key = Vec::new();
            for component in &components {
                key.extend_from_slice(&(component.len() as u16).to_be_bytes());
                key.extend_from_slice(component);
                key.push(0);
            }
            Some(Token::from_routing_key(&key))
        }
    }
}

/// Reacts to registry events: pools for new hosts, drains for removed
/// ones, refills and optional re-preparation when a host comes back up.
async fn host_event_loop(
    session: std::sync::Weak<Session>,
    mut events: mpsc::UnboundedReceiver<HostEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else { return };
        if session.is_shut_down() {
            return;
        }
        match event {
            HostEvent::Added(host) => {
                session.create_pool(&host).await;
                session.token_ring.rebuild(&session.registry.hosts());
                if let Some(pool) = host.pool() {
                    pool.fill_to_core();
                }
            }
            HostEvent::Removed(host) => {
                session.token_ring.rebuild(&session.registry.hosts());
                if let Some(pool) = host.detach_pool() {
                    pool.shutdown().await;
                }
            }
            HostEvent::Up(host) => {
                if host.pool().is_none() {
                    session.create_pool(&host).await;
                }
                if let Some(pool) = host.pool() {
                    pool.fill_to_core();
                }
                if session.options.re_prepare_on_up {
                    session
                        .prepared
                        .re_prepare_all_on(Arc::clone(&session.backend), host);
                }
            }
            HostEvent::Down(host) => {
                debug!(address = %host.address(), "host down");
            }
        }
    }
}

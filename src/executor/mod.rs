// Request execution
//
// The single-request state machine: resolve routing, obtain a query plan,
// borrow a connection, send, then classify the response into deliver /
// retry / next host / re-prepare. Speculative execution runs additional
// chains against the same plan; the first terminal outcome wins and the
// rest are cancelled. Every terminal path completes the caller exactly
// once and releases its in-flight bookkeeping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace};

use crate::cluster::{Host, HostDistance, HostRegistry, Token};
use crate::codec::{serialize, CqlValue, QueryValue};
use crate::connection::Connection;
use crate::error::{DriverError, ErrorCode, Result};
use crate::frame::response::{ColumnSpec, Response, ResultResponse, SchemaChange};
use crate::frame::{BatchChild, BatchKind, Consistency, QueryParameters, Request};
use crate::options::{ExecutionOptions, ExecutionProfile, QueryOptions};
use crate::policy::{
    LoadBalancingPolicy, QueryPlan, RequestInfo, RetryContext, RetryDecision, RetryPolicy,
    SpeculativeExecutionPolicy, TimestampGenerator,
};
use crate::prepared::{PrepareBackend, PreparedCache, PreparedStatement};
use crate::tracker::RequestTracker;

/// A simple (possibly parameterized) statement.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub query: String,
    pub values: Vec<QueryValue>,
    pub named_values: Option<Vec<(String, QueryValue)>>,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Statement {
        Statement {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_values(query: impl Into<String>, values: Vec<QueryValue>) -> Statement {
        Statement {
            query: query.into(),
            values,
            named_values: None,
        }
    }
}

/// The user-facing result of one request.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Option<CqlValue>>>,
    pub paging_state: Option<Vec<u8>>,
    pub warnings: Vec<String>,
    /// Generic key-value payload attached by custom server handlers.
    pub custom_payload: Option<HashMap<String, Option<Vec<u8>>>>,
    /// Coordinator that produced the final response.
    pub queried_host: Option<SocketAddr>,
    /// Hosts tried before (or instead of) the coordinator, with the error
    /// each produced.
    pub tried_hosts: HashMap<SocketAddr, String>,
    /// Keyspace the session switched to (USE statements).
    pub keyspace_set: Option<String>,
    pub schema_change: Option<SchemaChange>,
    /// Total send attempts across all execution chains.
    pub attempts: usize,
}

impl ResultSet {
    pub fn first_row(&self) -> Option<&Vec<Option<CqlValue>>> {
        self.rows.first()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Everything the executor borrows from the session.
pub struct ExecutorShared {
    pub registry: Arc<HostRegistry>,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry: Arc<dyn RetryPolicy>,
    pub speculative: Arc<dyn SpeculativeExecutionPolicy>,
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
    pub prepared: Arc<PreparedCache>,
    pub prepare_backend: Arc<dyn PrepareBackend>,
    pub tracker: Option<Arc<dyn RequestTracker>>,
    pub query_defaults: QueryOptions,
    pub default_read_timeout: Duration,
    pub profiles: HashMap<String, ExecutionProfile>,
}

/// Per-request settings after option/profile/default resolution.
struct Resolved {
    consistency: Consistency,
    serial_consistency: Consistency,
    read_timeout: Duration,
    is_idempotent: bool,
    fetch_size: i32,
    retry: Arc<dyn RetryPolicy>,
    speculative: Arc<dyn SpeculativeExecutionPolicy>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    paging_state: Option<Vec<u8>>,
    timestamp: Option<i64>,
}

/// The request payload, shared by all execution chains.
enum Payload {
    Query(Statement),
    Execute {
        statement: Statement,
        prepared: Arc<PreparedStatement>,
    },
    Batch {
        kind: BatchKind,
        children: Vec<BatchChild>,
    },
}

impl Payload {
    fn query_text(&self) -> &str {
        match self {
            Payload::Query(statement) => &statement.query,
            Payload::Execute { statement, .. } => &statement.query,
            Payload::Batch { .. } => "BATCH",
        }
    }
}

/// State shared by the primary and speculative chains of one request.
struct RequestState {
    shared: Arc<ExecutorShared>,
    payload: Payload,
    resolved: Resolved,
    plan: Mutex<QueryPlan>,
    tried: Mutex<HashMap<SocketAddr, DriverError>>,
    attempts: AtomicUsize,
    /// Replacement statement after an in-place re-prepare.
    reprepared: Mutex<Option<Arc<PreparedStatement>>>,
}

/// Outcome of one chain, fed back to the caller.
struct ChainSuccess {
    result: ResultSet,
}

pub struct RequestExecutor {
    shared: Arc<ExecutorShared>,
}

impl RequestExecutor {
    pub fn new(shared: Arc<ExecutorShared>) -> RequestExecutor {
        RequestExecutor { shared }
    }

    /// Execute a simple or prepared statement.
    pub async fn execute(
        &self,
        statement: Statement,
        prepared: Option<Arc<PreparedStatement>>,
        options: &ExecutionOptions,
        session_keyspace: Option<String>,
    ) -> Result<ResultSet> {
        let resolved = self.resolve(options)?;
        let keyspace = options
            .keyspace
            .clone()
            .or_else(|| prepared.as_ref().and_then(|p| p.keyspace.clone()))
            .or(session_keyspace);
        let routing_token = self.resolve_routing(&statement, prepared.as_deref(), options)?;

        let payload = match prepared {
            Some(prepared) => Payload::Execute {
                statement,
                prepared,
            },
            None => Payload::Query(statement),
        };
        self.run(payload, resolved, keyspace, routing_token).await
    }

    /// Execute a batch. The routing token of a logged batch comes from the
    /// first child that has one; the session precomputes it.
    pub async fn execute_batch(
        &self,
        kind: BatchKind,
        children: Vec<BatchChild>,
        routing_token: Option<Token>,
        options: &ExecutionOptions,
        session_keyspace: Option<String>,
    ) -> Result<ResultSet> {
        let resolved = self.resolve(options)?;
        let keyspace = options.keyspace.clone().or(session_keyspace);
        self.run(
            Payload::Batch { kind, children },
            resolved,
            keyspace,
            routing_token,
        )
        .await
    }

    async fn run(
        &self,
        payload: Payload,
        resolved: Resolved,
        keyspace: Option<String>,
        routing_token: Option<Token>,
    ) -> Result<ResultSet> {
        let info = RequestInfo {
            keyspace: keyspace.as_deref(),
            routing_token,
        };
        let plan = resolved.load_balancing.new_query_plan(&info);

        // Speculation only applies to idempotent requests
        let mut speculative_plan = if resolved.is_idempotent {
            Some(
                resolved
                    .speculative
                    .new_plan(keyspace.as_deref(), payload.query_text()),
            )
        } else {
            None
        };

        let state = Arc::new(RequestState {
            shared: Arc::clone(&self.shared),
            payload,
            resolved,
            plan: Mutex::new(plan),
            tried: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
            reprepared: Mutex::new(None),
        });

        let mut chains: JoinSet<Result<ChainSuccess>> = JoinSet::new();
        chains.spawn(run_chain(Arc::clone(&state)));

        loop {
            let next_delay = speculative_plan
                .as_mut()
                .map(|plan| plan.next_execution())
                .unwrap_or(-1);

            if next_delay > 0 {
                tokio::select! {
                    finished = chains.join_next() => {
                        return finalize(finished, &state);
                    }
                    _ = sleep(Duration::from_millis(next_delay as u64)) => {
                        trace!("starting speculative execution");
                        chains.spawn(run_chain(Arc::clone(&state)));
                    }
                }
            } else {
                let finished = chains.join_next().await;
                return finalize(finished, &state);
            }
        }
        // Dropping the JoinSet aborts the losing chains; their pending
        // requests unregister from the in-flight maps as they unwind.
    }

    fn resolve(&self, options: &ExecutionOptions) -> Result<Resolved> {
        let profile = match &options.execution_profile {
            Some(name) => Some(self.shared.profiles.get(name).ok_or_else(|| {
                DriverError::Argument(format!("unknown execution profile '{name}'"))
            })?),
            None => None,
        };
        let defaults = &self.shared.query_defaults;

        let consistency = options
            .consistency
            .or(profile.and_then(|p| p.consistency))
            .unwrap_or(defaults.consistency);
        let serial_consistency = options
            .serial_consistency
            .or(profile.and_then(|p| p.serial_consistency))
            .unwrap_or(defaults.serial_consistency);
        let read_timeout = options
            .read_timeout_ms
            .or(profile.and_then(|p| p.read_timeout_ms))
            .map(Duration::from_millis)
            .map(|profile_timeout| profile_timeout.min(self.shared.default_read_timeout))
            .unwrap_or(self.shared.default_read_timeout);
        let retry = options
            .retry_policy
            .clone()
            .or_else(|| profile.and_then(|p| p.retry.clone()))
            .unwrap_or_else(|| Arc::clone(&self.shared.retry));
        let speculative = profile
            .and_then(|p| p.speculative_execution.clone())
            .unwrap_or_else(|| Arc::clone(&self.shared.speculative));
        let load_balancing = profile
            .and_then(|p| p.load_balancing.clone())
            .unwrap_or_else(|| Arc::clone(&self.shared.load_balancing));

        // The generator is consulted once per request; every attempt and
        // retry carries the same timestamp so server-side idempotency holds
        let timestamp = options.timestamp.or_else(|| {
            self.shared
                .timestamp_generator
                .as_ref()
                .and_then(|generator| generator.next())
        });

        Ok(Resolved {
            consistency,
            serial_consistency,
            read_timeout,
            is_idempotent: options.is_idempotent.unwrap_or(defaults.is_idempotent),
            fetch_size: options.fetch_size.unwrap_or(defaults.fetch_size),
            retry,
            speculative,
            load_balancing,
            paging_state: options.paging_state.clone(),
            timestamp,
        })
    }

    /// Routing: explicit token, then explicit key, then partition-key
    /// parameters (prepared statements and explicit indexes only).
    fn resolve_routing(
        &self,
        statement: &Statement,
        prepared: Option<&PreparedStatement>,
        options: &ExecutionOptions,
    ) -> Result<Option<Token>> {
        if let Some(token) = options.routing_token {
            return Ok(Some(token));
        }
        if let Some(key) = &options.routing_key {
            return Ok(Some(Token::from_routing_key(key)));
        }
        if let Some(indexes) = &options.routing_indexes {
            return routing_from_values(&statement.values, indexes, None);
        }
        if let Some(prepared) = prepared {
            if !prepared.pk_indexes.is_empty() {
                let indexes: Vec<usize> =
                    prepared.pk_indexes.iter().map(|i| *i as usize).collect();
                return routing_from_values(&statement.values, &indexes, Some(prepared));
            }
        }
        Ok(None)
    }
}

/// Serialize the partition-key parameters into a routing key. Multiple
/// components use the composite layout: 2-byte length, bytes, zero byte.
fn routing_from_values(
    values: &[QueryValue],
    indexes: &[usize],
    prepared: Option<&PreparedStatement>,
) -> Result<Option<Token>> {
    let mut components = Vec::with_capacity(indexes.len());
    for &index in indexes {
        let Some(QueryValue::Value(value)) = values.get(index) else {
            return Ok(None);
        };
        let hint = prepared
            .and_then(|p| p.parameters.get(index))
            .map(|column| &column.cql_type);
        components.push(serialize(value, hint, crate::frame::ProtocolVersion::MAX)?);
    }
    match components.len() {
        0 => Ok(None),
        1 => Ok(Some(Token::from_routing_key(&components[0]))),
        _ => {
            let mut key = BytesMut::new();
            for component in &components {
                key.extend_from_slice(&(component.len() as u16).to_be_bytes());
                key.extend_from_slice(component);
                key.extend_from_slice(&[0]);
            }
            Ok(Some(Token::from_routing_key(&key)))
        }
    }
}

fn finalize(
    finished: Option<std::result::Result<Result<ChainSuccess>, tokio::task::JoinError>>,
    state: &Arc<RequestState>,
) -> Result<ResultSet> {
    match finished {
        Some(Ok(Ok(success))) => {
            let mut result = success.result;
            result.attempts = state.attempts.load(Ordering::Relaxed);
            result.tried_hosts = state
                .tried
                .lock()
                .iter()
                .map(|(addr, error)| (*addr, error.to_string()))
                .collect();
            Ok(result)
        }
        Some(Ok(Err(error))) => Err(error),
        Some(Err(join_error)) => Err(DriverError::Internal(format!(
            "execution chain panicked: {join_error}"
        ))),
        None => Err(DriverError::Internal(
            "request finished with no execution chain".to_string(),
        )),
    }
}

/// One execution chain: drain hosts from the shared plan until a terminal
/// outcome.
async fn run_chain(state: Arc<RequestState>) -> Result<ChainSuccess> {
    let mut consistency = state.resolved.consistency;
    let mut retry_count = 0usize;
    let mut sticky: Option<(Arc<Host>, Arc<Connection>)> = None;
    let mut reprepare_budget = 1usize;

    loop {
        let (host, connection) = match sticky.take() {
            Some(pair) => pair,
            None => next_host_connection(&state).await?,
        };

        let request = build_request(&state, consistency)?;
        state.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = connection
            .request_with_timeout(&request, state.resolved.read_timeout)
            .await;

        match outcome {
            Ok(response) => {
                track_success(
                    &state,
                    host.address(),
                    response.request_len,
                    response.response_len,
                    started.elapsed(),
                );
                let mut result = response_to_result(response.parsed.response)?;
                result.warnings = response.parsed.warnings;
                result.custom_payload = response.parsed.custom_payload;
                result.queried_host = Some(host.address());
                return Ok(ChainSuccess { result });
            }
            Err(error) => {
                track_error(&state, host.address(), &error, started.elapsed());

                if matches!(error, DriverError::Shutdown) {
                    return Err(error);
                }

                // Socket errors, saturation and per-attempt timeouts: move
                // on to the next host
                if error.is_host_level() {
                    trace!(host = %host.address(), %error, "attempt failed, next host");
                    state.tried.lock().insert(host.address(), error);
                    continue;
                }

                let response_error = match &error {
                    DriverError::Response(response_error) => response_error.clone(),
                    _ => return Err(error),
                };

                match response_error.error_code() {
                    // Coordinator cannot serve anything right now
                    ErrorCode::IsBootstrapping
                    | ErrorCode::Overloaded
                    | ErrorCode::TruncateError => {
                        state.tried.lock().insert(host.address(), error);
                        continue;
                    }
                    ErrorCode::Unprepared => {
                        if reprepare_budget == 0 {
                            return Err(error);
                        }
                        reprepare_budget -= 1;
                        reprepare_in_place(&state, &host).await?;
                        // Retry on the very same host; this increments the
                        // attempt counter but not the tried-host list
                        sticky = Some((host, connection));
                        continue;
                    }
                    ErrorCode::ReadTimeout | ErrorCode::ReadFailure => {
                        let ctx = RetryContext {
                            consistency,
                            is_idempotent: state.resolved.is_idempotent,
                            retry_count,
                            error: &error,
                        };
                        let decision = state.resolved.retry.on_read_timeout(
                            &ctx,
                            response_error.received.unwrap_or(0),
                            response_error.block_for.unwrap_or(0),
                            response_error.data_present.unwrap_or(false),
                        );
                        match apply_decision(decision, &mut consistency, &mut retry_count) {
                            Applied::RetrySame => sticky = Some((host, connection)),
                            Applied::RetryNext => {
                                state.tried.lock().insert(host.address(), error);
                            }
                            Applied::Ignore => {
                                return Ok(ChainSuccess {
                                    result: empty_result(host.address()),
                                })
                            }
                            Applied::Rethrow => return Err(error),
                        }
                        continue;
                    }
                    ErrorCode::WriteTimeout | ErrorCode::WriteFailure => {
                        let ctx = RetryContext {
                            consistency,
                            is_idempotent: state.resolved.is_idempotent,
                            retry_count,
                            error: &error,
                        };
                        let decision = state.resolved.retry.on_write_timeout(
                            &ctx,
                            response_error.received.unwrap_or(0),
                            response_error.block_for.unwrap_or(0),
                            response_error.write_type.as_deref().unwrap_or("SIMPLE"),
                        );
                        match apply_decision(decision, &mut consistency, &mut retry_count) {
                            Applied::RetrySame => sticky = Some((host, connection)),
                            Applied::RetryNext => {
                                state.tried.lock().insert(host.address(), error);
                            }
                            Applied::Ignore => {
                                return Ok(ChainSuccess {
                                    result: empty_result(host.address()),
                                })
                            }
                            Applied::Rethrow => return Err(error),
                        }
                        continue;
                    }
                    ErrorCode::Unavailable => {
                        let ctx = RetryContext {
                            consistency,
                            is_idempotent: state.resolved.is_idempotent,
                            retry_count,
                            error: &error,
                        };
                        let decision = state.resolved.retry.on_unavailable(
                            &ctx,
                            response_error.alive.unwrap_or(0),
                            response_error.block_for.unwrap_or(0),
                        );
                        match apply_decision(decision, &mut consistency, &mut retry_count) {
                            Applied::RetrySame => sticky = Some((host, connection)),
                            Applied::RetryNext => {
                                state.tried.lock().insert(host.address(), error);
                            }
                            Applied::Ignore => {
                                return Ok(ChainSuccess {
                                    result: empty_result(host.address()),
                                })
                            }
                            Applied::Rethrow => return Err(error),
                        }
                        continue;
                    }
                    // Everything else (syntax, invalid, unauthorized,
                    // config, already-exists, function failure, protocol
                    // errors) surfaces immediately
                    _ => return Err(error),
                }
            }
        }
    }
}

enum Applied {
    RetrySame,
    RetryNext,
    Ignore,
    Rethrow,
}

fn apply_decision(
    decision: RetryDecision,
    consistency: &mut Consistency,
    retry_count: &mut usize,
) -> Applied {
    match decision {
        RetryDecision::Rethrow => Applied::Rethrow,
        RetryDecision::Ignore => Applied::Ignore,
        RetryDecision::Retry {
            consistency: downgraded,
            use_current_host,
        } => {
            *retry_count += 1;
            if let Some(downgraded) = downgraded {
                *consistency = downgraded;
            }
            if use_current_host {
                Applied::RetrySame
            } else {
                Applied::RetryNext
            }
        }
    }
}

/// Drain the shared plan to the next usable (Up, non-ignored) host with a
/// borrowable connection; exhausting the plan surfaces NoHostAvailable
/// with the per-host error map.
async fn next_host_connection(
    state: &Arc<RequestState>,
) -> Result<(Arc<Host>, Arc<Connection>)> {
    loop {
        let host = { state.plan.lock().next() };
        let Some(host) = host else {
            return Err(DriverError::NoHostAvailable(state.tried.lock().clone()));
        };
        if !host.is_up() {
            state.tried.lock().insert(
                host.address(),
                DriverError::ConnectionClosed("host is down".to_string()),
            );
            continue;
        }
        if state.resolved.load_balancing.distance(&host) == HostDistance::Ignored {
            state.tried.lock().insert(
                host.address(),
                DriverError::ConnectionClosed("host is ignored".to_string()),
            );
            continue;
        }
        let Some(pool) = host.pool() else {
            state.tried.lock().insert(
                host.address(),
                DriverError::ConnectionClosed("host has no pool".to_string()),
            );
            continue;
        };
        match pool.borrow_connection().await {
            Ok(connection) => return Ok((host, connection)),
            Err(error) => {
                debug!(host = %host.address(), %error, "borrow failed");
                state.tried.lock().insert(host.address(), error);
            }
        }
    }
}

/// Re-prepare the statement on the coordinator that reported it unknown,
/// updating the shared payload for subsequent attempts.
async fn reprepare_in_place(state: &Arc<RequestState>, host: &Arc<Host>) -> Result<()> {
    let Payload::Execute { prepared, .. } = &state.payload else {
        return Err(DriverError::Protocol(
            "server reported unprepared for a simple statement".to_string(),
        ));
    };
    let current = state
        .reprepared
        .lock()
        .clone()
        .unwrap_or_else(|| Arc::clone(prepared));
    debug!(host = %host.address(), query = current.query, "re-preparing after unprepared response");

    let result = state
        .shared
        .prepare_backend
        .prepare_on(host, current.keyspace.as_deref(), &current.query)
        .await?;
    let updated = Arc::new(PreparedStatement {
        id: result.id,
        query: current.query.clone(),
        keyspace: current.keyspace.clone(),
        pk_indexes: result.pk_indexes,
        parameters: result.parameters,
        result_columns: result.result_columns,
    });
    *state.reprepared.lock() = Some(updated);
    Ok(())
}

fn build_request(state: &Arc<RequestState>, consistency: Consistency) -> Result<Request> {
    let resolved = &state.resolved;
    match &state.payload {
        Payload::Query(statement) => Ok(Request::Query {
            query: statement.query.clone(),
            parameters: QueryParameters {
                consistency: Some(consistency),
                values: statement.values.clone(),
                named_values: statement.named_values.clone(),
                value_types: None,
                skip_metadata: false,
                page_size: Some(resolved.fetch_size),
                paging_state: resolved.paging_state.clone(),
                serial_consistency: Some(resolved.serial_consistency),
                default_timestamp: resolved.timestamp,
            },
        }),
        Payload::Execute {
            statement,
            prepared,
        } => {
            let effective = state
                .reprepared
                .lock()
                .clone()
                .unwrap_or_else(|| Arc::clone(prepared));
            let value_types = if effective.parameters.is_empty() {
                None
            } else {
                Some(
                    effective
                        .parameters
                        .iter()
                        .map(|column| column.cql_type.clone())
                        .collect(),
                )
            };
            Ok(Request::Execute {
                id: effective.id.clone(),
                parameters: QueryParameters {
                    consistency: Some(consistency),
                    values: resolve_named(statement, &effective)?,
                    named_values: None,
                    value_types,
                    skip_metadata: false,
                    page_size: Some(resolved.fetch_size),
                    paging_state: resolved.paging_state.clone(),
                    serial_consistency: Some(resolved.serial_consistency),
                    default_timestamp: resolved.timestamp,
                },
            })
        }
        Payload::Batch { kind, children } => Ok(Request::Batch {
            kind: *kind,
            children: children.clone(),
            consistency,
            serial_consistency: Some(resolved.serial_consistency),
            default_timestamp: resolved.timestamp,
        }),
    }
}

/// Positional values pass through; named values are resolved against the
/// prepared parameter metadata.
fn resolve_named(
    statement: &Statement,
    prepared: &PreparedStatement,
) -> Result<Vec<QueryValue>> {
    let Some(named) = &statement.named_values else {
        return Ok(statement.values.clone());
    };
    let mut resolved = Vec::with_capacity(prepared.parameters.len());
    for column in &prepared.parameters {
        let value = named
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&column.name))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                DriverError::Argument(format!(
                    "no value supplied for named parameter '{}'",
                    column.name
                ))
            })?;
        resolved.push(value);
    }
    Ok(resolved)
}

fn response_to_result(response: Response) -> Result<ResultSet> {
    match response {
        Response::Result(ResultResponse::Void) => Ok(ResultSet::default()),
        Response::Result(ResultResponse::Rows(rows)) => Ok(ResultSet {
            columns: rows.columns,
            rows: rows.rows,
            paging_state: rows.paging_state,
            ..Default::default()
        }),
        Response::Result(ResultResponse::SetKeyspace(keyspace)) => Ok(ResultSet {
            keyspace_set: Some(keyspace),
            ..Default::default()
        }),
        Response::Result(ResultResponse::SchemaChange(change)) => Ok(ResultSet {
            schema_change: Some(change),
            ..Default::default()
        }),
        Response::Result(ResultResponse::Prepared(_)) => Err(DriverError::Protocol(
            "unexpected PREPARED result for an execute request".to_string(),
        )),
        other => Err(DriverError::Protocol(format!(
            "unexpected response kind: {other:?}"
        ))),
    }
}

fn empty_result(host: SocketAddr) -> ResultSet {
    ResultSet {
        queried_host: Some(host),
        ..Default::default()
    }
}

fn track_success(
    state: &Arc<RequestState>,
    host: SocketAddr,
    request_len: usize,
    response_len: usize,
    latency: std::time::Duration,
) {
    if let Some(tracker) = &state.shared.tracker {
        tracker.on_success(
            host,
            state.payload.query_text(),
            request_len,
            response_len,
            latency,
        );
    }
}

fn track_error(
    state: &Arc<RequestState>,
    host: SocketAddr,
    error: &DriverError,
    latency: std::time::Duration,
) {
    if let Some(tracker) = &state.shared.tracker {
        tracker.on_error(host, state.payload.query_text(), 0, error, latency);
    }
}

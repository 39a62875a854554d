// A single multiplexed connection to one node
//
// One connection owns one transport. Requests acquire a stream id, park a
// completion channel in the in-flight map and enqueue their frame on a
// coalescing write queue; a read loop carves response frames out of the
// socket and completes them by stream id. A maintenance loop heartbeats
// idle connections and lets the stream-id stack shrink.
//
// State machine:
//
//   Opening --STARTUP/AUTH--> Ready
//   Opening --error---------> Defunct
//   Ready   --socket error--> Defunct
//   Ready   --close()-------> Closing --> Closed
//
// Defunct is terminal; entering it completes every in-flight request with a
// connection error exactly once.

pub mod auth;
pub mod stream_ids;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{DriverError, Result};
use crate::frame::response::{ParsedResponse, Response, ServerEvent};
use crate::frame::{Frame, FrameCodec, FrameCompressor, FrameFlags, ProtocolVersion, Request};
use auth::AuthProvider;
use stream_ids::StreamIdStack;

/// Object-safe transport bound; satisfied by `TcpStream`, TLS wrappers and
/// in-memory duplex pipes alike.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Dials transports for new connections. Pluggable so pools and the control
/// connection stay transport-agnostic.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: SocketAddr) -> Result<Box<dyn Transport>>;
}

/// Plain TCP connector.
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector {
            connect_timeout: Duration::from_millis(5000),
            tcp_nodelay: true,
        }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: SocketAddr) -> Result<Box<dyn Transport>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| {
                DriverError::IoMessage(format!(
                    "connect to {endpoint} timed out after {:?}",
                    self.connect_timeout
                ))
            })??;
        stream.set_nodelay(self.tcp_nodelay)?;
        Ok(Box::new(stream))
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Ready,
    Defunct,
    Closing,
    Closed,
}

/// Per-connection tuning, resolved from client options by the pool.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub version: ProtocolVersion,
    pub compressor: Option<Arc<dyn FrameCompressor>>,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    /// Default per-request deadline.
    pub read_timeout: Duration,
    /// Idle time before a heartbeat is issued; zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Cumulative request timeouts before the connection is defuncted.
    pub defunct_read_timeout_threshold: usize,
    /// Write-queue flush threshold.
    pub coalesce_flush_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            version: ProtocolVersion::MAX,
            compressor: None,
            auth_provider: None,
            read_timeout: Duration::from_millis(12_000),
            heartbeat_interval: Duration::from_millis(30_000),
            defunct_read_timeout_threshold: 64,
            coalesce_flush_bytes: 64 * 1024,
        }
    }
}

/// Atomic counters exposed for pool decisions and trackers.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub timed_out: AtomicU64,
}

/// A request's response frame plus byte accounting for trackers.
#[derive(Debug)]
pub struct ConnectionResponse {
    pub parsed: ParsedResponse,
    pub request_len: usize,
    pub response_len: usize,
}

enum WriteCommand {
    Frame(BytesMut),
    Shutdown,
}

struct InFlight {
    /// Distinguishes this registration from a later reuse of the same
    /// stream id, so a stale timeout or cancellation cannot evict a
    /// successor's entry.
    seq: u64,
    tx: oneshot::Sender<Result<Frame>>,
}

pub struct Connection {
    endpoint: SocketAddr,
    codec: FrameCodec,
    config: ConnectionConfig,
    stream_ids: Mutex<StreamIdStack>,
    /// Stream ids whose requester gave up (timeout or cancellation); they
    /// are only reusable once the late response arrives.
    orphaned: Mutex<HashSet<i16>>,
    inflight: DashMap<i16, InFlight>,
    next_seq: AtomicU64,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    keyspace: Mutex<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
    consecutive_timeouts: AtomicUsize,
    last_read: Mutex<Instant>,
    stats: ConnectionStats,
    event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
}

impl Connection {
    /// Dial `endpoint` and run the connection through STARTUP (and the auth
    /// exchange when demanded) before handing it out Ready.
    pub async fn establish(
        endpoint: SocketAddr,
        connector: &dyn Connector,
        config: ConnectionConfig,
        event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Result<Arc<Connection>> {
        let transport = connector.connect(endpoint).await?;
        Connection::open(endpoint, transport, config, event_tx).await
    }

    /// Build a connection over an already-established transport.
    pub async fn open(
        endpoint: SocketAddr,
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        event_tx: Option<mpsc::UnboundedSender<ServerEvent>>,
    ) -> Result<Arc<Connection>> {
        let mut codec = FrameCodec::new(config.version);
        if let Some(compressor) = &config.compressor {
            codec = codec.with_compressor(Arc::clone(compressor));
        }

        let (read_half, write_half) = tokio::io::split(transport);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Opening);
        let stream_ids = StreamIdStack::new(config.version);

        let connection = Arc::new(Connection {
            endpoint,
            codec,
            config,
            stream_ids: Mutex::new(stream_ids),
            orphaned: Mutex::new(HashSet::new()),
            inflight: DashMap::new(),
            next_seq: AtomicU64::new(0),
            write_tx,
            keyspace: Mutex::new(None),
            state_tx,
            consecutive_timeouts: AtomicUsize::new(0),
            last_read: Mutex::new(Instant::now()),
            stats: ConnectionStats::default(),
            event_tx,
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&connection),
            write_rx,
            write_half,
            connection.config.coalesce_flush_bytes,
        ));
        tokio::spawn(read_loop(Arc::downgrade(&connection), read_half));

        if let Err(error) = connection.startup().await {
            connection.defunct(&format!("startup failed: {error}"));
            return Err(error);
        }

        connection
            .state_tx
            .send_if_modified(|state| {
                if *state == ConnectionState::Opening {
                    *state = ConnectionState::Ready;
                    true
                } else {
                    false
                }
            });
        if connection.state() != ConnectionState::Ready {
            return Err(DriverError::ConnectionClosed(
                "connection became defunct during startup".to_string(),
            ));
        }

        tokio::spawn(maintenance_loop(Arc::downgrade(&connection)));
        debug!(endpoint = %endpoint, version = %connection.config.version, "connection ready");
        Ok(connection)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.version
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Requests currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Keyspace this connection is pinned to, if any.
    pub fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().clone()
    }

    /// Issue a request with the default read timeout.
    pub async fn request(&self, request: &Request) -> Result<ConnectionResponse> {
        self.request_with_timeout(request, self.config.read_timeout)
            .await
    }

    /// Issue a request with an explicit per-attempt deadline. ERROR
    /// responses come back as `DriverError::Response`.
    pub async fn request_with_timeout(
        &self,
        request: &Request,
        deadline: Duration,
    ) -> Result<ConnectionResponse> {
        match self.state() {
            ConnectionState::Opening | ConnectionState::Ready => {}
            other => {
                return Err(DriverError::ConnectionClosed(format!(
                    "connection to {} is {other:?}",
                    self.endpoint
                )))
            }
        }

        let stream = self
            .stream_ids
            .lock()
            .pop()
            .ok_or(DriverError::Saturated)?;

        let body = match request.encode_body(self.config.version) {
            Ok(body) => body,
            Err(error) => {
                self.stream_ids.lock().push(stream);
                return Err(error);
            }
        };
        let frame_bytes =
            match self
                .codec
                .encode(stream, request.opcode(), FrameFlags::default(), &body)
            {
                Ok(bytes) => bytes,
                Err(error) => {
                    self.stream_ids.lock().push(stream);
                    return Err(error);
                }
            };
        let request_len = frame_bytes.len();

        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inflight.insert(stream, InFlight { seq, tx });
        if self.write_tx.send(WriteCommand::Frame(frame_bytes)).is_err() {
            self.inflight.remove(&stream);
            self.stream_ids.lock().push(stream);
            return Err(DriverError::ConnectionClosed(format!(
                "write queue of {} is gone",
                self.endpoint
            )));
        }
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        // Guards the in-flight entry against cancellation: dropping this
        // future mid-await must not leak the entry or reissue the id while
        // a response may still arrive.
        let mut guard = PendingGuard {
            connection: self,
            stream,
            seq,
            armed: true,
        };

        let started = Instant::now();
        match timeout(deadline, rx).await {
            Ok(Ok(frame_result)) => {
                guard.armed = false;
                let frame = frame_result?;
                self.consecutive_timeouts.store(0, Ordering::Relaxed);
                let response_len = frame.body.len() + self.config.version.header_len();
                let parsed = ParsedResponse::parse(&frame, self.config.version)?;
                if let Response::Error(error) = parsed.response {
                    return Err(DriverError::Response(error));
                }
                Ok(ConnectionResponse {
                    parsed,
                    request_len,
                    response_len,
                })
            }
            Ok(Err(_sender_dropped)) => {
                guard.armed = false;
                Err(DriverError::ConnectionClosed(format!(
                    "connection to {} closed while awaiting response",
                    self.endpoint
                )))
            }
            Err(_elapsed) => {
                guard.armed = false;
                // Release the in-flight entry now; the id itself stays
                // orphaned until the late response arrives
                if self.evict_own_entry(stream, seq) {
                    self.orphan_stream(stream);
                }
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                if timeouts >= self.config.defunct_read_timeout_threshold {
                    self.defunct(&format!(
                        "{timeouts} consecutive requests timed out"
                    ));
                }
                Err(DriverError::OperationTimedOut {
                    endpoint: self.endpoint,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Pin this connection to a keyspace with a USE request. No-op when
    /// already pinned to the same keyspace.
    pub async fn set_keyspace(&self, keyspace: &str) -> Result<()> {
        if self.keyspace.lock().as_deref() == Some(keyspace) {
            return Ok(());
        }
        let request = Request::Query {
            query: format!("USE \"{keyspace}\""),
            parameters: Default::default(),
        };
        let response = self.request(&request).await?;
        match response.parsed.response {
            Response::Result(crate::frame::ResultResponse::SetKeyspace(name)) => {
                *self.keyspace.lock() = Some(name);
                Ok(())
            }
            other => Err(DriverError::Protocol(format!(
                "unexpected response to USE: {other:?}"
            ))),
        }
    }

    /// Record the keyspace without a round trip (used when the session has
    /// already switched it via this very connection).
    pub fn note_keyspace(&self, keyspace: &str) {
        *self.keyspace.lock() = Some(keyspace.to_string());
    }

    /// Force the connection into the terminal Defunct state, completing
    /// every in-flight request with a connection error exactly once.
    pub fn defunct(&self, reason: &str) {
        let transitioned = self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Opening | ConnectionState::Ready => {
                *state = ConnectionState::Defunct;
                true
            }
            _ => false,
        });
        if !transitioned {
            return;
        }
        warn!(endpoint = %self.endpoint, reason, "connection defunct");
        self.fail_inflight(DriverError::ConnectionClosed(format!(
            "connection to {} is defunct: {reason}",
            self.endpoint
        )));
        let _ = self.write_tx.send(WriteCommand::Shutdown);
    }

    /// Orderly close: Ready -> Closing -> Closed. Idempotent.
    pub async fn close(&self) {
        let transitioned = self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Opening | ConnectionState::Ready => {
                *state = ConnectionState::Closing;
                true
            }
            _ => false,
        });
        if !transitioned {
            return;
        }
        self.fail_inflight(DriverError::ConnectionClosed(format!(
            "connection to {} is closing",
            self.endpoint
        )));
        let _ = self.write_tx.send(WriteCommand::Shutdown);
        self.state_tx.send_if_modified(|state| {
            *state = ConnectionState::Closed;
            true
        });
        trace!(endpoint = %self.endpoint, "connection closed");
    }

    fn fail_inflight(&self, error: DriverError) {
        let streams: Vec<i16> = self.inflight.iter().map(|entry| *entry.key()).collect();
        for stream in streams {
            if let Some((_, entry)) = self.inflight.remove(&stream) {
                let _ = entry.tx.send(Err(error.clone()));
            }
        }
        self.orphaned.lock().clear();
    }

    fn orphan_stream(&self, stream: i16) {
        self.orphaned.lock().insert(stream);
    }

    /// Remove this request's in-flight entry, but never a successor that
    /// reused the same stream id.
    fn evict_own_entry(&self, stream: i16, seq: u64) -> bool {
        self.inflight
            .remove_if(&stream, |_, entry| entry.seq == seq)
            .is_some()
    }

    async fn startup(self: &Arc<Self>) -> Result<()> {
        let startup = Request::Startup {
            cql_version: "3.0.0".to_string(),
            compression: self.codec.compressor_name().map(str::to_string),
        };
        let response = self.request(&startup).await?;
        match response.parsed.response {
            Response::Ready => Ok(()),
            Response::Authenticate { authenticator } => self.authenticate(&authenticator).await,
            other => Err(DriverError::Protocol(format!(
                "unexpected response to STARTUP: {other:?}"
            ))),
        }
    }

    async fn authenticate(&self, authenticator_name: &str) -> Result<()> {
        let provider = self.config.auth_provider.as_ref().ok_or_else(|| {
            DriverError::Authentication(format!(
                "host {} requires authentication ({authenticator_name}) but no auth provider is configured",
                self.endpoint
            ))
        })?;
        let mut authenticator = provider.new_authenticator(self.endpoint, authenticator_name)?;
        let mut token = authenticator.initial_response()?;

        loop {
            let request = Request::AuthResponse { token: token.take() };
            let response = match self.request(&request).await {
                Ok(response) => response,
                Err(DriverError::Response(error))
                    if error.error_code() == crate::error::ErrorCode::BadCredentials =>
                {
                    return Err(DriverError::Authentication(error.message));
                }
                Err(other) => return Err(other),
            };
            match response.parsed.response {
                Response::AuthSuccess { token: final_token } => {
                    authenticator.on_authentication_success(final_token.as_deref());
                    return Ok(());
                }
                Response::AuthChallenge { token: challenge } => {
                    token = authenticator.evaluate_challenge(challenge.as_deref())?;
                }
                other => {
                    return Err(DriverError::Protocol(format!(
                        "unexpected response during auth exchange: {other:?}"
                    )))
                }
            }
        }
    }

    /// Route one decoded frame to its requester, an orphan slot, or the
    /// event channel. Unknown stream ids mean the framing is corrupt.
    fn dispatch(self: &Arc<Self>, frame: Frame) {
        self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
        let stream = frame.stream();
        if stream < 0 {
            match ParsedResponse::parse(&frame, self.config.version) {
                Ok(parsed) => {
                    if let Response::Event(event) = parsed.response {
                        if let Some(event_tx) = &self.event_tx {
                            let _ = event_tx.send(event);
                        }
                    }
                }
                Err(error) => {
                    self.defunct(&format!("undecodable event frame: {error}"));
                }
            }
            return;
        }

        if let Some((_, entry)) = self.inflight.remove(&stream) {
            self.stream_ids.lock().push(stream);
            let _ = entry.tx.send(Ok(frame));
        } else if self.orphaned.lock().remove(&stream) {
            // Late response to a timed-out or cancelled request; the id
            // only now becomes reusable.
            self.stream_ids.lock().push(stream);
            trace!(endpoint = %self.endpoint, stream, "late response for orphaned stream");
        } else {
            self.defunct(&format!("response for unknown stream id {stream}"));
        }
    }

    fn note_read_activity(&self, bytes: usize) {
        *self.last_read.lock() = Instant::now();
        self.stats
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.write_tx.send(WriteCommand::Shutdown);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Removes the in-flight entry when a request future is dropped before its
/// response arrives; the id is orphaned, not reissued.
struct PendingGuard<'a> {
    connection: &'a Connection,
    stream: i16,
    seq: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.connection.evict_own_entry(self.stream, self.seq) {
            self.connection.orphan_stream(self.stream);
        }
    }
}

async fn write_loop(
    connection: Weak<Connection>,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut writer: WriteHalf<Box<dyn Transport>>,
    flush_threshold: usize,
) {
    let mut buf = BytesMut::with_capacity(flush_threshold);
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Shutdown => break,
            WriteCommand::Frame(frame) => {
                buf.extend_from_slice(&frame);
                // Coalesce whatever is already queued, up to the threshold
                while buf.len() < flush_threshold {
                    match rx.try_recv() {
                        Ok(WriteCommand::Frame(more)) => buf.extend_from_slice(&more),
                        Ok(WriteCommand::Shutdown) | Err(_) => break,
                    }
                }
                let write_result = async {
                    writer.write_all(&buf).await?;
                    writer.flush().await
                }
                .await;
                if let Some(connection) = connection.upgrade() {
                    match write_result {
                        Ok(()) => {
                            connection
                                .stats
                                .bytes_sent
                                .fetch_add(buf.len() as u64, Ordering::Relaxed);
                        }
                        Err(error) => {
                            connection.defunct(&format!("socket write failed: {error}"));
                            return;
                        }
                    }
                } else if write_result.is_err() {
                    return;
                }
                buf.clear();
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(connection: Weak<Connection>, mut reader: ReadHalf<Box<dyn Transport>>) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                if let Some(connection) = connection.upgrade() {
                    connection.defunct("connection closed by peer");
                }
                return;
            }
            Ok(n) => {
                let Some(connection) = connection.upgrade() else {
                    return;
                };
                connection.note_read_activity(n);
                loop {
                    match connection.codec.decode(&mut buf) {
                        Ok(Some(frame)) => connection.dispatch(frame),
                        Ok(None) => break,
                        Err(error) => {
                            connection.defunct(&format!("frame decode failed: {error}"));
                            return;
                        }
                    }
                }
                if connection.state() == ConnectionState::Defunct {
                    return;
                }
            }
            Err(error) => {
                if let Some(connection) = connection.upgrade() {
                    connection.defunct(&format!("socket read failed: {error}"));
                }
                return;
            }
        }
    }
}

/// Ticks once a second: lets the stream-id stack run a pending shrink and
/// issues a heartbeat OPTIONS when the connection has been idle too long.
async fn maintenance_loop(connection: Weak<Connection>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if !connection.is_ready() {
            return;
        }
        connection.stream_ids.lock().maybe_shrink();

        let heartbeat_interval = connection.config.heartbeat_interval;
        if heartbeat_interval.is_zero() {
            continue;
        }
        let idle_for = connection.last_read.lock().elapsed();
        if idle_for < heartbeat_interval {
            continue;
        }
        trace!(endpoint = %connection.endpoint, "sending heartbeat");
        let heartbeat = connection
            .request_with_timeout(&Request::Options, connection.config.read_timeout)
            .await;
        if let Err(error) = heartbeat {
            connection.defunct(&format!("heartbeat failed: {error}"));
            return;
        }
    }
}

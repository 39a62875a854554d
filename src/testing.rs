// In-process protocol peers for tests
//
// A `MockNode` speaks the server side of the native protocol over an
// in-memory duplex pipe: STARTUP/AUTH/OPTIONS/REGISTER are answered with
// the standard handshake, data requests flow through a per-test handler
// with sensible defaults. A `MockCluster` groups nodes behind a `Connector`
// and serves the system.local / system.peers catalogue so discovery runs
// against it unchanged.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::codec::{serialize, CqlType, CqlValue};
use crate::connection::{Connector, Transport};
use crate::error::{DriverError, Result};
use crate::frame::header::{Direction, FrameFlags, FrameHeader, Opcode};
use crate::frame::notation::{self, Reader};
use crate::frame::ProtocolVersion;

/// What a handler may answer to a data request.
#[derive(Clone)]
pub enum MockReply {
    Void,
    SetKeyspace(String),
    Rows {
        columns: Vec<(String, CqlType)>,
        rows: Vec<Vec<Option<CqlValue>>>,
    },
    Prepared {
        id: Vec<u8>,
        pk_indexes: Vec<u16>,
        parameters: Vec<(String, CqlType)>,
    },
    Error {
        code: u32,
        message: String,
    },
    Unprepared {
        id: Vec<u8>,
    },
    NoReply,
    Delayed {
        delay: Duration,
        reply: Box<MockReply>,
    },
}

/// A data request as seen by a handler.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub endpoint: SocketAddr,
    pub opcode: Opcode,
    pub query: Option<String>,
    pub execute_id: Option<Vec<u8>>,
}

pub type QueryHandler = Arc<dyn Fn(&MockRequest) -> Option<MockReply> + Send + Sync>;

/// Topology row served for this node in the peers catalogue.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub data_center: String,
    pub rack: String,
    pub tokens: Vec<String>,
}

impl Default for NodeMeta {
    fn default() -> Self {
        NodeMeta {
            data_center: "dc1".to_string(),
            rack: "rack1".to_string(),
            tokens: vec!["0".to_string()],
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBehavior {
    pub require_auth: bool,
    /// Never answer QUERY/PREPARE/EXECUTE/BATCH (handshake still works).
    pub swallow_queries: bool,
    /// Respond to STARTUP with a protocol error when the client offers a
    /// higher version, to exercise negotiation downgrades.
    pub reject_versions_above: Option<u8>,
    pub meta: NodeMeta,
    pub handler: Option<QueryHandler>,
    /// Fixed delay before answering data requests.
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MockCounters {
    pub connections: AtomicUsize,
    pub startups: AtomicUsize,
    pub queries: AtomicUsize,
    pub prepares: AtomicUsize,
    pub executes: AtomicUsize,
    pub batches: AtomicUsize,
}

struct NodeInner {
    endpoint: SocketAddr,
    behavior: MockBehavior,
    counters: MockCounters,
    alive: AtomicBool,
    prepared: Mutex<HashSet<Vec<u8>>>,
    pushers: Mutex<Vec<mpsc::UnboundedSender<BytesMut>>>,
    conn_kills: Mutex<Vec<oneshot::Sender<()>>>,
    cluster: Mutex<Weak<ClusterInner>>,
}

#[derive(Clone)]
pub struct MockNode {
    inner: Arc<NodeInner>,
}

impl MockNode {
    pub fn spawn(behavior: MockBehavior) -> MockNode {
        MockNode::spawn_at("127.0.0.1:9042".parse().unwrap(), behavior)
    }

    pub fn spawn_at(endpoint: SocketAddr, behavior: MockBehavior) -> MockNode {
        MockNode {
            inner: Arc::new(NodeInner {
                endpoint,
                behavior,
                counters: MockCounters::default(),
                alive: AtomicBool::new(true),
                prepared: Mutex::new(HashSet::new()),
                pushers: Mutex::new(Vec::new()),
                conn_kills: Mutex::new(Vec::new()),
                cluster: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.inner.endpoint
    }

    pub fn counters(&self) -> &MockCounters {
        &self.inner.counters
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner.alive.store(alive, Ordering::SeqCst);
    }

    /// Drop every open connection to this node.
    pub fn kill_connections(&self) {
        for kill in self.inner.conn_kills.lock().drain(..) {
            let _ = kill.send(());
        }
        self.inner.pushers.lock().clear();
    }

    /// Push an EVENT frame (stream -1) to every open connection.
    pub fn push_status_event(&self, change: &str, address: SocketAddr) {
        let mut body = BytesMut::new();
        notation::write_string(&mut body, "STATUS_CHANGE");
        notation::write_string(&mut body, change);
        write_inet(&mut body, address);
        self.push_event_body(body);
    }

    pub fn push_topology_event(&self, change: &str, address: SocketAddr) {
        let mut body = BytesMut::new();
        notation::write_string(&mut body, "TOPOLOGY_CHANGE");
        notation::write_string(&mut body, change);
        write_inet(&mut body, address);
        self.push_event_body(body);
    }

    fn push_event_body(&self, body: BytesMut) {
        let frame = response_frame(ProtocolVersion::MAX, -1, Opcode::Event, body);
        for pusher in self.inner.pushers.lock().iter() {
            let _ = pusher.send(frame.clone());
        }
    }

    /// Open a client transport to this node; a server task drives the
    /// other end of the pipe.
    pub fn dial(&self) -> Box<dyn Transport> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.inner.pushers.lock().push(push_tx.clone());
        self.inner.conn_kills.lock().push(kill_tx);
        self.inner.counters.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_connection(
            Arc::clone(&self.inner),
            server,
            push_tx,
            push_rx,
            kill_rx,
        ));
        Box::new(client)
    }
}

struct ClusterInner {
    nodes: Mutex<Vec<MockNode>>,
}

/// A set of mock nodes with a shared peers catalogue, usable as the
/// driver's `Connector`.
#[derive(Clone)]
pub struct MockCluster {
    inner: Arc<ClusterInner>,
}

impl MockCluster {
    pub fn new(nodes: Vec<MockNode>) -> MockCluster {
        let cluster = MockCluster {
            inner: Arc::new(ClusterInner {
                nodes: Mutex::new(nodes),
            }),
        };
        for node in cluster.inner.nodes.lock().iter() {
            *node.inner.cluster.lock() = Arc::downgrade(&cluster.inner);
        }
        cluster
    }

    /// Shorthand: n nodes at 127.0.0.{1..n}:9042 with the same behavior.
    pub fn homogeneous(count: usize, behavior: impl Fn(usize) -> MockBehavior) -> MockCluster {
        let nodes = (0..count)
            .map(|i| {
                let endpoint: SocketAddr = format!("127.0.0.{}:9042", i + 1).parse().unwrap();
                MockNode::spawn_at(endpoint, behavior(i))
            })
            .collect();
        MockCluster::new(nodes)
    }

    pub fn node(&self, endpoint: SocketAddr) -> Option<MockNode> {
        self.inner
            .nodes
            .lock()
            .iter()
            .find(|node| node.endpoint() == endpoint)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<MockNode> {
        self.inner.nodes.lock().clone()
    }
}

#[async_trait::async_trait]
impl Connector for MockCluster {
    async fn connect(&self, endpoint: SocketAddr) -> Result<Box<dyn Transport>> {
        let node = self.node(endpoint).ok_or_else(|| {
            DriverError::IoMessage(format!("no route to {endpoint}"))
        })?;
        if !node.inner.alive.load(Ordering::SeqCst) {
            return Err(DriverError::IoMessage(format!(
                "connection refused by {endpoint}"
            )));
        }
        Ok(node.dial())
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

async fn serve_connection(
    node: Arc<NodeInner>,
    stream: tokio::io::DuplexStream,
    push_tx: mpsc::UnboundedSender<BytesMut>,
    mut push_rx: mpsc::UnboundedReceiver<BytesMut>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut read_chunk = [0u8; 8 * 1024];
    loop {
        tokio::select! {
            _ = &mut kill_rx => return,
            outgoing = push_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            read = read_half.read(&mut read_chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&read_chunk[..n]);
                while let Some((header, body)) = take_request(&mut buf) {
                    handle_request(&node, &push_tx, header, body).await;
                }
            }
        }
    }
}

/// Carve one v3+-framed request off the buffer.
fn take_request(buf: &mut BytesMut) -> Option<(FrameHeader, Bytes)> {
    if buf.len() < 9 {
        return None;
    }
    let body_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    if buf.len() < 9 + body_len {
        return None;
    }
    let mut frame = buf.split_to(9 + body_len);
    let version = ProtocolVersion::from_byte(frame[0]).ok()?;
    let stream = i16::from_be_bytes([frame[2], frame[3]]);
    let opcode = Opcode::from_byte(frame[4]).ok()?;
    let body = frame.split_off(9).freeze();
    Some((
        FrameHeader {
            version,
            direction: Direction::Request,
            flags: FrameFlags::new(frame[1]),
            stream,
            opcode,
            body_length: body_len as u32,
        },
        body,
    ))
}

async fn handle_request(
    node: &Arc<NodeInner>,
    push_tx: &mpsc::UnboundedSender<BytesMut>,
    header: FrameHeader,
    body: Bytes,
) {
    let version = header.version;
    let stream = header.stream;
    match header.opcode {
        Opcode::Startup => {
            node.counters.startups.fetch_add(1, Ordering::SeqCst);
            if let Some(ceiling) = node.behavior.reject_versions_above {
                if version.as_byte() > ceiling {
                    let mut error_body = BytesMut::new();
                    error_body.put_i32(0x000A);
                    notation::write_string(
                        &mut error_body,
                        &format!("Invalid or unsupported protocol version ({})", version.as_byte()),
                    );
                    let _ = push_tx.send(response_frame(version, stream, Opcode::Error, error_body));
                    return;
                }
            }
            if node.behavior.require_auth {
                let mut auth_body = BytesMut::new();
                notation::write_string(
                    &mut auth_body,
                    "org.apache.cassandra.auth.PasswordAuthenticator",
                );
                let _ = push_tx.send(response_frame(version, stream, Opcode::Authenticate, auth_body));
            } else {
                let _ = push_tx.send(response_frame(version, stream, Opcode::Ready, BytesMut::new()));
            }
        }
        Opcode::AuthResponse => {
            let _ = push_tx.send(response_frame(
                version,
                stream,
                Opcode::AuthSuccess,
                {
                    let mut body = BytesMut::new();
                    notation::write_bytes(&mut body, None);
                    body
                },
            ));
        }
        Opcode::Options => {
            let mut supported = BytesMut::new();
            supported.put_u16(2);
            notation::write_string(&mut supported, "CQL_VERSION");
            notation::write_string_list(&mut supported, &["3.0.0".to_string()]);
            notation::write_string(&mut supported, "COMPRESSION");
            notation::write_string_list(&mut supported, &[]);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Supported, supported));
        }
        Opcode::Register => {
            let _ = push_tx.send(response_frame(version, stream, Opcode::Ready, BytesMut::new()));
        }
        Opcode::Query | Opcode::Prepare | Opcode::Execute | Opcode::Batch => {
            let request = parse_data_request(node.endpoint, header.opcode, &body);
            match header.opcode {
                Opcode::Query => node.counters.queries.fetch_add(1, Ordering::SeqCst),
                Opcode::Prepare => node.counters.prepares.fetch_add(1, Ordering::SeqCst),
                Opcode::Execute => node.counters.executes.fetch_add(1, Ordering::SeqCst),
                _ => node.counters.batches.fetch_add(1, Ordering::SeqCst),
            };
            if node.behavior.swallow_queries {
                return;
            }
            let reply = node
                .behavior
                .handler
                .as_ref()
                .and_then(|handler| handler(&request))
                .unwrap_or_else(|| default_reply(node, &request));
            let reply = match node.behavior.delay {
                Some(delay) => MockReply::Delayed {
                    delay,
                    reply: Box::new(reply),
                },
                None => reply,
            };
            send_reply(node, push_tx, version, stream, reply);
        }
        _ => {
            let mut error_body = BytesMut::new();
            error_body.put_i32(0x000A);
            notation::write_string(&mut error_body, "unexpected request opcode");
            let _ = push_tx.send(response_frame(version, stream, Opcode::Error, error_body));
        }
    }
}

fn send_reply(
    node: &Arc<NodeInner>,
    push_tx: &mpsc::UnboundedSender<BytesMut>,
    version: ProtocolVersion,
    stream: i16,
    reply: MockReply,
) {
    match reply {
        MockReply::NoReply => {}
        MockReply::Delayed { delay, reply } => {
            let node = Arc::clone(node);
            let push_tx = push_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                send_reply(&node, &push_tx, version, stream, *reply);
            });
        }
        MockReply::Void => {
            let mut body = BytesMut::new();
            body.put_i32(0x0001);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Result, body));
        }
        MockReply::SetKeyspace(keyspace) => {
            let mut body = BytesMut::new();
            body.put_i32(0x0003);
            notation::write_string(&mut body, &keyspace);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Result, body));
        }
        MockReply::Rows { columns, rows } => {
            let body = rows_body(version, &columns, &rows);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Result, body));
        }
        MockReply::Prepared {
            id,
            pk_indexes,
            parameters,
        } => {
            node.prepared.lock().insert(id.clone());
            let mut body = BytesMut::new();
            body.put_i32(0x0004);
            notation::write_short_bytes(&mut body, &id);
            // parameter metadata
            body.put_i32(0x0001); // global tables spec
            body.put_i32(parameters.len() as i32);
            if version >= ProtocolVersion::V4 {
                body.put_i32(pk_indexes.len() as i32);
                for index in &pk_indexes {
                    body.put_u16(*index);
                }
            }
            notation::write_string(&mut body, "ks");
            notation::write_string(&mut body, "t");
            for (name, cql_type) in &parameters {
                notation::write_string(&mut body, name);
                write_type(&mut body, cql_type);
            }
            // empty result metadata
            body.put_i32(0);
            body.put_i32(0);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Result, body));
        }
        MockReply::Error { code, message } => {
            let mut body = BytesMut::new();
            body.put_i32(code as i32);
            notation::write_string(&mut body, &message);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Error, body));
        }
        MockReply::Unprepared { id } => {
            let mut body = BytesMut::new();
            body.put_i32(0x2500);
            notation::write_string(&mut body, "Prepared statement not found");
            notation::write_short_bytes(&mut body, &id);
            let _ = push_tx.send(response_frame(version, stream, Opcode::Error, body));
        }
    }
}

fn default_reply(node: &Arc<NodeInner>, request: &MockRequest) -> MockReply {
    match request.opcode {
        Opcode::Prepare => {
            let query = request.query.clone().unwrap_or_default();
            let pk_indexes = if query.contains('?') { vec![0] } else { Vec::new() };
            MockReply::Prepared {
                id: prepared_id(&query),
                pk_indexes,
                parameters: Vec::new(),
            }
        }
        Opcode::Execute => {
            let id = request.execute_id.clone().unwrap_or_default();
            if node.prepared.lock().contains(&id) {
                MockReply::Void
            } else {
                MockReply::Unprepared { id }
            }
        }
        Opcode::Query => {
            let query = request.query.as_deref().unwrap_or_default();
            if query.contains("system.peers") {
                peers_reply(node)
            } else if query.contains("system.local") {
                local_reply(node)
            } else if let Some(rest) = query.strip_prefix("USE ") {
                MockReply::SetKeyspace(rest.trim_matches('"').to_string())
            } else {
                MockReply::Void
            }
        }
        _ => MockReply::Void,
    }
}

/// Deterministic 16-byte id derived from the query text.
pub fn prepared_id(query: &str) -> Vec<u8> {
    let mut id = vec![0u8; 16];
    for (i, byte) in query.bytes().enumerate() {
        id[i % 16] = id[i % 16].wrapping_mul(31).wrapping_add(byte);
    }
    id
}

fn topology_columns() -> Vec<(String, CqlType)> {
    vec![
        ("peer".to_string(), CqlType::Inet),
        ("rpc_address".to_string(), CqlType::Inet),
        ("data_center".to_string(), CqlType::Text),
        ("rack".to_string(), CqlType::Text),
        ("tokens".to_string(), CqlType::Set(Box::new(CqlType::Text))),
        ("release_version".to_string(), CqlType::Text),
    ]
}

fn meta_row(endpoint: SocketAddr, meta: &NodeMeta) -> Vec<Option<CqlValue>> {
    vec![
        Some(CqlValue::Inet(endpoint.ip())),
        Some(CqlValue::Inet(endpoint.ip())),
        Some(CqlValue::Text(meta.data_center.clone())),
        Some(CqlValue::Text(meta.rack.clone())),
        Some(CqlValue::Set(
            meta.tokens.iter().cloned().map(CqlValue::Text).collect(),
        )),
        Some(CqlValue::Text("3.11.4".to_string())),
    ]
}

fn local_reply(node: &Arc<NodeInner>) -> MockReply {
    MockReply::Rows {
        columns: topology_columns(),
        rows: vec![meta_row(node.endpoint, &node.behavior.meta)],
    }
}

fn peers_reply(node: &Arc<NodeInner>) -> MockReply {
    let rows = match node.cluster.lock().upgrade() {
        Some(cluster) => cluster
            .nodes
            .lock()
            .iter()
            .filter(|peer| peer.endpoint() != node.endpoint)
            .map(|peer| meta_row(peer.endpoint(), &peer.inner.behavior.meta))
            .collect(),
        None => Vec::new(),
    };
    MockReply::Rows {
        columns: topology_columns(),
        rows,
    }
}

fn parse_data_request(endpoint: SocketAddr, opcode: Opcode, body: &Bytes) -> MockRequest {
    let mut reader = Reader::new(body);
    let (query, execute_id) = match opcode {
        Opcode::Query | Opcode::Prepare => (reader.read_long_string().ok(), None),
        Opcode::Execute => (None, reader.read_short_bytes().ok().map(<[u8]>::to_vec)),
        _ => (None, None),
    };
    MockRequest {
        endpoint,
        opcode,
        query,
        execute_id,
    }
}

// ---------------------------------------------------------------------------
// Frame encoding helpers
// ---------------------------------------------------------------------------

fn response_frame(
    version: ProtocolVersion,
    stream: i16,
    opcode: Opcode,
    body: BytesMut,
) -> BytesMut {
    let header = FrameHeader {
        version,
        direction: Direction::Response,
        flags: FrameFlags::default(),
        stream,
        opcode,
        body_length: body.len() as u32,
    };
    let mut out = BytesMut::with_capacity(version.header_len() + body.len());
    header.encode(&mut out);
    out.extend_from_slice(&body);
    out
}

fn rows_body(
    version: ProtocolVersion,
    columns: &[(String, CqlType)],
    rows: &[Vec<Option<CqlValue>>],
) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(0x0002);
    body.put_i32(0x0001); // global tables spec
    body.put_i32(columns.len() as i32);
    notation::write_string(&mut body, "ks");
    notation::write_string(&mut body, "t");
    for (name, cql_type) in columns {
        notation::write_string(&mut body, name);
        write_type(&mut body, cql_type);
    }
    body.put_i32(rows.len() as i32);
    for row in rows {
        for (cell, (_, cql_type)) in row.iter().zip(columns) {
            match cell {
                Some(value) => {
                    let bytes = serialize(value, Some(cql_type), version)
                        .expect("mock row value must serialize");
                    notation::write_bytes(&mut body, Some(&bytes));
                }
                None => notation::write_bytes(&mut body, None),
            }
        }
    }
    body
}

fn write_type(out: &mut BytesMut, cql_type: &CqlType) {
    out.put_u16(cql_type.type_code());
    match cql_type {
        CqlType::Custom(class) => notation::write_string(out, class),
        CqlType::List(inner) | CqlType::Set(inner) => write_type(out, inner),
        CqlType::Map(key, value) => {
            write_type(out, key);
            write_type(out, value);
        }
        CqlType::Tuple(parts) => {
            out.put_u16(parts.len() as u16);
            for part in parts {
                write_type(out, part);
            }
        }
        CqlType::Udt(udt) => {
            notation::write_string(out, &udt.keyspace);
            notation::write_string(out, &udt.name);
            out.put_u16(udt.fields.len() as u16);
            for (name, field_type) in &udt.fields {
                notation::write_string(out, name);
                write_type(out, field_type);
            }
        }
        _ => {}
    }
}

fn write_inet(out: &mut BytesMut, address: SocketAddr) {
    match address.ip() {
        std::net::IpAddr::V4(v4) => {
            out.put_u8(4);
            out.put_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            out.put_u8(16);
            out.put_slice(&v6.octets());
        }
    }
    out.put_i32(address.port() as i32);
}


//! Request orchestration: node selection, retries, error translation
//!
//! [`Transport::perform_request`] is the single entry point for everything
//! above this layer. It picks a connection from the pool, delegates the wire
//! call, and walks through up to `max_retries + 1` connections on retryable
//! failures while keeping the pool's liveness view accurate. Topology
//! refresh ("sniffing") lives in the `sniff` submodule.

mod sniff;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::Method;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::warn;

use crate::config::{SendGetBodyAs, TransportConfig};
use crate::connection::{
    Connection, ConnectionFactory, Host, HttpConnectionFactory, WireRequest, WireResponse,
};
use crate::error::{Result, TransportError};
use crate::pool::{same_connection, ConnectionPool, NodePool, SingleNodePool};

use self::sniff::SniffCoordinator;

/// Request body accepted by the transport.
///
/// `Raw` bytes are never inspected or transcoded, so byte sequences that
/// must round-trip exactly (including ones that are not valid UTF-8) pass
/// through unchanged.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Text(String),
    Raw(Bytes),
}

impl RequestBody {
    fn into_bytes(self) -> Result<Bytes> {
        match self {
            RequestBody::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            RequestBody::Text(text) => Ok(Bytes::from(text)),
            RequestBody::Raw(bytes) => Ok(bytes),
        }
    }
}

impl From<Value> for RequestBody {
    fn from(value: Value) -> Self {
        RequestBody::Json(value)
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Text(text)
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Raw(bytes)
    }
}

/// Per-request options: query parameters, body, headers, timeout override
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub params: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    /// `application/json` responses parsed into a generic value
    Json(Value),
    /// Everything else passed through as text
    Text(String),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Decoded response handed back to callers
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl Response {
    pub fn json(&self) -> Option<&Value> {
        self.body.as_json()
    }
}

/// What a single attempt amounted to. The retry loop pattern-matches on
/// this instead of inspecting error types ad hoc.
enum Outcome {
    Success(Response),
    Retryable(TransportError),
    Fatal(TransportError),
}

/// Cluster-aware request transport
pub struct Transport {
    config: TransportConfig,
    factory: Arc<dyn ConnectionFactory>,
    pool: RwLock<Arc<dyn NodePool>>,
    /// Originally configured nodes, kept as a stable fallback for discovery
    /// even after the active pool has been replaced by sniff results
    seed_connections: Vec<Arc<dyn Connection>>,
    sniff: SniffCoordinator,
    last_sniff: Mutex<Instant>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("seeds", &self.seed_connections.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport {
    /// Build a transport over [`HttpConnection`](crate::connection::HttpConnection)s
    pub async fn new(config: TransportConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(HttpConnectionFactory)).await
    }

    /// Build a transport with a custom connection implementation
    pub async fn with_factory(
        config: TransportConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(TransportError::NoConnections);
        }

        let mut hosts = config
            .hosts
            .iter()
            .map(|url| Host::parse(url))
            .collect::<Result<Vec<_>>>()?;
        if config.randomize_hosts {
            hosts.shuffle(&mut rand::thread_rng());
        }

        let seed_connections = hosts
            .iter()
            .map(|host| factory.create(host))
            .collect::<Result<Vec<_>>>()?;
        let pool = Self::build_pool(seed_connections.clone(), &config);

        let transport = Self {
            config,
            factory,
            pool: RwLock::new(pool),
            seed_connections,
            sniff: SniffCoordinator::new(),
            last_sniff: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        };

        if transport.config.sniff_on_start {
            transport.sniff_hosts().await?;
        }

        Ok(transport)
    }

    fn build_pool(
        connections: Vec<Arc<dyn Connection>>,
        config: &TransportConfig,
    ) -> Arc<dyn NodePool> {
        if connections.len() <= 1 {
            Arc::new(SingleNodePool::new(connections))
        } else {
            Arc::new(ConnectionPool::new(
                connections,
                config.selection,
                config.dead_timeout(),
                config.dead_timeout_max(),
            ))
        }
    }

    fn active_pool(&self) -> Arc<dyn NodePool> {
        Arc::clone(&self.pool.read().unwrap())
    }

    pub(crate) fn install_pool(&self, connections: Vec<Arc<dyn Connection>>) {
        *self.pool.write().unwrap() = Self::build_pool(connections, &self.config);
    }

    /// Every connection in the active pool
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.active_pool().connections()
    }

    /// Number of connections the pool currently considers live
    pub fn alive_connections(&self) -> usize {
        self.active_pool().alive_count()
    }

    /// Add one node to the active pool
    pub fn add_connection(&self, host: &Host) -> Result<()> {
        let connection = self.factory.create(host)?;
        let mut connections = self.connections();
        connections.push(connection);
        self.install_pool(connections);
        Ok(())
    }

    /// Replace the active pool with connections for exactly these nodes,
    /// reusing already-open connections where the host matches
    pub fn set_connections(&self, hosts: &[Host]) -> Result<()> {
        let connections = self.connections_for_hosts(hosts)?;
        self.install_pool(connections);
        Ok(())
    }

    /// Connections for the given hosts, preferring existing objects (active
    /// pool first, then seeds) over fresh ones to avoid needless handshakes
    pub(crate) fn connections_for_hosts(&self, hosts: &[Host]) -> Result<Vec<Arc<dyn Connection>>> {
        let existing = self.connections();
        hosts
            .iter()
            .map(|host| {
                existing
                    .iter()
                    .chain(self.seed_connections.iter())
                    .find(|c| c.host() == host)
                    .map(|c| Ok(Arc::clone(c)))
                    .unwrap_or_else(|| self.factory.create(host))
            })
            .collect()
    }

    /// Perform one request against the cluster.
    ///
    /// Guarantees at most `max_retries + 1` sequential attempts across
    /// distinct connections. Exhausting the budget re-raises the last
    /// underlying error, never a generic wrapper.
    pub async fn perform_request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.sniff_if_due().await?;

        let timeout = options.timeout.or_else(|| self.config.request_timeout());
        let headers = options.headers;
        let (method, params, body) = self.prepare(method, options.params, options.body)?;

        let mut attempt = 0u32;
        loop {
            let pool = self.active_pool();
            let connection = pool.get_connection()?;
            let request = WireRequest {
                method: method.clone(),
                path: path.to_string(),
                params: params.clone(),
                body: body.clone(),
                timeout,
                headers: headers.clone(),
            };

            match self.attempt(&connection, request).await {
                Outcome::Success(response) => {
                    pool.mark_live(&connection);
                    return Ok(response);
                }
                Outcome::Retryable(error) => {
                    pool.mark_dead(&connection);
                    if self.config.sniff_on_connection_fail {
                        // Best effort; a failing sniff must not replace the
                        // original error
                        if let Err(sniff_error) = self.sniff_hosts().await {
                            warn!(error = %sniff_error, "reactive sniff failed");
                        }
                    }
                    if attempt >= self.config.max_retries {
                        return Err(error);
                    }
                    warn!(
                        node = %connection.host(),
                        attempt,
                        error = %error,
                        "attempt failed, retrying on another connection"
                    );
                    attempt += 1;
                }
                Outcome::Fatal(error) => {
                    // Keep the health view accurate even though this call is
                    // about to fail permanently
                    if error.is_connection_level() {
                        pool.mark_dead(&connection);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Normalize method/params/body: serialize structured bodies and honor
    /// `send_get_body_as` for GET-with-body requests
    fn prepare(
        &self,
        method: Method,
        mut params: Vec<(String, String)>,
        body: Option<RequestBody>,
    ) -> Result<(Method, Vec<(String, String)>, Option<Bytes>)> {
        let mut method = method;
        let mut body = match body {
            Some(b) => Some(b.into_bytes()?),
            None => None,
        };

        if method == Method::GET && body.is_some() {
            match self.config.send_get_body_as {
                SendGetBodyAs::Get => {}
                SendGetBodyAs::Post => method = Method::POST,
                SendGetBodyAs::Source => {
                    if let Some(bytes) = body.take() {
                        // A query parameter cannot carry arbitrary bytes;
                        // mangling them lossily would break the byte-exact
                        // promise of raw bodies
                        let text = std::str::from_utf8(&bytes)
                            .map_err(|_| TransportError::NonUtf8Body)?;
                        params.push(("source".to_string(), text.to_string()));
                        params.push((
                            "source_content_type".to_string(),
                            "application/json".to_string(),
                        ));
                    }
                }
            }
        }

        Ok((method, params, body))
    }

    /// One attempt on one connection, classified for the retry loop
    async fn attempt(&self, connection: &Arc<dyn Connection>, request: WireRequest) -> Outcome {
        match connection.perform_request(request).await {
            Ok(response) if response.status.is_success() => match decode_response(response) {
                Ok(decoded) => Outcome::Success(decoded),
                Err(error) => Outcome::Fatal(error),
            },
            Ok(response) => {
                let status = response.status.as_u16();
                let error = TransportError::from_status(status, &response.body);
                if self.config.retry_on_status.contains(&status) {
                    // Explicit configuration is authoritative, even for
                    // statuses that map to a specific fatal kind
                    Outcome::Retryable(error)
                } else {
                    Outcome::Fatal(error)
                }
            }
            Err(error @ TransportError::Timeout { .. }) => {
                if self.config.retry_on_timeout {
                    Outcome::Retryable(error)
                } else {
                    Outcome::Fatal(error)
                }
            }
            Err(error @ TransportError::Connection { .. }) => Outcome::Retryable(error),
            Err(error) => Outcome::Fatal(error),
        }
    }

    /// Close every known connection and refuse further requests. Idempotent;
    /// unblocks anyone waiting on an in-flight sniff.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sniff.close();

        let mut connections = self.connections();
        for seed in &self.seed_connections {
            if !connections.iter().any(|c| same_connection(c, seed)) {
                connections.push(Arc::clone(seed));
            }
        }
        for connection in connections {
            connection.close().await;
        }
    }
}

/// Decode a wire response per content type: JSON into a generic value,
/// everything else as text
fn decode_response(wire: WireResponse) -> Result<Response> {
    let content_type = wire
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");

    let body = if wire.body.is_empty() {
        ResponseBody::Empty
    } else if content_type.starts_with("application/json") || content_type.contains("+json") {
        ResponseBody::Json(serde_json::from_slice(&wire.body)?)
    } else if content_type.is_empty() {
        // No content type: prefer JSON when it parses, fall back to text
        match serde_json::from_slice(&wire.body) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&wire.body).into_owned()),
        }
    } else {
        ResponseBody::Text(String::from_utf8_lossy(&wire.body).into_owned())
    };

    Ok(Response {
        status: wire.status.as_u16(),
        headers: wire.headers,
        body,
    })
}

//! Hyper-based connection implementation
//!
//! One `HttpConnection` per node, all sharing the tuning that works well for
//! request/response traffic against search clusters: HTTP/1.1 with a warm
//! connection pool, TCP_NODELAY, keep-alive, and a bounded connect timeout.
//! TLS goes through native-tls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::sync::Arc;
use tracing::debug;

use super::{default_user_agent, Connection, ConnectionFactory, Host, WireRequest, WireResponse};
use crate::error::{Result, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(90);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// A single node's HTTP connection (hyper legacy client under the hood)
pub struct HttpConnection {
    host: Host,
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("host", &self.host.base_url())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl HttpConnection {
    pub fn new(host: Host) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.set_keepalive(Some(KEEPALIVE));

        let tls = TlsConnector::new().map_err(|e| TransportError::Connection {
            host: host.base_url(),
            message: format!("TLS setup failed: {e}"),
        })?;
        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Ok(Self {
            host,
            client,
            closed: AtomicBool::new(false),
        })
    }

    /// Full request URL: base + path + encoded query string
    fn build_url(&self, request: &WireRequest) -> String {
        let mut url = format!("{}{}", self.host.base_url(), request.path);
        if !request.params.is_empty() {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    fn connection_error(&self, message: impl std::fmt::Display) -> TransportError {
        TransportError::Connection {
            host: self.host.base_url(),
            message: message.to_string(),
        }
    }

    async fn send(&self, request: &WireRequest) -> Result<WireResponse> {
        let url = self.build_url(request);

        let mut builder = Request::builder().method(request.method.clone()).uri(&url);

        // Defaults first so per-connection and per-request headers win
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("user-agent".to_string(), default_user_agent());
        if request.body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        headers.extend(self.host.headers.clone());
        headers.extend(request.headers.clone());

        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let body = request.body.clone().unwrap_or_default();
        let req = builder
            .body(Full::new(body))
            .map_err(|e| self.connection_error(format!("request build error: {e}")))?;

        debug!(node = %self.host, method = %request.method, url = %url, "sending request");

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| self.connection_error(e))?;

        let status = response.status();
        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                response_headers.insert(name.as_str().to_string(), v.to_string());
            }
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| self.connection_error(format!("body read error: {e}")))?
            .to_bytes();

        Ok(WireResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

#[async_trait::async_trait]
impl Connection for HttpConnection {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn perform_request(&self, request: WireRequest) -> Result<WireResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        match request.timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.send(&request))
                .await
                .map_err(|_| TransportError::Timeout {
                    host: self.host.base_url(),
                })?,
            None => self.send(&request).await,
        }
    }

    async fn close(&self) {
        // The hyper client tears its pool down on drop; the flag makes
        // post-close use fail deterministically and repeated close a no-op.
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory producing [`HttpConnection`]s; the default connection class
#[derive(Debug, Default, Clone)]
pub struct HttpConnectionFactory;

impl ConnectionFactory for HttpConnectionFactory {
    fn create(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(HttpConnection::new(host.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Scheme;

    fn connection(url: &str) -> HttpConnection {
        HttpConnection::new(Host::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_build_url_without_params() {
        let conn = connection("http://n1:9200");
        let req = WireRequest::get("/_cluster/health");
        assert_eq!(conn.build_url(&req), "http://n1:9200/_cluster/health");
    }

    #[test]
    fn test_build_url_with_params_and_prefix() {
        let conn = connection("http://n1:9200/prefix");
        let mut req = WireRequest::get("/_search");
        req.params.push(("q".to_string(), "user:kim".to_string()));
        req.params.push(("size".to_string(), "10".to_string()));
        assert_eq!(
            conn.build_url(&req),
            "http://n1:9200/prefix/_search?q=user%3Akim&size=10"
        );
    }

    #[test]
    fn test_factory_creates_connection_for_host() {
        let host = Host::new(Scheme::Http, "n1", 9200);
        let conn = HttpConnectionFactory.create(&host).unwrap();
        assert_eq!(conn.host().host, "n1");
    }

    #[tokio::test]
    async fn test_request_after_close_fails() {
        let conn = connection("http://127.0.0.1:1");
        conn.close().await;
        let err = conn
            .perform_request(WireRequest::get("/"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}

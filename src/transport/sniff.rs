//! Cluster topology discovery ("sniffing")
//!
//! One discovery round fetches `/_nodes/_all/http` from the first node that
//! answers, parses each node's `publish_address`, filters out
//! cluster-manager-only nodes, and swaps the active pool for the discovered
//! set. Concurrent callers coalesce onto a single in-flight round via
//! [`SniffCoordinator`]; followers wait for the leader to finish instead of
//! issuing their own discovery calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Transport;
use crate::connection::{Host, WireRequest};
use crate::error::{Result, TransportError};
use crate::pool::same_connection;

/// Shape of the `/_nodes/_all/http` discovery response; everything we do
/// not read is ignored
#[derive(Debug, Deserialize)]
pub(crate) struct NodesInfoResponse {
    #[serde(default)]
    pub nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NodeInfo {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub http: Option<NodeHttp>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NodeHttp {
    #[serde(default)]
    pub publish_address: Option<String>,
}

/// Whether a node with these roles should receive client traffic.
///
/// Dedicated cluster-manager (or legacy "master") nodes are excluded unless
/// they also hold data or ingest duties.
fn serves_client_traffic(roles: &[String]) -> bool {
    let manager = roles
        .iter()
        .any(|r| r == "cluster_manager" || r == "master");
    if !manager {
        return true;
    }
    roles
        .iter()
        .any(|r| r == "data" || r.starts_with("data_") || r == "ingest")
}

/// Turn a `publish_address` into a [`Host`], inheriting scheme and static
/// headers from `template`.
///
/// Two wire shapes exist: plain `ip:port` and `fqdn/ip:port`, where the
/// name before the slash is preferred.
fn parse_publish_address(address: &str, template: &Host) -> Result<Host> {
    let (name, rest) = match address.split_once('/') {
        Some((name, rest)) if !name.is_empty() => (Some(name), rest),
        _ => (None, address),
    };

    let (ip, port) = rest.rsplit_once(':').ok_or_else(|| {
        TransportError::Sniff(format!("malformed publish_address {address:?}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        TransportError::Sniff(format!("malformed publish_address {address:?}"))
    })?;

    Ok(Host {
        scheme: template.scheme,
        host: name.unwrap_or(ip).to_string(),
        port,
        path_prefix: String::new(),
        headers: template.headers.clone(),
    })
}

#[derive(Debug)]
enum SniffState {
    Idle,
    /// A round is running; followers wait on the receiver. The sender is
    /// kept here too so `close()` can wake waiters without the leader.
    Sniffing {
        rx: watch::Receiver<()>,
        tx: Arc<watch::Sender<()>>,
    },
    Closed,
}

enum SniffTicket {
    Leader(Arc<watch::Sender<()>>),
    Follower(watch::Receiver<()>),
}

/// Serializes discovery rounds: at most one in flight, later callers wait
/// for its completion instead of stampeding the cluster
#[derive(Debug)]
pub(crate) struct SniffCoordinator {
    state: Mutex<SniffState>,
}

impl SniffCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SniffState::Idle),
        }
    }

    fn begin(&self) -> Result<SniffTicket> {
        let mut state = self.state.lock().unwrap();
        match &*state {
            SniffState::Closed => Err(TransportError::Closed),
            SniffState::Sniffing { rx, .. } => Ok(SniffTicket::Follower(rx.clone())),
            SniffState::Idle => {
                let (tx, rx) = watch::channel(());
                let tx = Arc::new(tx);
                *state = SniffState::Sniffing {
                    rx,
                    tx: Arc::clone(&tx),
                };
                Ok(SniffTicket::Leader(tx))
            }
        }
    }

    /// Leader's round is over; wake followers and reopen for the next round
    fn finish(&self, tx: Arc<watch::Sender<()>>) {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, SniffState::Closed) {
                *state = SniffState::Idle;
            }
        }
        let _ = tx.send(());
    }

    /// Refuse further rounds and wake anyone waiting on the current one.
    /// The leader's discovery call may still be in flight, but no caller
    /// stays parked on it.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if let SniffState::Sniffing { tx, .. } = &*state {
            let _ = tx.send(());
        }
        *state = SniffState::Closed;
    }

    fn is_closed(&self) -> bool {
        matches!(*self.state.lock().unwrap(), SniffState::Closed)
    }
}

impl Transport {
    /// Run one discovery round, or wait for the round already in flight.
    ///
    /// An empty result is fatal: replacing a working pool with nothing would
    /// turn a discovery hiccup into a total outage.
    pub async fn sniff_hosts(&self) -> Result<()> {
        match self.sniff.begin()? {
            SniffTicket::Follower(mut rx) => {
                // Wait for the leader; a dropped sender also means done
                let _ = rx.changed().await;
                // The wakeup may have come from close() rather than a
                // finished round
                if self.sniff.is_closed() {
                    return Err(TransportError::Closed);
                }
                Ok(())
            }
            SniffTicket::Leader(tx) => {
                let result = self.sniff_round().await;
                self.sniff.finish(tx);
                result
            }
        }
    }

    /// Sniff when the configured interval has elapsed since the last round
    pub(crate) async fn sniff_if_due(&self) -> Result<()> {
        let Some(interval) = self.config.sniffer_timeout() else {
            return Ok(());
        };
        let due = self.last_sniff.lock().unwrap().elapsed() >= interval;
        if due {
            self.sniff_hosts().await
        } else {
            Ok(())
        }
    }

    async fn sniff_round(&self) -> Result<()> {
        // Stamp at the start so a slow round is not immediately followed by
        // another one
        *self.last_sniff.lock().unwrap() = Instant::now();

        let Some(template) = self.seed_connections.first().map(|c| c.host().clone()) else {
            return Err(TransportError::Sniff("no seed connections".to_string()));
        };

        let info = self.fetch_node_info().await?;

        let mut hosts: Vec<Host> = Vec::new();
        for (id, node) in &info.nodes {
            if !serves_client_traffic(&node.roles) {
                continue;
            }
            let Some(address) = node
                .http
                .as_ref()
                .and_then(|http| http.publish_address.as_deref())
            else {
                continue;
            };
            match parse_publish_address(address, &template) {
                Ok(host) => hosts.push(host),
                Err(error) => {
                    warn!(node_id = %id, error = %error, "skipping undecodable node");
                }
            }
        }

        if hosts.is_empty() {
            return Err(TransportError::Sniff(
                "no eligible nodes in discovery response".to_string(),
            ));
        }

        if self.config.randomize_hosts {
            hosts.shuffle(&mut rand::thread_rng());
        }

        let connections = self.connections_for_hosts(&hosts)?;
        self.install_pool(connections);
        info!(nodes = hosts.len(), "refreshed node list from cluster");
        Ok(())
    }

    /// Fetch the discovery document from the first node that answers,
    /// trying active pool members before falling back to the seeds
    async fn fetch_node_info(&self) -> Result<NodesInfoResponse> {
        let mut request = WireRequest::get("/_nodes/_all/http");
        request.timeout = self.config.sniff_timeout();

        let mut candidates = self.connections();
        for seed in &self.seed_connections {
            if !candidates.iter().any(|c| same_connection(c, seed)) {
                candidates.push(Arc::clone(seed));
            }
        }

        let mut last_error: Option<TransportError> = None;
        for connection in candidates {
            match connection.perform_request(request.clone()).await {
                Ok(response) if response.status.is_success() => {
                    return serde_json::from_slice(&response.body).map_err(|e| {
                        TransportError::Sniff(format!("undecodable discovery response: {e}"))
                    });
                }
                Ok(response) => {
                    last_error = Some(TransportError::Sniff(format!(
                        "discovery returned status {}",
                        response.status.as_u16()
                    )));
                }
                Err(error) => {
                    debug!(node = %connection.host(), error = %error, "discovery attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(match last_error {
            Some(TransportError::Sniff(message)) => TransportError::Sniff(message),
            Some(error) => TransportError::Sniff(error.to_string()),
            None => TransportError::Sniff("no connections available".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Scheme;

    fn template() -> Host {
        let mut host = Host::new(Scheme::Https, "seed", 9200);
        host.headers
            .insert("authorization".to_string(), "Basic abc".to_string());
        host
    }

    #[test]
    fn test_parse_plain_ip_port() {
        let host = parse_publish_address("10.0.0.3:9201", &template()).unwrap();
        assert_eq!(host.host, "10.0.0.3");
        assert_eq!(host.port, 9201);
        assert_eq!(host.scheme, Scheme::Https);
        assert_eq!(host.headers.get("authorization").unwrap(), "Basic abc");
    }

    #[test]
    fn test_parse_fqdn_slash_ip_port_prefers_name() {
        let host = parse_publish_address("node1.example.com/10.0.0.3:9200", &template()).unwrap();
        assert_eq!(host.host, "node1.example.com");
        assert_eq!(host.port, 9200);
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!(matches!(
            parse_publish_address("10.0.0.3", &template()),
            Err(TransportError::Sniff(_))
        ));
    }

    #[test]
    fn test_manager_only_nodes_excluded() {
        let manager = vec!["cluster_manager".to_string()];
        let legacy = vec!["master".to_string()];
        assert!(!serves_client_traffic(&manager));
        assert!(!serves_client_traffic(&legacy));
    }

    #[test]
    fn test_manager_with_data_or_ingest_included() {
        let mixed = vec!["cluster_manager".to_string(), "data".to_string()];
        let tiered = vec!["master".to_string(), "data_hot".to_string()];
        let ingest = vec!["cluster_manager".to_string(), "ingest".to_string()];
        assert!(serves_client_traffic(&mixed));
        assert!(serves_client_traffic(&tiered));
        assert!(serves_client_traffic(&ingest));
    }

    #[test]
    fn test_roleless_nodes_included() {
        assert!(serves_client_traffic(&[]));
        assert!(serves_client_traffic(&["data".to_string()]));
    }

    #[test]
    fn test_discovery_response_decodes() {
        let raw = r#"{
            "_nodes": {"total": 2},
            "cluster_name": "test",
            "nodes": {
                "abc": {
                    "roles": ["data", "ingest"],
                    "http": {"publish_address": "10.0.0.1:9200"}
                },
                "def": {
                    "roles": ["cluster_manager"],
                    "http": {"publish_address": "10.0.0.2:9200"}
                }
            }
        }"#;
        let info: NodesInfoResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(info.nodes.len(), 2);
        assert_eq!(
            info.nodes["abc"].http.as_ref().unwrap().publish_address,
            Some("10.0.0.1:9200".to_string())
        );
    }

    #[test]
    fn test_node_without_http_block_decodes() {
        let raw = r#"{"nodes": {"abc": {"roles": ["data"]}}}"#;
        let info: NodesInfoResponse = serde_json::from_str(raw).unwrap();
        assert!(info.nodes["abc"].http.is_none());
    }

    #[test]
    fn test_coordinator_single_flight() {
        let coordinator = SniffCoordinator::new();
        let first = coordinator.begin().unwrap();
        let SniffTicket::Leader(tx) = first else {
            panic!("first caller must lead");
        };
        assert!(matches!(
            coordinator.begin().unwrap(),
            SniffTicket::Follower(_)
        ));
        coordinator.finish(tx);
        assert!(matches!(
            coordinator.begin().unwrap(),
            SniffTicket::Leader(_)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_followers() {
        let coordinator = SniffCoordinator::new();
        let SniffTicket::Leader(_tx) = coordinator.begin().unwrap() else {
            panic!("first caller must lead");
        };
        let SniffTicket::Follower(mut rx) = coordinator.begin().unwrap() else {
            panic!("second caller must follow");
        };

        // The leader never finishes; close alone must release the follower
        coordinator.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.changed())
            .await
            .expect("follower woken by close");
        assert!(coordinator.is_closed());
    }

    #[test]
    fn test_closed_coordinator_rejects() {
        let coordinator = SniffCoordinator::new();
        coordinator.close();
        assert!(matches!(
            coordinator.begin(),
            Err(TransportError::Closed)
        ));
    }
}

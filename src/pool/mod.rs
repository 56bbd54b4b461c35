//! Node pools: liveness tracking and connection selection
//!
//! This module provides:
//! - [`ConnectionPool`]: live/dead bookkeeping with capped exponential
//!   backoff before a dead node becomes eligible again
//! - [`SingleNodePool`]: the trivial pool used when there is nothing to
//!   choose between (0 or 1 nodes)
//! - [`SelectionStrategy`]: how to pick among live nodes

pub mod liveness;
pub mod single;

pub use liveness::ConnectionPool;
pub use single::SingleNodePool;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::Result;

/// How to pick among live connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Cycle through live nodes in order
    #[default]
    RoundRobin,
    /// Pick a live node uniformly at random (spreads load across client
    /// processes that would otherwise cycle in lockstep)
    Random,
}

/// Contract shared by all pool flavors.
///
/// `mark_dead`/`mark_live` take the connection that was used for an attempt;
/// both must be safe to call with a connection the pool no longer knows
/// (a sniff can swap the backing objects between an attempt and its report).
pub trait NodePool: Send + Sync + fmt::Debug {
    /// Next connection to try. Never fails while the pool holds any
    /// connection at all; an empty pool is a configuration error.
    fn get_connection(&self) -> Result<Arc<dyn Connection>>;

    /// Report a failed attempt on this connection
    fn mark_dead(&self, connection: &Arc<dyn Connection>);

    /// Report a successful attempt on this connection
    fn mark_live(&self, connection: &Arc<dyn Connection>);

    /// Every connection the pool knows, regardless of liveness
    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Number of connections currently considered live
    fn alive_count(&self) -> usize;
}

/// Pointer identity for trait-object connections
pub(crate) fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::connection::{Host, Scheme, WireRequest, WireResponse};
    use hyper::StatusCode;

    /// Inert connection for pool bookkeeping tests
    #[derive(Debug)]
    pub struct StubConnection {
        host: Host,
    }

    impl StubConnection {
        pub fn new(name: &str) -> Arc<dyn Connection> {
            Arc::new(Self {
                host: Host::new(Scheme::Http, name, 9200),
            })
        }
    }

    #[async_trait::async_trait]
    impl Connection for StubConnection {
        fn host(&self) -> &Host {
            &self.host
        }

        async fn perform_request(&self, _request: WireRequest) -> Result<WireResponse> {
            Ok(WireResponse {
                status: StatusCode::OK,
                headers: Default::default(),
                body: Default::default(),
            })
        }

        async fn close(&self) {}
    }
}

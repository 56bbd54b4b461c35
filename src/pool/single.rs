//! Trivial pool for the 0/1-node case
//!
//! With nothing to choose between there is no point paying for liveness
//! bookkeeping: marking is a no-op and selection is constant time. The
//! transport picks this pool automatically when at most one host is
//! configured.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::NodePool;
use crate::connection::Connection;
use crate::error::{Result, TransportError};

#[derive(Debug)]
pub struct SingleNodePool {
    connections: Vec<Arc<dyn Connection>>,
    counter: AtomicUsize,
}

impl SingleNodePool {
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self {
            connections,
            counter: AtomicUsize::new(0),
        }
    }
}

impl NodePool for SingleNodePool {
    fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        if self.connections.is_empty() {
            return Err(TransportError::NoConnections);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        Ok(Arc::clone(&self.connections[index]))
    }

    fn mark_dead(&self, _connection: &Arc<dyn Connection>) {}

    fn mark_live(&self, _connection: &Arc<dyn Connection>) {}

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.clone()
    }

    fn alive_count(&self) -> usize {
        self.connections.len()
    }
}

//! Live/dead bookkeeping with timed resurrection
//!
//! Every connection is in exactly one of {live, dead}. A failure moves a
//! connection to the dead set with a deadline of
//! `now + min(dead_timeout * 2^(failures-1), dead_timeout_max)`; a success
//! moves it back and resets the failure count. Selection resurrects overdue
//! nodes on the way, and when nothing is live it returns the dead node with
//! the earliest deadline rather than failing — an overdue node is a better
//! bet than wedging all traffic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use super::{same_connection, NodePool, SelectionStrategy};
use crate::connection::Connection;
use crate::error::{Result, TransportError};

/// Dead-set entry ordered by resurrection deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeadEntry {
    resurrect_at: Instant,
    index: usize,
}

#[derive(Debug)]
struct PoolState {
    /// Indices (into `connections`) of live nodes, in insertion order
    alive: Vec<usize>,
    /// Min-heap of dead nodes keyed by resurrection deadline
    dead: BinaryHeap<Reverse<DeadEntry>>,
    /// Consecutive failure count per node index
    dead_count: HashMap<usize, u32>,
}

/// Pool tracking liveness for two or more connections
pub struct ConnectionPool {
    connections: Vec<Arc<dyn Connection>>,
    strategy: SelectionStrategy,
    counter: AtomicUsize,
    dead_timeout: Duration,
    dead_timeout_max: Duration,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .field("alive", &state.alive.len())
            .field("dead", &state.dead.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        strategy: SelectionStrategy,
        dead_timeout: Duration,
        dead_timeout_max: Duration,
    ) -> Self {
        let alive = (0..connections.len()).collect();
        Self {
            connections,
            strategy,
            counter: AtomicUsize::new(0),
            dead_timeout,
            dead_timeout_max,
            state: Mutex::new(PoolState {
                alive,
                dead: BinaryHeap::new(),
                dead_count: HashMap::new(),
            }),
        }
    }

    /// Backoff before a node with `failures` consecutive failures becomes
    /// eligible again: `dead_timeout * 2^(failures-1)`, capped
    fn resurrect_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.dead_timeout
            .saturating_mul(1u32 << exponent)
            .min(self.dead_timeout_max)
    }

    fn index_of(&self, connection: &Arc<dyn Connection>) -> Option<usize> {
        self.connections
            .iter()
            .position(|c| same_connection(c, connection))
    }

    /// Promote every dead node whose deadline has passed
    fn resurrect_overdue(&self, state: &mut PoolState, now: Instant) {
        while let Some(Reverse(entry)) = state.dead.peek().copied() {
            if entry.resurrect_at > now {
                break;
            }
            state.dead.pop();
            if !state.alive.contains(&entry.index) {
                info!(node = %self.connections[entry.index].host(), "resurrecting node");
                state.alive.push(entry.index);
            }
        }
    }
}

impl NodePool for ConnectionPool {
    fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        let mut state = self.state.lock().unwrap();
        self.resurrect_overdue(&mut state, Instant::now());

        if state.alive.is_empty() {
            // Nothing live: optimistically take the dead node with the
            // earliest deadline even if it has not arrived yet. The usual
            // mark_dead/mark_live cycle decides what happens to it next.
            if let Some(Reverse(entry)) = state.dead.pop() {
                warn!(
                    node = %self.connections[entry.index].host(),
                    "no live nodes, force-resurrecting best dead candidate"
                );
                state.alive.push(entry.index);
            }
        }

        if state.alive.is_empty() {
            return Err(TransportError::NoConnections);
        }

        let slot = match self.strategy {
            SelectionStrategy::RoundRobin => {
                self.counter.fetch_add(1, Ordering::Relaxed) % state.alive.len()
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..state.alive.len()),
        };
        Ok(Arc::clone(&self.connections[state.alive[slot]]))
    }

    fn mark_dead(&self, connection: &Arc<dyn Connection>) {
        let Some(index) = self.index_of(connection) else {
            debug!(node = %connection.host(), "mark_dead for unknown connection, ignoring");
            return;
        };

        let mut state = self.state.lock().unwrap();
        let Some(slot) = state.alive.iter().position(|&i| i == index) else {
            // Already dead; concurrent failure reports must not double-penalize
            return;
        };
        state.alive.remove(slot);

        let failures = state.dead_count.entry(index).or_insert(0);
        *failures += 1;
        let failures = *failures;
        let delay = self.resurrect_delay(failures);
        state.dead.push(Reverse(DeadEntry {
            resurrect_at: Instant::now() + delay,
            index,
        }));

        warn!(
            node = %connection.host(),
            failures,
            timeout_secs = delay.as_secs(),
            "marking node dead"
        );
    }

    fn mark_live(&self, connection: &Arc<dyn Connection>) {
        let Some(index) = self.index_of(connection) else {
            debug!(node = %connection.host(), "mark_live for unknown connection, ignoring");
            return;
        };

        let mut state = self.state.lock().unwrap();
        state.dead_count.remove(&index);
        if !state.alive.contains(&index) {
            state.dead.retain(|Reverse(entry)| entry.index != index);
            state.alive.push(index);
            info!(node = %connection.host(), "node back to live");
        }
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.clone()
    }

    fn alive_count(&self) -> usize {
        self.state.lock().unwrap().alive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::StubConnection;

    fn pool_with(n: usize, dead_timeout: Duration) -> ConnectionPool {
        let connections: Vec<_> = (0..n)
            .map(|i| StubConnection::new(&format!("n{i}")))
            .collect();
        ConnectionPool::new(
            connections,
            SelectionStrategy::RoundRobin,
            dead_timeout,
            Duration::from_secs(1800),
        )
    }

    fn partition_sizes(pool: &ConnectionPool) -> (usize, usize) {
        let state = pool.state.lock().unwrap();
        (state.alive.len(), state.dead.len())
    }

    #[test]
    fn test_every_connection_live_or_dead() {
        let pool = pool_with(3, Duration::from_secs(60));
        let conns = pool.connections();

        // Arbitrary mark sequence; the sets must always partition the pool
        pool.mark_dead(&conns[0]);
        assert_eq!(partition_sizes(&pool), (2, 1));

        pool.mark_dead(&conns[0]); // idempotent
        assert_eq!(partition_sizes(&pool), (2, 1));

        pool.mark_dead(&conns[2]);
        assert_eq!(partition_sizes(&pool), (1, 2));

        pool.mark_live(&conns[0]);
        assert_eq!(partition_sizes(&pool), (2, 1));

        pool.mark_live(&conns[0]); // idempotent
        assert_eq!(partition_sizes(&pool), (2, 1));
    }

    #[test]
    fn test_mark_dead_twice_counts_one_failure() {
        let pool = pool_with(2, Duration::from_secs(60));
        let conns = pool.connections();

        pool.mark_dead(&conns[0]);
        pool.mark_dead(&conns[0]);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.dead_count.get(&0), Some(&1));
    }

    #[test]
    fn test_never_starves_when_all_dead() {
        let pool = pool_with(3, Duration::from_secs(3600));
        for conn in pool.connections() {
            pool.mark_dead(&conn);
        }
        assert_eq!(pool.alive_count(), 0);

        // All deadlines are far in the future; selection must still work
        let conn = pool.get_connection().unwrap();
        assert_eq!(pool.alive_count(), 1);
        // And the force-resurrected node is the one we got back
        assert!(pool
            .connections()
            .iter()
            .any(|c| same_connection(c, &conn)));
    }

    #[test]
    fn test_earliest_deadline_resurrected_first() {
        let pool = pool_with(3, Duration::from_secs(60));
        let conns = pool.connections();

        pool.mark_dead(&conns[1]);
        pool.mark_dead(&conns[2]);
        {
            // Give n0 a second-failure deadline (120s) directly
            let mut state = pool.state.lock().unwrap();
            state.alive.clear();
            state.dead_count.insert(0, 2);
            state.dead.push(Reverse(DeadEntry {
                resurrect_at: Instant::now() + Duration::from_secs(120),
                index: 0,
            }));
        }

        // n1 and n2 carry 60s deadlines, n0 120s; forced resurrection must
        // prefer one of the earlier ones
        let got = pool.get_connection().unwrap();
        assert!(!same_connection(&got, &conns[0]));
    }

    #[test]
    fn test_resurrects_after_timeout_elapses() {
        let pool = pool_with(2, Duration::from_millis(1));
        let conns = pool.connections();

        pool.mark_dead(&conns[0]);
        assert_eq!(pool.alive_count(), 1);

        std::thread::sleep(Duration::from_millis(10));
        let _ = pool.get_connection().unwrap();
        assert_eq!(pool.alive_count(), 2);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let pool = ConnectionPool::new(
            vec![StubConnection::new("n0")],
            SelectionStrategy::RoundRobin,
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        assert_eq!(pool.resurrect_delay(1), Duration::from_secs(60));
        assert_eq!(pool.resurrect_delay(2), Duration::from_secs(120));
        assert_eq!(pool.resurrect_delay(3), Duration::from_secs(240));
        assert_eq!(pool.resurrect_delay(4), Duration::from_secs(300));
        assert_eq!(pool.resurrect_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn test_round_robin_cycles_live_nodes() {
        let pool = pool_with(3, Duration::from_secs(60));
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..3 {
            let conn = pool.get_connection().unwrap();
            seen.insert(conn.host().host.clone());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_unknown_connection_marks_are_noops() {
        let pool = pool_with(2, Duration::from_secs(60));
        let foreign = StubConnection::new("elsewhere");
        pool.mark_dead(&foreign);
        pool.mark_live(&foreign);
        assert_eq!(pool.alive_count(), 2);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let pool = pool_with(2, Duration::from_secs(60));
        let conns = pool.connections();

        pool.mark_dead(&conns[0]);
        pool.mark_live(&conns[0]);
        pool.mark_dead(&conns[0]);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.dead_count.get(&0), Some(&1));
    }

    #[test]
    fn test_empty_pool_is_an_error() {
        let pool = ConnectionPool::new(
            Vec::new(),
            SelectionStrategy::RoundRobin,
            Duration::from_secs(60),
            Duration::from_secs(1800),
        );
        assert!(matches!(
            pool.get_connection(),
            Err(TransportError::NoConnections)
        ));
    }
}

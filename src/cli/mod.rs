//! Command-line interface
//!
//! Thin operational commands over the transport, useful for poking at a
//! cluster with the same pool/retry/sniff behavior the library gives
//! applications:
//!
//! ```bash
//! # Liveness check against any configured node
//! searchpool --hosts http://localhost:9200 ping
//!
//! # Discover the cluster topology and print the eligible nodes
//! searchpool --hosts http://localhost:9200 nodes
//!
//! # Arbitrary request
//! searchpool request GET /_cluster/health --param level=shards
//! ```

pub mod commands;

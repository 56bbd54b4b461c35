//! searchpool - cluster-aware search transport with node discovery
//!
//! Maintains a pool of connections to cluster nodes, tracks which ones are
//! healthy, retries failed requests on other nodes, and can refresh its view
//! of the cluster by asking any node for the full topology ("sniffing").

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod transport;

pub use config::TransportConfig;
pub use error::TransportError;
pub use transport::Transport;

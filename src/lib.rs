// lbpool - Load-balancing backend connection pool

pub mod api;
pub mod balance;
pub mod config;
pub mod utils;

// Re-export commonly used types
pub use balance::{BackendGroup, BackendState, ClientSocket, ClientSocketFactory, PoolConfig};
pub use utils::error::{LbPoolError, Result};

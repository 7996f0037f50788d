//! Monitoring HTTP API over the backend pools.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::ApiState;
pub use server::{build_router, start_api_server};

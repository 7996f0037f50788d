use serde::{Deserialize, Serialize};

/// API health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub backends: usize,
    pub live_backends: usize,
}

/// Error body for failed API calls
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

//! Per-backend connection pooling for load-balanced dispatch.

pub mod factory;
pub mod group;
pub mod metrics;
pub mod ring;
pub mod socket;
pub mod state;
pub mod tls;
pub mod warmup;

pub use factory::{BackendTarget, ClientSocketFactory, FactorySnapshot, PoolConfig};
pub use group::BackendGroup;
pub use metrics::{MetricsSink, NoopMetrics};
#[cfg(feature = "metrics")]
pub use metrics::PrometheusMetrics;
pub use ring::{IdleRing, Popped};
pub use socket::{BackendStream, ClientSocket, PooledConnection};
pub use state::{BackendState, StateEvent};
pub use tls::BackendTls;
pub use warmup::{Admission, WarmupSchedule};

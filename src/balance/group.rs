use super::factory::{BackendTarget, ClientSocketFactory, FactorySnapshot};
use super::metrics::{MetricsSink, NoopMetrics};
use super::state::BackendState;
use super::tls::BackendTls;
use crate::config::{Config, StartMode};
use crate::utils::error::Result;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The set of backend pools known to this process, keyed by target id.
#[derive(Debug, Default)]
pub struct BackendGroup {
    backends: DashMap<String, Arc<ClientSocketFactory>>,
}

impl BackendGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and initialize one pool per configured backend.
    pub fn from_config(config: &Config, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let group = Self::new();

        let tls = match &config.tls.ca_file {
            Some(ca_file) if config.backends.iter().any(|b| b.secure) => {
                let tls = BackendTls::from_ca_file(ca_file)?;
                Some(match &config.tls.server_name {
                    Some(name) => tls.with_server_name(name)?,
                    None => tls,
                })
            }
            _ => None,
        };

        for backend in &config.backends {
            let target = BackendTarget::new(backend.address.clone(), backend.port)
                .with_ids("lbpool", backend.id.clone())
                .secure(backend.secure);

            let mut factory = ClientSocketFactory::new(target, config.pool.pool_config(backend))
                .with_metrics(Arc::clone(&metrics));
            if backend.secure {
                if let Some(tls) = &tls {
                    factory = factory.with_tls(tls.clone());
                }
            }

            factory.init()?;
            match backend.start {
                StartMode::Active => {}
                StartMode::Standby => factory.stop(),
                StartMode::SessionOnly => factory.enable_session_only(),
            }

            info!(
                "Backend {} -> {}:{} ({})",
                backend.id,
                backend.address,
                backend.port,
                factory.state()
            );
            group.insert(Arc::new(factory));
        }

        Ok(group)
    }

    /// Convenience for callers without metrics.
    pub fn from_config_unmetered(config: &Config) -> Result<Self> {
        Self::from_config(config, Arc::new(NoopMetrics))
    }

    pub fn insert(&self, factory: Arc<ClientSocketFactory>) -> Option<Arc<ClientSocketFactory>> {
        self.backends.insert(factory.id().to_string(), factory)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSocketFactory>> {
        self.backends.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ClientSocketFactory>> {
        let (_, factory) = self.backends.remove(id)?;
        factory.close();
        Some(factory)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn factories(&self) -> Vec<Arc<ClientSocketFactory>> {
        let mut factories: Vec<_> = self
            .backends
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        factories.sort_by(|a, b| a.id().cmp(b.id()));
        factories
    }

    /// Statistics for every backend, ordered by id.
    pub fn snapshots(&self) -> Vec<FactorySnapshot> {
        self.factories().iter().map(|f| f.snapshot()).collect()
    }

    pub fn close_all(&self) {
        for factory in self.factories() {
            factory.close();
        }
    }

    /// One heartbeat pass: refresh warmup, sweep idle connections and probe
    /// failed backends whose recovery window has passed. Returns how many
    /// probes succeeded.
    pub async fn heartbeat(&self) -> usize {
        let now = Instant::now();
        let mut probes = Vec::new();

        for factory in self.factories() {
            let state = factory.state();
            let evicted = factory.evict_idle();
            if evicted > 0 {
                debug!("{} evicted {} idle connections", factory, evicted);
            }

            if state == BackendState::Fail && recovered(&factory, now) {
                probes.push(async move {
                    let ok = factory.can_connect().await;
                    if ok {
                        info!("Backend {} reachable again", factory.id());
                    }
                    ok
                });
            }
        }

        join_all(probes).await.into_iter().filter(|ok| *ok).count()
    }

    /// Run [`BackendGroup::heartbeat`] every `interval` until `shutdown` fires.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let group = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        group.heartbeat().await;
                    }
                }
            }
        })
    }
}

fn recovered(factory: &ClientSocketFactory, now: Instant) -> bool {
    match factory.last_fail_time() {
        Some(failed) => now.saturating_duration_since(failed) >= factory.config().recover_time,
        None => true,
    }
}

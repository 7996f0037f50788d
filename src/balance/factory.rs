use super::metrics::{MetricsSink, NoopMetrics};
use super::ring::{IdleRing, Popped};
use super::socket::{BackendStream, ClientSocket, PooledConnection};
use super::state::{BackendState, StateEvent};
use super::tls::BackendTls;
use super::warmup::{Admission, WarmupSchedule, WARMUP_MAX, WARMUP_MIN};
use crate::utils::error::{LbPoolError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// Starting value of the connect-failure backoff.
const INITIAL_FAIL_RECOVER_TIME: Duration = Duration::from_millis(1000);

/// Failures closer together than this degrade warmup only once.
const FAIL_DEGRADE_INTERVAL: Duration = Duration::from_millis(100);

/// The latency factor decays to zero over this period without success.
const LATENCY_DECAY_PERIOD: Duration = Duration::from_secs(60);

/// A reported CPU load is taken at face value for this long, then decays.
const CPU_LOAD_FRESH: Duration = Duration::from_secs(10);

/// Tuning for one backend pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Timeout for establishing a connection (and TLS handshake)
    pub connect_timeout: Duration,
    /// Timeout for individual reads and writes on a pooled connection
    pub socket_timeout: Duration,
    /// How long a connection may sit in the idle ring
    pub idle_time: Duration,
    /// How long a failed backend is treated as dead
    pub recover_time: Duration,
    /// Length of the slow-start ramp after (re)start
    pub warmup_time: Duration,
    /// Load balance weight
    pub weight: u32,
    /// Minimum connections for green load balancing
    pub connection_min: usize,
    /// Maximum active + connecting connections
    pub max_connections: usize,
    /// Logical idle ring size
    pub idle_size: usize,
    /// Physical idle ring capacity
    pub idle_capacity: usize,
    /// TCP keepalive probe time on backend sockets
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(30_000),
            idle_time: Duration::from_millis(10_000),
            recover_time: Duration::from_millis(15_000),
            warmup_time: Duration::from_millis(60_000),
            weight: 100,
            connection_min: 0,
            max_connections: (i32::MAX / 2) as usize,
            idle_size: 16,
            idle_capacity: 64,
            tcp_keepalive: None,
        }
    }
}

/// Identity of one backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTarget {
    pub source_id: String,
    pub target_id: String,
    pub address: String,
    pub port: u16,
    pub secure: bool,
}

impl BackendTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let target_id = format!("{}:{}", address, port);
        Self {
            source_id: "client".to_string(),
            target_id,
            address,
            port,
            secure: false,
        }
    }

    pub fn with_ids(mut self, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        let target_id = target_id.into();
        self.target_id = if target_id.is_empty() {
            "default".to_string()
        } else {
            target_id
        };
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn debug_id(&self) -> String {
        format!("{}->{}", self.source_id, self.target_id)
    }
}

/// Mutable pool state guarded by the factory lock.
struct FactoryState {
    state: BackendState,
    idle: IdleRing<PooledConnection>,

    warmup_state: i32,
    current_fail_count: u32,
    dynamic_fail_recover_time: Duration,

    first_success_time: Option<Instant>,
    last_fail_time: Option<Instant>,
    last_fail_connect_time: Option<Instant>,
    last_busy_time: Option<Instant>,
    prev_success_time: Option<Instant>,
    last_success_time: Option<Instant>,
    fail_time: Option<Instant>,

    latency_factor: f64,

    connect_count_total: u64,
    keepalive_count_total: u64,
    busy_count_total: u64,

    cpu_load_avg: f64,
    cpu_set_time: Option<Instant>,
}

impl FactoryState {
    fn new(config: &PoolConfig) -> Self {
        Self {
            state: BackendState::New,
            idle: IdleRing::new(config.idle_capacity, config.idle_size),
            warmup_state: 0,
            current_fail_count: 0,
            dynamic_fail_recover_time: INITIAL_FAIL_RECOVER_TIME,
            first_success_time: None,
            last_fail_time: None,
            last_fail_connect_time: None,
            last_busy_time: None,
            prev_success_time: None,
            last_success_time: None,
            fail_time: None,
            latency_factor: 0.0,
            connect_count_total: 0,
            keepalive_count_total: 0,
            busy_count_total: 0,
            cpu_load_avg: 0.0,
            cpu_set_time: None,
        }
    }

    fn apply(&mut self, event: StateEvent) {
        self.state = self.state.transition(event);
    }

    /// One warmup chunk lost per failure burst.
    fn degrade(&mut self, now: Instant) -> bool {
        let due = self
            .fail_time
            .map_or(true, |t| now.saturating_duration_since(t) >= FAIL_DEGRADE_INTERVAL);

        if due {
            self.current_fail_count = self.current_fail_count.saturating_add(1);
            self.warmup_state = (self.warmup_state - 1).max(WARMUP_MIN);
            self.fail_time = Some(now);
        }
        due
    }

    /// True while `now` is before `since + window`.
    fn within(since: Option<Instant>, window: Duration, now: Instant) -> bool {
        since.is_some_and(|t| now < t + window)
    }
}

/// Connection pool and health tracker for a single backend target.
///
/// Callers acquire connections with one of the `open*` variants, use the
/// returned [`ClientSocket`], then `free()` or `close()` it. Administrative and
/// monitoring signals (`start`, `stop`, `fail_socket`, `busy`, ...) drive the
/// backend's [`BackendState`].
pub struct ClientSocketFactory {
    target: BackendTarget,
    debug_id: String,
    config: PoolConfig,
    schedule: WarmupSchedule,
    tls: Option<BackendTls>,
    metrics: Arc<dyn MetricsSink>,

    inner: Mutex<FactoryState>,

    active_count: AtomicUsize,
    starting_count: AtomicUsize,
    load_balance_allocate_count: AtomicI64,
    start_sequence_id: AtomicU32,
    stream_count: AtomicU64,
    fail_count_total: AtomicU64,
}

/// Decrements the connecting counter when a connect attempt ends.
struct StartingGuard<'a>(&'a AtomicUsize);

impl<'a> StartingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ClientSocketFactory {
    pub fn new(target: BackendTarget, config: PoolConfig) -> Self {
        let debug_id = target.debug_id();
        let schedule = WarmupSchedule::new(config.warmup_time, config.recover_time);
        let inner = Mutex::new(FactoryState::new(&config));

        Self {
            target,
            debug_id,
            config,
            schedule,
            tls: None,
            metrics: Arc::new(NoopMetrics),
            inner,
            active_count: AtomicUsize::new(0),
            starting_count: AtomicUsize::new(0),
            load_balance_allocate_count: AtomicI64::new(0),
            start_sequence_id: AtomicU32::new(0),
            stream_count: AtomicU64::new(0),
            fail_count_total: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_tls(mut self, tls: BackendTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Activate the pool (NEW → STARTING).
    pub fn init(&self) -> Result<()> {
        if self.target.secure && self.tls.is_none() {
            return Err(LbPoolError::Config(format!(
                "{} is secure but no TLS settings were provided",
                self
            )));
        }

        self.inner.lock().apply(StateEvent::Init);
        debug!("{} initialized", self);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.target.target_id
    }

    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn address(&self) -> &str {
        &self.target.address
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn schedule(&self) -> WarmupSchedule {
        self.schedule
    }

    pub fn load_balance_weight(&self) -> u32 {
        self.config.weight
    }

    /// Incremented on every stop so connections from a prior run can be
    /// recognized.
    pub fn start_sequence_id(&self) -> u32 {
        self.start_sequence_id.load(Ordering::SeqCst)
    }

    //
    // statistics
    //

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn starting_count(&self) -> usize {
        self.starting_count.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub fn load_balance_allocate_count(&self) -> i64 {
        self.load_balance_allocate_count.load(Ordering::SeqCst)
    }

    pub fn allocate_load_balance(&self) {
        self.load_balance_allocate_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn free_load_balance(&self) {
        self.load_balance_allocate_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connect_count_total(&self) -> u64 {
        self.inner.lock().connect_count_total
    }

    /// Times an idle connection has been reused.
    pub fn keepalive_count_total(&self) -> u64 {
        self.inner.lock().keepalive_count_total
    }

    pub fn fail_count_total(&self) -> u64 {
        self.fail_count_total.load(Ordering::SeqCst)
    }

    pub fn busy_count_total(&self) -> u64 {
        self.inner.lock().busy_count_total
    }

    pub fn last_fail_time(&self) -> Option<Instant> {
        self.inner.lock().last_fail_time
    }

    pub fn last_fail_connect_time(&self) -> Option<Instant> {
        self.inner.lock().last_fail_connect_time
    }

    pub fn last_busy_time(&self) -> Option<Instant> {
        self.inner.lock().last_busy_time
    }

    pub fn last_success_time(&self) -> Option<Instant> {
        self.inner.lock().last_success_time
    }

    pub fn warmup_state(&self) -> i32 {
        self.inner.lock().warmup_state
    }

    pub fn current_fail_count(&self) -> u32 {
        self.inner.lock().current_fail_count
    }

    pub fn dynamic_fail_recover_time(&self) -> Duration {
        self.inner.lock().dynamic_fail_recover_time
    }

    /// Smoothed inter-success latency in milliseconds, fading to zero over a
    /// minute without successes.
    pub fn latency_factor(&self) -> f64 {
        let inner = self.inner.lock();
        let Some(last) = inner.last_success_time else {
            return 0.0;
        };

        let age = Instant::now().saturating_duration_since(last);
        if age >= LATENCY_DECAY_PERIOD {
            return 0.0;
        }
        let remaining = LATENCY_DECAY_PERIOD - age;
        inner.latency_factor * remaining.as_secs_f64() / LATENCY_DECAY_PERIOD.as_secs_f64()
    }

    /// CPU load average as reported by the backend.
    pub fn set_cpu_load_avg(&self, load: f64) {
        let mut inner = self.inner.lock();
        inner.cpu_set_time = Some(Instant::now());
        inner.cpu_load_avg = load;
    }

    pub fn cpu_load_avg(&self) -> f64 {
        let inner = self.inner.lock();
        let Some(set) = inner.cpu_set_time else {
            return inner.cpu_load_avg;
        };

        let age = Instant::now().saturating_duration_since(set);
        if age < CPU_LOAD_FRESH {
            inner.cpu_load_avg
        } else {
            inner.cpu_load_avg * CPU_LOAD_FRESH.as_secs_f64() / age.as_secs_f64()
        }
    }

    //
    // health state
    //

    /// Current state after recomputing warmup progress.
    pub fn state(&self) -> BackendState {
        self.update_warmup();
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().state.is_live()
    }

    pub fn is_dead(&self) -> bool {
        !self.is_active()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().state.is_enabled()
    }

    pub fn enable(&self) {
        self.start();
    }

    pub fn disable(&self) {
        self.stop();
    }

    /// Administrative enable.
    pub fn start(&self) {
        let state = {
            let mut inner = self.inner.lock();
            inner.apply(StateEvent::Start);
            inner.state
        };
        debug!("{} start -> {}", self, state);
    }

    /// Administrative disable; idle connections are closed.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.apply(StateEvent::Standby);
            inner.first_success_time = None;
        }
        self.start_sequence_id.fetch_add(1, Ordering::SeqCst);
        debug!("{} stop", self);
        self.clear_recycle();
    }

    pub fn enable_session_only(&self) {
        self.inner.lock().apply(StateEvent::SessionOnly);
    }

    /// The backend is known to be reachable again, e.g. a peer heard from it.
    pub fn wake(&self) {
        let mut inner = self.inner.lock();
        inner.apply(StateEvent::Wake);
        inner.fail_time = None;
    }

    /// The backend process (re)started.
    pub fn notify_start(&self) {
        self.clear_recycle();
        self.wake();
    }

    /// The backend process stopped.
    pub fn notify_stop(&self) {
        self.start_sequence_id.fetch_add(1, Ordering::SeqCst);
        self.clear_recycle();
        self.to_fail();
    }

    pub fn to_busy(&self) {
        let now = Instant::now();
        self.metrics.request_busy(self.id());
        let mut inner = self.inner.lock();
        inner.last_busy_time = Some(now);
        inner.first_success_time = None;
        inner.busy_count_total += 1;
        inner.apply(StateEvent::Busy);
    }

    /// Mark the backend failed and drop its idle connections.
    pub fn to_fail(&self) {
        let now = Instant::now();
        self.metrics.request_failed(self.id());
        self.fail_count_total.fetch_add(1, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock();
            inner.fail_time = Some(now);
            inner.last_fail_time = Some(now);
            inner.first_success_time = None;
            inner.apply(StateEvent::Fail);
        }
        self.clear_recycle();
    }

    /// A read or write on a backend connection failed.
    pub fn fail_socket(&self) {
        let now = Instant::now();
        self.metrics.request_failed(self.id());
        self.fail_count_total.fetch_add(1, Ordering::SeqCst);

        let state = {
            let mut inner = self.inner.lock();
            inner.first_success_time = None;
            if inner.degrade(now) {
                inner.last_fail_time = Some(now);
            }
            inner.apply(StateEvent::Fail);
            inner.state
        };
        warn!("{} socket failure, state {}", self, state);
    }

    /// A connect attempt failed. Doubles the connect backoff, capped at the
    /// recover time.
    pub fn fail_connect(&self) {
        let now = Instant::now();
        self.metrics.connect_failed(self.id());
        self.fail_count_total.fetch_add(1, Ordering::SeqCst);

        let retry_after = {
            let mut inner = self.inner.lock();
            inner.first_success_time = None;
            inner.degrade(now);
            inner.last_fail_time = Some(now);
            inner.last_fail_connect_time = Some(now);
            inner.dynamic_fail_recover_time = inner
                .dynamic_fail_recover_time
                .saturating_mul(2)
                .min(self.config.recover_time);
            inner.apply(StateEvent::Fail);
            inner.dynamic_fail_recover_time
        };
        warn!("{} connect failure, retry after {:?}", self, retry_after);
    }

    /// The backend answered "busy", e.g. HTTP 503.
    pub fn busy(&self) {
        let now = Instant::now();
        self.metrics.request_busy(self.id());

        let mut inner = self.inner.lock();
        inner.last_busy_time = Some(now);
        inner.first_success_time = None;
        inner.current_fail_count = inner.current_fail_count.saturating_add(1);
        inner.warmup_state = (inner.warmup_state - 1).max(0);
        inner.busy_count_total += 1;
        inner.apply(StateEvent::Busy);
    }

    /// The backend handled a request successfully.
    pub fn success(&self) {
        let mut inner = self.inner.lock();
        inner.current_fail_count = 0;
        if inner.first_success_time.is_none() {
            inner.first_success_time = Some(Instant::now());
        }
        inner.dynamic_fail_recover_time = INITIAL_FAIL_RECOVER_TIME;
    }

    /// Recompute warmup progress from time since first success, promoting to
    /// ACTIVE once the ramp is complete.
    fn update_warmup(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_enabled() {
            return;
        }

        let mut warmup_state = inner.warmup_state;
        if warmup_state >= 0 {
            if let Some(first) = inner.first_success_time {
                let elapsed = Instant::now().saturating_duration_since(first);
                let chunks = self.schedule.elapsed_chunks(Some(elapsed));
                inner.dynamic_fail_recover_time = INITIAL_FAIL_RECOVER_TIME;

                warmup_state = chunks.min(i64::from(WARMUP_MAX)) as i32;
                if warmup_state >= WARMUP_MAX {
                    inner.apply(StateEvent::Active);
                }
            }
        }
        inner.warmup_state = warmup_state;
    }

    //
    // admission
    //

    /// True if a connection could be handed out now, recycled or new.
    pub fn can_open(&self) -> bool {
        let inner = self.inner.lock();
        if !inner.idle.is_empty() || inner.state == BackendState::Active {
            return true;
        }
        if !inner.state.is_enabled() {
            return false;
        }

        let now = Instant::now();
        !FactoryState::within(
            inner.last_fail_connect_time,
            inner.dynamic_fail_recover_time,
            now,
        )
    }

    pub fn can_open_warm_or_recycle(&self) -> bool {
        self.idle_count() > 0 || self.can_open_warm()
    }

    /// Slow-start admission for a new connection.
    pub fn can_open_warm(&self) -> bool {
        let inner = self.inner.lock();
        let state = inner.state;

        if state == BackendState::Active {
            return true;
        }
        if !state.is_enabled() {
            return false;
        }

        let now = Instant::now();
        if FactoryState::within(
            inner.last_fail_connect_time,
            inner.dynamic_fail_recover_time,
            now,
        ) {
            return false;
        }

        let since_first = inner
            .first_success_time
            .map(|first| now.saturating_duration_since(first));

        match self.schedule.admission(since_first, inner.current_fail_count) {
            Admission::Open => true,
            Admission::Backoff { chunks } => match inner.fail_time {
                Some(fail_time) => fail_time + self.schedule.backoff_delay(chunks) < now,
                None => true,
            },
            Admission::Limit(limit) => {
                let total = self.active_count() + self.starting_count() + inner.idle.len();
                total < limit
            }
        }
    }

    //
    // open variants
    //

    /// Open for plain load-balance dispatch: any initialized state, no warmup cap.
    pub async fn open(self: &Arc<Self>) -> Result<Option<ClientSocket>> {
        if !self.inner.lock().state.is_init() {
            return Ok(None);
        }

        if let Some(socket) = self.open_recycle() {
            return Ok(Some(socket));
        }

        self.connect().await
    }

    /// Open for steady traffic, honoring the slow-start schedule.
    pub async fn open_warm(self: &Arc<Self>) -> Result<Option<ClientSocket>> {
        if !self.inner.lock().state.is_enabled() {
            return Ok(None);
        }

        if let Some(socket) = self.open_recycle() {
            return Ok(Some(socket));
        }

        if self.can_open_warm() {
            self.connect().await
        } else {
            Ok(None)
        }
    }

    /// Open for a sticky session, unless the backend failed or was busy within
    /// the recover time.
    pub async fn open_sticky(self: &Arc<Self>) -> Result<Option<ClientSocket>> {
        if !self.inner.lock().state.is_session_enabled() {
            return Ok(None);
        }

        if let Some(socket) = self.open_recycle() {
            return Ok(Some(socket));
        }

        {
            let inner = self.inner.lock();
            let now = Instant::now();
            let recover = self.config.recover_time;
            if FactoryState::within(inner.fail_time, recover, now)
                || FactoryState::within(inner.last_busy_time, recover, now)
            {
                return Ok(None);
            }
        }

        self.connect().await
    }

    /// Best-effort open for probes. While failed only one caller at a time
    /// may try to connect.
    pub async fn open_if_live(self: &Arc<Self>) -> Result<Option<ClientSocket>> {
        if self.inner.lock().state.is_closed() {
            return Ok(None);
        }

        if let Some(socket) = self.open_recycle() {
            return Ok(Some(socket));
        }

        {
            let inner = self.inner.lock();
            let now = Instant::now();
            if inner
                .fail_time
                .is_some_and(|t| now <= t + self.config.recover_time)
            {
                return Ok(None);
            }
            if inner.state == BackendState::Fail && self.starting_count() > 0 {
                return Ok(None);
            }
        }

        self.connect().await
    }

    /// Take the most recent idle connection if it has not expired. An expired
    /// one is closed and nothing is returned.
    pub fn open_recycle(self: &Arc<Self>) -> Option<ClientSocket> {
        let now = Instant::now();
        let (popped, idle) = {
            let mut inner = self.inner.lock();
            let popped = inner.idle.pop_newest(now, self.config.idle_time);
            if let Popped::Fresh(_) = &popped {
                self.active_count.fetch_add(1, Ordering::SeqCst);
                inner.keepalive_count_total += 1;
            }
            (popped, inner.idle.len())
        };

        match popped {
            Popped::Empty => None,
            Popped::Fresh(mut conn) => {
                conn.to_active();
                self.metrics.connection_recycled(self.id());
                self.metrics.idle_connections(self.id(), idle);
                trace!("{} recycle {:?}", self, conn);
                Some(ClientSocket::new(Arc::clone(self), conn))
            }
            Popped::Expired(conn) => {
                self.metrics.idle_connections(self.id(), idle);
                trace!("{} close idle {:?}", self, conn);
                drop(conn);
                None
            }
        }
    }

    /// Open a fresh connection to the backend.
    async fn connect(self: &Arc<Self>) -> Result<Option<ClientSocket>> {
        if self.config.max_connections <= self.active_count() + self.starting_count() {
            return Ok(None);
        }

        let _starting = StartingGuard::new(&self.starting_count);

        if !self.inner.lock().state.is_init() {
            let err = LbPoolError::NotStarted(self.to_string());
            warn!("{}", err);
            return Err(err);
        }

        match self.open_stream().await {
            Ok(stream) => {
                let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
                let id = self.stream_count.fetch_add(1, Ordering::SeqCst);
                let conn = PooledConnection::new(
                    id,
                    format!("{}:{}", self.debug_id, id),
                    stream,
                    self.start_sequence_id(),
                );

                {
                    let mut inner = self.inner.lock();
                    inner.connect_count_total += 1;

                    if inner.first_success_time.is_none() {
                        if inner.state.is_starting() {
                            let warmup = !self.config.warmup_time.is_zero();
                            inner.apply(StateEvent::FirstConnect { warmup });
                            inner.first_success_time = Some(Instant::now());
                        }
                        if inner.warmup_state < 0 {
                            inner.warmup_state = 0;
                        }
                    }
                }

                self.metrics.connection_opened(self.id());
                self.metrics.active_connections(self.id(), active);
                debug!("connect {:?}", conn);

                Ok(Some(ClientSocket::new(Arc::clone(self), conn)))
            }
            Err(e) => {
                debug!("{} connect failed: {}", self, e);
                self.fail_connect();
                Ok(None)
            }
        }
    }

    async fn open_stream(&self) -> io::Result<BackendStream> {
        let limit = self.config.connect_timeout;
        let addr = (self.target.address.as_str(), self.target.port);

        let stream = match timeout(limit, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("Connection to {} timed out after {:?}", self, limit),
                ))
            }
        };

        stream.set_nodelay(true)?;
        if let Some(keepalive) = self.config.tcp_keepalive {
            let params = socket2::TcpKeepalive::new().with_time(keepalive);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&params)?;
        }

        let Some(tls) = &self.tls else {
            return Ok(BackendStream::Plain(stream));
        };

        let server_name = tls
            .server_name_for(&self.target.address)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        match timeout(limit, tls.connector().connect(server_name, stream)).await {
            Ok(result) => Ok(BackendStream::Tls(Box::new(result?))),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("TLS handshake with {} timed out after {:?}", self, limit),
            )),
        }
    }

    //
    // free / close
    //

    pub(crate) fn free(&self, mut conn: PooledConnection, idle_start: Option<Instant>) {
        self.success();
        let active = self
            .active_count
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);

        let now = Instant::now();
        self.metrics
            .request_completed(self.id(), now.saturating_duration_since(conn.active_since()));
        self.metrics.active_connections(self.id(), active);

        let idle_start = idle_start.or(conn.last_read_time()).unwrap_or(now);
        conn.to_idle(idle_start);
        let stale = conn.pool_sequence_id() != self.start_sequence_id();

        let rejected = {
            let mut inner = self.inner.lock();

            let rejected = if inner.state.is_closed() || stale {
                Some(conn)
            } else {
                inner.idle.push(conn, idle_start).err()
            };

            if let Some(prev) = inner.prev_success_time {
                let delta = now.saturating_duration_since(prev).as_secs_f64() * 1000.0;
                inner.latency_factor = 0.95 * inner.latency_factor + 0.05 * delta;
            }
            inner.prev_success_time = if active > 0 { Some(now) } else { None };
            inner.last_success_time = Some(now);

            rejected
        };

        self.update_warmup();
        self.evict_idle();

        if let Some(conn) = rejected {
            trace!("{} close {:?} (not pooled)", self, conn);
            self.metrics.connection_closed(self.id());
            drop(conn);
        }
    }

    pub(crate) fn close_connection(&self, conn: PooledConnection) {
        let active = self
            .active_count
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        debug!("close {:?}", conn);
        self.metrics.connection_closed(self.id());
        self.metrics.active_connections(self.id(), active);
        drop(conn);
    }

    /// Close idle connections older than the idle time.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let (evicted, idle) = {
            let mut inner = self.inner.lock();
            let evicted = inner.idle.evict_expired(now, self.config.idle_time);
            (evicted, inner.idle.len())
        };
        self.metrics.idle_connections(self.id(), idle);

        let count = evicted.len();
        for conn in evicted {
            trace!("{} close idle {:?}", self, conn);
            drop(conn);
        }
        count
    }

    /// Close every idle connection, e.g. when the backend went away.
    pub fn clear_recycle(&self) {
        let drained = self.inner.lock().idle.drain();
        self.metrics.idle_connections(self.id(), 0);

        if !drained.is_empty() {
            debug!("{} cleared {} idle connections", self, drained.len());
        }
        drop(drained);
    }

    /// Terminal shutdown of the pool.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return;
            }
            inner.apply(StateEvent::Close);
        }
        debug!("{} closed", self);
        self.clear_recycle();
    }

    /// Probe the backend: wake it, open a connection and return it to the pool.
    pub async fn can_connect(self: &Arc<Self>) -> bool {
        self.wake();
        match self.open().await {
            Ok(Some(socket)) => {
                socket.free();
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("{} probe failed: {}", self, e);
                false
            }
        }
    }

    /// Serializable statistics view.
    pub fn snapshot(&self) -> FactorySnapshot {
        let state = self.state();
        let latency_factor = self.latency_factor();
        let cpu_load_avg = self.cpu_load_avg();
        let inner = self.inner.lock();

        FactorySnapshot {
            id: self.target.target_id.clone(),
            debug_id: self.debug_id.clone(),
            address: self.target.address.clone(),
            port: self.target.port,
            secure: self.target.secure,
            state,
            weight: self.config.weight,
            active_count: self.active_count(),
            idle_count: inner.idle.len(),
            starting_count: self.starting_count(),
            load_balance_allocate_count: self.load_balance_allocate_count(),
            start_sequence_id: self.start_sequence_id(),
            warmup_state: inner.warmup_state,
            current_fail_count: inner.current_fail_count,
            dynamic_fail_recover_ms: inner.dynamic_fail_recover_time.as_millis() as u64,
            connect_count_total: inner.connect_count_total,
            keepalive_count_total: inner.keepalive_count_total,
            fail_count_total: self.fail_count_total(),
            busy_count_total: inner.busy_count_total,
            latency_factor,
            cpu_load_avg,
            last_success_time: inner.last_success_time.map(wall_clock),
            last_fail_time: inner.last_fail_time.map(wall_clock),
            last_fail_connect_time: inner.last_fail_connect_time.map(wall_clock),
            last_busy_time: inner.last_busy_time.map(wall_clock),
        }
    }
}

impl fmt::Display for ClientSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientSocketFactory[{},{}:{}]",
            self.debug_id, self.target.address, self.target.port
        )
    }
}

impl fmt::Debug for ClientSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Point-in-time statistics for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorySnapshot {
    pub id: String,
    pub debug_id: String,
    pub address: String,
    pub port: u16,
    pub secure: bool,
    pub state: BackendState,
    pub weight: u32,
    pub active_count: usize,
    pub idle_count: usize,
    pub starting_count: usize,
    pub load_balance_allocate_count: i64,
    pub start_sequence_id: u32,
    pub warmup_state: i32,
    pub current_fail_count: u32,
    pub dynamic_fail_recover_ms: u64,
    pub connect_count_total: u64,
    pub keepalive_count_total: u64,
    pub fail_count_total: u64,
    pub busy_count_total: u64,
    pub latency_factor: f64,
    pub cpu_load_avg: f64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_fail_time: Option<DateTime<Utc>>,
    pub last_fail_connect_time: Option<DateTime<Utc>>,
    pub last_busy_time: Option<DateTime<Utc>>,
}

fn wall_clock(at: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(at);
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}

//! Circuit Breaker pattern implementation.
//!
//! The circuit breaker prevents cascade failures by counting failures of a
//! protected call site and "opening" the circuit to reject calls once a
//! threshold is reached.
//!
//! ## States
//!
//! - **Closed**: calls pass through; a success resets the failure count
//! - **Open**: calls are rejected without touching the dependency
//! - **Half-Open**: exactly one probe call is let through; its outcome
//!   closes or re-opens the circuit
//!
//! The Open to Half-Open move happens lazily on the next call (or `state()`)
//! once `reset_timeout` has passed since the last failure, and additionally
//! on a timer when `monitor_interval` is configured.
//!
//! Every call is bounded by `timeout`; a timed-out call counts as a failure.
//! Only the bookkeeping is serialized; the protected operations run
//! concurrently.

use meridian_metrics::MetricsRegistry;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is half-open, one probe is allowed.
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (for logging/metrics).
    pub name: String,
    /// Number of failures before opening the circuit.
    pub error_threshold: u32,
    /// Time since the last failure before a probe is allowed.
    pub reset_timeout: Duration,
    /// Upper bound on a single protected call.
    pub timeout: Duration,
    /// Poll interval of the background monitor. `None` means lazy only.
    pub monitor_interval: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            error_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            monitor_interval: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the per-call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable the background monitor.
    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }
}

/// Circuit breaker error.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a probe is already running); the call was not made.
    #[error("Circuit breaker is open")]
    Open,
    /// The call did not finish within the configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    /// The call ran and failed.
    #[error("Execution failed: {0}")]
    Execution(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Map the wrapped execution error.
    pub fn map<F, O>(self, f: F) -> CircuitBreakerError<O>
    where
        F: FnOnce(E) -> O,
    {
        match self {
            Self::Open => CircuitBreakerError::Open,
            Self::Timeout(d) => CircuitBreakerError::Timeout(d),
            Self::Execution(e) => CircuitBreakerError::Execution(f(e)),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
    pub status: CircuitStatus,
}

struct Inner {
    status: CircuitStatus,
    failures: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker protecting one call site or downstream dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    metrics: Option<Arc<MetricsRegistry>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    total_timeouts: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Create a circuit breaker that records its state into `metrics`.
    pub fn with_metrics(config: CircuitBreakerConfig, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        Self::build(config, Some(metrics))
    }

    fn build(config: CircuitBreakerConfig, metrics: Option<Arc<MetricsRegistry>>) -> Arc<Self> {
        info!(
            name = %config.name,
            error_threshold = config.error_threshold,
            reset_timeout = ?config.reset_timeout,
            timeout = ?config.timeout,
            "Circuit breaker initialized"
        );

        if let Some(metrics) = &metrics {
            metrics.record_circuit_state(&config.name, CircuitStatus::Closed.as_str());
        }

        let breaker = Arc::new(Self {
            config,
            inner: RwLock::new(Inner {
                status: CircuitStatus::Closed,
                failures: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
            metrics,
            monitor: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        });

        if let Some(interval) = breaker.config.monitor_interval {
            breaker.spawn_monitor(interval);
        }

        breaker
    }

    fn spawn_monitor(self: &Arc<Self>, interval: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(name = %self.config.name, "No runtime, breaker monitor disabled");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else { break };
                let mut inner = breaker.inner.write();
                breaker.half_open_if_due(&mut inner);
            }
        });
        *self.monitor.lock() = Some(task);
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due Open to Half-Open transition first.
    pub fn state(&self) -> CircuitBreakerState {
        let mut inner = self.inner.write();
        self.half_open_if_due(&mut inner);
        CircuitBreakerState {
            failures: inner.failures,
            last_failure_at: inner.last_failure_at,
            status: inner.status,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        self.state().status
    }

    /// Execute `f` with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_circuit_rejection(&self.config.name);
            }
            debug!(name = %self.config.name, "Circuit breaker rejected request");
            return Err(CircuitBreakerError::Open);
        };

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let outcome = tokio::time::timeout(self.config.timeout, f()).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(admission);
                Err(CircuitBreakerError::Execution(e))
            }
            Err(_) => {
                self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name = %self.config.name,
                    timeout = ?self.config.timeout,
                    "Circuit breaker call timed out"
                );
                self.on_failure(admission);
                Err(CircuitBreakerError::Timeout(self.config.timeout))
            }
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.write();
        self.half_open_if_due(&mut inner);
        match inner.status {
            CircuitStatus::Closed => Some(Admission::Normal),
            CircuitStatus::Open => None,
            CircuitStatus::HalfOpen if inner.probe_in_flight => None,
            CircuitStatus::HalfOpen => {
                inner.probe_in_flight = true;
                debug!(name = %self.config.name, "Circuit breaker sending probe");
                Some(Admission::Probe)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                self.close(&mut inner);
            }
            Admission::Normal if inner.status == CircuitStatus::Closed => {
                inner.failures = 0;
            }
            // Admitted while closed, finished after the circuit moved on.
            Admission::Normal => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write();
        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure_at = Some(Instant::now());
                self.open(&mut inner);
            }
            Admission::Normal if inner.status == CircuitStatus::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure_at = Some(Instant::now());
                if inner.failures >= self.config.error_threshold {
                    self.open(&mut inner);
                }
            }
            Admission::Normal => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        if inner.status != CircuitStatus::Open {
            warn!(
                name = %self.config.name,
                failures = inner.failures,
                "Circuit breaker OPENED"
            );
            inner.status = CircuitStatus::Open;
            self.record_status(CircuitStatus::Open);
        }
    }

    fn close(&self, inner: &mut Inner) {
        if inner.status != CircuitStatus::Closed {
            info!(name = %self.config.name, "Circuit breaker CLOSED");
        }
        inner.status = CircuitStatus::Closed;
        inner.failures = 0;
        inner.probe_in_flight = false;
        self.record_status(CircuitStatus::Closed);
    }

    fn half_open_if_due(&self, inner: &mut Inner) {
        if inner.status != CircuitStatus::Open {
            return;
        }
        let due = inner
            .last_failure_at
            .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
        if due {
            debug!(name = %self.config.name, "Circuit breaker transitioning to HALF-OPEN");
            inner.status = CircuitStatus::HalfOpen;
            inner.probe_in_flight = false;
            self.record_status(CircuitStatus::HalfOpen);
        }
    }

    fn record_status(&self, status: CircuitStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_state(&self.config.name, status.as_str());
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        self.close(&mut inner);
    }

    /// Manually force the circuit open, as if it had just failed.
    pub fn force_open(&self) {
        let mut inner = self.inner.write();
        inner.last_failure_at = Some(Instant::now());
        self.open(&mut inner);
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            status: state.status,
            current_failures: state.failures,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("status", &inner.status)
            .field("failures", &inner.failures)
            .finish()
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        if let Some(task) = self.monitor.get_mut().take() {
            task.abort();
        }
    }
}

/// Frees the probe slot if the probing future is dropped before finishing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.write().probe_in_flight = false;
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current status.
    pub status: CircuitStatus,
    /// Failures counted toward the threshold.
    pub current_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub total_timeouts: u64,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 - 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_requests as f64
        }
    }

    /// Calculate failure rate (0.0 - 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(
            CircuitBreakerConfig::new("test")
                .error_threshold(threshold)
                .reset_timeout(Duration::from_secs(30))
                .timeout(Duration::from_secs(5)),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async { Err("boom") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        assert_eq!(cb.status(), CircuitStatus::Closed);

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Execution("boom"))));
        }
        assert_eq!(cb.status(), CircuitStatus::Closed);

        let _ = fail(&cb).await;
        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.failures, 3);
        assert!(state.last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_never_invokes_operation() {
        let cb = breaker(1);
        let _ = fail(&cb).await;

        let invoked = AtomicU32::new(0);
        for _ in 0..10 {
            let result: Result<(), CircuitBreakerError<&str>> = cb
                .call(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.unwrap_err().is_open());
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().total_rejections, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let cb = breaker(3);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state().failures, 2);

        let ok: Result<u8, CircuitBreakerError<&str>> = cb.call(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(cb.state().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);

        let probe: Result<(), CircuitBreakerError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(probe.is_ok());
        let state = cb.state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        // The reset window restarts from the probe failure.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cb.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_half_open() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .call(|| async move {
                    let _ = rx.await;
                    Ok::<_, &str>("recovered")
                })
                .await
        });
        tokio::task::yield_now().await;

        let concurrent: Result<(), CircuitBreakerError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(concurrent.unwrap_err().is_open());

        tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), "recovered");
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("slow")
                .error_threshold(2)
                .timeout(Duration::from_secs(1)),
        );

        for _ in 0..2 {
            let result: Result<(), CircuitBreakerError<&str>> = cb
                .call(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await;
            assert!(result.unwrap_err().is_timeout());
        }

        let stats = cb.stats();
        assert_eq!(stats.status, CircuitStatus::Open);
        assert_eq!(stats.total_timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = breaker(1);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let pending = cb.call(|| std::future::pending::<Result<(), &str>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        let probe: Result<(), CircuitBreakerError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(probe.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_moves_to_half_open() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new("monitored")
                .error_threshold(1)
                .reset_timeout(Duration::from_secs(5))
                .monitor_interval(Duration::from_secs(1)),
        );
        let _ = fail(&cb).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cb.inner.read().status, CircuitStatus::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_open_and_reset() {
        let cb = breaker(5);
        cb.force_open();
        assert_eq!(cb.status(), CircuitStatus::Open);
        cb.reset();
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_metrics() {
        let metrics = Arc::new(MetricsRegistry::new("test").unwrap());
        let cb = CircuitBreaker::with_metrics(
            CircuitBreakerConfig::new("cache").error_threshold(1),
            metrics.clone(),
        );
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.circuits["cache"].state, "open");
        assert_eq!(snapshot.circuits["cache"].rejections, 1);
    }

    #[test]
    fn test_stats_rates() {
        let stats = CircuitBreakerStats {
            name: "x".into(),
            status: CircuitStatus::Closed,
            current_failures: 0,
            total_requests: 4,
            total_successes: 3,
            total_failures: 1,
            total_rejections: 0,
            total_timeouts: 0,
        };
        assert_eq!(stats.success_rate(), 0.75);
        assert_eq!(stats.failure_rate(), 0.25);
    }
}

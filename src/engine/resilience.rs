//! Resilience layer: retry policies, circuit breakers and their manager.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{PipelineError, Result};

/// How the base delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffKind {
    /// Same delay for every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay doubles (by `multiplier`) with each attempt
    #[default]
    Exponential,
}

/// How randomness is applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterKind {
    /// Use the computed delay as-is
    #[default]
    None,
    /// Uniform between zero and the computed delay
    Full,
    /// Half the computed delay plus uniform up to the other half
    Equal,
    /// Uniform between the base delay and three times the computed delay,
    /// clamped to the maximum
    Decorrelated,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Growth curve for the delay
    pub backoff: BackoffKind,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any computed delay
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Randomization applied to computed delays
    pub jitter: JitterKind,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: JitterKind::None,
        }
    }
}

impl RetryOptions {
    /// One attempt, no retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `max_attempts` attempts with zero delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Reject configurations that cannot drive a retry loop.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.multiplier <= 0.0 {
            return Err(PipelineError::Configuration(
                "retry multiplier must be positive".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(PipelineError::Configuration(
                "retry max_delay must not be below base_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Classifier deciding whether an application error is transient.
pub type RetryClassifier = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Computes retry delays and classifies transient errors.
#[derive(Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
    classifier: Option<RetryClassifier>,
}

impl RetryPolicy {
    /// Policy over `options` treating every application error as retryable.
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            classifier: None,
        }
    }

    /// Attach a transient-error classifier.
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// The policy's configuration.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.options.base_delay;
        let computed = match self.options.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = self.options.multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64((base.as_secs_f64() * factor).min(u32::MAX as f64))
            }
        };
        let clamped = computed.min(self.options.max_delay);
        self.apply_jitter(clamped)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self.options.jitter {
            JitterKind::None => delay,
            JitterKind::Full => Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64()),
            JitterKind::Equal => {
                let half = delay.as_secs_f64() / 2.0;
                Duration::from_secs_f64(half + rng.gen::<f64>() * half)
            }
            JitterKind::Decorrelated => {
                let low = self.options.base_delay.as_secs_f64();
                let high = (delay.as_secs_f64() * 3.0).max(low);
                Duration::from_secs_f64(rng.gen_range(low..=high))
                    .min(self.options.max_delay)
            }
        }
    }

    /// Whether the error at the given (1-based) attempt should be retried.
    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        attempt < self.options.max_attempts && self.is_retryable(error)
    }

    /// Whether the error is considered transient.
    ///
    /// Already classified pipeline errors (cancellation, open circuits,
    /// validation, wrapped node failures) are never retried; the classifier,
    /// when present, decides for application errors.
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        match error {
            PipelineError::Node(_) => self
                .classifier
                .as_ref()
                .map(|classifier| classifier(error))
                .unwrap_or(true),
            _ => false,
        }
    }
}

/// Whether an error already carries pipeline-level classification and must
/// propagate unchanged rather than be wrapped as a fresh exhaustion.
pub(crate) fn is_classified(error: &PipelineError) -> bool {
    !matches!(error, PipelineError::Node(_))
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow; failures are tracked
    Closed,
    /// Requests are blocked until the open duration elapses
    Open,
    /// A bounded number of probe requests are allowed
    HalfOpen,
}

/// Which statistic trips the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThresholdKind {
    /// Trip after N consecutive failures
    #[default]
    ConsecutiveFailures,
    /// Trip after N failures inside the sampling window
    WindowCount,
    /// Trip when the failure rate inside the sampling window crosses the
    /// rate threshold (once the window holds enough samples)
    WindowRate,
    /// Trip on either consecutive failures or window rate
    Hybrid,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Failures (consecutive or in-window, per `threshold`) that trip
    pub failure_threshold: u32,
    /// Failure rate in `[0, 1]` that trips under rate thresholds
    pub failure_rate_threshold: f64,
    /// Width of the rolling outcome window
    pub sampling_window: Duration,
    /// How long the breaker blocks before probing
    pub open_duration: Duration,
    /// Probes allowed while half-open
    pub half_open_max_attempts: u32,
    /// Probe successes required to close again
    pub half_open_success_threshold: u32,
    /// Which statistic trips the breaker
    pub threshold: ThresholdKind,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            sampling_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 1,
            half_open_success_threshold: 1,
            threshold: ThresholdKind::ConsecutiveFailures,
        }
    }
}

impl CircuitBreakerOptions {
    /// Reject configurations the state machine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PipelineError::Configuration(
                "circuit breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(PipelineError::Configuration(
                "circuit breaker failure_rate_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.sampling_window.is_zero() {
            return Err(PipelineError::Configuration(
                "circuit breaker sampling_window must be positive".to_string(),
            ));
        }
        if self.half_open_max_attempts == 0 || self.half_open_success_threshold == 0 {
            return Err(PipelineError::Configuration(
                "circuit breaker half-open thresholds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded history of `(timestamp, success)` outcomes; entries older than
/// the sampling window are purged on every access.
pub struct RollingWindow {
    window: Duration,
    entries: VecDeque<(Instant, bool)>,
}

impl RollingWindow {
    /// A window of the given width.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&(stamp, _)) = self.entries.front() {
            if now.duration_since(stamp) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one outcome.
    pub fn record(&mut self, success: bool) {
        let now = Instant::now();
        self.purge(now);
        self.entries.push_back((now, success));
    }

    /// Outcomes currently inside the window.
    pub fn len(&mut self) -> usize {
        self.purge(Instant::now());
        self.entries.len()
    }

    /// Whether the window holds no outcomes.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Failures currently inside the window.
    pub fn failures(&mut self) -> usize {
        self.purge(Instant::now());
        self.entries.iter().filter(|(_, success)| !success).count()
    }

    /// Failure rate over the window, zero when empty.
    pub fn failure_rate(&mut self) -> f64 {
        self.purge(Instant::now());
        if self.entries.is_empty() {
            return 0.0;
        }
        self.failures() as f64 / self.entries.len() as f64
    }

    /// Length of the trailing run of failures.
    pub fn consecutive_failures(&mut self) -> usize {
        self.purge(Instant::now());
        self.entries
            .iter()
            .rev()
            .take_while(|(_, success)| !success)
            .count()
    }

    /// Drop all outcomes.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    consecutive_failures: u32,
    half_open_attempts: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_access: Instant,
}

/// Per-node circuit breaker; all state behind a single lock.
pub struct CircuitBreaker {
    node_id: String,
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

/// Snapshot of a breaker's state, for observability.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Outcomes currently in the window
    pub window_len: usize,
    /// Failures currently in the window
    pub window_failures: usize,
    /// Trailing consecutive failures
    pub consecutive_failures: u32,
    /// Time spent in the current open period, if open
    pub open_for: Option<Duration>,
}

impl CircuitBreaker {
    /// A closed breaker guarding `node_id`.
    pub fn new(node_id: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            node_id: node_id.into(),
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: RollingWindow::new(options.sampling_window),
                consecutive_failures: 0,
                half_open_attempts: 0,
                half_open_successes: 0,
                opened_at: None,
                last_access: Instant::now(),
            }),
        }
    }

    /// Id of the node this breaker guards.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether a call may proceed. While open this returns false; once the
    /// open duration elapses the breaker moves to half-open and admits up to
    /// the configured number of probes.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.last_access = Instant::now();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.options.open_duration {
                info!(node = %self.node_id, "circuit breaker half-open, probing");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.options.half_open_max_attempts {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.last_access = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.window.record(true);
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.options.half_open_success_threshold {
                    info!(node = %self.node_id, "circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.consecutive_failures = 0;
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_access = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.window.record(false);
                inner.consecutive_failures += 1;
                if self.threshold_met(&mut inner) {
                    warn!(node = %self.node_id, "circuit breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::HalfOpen => {
                warn!(node = %self.node_id, "probe failed, circuit breaker reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {
                // Failures while blocked keep the breaker open.
            }
        }
    }

    fn threshold_met(&self, inner: &mut BreakerInner) -> bool {
        let by_consecutive = inner.consecutive_failures >= self.options.failure_threshold;
        let by_count = inner.window.failures() >= self.options.failure_threshold as usize;
        let by_rate = inner.window.len() >= self.options.failure_threshold as usize
            && inner.window.failure_rate() >= self.options.failure_rate_threshold;
        match self.options.threshold {
            ThresholdKind::ConsecutiveFailures => by_consecutive,
            ThresholdKind::WindowCount => by_count,
            ThresholdKind::WindowRate => by_rate,
            ThresholdKind::Hybrid => by_consecutive || by_rate,
        }
    }

    /// The breaker's current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.options.open_duration {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
        }
        inner.state
    }

    /// Snapshot of the breaker for observability.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            window_len: inner.window.len(),
            window_failures: inner.window.failures(),
            consecutive_failures: inner.consecutive_failures,
            open_for: match inner.state {
                CircuitState::Open => inner.opened_at.map(|at| at.elapsed()),
                _ => None,
            },
        }
    }

    fn last_access(&self) -> Instant {
        self.inner.lock().last_access
    }
}

/// Configuration of the circuit breaker manager's memory behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// Maximum breakers tracked at once
    pub max_tracked: usize,
    /// Run the periodic cleanup task
    pub enable_cleanup: bool,
    /// How often the cleanup task sweeps
    pub cleanup_interval: Duration,
    /// Breakers untouched for this long are evicted
    pub inactivity_threshold: Duration,
    /// Upper bound on one cleanup sweep
    pub cleanup_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_tracked: 1000,
            enable_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(300),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

/// Runner-scoped registry of circuit breakers keyed by node id, with a
/// bounded capacity, periodic inactivity cleanup and aggressive eviction
/// when full.
pub struct CircuitBreakerManager {
    options: ManagerOptions,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreakerManager {
    /// A manager with the given memory options. When cleanup is enabled and
    /// a tokio runtime is available, a background sweep task starts.
    pub fn new(options: ManagerOptions) -> Arc<Self> {
        let manager = Arc::new(Self {
            options,
            breakers: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(None),
        });
        if options.enable_cleanup {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let weak = Arc::downgrade(&manager);
                let task = handle.spawn(cleanup_loop(weak, options));
                *manager.cleanup.lock() = Some(task);
            }
        }
        manager
    }

    /// Get the breaker for `node_id`, creating it with `options` on first
    /// use. Creation against a full registry first evicts inactive breakers,
    /// then the least recently used one; when nothing can be evicted the
    /// creation fails.
    pub fn get_or_create(
        &self,
        node_id: &str,
        options: &CircuitBreakerOptions,
    ) -> Result<Arc<CircuitBreaker>> {
        options.validate()?;
        let mut breakers = self.breakers.lock();
        if let Some(existing) = breakers.get(node_id) {
            return Ok(Arc::clone(existing));
        }

        if breakers.len() >= self.options.max_tracked {
            let evicted = evict_inactive(&mut breakers, self.options.inactivity_threshold);
            if evicted == 0 {
                // Aggressive eviction: drop the least recently used breaker.
                if let Some(lru) = breakers
                    .iter()
                    .min_by_key(|(_, breaker)| breaker.last_access())
                    .map(|(id, _)| id.clone())
                {
                    warn!(node = %lru, "evicting least recently used circuit breaker");
                    breakers.remove(&lru);
                }
            }
            if breakers.len() >= self.options.max_tracked {
                return Err(PipelineError::Configuration(format!(
                    "cannot track circuit breaker for '{}': registry is full ({} tracked) and nothing can be evicted",
                    node_id, self.options.max_tracked
                )));
            }
        }

        let breaker = Arc::new(CircuitBreaker::new(node_id, *options));
        breakers.insert(node_id.to_string(), Arc::clone(&breaker));
        debug!(node = %node_id, tracked = breakers.len(), "circuit breaker created");
        Ok(breaker)
    }

    /// The breaker for `node_id`, if one exists.
    pub fn get(&self, node_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(node_id).cloned()
    }

    /// Number of breakers currently tracked.
    pub fn tracked(&self) -> usize {
        self.breakers.lock().len()
    }

    /// Stop the cleanup task and drop all breakers.
    pub fn teardown(&self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.abort();
        }
        self.breakers.lock().clear();
    }
}

impl Drop for CircuitBreakerManager {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.lock().take() {
            task.abort();
        }
    }
}

fn evict_inactive(
    breakers: &mut HashMap<String, Arc<CircuitBreaker>>,
    threshold: Duration,
) -> usize {
    let now = Instant::now();
    let stale: Vec<String> = breakers
        .iter()
        .filter(|(_, breaker)| now.duration_since(breaker.last_access()) > threshold)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &stale {
        debug!(node = %id, "evicting inactive circuit breaker");
        breakers.remove(id);
    }
    stale.len()
}

async fn cleanup_loop(manager: Weak<CircuitBreakerManager>, options: ManagerOptions) {
    let mut ticker = tokio::time::interval(options.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            return;
        };
        let sweep = async {
            let mut breakers = manager.breakers.lock();
            evict_inactive(&mut breakers, options.inactivity_threshold)
        };
        if tokio::time::timeout(options.cleanup_timeout, sweep).await.is_err() {
            warn!("circuit breaker cleanup sweep timed out");
        }
    }
}

/// Run `operation` under the breaker and retry policy: each attempt asks the
/// breaker for permission, records its outcome, and retries transient
/// failures with the policy's delay until attempts run out.
///
/// Cancellation and already classified pipeline errors propagate unchanged;
/// exhausted application errors surface as
/// [`PipelineError::RetryExhausted`].
pub(crate) async fn execute_with_retries<T, F, Fut>(
    node_id: &str,
    policy: &RetryPolicy,
    breaker: Option<&Arc<CircuitBreaker>>,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(breaker) = breaker {
            if !breaker.can_execute() {
                return Err(PipelineError::CircuitOpen {
                    node_id: node_id.to_string(),
                });
            }
        }

        match operation().await {
            Ok(value) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                return Ok(value);
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if is_classified(&err) => return Err(err),
            Err(err) => {
                if let Some(breaker) = breaker {
                    breaker.record_failure();
                }
                if policy.should_retry(&err, attempt) {
                    let delay = policy.delay(attempt);
                    debug!(node = %node_id, attempt, ?delay, error = %err, "retrying");
                    attempt += 1;
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    return Err(PipelineError::RetryExhausted {
                        node_id: node_id.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
}

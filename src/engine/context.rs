//! Shared per-run state: parameter bags, cancellation and disposables.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error_handler::DeadLetterSink;
use super::resilience::{CircuitBreakerOptions, RetryClassifier, RetryOptions};
use crate::PipelineError;

/// Context items key under which the last retry-exhausted error is recorded,
/// letting downstream sinks detect upstream exhaustion and suppress output.
pub const LAST_RETRY_EXHAUSTED_KEY: &str = "LastRetryExhaustedException";

/// Property key prefix under which `global::*` graph annotations are copied
/// when a run starts.
pub const GLOBAL_PROPERTY_PREFIX: &str = "flowgraph.global.";

const COUNTER_PREFIX: &str = "counter::";

/// A value stored in a context bag.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// A resource owned by the run, disposed when the run completes.
///
/// Disposal runs in reverse registration order; individual failures are
/// logged and swallowed.
pub trait Disposable: Send {
    /// Release the resource.
    fn dispose(&mut self) -> anyhow::Result<()>;

    /// Name for disposal logs.
    fn name(&self) -> &str {
        "disposable"
    }
}

/// A concurrent, string-keyed bag of values.
///
/// A bag created by the context is owned and cleared on disposal; a bag
/// supplied externally is shared and left untouched.
#[derive(Clone)]
pub struct ContextBag {
    map: Arc<DashMap<String, AnyValue>>,
    owned: bool,
}

impl ContextBag {
    fn owned() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            owned: true,
        }
    }

    /// Wrap an externally supplied map; it will not be cleared on disposal.
    pub fn external(map: Arc<DashMap<String, AnyValue>>) -> Self {
        Self { map, owned: false }
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.map.insert(key.into(), Arc::new(value));
    }

    /// Store an already erased value under `key`.
    pub fn insert_value(&self, key: impl Into<String>, value: AnyValue) {
        self.map.insert(key.into(), value);
    }

    /// Fetch the value under `key` if it is a `T`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.map
            .get(key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    /// Fetch a clone of the value under `key` if it is a `T`.
    pub fn get_cloned<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.get::<T>(key).map(|value| (*value).clone())
    }

    /// Atomically update the value under `key`, inserting `initial` first if
    /// the key is absent. The update runs under the key's lock, so concurrent
    /// writers serialize.
    pub fn update<T, F>(&self, key: impl Into<String>, initial: T, update: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let mut entry = self
            .map
            .entry(key.into())
            .or_insert_with(|| Arc::new(initial) as AnyValue);
        if let Ok(current) = entry.value().clone().downcast::<T>() {
            *entry.value_mut() = Arc::new(update(&current)) as AnyValue;
        }
    }

    /// Remove the value under `key`.
    pub fn remove(&self, key: &str) -> Option<AnyValue> {
        self.map.remove(key).map(|(_, value)| value)
    }

    /// Whether a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn dispose(&self) {
        if self.owned {
            self.map.clear();
        }
    }
}

/// Pipeline-wide configuration carried by the context.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Default retry policy for every node
    pub retry: RetryOptions,
    /// Transient-error classifier; absent, every application error is
    /// considered retryable
    pub retry_classifier: Option<RetryClassifier>,
    /// Circuit breaker applied to every node; `None` disables breakers
    /// except where a node opts in
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Default join buffer capacity per input
    pub merge_capacity: usize,
    /// Default multicast buffer per subscriber
    pub branch_capacity: usize,
    /// Default replay buffer cap for retried sink inputs
    pub replay_cap: usize,
    /// Destination for dead-lettered items
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            retry_classifier: None,
            circuit_breaker: None,
            merge_capacity: 64,
            branch_capacity: 64,
            replay_cap: 10_000,
            dead_letter: None,
        }
    }
}

/// Shared per-run state, passed by reference to every node in one run.
///
/// Holds three string-keyed bags (`parameters` for read-mostly configuration,
/// `items` for transient per-run state, `properties` for cross-component
/// metadata), the cancellation token, resilience configuration, and the
/// disposables transferred from the builder.
pub struct PipelineContext {
    /// Read-mostly configuration
    pub parameters: ContextBag,
    /// Transient per-run state
    pub items: ContextBag,
    /// Cross-component metadata
    pub properties: ContextBag,
    token: CancellationToken,
    options: PipelineOptions,
    disposables: Mutex<Vec<Box<dyn Disposable>>>,
}

impl PipelineContext {
    /// A context with default options and a fresh cancellation token.
    pub fn new() -> Self {
        Self::with_options(PipelineOptions::default())
    }

    /// A context with the given options.
    pub fn with_options(options: PipelineOptions) -> Self {
        Self {
            parameters: ContextBag::owned(),
            items: ContextBag::owned(),
            properties: ContextBag::owned(),
            token: CancellationToken::new(),
            options,
            disposables: Mutex::new(Vec::new()),
        }
    }

    /// Use an externally controlled cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Use an externally supplied parameters bag; it survives disposal.
    pub fn with_parameters(mut self, map: Arc<DashMap<String, AnyValue>>) -> Self {
        self.parameters = ContextBag::external(map);
        self
    }

    /// The run's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Pipeline-wide configuration.
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Register a resource for disposal at run completion.
    pub fn register_disposable(&self, disposable: Box<dyn Disposable>) {
        self.disposables.lock().push(disposable);
    }

    pub(crate) fn add_disposables(&self, disposables: Vec<Box<dyn Disposable>>) {
        self.disposables.lock().extend(disposables);
    }

    /// Register (or fetch) the element counter for the stream `name`,
    /// exposing it in the properties bag for observability.
    pub(crate) fn register_counter(&self, name: &str) -> Arc<AtomicU64> {
        let key = format!("{}{}", COUNTER_PREFIX, name);
        if let Some(existing) = self.properties.get::<AtomicU64>(&key) {
            return existing;
        }
        let counter = Arc::new(AtomicU64::new(0));
        self.properties
            .insert_value(key, Arc::clone(&counter) as AnyValue);
        counter
    }

    /// Elements counted so far for the stream `name`.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.properties
            .get::<AtomicU64>(&format!("{}{}", COUNTER_PREFIX, name))
            .map(|counter| counter.load(Ordering::Relaxed))
    }

    pub(crate) fn record_retry_exhausted(&self, error: &PipelineError) {
        self.items.insert(LAST_RETRY_EXHAUSTED_KEY, error.clone());
    }

    /// The last retry-exhausted error recorded by a counting pipe, if any.
    pub fn last_retry_exhausted(&self) -> Option<PipelineError> {
        self.items.get_cloned::<PipelineError>(LAST_RETRY_EXHAUSTED_KEY)
    }

    /// Dispose run-owned resources: run disposables in reverse registration
    /// order (logging and swallowing individual failures) and clear the
    /// owned bags. Externally supplied bags are left untouched.
    pub fn dispose(&self) {
        let mut disposables = std::mem::take(&mut *self.disposables.lock());
        while let Some(mut disposable) = disposables.pop() {
            if let Err(err) = disposable.dispose() {
                warn!(name = disposable.name(), error = %err, "disposal failed");
            } else {
                debug!(name = disposable.name(), "disposed");
            }
        }
        self.parameters.dispose();
        self.items.dispose();
        self.properties.dispose();
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

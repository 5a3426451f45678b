//! Execution engine: planning, per-node strategies, resilience, context and
//! the top-level runner.

pub mod context;
pub mod coordinator;
pub mod error_handler;
pub(crate) mod node_executor;
pub mod resilience;
pub mod runner;

pub use context::{
    AnyValue, ContextBag, Disposable, PipelineContext, PipelineOptions, GLOBAL_PROPERTY_PREFIX,
    LAST_RETRY_EXHAUSTED_KEY,
};
pub use coordinator::{ExecutionCoordinator, ExecutionPlan};
pub use error_handler::{
    DeadLetter, DeadLetterSink, ErrorDecision, ErrorHandler, ErrorHandlerBuilder,
    ErrorHandlerFactory, InMemoryDeadLetterSink,
};
pub use resilience::{
    BackoffKind, CircuitBreaker, CircuitBreakerManager, CircuitBreakerMetrics,
    CircuitBreakerOptions, CircuitState, JitterKind, ManagerOptions, RetryClassifier,
    RetryOptions, RetryPolicy, RollingWindow, ThresholdKind,
};
pub use runner::PipelineRunner;

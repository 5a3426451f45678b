//! # Flowgraph
//!
//! A runtime for building and executing typed, directed-acyclic dataflow
//! pipelines: graphs of source, transform, sink, batching, branching and join
//! nodes exchanging typed streams.
//!
//! ## Overview
//!
//! An application declares a graph with [`graph::PipelineBuilder`], the builder
//! validates it once at build time, and [`engine::PipelineRunner`] executes it
//! with streaming backpressure, retries, circuit breakers and per-item error
//! handling.
//!
//! ## Key features
//!
//! - **Typed graphs**: edges carry payload types; mismatches fail at build time
//! - **Lazy streams**: elements are pulled by sinks, backpressure propagates
//!   upstream through bounded channels
//! - **Resilience**: retry policies with backoff and jitter, per-node circuit
//!   breakers, rule-based per-item error handling with dead-lettering
//! - **Cooperative cancellation**: a single token threads through every node
//!   and pipe

#![warn(missing_docs)]

use std::sync::Arc;

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for pipeline operations
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Graph invalid at build time
    #[error(transparent)]
    Validation(#[from] graph::ValidationError),

    /// Invalid options or runtime wiring
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A node failed with an already classified error
    #[error("node '{node_id}' failed: {source}")]
    NodeExecution {
        /// Id of the failing node
        node_id: String,
        /// Underlying cause
        #[source]
        source: Box<PipelineError>,
    },

    /// An unclassified error surfaced to the runner, wrapped with the node it
    /// came from
    #[error("pipeline execution failed at node '{node_id}': {source}")]
    PipelineExecution {
        /// Id of the node the error surfaced from
        node_id: String,
        /// Underlying cause
        #[source]
        source: Box<PipelineError>,
    },

    /// The retry policy gave up on an operation
    #[error("node '{node_id}' exhausted {attempts} retry attempts: {source}")]
    RetryExhausted {
        /// Id of the node whose operation kept failing
        node_id: String,
        /// Attempts made before giving up
        attempts: u32,
        /// The last failure
        #[source]
        source: Box<PipelineError>,
    },

    /// Execution was blocked by an open circuit breaker
    #[error("circuit breaker open for node '{node_id}'")]
    CircuitOpen {
        /// Id of the guarded node
        node_id: String,
    },

    /// The replay buffer of a capped replayable pipe overflowed
    #[error("replay buffer for pipe '{pipe}' exceeded its cap of {cap} items")]
    ReplayCapExceeded {
        /// Name of the pipe
        pipe: String,
        /// Configured cap
        cap: usize,
    },

    /// Cooperative cancellation was observed
    #[error("pipeline cancelled")]
    Cancelled,

    /// Application-level error raised by a node implementation
    #[error("node error: {0}")]
    Node(Arc<anyhow::Error>),
}

impl PipelineError {
    /// Wrap an application-level error raised by a node.
    ///
    /// Pipeline errors travelling through `anyhow` (for example a cancellation
    /// observed inside a node body) are unwrapped rather than double-wrapped.
    pub fn from_node(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(inner) => inner,
            Err(err) => PipelineError::Node(Arc::new(err)),
        }
    }

    /// True when this error is (or wraps) a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::NodeExecution { source, .. }
            | PipelineError::PipelineExecution { source, .. }
            | PipelineError::RetryExhausted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True when this error is (or wraps) a retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        match self {
            PipelineError::RetryExhausted { .. } => true,
            PipelineError::NodeExecution { source, .. }
            | PipelineError::PipelineExecution { source, .. } => source.is_retry_exhausted(),
            _ => false,
        }
    }
}

/// Graph model: node definitions, edges, the immutable pipeline graph and the
/// fluent builder
pub mod graph;

/// Stream substrate: typed lazy asynchronous pipes and adapters between them
pub mod pipe;

/// Execution engine: coordinator, node executor, resilience layer, context and
/// runner
pub mod engine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_errors_unwrap_pipeline_errors() {
        let err = PipelineError::from_node(anyhow::Error::new(PipelineError::Cancelled));
        assert!(matches!(err, PipelineError::Cancelled));

        let err = PipelineError::from_node(anyhow::anyhow!("boom"));
        assert!(matches!(err, PipelineError::Node(_)));
    }

    #[test]
    fn cancellation_detected_through_wrappers() {
        let err = PipelineError::NodeExecution {
            node_id: "n".to_string(),
            source: Box::new(PipelineError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_retry_exhausted());
    }
}

//! Graph model for dataflow pipelines.
//!
//! A pipeline is declared through the [`PipelineBuilder`], which produces an
//! immutable, validated [`PipelineGraph`]: node definitions, typed edges and
//! preconfigured instances for lambda-constructed nodes.

use thiserror::Error;

pub mod builder;
pub mod edge;
pub mod node;
pub mod pipeline_graph;

pub use builder::{
    CollectorHandle, InputHandle, OutputHandle, PipelineBuilder, SinkHandle, SourceHandle,
    TransformHandle,
};
pub use edge::EdgeDef;
pub use node::{
    AnySinkNode, AnySourceNode, AnyTransformNode, CollectingSink, ExecutionStrategy, FnSink,
    FnTransform, IterSource, MultiSink, NodeDefinition, NodeInstance, NodeKind, NodeOptions,
    PayloadType, PipeOp, SinkNode, SourceNode, TransformNode,
};
pub use pipeline_graph::PipelineGraph;

/// A violation found while validating a pipeline graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two nodes were declared with the same canonical name
    #[error("Node names must be unique: '{0}'")]
    DuplicateName(String),

    /// An edge references a node that was never declared
    #[error("edge references unknown node '{0}'")]
    UnknownNode(String),

    /// The graph has no source node
    #[error("pipeline must contain at least one source node")]
    MissingSource,

    /// The graph has no sink node
    #[error("pipeline must contain at least one sink node")]
    MissingSink,

    /// The graph contains a cycle
    #[error("pipeline graph contains a cycle")]
    Cycle,

    /// An edge's payload type disagrees with one of its endpoints
    #[error("edge {from} -> {to} carries '{found}' but {to} expects '{expected}'")]
    TypeMismatch {
        /// Edge source node id
        from: String,
        /// Edge target node id
        to: String,
        /// Payload type the target expects
        expected: String,
        /// Payload type the edge carries
        found: String,
    },

    /// A transform is missing an inbound or outbound edge
    #[error("transform '{0}' must have at least one inbound and one outbound edge")]
    DisconnectedTransform(String),

    /// A source has an inbound edge
    #[error("source '{0}' cannot have inbound edges")]
    SourceWithInbound(String),

    /// A sink has an outbound edge
    #[error("sink '{0}' cannot have outbound edges")]
    SinkWithOutbound(String),

    /// A join node has fewer than two inbound edges
    #[error("join '{0}' requires at least two inbound edges")]
    JoinWithoutFanIn(String),

    /// A branch node has fewer than two outbound edges
    #[error("branch '{0}' requires at least two outbound edges")]
    BranchWithoutFanOut(String),

    /// A node is unreachable from every source
    #[error("node '{0}' is not reachable from any source")]
    Unreachable(String),

    /// An error-handler rule was registered after a catch-all rule
    #[error("error handler rule {0} is unreachable: it follows a catch-all rule")]
    UnreachableErrorRule(usize),

    /// The same edge was declared twice
    #[error("duplicate edge {from} -> {to}")]
    DuplicateEdge {
        /// Edge source node id
        from: String,
        /// Edge target node id
        to: String,
    },

    /// A node has no edges connecting it to the rest of the graph
    #[error("node '{0}' has no edges")]
    Isolated(String),
}

impl ValidationError {
    /// Stable diagnostic code for this violation.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::DuplicateName(_) => "NP0101",
            ValidationError::UnknownNode(_) => "NP0102",
            ValidationError::MissingSource => "NP0103",
            ValidationError::MissingSink => "NP0104",
            ValidationError::Cycle => "NP0105",
            ValidationError::TypeMismatch { .. } => "NP0106",
            ValidationError::DisconnectedTransform(_) => "NP0107",
            ValidationError::SourceWithInbound(_) => "NP0108",
            ValidationError::SinkWithOutbound(_) => "NP0109",
            ValidationError::JoinWithoutFanIn(_) => "NP0110",
            ValidationError::BranchWithoutFanOut(_) => "NP0111",
            ValidationError::Unreachable(_) => "NP0112",
            ValidationError::UnreachableErrorRule(_) => "NP0113",
            ValidationError::DuplicateEdge { .. } => "NP0114",
            ValidationError::Isolated(_) => "NP0115",
        }
    }
}

/// All violations found by a non-throwing validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// The violations, in detection order
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    /// Whether the graph passed validation.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "pipeline graph is valid");
        }
        writeln!(f, "pipeline graph failed validation:")?;
        for error in &self.errors {
            writeln!(f, "  [{}] {}", error.code(), error)?;
        }
        Ok(())
    }
}

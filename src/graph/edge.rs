//! Typed directed connections between nodes.

use super::node::PayloadType;

/// A typed edge from one node to another.
///
/// The payload type must equal the source's output type and the target's
/// expected input type; the builder validates this when the graph is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDef {
    /// Id of the producing node
    pub source: String,
    /// Id of the consuming node
    pub target: String,
    /// Type of the elements crossing this edge
    pub payload: PayloadType,
}

impl EdgeDef {
    /// Create an edge carrying `payload` from `source` to `target`.
    pub fn new(source: impl Into<String>, target: impl Into<String>, payload: PayloadType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            payload,
        }
    }
}

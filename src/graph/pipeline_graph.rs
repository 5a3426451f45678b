//! The immutable, validated pipeline graph.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::graph::{DiGraph, NodeIndex};

use super::edge::EdgeDef;
use super::node::{NodeDefinition, NodeInstance, NodeKind};
use crate::engine::context::Disposable;
use crate::engine::error_handler::ErrorHandler;

/// Constructor closure registered for a node type tag.
pub type NodeConstructor = Arc<dyn Fn() -> NodeInstance + Send + Sync>;

/// Registry mapping node type tags to constructor closures.
///
/// Populated by the builder when typed nodes are added; the coordinator uses
/// it to instantiate nodes that have no preconfigured instance.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    constructors: HashMap<String, NodeConstructor>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `tag`, replacing any previous one.
    pub fn register(&mut self, tag: impl Into<String>, constructor: NodeConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    /// Instantiate the node registered under `tag`.
    pub fn create(&self, tag: &str) -> Option<NodeInstance> {
        self.constructors.get(tag).map(|constructor| constructor())
    }

    /// Whether a constructor is registered for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }
}

/// An immutable pipeline graph: ordered node definitions, typed edges, and
/// instances for lambda-constructed nodes.
///
/// Graphs are produced exclusively by [`super::PipelineBuilder::build`] and
/// are structurally valid by construction.
#[derive(Clone)]
pub struct PipelineGraph {
    structure: DiGraph<usize, usize>,
    node_map: HashMap<String, NodeIndex>,
    definitions: Vec<NodeDefinition>,
    edges: Vec<EdgeDef>,
    preconfigured: HashMap<String, NodeInstance>,
    error_handlers: HashMap<String, Arc<ErrorHandler>>,
    annotations: HashMap<String, serde_json::Value>,
    registry: NodeRegistry,
    disposables: Arc<Mutex<Vec<Box<dyn Disposable>>>>,
}

impl PipelineGraph {
    pub(crate) fn new(
        definitions: Vec<NodeDefinition>,
        edges: Vec<EdgeDef>,
        preconfigured: HashMap<String, NodeInstance>,
        error_handlers: HashMap<String, Arc<ErrorHandler>>,
        annotations: HashMap<String, serde_json::Value>,
        registry: NodeRegistry,
        disposables: Vec<Box<dyn Disposable>>,
    ) -> Self {
        let mut structure = DiGraph::new();
        let mut node_map = HashMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            let node_index = structure.add_node(index);
            node_map.insert(definition.id.clone(), node_index);
        }
        for (index, edge) in edges.iter().enumerate() {
            if let (Some(&from), Some(&to)) =
                (node_map.get(&edge.source), node_map.get(&edge.target))
            {
                structure.add_edge(from, to, index);
            }
        }
        Self {
            structure,
            node_map,
            definitions,
            edges,
            preconfigured,
            error_handlers,
            annotations,
            registry,
            disposables: Arc::new(Mutex::new(disposables)),
        }
    }

    /// Transfer the disposables registered at build time to the caller.
    ///
    /// The runner drains this once per graph; resources registered on the
    /// builder are disposed when the first run completes.
    pub fn take_disposables(&self) -> Vec<Box<dyn Disposable>> {
        std::mem::take(&mut *self.disposables.lock())
    }

    /// Node definitions in declaration order.
    pub fn definitions(&self) -> &[NodeDefinition] {
        &self.definitions
    }

    /// Ids of all nodes, in declaration order.
    pub fn node_ids(&self) -> Vec<&str> {
        self.definitions
            .iter()
            .map(|definition| definition.id.as_str())
            .collect()
    }

    /// Look up a node definition by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.node_map
            .get(id)
            .and_then(|index| self.structure.node_weight(*index))
            .map(|&definition_index| &self.definitions[definition_index])
    }

    /// All edges, in declaration order.
    pub fn edges(&self) -> &[EdgeDef] {
        &self.edges
    }

    /// Inbound edges of `id`, in declaration order. Order matters for joins.
    pub fn inbound(&self, id: &str) -> Vec<&EdgeDef> {
        self.edges.iter().filter(|edge| edge.target == id).collect()
    }

    /// Outbound edges of `id`, in declaration order.
    pub fn outbound(&self, id: &str) -> Vec<&EdgeDef> {
        self.edges.iter().filter(|edge| edge.source == id).collect()
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.definitions.len()
    }

    /// Preconfigured instance for a lambda-constructed node.
    pub fn preconfigured(&self, id: &str) -> Option<NodeInstance> {
        self.preconfigured.get(id).cloned()
    }

    /// Error handler attached directly to a node at build time.
    pub fn error_handler(&self, id: &str) -> Option<Arc<ErrorHandler>> {
        self.error_handlers.get(id).cloned()
    }

    /// The annotation bag.
    pub fn annotations(&self) -> &HashMap<String, serde_json::Value> {
        &self.annotations
    }

    /// Look up one annotation.
    pub fn annotation(&self, key: &str) -> Option<&serde_json::Value> {
        self.annotations.get(key)
    }

    /// The node constructor registry.
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Ids of all source nodes, in declaration order.
    pub fn sources(&self) -> Vec<&str> {
        self.definitions
            .iter()
            .filter(|definition| definition.kind == NodeKind::Source)
            .map(|definition| definition.id.as_str())
            .collect()
    }

    /// Ids of all sink and tap nodes, in declaration order.
    pub fn sinks(&self) -> Vec<&str> {
        self.definitions
            .iter()
            .filter(|definition| {
                matches!(definition.kind, NodeKind::Sink | NodeKind::Tap)
            })
            .map(|definition| definition.id.as_str())
            .collect()
    }
}

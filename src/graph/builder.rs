//! Fluent construction of pipeline graphs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use petgraph::graph::DiGraph;
use tracing::debug;

use super::edge::EdgeDef;
use super::node::{
    BatchOp, CollectingSink, ExecutionStrategy, FnSink, FnTransform, IdentityOp, IterSource,
    MultiSink, NodeDefinition, NodeInstance, NodeKind, NodeOptions, PayloadType, SinkNode,
    SourceNode, TransformNode, UnbatchOp,
};
use super::pipeline_graph::{NodeRegistry, PipelineGraph};
use super::{ValidationError, ValidationReport};
use crate::engine::context::Disposable;
use crate::engine::error_handler::ErrorHandler;
use crate::engine::resilience::{CircuitBreakerOptions, RetryOptions};
use crate::{PipelineError, Result};

/// Build-time handle to a source node producing `Out`.
#[derive(Debug, Clone)]
pub struct SourceHandle<Out> {
    id: String,
    _marker: PhantomData<fn() -> Out>,
}

/// Build-time handle to a transform node mapping `In` to `Out`.
#[derive(Debug, Clone)]
pub struct TransformHandle<In, Out> {
    id: String,
    _marker: PhantomData<fn(In) -> Out>,
}

/// Build-time handle to a sink node consuming `In`.
#[derive(Debug, Clone)]
pub struct SinkHandle<In> {
    id: String,
    _marker: PhantomData<fn(In)>,
}

impl<Out> SourceHandle<Out> {
    /// The node id this handle refers to.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<In, Out> TransformHandle<In, Out> {
    /// The node id this handle refers to.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<In> SinkHandle<In> {
    /// The node id this handle refers to.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A handle whose node produces elements of `T`.
pub trait OutputHandle<T> {
    /// The producing node's id.
    fn id(&self) -> &str;
}

/// A handle whose node consumes elements of `T`.
pub trait InputHandle<T> {
    /// The consuming node's id.
    fn id(&self) -> &str;
}

impl<T> OutputHandle<T> for SourceHandle<T> {
    fn id(&self) -> &str {
        &self.id
    }
}

impl<In, T> OutputHandle<T> for TransformHandle<In, T> {
    fn id(&self) -> &str {
        &self.id
    }
}

impl<T, Out> InputHandle<T> for TransformHandle<T, Out> {
    fn id(&self) -> &str {
        &self.id
    }
}

impl<T> InputHandle<T> for SinkHandle<T> {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Shared view of the elements a collecting sink received.
#[derive(Clone)]
pub struct CollectorHandle<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> CollectorHandle<T> {
    /// Snapshot of the collected elements, in arrival order.
    pub fn items(&self) -> Vec<T> {
        self.inner.lock().clone()
    }

    /// Number of elements collected so far.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Fluent builder assembling a [`PipelineGraph`].
///
/// Node names are lowercased on entry. Duplicate names are detected as nodes
/// are added by default; [`PipelineBuilder::defer_name_validation`] postpones
/// the check to build time, which lets generated tap and branch names be
/// assigned without eager bookkeeping.
#[derive(Default)]
pub struct PipelineBuilder {
    definitions: Vec<NodeDefinition>,
    edges: Vec<EdgeDef>,
    preconfigured: HashMap<String, NodeInstance>,
    error_handlers: HashMap<String, Arc<ErrorHandler>>,
    annotations: HashMap<String, serde_json::Value>,
    registry: NodeRegistry,
    disposables: Vec<Box<dyn Disposable>>,
    errors: Vec<ValidationError>,
    eager_names: bool,
    tap_counter: usize,
}

impl PipelineBuilder {
    /// A new empty builder with eager name validation.
    pub fn new() -> Self {
        Self {
            eager_names: true,
            ..Self::default()
        }
    }

    /// Defer duplicate-name detection to build time.
    pub fn defer_name_validation(mut self) -> Self {
        self.eager_names = false;
        self
    }

    fn push_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        type_tag: String,
        input_type: Option<PayloadType>,
        output_type: Option<PayloadType>,
    ) -> String {
        let id = name.to_lowercase();
        if self.eager_names && self.definitions.iter().any(|def| def.id == id) {
            self.errors.push(ValidationError::DuplicateName(id.clone()));
        }
        self.definitions.push(NodeDefinition {
            id: id.clone(),
            display_name: name.to_string(),
            kind,
            type_tag,
            input_type,
            output_type,
            strategy: ExecutionStrategy::default(),
            error_handler: None,
            options: NodeOptions::default(),
        });
        id
    }

    /// Add a source constructed through the registry by its type.
    pub fn add_source<S>(&mut self, name: &str) -> SourceHandle<S::Out>
    where
        S: SourceNode + Default + 'static,
    {
        let tag = std::any::type_name::<S>().to_string();
        self.registry.register(
            tag.clone(),
            Arc::new(|| NodeInstance::source(S::default())),
        );
        let id = self.push_node(
            name,
            NodeKind::Source,
            tag,
            None,
            Some(PayloadType::of::<S::Out>()),
        );
        SourceHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a source from a preconfigured instance.
    pub fn add_source_instance<S>(&mut self, name: &str, source: S) -> SourceHandle<S::Out>
    where
        S: SourceNode + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Source,
            std::any::type_name::<S>().to_string(),
            None,
            Some(PayloadType::of::<S::Out>()),
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::source(source));
        SourceHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a lambda source yielding a fixed collection.
    pub fn source_from_iter<T>(&mut self, name: &str, items: Vec<T>) -> SourceHandle<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.add_source_instance(name, IterSource::new(name.to_lowercase(), items))
    }

    /// Add a transform constructed through the registry by its type.
    pub fn add_transform<T>(&mut self, name: &str) -> TransformHandle<T::In, T::Out>
    where
        T: TransformNode + Default + 'static,
    {
        let tag = std::any::type_name::<T>().to_string();
        self.registry.register(
            tag.clone(),
            Arc::new(|| NodeInstance::transform(T::default())),
        );
        let id = self.push_node(
            name,
            NodeKind::Transform,
            tag,
            Some(PayloadType::of::<T::In>()),
            Some(PayloadType::of::<T::Out>()),
        );
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a transform from a preconfigured instance.
    pub fn add_transform_instance<T>(
        &mut self,
        name: &str,
        transform: T,
    ) -> TransformHandle<T::In, T::Out>
    where
        T: TransformNode + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Transform,
            std::any::type_name::<T>().to_string(),
            Some(PayloadType::of::<T::In>()),
            Some(PayloadType::of::<T::Out>()),
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::transform(transform));
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a lambda transform from a synchronous closure.
    pub fn transform_fn<I, O, F>(&mut self, name: &str, f: F) -> TransformHandle<I, O>
    where
        I: Clone + Send + Sync + 'static,
        O: Clone + Send + Sync + 'static,
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        self.add_transform_instance(name, FnTransform::new(f))
    }

    /// Add a sink constructed through the registry by its type.
    pub fn add_sink<S>(&mut self, name: &str) -> SinkHandle<S::In>
    where
        S: SinkNode + Default + 'static,
    {
        let tag = std::any::type_name::<S>().to_string();
        self.registry
            .register(tag.clone(), Arc::new(|| NodeInstance::sink(S::default())));
        let id = self.push_node(
            name,
            NodeKind::Sink,
            tag,
            Some(PayloadType::of::<S::In>()),
            None,
        );
        SinkHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a sink from a preconfigured instance.
    pub fn add_sink_instance<S>(&mut self, name: &str, sink: S) -> SinkHandle<S::In>
    where
        S: SinkNode + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Sink,
            std::any::type_name::<S>().to_string(),
            Some(PayloadType::of::<S::In>()),
            None,
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::sink(sink));
        SinkHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a polyvariant sink accepting `input` on its inbound edge.
    pub fn add_multi_sink<T>(&mut self, name: &str, sink: MultiSink) -> SinkHandle<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Sink,
            "multi-sink".to_string(),
            Some(PayloadType::of::<T>()),
            None,
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::multi_sink(sink));
        SinkHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a lambda sink from a synchronous closure.
    pub fn sink_fn<I, F>(&mut self, name: &str, f: F) -> SinkHandle<I>
    where
        I: Clone + Send + Sync + 'static,
        F: Fn(I) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_sink_instance(name, FnSink::new(f))
    }

    /// Add a sink collecting every element, returning the handle pair.
    pub fn collecting_sink<T>(&mut self, name: &str) -> (SinkHandle<T>, CollectorHandle<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let sink = CollectingSink::<T>::new();
        let collector = CollectorHandle {
            inner: sink.handle(),
        };
        (self.add_sink_instance(name, sink), collector)
    }

    /// Add an explicit join node merging inputs of type `T`.
    pub fn add_join<T>(&mut self, name: &str) -> TransformHandle<T, T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Join,
            "join".to_string(),
            Some(PayloadType::of::<T>()),
            Some(PayloadType::of::<T>()),
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::pipe_op(Arc::new(IdentityOp)));
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add an explicit branch node fanning `T` out to several consumers.
    pub fn add_branch<T>(&mut self, name: &str, buffer: Option<usize>) -> TransformHandle<T, T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Branch,
            "branch".to_string(),
            Some(PayloadType::of::<T>()),
            Some(PayloadType::of::<T>()),
        );
        if let Some(buffer) = buffer {
            self.annotations.insert(
                format!("branch::{}", id),
                serde_json::Value::from(buffer as u64),
            );
        }
        if let Some(def) = self.definitions.iter_mut().find(|def| def.id == id) {
            def.options.branch_buffer = buffer;
        }
        self.preconfigured
            .insert(id.clone(), NodeInstance::pipe_op(Arc::new(IdentityOp)));
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add a batch node grouping `T` into `Vec<T>` by size and timeout.
    pub fn add_batch<T>(
        &mut self,
        name: &str,
        size: usize,
        timeout: Duration,
    ) -> TransformHandle<T, Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Batch,
            "batch".to_string(),
            Some(PayloadType::of::<T>()),
            Some(PayloadType::of::<Vec<T>>()),
        );
        if let Some(def) = self.definitions.iter_mut().find(|def| def.id == id) {
            def.strategy = ExecutionStrategy::Batching { size, timeout };
        }
        self.preconfigured.insert(
            id.clone(),
            NodeInstance::pipe_op(Arc::new(BatchOp::<T> {
                size,
                timeout,
                _marker: PhantomData,
            })),
        );
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Add an unbatch node flattening `Vec<T>` back into `T`.
    pub fn add_unbatch<T>(&mut self, name: &str) -> TransformHandle<Vec<T>, T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.push_node(
            name,
            NodeKind::Unbatch,
            "unbatch".to_string(),
            Some(PayloadType::of::<Vec<T>>()),
            Some(PayloadType::of::<T>()),
        );
        self.preconfigured.insert(
            id.clone(),
            NodeInstance::pipe_op(Arc::new(UnbatchOp::<T> {
                _marker: PhantomData,
            })),
        );
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Connect two handles with a typed edge.
    pub fn connect<T: 'static>(
        &mut self,
        from: &impl OutputHandle<T>,
        to: &impl InputHandle<T>,
    ) -> &mut Self {
        self.edges.push(EdgeDef::new(
            OutputHandle::id(from),
            InputHandle::id(to),
            PayloadType::of::<T>(),
        ));
        self
    }

    /// Connect two nodes by id; the edge carries the source's declared
    /// output type and is type-checked at build time.
    pub fn connect_ids(&mut self, from: &str, to: &str) -> &mut Self {
        let from = from.to_lowercase();
        let to = to.to_lowercase();
        let payload = self
            .definitions
            .iter()
            .find(|def| def.id == from)
            .and_then(|def| def.output_type);
        match payload {
            Some(payload) => {
                self.edges.push(EdgeDef::new(from, to, payload));
            }
            None => self.errors.push(ValidationError::UnknownNode(from)),
        }
        self
    }

    /// Attach a sink to an edge without consuming it, under a generated name.
    pub fn tap<T, S>(&mut self, from: &impl OutputHandle<T>, sink: S) -> SinkHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        S: SinkNode<In = T> + 'static,
    {
        self.tap_counter += 1;
        let name = format!("{}-tap-{}", OutputHandle::id(from), self.tap_counter);
        let id = self.push_node(
            &name,
            NodeKind::Tap,
            std::any::type_name::<S>().to_string(),
            Some(PayloadType::of::<T>()),
            None,
        );
        self.preconfigured
            .insert(id.clone(), NodeInstance::sink(sink));
        self.edges.push(EdgeDef::new(
            OutputHandle::id(from),
            id.clone(),
            PayloadType::of::<T>(),
        ));
        SinkHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Set the execution strategy of a node.
    pub fn set_strategy(&mut self, node_id: &str, strategy: ExecutionStrategy) -> &mut Self {
        self.with_definition(node_id, |def| def.strategy = strategy);
        self
    }

    /// Attach a rule-based error handler to a node.
    pub fn set_error_handler(&mut self, node_id: &str, handler: ErrorHandler) -> &mut Self {
        self.error_handlers
            .insert(node_id.to_lowercase(), Arc::new(handler));
        self
    }

    /// Reference an error handler to be resolved through the handler factory.
    pub fn set_error_handler_tag(&mut self, node_id: &str, tag: &str) -> &mut Self {
        let tag = tag.to_string();
        self.with_definition(node_id, move |def| def.error_handler = Some(tag));
        self
    }

    /// Override the retry policy of a node.
    pub fn set_retry(&mut self, node_id: &str, retry: RetryOptions) -> &mut Self {
        self.with_definition(node_id, move |def| def.options.retry = Some(retry));
        self
    }

    /// Enable a circuit breaker for a node.
    pub fn set_circuit_breaker(
        &mut self,
        node_id: &str,
        options: CircuitBreakerOptions,
    ) -> &mut Self {
        self.with_definition(node_id, move |def| {
            def.options.circuit_breaker = Some(options)
        });
        self
    }

    /// Override the join buffer capacity of a node.
    pub fn set_merge_capacity(&mut self, node_id: &str, capacity: usize) -> &mut Self {
        self.annotations.insert(
            format!("merge.capacity::{}", node_id.to_lowercase()),
            serde_json::Value::from(capacity as u64),
        );
        self.with_definition(node_id, move |def| {
            def.options.merge_capacity = Some(capacity)
        });
        self
    }

    fn with_definition(&mut self, node_id: &str, update: impl FnOnce(&mut NodeDefinition)) {
        let id = node_id.to_lowercase();
        match self.definitions.iter_mut().find(|def| def.id == id) {
            Some(def) => update(def),
            None => self.errors.push(ValidationError::UnknownNode(id)),
        }
    }

    /// Set a raw annotation on the graph.
    pub fn annotate(&mut self, key: &str, value: serde_json::Value) -> &mut Self {
        self.annotations.insert(key.to_string(), value);
        self
    }

    /// Default join buffer capacity for the whole pipeline.
    pub fn global_merge_capacity(&mut self, capacity: usize) -> &mut Self {
        self.annotate(
            "global::merge.capacity",
            serde_json::Value::from(capacity as u64),
        )
    }

    /// Default multicast buffer per subscriber for the whole pipeline.
    pub fn global_branch_capacity(&mut self, capacity: usize) -> &mut Self {
        self.annotate(
            "global::branch.capacity",
            serde_json::Value::from(capacity as u64),
        )
    }

    /// Register a resource to be disposed when the run completes.
    pub fn register_disposable(&mut self, disposable: Box<dyn Disposable>) -> &mut Self {
        self.disposables.push(disposable);
        self
    }

    /// Build the graph, failing on the first validation error.
    pub fn build(self) -> Result<PipelineGraph> {
        self.try_build().map_err(|report| {
            PipelineError::Validation(
                report
                    .errors
                    .into_iter()
                    .next()
                    .unwrap_or(ValidationError::MissingSource),
            )
        })
    }

    /// Build the graph, reporting every validation error found.
    pub fn try_build(mut self) -> std::result::Result<PipelineGraph, ValidationReport> {
        let mut errors = std::mem::take(&mut self.errors);
        validate_structure(&self.definitions, &self.edges, &mut errors);
        if !errors.is_empty() {
            return Err(ValidationReport { errors });
        }
        debug!(
            nodes = self.definitions.len(),
            edges = self.edges.len(),
            "pipeline graph validated"
        );
        Ok(PipelineGraph::new(
            self.definitions,
            self.edges,
            self.preconfigured,
            self.error_handlers,
            self.annotations,
            self.registry,
            self.disposables,
        ))
    }
}

/// Structural validation over the declared nodes and edges.
fn validate_structure(
    definitions: &[NodeDefinition],
    edges: &[EdgeDef],
    errors: &mut Vec<ValidationError>,
) {
    // Duplicate names, regardless of when the builder checked them.
    let mut seen = HashSet::new();
    for def in definitions {
        if !seen.insert(def.id.as_str()) {
            let duplicate = ValidationError::DuplicateName(def.id.clone());
            if !errors.contains(&duplicate) {
                errors.push(duplicate);
            }
        }
    }

    let ids: HashSet<&str> = definitions.iter().map(|def| def.id.as_str()).collect();
    for edge in edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode(endpoint.clone()));
            }
        }
    }

    let mut seen_edges = HashSet::new();
    for edge in edges {
        if !seen_edges.insert((edge.source.as_str(), edge.target.as_str())) {
            errors.push(ValidationError::DuplicateEdge {
                from: edge.source.clone(),
                to: edge.target.clone(),
            });
        }
    }

    if !definitions.iter().any(|def| def.kind == NodeKind::Source) {
        errors.push(ValidationError::MissingSource);
    }
    if !definitions
        .iter()
        .any(|def| matches!(def.kind, NodeKind::Sink | NodeKind::Tap))
    {
        errors.push(ValidationError::MissingSink);
    }

    // Edge typing: the payload must match the producer's output and the
    // consumer's input.
    let by_id: HashMap<&str, &NodeDefinition> = definitions
        .iter()
        .map(|def| (def.id.as_str(), def))
        .collect();
    for edge in edges {
        if let Some(source) = by_id.get(edge.source.as_str()) {
            if let Some(output) = source.output_type {
                if output != edge.payload {
                    errors.push(ValidationError::TypeMismatch {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        expected: output.name().to_string(),
                        found: edge.payload.name().to_string(),
                    });
                }
            }
        }
        if let Some(target) = by_id.get(edge.target.as_str()) {
            if let Some(input) = target.input_type {
                if input != edge.payload {
                    errors.push(ValidationError::TypeMismatch {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        expected: input.name().to_string(),
                        found: edge.payload.name().to_string(),
                    });
                }
            }
        }
    }

    // Per-kind arity.
    for def in definitions {
        let inbound = edges.iter().filter(|edge| edge.target == def.id).count();
        let outbound = edges.iter().filter(|edge| edge.source == def.id).count();
        match def.kind {
            NodeKind::Source => {
                if inbound > 0 {
                    errors.push(ValidationError::SourceWithInbound(def.id.clone()));
                }
                if outbound == 0 {
                    errors.push(ValidationError::Isolated(def.id.clone()));
                }
            }
            NodeKind::Sink | NodeKind::Tap => {
                if outbound > 0 {
                    errors.push(ValidationError::SinkWithOutbound(def.id.clone()));
                }
            }
            NodeKind::Join => {
                if inbound < 2 {
                    errors.push(ValidationError::JoinWithoutFanIn(def.id.clone()));
                } else if outbound == 0 {
                    errors.push(ValidationError::DisconnectedTransform(def.id.clone()));
                }
            }
            NodeKind::Branch => {
                if outbound < 2 {
                    errors.push(ValidationError::BranchWithoutFanOut(def.id.clone()));
                } else if inbound == 0 {
                    errors.push(ValidationError::DisconnectedTransform(def.id.clone()));
                }
            }
            NodeKind::Transform | NodeKind::Batch | NodeKind::Unbatch => {
                if inbound == 0 || outbound == 0 {
                    errors.push(ValidationError::DisconnectedTransform(def.id.clone()));
                }
            }
        }
    }

    // Cycle detection over a scratch graph.
    let mut scratch: DiGraph<(), ()> = DiGraph::new();
    let mut indices = HashMap::new();
    for def in definitions {
        indices.insert(def.id.as_str(), scratch.add_node(()));
    }
    for edge in edges {
        if let (Some(&from), Some(&to)) = (
            indices.get(edge.source.as_str()),
            indices.get(edge.target.as_str()),
        ) {
            scratch.add_edge(from, to, ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&scratch) {
        errors.push(ValidationError::Cycle);
    }

    // Every non-source node must be reachable from some source.
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut frontier: VecDeque<&str> = definitions
        .iter()
        .filter(|def| def.kind == NodeKind::Source)
        .map(|def| def.id.as_str())
        .collect();
    reachable.extend(frontier.iter().copied());
    while let Some(current) = frontier.pop_front() {
        for edge in edges.iter().filter(|edge| edge.source == current) {
            if reachable.insert(edge.target.as_str()) {
                frontier.push_back(edge.target.as_str());
            }
        }
    }
    for def in definitions {
        if def.kind != NodeKind::Source && !reachable.contains(def.id.as_str()) {
            errors.push(ValidationError::Unreachable(def.id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smoke_builder() -> PipelineBuilder {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1, 2, 3]);
        let double = builder.transform_fn("double", |x: i32| Ok(x * 2));
        let (sink, _collector) = builder.collecting_sink::<i32>("collect");
        builder.connect(&source, &double);
        builder.connect(&double, &sink);
        builder
    }

    #[test]
    fn builds_a_linear_pipeline() {
        let graph = smoke_builder().build().unwrap();
        assert_eq!(graph.node_ids(), vec!["numbers", "double", "collect"]);
        assert_eq!(graph.edges().len(), 2);
        assert!(graph.preconfigured("numbers").is_some());
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("foo", vec![1]);
        let sink = builder.sink_fn("foo", |_x: i32| Ok(()));
        builder.connect(&source, &sink);
        let err = builder.build().err().unwrap();
        let message = err.to_string();
        assert!(message.contains("Node names must be unique"));
        assert!(message.contains("foo"));
    }

    #[test]
    fn names_are_canonicalized_to_lowercase() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("Numbers", vec![1]);
        let sink = builder.sink_fn("Out", |_x: i32| Ok(()));
        builder.connect(&source, &sink);
        let graph = builder.build().unwrap();
        assert!(graph.node("numbers").is_some());
        assert_eq!(graph.node("numbers").unwrap().display_name, "Numbers");
    }

    #[test]
    fn missing_sink_is_reported() {
        let mut builder = PipelineBuilder::new();
        let _source = builder.source_from_iter("numbers", vec![1]);
        let report = builder.try_build().err().unwrap();
        assert!(report
            .errors
            .iter()
            .any(|error| matches!(error, ValidationError::MissingSink)));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1]);
        let a = builder.transform_fn("a", |x: i32| Ok(x));
        let b = builder.transform_fn("b", |x: i32| Ok(x));
        let sink = builder.sink_fn("out", |_x: i32| Ok(()));
        builder.connect(&source, &a);
        builder.connect(&a, &b);
        builder.connect(&b, &a);
        builder.connect(&b, &sink);
        let report = builder.try_build().err().unwrap();
        assert!(report
            .errors
            .iter()
            .any(|error| matches!(error, ValidationError::Cycle)));
    }

    #[test]
    fn type_mismatch_is_rejected_for_id_connects() {
        let mut builder = PipelineBuilder::new();
        let _source = builder.source_from_iter("numbers", vec![1i32]);
        let _sink = builder.sink_fn("words", |_x: String| Ok(()));
        builder.connect_ids("numbers", "words");
        let report = builder.try_build().err().unwrap();
        assert!(report
            .errors
            .iter()
            .any(|error| matches!(error, ValidationError::TypeMismatch { .. })));
    }

    #[test]
    fn join_requires_fan_in() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1]);
        let join = builder.add_join::<i32>("merge");
        let sink = builder.sink_fn("out", |_x: i32| Ok(()));
        builder.connect(&source, &join);
        builder.connect(&join, &sink);
        let report = builder.try_build().err().unwrap();
        assert!(report
            .errors
            .iter()
            .any(|error| matches!(error, ValidationError::JoinWithoutFanIn(_))));
    }

    #[test]
    fn building_twice_yields_structurally_equal_graphs() {
        let first = smoke_builder().build().unwrap();
        let second = smoke_builder().build().unwrap();
        assert_eq!(first.node_ids(), second.node_ids());
        assert_eq!(first.edges(), second.edges());
    }
}

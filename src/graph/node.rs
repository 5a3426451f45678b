//! Node definitions and the node implementer contract.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::context::PipelineContext;
use crate::engine::resilience::{CircuitBreakerOptions, RetryOptions};
use crate::pipe::{self, AnyItem, AnyPipe, InMemoryPipe, PipeRef};
use crate::{PipelineError, Result};

/// Runtime type metadata for edge payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadType {
    id: TypeId,
    name: &'static str,
}

impl PayloadType {
    /// Metadata for the payload type `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The `TypeId` of the payload.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The kind of a node placement in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Produces a pipe of elements
    Source,
    /// Maps elements one at a time
    Transform,
    /// Consumes a pipe to completion
    Sink,
    /// A sink attached to an edge without consuming it
    Tap,
    /// Explicit fan-out point with its own buffering options
    Branch,
    /// Fan-in point merging several inputs of a common type
    Join,
    /// Groups elements by size and timeout
    Batch,
    /// Flattens groups back into elements
    Unbatch,
}

/// Per-node execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// Consume the input element by element
    #[default]
    Sequential,
    /// Bounded-concurrency map preserving input order
    ParallelPerItem {
        /// Maximum in-flight elements; zero means one per CPU core
        degree: usize,
    },
    /// Buffer elements into groups before execution
    Batching {
        /// Maximum elements per group
        size: usize,
        /// Emit a partial group this long after its first element
        timeout: Duration,
    },
}

/// Per-node execution options, overriding pipeline-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Join buffer capacity per input
    pub merge_capacity: Option<usize>,
    /// Multicast buffer per subscriber; `None` falls back to the
    /// pipeline-wide branch capacity
    pub branch_buffer: Option<usize>,
    /// Replay buffer cap used when retries must re-consume the input
    pub replay_cap: Option<usize>,
    /// Retry policy override for this node
    pub retry: Option<RetryOptions>,
    /// Circuit breaker configuration for this node
    pub circuit_breaker: Option<CircuitBreakerOptions>,
}

/// Immutable record describing a node placement in the graph.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    /// Unique id within the graph, lowercase canonical
    pub id: String,
    /// Name for logs and diagnostics
    pub display_name: String,
    /// What the node is
    pub kind: NodeKind,
    /// Identifier used to look up a constructor in the node registry
    pub type_tag: String,
    /// Payload type the node consumes, if any
    pub input_type: Option<PayloadType>,
    /// Payload type the node produces, if any
    pub output_type: Option<PayloadType>,
    /// How the node executes its elements
    pub strategy: ExecutionStrategy,
    /// Tag of the error handler to resolve through the handler factory
    pub error_handler: Option<String>,
    /// Per-node option overrides
    pub options: NodeOptions,
}

/// A source node: asked once per run for its output pipe.
#[async_trait]
pub trait SourceNode: Send + Sync {
    /// Element type the source produces
    type Out: Clone + Send + Sync + 'static;

    /// Produce the lazy output pipe. Must be cancellation-aware.
    async fn initialize(
        &self,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> anyhow::Result<PipeRef<Self::Out>>;
}

/// A transform node: maps one element to one element.
///
/// Implementations must be stateless or thread-safe when run under a
/// parallel strategy.
#[async_trait]
pub trait TransformNode: Send + Sync {
    /// Element type consumed
    type In: Clone + Send + Sync + 'static;
    /// Element type produced
    type Out: Clone + Send + Sync + 'static;

    /// Map a single element.
    async fn execute_item(
        &self,
        item: Self::In,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> anyhow::Result<Self::Out>;
}

/// A sink node: consumes its input pipe to completion or cancellation.
#[async_trait]
pub trait SinkNode: Send + Sync {
    /// Element type consumed
    type In: Clone + Send + Sync + 'static;

    /// Consume the pipe.
    async fn execute(
        &self,
        input: PipeRef<Self::In>,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Type-erased source, as the executor drives it.
#[async_trait]
pub trait AnySourceNode: Send + Sync {
    /// Produce the erased output pipe.
    async fn initialize(
        &self,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<AnyPipe>;
}

/// Type-erased transform, as the executor drives it.
#[async_trait]
pub trait AnyTransformNode: Send + Sync {
    /// Map a single erased element.
    async fn execute_item(
        &self,
        item: AnyItem,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<AnyItem>;
}

/// Type-erased sink, as the executor drives it.
///
/// A sink may accept several input types; the executor selects the variant
/// matching the inbound edge's payload type at wiring time.
#[async_trait]
pub trait AnySinkNode: Send + Sync {
    /// The input types this sink can consume.
    fn accepted_input(&self) -> Vec<PayloadType>;

    /// Consume the erased pipe whose elements are of `payload`.
    async fn execute(
        &self,
        payload: PayloadType,
        input: AnyPipe,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<()>;
}

/// A structural stream operation (join identity, batch, unbatch) that maps
/// an input pipe to an output pipe without per-element node logic.
pub trait PipeOp: Send + Sync {
    /// Apply the operation to the erased input pipe.
    fn apply(&self, input: AnyPipe) -> AnyPipe;
}

/// An instantiated node, ready for the executor.
#[derive(Clone)]
pub enum NodeInstance {
    /// A source implementation
    Source(Arc<dyn AnySourceNode>),
    /// A transform implementation
    Transform(Arc<dyn AnyTransformNode>),
    /// A sink implementation
    Sink(Arc<dyn AnySinkNode>),
    /// A structural stream operation
    PipeOp(Arc<dyn PipeOp>),
}

impl NodeInstance {
    /// Wrap a typed source.
    pub fn source<S: SourceNode + 'static>(source: S) -> Self {
        NodeInstance::Source(Arc::new(SourceAdapter(source)))
    }

    /// Wrap a typed transform.
    pub fn transform<T: TransformNode + 'static>(transform: T) -> Self {
        NodeInstance::Transform(Arc::new(TransformAdapter(transform)))
    }

    /// Wrap a typed sink.
    pub fn sink<S: SinkNode + 'static>(sink: S) -> Self {
        NodeInstance::Sink(Arc::new(SinkAdapter(sink)))
    }

    /// Wrap a polyvariant sink.
    pub fn multi_sink(sink: MultiSink) -> Self {
        NodeInstance::Sink(Arc::new(sink))
    }

    pub(crate) fn pipe_op(op: Arc<dyn PipeOp>) -> Self {
        NodeInstance::PipeOp(op)
    }

    /// Short name of the instance variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeInstance::Source(_) => "source",
            NodeInstance::Transform(_) => "transform",
            NodeInstance::Sink(_) => "sink",
            NodeInstance::PipeOp(_) => "pipe-op",
        }
    }
}

struct SourceAdapter<S>(S);

#[async_trait]
impl<S> AnySourceNode for SourceAdapter<S>
where
    S: SourceNode + 'static,
{
    async fn initialize(
        &self,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<AnyPipe> {
        let typed = self
            .0
            .initialize(ctx, token)
            .await
            .map_err(PipelineError::from_node)?;
        Ok(pipe::erase(typed))
    }
}

struct TransformAdapter<T>(T);

#[async_trait]
impl<T> AnyTransformNode for TransformAdapter<T>
where
    T: TransformNode + 'static,
{
    async fn execute_item(
        &self,
        item: AnyItem,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<AnyItem> {
        let input = pipe::downcast_item::<T::In>(std::any::type_name::<T>(), item)?;
        let output = self
            .0
            .execute_item(input, ctx, token)
            .await
            .map_err(PipelineError::from_node)?;
        Ok(pipe::erase_item(output))
    }
}

struct SinkAdapter<S>(S);

#[async_trait]
impl<S> AnySinkNode for SinkAdapter<S>
where
    S: SinkNode + 'static,
{
    fn accepted_input(&self) -> Vec<PayloadType> {
        vec![PayloadType::of::<S::In>()]
    }

    async fn execute(
        &self,
        _payload: PayloadType,
        input: AnyPipe,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<()> {
        let typed = pipe::downcast::<S::In>(input);
        self.0
            .execute(typed, ctx, token)
            .await
            .map_err(PipelineError::from_node)
    }
}

/// A sink accepting several input types, one typed variant per payload type.
///
/// The executor selects the variant whose type equals the inbound edge's
/// payload type when the graph is wired, not per element.
#[derive(Default)]
pub struct MultiSink {
    variants: Vec<(PayloadType, Arc<dyn AnySinkNode>)>,
}

impl MultiSink {
    /// An empty polyvariant sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed variant. The last variant registered for a type wins.
    pub fn with_variant<S: SinkNode + 'static>(mut self, sink: S) -> Self {
        self.variants
            .push((PayloadType::of::<S::In>(), Arc::new(SinkAdapter(sink))));
        self
    }
}

#[async_trait]
impl AnySinkNode for MultiSink {
    fn accepted_input(&self) -> Vec<PayloadType> {
        self.variants.iter().map(|(ty, _)| *ty).collect()
    }

    async fn execute(
        &self,
        payload: PayloadType,
        input: AnyPipe,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> Result<()> {
        let variant = self
            .variants
            .iter()
            .rev()
            .find(|(ty, _)| *ty == payload)
            .map(|(_, sink)| Arc::clone(sink))
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "sink has no variant accepting '{}'",
                    payload
                ))
            })?;
        variant.execute(payload, input, ctx, token).await
    }
}

pub(crate) struct IdentityOp;

impl PipeOp for IdentityOp {
    fn apply(&self, input: AnyPipe) -> AnyPipe {
        input
    }
}

pub(crate) struct BatchOp<T> {
    pub size: usize,
    pub timeout: Duration,
    pub _marker: PhantomData<fn() -> T>,
}

impl<T> PipeOp for BatchOp<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn apply(&self, input: AnyPipe) -> AnyPipe {
        pipe::erase(pipe::batch(
            pipe::downcast::<T>(input),
            self.size,
            self.timeout,
        ))
    }
}

pub(crate) struct UnbatchOp<T> {
    pub _marker: PhantomData<fn() -> T>,
}

impl<T> PipeOp for UnbatchOp<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn apply(&self, input: AnyPipe) -> AnyPipe {
        pipe::erase(pipe::unbatch(pipe::downcast::<Vec<T>>(input)))
    }
}

/// Lambda source yielding a fixed collection through an in-memory pipe.
pub struct IterSource<T> {
    name: String,
    items: Vec<T>,
}

impl<T> IterSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Source named `name` yielding `items` in order.
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }
}

#[async_trait]
impl<T> SourceNode for IterSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Out = T;

    async fn initialize(
        &self,
        _ctx: &PipelineContext,
        _token: &CancellationToken,
    ) -> anyhow::Result<PipeRef<T>> {
        Ok(Arc::new(InMemoryPipe::new(
            self.name.clone(),
            self.items.clone(),
        )))
    }
}

/// Lambda transform wrapping a synchronous closure.
pub struct FnTransform<I, O, F> {
    f: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnTransform<I, O, F>
where
    F: Fn(I) -> anyhow::Result<O> + Send + Sync,
{
    /// Wrap `f` as a transform node.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> TransformNode for FnTransform<I, O, F>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    F: Fn(I) -> anyhow::Result<O> + Send + Sync,
{
    type In = I;
    type Out = O;

    async fn execute_item(
        &self,
        item: I,
        _ctx: &PipelineContext,
        _token: &CancellationToken,
    ) -> anyhow::Result<O> {
        (self.f)(item)
    }
}

/// Lambda sink invoking a synchronous closure per element.
pub struct FnSink<I, F> {
    f: F,
    _marker: PhantomData<fn(I)>,
}

impl<I, F> FnSink<I, F>
where
    F: Fn(I) -> anyhow::Result<()> + Send + Sync,
{
    /// Wrap `f` as a sink node.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<I, F> SinkNode for FnSink<I, F>
where
    I: Clone + Send + Sync + 'static,
    F: Fn(I) -> anyhow::Result<()> + Send + Sync,
{
    type In = I;

    async fn execute(
        &self,
        input: PipeRef<I>,
        _ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut stream = input.open(token.clone())?;
        while let Some(item) = stream.next().await {
            (self.f)(item?)?;
        }
        Ok(())
    }
}

/// Sink that collects every element into a shared vector, mainly for tests
/// and demos.
pub struct CollectingSink<T> {
    collected: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectingSink<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A new empty collector.
    pub fn new() -> Self {
        Self {
            collected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected elements.
    pub fn handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.collected)
    }
}

impl<T> Default for CollectingSink<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> SinkNode for CollectingSink<T>
where
    T: Clone + Send + Sync + 'static,
{
    type In = T;

    async fn execute(
        &self,
        input: PipeRef<T>,
        _ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut stream = input.open(token.clone())?;
        while let Some(item) = stream.next().await {
            self.collected.lock().push(item?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_types_compare_by_type() {
        assert_eq!(PayloadType::of::<i32>(), PayloadType::of::<i32>());
        assert_ne!(PayloadType::of::<i32>(), PayloadType::of::<i64>());
    }

    #[tokio::test]
    async fn erased_transform_round_trips_items() {
        let instance = NodeInstance::transform(FnTransform::new(|x: i32| Ok(x + 1)));
        let NodeInstance::Transform(transform) = instance else {
            panic!("expected transform instance");
        };
        let ctx = PipelineContext::default();
        let token = CancellationToken::new();
        let out = transform
            .execute_item(pipe::erase_item(41i32), &ctx, &token)
            .await
            .unwrap();
        assert_eq!(pipe::downcast_item::<i32>("test", out).unwrap(), 42);
    }

    #[tokio::test]
    async fn multi_sink_selects_variant_by_payload_type() {
        let ints = CollectingSink::<i32>::new();
        let int_handle = ints.handle();
        let strings = CollectingSink::<String>::new();

        let sink = MultiSink::new().with_variant(ints).with_variant(strings);
        assert_eq!(sink.accepted_input().len(), 2);

        let input = pipe::erase::<i32>(Arc::new(InMemoryPipe::new("numbers", vec![1, 2])));
        let ctx = PipelineContext::default();
        let token = CancellationToken::new();
        sink.execute(PayloadType::of::<i32>(), input, &ctx, &token)
            .await
            .unwrap();
        assert_eq!(int_handle.lock().clone(), vec![1, 2]);
    }
}

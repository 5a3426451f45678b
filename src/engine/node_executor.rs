//! Per-node execution: strategies, the per-item decision loop, and wiring of
//! node outputs into counting and multicast pipes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::StreamExt;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::PipelineContext;
use super::coordinator::ExecutionPlan;
use super::error_handler::{DeadLetterSink, ErrorDecision, ErrorHandler, ErrorHandlerFactory};
use super::resilience::{
    execute_with_retries, CircuitBreaker, CircuitBreakerManager, RetryPolicy,
};
use crate::graph::{
    AnySinkNode, AnyTransformNode, EdgeDef, ExecutionStrategy, NodeDefinition, NodeInstance,
    PayloadType, PipelineGraph,
};
use crate::pipe::{
    self, AnyItem, AnyPipe, BranchBuffer, CappedReplayablePipe, CountingPipe, DataPipe,
    JoinOptions, MulticastPipe, PipeKind, PipeStream,
};
use crate::{PipelineError, Result};

/// Everything the per-item loop needs about one transform node.
pub(crate) struct NodeRuntime {
    node_id: String,
    strategy: ExecutionStrategy,
    transform: Arc<dyn AnyTransformNode>,
    handler: Option<Arc<ErrorHandler>>,
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ctx: Arc<PipelineContext>,
}

/// Lazy output pipe of a transform node: opening it opens the input and
/// applies the node's execution strategy element by element.
pub(crate) struct TransformPipe {
    name: String,
    input: AnyPipe,
    runtime: Arc<NodeRuntime>,
}

impl DataPipe<AnyItem> for TransformPipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PipeKind {
        PipeKind::Streaming
    }

    fn replayable(&self) -> bool {
        self.input.replayable()
    }

    fn open(&self, token: CancellationToken) -> Result<PipeStream<AnyItem>> {
        let input = self.input.open(token.clone())?;
        let runtime = Arc::clone(&self.runtime);
        let strategy = runtime.strategy.clone();

        let mapped: PipeStream<Option<AnyItem>> = match strategy {
            ExecutionStrategy::Sequential => input
                .then(move |item| run_item(item, Arc::clone(&runtime), token.clone()))
                .boxed(),
            ExecutionStrategy::ParallelPerItem { degree } => {
                let degree = if degree == 0 { num_cpus::get() } else { degree };
                input
                    .map(move |item| run_item(item, Arc::clone(&runtime), token.clone()))
                    .buffered(degree.max(1))
                    .boxed()
            }
            ExecutionStrategy::Batching { .. } => {
                return Err(PipelineError::Configuration(format!(
                    "node '{}': the batching strategy is expressed through batch nodes",
                    runtime.node_id
                )))
            }
        };

        let stream = mapped.filter_map(|result| async move {
            match result {
                Ok(Some(item)) => Some(Ok(item)),
                Ok(None) => None,
                Err(err) => Some(Err(err)),
            }
        });
        Ok(pipe::fuse_on_error(stream.boxed()))
    }
}

/// Execute one element under the node's resilience stack, then let the error
/// handler decide what to do with a failure.
///
/// Returns `Ok(None)` when the item was skipped or dead-lettered. The rule
/// retry counter is scoped to the item: it resets when the handler returns
/// any non-retry decision.
async fn run_item(
    upstream: Result<AnyItem>,
    runtime: Arc<NodeRuntime>,
    token: CancellationToken,
) -> Result<Option<AnyItem>> {
    // Errors produced upstream pass through untouched; this node's handler
    // only governs its own item failures.
    let item = upstream?;

    let mut rule_attempt: u32 = 1;
    loop {
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let attempt_result = execute_with_retries(
            &runtime.node_id,
            &runtime.policy,
            runtime.breaker.as_ref(),
            &token,
            || {
                let transform = Arc::clone(&runtime.transform);
                let ctx = Arc::clone(&runtime.ctx);
                let item = item.clone();
                let token = token.clone();
                async move { transform.execute_item(item, &ctx, &token).await }
            },
        )
        .await;

        let err = match attempt_result {
            Ok(output) => return Ok(Some(output)),
            Err(err) if err.is_cancelled() => return Err(PipelineError::Cancelled),
            Err(err) => err,
        };

        let decision = runtime
            .handler
            .as_ref()
            .and_then(|handler| handler.decide(&err))
            .unwrap_or(ErrorDecision::Fail);

        match decision {
            ErrorDecision::Fail => {
                return Err(PipelineError::NodeExecution {
                    node_id: runtime.node_id.clone(),
                    source: Box::new(err),
                });
            }
            ErrorDecision::Skip => {
                debug!(node = %runtime.node_id, error = %err, "skipping failed item");
                return Ok(None);
            }
            ErrorDecision::DeadLetter => {
                send_dead_letter(&runtime, item.clone(), &err).await;
                return Ok(None);
            }
            ErrorDecision::Retry { max_retries } => {
                if rule_attempt >= max_retries {
                    debug!(
                        node = %runtime.node_id,
                        attempts = rule_attempt,
                        "handler retries exhausted, dead-lettering item"
                    );
                    send_dead_letter(&runtime, item.clone(), &err).await;
                    return Ok(None);
                }
                rule_attempt += 1;
                let delay = runtime.policy.delay(rule_attempt);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn send_dead_letter(runtime: &NodeRuntime, item: AnyItem, err: &PipelineError) {
    match &runtime.dead_letter {
        Some(sink) => sink.handle(&runtime.node_id, item, err).await,
        None => {
            warn!(
                node = %runtime.node_id,
                error = %err,
                "no dead-letter sink configured, dropping item"
            );
        }
    }
}

/// A prepared sink execution, spawned by the runner.
pub(crate) struct SinkTask {
    pub node_id: String,
    pub future: BoxFuture<'static, Result<()>>,
}

/// Wires a planned graph into pipes and prepared sink executions.
pub(crate) struct NodeExecutor {
    pub ctx: Arc<PipelineContext>,
    pub manager: Arc<CircuitBreakerManager>,
    pub handler_factory: Arc<ErrorHandlerFactory>,
}

impl NodeExecutor {
    /// Walk the plan in topological order: initialize sources, compose
    /// transform pipes lazily, and prepare one task per sink. Node outputs
    /// are wrapped in counting pipes and, when fanned out, multicast pipes.
    pub async fn wire(
        &self,
        graph: &PipelineGraph,
        plan: &ExecutionPlan,
        token: CancellationToken,
    ) -> Result<Vec<SinkTask>> {
        let mut edge_pipes: HashMap<(String, String), AnyPipe> = HashMap::new();
        let mut sinks = Vec::new();

        for node_id in &plan.order {
            let def = graph.node(node_id).ok_or_else(|| {
                PipelineError::Configuration(format!("node '{}' missing from graph", node_id))
            })?;
            let inputs = plan.inputs.get(node_id).cloned().unwrap_or_default();
            let instance = plan.instances.get(node_id).ok_or_else(|| {
                PipelineError::Configuration(format!("node '{}' was not instantiated", node_id))
            })?;

            let policy = self.policy_for(def)?;
            let breaker = self.breaker_for(def)?;

            match instance {
                NodeInstance::Source(source) => {
                    let source = Arc::clone(source);
                    let ctx = Arc::clone(&self.ctx);
                    let pipe = execute_with_retries(
                        &def.id,
                        &policy,
                        breaker.as_ref(),
                        &token,
                        || {
                            let source = Arc::clone(&source);
                            let ctx = Arc::clone(&ctx);
                            let token = token.clone();
                            async move { source.initialize(&ctx, &token).await }
                        },
                    )
                    .await
                    .map_err(|err| classify_node_error(&def.id, err))?;
                    self.publish(graph, def, pipe, &mut edge_pipes)?;
                }
                NodeInstance::PipeOp(op) => {
                    let input = self.merged_input(def, &inputs, &edge_pipes, graph)?;
                    self.publish(graph, def, op.apply(input), &mut edge_pipes)?;
                }
                NodeInstance::Transform(transform) => {
                    let input = self.merged_input(def, &inputs, &edge_pipes, graph)?;
                    let runtime = Arc::new(NodeRuntime {
                        node_id: def.id.clone(),
                        strategy: def.strategy.clone(),
                        transform: Arc::clone(transform),
                        handler: self.handler_for(def, graph),
                        policy,
                        breaker,
                        dead_letter: self.ctx.options().dead_letter.clone(),
                        ctx: Arc::clone(&self.ctx),
                    });
                    let pipe: AnyPipe = Arc::new(TransformPipe {
                        name: def.id.clone(),
                        input,
                        runtime,
                    });
                    self.publish(graph, def, pipe, &mut edge_pipes)?;
                }
                NodeInstance::Sink(sink) => {
                    let input = self.merged_input(def, &inputs, &edge_pipes, graph)?;
                    // Sinks only retry whole-pipe consumption when the node
                    // opts in; re-consumption needs a replayable input, which
                    // is worth buffering only deliberately.
                    let policy = match &def.options.retry {
                        Some(options) => {
                            options.validate()?;
                            RetryPolicy::new(options.clone())
                        }
                        None => RetryPolicy::new(super::resilience::RetryOptions::no_retries()),
                    };
                    let payload = def
                        .input_type
                        .or_else(|| inputs.first().map(|edge| edge.payload))
                        .ok_or_else(|| {
                            PipelineError::Configuration(format!(
                                "sink '{}' has no input type",
                                def.id
                            ))
                        })?;

                    // Node-scope retries re-consume the input, which needs a
                    // replayable pipe behind them.
                    let input = if policy.options().max_attempts > 1 && !input.replayable() {
                        let cap = def
                            .options
                            .replay_cap
                            .unwrap_or(self.ctx.options().replay_cap);
                        Arc::new(CappedReplayablePipe::new(input, cap)) as AnyPipe
                    } else {
                        input
                    };

                    let future = run_sink(
                        def.id.clone(),
                        Arc::clone(sink),
                        payload,
                        input,
                        Arc::clone(&self.ctx),
                        policy,
                        breaker,
                        token.clone(),
                    )
                    .boxed();
                    sinks.push(SinkTask {
                        node_id: def.id.clone(),
                        future,
                    });
                }
            }
        }
        Ok(sinks)
    }

    fn policy_for(&self, def: &NodeDefinition) -> Result<RetryPolicy> {
        let options = def
            .options
            .retry
            .clone()
            .unwrap_or_else(|| self.ctx.options().retry.clone());
        options.validate()?;
        let mut policy = RetryPolicy::new(options);
        if let Some(classifier) = &self.ctx.options().retry_classifier {
            policy = policy.with_classifier(Arc::clone(classifier));
        }
        Ok(policy)
    }

    fn breaker_for(&self, def: &NodeDefinition) -> Result<Option<Arc<CircuitBreaker>>> {
        let options = def
            .options
            .circuit_breaker
            .or(self.ctx.options().circuit_breaker);
        match options {
            Some(options) => Ok(Some(self.manager.get_or_create(&def.id, &options)?)),
            None => Ok(None),
        }
    }

    fn handler_for(
        &self,
        def: &NodeDefinition,
        graph: &PipelineGraph,
    ) -> Option<Arc<ErrorHandler>> {
        if let Some(handler) = graph.error_handler(&def.id) {
            return Some(handler);
        }
        let tag = def.error_handler.as_deref()?;
        self.handler_factory.create_handler(tag).map(Arc::new)
    }

    fn merged_input(
        &self,
        def: &NodeDefinition,
        inputs: &[EdgeDef],
        edge_pipes: &HashMap<(String, String), AnyPipe>,
        graph: &PipelineGraph,
    ) -> Result<AnyPipe> {
        let mut pipes = Vec::with_capacity(inputs.len());
        for edge in inputs {
            let pipe = edge_pipes
                .get(&(edge.source.clone(), edge.target.clone()))
                .cloned()
                .ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "edge {} -> {} has no wired pipe",
                        edge.source, edge.target
                    ))
                })?;
            pipes.push(pipe);
        }
        match pipes.len() {
            0 => Err(PipelineError::Configuration(format!(
                "node '{}' has no inbound edges",
                def.id
            ))),
            1 => Ok(pipes.pop().unwrap_or_else(|| unreachable!())),
            _ => {
                let capacity = self.merge_capacity_for(def, graph);
                Ok(pipe::join(
                    format!("{}~join", def.id),
                    pipes,
                    JoinOptions { capacity },
                ))
            }
        }
    }

    fn merge_capacity_for(&self, def: &NodeDefinition, graph: &PipelineGraph) -> usize {
        def.options
            .merge_capacity
            .or_else(|| {
                graph
                    .annotation(&format!("merge.capacity::{}", def.id))
                    .and_then(|value| value.as_u64())
                    .map(|value| value as usize)
            })
            .or_else(|| {
                graph
                    .annotation("global::merge.capacity")
                    .and_then(|value| value.as_u64())
                    .map(|value| value as usize)
            })
            .unwrap_or(self.ctx.options().merge_capacity)
    }

    fn branch_buffer_for(&self, def: &NodeDefinition, graph: &PipelineGraph) -> usize {
        def.options
            .branch_buffer
            .or_else(|| {
                graph
                    .annotation(&format!("branch::{}", def.id))
                    .and_then(|value| value.as_u64())
                    .map(|value| value as usize)
            })
            .or_else(|| {
                graph
                    .annotation("global::branch.capacity")
                    .and_then(|value| value.as_u64())
                    .map(|value| value as usize)
            })
            .unwrap_or(self.ctx.options().branch_capacity)
    }

    /// Wrap a node's output in a counting pipe, fan it out through a
    /// multicast pipe when several edges leave the node, and record the
    /// resulting pipes per outbound edge.
    fn publish(
        &self,
        graph: &PipelineGraph,
        def: &NodeDefinition,
        pipe: AnyPipe,
        edge_pipes: &mut HashMap<(String, String), AnyPipe>,
    ) -> Result<()> {
        let counter = self.ctx.register_counter(&def.id);
        let ctx = Arc::clone(&self.ctx);
        let counted: AnyPipe = Arc::new(
            CountingPipe::new(pipe, counter)
                .with_exhaustion_observer(Arc::new(move |err| ctx.record_retry_exhausted(err))),
        );

        let out_edges = graph.outbound(&def.id);
        match out_edges.len() {
            0 => {}
            1 => {
                edge_pipes.insert(
                    (def.id.clone(), out_edges[0].target.clone()),
                    counted,
                );
            }
            fan_out => {
                let buffer = BranchBuffer::Bounded(self.branch_buffer_for(def, graph));
                let multicast = MulticastPipe::new(counted, fan_out, buffer);
                self.ctx.properties.insert_value(
                    format!("branch.metrics::{}", def.id),
                    multicast.metrics(),
                );
                for edge in out_edges {
                    let subscriber = multicast.subscribe()?;
                    edge_pipes.insert((def.id.clone(), edge.target.clone()), subscriber);
                }
            }
        }
        Ok(())
    }
}

/// Drive one sink to completion under its resilience stack.
#[allow(clippy::too_many_arguments)]
async fn run_sink(
    node_id: String,
    sink: Arc<dyn AnySinkNode>,
    payload: PayloadType,
    input: AnyPipe,
    ctx: Arc<PipelineContext>,
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    token: CancellationToken,
) -> Result<()> {
    if let Some(cause) = ctx.last_retry_exhausted() {
        warn!(node = %node_id, cause = %cause, "upstream retries exhausted, bypassing sink");
        // Open and drop the input so an upstream multicast pump sees this
        // subscriber detach instead of blocking on its full channel.
        drop(input.open(token.clone()));
        return Ok(());
    }

    let result = execute_with_retries(&node_id, &policy, breaker.as_ref(), &token, || {
        let sink = Arc::clone(&sink);
        let input = Arc::clone(&input);
        let ctx = Arc::clone(&ctx);
        let token = token.clone();
        async move { sink.execute(payload, input, &ctx, &token).await }
    })
    .await;

    result.map_err(|err| classify_node_error(&node_id, err))
}

/// Apply the error funnel for node-scope failures: cancellation and already
/// wrapped node failures pass unchanged, this node's own resilience outcomes
/// become node-execution failures, anything else is wrapped as a pipeline
/// execution failure naming the node.
fn classify_node_error(node_id: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Cancelled => PipelineError::Cancelled,
        err if err.is_cancelled() => PipelineError::Cancelled,
        err @ PipelineError::NodeExecution { .. } => err,
        err @ (PipelineError::RetryExhausted { .. } | PipelineError::CircuitOpen { .. }) => {
            PipelineError::NodeExecution {
                node_id: node_id.to_string(),
                source: Box::new(err),
            }
        }
        err => PipelineError::PipelineExecution {
            node_id: node_id.to_string(),
            source: Box::new(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::PipelineOptions;
    use crate::engine::resilience::{ManagerOptions, RetryOptions};
    use crate::graph::{FnTransform, NodeInstance};
    use crate::pipe::InMemoryPipe;

    fn runtime_for(
        transform: Arc<dyn AnyTransformNode>,
        handler: Option<ErrorHandler>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Arc<NodeRuntime> {
        let mut options = PipelineOptions::default();
        options.retry = RetryOptions::immediate(2);
        options.dead_letter = dead_letter.clone();
        Arc::new(NodeRuntime {
            node_id: "t".to_string(),
            strategy: ExecutionStrategy::Sequential,
            transform,
            handler: handler.map(Arc::new),
            policy: RetryPolicy::new(RetryOptions::immediate(2)),
            breaker: None,
            dead_letter,
            ctx: Arc::new(PipelineContext::with_options(options)),
        })
    }

    fn erased_fn_transform<F>(f: F) -> Arc<dyn AnyTransformNode>
    where
        F: Fn(i32) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        let NodeInstance::Transform(transform) = NodeInstance::transform(FnTransform::new(f))
        else {
            unreachable!()
        };
        transform
    }

    #[tokio::test]
    async fn transform_pipe_maps_items_in_order() {
        let runtime = runtime_for(erased_fn_transform(|x| Ok(x + 1)), None, None);
        let input: AnyPipe = pipe::erase::<i32>(Arc::new(InMemoryPipe::new("in", vec![1, 2, 3])));
        let pipe = TransformPipe {
            name: "t".to_string(),
            input,
            runtime,
        };

        let out: Vec<i32> = pipe
            .open(CancellationToken::new())
            .unwrap()
            .map(|item| pipe::downcast_item::<i32>("t", item.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_item_without_handler_fails_the_node() {
        let runtime = runtime_for(
            erased_fn_transform(|x| {
                if x == 2 {
                    anyhow::bail!("boom");
                }
                Ok(x)
            }),
            None,
            None,
        );
        let input: AnyPipe = pipe::erase::<i32>(Arc::new(InMemoryPipe::new("in", vec![1, 2, 3])));
        let pipe = TransformPipe {
            name: "t".to_string(),
            input,
            runtime,
        };

        let out: Vec<_> = pipe.open(CancellationToken::new()).unwrap().collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        match &out[1] {
            Err(PipelineError::NodeExecution { node_id, source }) => {
                assert_eq!(node_id, "t");
                assert!(source.is_retry_exhausted());
            }
            other => panic!("expected node execution failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn skip_rule_drops_failed_items() {
        let handler = ErrorHandler::builder().on_any().skip().build().unwrap();
        let runtime = runtime_for(
            erased_fn_transform(|x| {
                if x % 2 == 0 {
                    anyhow::bail!("even");
                }
                Ok(x)
            }),
            Some(handler),
            None,
        );
        let input: AnyPipe =
            pipe::erase::<i32>(Arc::new(InMemoryPipe::new("in", vec![1, 2, 3])));
        let pipe = TransformPipe {
            name: "t".to_string(),
            input,
            runtime,
        };

        let out: Vec<i32> = pipe
            .open(CancellationToken::new())
            .unwrap()
            .map(|item| pipe::downcast_item::<i32>("t", item.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![1, 3]);
    }

    #[tokio::test]
    async fn retry_rule_overflows_into_dead_letter() {
        use crate::engine::error_handler::InMemoryDeadLetterSink;

        let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
        let handler = ErrorHandler::builder().on_any().retry(2).build().unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_probe = Arc::clone(&calls);
        let runtime = runtime_for(
            erased_fn_transform(move |_x| {
                calls_probe.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("always fails")
            }),
            Some(handler),
            Some(dead_letter.clone() as Arc<dyn DeadLetterSink>),
        );
        let input: AnyPipe = pipe::erase::<i32>(Arc::new(InMemoryPipe::new("in", vec![7])));
        let pipe = TransformPipe {
            name: "t".to_string(),
            input,
            runtime,
        };

        let out: Vec<_> = pipe.open(CancellationToken::new()).unwrap().collect().await;
        assert!(out.is_empty());
        assert_eq!(dead_letter.len(), 1);
        // Two handler-level rounds, each with two policy-level attempts.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn parallel_strategy_preserves_order() {
        let mut runtime = runtime_for(erased_fn_transform(|x| Ok(x * 10)), None, None);
        Arc::get_mut(&mut runtime).unwrap().strategy =
            ExecutionStrategy::ParallelPerItem { degree: 4 };
        let input: AnyPipe =
            pipe::erase::<i32>(Arc::new(InMemoryPipe::new("in", (1..=20).collect())));
        let pipe = TransformPipe {
            name: "t".to_string(),
            input,
            runtime,
        };

        let out: Vec<i32> = pipe
            .open(CancellationToken::new())
            .unwrap()
            .map(|item| pipe::downcast_item::<i32>("t", item.unwrap()).unwrap())
            .collect()
            .await;
        assert_eq!(out, (1..=20).map(|x| x * 10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn wire_smoke_counts_and_delivers() {
        use crate::graph::PipelineBuilder;

        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1, 2, 3]);
        let double = builder.transform_fn("double", |x: i32| Ok(x + 1));
        let (sink, collector) = builder.collecting_sink::<i32>("collect");
        builder.connect(&source, &double);
        builder.connect(&double, &sink);
        let graph = builder.build().unwrap();

        let plan = crate::engine::coordinator::ExecutionCoordinator::plan(&graph).unwrap();
        let ctx = Arc::new(PipelineContext::new());
        let executor = NodeExecutor {
            ctx: Arc::clone(&ctx),
            manager: CircuitBreakerManager::new(ManagerOptions {
                enable_cleanup: false,
                ..Default::default()
            }),
            handler_factory: Arc::new(ErrorHandlerFactory::new()),
        };

        let token = CancellationToken::new();
        let sinks = executor.wire(&graph, &plan, token).await.unwrap();
        for task in sinks {
            task.future.await.unwrap();
        }
        assert_eq!(collector.items(), vec![2, 3, 4]);
        assert_eq!(ctx.counter("numbers"), Some(3));
        assert_eq!(ctx.counter("double"), Some(3));
    }
}

//! Top-level orchestration of one pipeline run.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::context::{PipelineContext, GLOBAL_PROPERTY_PREFIX};
use super::coordinator::ExecutionCoordinator;
use super::error_handler::ErrorHandlerFactory;
use super::node_executor::NodeExecutor;
use super::resilience::{CircuitBreakerManager, ManagerOptions};
use crate::graph::PipelineGraph;
use crate::{PipelineError, Result};

/// Executes validated pipeline graphs.
///
/// The runner owns the circuit breaker manager and the error handler
/// factory; both are scoped to the runner instance and torn down with it.
pub struct PipelineRunner {
    manager: Arc<CircuitBreakerManager>,
    handler_factory: Arc<ErrorHandlerFactory>,
}

impl PipelineRunner {
    /// A runner with default manager options and an empty handler factory.
    pub fn new() -> Self {
        Self {
            manager: CircuitBreakerManager::new(ManagerOptions::default()),
            handler_factory: Arc::new(ErrorHandlerFactory::new()),
        }
    }

    /// A runner with specific circuit breaker manager options.
    pub fn with_manager_options(options: ManagerOptions) -> Self {
        Self {
            manager: CircuitBreakerManager::new(options),
            handler_factory: Arc::new(ErrorHandlerFactory::new()),
        }
    }

    /// Use a populated error handler factory.
    pub fn with_handler_factory(mut self, factory: ErrorHandlerFactory) -> Self {
        self.handler_factory = Arc::new(factory);
        self
    }

    /// The runner's circuit breaker manager.
    pub fn breaker_manager(&self) -> &Arc<CircuitBreakerManager> {
        &self.manager
    }

    /// Run the graph to completion under the given context.
    ///
    /// Errors funnel as: node failures pass through as
    /// [`PipelineError::NodeExecution`], cancellation surfaces unchanged as
    /// [`PipelineError::Cancelled`], and anything else arrives wrapped in
    /// [`PipelineError::PipelineExecution`]. Disposables run on every exit
    /// path.
    #[instrument(skip(self, graph, ctx), fields(run_id))]
    pub async fn run(&self, graph: &PipelineGraph, ctx: PipelineContext) -> Result<()> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        info!(nodes = graph.node_count(), "starting pipeline run");

        // Global annotations become context properties for the duration of
        // the run.
        for (key, value) in graph.annotations() {
            if let Some(suffix) = key.strip_prefix("global::") {
                ctx.properties
                    .insert(format!("{}{}", GLOBAL_PROPERTY_PREFIX, suffix), value.clone());
            }
        }
        ctx.add_disposables(graph.take_disposables());

        let ctx = Arc::new(ctx);
        let result = self.execute(graph, &ctx).await;
        ctx.dispose();

        match &result {
            Ok(()) => info!("pipeline run completed"),
            Err(PipelineError::Cancelled) => warn!("pipeline run cancelled"),
            Err(err) => error!(error = %err, "pipeline run failed"),
        }
        result
    }

    async fn execute(&self, graph: &PipelineGraph, ctx: &Arc<PipelineContext>) -> Result<()> {
        let plan = ExecutionCoordinator::plan(graph)?;

        // A child token lets the runner stop in-flight nodes on the first
        // failure without cancelling the caller's token.
        let run_token = ctx.token().child_token();

        let executor = NodeExecutor {
            ctx: Arc::clone(ctx),
            manager: Arc::clone(&self.manager),
            handler_factory: Arc::clone(&self.handler_factory),
        };
        let sinks = executor.wire(graph, &plan, run_token.clone()).await?;

        let mut tasks = JoinSet::new();
        for sink in sinks {
            let node_id = sink.node_id;
            let future = sink.future;
            tasks.spawn(async move {
                let result = future.await;
                (node_id, result)
            });
        }

        let mut first_error: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node_id, Ok(()))) => {
                    debug!(node = %node_id, "sink completed");
                }
                Ok((node_id, Err(err))) => {
                    if first_error.is_none() {
                        run_token.cancel();
                        first_error = Some(err);
                    } else if !err.is_cancelled() {
                        debug!(node = %node_id, error = %err, "secondary sink failure");
                    }
                }
                Err(join_err) => {
                    let err = PipelineError::Configuration(format!(
                        "sink task failed to complete: {}",
                        join_err
                    ));
                    if first_error.is_none() {
                        run_token.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            None => {
                if ctx.token().is_cancelled() {
                    Err(PipelineError::Cancelled)
                } else {
                    Ok(())
                }
            }
            Some(err) if err.is_cancelled() => Err(PipelineError::Cancelled),
            Some(err) => Err(err),
        }
    }

    /// Tear down runner-scoped state: stops the breaker cleanup task and
    /// drops all tracked breakers.
    pub fn teardown(&self) {
        self.manager.teardown();
    }
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineBuilder;

    #[tokio::test]
    async fn runs_a_linear_pipeline_to_completion() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1, 2, 3]);
        let double = builder.transform_fn("double", |x: i32| Ok(x * 2));
        let (sink, collector) = builder.collecting_sink::<i32>("collect");
        builder.connect(&source, &double);
        builder.connect(&double, &sink);
        let graph = builder.build().unwrap();

        let runner = PipelineRunner::new();
        runner.run(&graph, PipelineContext::new()).await.unwrap();
        assert_eq!(collector.items(), vec![2, 4, 6]);
        runner.teardown();
    }

    #[tokio::test]
    async fn global_annotations_become_properties() {
        use crate::graph::SinkNode;
        use crate::pipe::PipeRef;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicU64, Ordering};
        use tokio_util::sync::CancellationToken;

        struct PropertyProbe {
            seen: Arc<AtomicU64>,
        }

        #[async_trait]
        impl SinkNode for PropertyProbe {
            type In = i32;
            async fn execute(
                &self,
                input: PipeRef<i32>,
                ctx: &PipelineContext,
                token: &CancellationToken,
            ) -> anyhow::Result<()> {
                use futures::StreamExt;
                let mut stream = input.open(token.clone())?;
                while let Some(item) = stream.next().await {
                    item?;
                }
                if let Some(capacity) = ctx
                    .properties
                    .get_cloned::<serde_json::Value>("flowgraph.global.merge.capacity")
                {
                    self.seen.store(capacity.as_u64().unwrap_or(0), Ordering::SeqCst);
                }
                Ok(())
            }
        }

        let seen = Arc::new(AtomicU64::new(0));
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("numbers", vec![1]);
        let sink = builder.add_sink_instance(
            "probe",
            PropertyProbe {
                seen: Arc::clone(&seen),
            },
        );
        builder.connect(&source, &sink);
        builder.global_merge_capacity(7);
        let graph = builder.build().unwrap();

        PipelineRunner::new()
            .run(&graph, PipelineContext::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}

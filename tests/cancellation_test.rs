//! Cooperative cancellation through whole pipeline runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowgraph::engine::{PipelineContext, PipelineRunner};
use flowgraph::graph::{PipelineBuilder, SourceNode};
use flowgraph::pipe::{PipeRef, StreamingPipe};
use flowgraph::PipelineError;
use futures::stream;
use tokio_util::sync::CancellationToken;

struct EndlessSource;

#[async_trait]
impl SourceNode for EndlessSource {
    type Out = u64;

    async fn initialize(
        &self,
        _ctx: &PipelineContext,
        _token: &CancellationToken,
    ) -> anyhow::Result<PipeRef<u64>> {
        let endless = stream::unfold(0u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Some((n, n + 1))
        });
        Ok(Arc::new(StreamingPipe::from_values("endless", endless)))
    }
}

/// Cancelling the root token stops an endless run promptly and surfaces as
/// a plain cancellation, never wrapped in an execution failure.
#[tokio::test]
async fn cancelling_the_root_token_stops_the_run() {
    let mut builder = PipelineBuilder::new();
    let source = builder.add_source_instance("endless", EndlessSource);
    let bump = builder.transform_fn("bump", |x: u64| Ok(x + 1));
    let (sink, collector) = builder.collecting_sink::<u64>("collect");
    builder.connect(&source, &bump);
    builder.connect(&bump, &sink);
    let graph = builder.build().unwrap();

    let token = CancellationToken::new();
    let ctx = PipelineContext::new().with_token(token.clone());

    let cancel_token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_token.cancel();
    });

    let started = Instant::now();
    let result = PipelineRunner::new().run(&graph, ctx).await;
    let elapsed = started.elapsed();

    match result {
        Err(PipelineError::Cancelled) => {}
        other => panic!("expected plain cancellation, got {other:?}"),
    }
    assert!(
        elapsed < Duration::from_secs(2),
        "cancellation took {elapsed:?}"
    );
    // The sink observed some prefix of the stream before the cut.
    let items = collector.items();
    assert_eq!(items, (1..=items.len() as u64).collect::<Vec<_>>());
}

/// Disposables still run when a run is cancelled.
#[tokio::test]
async fn disposables_run_on_cancelled_exit() {
    use flowgraph::engine::Disposable;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Probe(Arc<AtomicBool>);
    impl Disposable for Probe {
        fn dispose(&mut self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let disposed = Arc::new(AtomicBool::new(false));

    let mut builder = PipelineBuilder::new();
    let source = builder.add_source_instance("endless", EndlessSource);
    let (sink, _collector) = builder.collecting_sink::<u64>("collect");
    builder.connect(&source, &sink);
    builder.register_disposable(Box::new(Probe(Arc::clone(&disposed))));
    let graph = builder.build().unwrap();

    let token = CancellationToken::new();
    let ctx = PipelineContext::new().with_token(token.clone());
    let cancel_token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_token.cancel();
    });

    let result = PipelineRunner::new().run(&graph, ctx).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(disposed.load(Ordering::SeqCst));
}

/// A token cancelled before the run starts yields an immediate cancellation.
#[tokio::test]
async fn pre_cancelled_token_short_circuits() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", vec![1, 2, 3]);
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &sink);
    let graph = builder.build().unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let ctx = PipelineContext::new().with_token(token);

    let result = PipelineRunner::new().run(&graph, ctx).await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(collector.is_empty());
}

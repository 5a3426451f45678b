//! Retry policy behavior observed through whole pipeline runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use flowgraph::engine::{PipelineContext, PipelineOptions, PipelineRunner, RetryOptions};
use flowgraph::graph::PipelineBuilder;
use flowgraph::PipelineError;

/// An always-failing transform under maxAttempts=3 with zero delays is
/// invoked exactly three times, then the run fails with a node-execution
/// error whose cause is the retry exhaustion.
#[tokio::test]
async fn always_failing_transform_exhausts_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);

    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", vec![1]);
    let flaky = builder.transform_fn("flaky", move |_x: i32| {
        calls_probe.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("transient failure")
    });
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &flaky);
    builder.connect(&flaky, &sink);
    let graph = builder.build().unwrap();

    let ctx = PipelineContext::with_options(PipelineOptions {
        retry: RetryOptions::immediate(3),
        ..Default::default()
    });

    let started = Instant::now();
    let err = PipelineRunner::new().run(&graph, ctx).await.err().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(collector.is_empty());
    assert!(
        elapsed.as_millis() < 100,
        "zero-delay retries must not sleep, took {elapsed:?}"
    );

    match err {
        PipelineError::NodeExecution { node_id, source } => {
            assert_eq!(node_id, "flaky");
            match *source {
                PipelineError::RetryExhausted {
                    node_id, attempts, ..
                } => {
                    assert_eq!(node_id, "flaky");
                    assert_eq!(attempts, 3);
                }
                other => panic!("expected retry exhaustion, got {other}"),
            }
        }
        other => panic!("expected node execution failure, got {other}"),
    }
}

/// A transform that recovers within the attempt budget succeeds and the
/// pipeline completes.
#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);

    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", vec![10]);
    let flaky = builder.transform_fn("flaky", move |x: i32| {
        if calls_probe.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("not yet")
        }
        Ok(x + 1)
    });
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &flaky);
    builder.connect(&flaky, &sink);
    let graph = builder.build().unwrap();

    let ctx = PipelineContext::with_options(PipelineOptions {
        retry: RetryOptions::immediate(3),
        ..Default::default()
    });
    PipelineRunner::new().run(&graph, ctx).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(collector.items(), vec![11]);
}

/// A per-node retry override narrows the budget for that node only.
#[tokio::test]
async fn per_node_retry_overrides_pipeline_default() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);

    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", vec![1]);
    let flaky = builder.transform_fn("flaky", move |_x: i32| {
        calls_probe.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("always")
    });
    let (sink, _collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &flaky);
    builder.connect(&flaky, &sink);
    builder.set_retry("flaky", RetryOptions::no_retries());
    let graph = builder.build().unwrap();

    // The pipeline default allows five attempts; the node allows one.
    let ctx = PipelineContext::with_options(PipelineOptions {
        retry: RetryOptions::immediate(5),
        ..Default::default()
    });
    let err = PipelineRunner::new().run(&graph, ctx).await.err().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.is_retry_exhausted());
}

/// The retry classifier can rule an error out of retrying.
#[tokio::test]
async fn classifier_prevents_retries_for_fatal_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_probe = Arc::clone(&calls);

    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", vec![1]);
    let fatal = builder.transform_fn("fatal", move |_x: i32| {
        calls_probe.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("fatal: corrupt record")
    });
    let (sink, _collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &fatal);
    builder.connect(&fatal, &sink);
    let graph = builder.build().unwrap();

    let ctx = PipelineContext::with_options(PipelineOptions {
        retry: RetryOptions::immediate(4),
        retry_classifier: Some(Arc::new(|err| !err.to_string().contains("fatal"))),
        ..Default::default()
    });
    let err = PipelineRunner::new().run(&graph, ctx).await.err().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.is_retry_exhausted());
}

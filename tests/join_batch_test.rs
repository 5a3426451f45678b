//! Fan-in, batching and unbatching through whole pipeline runs.

use std::time::Duration;

use flowgraph::engine::{PipelineContext, PipelineRunner};
use flowgraph::graph::{ExecutionStrategy, PipelineBuilder};
use pretty_assertions::assert_eq;

/// Two branches of one source merge through a join node; the merged stream
/// holds every element exactly once.
#[tokio::test]
async fn join_merges_branches_completely() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", (1..=10).collect::<Vec<i32>>());
    let double = builder.transform_fn("double", |x: i32| Ok(x * 2));
    let negate = builder.transform_fn("negate", |x: i32| Ok(-x));
    let join = builder.add_join::<i32>("merge");
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &double);
    builder.connect(&source, &negate);
    builder.connect(&double, &join);
    builder.connect(&negate, &join);
    builder.connect(&join, &sink);
    let graph = builder.build().unwrap();

    PipelineRunner::new()
        .run(&graph, PipelineContext::new())
        .await
        .unwrap();

    let mut merged = collector.items();
    merged.sort_unstable();
    let mut expected: Vec<i32> = (1..=10)
        .map(|x| x * 2)
        .chain((1..=10).map(|x| -x))
        .collect();
    expected.sort_unstable();
    assert_eq!(merged, expected);
}

/// Per-input order survives the interleave: elements of each branch appear
/// in their original relative order.
#[tokio::test]
async fn join_preserves_per_input_order() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", (1..=20).collect::<Vec<i32>>());
    let evens = builder.transform_fn("evens", |x: i32| Ok(x * 1000));
    let odds = builder.transform_fn("odds", |x: i32| Ok(x));
    let join = builder.add_join::<i32>("merge");
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &evens);
    builder.connect(&source, &odds);
    builder.connect(&evens, &join);
    builder.connect(&odds, &join);
    builder.connect(&join, &sink);
    let graph = builder.build().unwrap();

    PipelineRunner::new()
        .run(&graph, PipelineContext::new())
        .await
        .unwrap();

    let merged = collector.items();
    let from_evens: Vec<i32> = merged.iter().copied().filter(|x| *x >= 1000).collect();
    let from_odds: Vec<i32> = merged.iter().copied().filter(|x| *x < 1000).collect();
    assert_eq!(from_evens, (1..=20).map(|x| x * 1000).collect::<Vec<_>>());
    assert_eq!(from_odds, (1..=20).collect::<Vec<_>>());
}

/// Batch groups by size, unbatch flattens back, order intact.
#[tokio::test]
async fn batch_then_unbatch_round_trips() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", (1..=7).collect::<Vec<i32>>());
    let batch = builder.add_batch::<i32>("group", 3, Duration::from_secs(5));
    let unbatch = builder.add_unbatch::<i32>("flatten");
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &batch);
    builder.connect(&batch, &unbatch);
    builder.connect(&unbatch, &sink);
    let graph = builder.build().unwrap();

    PipelineRunner::new()
        .run(&graph, PipelineContext::new())
        .await
        .unwrap();

    assert_eq!(collector.items(), (1..=7).collect::<Vec<_>>());
}

/// Batches arrive as vectors of the declared size, with a short tail.
#[tokio::test]
async fn batch_sizes_are_bounded() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", (1..=8).collect::<Vec<i32>>());
    let batch = builder.add_batch::<i32>("group", 3, Duration::from_secs(5));
    let (sink, collector) = builder.collecting_sink::<Vec<i32>>("collect");
    builder.connect(&source, &batch);
    builder.connect(&batch, &sink);
    let graph = builder.build().unwrap();

    PipelineRunner::new()
        .run(&graph, PipelineContext::new())
        .await
        .unwrap();

    assert_eq!(
        collector.items(),
        vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8]]
    );
}

/// A parallel transform preserves input order on its output edge.
#[tokio::test]
async fn parallel_transform_keeps_output_order() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("numbers", (1..=40).collect::<Vec<i32>>());
    let slow = builder.transform_fn("slow", |x: i32| Ok(x * 3));
    let (sink, collector) = builder.collecting_sink::<i32>("collect");
    builder.connect(&source, &slow);
    builder.connect(&slow, &sink);
    builder.set_strategy("slow", ExecutionStrategy::ParallelPerItem { degree: 8 });
    let graph = builder.build().unwrap();

    PipelineRunner::new()
        .run(&graph, PipelineContext::new())
        .await
        .unwrap();

    assert_eq!(
        collector.items(),
        (1..=40).map(|x| x * 3).collect::<Vec<_>>()
    );
}

//! Property-based laws of the runtime.

use flowgraph::engine::{ExecutionCoordinator, PipelineContext, PipelineRunner};
use flowgraph::graph::PipelineBuilder;
use proptest::collection::vec;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every subscriber of a branched source observes exactly the source
    /// sequence, in order.
    #[test]
    fn multicast_subscribers_agree(items in vec(any::<i32>(), 0..50)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut builder = PipelineBuilder::new();
            let source = builder.source_from_iter("numbers", items.clone());
            let (left, left_items) = builder.collecting_sink::<i32>("left");
            let (right, right_items) = builder.collecting_sink::<i32>("right");
            builder.connect(&source, &left);
            builder.connect(&source, &right);
            let graph = builder.build().unwrap();

            PipelineRunner::new()
                .run(&graph, PipelineContext::new())
                .await
                .unwrap();

            prop_assert_eq!(left_items.items(), items.clone());
            prop_assert_eq!(right_items.items(), items);
            Ok(())
        })?;
    }

    /// The counter of an edge equals the number of elements that crossed it.
    #[test]
    fn counters_equal_element_flow(items in vec(any::<i32>(), 0..50)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            use flowgraph::graph::SinkNode;
            use flowgraph::pipe::PipeRef;
            use async_trait::async_trait;
            use std::sync::Arc;
            use std::sync::atomic::{AtomicU64, Ordering};
            use tokio_util::sync::CancellationToken;

            struct Probe {
                seen: Arc<AtomicU64>,
            }

            #[async_trait]
            impl SinkNode for Probe {
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
                    self.seen
                        .store(ctx.counter("numbers").unwrap_or(0), Ordering::SeqCst);
                    Ok(())
                }
            }

            let seen = Arc::new(AtomicU64::new(0));
            let mut builder = PipelineBuilder::new();
            let source = builder.source_from_iter("numbers", items.clone());
            let sink = builder.add_sink_instance("probe", Probe { seen: Arc::clone(&seen) });
            builder.connect(&source, &sink);
            let graph = builder.build().unwrap();

            PipelineRunner::new()
                .run(&graph, PipelineContext::new())
                .await
                .unwrap();

            prop_assert_eq!(seen.load(Ordering::SeqCst), items.len() as u64);
            Ok(())
        })?;
    }

    /// The topological order of a linear chain is its declaration order,
    /// for any chain length.
    #[test]
    fn chains_sort_in_declaration_order(length in 1usize..8) {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("stage-0", vec![1]);
        let mut previous = source.id().to_string();
        for stage in 1..=length {
            let name = format!("stage-{stage}");
            let _ = builder.transform_fn(&name, |x: i32| Ok(x));
            builder.connect_ids(&previous, &name);
            previous = name;
        }
        let sink = builder.sink_fn("out", |_x: i32| Ok(()));
        builder.connect_ids(&previous, sink.id());
        let graph = builder.build().unwrap();

        let order = ExecutionCoordinator::topological_order(&graph);
        let expected: Vec<String> = (0..=length)
            .map(|stage| format!("stage-{stage}"))
            .chain(std::iter::once("out".to_string()))
            .collect();
        prop_assert_eq!(order, expected);
    }

    /// Building the same definition twice yields structurally equal graphs.
    #[test]
    fn building_is_idempotent(items in vec(any::<i32>(), 0..10)) {
        let build = |items: Vec<i32>| {
            let mut builder = PipelineBuilder::new();
            let source = builder.source_from_iter("src", items);
            let bump = builder.transform_fn("bump", |x: i32| Ok(x + 1));
            let (sink, _collector) = builder.collecting_sink::<i32>("out");
            builder.connect(&source, &bump);
            builder.connect(&bump, &sink);
            builder.build().unwrap()
        };
        let first = build(items.clone());
        let second = build(items);
        prop_assert_eq!(first.node_ids(), second.node_ids());
        prop_assert_eq!(first.edges(), second.edges());
    }
}

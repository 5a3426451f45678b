//! Build-time graph validation.

use flowgraph::graph::{PipelineBuilder, ValidationError};
use flowgraph::PipelineError;

#[test]
fn duplicate_node_names_are_rejected_with_both_facts() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("foo", vec![1]);
    let sink = builder.sink_fn("foo", |_x: i32| Ok(()));
    builder.connect(&source, &sink);

    let err = builder.build().err().expect("duplicate names must fail");
    let message = err.to_string();
    assert!(message.contains("Node names must be unique"), "{message}");
    assert!(message.contains("foo"), "{message}");
}

#[test]
fn a_graph_needs_a_source_and_a_sink() {
    let builder = PipelineBuilder::new();
    let report = builder.try_build().err().unwrap();
    assert!(report
        .errors
        .iter()
        .any(|error| matches!(error, ValidationError::MissingSource)));
    assert!(report
        .errors
        .iter()
        .any(|error| matches!(error, ValidationError::MissingSink)));
}

#[test]
fn cycles_fail_validation() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("src", vec![1]);
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
fn edge_types_must_agree() {
    let mut builder = PipelineBuilder::new();
    let _source = builder.source_from_iter("numbers", vec![1i32]);
    let _sink = builder.sink_fn("words", |_x: String| Ok(()));
    builder.connect_ids("numbers", "words");

    let report = builder.try_build().err().unwrap();
    let mismatch = report
        .errors
        .iter()
        .find(|error| matches!(error, ValidationError::TypeMismatch { .. }))
        .expect("expected a type mismatch");
    assert_eq!(mismatch.code(), "NP0106");
}

#[test]
fn transforms_must_be_connected_on_both_sides() {
    let mut builder = PipelineBuilder::new();
    let source = builder.source_from_iter("src", vec![1]);
    let _dangling = builder.transform_fn("dangling", |x: i32| Ok(x));
    let sink = builder.sink_fn("out", |_x: i32| Ok(()));
    builder.connect(&source, &sink);

    let report = builder.try_build().err().unwrap();
    assert!(report
        .errors
        .iter()
        .any(|error| matches!(error, ValidationError::DisconnectedTransform(_))));
    assert!(report
        .errors
        .iter()
        .any(|error| matches!(error, ValidationError::Unreachable(_))));
}

#[test]
fn unreachable_error_rules_fail_handler_construction() {
    use flowgraph::engine::ErrorHandler;

    let result = ErrorHandler::builder()
        .on_any()
        .skip()
        .on(|_| true)
        .dead_letter()
        .build();
    match result.err() {
        Some(PipelineError::Validation(ValidationError::UnreachableErrorRule(_))) => {}
        other => panic!("expected unreachable-rule failure, got {other:?}"),
    }
}

#[test]
fn validation_codes_are_stable() {
    assert_eq!(ValidationError::DuplicateName("x".into()).code(), "NP0101");
    assert_eq!(ValidationError::MissingSource.code(), "NP0103");
    assert_eq!(ValidationError::Cycle.code(), "NP0105");
}

#[test]
fn building_the_same_definition_twice_is_idempotent() {
    fn build() -> flowgraph::graph::PipelineGraph {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("src", vec![1, 2]);
        let left = builder.transform_fn("left", |x: i32| Ok(x));
        let right = builder.transform_fn("right", |x: i32| Ok(x));
        let join = builder.add_join::<i32>("merge");
        let sink = builder.sink_fn("out", |_x: i32| Ok(()));
        builder.connect(&source, &left);
        builder.connect(&source, &right);
        builder.connect(&left, &join);
        builder.connect(&right, &join);
        builder.connect(&join, &sink);
        builder.build().unwrap()
    }

    let first = build();
    let second = build();
    assert_eq!(first.node_ids(), second.node_ids());
    assert_eq!(first.edges(), second.edges());
}

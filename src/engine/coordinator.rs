//! Execution planning: topological order, input lookup, node instantiation.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::graph::{EdgeDef, NodeInstance, NodeKind, PipelineGraph};
use crate::{PipelineError, Result};

/// Everything the executor needs to drive one run of a graph.
pub struct ExecutionPlan {
    /// Node ids in deterministic topological order
    pub order: Vec<String>,
    /// Inbound edges per node, in declaration order (joins rely on it)
    pub inputs: HashMap<String, Vec<EdgeDef>>,
    /// Instantiated nodes keyed by id
    pub instances: HashMap<String, NodeInstance>,
}

/// Plans a run: sorts the graph, resolves inputs and instantiates nodes.
pub struct ExecutionCoordinator;

impl ExecutionCoordinator {
    /// Build the execution plan for a validated graph.
    pub fn plan(graph: &PipelineGraph) -> Result<ExecutionPlan> {
        let order = Self::topological_order(graph);

        let mut inputs = HashMap::new();
        for definition in graph.definitions() {
            inputs.insert(
                definition.id.clone(),
                graph
                    .inbound(&definition.id)
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }

        let mut instances = HashMap::new();
        for definition in graph.definitions() {
            let instance = Self::instantiate(graph, &definition.id)?;
            Self::check_instance_kind(definition.kind, &instance, &definition.id)?;
            instances.insert(definition.id.clone(), instance);
        }

        debug!(nodes = order.len(), "execution plan ready");
        Ok(ExecutionPlan {
            order,
            inputs,
            instances,
        })
    }

    /// Deterministic topological order: Kahn's algorithm with ties broken by
    /// declaration order.
    pub fn topological_order(graph: &PipelineGraph) -> Vec<String> {
        let definitions = graph.definitions();
        let position: HashMap<&str, usize> = definitions
            .iter()
            .enumerate()
            .map(|(index, def)| (def.id.as_str(), index))
            .collect();

        let mut indegree = vec![0usize; definitions.len()];
        for edge in graph.edges() {
            if let Some(&target) = position.get(edge.target.as_str()) {
                indegree[target] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(index, _)| index)
            .collect();

        let mut order = Vec::with_capacity(definitions.len());
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            let id = definitions[next].id.clone();
            for edge in graph.edges().iter().filter(|edge| edge.source == id) {
                if let Some(&target) = position.get(edge.target.as_str()) {
                    indegree[target] -= 1;
                    if indegree[target] == 0 {
                        ready.insert(target);
                    }
                }
            }
            order.push(id);
        }
        order
    }

    /// The preconfigured instance for a node, or a fresh one from the
    /// registry.
    fn instantiate(graph: &PipelineGraph, node_id: &str) -> Result<NodeInstance> {
        if let Some(instance) = graph.preconfigured(node_id) {
            return Ok(instance);
        }
        let definition = graph.node(node_id).ok_or_else(|| {
            PipelineError::Configuration(format!("unknown node '{}' in plan", node_id))
        })?;
        graph
            .registry()
            .create(&definition.type_tag)
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "no constructor registered for node '{}' (type tag '{}')",
                    node_id, definition.type_tag
                ))
            })
    }

    fn check_instance_kind(kind: NodeKind, instance: &NodeInstance, node_id: &str) -> Result<()> {
        let compatible = match kind {
            NodeKind::Source => matches!(instance, NodeInstance::Source(_)),
            NodeKind::Transform => matches!(instance, NodeInstance::Transform(_)),
            NodeKind::Sink | NodeKind::Tap => matches!(instance, NodeInstance::Sink(_)),
            NodeKind::Join | NodeKind::Branch | NodeKind::Batch | NodeKind::Unbatch => {
                matches!(instance, NodeInstance::PipeOp(_))
            }
        };
        if compatible {
            Ok(())
        } else {
            Err(PipelineError::Configuration(format!(
                "node '{}' is declared as {:?} but its instance is a {}",
                node_id,
                kind,
                instance.kind_name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineBuilder;

    fn diamond() -> PipelineGraph {
        let mut builder = PipelineBuilder::new();
        let source = builder.source_from_iter("src", vec![1]);
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

    #[test]
    fn topological_order_is_deterministic_and_respects_edges() {
        let graph = diamond();
        let order = ExecutionCoordinator::topological_order(&graph);
        assert_eq!(order, vec!["src", "left", "right", "merge", "out"]);
    }

    #[test]
    fn plan_resolves_inputs_in_declaration_order() {
        let graph = diamond();
        let plan = ExecutionCoordinator::plan(&graph).unwrap();
        let merge_inputs = &plan.inputs["merge"];
        assert_eq!(merge_inputs.len(), 2);
        assert_eq!(merge_inputs[0].source, "left");
        assert_eq!(merge_inputs[1].source, "right");
        assert!(plan.instances.contains_key("src"));
    }

    #[test]
    fn registry_backed_nodes_are_instantiated_fresh() {
        use crate::engine::context::PipelineContext;
        use crate::graph::SourceNode;
        use crate::pipe::{InMemoryPipe, PipeRef};
        use async_trait::async_trait;
        use std::sync::Arc;
        use tokio_util::sync::CancellationToken;

        #[derive(Default)]
        struct Numbers;

        #[async_trait]
        impl SourceNode for Numbers {
            type Out = i32;
            async fn initialize(
                &self,
                _ctx: &PipelineContext,
                _token: &CancellationToken,
            ) -> anyhow::Result<PipeRef<i32>> {
                Ok(Arc::new(InMemoryPipe::new("numbers", vec![1, 2])))
            }
        }

        let mut builder = PipelineBuilder::new();
        let source = builder.add_source::<Numbers>("src");
        let sink = builder.sink_fn("out", |_x: i32| Ok(()));
        builder.connect(&source, &sink);
        let graph = builder.build().unwrap();

        let plan = ExecutionCoordinator::plan(&graph).unwrap();
        assert!(matches!(
            plan.instances["src"],
            NodeInstance::Source(_)
        ));
    }
}

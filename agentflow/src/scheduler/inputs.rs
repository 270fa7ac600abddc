//! Resolving a node's inputs from upstream outputs and run inputs.

use super::state::{ExecutionState, NodeOutput};
use crate::cancellation::CancellationToken;
use crate::errors::EngineError;
use crate::graph::{Edge, ExecutionGraph, Node, RunInputs};
use crate::ports::{get_json, AgentError, AgentInputs, ArtifactStore, InputValue, WorkflowStateProvider};
use crate::streaming::{StreamLifecycleManager, StreamReader};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// One value or stream feeding a slot.
#[derive(Debug)]
pub(crate) enum SlotSource {
    Value(Value),
    Stream(StreamReader),
}

/// Everything a node needs before it can be invoked.
#[derive(Debug, Default)]
pub(crate) struct ResolvedInputs {
    /// Slot to sources, in edge order. A slot fed by several edges receives
    /// an array.
    slots: BTreeMap<String, Vec<SlotSource>>,
    /// What the node saw, streams recorded as `{"$stream": id}`.
    pub snapshot: HashMap<String, Value>,
    /// Stream consumers this node holds, to release when it finishes.
    pub consumed: Vec<(Uuid, usize)>,
    /// Serialized size of the value inputs.
    pub bytes: u64,
}

impl ResolvedInputs {
    pub fn has_streams(&self) -> bool {
        !self.consumed.is_empty()
    }

    /// Builds the invocation inputs, consuming any streams.
    ///
    /// A slot with a single stream source is handed over as a stream; a slot
    /// with several sources is drained into an array.
    pub async fn take(&mut self) -> Result<AgentInputs, AgentError> {
        let mut inputs = AgentInputs::new();
        for (slot, mut sources) in std::mem::take(&mut self.slots) {
            if sources.len() == 1 {
                let input = match sources.pop() {
                    Some(SlotSource::Value(v)) => InputValue::Value(v),
                    Some(SlotSource::Stream(reader)) => InputValue::Stream(reader),
                    None => continue,
                };
                inputs.insert(slot, input);
                continue;
            }
            let mut items = Vec::with_capacity(sources.len());
            for source in sources {
                items.push(match source {
                    SlotSource::Value(v) => v,
                    SlotSource::Stream(reader) => InputValue::Stream(reader).into_value().await?,
                });
            }
            inputs.insert(slot, InputValue::Value(Value::Array(items)));
        }
        Ok(inputs)
    }

    /// Value-only inputs for a retry, rebuilt from the snapshot.
    pub fn replay(&self) -> AgentInputs {
        AgentInputs::from_values(self.snapshot.clone())
    }
}

/// The output slot an edge selects, when its source declares several.
///
/// Nodes with several declared outputs produce an object keyed by slot, and
/// streaming ones emit such an object per chunk.
fn selected_slot(source: &Node, edge: &Edge) -> Option<String> {
    (source.outputs.len() > 1).then(|| edge.source_slot.clone())
}

/// Picks the part of an upstream value (or chunk) an edge carries.
fn select_slot(slot: Option<&str>, value: Value) -> Value {
    match (slot, value) {
        (Some(slot), Value::Object(mut map)) => map.remove(slot).unwrap_or(Value::Null),
        (_, value) => value,
    }
}

/// Resolves the inputs of `node`.
///
/// Stream readers are acquired here, in the scheduler's task, so the
/// consumer index bookkeeping stays with the run.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn resolve_inputs(
    graph: &ExecutionGraph,
    node: &Node,
    state: &ExecutionState,
    run_inputs: &RunInputs,
    store: &dyn ArtifactStore,
    streams: &StreamLifecycleManager,
    provider: Option<&dyn WorkflowStateProvider>,
    token: &CancellationToken,
) -> Result<ResolvedInputs, EngineError> {
    let mut resolved = ResolvedInputs::default();
    let mut snapshot: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for edge in graph.incoming(&node.id) {
        let source = graph
            .node(&edge.source)
            .ok_or_else(|| EngineError::NotFound(format!("node {}", edge.source)))?;
        let output = state
            .node(&edge.source)
            .and_then(|s| s.output.clone())
            .ok_or_else(|| EngineError::node(&node.id, format!("no output from '{}'", edge.source), false))?;

        let (source_value, marker) = match output {
            NodeOutput::Inline { value } => (SlotSource::Value(value), None),
            NodeOutput::Artifact { reference } => {
                let value = get_json::<Value>(store, &reference.key)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("artifact {}", reference.key)))?;
                (SlotSource::Value(value), None)
            }
            NodeOutput::Stream { stream_id } => {
                let index = graph
                    .outgoing(&edge.source)
                    .position(|e| std::ptr::eq(e, edge))
                    .ok_or_else(|| EngineError::NotFound(format!("consumer edge {edge}")))?;
                let reader = streams
                    .acquire_reader_with(stream_id, index, provider)
                    .await?
                    .with_cancellation(token);
                resolved.consumed.push((stream_id, index));
                (SlotSource::Stream(reader), Some(json!({"$stream": stream_id})))
            }
        };

        let carried = match source_value {
            SlotSource::Value(value) => {
                let value = edge
                    .carry(select_slot(selected_slot(source, edge).as_deref(), value))
                    .map_err(|e| EngineError::node(&node.id, e, false))?;
                resolved.bytes += json_size(&value);
                snapshot.entry(edge.target_slot.clone()).or_default().push(value.clone());
                SlotSource::Value(value)
            }
            SlotSource::Stream(reader) => {
                let slot = selected_slot(source, edge);
                let reader = if edge.is_passthrough() && slot.is_none() {
                    reader
                } else {
                    let edge = edge.clone();
                    reader.map_chunks(move |chunk| edge.carry(select_slot(slot.as_deref(), chunk)))
                };
                if let Some(marker) = marker {
                    snapshot.entry(edge.target_slot.clone()).or_default().push(marker);
                }
                SlotSource::Stream(reader)
            }
        };
        resolved
            .slots
            .entry(edge.target_slot.clone())
            .or_default()
            .push(carried);
    }

    if let Some(supplied) = run_inputs.for_node(&node.id) {
        for (slot, value) in supplied {
            if resolved.slots.contains_key(slot) {
                continue;
            }
            resolved.bytes += json_size(value);
            snapshot.insert(slot.clone(), vec![value.clone()]);
            resolved
                .slots
                .insert(slot.clone(), vec![SlotSource::Value(value.clone())]);
        }
    }

    resolved.snapshot = snapshot
        .into_iter()
        .map(|(slot, mut values)| {
            let value = if values.len() == 1 {
                values.pop().unwrap_or(Value::Null)
            } else {
                Value::Array(values)
            };
            (slot, value)
        })
        .collect();
    Ok(resolved)
}

pub(crate) fn json_size(value: &Value) -> u64 {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamLifecycleConfig;
    use crate::events::NoOpEventSink;
    use crate::graph::{SlotDecl, Transformation};
    use crate::ports::{InMemoryArtifactStore, InMemoryRecordStore};
    use crate::scheduler::state::NodeExecutionState;
    use crate::streaming::{from_chunks, StreamProducer, StreamingStrategy};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn manager(store: Arc<InMemoryArtifactStore>) -> StreamLifecycleManager {
        StreamLifecycleManager::new(
            StreamLifecycleConfig::default(),
            store,
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(NoOpEventSink),
        )
    }

    fn succeeded(state: &mut ExecutionState, id: &str, output: NodeOutput) {
        let node: &mut NodeExecutionState = state.node_mut(id);
        node.start(0);
        node.succeed(output);
    }

    #[tokio::test]
    async fn test_fan_in_slot_becomes_array() {
        let graph = ExecutionGraph::new(
            vec![
                Node::new("a", "x"),
                Node::new("b", "x"),
                Node::new("join", "x").with_input(SlotDecl::required("items")),
            ],
            vec![
                Edge::new("a", "output", "join", "items"),
                Edge::new("b", "output", "join", "items"),
            ],
        );
        let mut state = ExecutionState::new(Uuid::nil(), &graph);
        succeeded(&mut state, "a", NodeOutput::Inline { value: json!(1) });
        succeeded(&mut state, "b", NodeOutput::Inline { value: json!(2) });
        let store = Arc::new(InMemoryArtifactStore::unbounded());
        let streams = manager(store.clone());

        let mut resolved = resolve_inputs(
            &graph,
            graph.node("join").unwrap(),
            &state,
            &RunInputs::new(),
            store.as_ref(),
            &streams,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(resolved.snapshot["items"], json!([1, 2]));
        let inputs = resolved.take().await.unwrap();
        assert_eq!(inputs.value("items"), Some(&json!([1, 2])));
    }

    #[tokio::test]
    async fn test_edge_transform_and_output_slot() {
        let graph = ExecutionGraph::new(
            vec![
                Node::new("split", "x").with_outputs(vec![
                    SlotDecl::optional("title"),
                    SlotDecl::optional("body"),
                ]),
                Node::new("render", "x").with_input(SlotDecl::required("doc")),
            ],
            vec![Edge::new("split", "body", "render", "doc")
                .with_transformation(Transformation::Wrap("text".into()))],
        );
        let mut state = ExecutionState::new(Uuid::nil(), &graph);
        succeeded(
            &mut state,
            "split",
            NodeOutput::Inline {
                value: json!({"title": "T", "body": "B"}),
            },
        );
        let store = Arc::new(InMemoryArtifactStore::unbounded());
        let streams = manager(store.clone());
        let run_inputs = RunInputs::new().with("render", "doc", json!("ignored")).with("render", "style", json!("bold"));

        let resolved = resolve_inputs(
            &graph,
            graph.node("render").unwrap(),
            &state,
            &run_inputs,
            store.as_ref(),
            &streams,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(resolved.snapshot["doc"], json!({"text": "B"}));
        assert_eq!(resolved.snapshot["style"], json!("bold"));
        assert!(!resolved.has_streams());
    }

    #[tokio::test]
    async fn test_stream_edge_selects_output_slot_per_chunk() {
        let split = Node::new("split", "x").with_outputs(vec![
            SlotDecl::optional("title"),
            SlotDecl::optional("body"),
        ]);
        let graph = ExecutionGraph::new(
            vec![split.clone(), Node::new("render", "x").with_input(SlotDecl::required("doc"))],
            vec![Edge::new("split", "body", "render", "doc")],
        );
        let store = Arc::new(InMemoryArtifactStore::unbounded());
        let streams = manager(store.clone());
        let producer = StreamProducer {
            run_id: Uuid::nil(),
            node: split,
            inputs: HashMap::new(),
            strategy: StreamingStrategy::StreamSingle,
        };
        let chunks = vec![
            json!({"title": "T", "body": "first"}),
            json!({"body": "second"}),
        ];
        let handle = streams.register(producer, from_chunks(chunks), 1).unwrap();
        let mut state = ExecutionState::new(Uuid::nil(), &graph);
        succeeded(
            &mut state,
            "split",
            NodeOutput::Stream {
                stream_id: handle.stream_id,
            },
        );

        let mut resolved = resolve_inputs(
            &graph,
            graph.node("render").unwrap(),
            &state,
            &RunInputs::new(),
            store.as_ref(),
            &streams,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(resolved.has_streams());
        let values = resolved.take().await.unwrap().into_values().await.unwrap();
        assert_eq!(values["doc"], json!(["first", "second"]));
    }
}

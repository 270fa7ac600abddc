//! End-to-end runs through the engine.

use super::*;
use crate::config::MonitorConfig;
use crate::core::NodeStatus;
use crate::events::{names, CollectingEventSink};
use crate::graph::{Edge, Node, NodeConfig, SlotDecl};
use crate::ledger::{CompensationDescriptor, FnCompensationHandler, HandlerOutcome, SideEffect};
use crate::ports::{AgentError, AgentInputs, AgentOutput, InvocationContext, StaticStateProvider};
use crate::scheduler::{AfterRetry, FailurePolicy, NodeOutput, RetryConfig, RunOptions, RunStatus};
use crate::streaming::{AgentHints, ChunkSource, StalenessSeverity, StreamingStrategy};
use crate::testing::{
    assert_levels_respect_edges, assert_node_status, assert_run_status,
    assert_starts_after_predecessors, diamond_graph, fan_out_graph, linear_graph, FailingAgent,
    RecordingAgent, ScriptedAgent, SlowAgent, StreamingAgent,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Dispatches by agent type.
#[derive(Default)]
struct Router {
    routes: HashMap<String, Arc<dyn AgentInvoker>>,
}

impl Router {
    fn route(mut self, agent_type: &str, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.routes.insert(agent_type.to_string(), invoker);
        self
    }
}

#[async_trait]
impl AgentInvoker for Router {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        match self.routes.get(&node.config.agent_type) {
            Some(invoker) => invoker.invoke(node, inputs, ctx).await,
            None => Err(AgentError::fatal(format!("no agent for {}", node.config.agent_type))),
        }
    }

    fn hints(&self, agent_type: &str) -> AgentHints {
        self.routes
            .get(agent_type)
            .map(|invoker| invoker.hints(agent_type))
            .unwrap_or_default()
    }
}

fn engine_with(
    invoker: Arc<dyn AgentInvoker>,
    config: EngineConfig,
    configure: impl FnOnce(EngineBuilder) -> EngineBuilder,
) -> (Engine, Arc<CollectingEventSink>) {
    let events = Arc::new(CollectingEventSink::new());
    let builder = Engine::builder(invoker)
        .config(config)
        .event_sink(events.clone());
    (configure(builder).build().unwrap(), events)
}

fn engine(invoker: Arc<dyn AgentInvoker>, config: EngineConfig) -> (Engine, Arc<CollectingEventSink>) {
    engine_with(invoker, config, |builder| builder)
}

fn stream_router(producer: StreamingAgent, consumers: Arc<ScriptedAgent>) -> Arc<dyn AgentInvoker> {
    Arc::new(
        Router::default()
            .route("stream", Arc::new(producer))
            .route("echo", consumers),
    )
}

fn reversible(description: &str) -> SideEffect {
    SideEffect::new(
        "doc.create",
        description,
        CompensationDescriptor::reversible("doc.delete", json!({})),
    )
}

/// A `doc.*` handler logging the descriptions it compensates.
fn logging_handler(log: Arc<parking_lot::Mutex<Vec<String>>>) -> Arc<dyn CompensationHandler> {
    Arc::new(FnCompensationHandler::new(move |entry| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push(entry.effect.description.clone());
            Ok(HandlerOutcome::Compensated(json!({"deleted": true})))
        }
    }))
}

#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let scripted = Arc::new(ScriptedAgent::new());
    let recording = Arc::new(RecordingAgent::new(scripted.clone()));
    let (engine, events) = engine(recording.clone(), EngineConfig::default());
    let graph = diamond_graph();

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Completed);
    assert_levels_respect_edges(&graph, &result);
    assert_starts_after_predecessors(&graph, &recording);

    let d = scripted.invocations_of("d");
    assert_eq!(d.len(), 1);
    assert_eq!(d[0].inputs["left"]["node"], "b");
    assert_eq!(d[0].inputs["right"]["node"], "c");
    assert_eq!(d[0].inputs["left"]["inputs"]["in"]["node"], "a");

    assert_eq!(events.events_of_type(names::RUN_WIDE).len(), 1);
    assert_eq!(events.events_of_type(names::NODE_STARTED).len(), 4);
}

#[tokio::test]
async fn test_cycle_is_a_precondition_failure() {
    let scripted = Arc::new(ScriptedAgent::new());
    let (engine, events) = engine(scripted.clone(), EngineConfig::default());
    let graph = ExecutionGraph::new(
        vec![
            Node::new("a", "echo").with_input(SlotDecl::optional("in")),
            Node::new("b", "echo").with_input(SlotDecl::optional("in")),
            Node::new("c", "echo").with_input(SlotDecl::optional("in")),
        ],
        vec![
            Edge::new("a", "output", "b", "in"),
            Edge::new("b", "output", "c", "in"),
            Edge::new("c", "output", "a", "in"),
        ],
    );

    let err = engine.run(&graph, &RunInputs::new()).await.unwrap_err();

    assert_eq!(err.kind(), crate::errors::ErrorKind::Precondition);
    assert!(scripted.invocations().is_empty());
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_missing_required_input_is_a_precondition_failure() {
    let scripted = Arc::new(ScriptedAgent::new());
    let (engine, _) = engine(scripted.clone(), EngineConfig::default());
    let graph = ExecutionGraph::new(
        vec![Node::new("lonely", "echo").with_input(SlotDecl::required("prompt"))],
        vec![],
    );

    let err = engine.run(&graph, &RunInputs::new()).await.unwrap_err();
    assert!(err.is_precondition());

    let result = engine
        .run(&graph, &RunInputs::new().with("lonely", "prompt", json!("hi")))
        .await
        .unwrap();
    assert_run_status(&result, RunStatus::Completed);
    assert_eq!(scripted.invocations_of("lonely")[0].inputs["prompt"], "hi");
}

#[tokio::test]
async fn test_tee_delivers_whole_stream_to_every_consumer() {
    for consumers in [1usize, 2, 3, 5] {
        let producer = StreamingAgent::new(12);
        let expected = Value::Array(producer.expected_chunks("s"));
        let scripted = Arc::new(ScriptedAgent::new());
        let config = EngineConfig::default().with_streaming(StreamingThresholds {
            max_tee_consumers: 8,
            ..StreamingThresholds::default()
        });
        let (engine, _) = engine(stream_router(producer, scripted.clone()), config);
        let graph = fan_out_graph(Node::new("s", "stream"), consumers);

        let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

        assert_run_status(&result, RunStatus::Completed);
        let strategy = if consumers == 1 {
            StreamingStrategy::StreamSingle
        } else {
            StreamingStrategy::StreamTee
        };
        assert_eq!(result.node("s").unwrap().strategy, Some(strategy), "{consumers} consumers");
        for i in 0..consumers {
            let calls = scripted.invocations_of(&format!("c{i}"));
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].inputs["in"], expected, "consumer {i} of {consumers}");
        }
        assert_eq!(engine.streams().active_count(), 0);
    }
}

#[tokio::test]
async fn test_fan_out_four_tees_small_and_materializes_large_outputs() {
    let cases = [
        (1024, StreamingStrategy::StreamTee),
        (64 * 1024 * 1024, StreamingStrategy::StreamMaterialize),
    ];
    for (estimate, strategy) in cases {
        let producer = StreamingAgent::new(6);
        let expected = Value::Array(producer.expected_chunks("s"));
        let scripted = Arc::new(ScriptedAgent::new());
        let (engine, events) = engine(stream_router(producer, scripted.clone()), EngineConfig::default());
        let source = Node::new("s", "stream")
            .with_config(NodeConfig::new("stream").with_estimated_output_bytes(estimate));
        let graph = fan_out_graph(source, 4);

        let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

        assert_run_status(&result, RunStatus::Completed);
        assert_eq!(result.node("s").unwrap().strategy, Some(strategy));
        assert!(matches!(result.output("s"), Some(NodeOutput::Stream { .. })));
        for i in 0..4 {
            assert_eq!(scripted.invocations_of(&format!("c{i}"))[0].inputs["in"], expected);
        }
        let selected = events.events_for_node("s");
        assert!(selected
            .iter()
            .any(|e| e.event_type == names::STRATEGY_SELECTED && e.data["strategy"] == json!(strategy)));
    }
}

#[tokio::test]
async fn test_stream_without_consumers_is_collected() {
    let producer = StreamingAgent::new(3);
    let expected = Value::Array(producer.expected_chunks("s"));
    let (engine, _) = engine(
        stream_router(producer, Arc::new(ScriptedAgent::new())),
        EngineConfig::default(),
    );
    let graph = ExecutionGraph::new(vec![Node::new("s", "stream")], vec![]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_eq!(result.output("s").and_then(NodeOutput::inline_value), Some(&expected));
    assert_eq!(result.state.context.get("s"), Some(&expected));
}

#[tokio::test]
async fn test_faulting_stream_fails_the_consumer() {
    let producer = StreamingAgent::new(10).with_fault_after(4);
    let scripted = Arc::new(ScriptedAgent::new());
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::Continue);
    let (engine, _) = engine(stream_router(producer, scripted), config);
    let graph = fan_out_graph(Node::new("s", "stream"), 2);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::CompletedWithErrors);
    assert_node_status(&result, "s", NodeStatus::Success);
    assert_node_status(&result, "c0", NodeStatus::Error);
    assert_node_status(&result, "c1", NodeStatus::Error);
    // Streamed inputs cannot be replayed, so no retries.
    assert_eq!(result.node("c0").unwrap().retry_count, 0);
}

#[tokio::test]
async fn test_continue_policy_skips_dependents() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail("summarize", "model overloaded"));
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::Continue);
    let (engine, events) = engine(failing, config);
    let graph = linear_graph(&["fetch", "summarize", "review"]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::CompletedWithErrors);
    assert_node_status(&result, "fetch", NodeStatus::Success);
    assert_node_status(&result, "summarize", NodeStatus::Error);
    assert_node_status(&result, "review", NodeStatus::Skipped);
    assert!(scripted.invocations_of("review").is_empty());
    assert_eq!(result.failures.failed_nodes, 1);
    assert_eq!(result.failures.skipped_nodes, vec!["review".to_string()]);
    assert_eq!(events.events_of_type(names::NODE_SKIPPED).len(), 1);
}

#[tokio::test]
async fn test_continue_policy_keeps_independent_branches() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail("b", "boom"));
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::Continue);
    let (engine, _) = engine(failing, config);

    let result = engine.run(&diamond_graph(), &RunInputs::new()).await.unwrap();

    assert_node_status(&result, "b", NodeStatus::Error);
    assert_node_status(&result, "c", NodeStatus::Success);
    assert_node_status(&result, "d", NodeStatus::Skipped);
}

#[tokio::test]
async fn test_stop_policy_aborts_before_review() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail("summarize", "model overloaded"));
    let (engine, _) = engine(failing, EngineConfig::default());
    let graph = linear_graph(&["fetch", "summarize", "review"]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    assert_node_status(&result, "fetch", NodeStatus::Success);
    assert_node_status(&result, "summarize", NodeStatus::Error);
    assert_node_status(&result, "review", NodeStatus::Pending);
    assert!(scripted.invocations_of("review").is_empty());
    assert!(result.error.unwrap().contains("summarize"));
}

#[tokio::test]
async fn test_retry_policy_recovers_transient_failures() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail_times("summarize", 2));
    let retry = RetryConfig::new().with_max_attempts(3).with_base_delay_ms(1);
    let config = EngineConfig::default().with_failure_policy(FailurePolicy::retry(retry, AfterRetry::Stop));
    let (engine, events) = engine(failing.clone(), config);
    let graph = linear_graph(&["fetch", "summarize", "review"]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Completed);
    assert_eq!(result.node("summarize").unwrap().retry_count, 2);
    assert_eq!(failing.attempts("summarize"), 3);
    assert_eq!(events.events_of_type(names::NODE_RETRYING).len(), 2);
    // Retries replay the recorded inputs.
    assert_eq!(scripted.invocations_of("summarize")[0].inputs["in"]["node"], "fetch");
}

#[tokio::test]
async fn test_retry_exhaustion_falls_back_to_continue() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted).fail_times("summarize", 10));
    let retry = RetryConfig::new().with_max_attempts(2).with_base_delay_ms(1);
    let config =
        EngineConfig::default().with_failure_policy(FailurePolicy::retry(retry, AfterRetry::Continue));
    let (engine, _) = engine(failing.clone(), config);

    let result = engine
        .run(&linear_graph(&["fetch", "summarize", "review"]), &RunInputs::new())
        .await
        .unwrap();

    assert_run_status(&result, RunStatus::CompletedWithErrors);
    assert_eq!(failing.attempts("summarize"), 2);
    assert_eq!(result.failures.failures[0].attempts, 2);
    assert_node_status(&result, "review", NodeStatus::Skipped);
}

#[tokio::test]
async fn test_node_timeout_is_a_node_failure() {
    let scripted = Arc::new(ScriptedAgent::new());
    let slow = Arc::new(SlowAgent::new(scripted, Duration::from_secs(5)));
    let (engine, _) = engine(slow, EngineConfig::default());
    let graph = ExecutionGraph::new(
        vec![Node::new("slow", "echo").with_config(NodeConfig::new("echo").with_timeout_ms(30))],
        vec![],
    );

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&result, RunStatus::Failed);
    let node = result.node("slow").unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert_eq!(node.error_kind, Some(crate::errors::ErrorKind::NodeExecution));
}

#[tokio::test]
async fn test_pool_bounds_concurrency() {
    let scripted = Arc::new(ScriptedAgent::new());
    let slow = Arc::new(SlowAgent::new(scripted, Duration::from_millis(40)));
    let recording = Arc::new(RecordingAgent::new(slow));
    let config = EngineConfig::default().with_max_concurrency(2);
    let (engine, _) = engine(recording.clone(), config);
    let nodes = (0..4).map(|i| Node::new(format!("n{i}"), "echo")).collect();
    let graph = ExecutionGraph::new(nodes, vec![]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();
    assert_run_status(&result, RunStatus::Completed);

    let spans = recording.spans();
    let max_overlap = spans
        .iter()
        .map(|(_, span)| {
            spans
                .iter()
                .filter(|(_, other)| other.started <= span.started && other.finished > span.started)
                .count()
        })
        .max()
        .unwrap();
    assert!(max_overlap <= 2, "{max_overlap} nodes ran at once");
}

#[tokio::test]
async fn test_node_effects_compensate_newest_first() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let scripted = Arc::new(
        ScriptedAgent::new().with_effects("n", vec![reversible("A"), reversible("B"), reversible("C")]),
    );
    let (engine, _) = engine_with(scripted, EngineConfig::default(), |b| {
        b.compensation_handler(MatchRule::operation("doc.*"), logging_handler(log.clone()))
    });
    let graph = ExecutionGraph::new(vec![Node::new("n", "echo")], vec![]);

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();
    assert_eq!(engine.ledger().entries_for_run(result.run_id).len(), 3);

    let report = engine.compensate_node("n").await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.compensated(), 3);
    assert_eq!(*log.lock(), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_cancellation_rolls_back_run_effects() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let scripted =
        Arc::new(ScriptedAgent::new().with_effects("a", vec![reversible("first"), reversible("second")]));
    let slow = Arc::new(SlowAgent::new(scripted, Duration::ZERO).with_node_delay("b", Duration::from_secs(10)));
    let (engine, events) = engine_with(slow, EngineConfig::default(), |b| {
        b.compensation_handler(MatchRule::operation("doc.create"), logging_handler(log.clone()))
    });
    let graph = linear_graph(&["a", "b", "c"]);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel("user pressed stop");
    });

    let result = engine
        .run_with_token(&graph, &RunInputs::new(), &RunOptions::new(), &token)
        .await
        .unwrap();

    assert_run_status(&result, RunStatus::Cancelled);
    assert_node_status(&result, "a", NodeStatus::Success);
    assert_node_status(&result, "b", NodeStatus::Cancelled);
    assert_node_status(&result, "c", NodeStatus::Cancelled);
    let report = result.compensation.unwrap();
    assert_eq!(report.compensated(), 2);
    assert_eq!(*log.lock(), vec!["second", "first"]);
    assert_eq!(events.events_of_type(names::RUN_CANCELLED).len(), 1);
    assert!(result.snapshot_id.is_some());
}

#[tokio::test]
async fn test_resume_reruns_only_unfinished_nodes() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail_times("b", 1));
    let (engine, _) = engine(failing, EngineConfig::default());
    let graph = linear_graph(&["a", "b", "c"]);

    let first = engine.run(&graph, &RunInputs::new()).await.unwrap();
    assert_run_status(&first, RunStatus::Failed);
    let snapshot_id = first.snapshot_id.unwrap();

    let resumed = engine.resume(&graph, snapshot_id).await.unwrap();

    assert_run_status(&resumed, RunStatus::Completed);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(scripted.invocations_of("a").len(), 1);
    assert_eq!(scripted.invocations_of("b").len(), 1);
    assert_eq!(scripted.invocations_of("c").len(), 1);
    assert_eq!(scripted.invocations_of("b")[0].inputs["in"]["node"], "a");
}

#[tokio::test]
async fn test_cancelled_resume_keeps_effects_from_before_the_resume() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let scripted = Arc::new(ScriptedAgent::new().with_effects("a", vec![reversible("draft")]));
    let slow = Arc::new(SlowAgent::new(scripted, Duration::ZERO).with_node_delay("b", Duration::from_secs(10)));
    // b fails fast on its first call and only reaches the slow agent on resume.
    let failing = Arc::new(FailingAgent::new(slow).fail_times("b", 1));
    let (engine, _) = engine_with(failing, EngineConfig::default(), |b| {
        b.compensation_handler(MatchRule::operation("doc.create"), logging_handler(log.clone()))
    });
    let graph = linear_graph(&["a", "b", "c"]);

    let first = engine.run(&graph, &RunInputs::new()).await.unwrap();
    assert_run_status(&first, RunStatus::Failed);
    let snapshot_id = first.snapshot_id.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel("user pressed stop");
    });
    let resumed = engine
        .resume_with_token(&graph, snapshot_id, &RunOptions::new(), &token)
        .await
        .unwrap();

    assert_run_status(&resumed, RunStatus::Cancelled);
    assert_node_status(&resumed, "a", NodeStatus::Success);
    assert_eq!(resumed.compensation.unwrap().compensated(), 0);
    assert!(log.lock().is_empty());
    assert_eq!(engine.ledger().entries_for_run(first.run_id).len(), 1);
}

#[tokio::test]
async fn test_failure_policy_can_differ_per_run() {
    let scripted = Arc::new(ScriptedAgent::new());
    let failing = Arc::new(FailingAgent::new(scripted.clone()).fail("b", "boom"));
    let (engine, _) = engine(failing, EngineConfig::default());
    let graph = diamond_graph();

    let lenient = engine
        .run_with(
            &graph,
            &RunInputs::new(),
            &RunOptions::new().with_failure_policy(FailurePolicy::Continue),
        )
        .await
        .unwrap();
    let strict = engine.run(&graph, &RunInputs::new()).await.unwrap();

    assert_run_status(&lenient, RunStatus::CompletedWithErrors);
    assert_node_status(&lenient, "d", NodeStatus::Skipped);
    assert_run_status(&strict, RunStatus::Failed);
    assert_eq!(engine.config().scheduler.failure_policy, FailurePolicy::Stop);
}

#[tokio::test]
async fn test_manual_restore_exposes_one_effect_at_a_time() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let irreversible = SideEffect::new(
        "email.send",
        "Y",
        CompensationDescriptor::irreversible(["Email the customer a correction"]),
    );
    let scripted = Arc::new(ScriptedAgent::new().with_effects("b", vec![reversible("X"), irreversible]));
    let (engine, _) = engine_with(scripted, EngineConfig::default(), |b| {
        b.compensation_handler(MatchRule::operation("doc.create"), logging_handler(log.clone()))
    });

    let result = engine
        .run(&linear_graph(&["a", "b"]), &RunInputs::new())
        .await
        .unwrap();
    let snapshots = engine.checkpoints().list(result.run_id).await.unwrap();
    let after_a = snapshots[0].snapshot_id;

    let restore = engine.restore(after_a, CompensationStrategy::Manual).await.unwrap();
    let listed: Vec<_> = restore
        .pending_effects
        .iter()
        .map(|e| e.effect.description.as_str())
        .collect();
    assert_eq!(listed, vec!["Y", "X"]);

    let first = engine.next_pending_effect(after_a).await.unwrap().unwrap();
    assert_eq!(first.effect.description, "Y");
    let outcome = engine.compensate_effect(first.effect_id).await.unwrap();
    assert!(outcome.requires_user_action);
    assert_eq!(outcome.manual_steps, vec!["Email the customer a correction"]);

    let second = engine.next_pending_effect(after_a).await.unwrap().unwrap();
    assert_eq!(second.effect.description, "X");
    assert!(engine.compensate_effect(second.effect_id).await.unwrap().success);

    assert!(engine.next_pending_effect(after_a).await.unwrap().is_none());
    assert_eq!(*log.lock(), vec!["X"]);
    assert_eq!(engine.ledger().pending_user_actions().len(), 1);
}

#[tokio::test]
async fn test_automatic_restore_compensates_after_snapshot() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let scripted = Arc::new(
        ScriptedAgent::new()
            .with_effects("a", vec![reversible("kept")])
            .with_effects("b", vec![reversible("undone-1"), reversible("undone-2")]),
    );
    let (engine, _) = engine_with(scripted, EngineConfig::default(), |b| {
        b.compensation_handler(MatchRule::any(), logging_handler(log.clone()))
    });

    let result = engine
        .run(&linear_graph(&["a", "b"]), &RunInputs::new())
        .await
        .unwrap();
    let after_a = engine.checkpoints().list(result.run_id).await.unwrap()[0].snapshot_id;

    let restore = engine.restore(after_a, CompensationStrategy::Automatic).await.unwrap();

    assert!(restore.is_clean());
    assert_eq!(*log.lock(), vec!["undone-2", "undone-1"]);
}

#[tokio::test]
async fn test_teed_stream_resurrects_after_run() {
    let producer = StreamingAgent::new(5);
    let expected = producer.expected_chunks("s");
    let source = Node::new("s", "stream")
        .with_config(NodeConfig::new("stream").with_param("model", json!("small")));
    let graph = fan_out_graph(source.clone(), 2);
    let provider = Arc::new(StaticStateProvider::from_graph(&graph, HashMap::new()));
    let (engine, events) = engine_with(
        stream_router(producer, Arc::new(ScriptedAgent::new())),
        EngineConfig::default(),
        |b| b.state_provider(provider.clone()),
    );

    let result = engine.run(&graph, &RunInputs::new()).await.unwrap();
    let stream_id = result.output("s").and_then(NodeOutput::stream_id).unwrap();
    assert_eq!(engine.streams().active_count(), 0);

    let reader = engine.streams().acquire_reader(stream_id, 0).await.unwrap();
    assert_eq!(reader.provenance().severity, StalenessSeverity::Fresh);
    assert_eq!(reader.collect_chunks().await.unwrap(), expected);

    provider.set_node(source.with_config(NodeConfig::new("stream").with_param("model", json!("large"))));
    let reader = engine.streams().acquire_reader(stream_id, 1).await.unwrap();
    assert_eq!(reader.provenance().severity, StalenessSeverity::Major);
    assert_eq!(reader.provenance().source, ChunkSource::Regenerated);
    assert!(reader.provenance().is_degraded());
    assert_eq!(reader.collect_chunks().await.unwrap(), expected);
    assert_eq!(events.events_of_type(names::STREAM_DEGRADED).len(), 1);
}

#[tokio::test]
async fn test_recommendations_lower_tee_threshold() {
    let scripted = Arc::new(ScriptedAgent::new().respond("a", json!({"text": "x".repeat(400)})));
    let config = EngineConfig {
        monitor: MonitorConfig {
            min_samples: 2,
            tee_buffer_budget_bytes: 100,
            ..MonitorConfig::default()
        },
        ..EngineConfig::default()
    };
    let (engine, _) = engine(scripted, config);
    let graph = fan_out_graph(Node::new("a", "echo"), 2);

    for _ in 0..3 {
        let result = engine.run(&graph, &RunInputs::new()).await.unwrap();
        assert_eq!(result.node("a").unwrap().strategy, Some(StreamingStrategy::StreamTee));
    }
    let applied = engine.apply_recommendations();

    assert_eq!(applied.len(), 1);
    assert_eq!(engine.thresholds().tee_threshold_bytes, 100);
    assert!(engine.apply_recommendations().is_empty());
}

//! End-to-end engine scenarios against scripted capabilities.

use async_trait::async_trait;
use scribe_core::capability::{
    ActionResult, Capability, CapabilityRegistry, CapabilityReply, CapabilityRequest,
};
use scribe_core::engine::{Engine, RunSnapshot};
use scribe_core::error::{EngineError, ErrorClass};
use scribe_core::event::{EventPayload, EventRecord, RunFinishReason};
use scribe_core::node::{ActionName, NodeStatus, TaskType};
use scribe_core::scripted::{OfflineAggregator, ScriptedCapability};
use scribe_core::{NodeOutcome, ScribeConfig, SubtaskSpec};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn base_config() -> ScribeConfig {
    ScribeConfig::default().with_retries(3, 10)
}

fn events_of(engine: &Engine) -> Vec<Arc<EventRecord>> {
    engine.bus().snapshot(0)
}

fn tags(events: &[Arc<EventRecord>]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.tag()).collect()
}

/// Writer that sleeps before answering, for parallelism timing tests.
struct SlowWriter {
    delay: Duration,
}

#[async_trait]
impl Capability for SlowWriter {
    fn name(&self) -> &str {
        "writer"
    }

    async fn invoke(&self, request: CapabilityRequest) -> CapabilityReply {
        tokio::time::sleep(self.delay).await;
        ActionResult::Write {
            text: format!("{}.", request.goal),
        }
        .into()
    }
}

#[tokio::test]
async fn trivial_execute_finishes_root_directly() {
    let registry = CapabilityRegistry::new().with(
        ScriptedCapability::new("planner")
            .on(
                "0",
                ActionName::Plan,
                ActionResult::Write {
                    text: "The cat sat.".into(),
                },
            )
            .build(),
    );

    let engine = Engine::new(
        "run-trivial",
        "Write the single sentence: The cat sat.",
        base_config(),
        registry,
    )
    .unwrap();

    let result = engine.run_until_done().await.unwrap();
    assert_eq!(result, "The cat sat.");

    let events = events_of(&engine);
    let tags = tags(&events);
    assert_eq!(tags.first(), Some(&"run_started"));
    assert_eq!(tags.last(), Some(&"run_finished"));
    assert_eq!(tags.iter().filter(|t| **t == "step_started").count(), 1);
    assert_eq!(tags.iter().filter(|t| **t == "step_finished").count(), 1);
    assert_eq!(
        tags.iter().filter(|t| **t == "node_result_available").count(),
        1
    );
    match &events.last().unwrap().payload {
        EventPayload::RunFinished { reason, .. } => {
            assert_eq!(*reason, RunFinishReason::Success)
        }
        other => panic!("expected run_finished, got {other:?}"),
    }
}

#[tokio::test]
async fn two_level_plan_executes_children_in_dependency_order() {
    let plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "intro"),
            SubtaskSpec::new(TaskType::Composition, "body").depends_on(0),
            SubtaskSpec::new(TaskType::Composition, "ending").depends_on(1),
        ],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, plan)
                .build(),
        )
        .with(
            ScriptedCapability::new("writer")
                .with_default(|request| {
                    ActionResult::Write {
                        text: format!("{}.", request.goal),
                    }
                    .into()
                })
                .build(),
        )
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let engine = Engine::new("run-two-level", "story", base_config(), registry).unwrap();
    let result = engine.run_until_done().await.unwrap();
    assert_eq!(result, "intro.\n\nbody.\n\nending.");

    let events = events_of(&engine);

    // Exactly one step pair per child, in nid order.
    let child_steps: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::StepStarted { nid, action: ActionName::Write } => Some(nid.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(child_steps, vec!["0.1", "0.2", "0.3"]);

    // A child never starts before its predecessor's result is available.
    let result_seq = |nid: &str| {
        events
            .iter()
            .find(|e| {
                matches!(&e.payload, EventPayload::NodeResultAvailable { nid: n } if n == nid)
            })
            .map(|e| e.seq)
            .unwrap()
    };
    let step_seq = |nid: &str| {
        events
            .iter()
            .find(|e| matches!(&e.payload, EventPayload::StepStarted { nid: n, .. } if n == nid))
            .map(|e| e.seq)
            .unwrap()
    };
    assert!(result_seq("0.1") < step_seq("0.2"));
    assert!(result_seq("0.2") < step_seq("0.3"));
}

#[tokio::test]
async fn parallel_siblings_run_concurrently() {
    let delay = Duration::from_millis(150);
    let plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "north"),
            SubtaskSpec::new(TaskType::Composition, "south"),
            SubtaskSpec::new(TaskType::Composition, "west"),
        ],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, plan)
                .build(),
        )
        .with(Arc::new(SlowWriter { delay }))
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let config = base_config().with_in_flight_limit(3);
    let engine = Engine::new("run-parallel", "compass", config, registry).unwrap();

    let start = Instant::now();
    engine.run_until_done().await.unwrap();
    let elapsed = start.elapsed();

    // Three sequential children would need at least 450ms.
    assert!(
        elapsed < delay * 3,
        "children did not overlap: {elapsed:?}"
    );

    // All three children start before any of them finishes.
    let events = events_of(&engine);
    let started: Vec<u64> = events
        .iter()
        .filter(|e| {
            matches!(&e.payload, EventPayload::StepStarted { action: ActionName::Write, .. })
        })
        .map(|e| e.seq)
        .collect();
    let first_finished = events
        .iter()
        .find(|e| {
            matches!(&e.payload, EventPayload::StepFinished { action: ActionName::Write, .. })
        })
        .map(|e| e.seq)
        .unwrap();
    assert_eq!(started.len(), 3);
    assert!(started.iter().all(|&s| s < first_finished));
}

#[tokio::test]
async fn transient_errors_retry_until_success() {
    let cache_dir = tempfile::tempdir().unwrap();
    let plan = ActionResult::Plan {
        subtasks: vec![SubtaskSpec::new(TaskType::Composition, "section")],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, plan)
                .build(),
        )
        .with(
            ScriptedCapability::new("writer")
                .on(
                    "0.1",
                    ActionName::Write,
                    ActionResult::error(ErrorClass::Transient, "rate limited"),
                )
                .on(
                    "0.1",
                    ActionName::Write,
                    ActionResult::error(ErrorClass::Transient, "rate limited"),
                )
                .on(
                    "0.1",
                    ActionName::Write,
                    ActionResult::Write {
                        text: "Section text.".into(),
                    },
                )
                .build(),
        )
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let config = base_config().with_cache_dir(cache_dir.path());
    let engine = Engine::new("run-transient", "flaky", config, registry).unwrap();
    let result = engine.run_until_done().await.unwrap();
    assert_eq!(result, "Section text.");

    // Three call pairs for the flaky node, two of them failed.
    let events = events_of(&engine);
    let completions: Vec<Option<String>> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::LlmCallCompleted { nid, error, .. } if nid == "0.1" => {
                Some(error.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(completions.len(), 3);
    assert_eq!(completions.iter().filter(|e| e.is_some()).count(), 2);
    assert!(completions.last().unwrap().is_none());

    // Only successes were persisted.
    let mut cached = Vec::new();
    for prefix in std::fs::read_dir(cache_dir.path().join("llm")).unwrap() {
        for entry in std::fs::read_dir(prefix.unwrap().path()).unwrap() {
            let text = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            cached.push(text);
        }
    }
    assert!(!cached.is_empty());
    for entry in &cached {
        let value: serde_json::Value = serde_json::from_str(entry).unwrap();
        assert_ne!(value["result"]["action"], "error");
    }
}

#[tokio::test]
async fn invalid_plan_is_retried_with_feedback() {
    // First plan has a forward dependency, second is valid.
    let bad_plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "a").depends_on(1),
            SubtaskSpec::new(TaskType::Composition, "b"),
        ],
    };
    let good_plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "a"),
            SubtaskSpec::new(TaskType::Composition, "b").depends_on(0),
        ],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, bad_plan)
                .on("0", ActionName::Plan, good_plan)
                .build(),
        )
        .with(
            ScriptedCapability::new("writer")
                .with_default(|request| {
                    ActionResult::Write {
                        text: format!("{}.", request.goal),
                    }
                    .into()
                })
                .build(),
        )
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let engine = Engine::new("run-validation", "retry plan", base_config(), registry).unwrap();
    engine.run_until_done().await.unwrap();

    let events = events_of(&engine);
    let plan_received = events
        .iter()
        .filter(|e| matches!(&e.payload, EventPayload::PlanReceived { .. }))
        .count();
    assert_eq!(plan_received, 2);

    let built = events
        .iter()
        .filter(|e| matches!(&e.payload, EventPayload::InnerGraphBuilt { .. }))
        .count();
    assert_eq!(built, 1);

    // The rejected attempt sent the plan node back to READY.
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::StepFinished {
            action: ActionName::Plan,
            status: NodeStatus::Ready,
            ..
        }
    )));

    // Only the valid children exist.
    let arena = engine.arena();
    let arena = arena.read();
    assert_eq!(arena.len(), 3);
    arena.check_invariants().unwrap();
}

#[tokio::test]
async fn mutually_dependent_children_deadlock() {
    let registry = CapabilityRegistry::new();
    let engine = Engine::new("run-deadlock", "stuck", base_config(), registry).unwrap();

    // Fault injection: a plan whose two children each depend on the other,
    // constructed directly on the arena, bypassing validation.
    {
        let arena = engine.arena();
        let mut arena = arena.write();
        let root = arena.root();
        arena.advance_readiness();
        arena.set_status(root, NodeStatus::Doing);
        let application = arena
            .apply_plan(
                root,
                &[
                    SubtaskSpec::new(TaskType::Composition, "a"),
                    SubtaskSpec::new(TaskType::Composition, "b"),
                ],
                4,
            )
            .unwrap();
        arena.set_status(root, NodeStatus::PlanDone);
        arena.inject_edge_unchecked(application.added[0], application.added[1]);
        arena.inject_edge_unchecked(application.added[1], application.added[0]);
    }

    let err = engine.run_until_done().await.unwrap_err();
    match err {
        EngineError::Deadlock { nid } => assert_eq!(nid, "0"),
        other => panic!("expected deadlock, got {other}"),
    }

    let events = events_of(&engine);
    match &events.last().unwrap().payload {
        EventPayload::RunFinished {
            reason,
            error_kind,
            failing_node_nid,
            ..
        } => {
            assert_eq!(*reason, RunFinishReason::Error);
            assert_eq!(error_kind.as_deref(), Some("deadlock"));
            assert_eq!(failing_node_nid.as_deref(), Some("0"));
        }
        other => panic!("expected run_finished, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_stops_picking_new_work() {
    let plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "one"),
            SubtaskSpec::new(TaskType::Composition, "two").depends_on(0),
            SubtaskSpec::new(TaskType::Composition, "three").depends_on(1),
        ],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, plan)
                .build(),
        )
        .with(Arc::new(SlowWriter {
            delay: Duration::from_millis(100),
        }))
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let engine = Arc::new(
        Engine::new("run-cancel", "long story", base_config(), registry).unwrap(),
    );
    let cancel = engine.cancel_flag();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_until_done().await })
    };
    // Let the first child get in flight, then cancel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.store(true, std::sync::atomic::Ordering::Relaxed);

    let outcome = runner.await.unwrap();
    assert!(matches!(outcome, Err(EngineError::Cancelled)));

    let events = events_of(&engine);
    match &events.last().unwrap().payload {
        EventPayload::RunFinished { reason, .. } => {
            assert_eq!(*reason, RunFinishReason::Cancelled)
        }
        other => panic!("expected run_finished, got {other:?}"),
    }

    // Not all children ran.
    let write_steps = events
        .iter()
        .filter(|e| {
            matches!(&e.payload, EventPayload::StepStarted { action: ActionName::Write, .. })
        })
        .count();
    assert!(write_steps < 3, "cancellation picked all children anyway");
}

#[tokio::test]
async fn post_reflect_revises_the_draft() {
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on(
                    "0",
                    ActionName::Plan,
                    ActionResult::Write {
                        text: "rough draft".into(),
                    },
                )
                .build(),
        )
        .with(
            ScriptedCapability::new("writer")
                .on(
                    "0",
                    ActionName::Reflect,
                    ActionResult::Write {
                        text: "polished text".into(),
                    },
                )
                .build(),
        );

    let config = base_config().with_post_reflect(true);
    let engine = Engine::new("run-reflect", "polish", config, registry).unwrap();
    let result = engine.run_until_done().await.unwrap();
    assert_eq!(result, "polished text");

    let events = events_of(&engine);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::NodeStatusChanged {
            new: NodeStatus::NeedPostReflect,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::StepFinished {
            action: ActionName::Reflect,
            status: NodeStatus::Finished,
            ..
        }
    )));
}

#[tokio::test]
async fn snapshot_round_trip_preserves_graph_and_result() {
    let plan = ActionResult::Plan {
        subtasks: vec![
            SubtaskSpec::new(TaskType::Composition, "alpha"),
            SubtaskSpec::new(TaskType::Composition, "beta").depends_on(0),
        ],
    };
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("planner")
                .on("0", ActionName::Plan, plan)
                .build(),
        )
        .with(
            ScriptedCapability::new("writer")
                .with_default(|request| {
                    ActionResult::Write {
                        text: format!("{}.", request.goal),
                    }
                    .into()
                })
                .build(),
        )
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let engine = Engine::new("run-snapshot", "persist me", base_config(), registry.clone())
        .unwrap();
    let result = engine.run_until_done().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    engine.save_snapshot(dir.path()).unwrap();
    assert!(scribe_store::is_done(dir.path()));

    let loaded = Engine::load(dir.path(), registry).unwrap();
    assert_eq!(loaded.run_id(), "run-snapshot");

    // Serialized graphs are identical.
    let original = serde_json::to_string(&*engine.arena().read()).unwrap();
    let restored = serde_json::to_string(&*loaded.arena().read()).unwrap();
    assert_eq!(original, restored);

    // Continuing a finished run reproduces the result without new work.
    let replayed = loaded.run_until_done().await.unwrap();
    assert_eq!(replayed, result);
    let steps = events_of(&loaded)
        .iter()
        .filter(|e| matches!(&e.payload, EventPayload::StepStarted { .. }))
        .count();
    assert_eq!(steps, 0);
}

#[tokio::test]
async fn interrupted_run_resumes_from_snapshot() {
    // Build a half-finished run by hand: plan applied, first child done,
    // second child still pending, one node stuck in DOING.
    let registry = CapabilityRegistry::new()
        .with(
            ScriptedCapability::new("writer")
                .with_default(|request| {
                    ActionResult::Write {
                        text: format!("{}.", request.goal),
                    }
                    .into()
                })
                .build(),
        )
        .with(Arc::new(OfflineAggregator::new("aggregator")));

    let dir = tempfile::tempdir().unwrap();
    {
        let mut arena = scribe_core::NodeArena::new("resume me", TaskType::Composition);
        let root = arena.root();
        arena.advance_readiness();
        arena.set_status(root, NodeStatus::Doing);
        let application = arena
            .apply_plan(
                root,
                &[
                    SubtaskSpec::new(TaskType::Composition, "alpha"),
                    SubtaskSpec::new(TaskType::Composition, "beta").depends_on(0),
                ],
                4,
            )
            .unwrap();
        arena.set_status(root, NodeStatus::PlanDone);
        arena
            .record_outcome(
                application.added[0],
                NodeOutcome::Text { text: "alpha.".into() },
                NodeStatus::Finished,
            )
            .unwrap();
        // Simulate a crash mid-call on the second child.
        arena.set_status(application.added[1], NodeStatus::Doing);

        let snapshot = RunSnapshot {
            run_id: "run-resume".into(),
            config: base_config(),
            arena: arena.clone(),
        };
        let memory = scribe_core::Memory::state(&arena);
        let article = scribe_core::Memory::running_article(&arena);
        scribe_store::save_snapshot(dir.path(), &snapshot, &memory, &article, false).unwrap();
    }

    let engine = Engine::load(dir.path(), registry).unwrap();
    let result = engine.run_until_done().await.unwrap();
    assert_eq!(result, "alpha.\n\nbeta.");
}

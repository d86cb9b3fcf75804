//! Orchestrator Integration Tests
//!
//! Run lifecycle scenarios: start, suspend on a manual action, resolve and
//! re-execute, failure handling, operator pause/resume and crash recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huntarr::core::{
    ExecutionLimits, NodeContext, NodeError, NodeOutcome, NodeRegistry, Orchestrator,
    OrchestratorError, OrchestratorSettings, PipelineNode, RetryPolicy, TickOutcome,
};
use huntarr::domain::{
    ManualActionFilter, ManualActionRequest, ManualActionStatus, MetricDeltas, RunMode, RunStatus,
    SearchConfig,
};
use huntarr::store::Store;
use serde_json::json;
use tokio::sync::Notify;

/// Advances to `next` and records how often it ran
struct Forward {
    name: &'static str,
    next: &'static str,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl PipelineNode for Forward {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.set("visited", &self.name)?;
        Ok(NodeOutcome::advance_with(self.next, MetricDeltas::discovered(1)))
    }
}

/// Suspends until a resolved action is handed back, then completes
struct Gate {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl PipelineNode for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match &ctx.resumed_action {
            Some(action) => {
                ctx.info("gate_cleared", format!("Cleared by {}", action.id));
                Ok(NodeOutcome::Complete(MetricDeltas::applied(1)))
            }
            None => Ok(NodeOutcome::Suspend(
                ManualActionRequest::new("captcha")
                    .for_job("job-1", "Acme", "Rust Engineer")
                    .with_details(json!({ "reason": "captcha_detected" })),
            )),
        }
    }
}

/// Completes the run
struct Finish;

#[async_trait]
impl PipelineNode for Finish {
    fn name(&self) -> &str {
        "finish"
    }

    async fn execute(&self, _ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::Complete(MetricDeltas::default()))
    }
}

/// Signals once it is running, then waits to be released before advancing
struct Hold {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl PipelineNode for Hold {
    fn name(&self) -> &str {
        "hold"
    }

    async fn execute(&self, _ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(NodeOutcome::advance("gate"))
    }
}

struct Broken;

#[async_trait]
impl PipelineNode for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        ctx.info("about_to_fail", "Trying the portal");
        Err(NodeError::msg("portal returned garbage"))
    }
}

struct Counters {
    start: Arc<AtomicUsize>,
    gate: Arc<AtomicUsize>,
}

fn gated_registry() -> (NodeRegistry, Counters) {
    let counters = Counters {
        start: Arc::new(AtomicUsize::new(0)),
        gate: Arc::new(AtomicUsize::new(0)),
    };
    let registry = NodeRegistry::builder()
        .node(Forward {
            name: "start",
            next: "gate",
            runs: Arc::clone(&counters.start),
        })
        .node(Gate {
            runs: Arc::clone(&counters.gate),
        })
        .entry("start")
        .build()
        .unwrap();
    (registry, counters)
}

fn manual_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        auto_drive: false,
        session_url: Some("http://localhost:7900".to_string()),
        ..Default::default()
    }
}

fn orchestrator(registry: NodeRegistry) -> Arc<Orchestrator> {
    Orchestrator::new(
        Arc::new(Store::open_in_memory().unwrap()),
        registry,
        manual_settings(),
    )
}

#[tokio::test]
async fn test_scenario_a_first_tick_starts_run() {
    let (registry, _) = gated_registry();
    let orch = orchestrator(registry);

    let run = orch
        .create_run(RunMode::Manual, SearchConfig::from_value(json!({})).unwrap())
        .unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.current_node.is_none());

    let outcome = orch.tick(&run.id).await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Started {
            entry: "start".to_string()
        }
    );

    let run = orch.get_run(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());
    assert_eq!(run.current_node.as_deref(), Some("start"));
}

#[tokio::test]
async fn test_scenario_b_suspend_raises_pending_action() {
    let (registry, counters) = gated_registry();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    let run = orch.run_to_idle(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.current_node.as_deref(), Some("gate"));
    assert_eq!(run.metrics.manual_required, 1);
    assert_eq!(run.metrics.discovered, 1);
    assert!(!run.operator_paused);
    assert_eq!(counters.gate.load(Ordering::SeqCst), 1);

    let filter = ManualActionFilter {
        run_id: Some(run.id.clone()),
        ..Default::default()
    };
    let actions = orch.manual_queue().list(&filter, 10).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, ManualActionStatus::Pending);
    assert_eq!(actions[0].action_type, "captcha");
    assert_eq!(actions[0].node.as_deref(), Some("gate"));
    assert_eq!(actions[0].company.as_deref(), Some("Acme"));
    assert_eq!(run.blocked_by_manual_action.as_deref(), Some(actions[0].id.as_str()));

    // Further ticks are no-ops while blocked
    assert_eq!(orch.tick(&run.id).await.unwrap(), TickOutcome::Idle);
    assert_eq!(counters.gate.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_c_resolve_reexecutes_same_node() {
    let (registry, counters) = gated_registry();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
    let run = orch.run_to_idle(&run.id).await.unwrap();
    let action_id = run.blocked_by_manual_action.clone().unwrap();

    let action = orch
        .resolve_manual_action(&action_id, Some(json!({ "solved_by": "operator" })))
        .unwrap();
    assert_eq!(action.status, ManualActionStatus::Resolved);
    assert!(action.resolved_at.is_some());

    let resumed = orch.get_run(&run.id).unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    assert_eq!(resumed.current_node.as_deref(), Some("gate"));
    assert!(resumed.blocked_by_manual_action.is_none());

    let done = orch.run_to_idle(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.metrics.applied, 1);
    assert_eq!(done.metrics.manual_required, 1);
    assert_eq!(counters.gate.load(Ordering::SeqCst), 2);
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);

    let events = orch.event_log().batch(&run.id, 0, 250).unwrap();
    let cleared = events
        .iter()
        .find(|e| e.event_type == "gate_cleared")
        .unwrap();
    assert!(cleared.message.contains(&action_id));
}

#[tokio::test]
async fn test_scenario_d_node_error_fails_run() {
    let registry = NodeRegistry::builder()
        .node(Broken)
        .entry("broken")
        .build()
        .unwrap();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    let run = orch.run_to_idle(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("portal returned garbage"));
    assert!(run.completed_at.is_some());

    // Events emitted before the error are kept, and the failure is last
    let events = orch.event_log().batch(&run.id, 0, 250).unwrap();
    assert!(events.iter().any(|e| e.event_type == "about_to_fail"));
    assert_eq!(events.last().unwrap().event_type, "run_failed");

    assert_eq!(orch.tick(&run.id).await.unwrap(), TickOutcome::Idle);
    assert!(matches!(
        orch.event_log()
            .append(&run.id, huntarr::domain::NewEvent::info("late", "too late")),
        Err(OrchestratorError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_pause_resume_round_trip() {
    let runs = Arc::new(AtomicUsize::new(0));
    let registry = NodeRegistry::builder()
        .node(Forward {
            name: "a",
            next: "b",
            runs: Arc::clone(&runs),
        })
        .node(Forward {
            name: "b",
            next: "a",
            runs: Arc::clone(&runs),
        })
        .entry("a")
        .build()
        .unwrap();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
    orch.tick(&run.id).await.unwrap();
    orch.tick(&run.id).await.unwrap();

    let before = orch.get_run(&run.id).unwrap();
    assert_eq!(before.status, RunStatus::Running);

    let paused = orch.pause(&run.id).unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert!(paused.operator_paused);
    assert_eq!(orch.tick(&run.id).await.unwrap(), TickOutcome::Idle);

    let resumed = orch.resume(&run.id).unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    assert_eq!(resumed.current_node, before.current_node);
    assert_eq!(resumed.metrics, before.metrics);

    let events = orch.event_log().batch(&run.id, 0, 250).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"run_paused"));
    assert_eq!(types.last(), Some(&"run_resumed"));
}

#[tokio::test]
async fn test_control_operations_respect_status() {
    let (registry, _) = gated_registry();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    // Not started yet
    assert!(matches!(
        orch.pause(&run.id),
        Err(OrchestratorError::InvalidState { operation: "pause", .. })
    ));
    assert!(matches!(
        orch.resume(&run.id),
        Err(OrchestratorError::InvalidState { operation: "resume", .. })
    ));

    // Blocked by a manual action: pause records intent, resume is refused
    let run = orch.run_to_idle(&run.id).await.unwrap();
    let paused = orch.pause(&run.id).unwrap();
    assert!(paused.operator_paused);
    match orch.resume(&run.id) {
        Err(OrchestratorError::ManualActionPending { action_id, .. }) => {
            assert_eq!(Some(action_id), run.blocked_by_manual_action);
        }
        other => panic!("expected ManualActionPending, got {:?}", other.map(|r| r.status)),
    }

    // Resolving clears the action but the operator pause still holds
    let action_id = run.blocked_by_manual_action.clone().unwrap();
    orch.resolve_manual_action(&action_id, None).unwrap();
    let still_paused = orch.get_run(&run.id).unwrap();
    assert_eq!(still_paused.status, RunStatus::Paused);
    assert_eq!(orch.tick(&run.id).await.unwrap(), TickOutcome::Idle);

    let resumed = orch.resume(&run.id).unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    let done = orch.run_to_idle(&run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    assert!(matches!(
        orch.pause(&run.id),
        Err(OrchestratorError::InvalidState {
            status: RunStatus::Completed,
            ..
        })
    ));
    assert!(matches!(
        orch.get_run("missing"),
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_recover_reschedules_unfinished_runs() {
    let temp = tempfile::TempDir::new().unwrap();
    let db = temp.path().join("huntarr.db");

    let (interrupted_id, pending_id) = {
        let (registry, _) = gated_registry();
        let orch = Orchestrator::new(
            Arc::new(Store::open(&db).unwrap()),
            registry,
            manual_settings(),
        );
        let interrupted = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
        let blocked = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
        let pending = orch.create_run(RunMode::Scheduled, SearchConfig::default()).unwrap();

        orch.run_to_idle(&blocked.id).await.unwrap();
        let action_id = orch
            .get_run(&blocked.id)
            .unwrap()
            .blocked_by_manual_action
            .unwrap();
        orch.resolve_manual_action(&action_id, None).unwrap();
        orch.run_to_idle(&blocked.id).await.unwrap();

        // Interrupted mid-run: started, not finished
        orch.tick(&interrupted.id).await.unwrap();
        (interrupted.id, pending.id)
    };

    // Restart over the same database with a driving orchestrator
    let (registry, _) = gated_registry();
    let orch = Orchestrator::new(
        Arc::new(Store::open(&db).unwrap()),
        registry,
        OrchestratorSettings::default(),
    );
    assert_eq!(orch.recover().unwrap(), 2);

    for run_id in [&interrupted_id, &pending_id] {
        let mut status = RunStatus::Queued;
        for _ in 0..100 {
            status = orch.get_run(run_id).unwrap().status;
            if status == RunStatus::Paused {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Paused, "run {} did not reach the gate", run_id);
    }
}

#[tokio::test]
async fn test_action_resolved_mid_execution_is_handed_to_next_node() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gate_runs = Arc::new(AtomicUsize::new(0));
    let registry = NodeRegistry::builder()
        .node(Hold {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        })
        .node(Gate {
            runs: Arc::clone(&gate_runs),
        })
        .entry("hold")
        .build()
        .unwrap();
    let orch = orchestrator(registry);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
    orch.tick(&run.id).await.unwrap();

    let ticking = {
        let orch = Arc::clone(&orch);
        let run_id = run.id.clone();
        tokio::spawn(async move { orch.tick(&run_id).await })
    };

    // While "hold" is executing, an operator raises and clears an action
    started.notified().await;
    let action = orch
        .raise_manual_action(&run.id, ManualActionRequest::new("login"))
        .unwrap();
    orch.resolve_manual_action(&action.id, None).unwrap();
    release.notify_one();

    let outcome = ticking.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Advanced {
            from: "hold".to_string(),
            to: "gate".to_string(),
        }
    );
    let run = orch.get_run(&run.id).unwrap();
    assert_eq!(run.resumed_action_id.as_deref(), Some(action.id.as_str()));

    // The gate sees the resolved action and does not suspend again
    assert_eq!(orch.tick(&run.id).await.unwrap(), TickOutcome::Completed);
    assert_eq!(gate_runs.load(Ordering::SeqCst), 1);
    assert!(orch.get_run(&run.id).unwrap().resumed_action_id.is_none());
}

#[tokio::test]
async fn test_driver_outlasts_storage_failures() {
    let temp = tempfile::TempDir::new().unwrap();
    let db = temp.path().join("huntarr.db");
    let store = Arc::new(Store::open(&db).unwrap());

    // Every attempt to record the first advance fails until the trigger goes
    let side = rusqlite::Connection::open(&db).unwrap();
    side.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
    side.execute_batch(
        "CREATE TRIGGER reject_advance BEFORE INSERT ON run_events
         WHEN NEW.event_type = 'node_advanced'
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();

    let start_runs = Arc::new(AtomicUsize::new(0));
    let registry = NodeRegistry::builder()
        .node(Forward {
            name: "start",
            next: "finish",
            runs: Arc::clone(&start_runs),
        })
        .node(Finish)
        .entry("start")
        .build()
        .unwrap();
    let settings = OrchestratorSettings {
        limits: ExecutionLimits {
            commit_retry: RetryPolicy {
                max_attempts: 2,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let orch = Orchestrator::new(store, registry, settings);
    let run = orch.create_run(RunMode::Scheduled, SearchConfig::default()).unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let stuck = orch.get_run(&run.id).unwrap();
    assert_eq!(stuck.status, RunStatus::Running);
    assert_eq!(stuck.current_node.as_deref(), Some("start"));
    assert!(start_runs.load(Ordering::SeqCst) > 1, "driver gave up after one failed tick");

    side.execute_batch("DROP TRIGGER reject_advance;").unwrap();

    let mut status = stuck.status;
    for _ in 0..100 {
        status = orch.get_run(&run.id).unwrap().status;
        if status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(orch.get_run(&run.id).unwrap().metrics.discovered, 1);
}

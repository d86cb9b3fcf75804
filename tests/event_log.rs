//! Event Log Integration Tests
//!
//! Id allocation under concurrent appends, cursor pagination and live
//! tailing while a run is being driven.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use huntarr::core::{
    NodeContext, NodeError, NodeOutcome, NodeRegistry, Orchestrator, OrchestratorSettings,
    PipelineNode,
};
use huntarr::domain::{MetricDeltas, NewEvent, RunEvent, RunMode, SearchConfig};
use huntarr::store::Store;

/// Emits `count` progress events, then completes
struct Chatty {
    count: usize,
}

#[async_trait]
impl PipelineNode for Chatty {
    fn name(&self) -> &str {
        "chatty"
    }

    async fn execute(&self, ctx: &mut NodeContext) -> Result<NodeOutcome, NodeError> {
        for i in 0..self.count {
            ctx.info("progress", format!("step {}", i));
        }
        Ok(NodeOutcome::Complete(MetricDeltas::none()))
    }
}

fn orchestrator(auto_drive: bool) -> Arc<Orchestrator> {
    let registry = NodeRegistry::builder()
        .node(Chatty { count: 20 })
        .entry("chatty")
        .build()
        .unwrap();
    let settings = OrchestratorSettings {
        auto_drive,
        ..Default::default()
    };
    Orchestrator::new(Arc::new(Store::open_in_memory().unwrap()), registry, settings)
}

fn assert_contiguous(events: &[RunEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.id, i as i64 + 1, "gap or duplicate at position {}", i);
    }
}

#[test]
fn test_scenario_e_concurrent_appends_get_sequential_ids() {
    let orch = orchestrator(false);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let log = Arc::clone(orch.event_log());
            let run_id = run.id.clone();
            std::thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        log.append(&run_id, NewEvent::info("audit", format!("{}-{}", writer, i)))
                            .unwrap()
                            .id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for writer in writers {
        for id in writer.join().unwrap() {
            assert!(ids.insert(id), "id {} handed out twice", id);
        }
    }
    assert_eq!(ids.len(), 200);

    // run_created + 200 appends, no gaps
    let events = orch.event_log().batch(&run.id, 0, 250).unwrap();
    assert_eq!(events.len(), 201);
    assert_contiguous(&events);
}

#[tokio::test]
async fn test_cursor_polling_is_disjoint_and_complete() {
    let orch = orchestrator(false);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();
    orch.run_to_idle(&run.id).await.unwrap();

    let log = orch.event_log();
    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let page = log.batch(&run.id, cursor, 7).unwrap();
        if page.is_empty() {
            break;
        }
        assert!(page.len() <= 7);
        cursor = page.last().unwrap().id;
        seen.extend(page);
    }

    // run_created, run_started, 20 progress, run_completed
    assert_eq!(seen.len(), 23);
    assert_contiguous(&seen);
    assert_eq!(seen.last().unwrap().event_type, "run_completed");
}

#[tokio::test]
async fn test_batch_of_unknown_run_is_not_found() {
    let orch = orchestrator(false);
    assert!(orch.event_log().batch("missing", 0, 10).is_err());
}

#[tokio::test]
async fn test_tail_sees_every_event_of_a_driven_run() {
    let orch = orchestrator(false);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    let tail = orch.event_log().tail(&run.id, 0).unwrap();
    let collector = tokio::spawn(async move { tail.collect::<Vec<RunEvent>>().await });

    orch.run_to_idle(&run.id).await.unwrap();

    let events = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("tail did not end after the run completed")
        .unwrap();
    assert_eq!(events.len(), 23);
    assert_contiguous(&events);
    assert_eq!(orch.event_log().live_channels(), 0);
}

#[tokio::test]
async fn test_two_tails_agree_on_order() {
    let orch = orchestrator(true);
    let run = orch.create_run(RunMode::Manual, SearchConfig::default()).unwrap();

    let first = orch.event_log().tail(&run.id, 0).unwrap();
    let second = orch.event_log().tail(&run.id, 5).unwrap();

    let (a, b) = tokio::time::timeout(
        Duration::from_secs(5),
        futures::future::join(first.collect::<Vec<_>>(), second.collect::<Vec<_>>()),
    )
    .await
    .unwrap();

    assert_contiguous(&a);
    let a_ids: Vec<i64> = a.iter().map(|e| e.id).filter(|id| *id > 5).collect();
    let b_ids: Vec<i64> = b.iter().map(|e| e.id).collect();
    assert_eq!(a_ids, b_ids);
}

//! Run lifecycle transitions.
//!
//! ```text
//! queued -> running -> completed
//!              |  ^  \-> failed
//!              v  |
//!             paused
//! ```
//!
//! A run can be paused for two independent reasons: an operator pause
//! (`operator_paused`) and a pending manual action
//! (`blocked_by_manual_action`). The externally visible `status` is derived
//! from both bits, so clearing one never clears the other.
//!
//! Every function here is pure over `Run`; persistence is the caller's job.

use chrono::{DateTime, Utc};

use super::error::{OrchestratorError, Result};
use crate::domain::{MetricDeltas, Run, RunStatus};

/// Status implied by the pause bits of a non-terminal run
pub fn derived_status(run: &Run) -> RunStatus {
    if run.status.is_terminal() {
        run.status
    } else if run.operator_paused || run.blocked_by_manual_action.is_some() {
        RunStatus::Paused
    } else if run.has_started() {
        RunStatus::Running
    } else {
        RunStatus::Queued
    }
}

fn touch(run: &mut Run, now: DateTime<Utc>) {
    run.status = derived_status(run);
    run.updated_at = now;
}

fn ensure_not_terminal(run: &Run, operation: &'static str) -> Result<()> {
    if run.is_terminal() {
        return Err(OrchestratorError::InvalidState {
            run_id: run.id.clone(),
            status: run.status,
            operation,
        });
    }
    Ok(())
}

/// `queued -> running`: first tick
pub fn start(run: &mut Run, entry_node: &str, now: DateTime<Utc>) -> Result<()> {
    if run.status != RunStatus::Queued {
        return Err(OrchestratorError::InvalidState {
            run_id: run.id.clone(),
            status: run.status,
            operation: "start",
        });
    }

    run.started_at = Some(now);
    run.current_node = Some(entry_node.to_string());
    touch(run, now);
    Ok(())
}

/// Count one node execution against the run's budget
pub fn record_execution(run: &mut Run, now: DateTime<Utc>) -> Result<()> {
    ensure_not_terminal(run, "execute")?;
    run.node_executions += 1;
    run.updated_at = now;
    Ok(())
}

/// `running -> running` with a new current node
pub fn advance(run: &mut Run, next_node: &str, deltas: &MetricDeltas, now: DateTime<Utc>) -> Result<()> {
    ensure_not_terminal(run, "advance")?;
    run.current_node = Some(next_node.to_string());
    run.metrics.apply(deltas);
    touch(run, now);
    Ok(())
}

/// `running -> paused` blocked by a freshly raised manual action.
///
/// `current_node` is left as is so the same node re-executes on resume.
pub fn suspend(run: &mut Run, action_id: &str, now: DateTime<Utc>) -> Result<()> {
    ensure_not_terminal(run, "suspend")?;
    if let Some(existing) = &run.blocked_by_manual_action {
        return Err(OrchestratorError::ManualActionPending {
            run_id: run.id.clone(),
            action_id: existing.clone(),
        });
    }

    run.blocked_by_manual_action = Some(action_id.to_string());
    run.metrics.manual_required += 1;
    touch(run, now);
    Ok(())
}

/// `running -> completed`
pub fn complete(run: &mut Run, deltas: &MetricDeltas, now: DateTime<Utc>) -> Result<()> {
    ensure_not_terminal(run, "complete")?;
    run.metrics.apply(deltas);
    run.status = RunStatus::Completed;
    run.completed_at = Some(now);
    run.updated_at = now;
    Ok(())
}

/// `running/paused/queued -> failed`
pub fn fail(run: &mut Run, error: &str, now: DateTime<Utc>) -> Result<()> {
    ensure_not_terminal(run, "fail")?;
    run.status = RunStatus::Failed;
    run.error = Some(error.to_string());
    run.completed_at = Some(now);
    run.updated_at = now;
    Ok(())
}

/// Operator pause. Valid while running; pausing an already paused run
/// only records the operator's intent.
pub fn pause(run: &mut Run, now: DateTime<Utc>) -> Result<()> {
    match run.status {
        RunStatus::Running | RunStatus::Paused => {
            run.operator_paused = true;
            touch(run, now);
            Ok(())
        }
        status => Err(OrchestratorError::InvalidState {
            run_id: run.id.clone(),
            status,
            operation: "pause",
        }),
    }
}

/// Operator resume. Valid while paused with no pending manual action.
pub fn resume(run: &mut Run, now: DateTime<Utc>) -> Result<()> {
    if run.status != RunStatus::Paused {
        return Err(OrchestratorError::InvalidState {
            run_id: run.id.clone(),
            status: run.status,
            operation: "resume",
        });
    }
    if let Some(action_id) = &run.blocked_by_manual_action {
        return Err(OrchestratorError::ManualActionPending {
            run_id: run.id.clone(),
            action_id: action_id.clone(),
        });
    }

    run.operator_paused = false;
    touch(run, now);
    Ok(())
}

/// Clear the manual-action block after the action was resolved.
///
/// Returns false when the run was not blocked by this action (for example
/// it already failed), in which case nothing changes.
pub fn unblock(run: &mut Run, action_id: &str, now: DateTime<Utc>) -> bool {
    if run.is_terminal() || run.blocked_by_manual_action.as_deref() != Some(action_id) {
        return false;
    }

    run.blocked_by_manual_action = None;
    run.resumed_action_id = Some(action_id.to_string());
    touch(run, now);
    true
}

/// Whether the orchestrator may execute the run's current node
pub fn is_runnable(run: &Run) -> bool {
    !run.is_terminal() && derived_status(run) != RunStatus::Paused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunMode, SearchConfig};

    fn queued() -> Run {
        Run::new("run-1".to_string(), RunMode::Manual, SearchConfig::default(), Utc::now())
    }

    fn running() -> Run {
        let mut run = queued();
        start(&mut run, "discover_jobs", Utc::now()).unwrap();
        run
    }

    #[test]
    fn test_start_sets_entry_node() {
        let run = running();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        assert_eq!(run.current_node.as_deref(), Some("discover_jobs"));

        let mut again = run.clone();
        assert!(start(&mut again, "discover_jobs", Utc::now()).is_err());
    }

    #[test]
    fn test_suspend_and_unblock() {
        let mut run = running();
        suspend(&mut run, "ma-1", Utc::now()).unwrap();

        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.metrics.manual_required, 1);
        assert_eq!(run.current_node.as_deref(), Some("discover_jobs"));

        // second block while one is pending
        assert!(matches!(
            suspend(&mut run, "ma-2", Utc::now()),
            Err(OrchestratorError::ManualActionPending { .. })
        ));

        assert!(!unblock(&mut run, "ma-other", Utc::now()));
        assert!(unblock(&mut run, "ma-1", Utc::now()));
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.resumed_action_id.as_deref(), Some("ma-1"));
    }

    #[test]
    fn test_resume_blocked_by_pending_action() {
        let mut run = running();
        suspend(&mut run, "ma-1", Utc::now()).unwrap();

        assert!(matches!(
            resume(&mut run, Utc::now()),
            Err(OrchestratorError::ManualActionPending { .. })
        ));
    }

    #[test]
    fn test_pause_bits_are_independent() {
        let mut run = running();
        pause(&mut run, Utc::now()).unwrap();
        suspend(&mut run, "ma-1", Utc::now()).unwrap();

        // resolving the action leaves the operator pause in place
        assert!(unblock(&mut run, "ma-1", Utc::now()));
        assert_eq!(run.status, RunStatus::Paused);
        assert!(!is_runnable(&run));

        resume(&mut run, Utc::now()).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(is_runnable(&run));
    }

    #[test]
    fn test_pause_resume_round_trip_keeps_progress() {
        let mut run = running();
        advance(&mut run, "rank_and_filter", &MetricDeltas::discovered(4), Utc::now()).unwrap();
        let before = run.clone();

        pause(&mut run, Utc::now()).unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        resume(&mut run, Utc::now()).unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_node, before.current_node);
        assert_eq!(run.metrics, before.metrics);
    }

    #[test]
    fn test_pause_rejected_for_queued_and_terminal() {
        let mut run = queued();
        assert!(matches!(
            pause(&mut run, Utc::now()),
            Err(OrchestratorError::InvalidState { status: RunStatus::Queued, .. })
        ));

        let mut run = running();
        complete(&mut run, &MetricDeltas::none(), Utc::now()).unwrap();
        assert!(run.completed_at.is_some());
        assert!(matches!(
            pause(&mut run, Utc::now()),
            Err(OrchestratorError::InvalidState { status: RunStatus::Completed, .. })
        ));
        assert!(resume(&mut run, Utc::now()).is_err());
        assert!(fail(&mut run, "late", Utc::now()).is_err());
    }

    #[test]
    fn test_fail_records_error() {
        let mut run = running();
        fail(&mut run, "node 'x' panicked", Utc::now()).unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("node 'x' panicked"));
        assert!(run.completed_at.is_some());
        assert!(!unblock(&mut run, "ma-1", Utc::now()));
    }

    #[test]
    fn test_advance_while_operator_paused_stays_paused() {
        let mut run = running();
        pause(&mut run, Utc::now()).unwrap();
        advance(&mut run, "rank_and_filter", &MetricDeltas::none(), Utc::now()).unwrap();

        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.current_node.as_deref(), Some("rank_and_filter"));
    }
}

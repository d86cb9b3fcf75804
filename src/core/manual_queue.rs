//! Manual action queue.
//!
//! Tracks points where a run needs a human. A run is blocked by at most one
//! pending action at a time; resolving it unblocks the run so the suspended
//! node executes again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{OrchestratorError, Result};
use super::event_log::{EventLog, Journal};
use super::state_machine;
use crate::domain::{
    event_types, ManualAction, ManualActionFilter, ManualActionRequest, ManualActionStatus,
    NewEvent, Run,
};
use crate::store::{self, Tx};

/// Result of a resolve call
#[derive(Debug, Clone)]
pub struct Resolution {
    pub action: ManualAction,

    /// Whether this call unblocked the owning run.
    /// False on repeated calls and for runs that were not waiting on it.
    pub unblocked: bool,
}

/// Manual action queue backed by the event log's store
#[derive(Clone)]
pub struct ManualQueue {
    log: Arc<EventLog>,
    session_url: Option<String>,
}

impl ManualQueue {
    /// `session_url` is offered to operators when an action has none
    pub fn new(log: Arc<EventLog>, session_url: Option<String>) -> Self {
        Self { log, session_url }
    }

    /// Raise an action inside an open transaction and block the run on it.
    ///
    /// The caller persists `run`.
    pub fn raise_in(
        tx: &Tx<'_>,
        journal: &mut Journal,
        run: &mut Run,
        node: Option<&str>,
        request: &ManualActionRequest,
        now: DateTime<Utc>,
    ) -> Result<ManualAction> {
        if request.action_type.trim().is_empty() {
            return Err(OrchestratorError::PayloadValidation(
                "action_type must not be empty".to_string(),
            ));
        }

        let action = ManualAction {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            node: node.map(str::to_string),
            job_id: request.job_id.clone(),
            company: request.company.clone(),
            title: request.title.clone(),
            action_type: request.action_type.clone(),
            status: ManualActionStatus::Pending,
            details: request
                .details
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
            resolution: None,
            session_url: request.session_url.clone(),
            session_started_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };

        state_machine::suspend(run, &action.id, now)?;
        tx.insert_action(&action)?;

        let mut event = NewEvent::warning(
            event_types::MANUAL_ACTION_CREATED,
            format!("Manual intervention required: {}", action.action_type),
        )
        .with_payload(json!({
            "manual_action_id": action.id,
            "action_type": action.action_type,
            "job_id": action.job_id,
        }));
        if let Some(node) = node {
            event = event.with_node(node);
        }
        journal.append(tx, &run.id, &event, now)?;

        Ok(action)
    }

    /// Raise an operator-created action against a run
    #[instrument(skip(self, request), fields(action_type = %request.action_type))]
    pub fn raise(&self, run_id: &str, request: ManualActionRequest) -> Result<ManualAction> {
        let action = self.log.transact(|tx, journal| {
            let mut run = tx
                .get_run(run_id)?
                .ok_or_else(|| OrchestratorError::run_not_found(run_id))?;
            if run.is_terminal() {
                return Err(OrchestratorError::InvalidState {
                    run_id: run.id,
                    status: run.status,
                    operation: "raise a manual action for",
                });
            }

            let now = store::now();
            let action = Self::raise_in(tx, journal, &mut run, None, &request, now)?;
            tx.update_run(&run)?;
            Ok(action)
        })?;

        info!(run_id = %run_id, action_id = %action.id, "Manual action raised");
        Ok(action)
    }

    /// Record that an operator opened the remote session.
    ///
    /// Does not change run status.
    #[instrument(skip(self))]
    pub fn start_session(&self, action_id: &str) -> Result<ManualAction> {
        let default_url = self.session_url.clone();

        self.log.transact(|tx, journal| {
            let mut action = tx
                .get_action(action_id)?
                .ok_or_else(|| OrchestratorError::action_not_found(action_id))?;
            if !action.is_pending() {
                return Err(OrchestratorError::InvalidActionState {
                    action_id: action.id,
                    operation: "start a session for",
                    reason: "it is already resolved".to_string(),
                });
            }

            let now = store::now();
            if action.session_url.is_none() {
                action.session_url = default_url;
            }
            if action.session_started_at.is_none() {
                action.session_started_at = Some(now);
            }
            action.updated_at = now;
            tx.update_action(&action)?;

            if let Some(run) = tx.get_run(&action.run_id)? {
                if !run.is_terminal() {
                    let event = NewEvent::info(
                        event_types::MANUAL_SESSION_STARTED,
                        "Manual session started",
                    )
                    .with_payload(json!({
                        "manual_action_id": action.id,
                        "session_url": action.session_url,
                    }));
                    journal.append(tx, &run.id, &event, now)?;
                }
            }

            Ok(action)
        })
    }

    /// Resolve a pending action and unblock its run.
    ///
    /// Resolving an already resolved action returns the stored record and
    /// leaves the run alone.
    #[instrument(skip(self, details))]
    pub fn resolve(&self, action_id: &str, details: Option<serde_json::Value>) -> Result<Resolution> {
        let resolution = self.log.transact(|tx, journal| {
            let mut action = tx
                .get_action(action_id)?
                .ok_or_else(|| OrchestratorError::action_not_found(action_id))?;
            if !action.is_pending() {
                return Ok(Resolution {
                    action,
                    unblocked: false,
                });
            }

            let now = store::now();
            action.status = ManualActionStatus::Resolved;
            action.resolution = details;
            action.resolved_at = Some(now);
            action.updated_at = now;
            tx.update_action(&action)?;

            let mut unblocked = false;
            if let Some(mut run) = tx.get_run(&action.run_id)? {
                if !run.is_terminal() {
                    unblocked = state_machine::unblock(&mut run, &action.id, now);
                    if unblocked {
                        tx.update_run(&run)?;
                    }

                    let mut event = NewEvent::info(
                        event_types::MANUAL_ACTION_RESOLVED,
                        format!("Manual action resolved: {}", action.action_type),
                    )
                    .with_payload(json!({
                        "manual_action_id": action.id,
                        "details": action.resolution,
                    }));
                    if let Some(node) = &action.node {
                        event = event.with_node(node.clone());
                    }
                    journal.append(tx, &run.id, &event, now)?;
                }
            }

            Ok(Resolution { action, unblocked })
        })?;

        if resolution.unblocked {
            info!(run_id = %resolution.action.run_id, "Manual action resolved, run unblocked");
        } else {
            warn!(action_id = %action_id, "Resolve did not unblock a run");
        }
        Ok(resolution)
    }

    pub fn get(&self, action_id: &str) -> Result<ManualAction> {
        self.log.store().read(|tx| {
            tx.get_action(action_id)?
                .ok_or_else(|| OrchestratorError::action_not_found(action_id))
        })
    }

    /// Newest first
    pub fn list(&self, filter: &ManualActionFilter, limit: usize) -> Result<Vec<ManualAction>> {
        Ok(self.log.store().read(|tx| tx.list_actions(filter, limit))?)
    }

    /// Remove a resolved action. Pending actions block a run and cannot be
    /// deleted.
    pub fn delete(&self, action_id: &str) -> Result<()> {
        self.log.store().write(|tx| {
            let action = tx
                .get_action(action_id)?
                .ok_or_else(|| OrchestratorError::action_not_found(action_id))?;
            if action.is_pending() {
                return Err(OrchestratorError::InvalidActionState {
                    action_id: action.id,
                    operation: "delete",
                    reason: "it is still pending".to_string(),
                });
            }
            tx.delete_action(action_id)?;
            Ok(())
        })
    }
}

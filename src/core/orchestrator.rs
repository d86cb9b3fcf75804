//! Run orchestrator.
//!
//! Drives node execution against the run state machine. Each `tick`
//! executes at most one node and commits the outcome, its events and any
//! manual action or application records in a single transaction.
//!
//! Ticks are serialized per run; different runs tick in parallel. Nothing
//! waits in memory for a human: a suspended run is a persisted `paused`
//! status, and resolving its action schedules a fresh tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{OrchestratorError, Result};
use super::event_log::{EventLog, Journal};
use super::manual_queue::ManualQueue;
use super::registry::{NodeContext, NodeOutcome, NodeRegistry};
use super::safety::{ExecutionLimits, SafetyViolation};
use super::state_machine;
use crate::domain::{
    event_types, Application, ManualAction, ManualActionRequest, NewEvent, Run, RunMode,
    RunStatus, SearchConfig,
};
use crate::store::{self, Store, StoreError, Tx};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub limits: ExecutionLimits,

    /// Spawn a driver task whenever a run becomes runnable.
    /// Disable to step runs by hand with [`Orchestrator::tick`].
    pub auto_drive: bool,

    /// Remote browser session offered for manual actions
    pub session_url: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            auto_drive: true,
            session_url: None,
        }
    }
}

/// Marks a commit as following a node execution
#[derive(Debug, Clone, Copy)]
struct Execution<'a> {
    /// Resolved action handed to the node, if any
    consumed_action: Option<&'a str>,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do (terminal, paused, or raced with another change)
    Idle,

    /// `queued -> running`
    Started { entry: String },

    /// A node advanced to its successor
    Advanced { from: String, to: String },

    /// A node suspended; `action_id` is None when an existing pending
    /// action already blocks the run
    Suspended {
        node: String,
        action_id: Option<String>,
    },

    Completed,

    Failed { error: String },
}

impl TickOutcome {
    /// Whether the driver should tick again right away
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Started { .. } | Self::Advanced { .. })
    }
}

/// The run orchestrator
pub struct Orchestrator {
    log: Arc<EventLog>,
    queue: ManualQueue,
    registry: NodeRegistry,
    settings: OrchestratorSettings,

    /// Per-run tick serialization
    tick_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,

    /// Runs with an active driver task, and whether it was woken while busy
    drivers: Mutex<HashMap<String, bool>>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, registry: NodeRegistry, settings: OrchestratorSettings) -> Arc<Self> {
        let log = Arc::new(EventLog::new(store));
        let queue = ManualQueue::new(Arc::clone(&log), settings.session_url.clone());

        Arc::new(Self {
            log,
            queue,
            registry,
            settings,
            tick_locks: Mutex::new(HashMap::new()),
            drivers: Mutex::new(HashMap::new()),
        })
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn manual_queue(&self) -> &ManualQueue {
        &self.queue
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        self.log.store()
    }

    // ---- run registry ----

    /// Create a queued run and schedule it
    pub fn create_run(self: &Arc<Self>, mode: RunMode, search_config: SearchConfig) -> Result<Run> {
        self.create_run_with_state(mode, search_config, serde_json::Value::Null)
    }

    /// Create a run whose working state starts from `initial_state`
    /// (an object, or null for empty)
    #[instrument(skip(self, search_config, initial_state), fields(mode = mode.as_str()))]
    pub fn create_run_with_state(
        self: &Arc<Self>,
        mode: RunMode,
        search_config: SearchConfig,
        initial_state: serde_json::Value,
    ) -> Result<Run> {
        search_config.validate()?;

        let mut run = Run::new(
            Uuid::new_v4().to_string(),
            mode,
            search_config,
            store::now(),
        );
        match initial_state {
            serde_json::Value::Null => {}
            state @ serde_json::Value::Object(_) => run.state_json = state,
            _ => {
                return Err(OrchestratorError::PayloadValidation(
                    "initial run state must be a JSON object".to_string(),
                ))
            }
        }
        self.log.transact(|tx, journal| {
            tx.insert_run(&run)?;
            let event = NewEvent::info(event_types::RUN_CREATED, "Run created")
                .with_node("api")
                .with_payload(json!({ "mode": mode.as_str() }));
            journal.append(tx, &run.id, &event, run.created_at)?;
            Ok(())
        })?;

        info!(run_id = %run.id, "Run created");
        self.schedule(&run.id);
        Ok(run)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store().read(|tx| load_run(tx, run_id))
    }

    /// Most recently updated first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        Ok(self.store().read(|tx| tx.list_runs(limit))?)
    }

    pub fn list_applications(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<Application>> {
        Ok(self.store().read(|tx| tx.list_applications(run_id, limit))?)
    }

    // ---- operator control ----

    /// Operator pause
    #[instrument(skip(self))]
    pub fn pause(&self, run_id: &str) -> Result<Run> {
        let run = self.log.transact(|tx, journal| {
            let mut run = load_run(tx, run_id)?;
            let was_paused = run.operator_paused;
            let now = store::now();

            state_machine::pause(&mut run, now)?;
            tx.update_run(&run)?;

            if !was_paused {
                let event = NewEvent::warning(event_types::RUN_PAUSED, "Run paused by operator")
                    .with_node("api");
                journal.append(tx, run_id, &event, now)?;
            }
            Ok(run)
        })?;

        info!(status = %run.status, "Run paused");
        Ok(run)
    }

    /// Operator resume
    #[instrument(skip(self))]
    pub fn resume(self: &Arc<Self>, run_id: &str) -> Result<Run> {
        let run = self.log.transact(|tx, journal| {
            let mut run = load_run(tx, run_id)?;
            let now = store::now();

            state_machine::resume(&mut run, now)?;
            tx.update_run(&run)?;

            let event =
                NewEvent::info(event_types::RUN_RESUMED, "Run resumed by operator").with_node("api");
            journal.append(tx, run_id, &event, now)?;
            Ok(run)
        })?;

        info!(status = %run.status, "Run resumed");
        self.schedule(run_id);
        Ok(run)
    }

    // ---- manual actions ----

    /// Raise an operator-created manual action against a run
    pub fn raise_manual_action(&self, run_id: &str, request: ManualActionRequest) -> Result<ManualAction> {
        self.queue.raise(run_id, request)
    }

    /// Resolve a manual action and resume its run.
    ///
    /// Safe to repeat: only the first call resumes the run.
    pub fn resolve_manual_action(
        self: &Arc<Self>,
        action_id: &str,
        details: Option<serde_json::Value>,
    ) -> Result<ManualAction> {
        let resolution = self.queue.resolve(action_id, details)?;
        if resolution.unblocked {
            self.schedule(&resolution.action.run_id);
        }
        Ok(resolution.action)
    }

    // ---- execution ----

    /// Execute at most one step of a run
    #[instrument(skip(self))]
    pub async fn tick(&self, run_id: &str) -> Result<TickOutcome> {
        let lock = self.tick_lock(run_id)?;
        let _guard = lock.lock().await;

        let run = self.get_run(run_id)?;
        if !state_machine::is_runnable(&run) {
            debug!(status = %run.status, "Run not runnable, tick is a no-op");
            return Ok(TickOutcome::Idle);
        }

        if run.status == RunStatus::Queued {
            return self.start(run_id).await;
        }

        let node_name = run
            .current_node
            .clone()
            .unwrap_or_else(|| self.registry.entry().to_string());

        if let Err(violation) = self.settings.limits.check_budget(run.node_executions) {
            error!(node = %node_name, error = %violation, "Safety limit reached");
            let outcome = NodeOutcome::Fail(violation.to_string());
            return self
                .commit_with_retry(run_id, &node_name, &outcome, None, None)
                .await;
        }

        let Some(node) = self.registry.get(&node_name) else {
            let outcome = NodeOutcome::Fail(format!("unknown pipeline node '{}'", node_name));
            return self
                .commit_with_retry(run_id, &node_name, &outcome, None, None)
                .await;
        };

        let resumed_action = match &run.resumed_action_id {
            Some(action_id) => match self.queue.get(action_id) {
                Ok(action) => Some(action),
                Err(OrchestratorError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let mut ctx = NodeContext::new(
            run.id.clone(),
            node_name.clone(),
            run.search_config.clone(),
            run.state_json.clone(),
        );
        ctx.metrics = run.metrics;
        ctx.resumed_action = resumed_action;

        let timeout = self.settings.limits.timeout_for(&node_name);
        let started = Instant::now();
        debug!(node = %node_name, timeout_s = timeout.as_secs(), "Executing node");

        let handle = tokio::spawn(async move {
            let result = node.execute(&mut ctx).await;
            (result, ctx)
        });
        let abort = handle.abort_handle();

        let (outcome, ctx) = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok((Ok(outcome), ctx))) => (outcome, Some(ctx)),
            Ok(Ok((Err(e), ctx))) => {
                warn!(node = %node_name, error = %e, "Node returned an error");
                (NodeOutcome::Fail(e.to_string()), Some(ctx))
            }
            Ok(Err(join_error)) => {
                error!(node = %node_name, error = %join_error, "Node task aborted");
                let message = if join_error.is_panic() {
                    format!("node '{}' panicked", node_name)
                } else {
                    format!("node '{}' was cancelled", node_name)
                };
                (NodeOutcome::Fail(message), None)
            }
            Err(_) => {
                abort.abort();
                let violation = SafetyViolation::NodeTimeout {
                    node: node_name.clone(),
                    limit_seconds: timeout.as_secs(),
                };
                error!(node = %node_name, error = %violation, "Node timed out");
                (NodeOutcome::Fail(violation.to_string()), None)
            }
        };

        debug!(
            node = %node_name,
            outcome = outcome.kind(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Node finished"
        );

        let executed = Execution {
            consumed_action: run.resumed_action_id.as_deref(),
        };
        self.commit_with_retry(run_id, &node_name, &outcome, ctx.as_ref(), Some(executed))
            .await
    }

    async fn start(&self, run_id: &str) -> Result<TickOutcome> {
        let entry = self.registry.entry().to_string();
        let outcome = self.log.transact(|tx, journal| {
            let mut run = load_run(tx, run_id)?;
            if run.status != RunStatus::Queued {
                return Ok(TickOutcome::Idle);
            }

            let now = store::now();
            state_machine::start(&mut run, &entry, now)?;
            tx.update_run(&run)?;

            let event = NewEvent::info(event_types::RUN_STARTED, "Run started")
                .with_payload(json!({ "entry_node": entry }));
            journal.append(tx, run_id, &event, now)?;

            Ok(TickOutcome::Started {
                entry: entry.clone(),
            })
        })?;

        if outcome != TickOutcome::Idle {
            info!(run_id, node = %entry, status = "running", "Run started");
        }
        Ok(outcome)
    }

    /// Persist an outcome, retrying storage failures with backoff.
    ///
    /// Nothing is skipped: if every attempt fails the tick errors and the run
    /// stays at its last durable state.
    async fn commit_with_retry(
        &self,
        run_id: &str,
        node: &str,
        outcome: &NodeOutcome,
        ctx: Option<&NodeContext>,
        executed: Option<Execution<'_>>,
    ) -> Result<TickOutcome> {
        let policy = &self.settings.limits.commit_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.commit(run_id, node, outcome, ctx, executed) {
                Ok(result) => {
                    self.log_result(run_id, node, &result);
                    if matches!(result, TickOutcome::Completed | TickOutcome::Failed { .. }) {
                        self.forget(run_id);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        node,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(node, attempt, error = %e, "Commit failed permanently");
                    return Err(e);
                }
            }
        }
    }

    fn commit(
        &self,
        run_id: &str,
        node: &str,
        outcome: &NodeOutcome,
        ctx: Option<&NodeContext>,
        executed: Option<Execution<'_>>,
    ) -> Result<TickOutcome> {
        self.log.transact(|tx, journal| {
            let mut run = load_run(tx, run_id)?;
            if run.is_terminal() {
                return Ok(TickOutcome::Idle);
            }

            let now = store::now();
            if let Some(execution) = executed {
                state_machine::record_execution(&mut run, now)?;
                // An action resolved while the node ran is left for the next tick
                if run.resumed_action_id.as_deref() == execution.consumed_action {
                    run.resumed_action_id = None;
                }
            }

            if let Some(ctx) = ctx {
                for event in &ctx.events {
                    journal.append(tx, run_id, event, now)?;
                }
                for application in &ctx.applications {
                    tx.insert_application(run_id, application, now)?;
                }
            }

            let result = match outcome {
                NodeOutcome::Advance { next, deltas } if self.registry.contains(next) => {
                    if let Some(ctx) = ctx {
                        run.state_json = ctx.state.clone();
                    }
                    state_machine::advance(&mut run, next, deltas, now)?;
                    let event = NewEvent::info(
                        event_types::NODE_ADVANCED,
                        format!("Node '{}' advanced to '{}'", node, next),
                    )
                    .with_node(node)
                    .with_payload(json!({ "from": node, "to": next }));
                    journal.append(tx, run_id, &event, now)?;

                    TickOutcome::Advanced {
                        from: node.to_string(),
                        to: next.clone(),
                    }
                }
                NodeOutcome::Advance { next, .. } => fail_run(
                    tx,
                    journal,
                    &mut run,
                    node,
                    &format!("node '{}' advanced to unknown node '{}'", node, next),
                )?,
                NodeOutcome::Suspend(request) => {
                    if let Some(ctx) = ctx {
                        run.state_json = ctx.state.clone();
                    }

                    match run.blocked_by_manual_action.clone() {
                        Some(existing) => {
                            let event = NewEvent::warning(
                                event_types::MANUAL_ACTION_DEFERRED,
                                format!(
                                    "Node '{}' requested '{}' while action '{}' is pending",
                                    node, request.action_type, existing
                                ),
                            )
                            .with_node(node)
                            .with_payload(json!({
                                "manual_action_id": existing,
                                "action_type": request.action_type,
                            }));
                            journal.append(tx, run_id, &event, now)?;
                            run.updated_at = now;

                            TickOutcome::Suspended {
                                node: node.to_string(),
                                action_id: None,
                            }
                        }
                        None => {
                            let action =
                                ManualQueue::raise_in(tx, journal, &mut run, Some(node), request, now)?;
                            TickOutcome::Suspended {
                                node: node.to_string(),
                                action_id: Some(action.id),
                            }
                        }
                    }
                }
                NodeOutcome::Complete(deltas) => {
                    if let Some(ctx) = ctx {
                        run.state_json = ctx.state.clone();
                    }
                    state_machine::complete(&mut run, deltas, now)?;
                    let event = NewEvent::info(event_types::RUN_COMPLETED, "Run completed")
                        .with_node(node)
                        .with_payload(json!({ "metrics": run.metrics }));
                    journal.append(tx, run_id, &event, now)?;
                    journal.close(run_id);

                    TickOutcome::Completed
                }
                NodeOutcome::Fail(message) => fail_run(tx, journal, &mut run, node, message)?,
            };

            tx.update_run(&run)?;
            Ok(result)
        })
    }

    fn log_result(&self, run_id: &str, node: &str, result: &TickOutcome) {
        match result {
            TickOutcome::Advanced { to, .. } => {
                info!(run_id, node, next = %to, status = "running", "Node advanced")
            }
            TickOutcome::Suspended { action_id, .. } => {
                warn!(run_id, node, action_id = ?action_id, status = "paused", "Run suspended")
            }
            TickOutcome::Completed => info!(run_id, node, status = "completed", "Run completed"),
            TickOutcome::Failed { error } => {
                error!(run_id, node, %error, status = "failed", "Run failed")
            }
            TickOutcome::Idle | TickOutcome::Started { .. } => {}
        }
    }

    // ---- driver ----

    /// Make sure a driver task is ticking the run
    pub fn schedule(self: &Arc<Self>, run_id: &str) {
        if !self.settings.auto_drive {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(run_id, "No async runtime, run not scheduled");
            return;
        }

        let Ok(mut drivers) = self.drivers.lock() else {
            error!(run_id, "Driver registry poisoned");
            return;
        };
        if let Some(wake) = drivers.get_mut(run_id) {
            *wake = true;
            return;
        }
        drivers.insert(run_id.to_string(), false);
        drop(drivers);

        let this = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move { this.drive(run_id).await });
    }

    async fn drive(self: Arc<Self>, run_id: String) {
        debug!(run_id = %run_id, "Driver started");
        let backoff = &self.settings.limits.commit_retry;
        let mut failures = 0;
        loop {
            let keep_going = match self.tick(&run_id).await {
                Ok(outcome) => {
                    failures = 0;
                    outcome.should_continue()
                }
                // The run is still runnable in storage; keep ticking it
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let delay = backoff.delay_for_attempt(failures);
                    warn!(
                        run_id = %run_id,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Tick failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    true
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Tick failed, driver stopping");
                    false
                }
            };
            if keep_going {
                continue;
            }

            let Ok(mut drivers) = self.drivers.lock() else {
                break;
            };
            match drivers.get_mut(&run_id) {
                Some(wake) if *wake => *wake = false,
                _ => {
                    drivers.remove(&run_id);
                    break;
                }
            }
        }
        debug!(run_id = %run_id, "Driver stopped");
    }

    /// Tick until the run stops making progress and return its state
    pub async fn run_to_idle(&self, run_id: &str) -> Result<Run> {
        while self.tick(run_id).await?.should_continue() {}
        self.get_run(run_id)
    }

    /// Re-schedule runs that were queued or running when the process stopped
    pub fn recover(self: &Arc<Self>) -> Result<usize> {
        let run_ids = self
            .store()
            .read(|tx| tx.run_ids_with_status(&[RunStatus::Queued, RunStatus::Running]))?;

        for run_id in &run_ids {
            self.schedule(run_id);
        }
        if !run_ids.is_empty() {
            info!(count = run_ids.len(), "Recovered unfinished runs");
        }
        Ok(run_ids.len())
    }

    fn tick_lock(&self, run_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .tick_locks
            .lock()
            .map_err(|_| OrchestratorError::Storage(StoreError::LockPoisoned))?;
        Ok(Arc::clone(
            locks
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }

    fn forget(&self, run_id: &str) {
        if let Ok(mut locks) = self.tick_locks.lock() {
            locks.remove(run_id);
        }
    }
}

fn load_run(tx: &Tx<'_>, run_id: &str) -> Result<Run> {
    tx.get_run(run_id)?
        .ok_or_else(|| OrchestratorError::run_not_found(run_id))
}

fn fail_run(
    tx: &Tx<'_>,
    journal: &mut Journal,
    run: &mut Run,
    node: &str,
    message: &str,
) -> Result<TickOutcome> {
    let now = store::now();
    state_machine::fail(run, message, now)?;

    let event = NewEvent::error(event_types::RUN_FAILED, format!("Run failed: {}", message))
        .with_node(node)
        .with_payload(json!({ "error": message }));
    journal.append(tx, &run.id, &event, now)?;
    journal.close(&run.id);

    Ok(TickOutcome::Failed {
        error: message.to_string(),
    })
}

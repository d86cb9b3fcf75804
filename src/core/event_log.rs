//! Append-only, per-run event log with live fan-out.
//!
//! Durable ordering comes from the store (ids are allocated inside the
//! write transaction). Live delivery uses one `broadcast` channel per run.
//! Commits and publishes happen under the same hub lock, so subscribers
//! observe events in id order.
//!
//! Readers keep their own cursor (`after_id`); the log keeps no per-consumer
//! state.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::error::{OrchestratorError, Result};
use crate::domain::{NewEvent, RunEvent};
use crate::store::{self, Store, StoreError, Tx};

/// Live channel capacity per run
const CHANNEL_CAPACITY: usize = 256;

/// Page size used when a tail catches up from storage
const CATCH_UP_PAGE: usize = 250;

/// A boxed stream of run events
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// Message on a run's live channel
#[derive(Debug, Clone)]
enum Feed {
    Event(RunEvent),
    Closed,
}

/// Events appended within one transaction, published after commit
#[derive(Debug, Default)]
pub struct Journal {
    events: Vec<RunEvent>,
    closed: Vec<String>,
}

impl Journal {
    /// Append an event inside the transaction and remember it for publishing
    pub fn append(
        &mut self,
        tx: &Tx<'_>,
        run_id: &str,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> store::Result<RunEvent> {
        let stored = tx.append_event(run_id, event, now)?;
        self.events.push(stored.clone());
        Ok(stored)
    }

    /// Mark a run as terminal: its live subscribers end after this commit
    pub fn close(&mut self, run_id: &str) {
        self.closed.push(run_id.to_string());
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }
}

/// The run event log
pub struct EventLog {
    store: Arc<Store>,
    hub: Mutex<HashMap<String, broadcast::Sender<Feed>>>,
}

impl EventLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            hub: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn lock_hub(&self) -> Result<MutexGuard<'_, HashMap<String, broadcast::Sender<Feed>>>> {
        self.hub
            .lock()
            .map_err(|_| OrchestratorError::Storage(StoreError::LockPoisoned))
    }

    /// Run a write transaction and publish whatever it journaled.
    ///
    /// Nothing is published if `f` fails or the commit fails.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tx<'_>, &mut Journal) -> Result<T>,
    {
        let mut hub = self.lock_hub()?;
        let mut journal = Journal::default();
        let value = self.store.write(|tx| f(tx, &mut journal))?;

        for event in journal.events {
            if let Some(sender) = hub.get(&event.run_id) {
                if sender.send(Feed::Event(event.clone())).is_err() {
                    // every receiver is gone
                    hub.remove(&event.run_id);
                }
            }
        }
        for run_id in journal.closed {
            if let Some(sender) = hub.remove(&run_id) {
                let _ = sender.send(Feed::Closed);
                debug!(run_id = %run_id, "Closed live event channel");
            }
        }

        Ok(value)
    }

    /// Append a single event to a live run
    pub fn append(&self, run_id: &str, event: NewEvent) -> Result<RunEvent> {
        self.transact(|tx, journal| {
            let run = tx
                .get_run(run_id)?
                .ok_or_else(|| OrchestratorError::run_not_found(run_id))?;
            if run.is_terminal() {
                return Err(OrchestratorError::InvalidState {
                    run_id: run.id,
                    status: run.status,
                    operation: "append event to",
                });
            }
            Ok(journal.append(tx, run_id, &event, store::now())?)
        })
    }

    /// Events with id > `after_id`, ascending, at most `limit`
    pub fn batch(&self, run_id: &str, after_id: i64, limit: usize) -> Result<Vec<RunEvent>> {
        self.store.read(|tx| {
            if tx.get_run(run_id)?.is_none() {
                return Err(OrchestratorError::run_not_found(run_id));
            }
            Ok(tx.events_after(run_id, after_id, limit)?)
        })
    }

    /// Live feed of events appended from now on.
    ///
    /// Ends when the run reaches a terminal status (immediately if it
    /// already has).
    pub fn subscribe(self: &Arc<Self>, run_id: &str) -> Result<EventStream> {
        self.open_tail(run_id, None)
    }

    /// Catch-up from `after_id` followed by live tailing, de-duplicated by id
    pub fn tail(self: &Arc<Self>, run_id: &str, after_id: i64) -> Result<EventStream> {
        self.open_tail(run_id, Some(after_id))
    }

    fn open_tail(self: &Arc<Self>, run_id: &str, after_id: Option<i64>) -> Result<EventStream> {
        // Registration and the terminal check happen under the hub lock so a
        // concurrent close cannot slip in between.
        let mut hub = self.lock_hub()?;
        let (terminal, last_id) = self.store.read(|tx| -> Result<(bool, i64)> {
            let run = tx
                .get_run(run_id)?
                .ok_or_else(|| OrchestratorError::run_not_found(run_id))?;
            Ok((run.is_terminal(), tx.last_event_id(run_id)?))
        })?;

        let receiver = if terminal {
            None
        } else {
            let sender = hub
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            Some(sender.subscribe())
        };
        drop(hub);

        let tail = Tail {
            log: Arc::clone(self),
            run_id: run_id.to_string(),
            last_id: after_id.unwrap_or(last_id),
            pending: VecDeque::new(),
            receiver,
            catch_up: after_id.is_some() || terminal,
            closing: terminal,
        };

        Ok(Box::pin(stream::unfold(tail, |mut tail| async move {
            tail.next_event().await.map(|event| (event, tail))
        })))
    }

    /// Number of runs with an open live channel
    pub fn live_channels(&self) -> usize {
        self.hub.lock().map(|hub| hub.len()).unwrap_or(0)
    }
}

struct Tail {
    log: Arc<EventLog>,
    run_id: String,
    last_id: i64,
    pending: VecDeque<RunEvent>,
    receiver: Option<broadcast::Receiver<Feed>>,
    /// Storage may hold events past `last_id` that were not delivered live
    catch_up: bool,
    /// The run is terminal; end once storage is drained
    closing: bool,
}

impl Tail {
    async fn next_event(&mut self) -> Option<RunEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.last_id = event.id;
                return Some(event);
            }

            if self.catch_up {
                let page = match self.log.batch(&self.run_id, self.last_id, CATCH_UP_PAGE) {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(run_id = %self.run_id, error = %e, "Event tail catch-up failed");
                        return None;
                    }
                };
                self.catch_up = page.len() == CATCH_UP_PAGE;
                self.pending.extend(page);
                continue;
            }

            if self.closing {
                return None;
            }

            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(Feed::Event(event)) => {
                    if event.id <= self.last_id {
                        continue;
                    }
                    if event.id == self.last_id + 1 {
                        self.pending.push_back(event);
                    } else {
                        self.catch_up = true;
                    }
                }
                Ok(Feed::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    self.catch_up = true;
                    self.closing = true;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(run_id = %self.run_id, skipped, "Event tail lagged, refetching");
                    self.catch_up = true;
                }
            }
        }
    }
}

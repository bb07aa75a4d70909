//! Run-scoped, multi-subscriber event bus.
//!
//! Each run id maps to a list of subscriber queues. Publishing never awaits:
//! every subscriber owns an unbounded queue, so a slow consumer cannot stall
//! the producer or other consumers. Delivery is at-most-once and only covers
//! events emitted after a subscriber attached; nothing is replayed.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::domain::{RunId, StageEvent};

/// How many finished run ids are remembered by default
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

/// What travels through a subscriber queue
#[derive(Debug, Clone)]
enum BusMessage {
    Event(Arc<StageEvent>),
    Finished,
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct RunEntry {
    subscribers: Vec<Subscriber>,
    finished: bool,
}

#[derive(Default)]
struct BusState {
    runs: HashMap<RunId, RunEntry>,
    /// Recently finished runs, oldest first
    finished: VecDeque<RunId>,
    next_subscriber: u64,
}

struct BusInner {
    state: Mutex<BusState>,
    finished_retention: usize,
}

/// Process-wide event bus handle.
///
/// Cloning is cheap; all clones share the same registry. Construct one at
/// startup and hand it to every component that publishes or subscribes.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_FINISHED_RETENTION)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("runs", &self.run_count())
            .field("finished_retention", &self.inner.finished_retention)
            .finish()
    }
}

impl EventBus {
    /// Create a bus remembering up to `finished_retention` finished runs
    pub fn new(finished_retention: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                finished_retention,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a fresh run id
    pub fn new_run_id(&self) -> RunId {
        RunId::generate()
    }

    /// Make the run known to the bus. Idempotent.
    pub fn ensure_run(&self, run_id: &RunId) {
        self.lock().runs.entry(run_id.clone()).or_default();
    }

    /// Register a new subscriber for the run.
    ///
    /// Attaching to a finished run yields a subscription that only sees the
    /// completion sentinel.
    pub fn attach(&self, run_id: &RunId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let already_finished = state.finished.contains(run_id)
            || state.runs.get(run_id).is_some_and(|entry| entry.finished);
        if already_finished {
            let _ = tx.send(BusMessage::Finished);
            return Subscription::new(self.clone(), run_id.clone(), None, rx);
        }

        state.next_subscriber += 1;
        let id = state.next_subscriber;
        state
            .runs
            .entry(run_id.clone())
            .or_default()
            .subscribers
            .push(Subscriber { id, tx });

        debug!(%run_id, subscriber = id, "subscriber attached");
        Subscription::new(self.clone(), run_id.clone(), Some(id), rx)
    }

    /// Unregister a subscription. Same as dropping it.
    pub fn detach(&self, subscription: Subscription) {
        drop(subscription);
    }

    fn remove_subscriber(&self, run_id: &RunId, subscriber: u64) {
        let mut state = self.lock();
        let Some(entry) = state.runs.get_mut(run_id) else {
            return;
        };
        entry.subscribers.retain(|s| s.id != subscriber);
        if entry.subscribers.is_empty() {
            state.runs.remove(run_id);
        }
        debug!(%run_id, subscriber, "subscriber detached");
    }

    /// Deliver an event to every subscriber currently attached to its run.
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, event: StageEvent) -> usize {
        debug!(
            run_id = %event.run_id,
            step = %event.step_id,
            agent = %event.agent,
            phase = %event.phase,
            "stage event"
        );

        let snapshot: Vec<(u64, UnboundedSender<BusMessage>)> = {
            let state = self.lock();
            match state.runs.get(&event.run_id) {
                Some(entry) if !entry.finished => entry
                    .subscribers
                    .iter()
                    .map(|s| (s.id, s.tx.clone()))
                    .collect(),
                _ => return 0,
            }
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(BusMessage::Event(Arc::clone(&event))).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        for id in closed {
            self.remove_subscriber(&event.run_id, id);
        }

        delivered
    }

    /// Signal every attached subscriber that the run has no more events
    pub fn finish(&self, run_id: &RunId) {
        let snapshot: Vec<UnboundedSender<BusMessage>> = {
            let mut state = self.lock();

            let snapshot = match state.runs.get_mut(run_id) {
                Some(entry) => {
                    entry.finished = true;
                    entry.subscribers.iter().map(|s| s.tx.clone()).collect()
                }
                None => Vec::new(),
            };
            if state
                .runs
                .get(run_id)
                .is_some_and(|entry| entry.subscribers.is_empty())
            {
                state.runs.remove(run_id);
            }

            if !state.finished.contains(run_id) {
                state.finished.push_back(run_id.clone());
                while state.finished.len() > self.inner.finished_retention {
                    state.finished.pop_front();
                }
            }
            snapshot
        };

        for tx in snapshot {
            let _ = tx.send(BusMessage::Finished);
        }
        debug!(%run_id, "run finished");
    }

    /// Attach and consume until the completion sentinel.
    ///
    /// Dropping the returned stream detaches it.
    pub fn stream(&self, run_id: &RunId) -> Subscription {
        self.attach(run_id)
    }

    /// Whether the run currently has a registry entry
    pub fn is_known(&self, run_id: &RunId) -> bool {
        self.lock().runs.contains_key(run_id)
    }

    /// Whether the run has been finished recently
    pub fn is_finished(&self, run_id: &RunId) -> bool {
        let state = self.lock();
        state.finished.contains(run_id) || state.runs.get(run_id).is_some_and(|e| e.finished)
    }

    /// Subscribers currently attached to the run
    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.lock()
            .runs
            .get(run_id)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Runs currently in the registry
    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }
}

/// A live subscription to one run's events.
///
/// Yields events until the run finishes; detaches itself when dropped.
pub struct Subscription {
    bus: EventBus,
    run_id: RunId,
    id: Option<u64>,
    rx: UnboundedReceiver<BusMessage>,
    done: bool,
}

impl Subscription {
    fn new(bus: EventBus, run_id: RunId, id: Option<u64>, rx: UnboundedReceiver<BusMessage>) -> Self {
        Self {
            bus,
            run_id,
            id,
            rx,
            done: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event, or `None` once the run has finished
    pub async fn recv(&mut self) -> Option<Arc<StageEvent>> {
        self.next().await
    }

    /// Whether the completion sentinel has been observed
    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Stream for Subscription {
    type Item = Arc<StageEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(BusMessage::Event(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(BusMessage::Finished)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.bus.remove_subscriber(&self.run_id, id);
        }
    }
}

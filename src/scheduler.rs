//! Fair scheduling of work items onto a fixed pool of processors.
//!
//! At most one item per partition key runs at any time, and at most one
//! item per processor. Keys waiting for a processor are served in
//! rotation, so a key with a deep queue cannot starve the others: after a
//! key is serviced it moves to the back of the rotation.
//!
//! All scheduler state lives behind one short-held mutex; processors run
//! on spawned tasks and hand themselves back when done.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ProcessError, RouteError};
use crate::event::RoutedEvent;
use crate::processor::Processor;

/// How often empty per-key queues are swept.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// An event plus the handle that reports its outcome.
#[derive(Debug)]
pub struct WorkItem {
    /// The event to process.
    pub event: RoutedEvent,
    /// Completed exactly once with the processing result.
    pub done: oneshot::Sender<Result<(), ProcessError>>,
}

impl WorkItem {
    /// Pair `event` with a fresh completion handle.
    pub fn new(event: RoutedEvent) -> (Self, Completion) {
        let (done, rx) = oneshot::channel();
        (Self { event, done }, Completion { rx })
    }
}

/// Resolves once the work item has been processed or rejected.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), ProcessError>>,
}

impl Completion {
    /// Wait for the outcome. A handle dropped without completing reads as
    /// [`ProcessError::Disposed`].
    pub async fn wait(self) -> Result<(), ProcessError> {
        self.rx.await.unwrap_or(Err(ProcessError::Disposed))
    }
}

/// Point-in-time counters, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Items waiting in per-key queues.
    pub queued: usize,
    /// Keys with an item currently executing.
    pub in_flight: usize,
    /// Processors waiting for work.
    pub idle: usize,
    /// Per-key queues held, including empty ones awaiting the sweep.
    pub queues: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<WorkItem>>,
    rotation: VecDeque<String>,
    in_rotation: HashSet<String>,
    in_flight: HashSet<String>,
    idle: VecDeque<Arc<Processor>>,
    disposed: bool,
}

impl State {
    /// Find the next runnable item and an idle processor for it, scanning
    /// the rotation at most once.
    fn next_dispatch(&mut self) -> Option<(String, Arc<Processor>, WorkItem)> {
        if self.idle.is_empty() {
            return None;
        }
        for _ in 0..self.rotation.len() {
            let key = self.rotation.pop_front()?;
            if self.in_flight.contains(&key) {
                self.rotation.push_back(key);
                continue;
            }
            let queue = self.queues.get_mut(&key);
            let Some(item) = queue.and_then(VecDeque::pop_front) else {
                self.in_rotation.remove(&key);
                continue;
            };
            if self.queues.get(&key).is_some_and(|q| !q.is_empty()) {
                self.rotation.push_back(key.clone());
            } else {
                self.in_rotation.remove(&key);
            }
            self.in_flight.insert(key.clone());
            let processor = self.idle.pop_front()?;
            return Some((key, processor, item));
        }
        None
    }
}

/// Returns a dispatched processor and its key to the scheduler when
/// dropped, even if processing unwinds.
struct Release {
    scheduler: Arc<Scheduler>,
    key: String,
    processor: Option<Arc<Processor>>,
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(processor) = self.processor.take() {
            self.scheduler.complete(&self.key, processor);
        }
    }
}

/// Multiplexes an unbounded set of partition keys over a fixed processor
/// pool.
pub struct Scheduler {
    name: String,
    state: Mutex<State>,
    sweep_interval: Duration,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    sweep_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler over `processors`.
    pub fn new(name: impl Into<String>, processors: Vec<Arc<Processor>>) -> Arc<Self> {
        Self::with_sweep_interval(name, processors, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a scheduler that sweeps empty queues every `sweep_interval`.
    pub fn with_sweep_interval(
        name: impl Into<String>,
        processors: Vec<Arc<Processor>>,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                idle: processors.into(),
                ..State::default()
            }),
            sweep_interval,
            shutdown_tx,
            sweep_task: tokio::sync::Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("scheduler state lock poisoned")
    }

    /// Start the periodic sweep of empty queues. Calling `start` again
    /// while the sweep runs is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.sweep_task.lock().await;
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.sweep_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(scheduler) = weak.upgrade() else { break };
                        scheduler.sweep();
                    }
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                }
            }
        }));
    }

    /// Queue `event` behind any earlier work for its partition key and
    /// dispatch whatever can run.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Disposed`] once the scheduler is disposed.
    pub fn schedule(self: &Arc<Self>, event: RoutedEvent) -> Result<Completion, RouteError> {
        let (item, completion) = WorkItem::new(event);
        let ready = {
            let mut state = self.lock();
            if state.disposed {
                return Err(RouteError::Disposed);
            }
            let key = item.event.partition_key.clone();
            state.queues.entry(key.clone()).or_default().push_back(item);
            if state.in_rotation.insert(key.clone()) {
                state.rotation.push_back(key);
            }
            Self::drain_ready(&mut state)
        };
        self.launch(ready);
        Ok(completion)
    }

    /// Release the key and return the processor to the idle pool, then
    /// dispatch whatever can run.
    fn complete(self: &Arc<Self>, key: &str, processor: Arc<Processor>) {
        let ready = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            if state.disposed || processor.is_disposed() {
                return;
            }
            // A key that was just serviced waits behind every other key.
            if let Some(pos) = state.rotation.iter().position(|k| k == key)
                && let Some(serviced) = state.rotation.remove(pos)
            {
                state.rotation.push_back(serviced);
            }
            state.idle.push_back(processor);
            Self::drain_ready(&mut state)
        };
        self.launch(ready);
    }

    fn drain_ready(state: &mut State) -> Vec<(String, Arc<Processor>, WorkItem)> {
        std::iter::from_fn(|| state.next_dispatch()).collect()
    }

    fn launch(self: &Arc<Self>, ready: Vec<(String, Arc<Processor>, WorkItem)>) {
        for (key, processor, item) in ready {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let release = Release {
                    scheduler,
                    key,
                    processor: Some(Arc::clone(&processor)),
                };
                // The outcome already reached the item's completion handle.
                let _ = processor.process(item).await;
                drop(release);
            });
        }
    }

    /// Drop per-key queues that are empty and not in flight.
    pub fn sweep(&self) {
        let mut state = self.lock();
        let State {
            queues, in_flight, ..
        } = &mut *state;
        let before = queues.len();
        queues.retain(|key, queue| !queue.is_empty() || in_flight.contains(key));
        let removed = before - queues.len();
        if removed > 0 {
            tracing::debug!(scheduler = %self.name, removed, "swept empty queues");
        }
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock();
        SchedulerStats {
            queued: state.queues.values().map(VecDeque::len).sum(),
            in_flight: state.in_flight.len(),
            idle: state.idle.len(),
            queues: state.queues.len(),
        }
    }

    /// Returns `true` once [`dispose`](Scheduler::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Reject every queued item with [`ProcessError::Disposed`] and stop
    /// the sweep. Items already executing finish on their processors.
    ///
    /// Calling `dispose` more than once is safe.
    pub async fn dispose(&self) {
        let rejected: Vec<WorkItem> = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.rotation.clear();
            state.in_rotation.clear();
            state.idle.clear();
            state.queues.drain().flat_map(|(_, queue)| queue).collect()
        };
        let count = rejected.len();
        for item in rejected {
            let _ = item.done.send(Err(ProcessError::Disposed));
        }
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.sweep_task.lock().await.take()
            && let Err(e) = task.await
        {
            tracing::error!(scheduler = %self.name, error = %e, "sweep task panicked");
        }
        tracing::debug!(scheduler = %self.name, rejected = count, "scheduler disposed");
    }
}

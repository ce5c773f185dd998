//! Task queue and concurrency coordinator
//!
//! One FIFO of feedback tasks per engine, drained by a single consumer loop.
//! Producers never run work directly: `add` posts to the loop's inbox and
//! (re)arms a short coalescing timer, so a burst of enqueues costs one
//! scheduling pass.
//!
//! Scheduling only ever looks at the queue head:
//! - `finalReport` is exclusive: it starts only when nothing runs, and nothing
//!   starts while it runs.
//! - `storyFeedback` and `nodeUpdateFeedback` are per-type singletons that
//!   launch fire-and-forget; the pass continues with the next head.
//! - everything else is sequential, one at a time.
//!
//! While an exclusive or sequential task runs the loop is parked on it: passes
//! resume only when it finishes. A busy head blocks everything behind it
//! (head-of-line blocking is intentional).

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worldloom_core::{now_millis, FeedbackTask, Result, TaskKind};

// ---------------------------------------------------------------------------
// Concurrency classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyClass {
    /// `finalReport`
    Exclusive,
    /// `storyFeedback`
    Story,
    /// `nodeUpdateFeedback`
    NodeUpdate,
    /// Everything else, including kinds this engine does not know.
    Sequential,
}

impl ConcurrencyClass {
    pub fn of(kind: &TaskKind) -> Self {
        match kind {
            TaskKind::FinalReport => ConcurrencyClass::Exclusive,
            TaskKind::StoryFeedback => ConcurrencyClass::Story,
            TaskKind::NodeUpdateFeedback => ConcurrencyClass::NodeUpdate,
            _ => ConcurrencyClass::Sequential,
        }
    }

    /// The loop waits for these before looking at the next head.
    pub fn is_awaited(self) -> bool {
        matches!(self, ConcurrencyClass::Exclusive | ConcurrencyClass::Sequential)
    }
}

// ---------------------------------------------------------------------------
// Runner and events
// ---------------------------------------------------------------------------

/// Executes one dequeued task. Errors are logged and the task is dropped.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: FeedbackTask) -> Result<()>;
}

/// Task lifecycle events, broadcast to any listener.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Queued { id: u64, kind: TaskKind },
    Started { id: u64, kind: TaskKind },
    Finished { id: u64, kind: TaskKind, elapsed_ms: u64 },
    Failed { id: u64, kind: TaskKind, error: String },
}

enum Command {
    Enqueue(FeedbackTask),
    EnqueueAfter(FeedbackTask, Duration),
    Delayed(FeedbackTask),
    Completed(ConcurrencyClass),
    WaitIdle(oneshot::Sender<()>),
}

/// Sends `Completed` when a task future ends, including on panic or abort,
/// so a class slot can never leak.
struct CompletionGuard {
    tx: mpsc::UnboundedSender<Command>,
    class: ConcurrencyClass,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Completed(self.class));
    }
}

// ---------------------------------------------------------------------------
// Coordinator handle
// ---------------------------------------------------------------------------

/// Cheap handle to a running scheduler loop.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CoordinatorEvent>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Start the consumer loop on the current tokio runtime. The runner is
    /// held weakly; once it is gone, dequeued tasks are dropped.
    pub fn spawn(runner: Weak<dyn TaskRunner>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let cancel = CancellationToken::new();

        let scheduler = Scheduler {
            rx,
            tx: tx.clone(),
            events: events.clone(),
            runner,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            debounce,
            deadline: None,
            delayed: 0,
            idle_waiters: Vec::new(),
            cancel: cancel.clone(),
        };
        tokio::spawn(scheduler.run());

        Self {
            tx,
            events,
            next_id: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    fn build(&self, kind: TaskKind, payload: Value, chat_history: Option<String>) -> FeedbackTask {
        FeedbackTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            kind,
            payload,
            chat_history,
            enqueue_time: now_millis(),
        }
    }

    /// Append a task to the tail of the queue. Never fails; returns the id.
    pub fn add(&self, kind: TaskKind, payload: Value, chat_history: Option<String>) -> u64 {
        let task = self.build(kind, payload, chat_history);
        let id = task.id;
        if self.tx.send(Command::Enqueue(task)).is_err() {
            warn!("Coordinator stopped, task {} dropped", id);
        }
        id
    }

    /// Append a task once `delay` has passed.
    pub fn add_after(&self, kind: TaskKind, payload: Value, delay: Duration) -> u64 {
        let task = self.build(kind, payload, None);
        let id = task.id;
        if self.tx.send(Command::EnqueueAfter(task, delay)).is_err() {
            warn!("Coordinator stopped, delayed task {} dropped", id);
        }
        id
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Resolves once nothing is queued, running, debouncing, or delayed.
    pub async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::WaitIdle(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Stop the loop and abort whatever is in flight.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop - the single consumer of the inbox
// ---------------------------------------------------------------------------

struct Scheduler {
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CoordinatorEvent>,
    runner: Weak<dyn TaskRunner>,
    queue: VecDeque<FeedbackTask>,
    in_flight: HashMap<ConcurrencyClass, JoinHandle<()>>,
    debounce: Duration,
    /// Coalescing timer; reset by every enqueue.
    deadline: Option<Instant>,
    /// Delayed enqueues not yet arrived.
    delayed: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(mut self) {
        debug!("Coordinator loop started");
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.abort_all();
                    break;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = timer => {
                    self.deadline = None;
                    self.pump();
                }
            }

            self.notify_idle();
        }
        debug!("Coordinator loop stopped ({} task(s) left queued)", self.queue.len());
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(task) => self.push(task),
            Command::EnqueueAfter(task, delay) => {
                self.delayed += 1;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Command::Delayed(task));
                });
            }
            Command::Delayed(task) => {
                self.delayed = self.delayed.saturating_sub(1);
                self.push(task);
            }
            Command::Completed(class) => {
                self.in_flight.remove(&class);
                self.pump();
            }
            Command::WaitIdle(waiter) => self.idle_waiters.push(waiter),
        }
    }

    fn push(&mut self, task: FeedbackTask) {
        debug!("Queued task {} ({}), depth {}", task.id, task.kind, self.queue.len() + 1);
        let _ = self.events.send(CoordinatorEvent::Queued {
            id: task.id,
            kind: task.kind.clone(),
        });
        self.queue.push_back(task);
        self.deadline = Some(Instant::now() + self.debounce);
    }

    fn parked(&self) -> bool {
        self.in_flight.keys().any(|c| c.is_awaited())
    }

    fn can_launch(&self, class: ConcurrencyClass) -> bool {
        if self.parked() {
            return false;
        }
        match class {
            ConcurrencyClass::Exclusive => self.in_flight.is_empty(),
            other => !self.in_flight.contains_key(&other),
        }
    }

    /// Launch eligible heads until the head is blocked or an awaited class
    /// has started.
    fn pump(&mut self) {
        while let Some(head) = self.queue.front() {
            let class = ConcurrencyClass::of(&head.kind);
            if !self.can_launch(class) {
                debug!("Head task {} ({}) waiting on {:?}", head.id, head.kind, class);
                break;
            }
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if !self.launch(class, task) {
                continue;
            }
            if class.is_awaited() {
                break;
            }
        }
    }

    fn launch(&mut self, class: ConcurrencyClass, task: FeedbackTask) -> bool {
        let Some(runner) = self.runner.upgrade() else {
            warn!("Task runner gone, dropping task {} ({})", task.id, task.kind);
            return false;
        };
        let guard = CompletionGuard {
            tx: self.tx.clone(),
            class,
        };
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let id = task.id;
            let kind = task.kind.clone();
            let started = Instant::now();
            let _ = events.send(CoordinatorEvent::Started {
                id,
                kind: kind.clone(),
            });

            match runner.run(task).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!("Task {} ({}) finished in {}ms", id, kind, elapsed_ms);
                    let _ = events.send(CoordinatorEvent::Finished { id, kind, elapsed_ms });
                }
                Err(e) => {
                    warn!("Task {} ({}) failed, dropping: {}", id, kind, e);
                    let _ = events.send(CoordinatorEvent::Failed {
                        id,
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        });

        self.in_flight.insert(class, handle);
        true
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty() && self.deadline.is_none() && self.delayed == 0
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn abort_all(&mut self) {
        for (class, handle) in self.in_flight.drain() {
            debug!("Aborting in-flight {:?} task", class);
            handle.abort();
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

//! Feedback engine: one instance per authoring session
//!
//! Owns the call ledger, the five memory documents and the coordinator, with
//! every collaborator injected. Ledger operations are synchronous and never
//! fail from the caller's point of view; illegal ones are logged and ignored.
//! Every mutation is persisted as one blob and announced to subscribers.

use crate::config::FeedbackConfig;
use crate::ledger::CallLedger;
use crate::memory::{self, DocumentId, MemoryDocuments, MemorySnapshot, Route};
use crate::prompt::{format_chat_history, personality_context, PromptBuilder};
use crate::provider::{EntitySource, FeedbackGenerator, GeneratorError, MessageSink, NoEntities, NullSink};
use crate::queue::{Coordinator, CoordinatorEvent, TaskRunner};
use crate::storage::{InMemorySlot, KvSlot};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use worldloom_core::text::truncate_owned;
use worldloom_core::{CallRecord, ChatTurn, Error, FeedbackTask, Result, TaskKind};

/// Model name recorded on the engine's own generator calls.
pub const FEEDBACK_MODEL: &str = "feedback-generator";

/// Ledger snapshot listener. Receives every record, newest first.
pub type LedgerListener = Arc<dyn Fn(&[CallRecord]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct EngineState {
    ledger: CallLedger,
    documents: MemoryDocuments,
    /// Host calls that have received critique. Seeded from the loaded ledger.
    critiqued_calls: usize,
    /// Bumped on every mutation; orders slot writes.
    revision: u64,
}

struct EngineInner {
    config: FeedbackConfig,
    state: Mutex<EngineState>,
    generator: Arc<dyn FeedbackGenerator>,
    entities: Arc<dyn EntitySource>,
    sink: Arc<dyn MessageSink>,
    slot: Arc<dyn KvSlot>,
    /// Revision of the last blob handed to the slot.
    persisted: Mutex<u64>,
    coordinator: Coordinator,
    listeners: DashMap<u64, LedgerListener>,
    next_listener: AtomicU64,
}

/// Cheaply cloneable handle to a feedback engine.
#[derive(Clone)]
pub struct FeedbackEngine {
    inner: Arc<EngineInner>,
}

impl FeedbackEngine {
    /// Build an engine and start its coordinator on the current tokio runtime.
    /// Persisted state is loaded from `slot`; anything unreadable is rebuilt
    /// from defaults.
    pub fn new(
        config: FeedbackConfig,
        generator: Arc<dyn FeedbackGenerator>,
        entities: Arc<dyn EntitySource>,
        sink: Arc<dyn MessageSink>,
        slot: Arc<dyn KvSlot>,
    ) -> Self {
        let snapshot = load_snapshot(slot.as_ref(), &config.memory.storage_key);
        info!(
            "Feedback engine loaded {} ledger record(s) from '{}'",
            snapshot.calls.len(),
            config.memory.storage_key
        );

        let ledger = CallLedger::from_records(config.ledger.clone(), snapshot.calls);
        let critiqued_calls = ledger.critiqued_count();

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let runner: Weak<dyn TaskRunner> = weak.clone();
            let coordinator = Coordinator::spawn(runner, config.queue.debounce());
            EngineInner {
                state: Mutex::new(EngineState {
                    ledger,
                    documents: snapshot.documents,
                    critiqued_calls,
                    revision: 0,
                }),
                config,
                generator,
                entities,
                sink,
                slot,
                persisted: Mutex::new(0),
                coordinator,
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(0),
            }
        });

        Self { inner }
    }

    /// Engine with in-memory persistence and no world graph or report sink.
    pub fn with_generator(config: FeedbackConfig, generator: Arc<dyn FeedbackGenerator>) -> Self {
        Self::new(
            config,
            generator,
            Arc::new(NoEntities),
            Arc::new(NullSink),
            Arc::new(InMemorySlot::new()),
        )
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Call ledger
    // -----------------------------------------------------------------------

    /// Record the start of a model call.
    pub fn initiate(&self, id: &str, call_type: &str, model: &str, prompt: &str) {
        let result = self.inner.mutate(|s| s.ledger.initiate(id, call_type, model, prompt));
        match result {
            Ok(()) => debug!("Call {} ({}) started on {}", id, call_type, model),
            Err(e) => warn!("initiate ignored: {}", e),
        }
    }

    /// Record a call waiting for a provider slot.
    pub fn enqueue_call(&self, id: &str, call_type: &str, model: &str, prompt: &str) {
        if let Err(e) = self.inner.mutate(|s| s.ledger.enqueue(id, call_type, model, prompt)) {
            warn!("enqueue_call ignored: {}", e);
        }
    }

    /// Move a queued call to running.
    pub fn start_call(&self, id: &str) {
        if let Err(e) = self.inner.mutate(|s| s.ledger.start(id)) {
            warn!("start_call ignored: {}", e);
        }
    }

    /// Close a running call and queue critique of it.
    pub fn finalize(&self, id: &str, response: &str) {
        match self.inner.mutate(|s| s.ledger.finalize(id, response)) {
            Ok(request) => {
                debug!("Call {} completed ({} chars)", id, response.len());
                if let Some(request) = request {
                    self.inner.coordinator.add(request.kind, request.payload, None);
                }
            }
            Err(e) => warn!("finalize ignored: {}", e),
        }
    }

    /// Close a queued or running call with an error.
    pub fn fail(&self, id: &str, error: &str) {
        match self.inner.mutate(|s| s.ledger.fail(id, error)) {
            Ok(()) => debug!("Call {} failed: {}", id, error),
            Err(e) => warn!("fail ignored: {}", e),
        }
    }

    /// Record a host event (for example "user cleared the conversation") as
    /// an already-completed call and queue critique of it.
    pub fn record_external_event(&self, id: &str, prompt: &str, response: &str, event_type: &str) {
        match self
            .inner
            .mutate(|s| s.ledger.record_external(id, prompt, response, event_type))
        {
            Ok(request) => {
                debug!("External event {} ({}) recorded", id, event_type);
                if let Some(request) = request {
                    self.inner.coordinator.add(request.kind, request.payload, None);
                }
            }
            Err(e) => warn!("record_external_event ignored: {}", e),
        }
    }

    /// Every record, newest first.
    pub fn ledger_snapshot(&self) -> Vec<CallRecord> {
        self.inner.lock().ledger.snapshot()
    }

    /// Call `listener` with a fresh snapshot after every ledger mutation.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[CallRecord]) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.insert(id, Arc::new(listener));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.remove(&id.0).is_some()
    }

    // -----------------------------------------------------------------------
    // Coordinator
    // -----------------------------------------------------------------------

    /// Queue a feedback task. The recent chat turns, if given, are frozen
    /// into the task now. Never fails; returns the task id.
    pub fn add_task(&self, kind: TaskKind, payload: Value, chat_history: Option<&[ChatTurn]>) -> u64 {
        let limits = &self.inner.config.memory;
        let frozen = chat_history.and_then(|turns| {
            format_chat_history(turns, limits.chat_history_turns, limits.chat_turn_max_chars)
        });
        self.inner.coordinator.add(kind, payload, frozen)
    }

    /// Task lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.coordinator.events()
    }

    /// Resolves once no task is queued, running, or pending.
    pub async fn wait_idle(&self) {
        self.inner.coordinator.wait_idle().await;
    }

    /// Stop the coordinator and abort in-flight tasks.
    pub fn shutdown(&self) {
        self.inner.coordinator.shutdown();
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    pub fn documents(&self) -> MemoryDocuments {
        self.inner.lock().documents.clone()
    }

    /// Back to default documents and an empty ledger.
    pub fn reset_memory(&self) {
        self.inner.mutate(|s| {
            s.documents = MemoryDocuments::default();
            s.ledger.clear();
            s.critiqued_calls = 0;
        });
        info!("Feedback memory reset");
    }

    pub fn export_memory(&self) -> MemorySnapshot {
        let state = self.inner.lock();
        state.snapshot()
    }

    /// Replace documents and ledger. The synthesis cadence continues from
    /// the imported critiques.
    pub fn import_memory(&self, snapshot: MemorySnapshot) {
        let count = snapshot.calls.len();
        self.inner.mutate(|s| {
            s.documents = snapshot.documents;
            s.ledger.replace_all(snapshot.calls);
            s.critiqued_calls = s.ledger.critiqued_count();
        });
        info!("Imported feedback memory ({} ledger record(s))", count);
    }

    /// Strict import of a user-supplied JSON export.
    pub fn import_memory_json(&self, json: &str) -> Result<()> {
        let snapshot = MemorySnapshot::from_json_strict(json)?;
        self.import_memory(snapshot);
        Ok(())
    }
}

fn load_snapshot(slot: &dyn KvSlot, key: &str) -> MemorySnapshot {
    match slot.get(key) {
        Ok(Some(blob)) => MemorySnapshot::from_blob(&blob),
        Ok(None) => MemorySnapshot::default(),
        Err(e) => {
            error!("Failed to read feedback memory '{}': {}, using defaults", key, e);
            MemorySnapshot::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

impl EngineState {
    fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            documents: self.documents.clone(),
            calls: self.ledger.records().cloned().collect(),
        }
    }
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` under the state lock, then persist and notify listeners
    /// with the lock released.
    fn mutate<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        let (out, revision, blob, records) = {
            let mut state = self.lock();
            let out = f(&mut *state);
            state.revision += 1;
            let blob = state.snapshot().to_blob();
            (out, state.revision, blob, state.ledger.snapshot())
        };
        match blob {
            Ok(blob) => self.persist(revision, &blob),
            Err(e) => error!("Failed to serialize feedback memory: {}", e),
        }
        self.notify(&records);
        out
    }

    /// Write `blob` unless a later revision already reached the slot. The
    /// slot may read the engine but must not mutate it.
    fn persist(&self, revision: u64, blob: &str) {
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if *persisted >= revision {
            debug!("Skipping stale feedback memory revision {}", revision);
            return;
        }
        let key = &self.config.memory.storage_key;
        if let Err(e) = self.slot.set(key, blob) {
            error!("Failed to persist feedback memory '{}': {}", key, e);
            return;
        }
        *persisted = revision;
    }

    fn notify(&self, snapshot: &[CallRecord]) {
        let listeners: Vec<LedgerListener> = self.listeners.iter().map(|l| l.value().clone()).collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn prompts(&self) -> PromptBuilder<'_> {
        PromptBuilder::new(&self.config.prompts, &self.config.memory)
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Run one generator call, ledgered under the internal call type so it
    /// is never critiqued itself.
    async fn generate(&self, task: &FeedbackTask, prompt: String) -> Result<String> {
        let (call_id, call_type) = {
            let state = self.lock();
            (
                format!("{}-{}-{}", self.config.ledger.internal_call_prefix, task.id, uuid::Uuid::new_v4()),
                state.ledger.internal_call_type(&task.kind),
            )
        };
        let opened = self.mutate(|s| s.ledger.initiate(&call_id, &call_type, FEEDBACK_MODEL, &prompt));
        if let Err(e) = opened {
            warn!("Could not ledger feedback call {}: {}", call_id, e);
        }

        let call = self.generator.generate(&prompt, Some(call_type.as_str()));
        let result = match self.config.queue.generation_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(GeneratorError::TimedOut(self.config.queue.generation_timeout_ms)),
            },
            None => call.await,
        };

        let result = result.and_then(|text| {
            let text = text.trim().to_string();
            if text.is_empty() {
                Err(GeneratorError::EmptyResponse)
            } else {
                Ok(text)
            }
        });

        match result {
            Ok(text) => {
                let closed = self.mutate(|s| s.ledger.finalize(&call_id, &text));
                match closed {
                    Ok(None) => {}
                    Ok(Some(request)) => {
                        error!("Internal call {} classified as {}; not queued", call_id, request.kind)
                    }
                    Err(e) => debug!("Feedback call {} not closed: {}", call_id, e),
                }
                Ok(text)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(le) = self.mutate(|s| s.ledger.fail(&call_id, &message)) {
                    debug!("Feedback call {} not failed: {}", call_id, le);
                }
                Err(Error::Generator(message))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Task handlers
    // -----------------------------------------------------------------------

    async fn update_document(&self, task: &FeedbackTask, document: DocumentId, payload: &Value) -> Result<()> {
        let personality = personality_context(&self.entities.list_entities());
        let prompt = {
            let state = self.lock();
            self.prompts().document_update(
                &task.kind,
                document,
                state.documents.get(document),
                payload,
                personality.as_deref(),
                task.chat_history.as_deref(),
            )
        };
        let text = self.generate(task, prompt).await?;
        self.write_document(document, text);
        Ok(())
    }

    /// Last write wins. `storyFeedback` and `nodeUpdateFeedback` can both be
    /// writing `nodeEdition` at once; the earlier result is overwritten.
    fn write_document(&self, document: DocumentId, text: String) {
        let new_len = text.len();
        let previous = self.mutate(|s| s.documents.replace(document, text));
        debug!("Document {} rewritten ({} -> {} bytes)", document, previous.len(), new_len);
    }

    async fn critique_call(&self, task: &FeedbackTask, document: Option<DocumentId>) -> Result<()> {
        let call_id = task
            .payload
            .get("callId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Internal(format!("task {} has no callId", task.id)))?
            .to_string();

        let prompt = self
            .prompts()
            .call_critique(&task.kind, &task.payload, task.chat_history.as_deref());
        let critique = self.generate(task, prompt).await?;

        let counted = self.mutate(|s| {
            if !s.ledger.attach_feedback(&call_id, &critique) {
                return None;
            }
            let external = s.ledger.get(&call_id).is_some_and(|r| r.external);
            if external {
                return None;
            }
            s.critiqued_calls += 1;
            Some(s.critiqued_calls)
        });

        match counted {
            Some(n) => {
                let every = self.config.queue.synthesis_every;
                if every > 0 && n % every == 0 {
                    info!("{} calls critiqued, queueing general memory synthesis", n);
                    self.coordinator.add(
                        TaskKind::UpdateGeneralMemory,
                        json!({ "trigger": "periodic", "critiquedCalls": n }),
                        None,
                    );
                }
            }
            None => debug!("Critique for {} not counted (evicted or external)", call_id),
        }

        if let Some(document) = document {
            let mut payload = task.payload.clone();
            if let Value::Object(map) = &mut payload {
                map.insert("critique".into(), Value::String(critique));
            }
            self.update_document(task, document, &payload).await?;
        }
        Ok(())
    }

    async fn synthesize(&self, task: &FeedbackTask) -> Result<()> {
        let note = task.payload.get("report").and_then(Value::as_str);
        let prompt = {
            let state = self.lock();
            let recent = state.ledger.recent_feedback(self.config.memory.recent_feedback_count);
            self.prompts().synthesis(&state.documents, &recent, note)
        };
        let text = self.generate(task, prompt).await?;
        let capped = truncate_owned(&text, self.config.memory.general_memory_max_chars);
        self.write_document(DocumentId::GeneralMemory, capped);
        Ok(())
    }

    async fn final_report(&self, task: &FeedbackTask) -> Result<()> {
        let prompt = {
            let state = self.lock();
            self.prompts().final_report(&state.documents, task.chat_history.as_deref())
        };
        let report = self.generate(task, prompt).await?;
        self.sink.deliver(&report);
        info!("Final report delivered ({} chars)", report.len());

        self.coordinator.add_after(
            TaskKind::UpdateGeneralMemory,
            json!({ "trigger": "finalReport", "report": report }),
            self.config.queue.report_fold_delay(),
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskRunner for EngineInner {
    async fn run(&self, task: FeedbackTask) -> Result<()> {
        debug!("Running task {} ({})", task.id, task.kind);
        match memory::route(&task.kind) {
            Route::Document(document) => self.update_document(&task, document, &task.payload).await,
            Route::Call { document } => self.critique_call(&task, document).await,
            Route::Synthesis => self.synthesize(&task).await,
            Route::Report => self.final_report(&task).await,
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

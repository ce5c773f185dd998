//! Integration tests for worldloom-feedback
//!
//! These drive a whole engine through its public surface with a scripted
//! generator: classification of finished calls, periodic synthesis, the
//! final report fold-back, persistence and the ledger listeners.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;
use worldloom_core::{CallStatus, ChatTurn, Entity, TaskKind};
use worldloom_feedback::config::FeedbackConfig;
use worldloom_feedback::memory::{MemoryDocuments, MemorySnapshot};
use worldloom_feedback::provider::{
    EntitySource, FeedbackGenerator, GeneratorError, GeneratorResult, MessageSink, NoEntities, NullSink,
};
use worldloom_feedback::queue::CoordinatorEvent;
use worldloom_feedback::storage::{FileSlot, InMemorySlot, KvSlot};
use worldloom_feedback::FeedbackEngine;

// ============================================================
// Fakes
// ============================================================

#[derive(Debug, Clone)]
struct Prompted {
    prompt: String,
    call_type: Option<String>,
}

/// Numbered replies; optionally fails or stalls for one call type.
struct ScriptedGenerator {
    calls: Mutex<Vec<Prompted>>,
    counter: AtomicUsize,
    fail_call_type: Option<String>,
    stall: Option<Duration>,
    reply: Option<String>,
}

impl ScriptedGenerator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            fail_call_type: None,
            stall: None,
            reply: None,
        })
    }

    fn failing_on(call_type: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_call_type: Some(call_type.to_string()),
            ..Self::plain()
        })
    }

    fn stalling(stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            stall: Some(stall),
            ..Self::plain()
        })
    }

    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            ..Self::plain()
        })
    }

    fn plain() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            fail_call_type: None,
            stall: None,
            reply: None,
        }
    }

    fn calls(&self) -> Vec<Prompted> {
        self.calls.lock().unwrap().clone()
    }

    fn prompts_for(&self, call_type: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.call_type.as_deref() == Some(call_type))
            .map(|c| c.prompt)
            .collect()
    }
}

#[async_trait::async_trait]
impl FeedbackGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, call_type: Option<&str>) -> GeneratorResult<String> {
        self.calls.lock().unwrap().push(Prompted {
            prompt: prompt.to_string(),
            call_type: call_type.map(str::to_string),
        });
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if call_type.is_some() && call_type == self.fail_call_type.as_deref() {
            return Err(GeneratorError::RequestFailed("scripted outage".into()));
        }
        if let Some(reply) = &self.reply {
            return Ok(reply.clone());
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("  critique #{} for {}  ", n, call_type.unwrap_or("?")))
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<String>>,
}

impl MessageSink for RecordingSink {
    fn deliver(&self, message: &str) {
        self.delivered.lock().unwrap().push(message.to_string());
    }
}

/// Reads the engine from inside `set`, the way a host mirroring the ledger
/// into its own store would.
#[derive(Default)]
struct MirroringSlot {
    store: InMemorySlot,
    engine: OnceLock<FeedbackEngine>,
    mirrored: Mutex<Vec<usize>>,
}

impl KvSlot for MirroringSlot {
    fn get(&self, key: &str) -> worldloom_core::Result<Option<String>> {
        self.store.get(key)
    }

    fn set(&self, key: &str, blob: &str) -> worldloom_core::Result<()> {
        if let Some(engine) = self.engine.get() {
            self.mirrored.lock().unwrap().push(engine.ledger_snapshot().len());
        }
        self.store.set(key, blob)
    }

    fn remove(&self, key: &str) -> worldloom_core::Result<()> {
        self.store.remove(key)
    }
}

struct StaticEntities(Vec<Entity>);

impl EntitySource for StaticEntities {
    fn list_entities(&self) -> Vec<Entity> {
        self.0.clone()
    }
}

fn engine(generator: Arc<ScriptedGenerator>) -> FeedbackEngine {
    FeedbackEngine::with_generator(FeedbackConfig::default(), generator)
}

fn engine_on(slot: Arc<dyn KvSlot>, generator: Arc<ScriptedGenerator>) -> FeedbackEngine {
    FeedbackEngine::new(
        FeedbackConfig::default(),
        generator,
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot,
    )
}

fn drain(rx: &mut broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn queued(events: &[CoordinatorEvent], kind: &TaskKind) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::Queued { kind: k, .. } if k == kind))
        .count()
}

fn complete_call(engine: &FeedbackEngine, id: &str, call_type: &str) {
    engine.initiate(id, call_type, "model-x", "plan the next scene");
    engine.finalize(id, "a plan");
}

// ============================================================
// Classification and critique
// ============================================================

#[tokio::test(start_paused = true)]
async fn narrative_call_gets_one_chat_text_task() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let mut events = engine.events();

    engine.initiate("c1", "chat_text_generation", "m", "[STORY_CONTINUATION] go on");
    engine.finalize("c1", "The knight rode on.");
    engine.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(queued(&events, &TaskKind::ChatTextFeedback), 1);
    assert_eq!(queued(&events, &TaskKind::LlmCallFeedback), 0);

    let record = engine
        .ledger_snapshot()
        .into_iter()
        .find(|r| r.id == "c1")
        .unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert!(record.duration.unwrap() >= 0);
    assert_eq!(record.feedback.as_deref(), Some("critique #1 for feedback:chatTextFeedback"));

    // Critique first, then the chatText rewrite which sees the critique.
    let prompts = generator.prompts_for("feedback:chatTextFeedback");
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("critique #1"));
    assert_eq!(engine.documents().chat_text, "critique #2 for feedback:chatTextFeedback");
}

#[tokio::test(start_paused = true)]
async fn other_call_gets_llm_call_task() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let mut events = engine.events();

    complete_call(&engine, "t1", "tool_planning");
    engine.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(queued(&events, &TaskKind::LlmCallFeedback), 1);
    assert_eq!(generator.prompts_for("feedback:llmCallFeedback").len(), 1);
    // No document is rewritten for plain call critique.
    assert_eq!(engine.documents(), MemoryDocuments::default());
}

#[tokio::test(start_paused = true)]
async fn feedback_calls_are_ledgered_but_never_critiqued() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let mut events = engine.events();

    complete_call(&engine, "t1", "tool_planning");
    engine.wait_idle().await;

    let internal: Vec<_> = engine
        .ledger_snapshot()
        .into_iter()
        .filter(|r| r.call_type.starts_with("feedback:"))
        .collect();
    assert_eq!(internal.len(), 1);
    assert_eq!(internal[0].status, CallStatus::Completed);
    assert!(internal[0].feedback.is_none());

    // Exactly one task in total: the critique of t1.
    let events = drain(&mut events);
    let all_queued = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::Queued { .. }))
        .count();
    assert_eq!(all_queued, 1);
}

#[tokio::test(start_paused = true)]
async fn illegal_ledger_operations_are_ignored() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let mut events = engine.events();

    engine.finalize("ghost", "nothing");
    engine.fail("ghost", "nothing");
    complete_call(&engine, "t1", "tool_planning");
    engine.finalize("t1", "again");
    engine.initiate("t1", "tool_planning", "m", "dup");
    engine.wait_idle().await;

    let snapshot = engine.ledger_snapshot();
    let user_calls: Vec<_> = snapshot.iter().filter(|r| !r.call_type.starts_with("feedback:")).collect();
    assert_eq!(user_calls.len(), 1);
    assert_eq!(user_calls[0].response.as_deref(), Some("a plan"));
    assert_eq!(queued(&drain(&mut events), &TaskKind::LlmCallFeedback), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_call_moves_through_start() {
    let engine = engine(ScriptedGenerator::new());

    engine.enqueue_call("q1", "tool_planning", "m", "p");
    assert_eq!(engine.ledger_snapshot()[0].status, CallStatus::Queued);
    engine.start_call("q1");
    assert_eq!(engine.ledger_snapshot()[0].status, CallStatus::Running);
    engine.fail("q1", "provider refused");
    engine.wait_idle().await;

    let record = engine.ledger_snapshot().into_iter().find(|r| r.id == "q1").unwrap();
    assert_eq!(record.status, CallStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("provider refused"));
}

// ============================================================
// Periodic synthesis
// ============================================================

#[tokio::test(start_paused = true)]
async fn every_fifth_critique_triggers_synthesis() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    let mut events = engine.events();

    for i in 0..5 {
        complete_call(&engine, &format!("t{i}"), "tool_planning");
    }
    engine.wait_idle().await;
    assert_eq!(queued(&drain(&mut events), &TaskKind::UpdateGeneralMemory), 1);
    assert!(engine.documents().general_memory.starts_with("critique #"));

    for i in 5..10 {
        complete_call(&engine, &format!("t{i}"), "tool_planning");
    }
    engine.wait_idle().await;
    assert_eq!(queued(&drain(&mut events), &TaskKind::UpdateGeneralMemory), 1);

    let synthesis = generator.prompts_for("feedback:updateGeneralMemory");
    assert_eq!(synthesis.len(), 2);
    assert!(synthesis[1].contains("## Recent call feedback"));
}

#[tokio::test(start_paused = true)]
async fn burst_of_fifty_calls_keeps_every_critique() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());

    for i in 0..50 {
        complete_call(&engine, &format!("t{i}"), "tool_planning");
    }
    engine.wait_idle().await;

    let snapshot = engine.ledger_snapshot();
    let host: Vec<_> = snapshot
        .iter()
        .filter(|r| !r.call_type.starts_with("feedback:"))
        .collect();
    assert_eq!(host.len(), 50);
    assert!(host.iter().all(|r| r.feedback.is_some()));
    assert_eq!(generator.prompts_for("feedback:llmCallFeedback").len(), 50);
    assert_eq!(generator.prompts_for("feedback:updateGeneralMemory").len(), 10);

    let internal = snapshot.len() - host.len();
    assert_eq!(internal, FeedbackConfig::default().ledger.max_internal_records);
}

#[tokio::test(start_paused = true)]
async fn synthesis_cadence_survives_restart_and_import() {
    let slot: Arc<dyn KvSlot> = Arc::new(InMemorySlot::new());
    let first = engine_on(slot.clone(), ScriptedGenerator::new());
    for i in 0..3 {
        complete_call(&first, &format!("a{i}"), "tool_planning");
    }
    first.wait_idle().await;
    first.shutdown();

    let generator = ScriptedGenerator::new();
    let second = engine_on(slot, generator.clone());
    for i in 0..2 {
        complete_call(&second, &format!("b{i}"), "tool_planning");
    }
    second.wait_idle().await;
    assert_eq!(generator.prompts_for("feedback:updateGeneralMemory").len(), 1);

    let generator = ScriptedGenerator::new();
    let third = engine(generator.clone());
    third.import_memory(first.export_memory());
    for i in 0..2 {
        complete_call(&third, &format!("c{i}"), "tool_planning");
    }
    third.wait_idle().await;
    assert_eq!(generator.prompts_for("feedback:updateGeneralMemory").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn external_events_do_not_count_toward_synthesis() {
    let engine = engine(ScriptedGenerator::new());
    let mut events = engine.events();

    for i in 0..5 {
        engine.record_external_event(&format!("e{i}"), "user cleared chat", "", "chat_clear");
    }
    engine.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(queued(&events, &TaskKind::LlmCallFeedback), 5);
    assert_eq!(queued(&events, &TaskKind::UpdateGeneralMemory), 0);

    let external: Vec<_> = engine.ledger_snapshot().into_iter().filter(|r| r.external).collect();
    assert_eq!(external.len(), 5);
    assert!(external.iter().all(|r| r.feedback.is_some()));
}

#[tokio::test(start_paused = true)]
async fn synthesis_output_is_capped() {
    let mut config = FeedbackConfig::default();
    config.queue.synthesis_every = 1;
    config.memory.general_memory_max_chars = 40;
    let engine = FeedbackEngine::with_generator(config, ScriptedGenerator::replying(&"m".repeat(500)));

    complete_call(&engine, "t1", "tool_planning");
    engine.wait_idle().await;

    let general = engine.documents().general_memory;
    assert!(general.starts_with(&"m".repeat(40)));
    assert!(general.ends_with("... [truncated]"));
}

// ============================================================
// Document tasks
// ============================================================

#[tokio::test(start_paused = true)]
async fn document_task_sees_personality_history_and_bounded_payload() {
    let generator = ScriptedGenerator::new();
    let entities = StaticEntities(vec![Entity {
        id: "a1".into(),
        name: "Muse".into(),
        long_description: "Dry wit.".into(),
        entity_type: "assistant".into(),
        ..Default::default()
    }]);
    let engine = FeedbackEngine::new(
        FeedbackConfig::default(),
        generator.clone(),
        Arc::new(entities),
        Arc::new(NullSink),
        Arc::new(InMemorySlot::new()),
    );

    let turns = vec![
        ChatTurn::system("hidden"),
        ChatTurn::user("describe the tower"),
        ChatTurn::assistant("It leans."),
    ];
    engine.add_task(
        TaskKind::StoryFeedback,
        json!({"story": "The tower leaned.", "cover": "data:image/png;base64,AAAA"}),
        Some(turns.as_slice()),
    );
    engine.wait_idle().await;

    let prompt = &generator.prompts_for("feedback:storyFeedback")[0];
    assert!(prompt.contains("### Muse"));
    assert!(prompt.contains("user: describe the tower\nassistant: It leans."));
    assert!(!prompt.contains("hidden"));
    assert!(prompt.contains("The tower leaned."));
    assert!(!prompt.contains("data:image"));
    assert_eq!(engine.documents().node_edition, "critique #1 for feedback:storyFeedback");
}

#[tokio::test(start_paused = true)]
async fn unknown_kind_updates_general_memory() {
    let engine = engine(ScriptedGenerator::new());
    engine.add_task(TaskKind::from("worldReview"), json!({"note": "x"}), None);
    engine.wait_idle().await;
    assert_eq!(engine.documents().general_memory, "critique #1 for feedback:worldReview");
}

#[tokio::test(start_paused = true)]
async fn empty_output_leaves_document_unchanged() {
    let engine = FeedbackEngine::with_generator(FeedbackConfig::default(), ScriptedGenerator::replying("   "));
    let mut events = engine.events();

    engine.add_task(TaskKind::NodeEditFeedback, json!({"edit": "renamed"}), None);
    engine.wait_idle().await;

    assert_eq!(engine.documents(), MemoryDocuments::default());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Failed { kind: TaskKind::NodeEditFeedback, .. })));
}

#[tokio::test(start_paused = true)]
async fn generator_failure_drops_task_and_queue_moves_on() {
    let generator = ScriptedGenerator::failing_on("feedback:assistantFeedback");
    let engine = engine(generator.clone());
    let mut events = engine.events();

    engine.add_task(TaskKind::AssistantFeedback, json!({"reply": "hi"}), None);
    engine.add_task(TaskKind::NodeEditFeedback, json!({"edit": "moved"}), None);
    engine.wait_idle().await;

    let docs = engine.documents();
    assert_eq!(docs.assistant_feedback, MemoryDocuments::default().assistant_feedback);
    assert!(docs.node_edit.starts_with("critique #"));

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Failed { kind: TaskKind::AssistantFeedback, .. })));
    let failed_call = engine
        .ledger_snapshot()
        .into_iter()
        .find(|r| r.call_type == "feedback:assistantFeedback")
        .unwrap();
    assert_eq!(failed_call.status, CallStatus::Failed);
    assert!(failed_call.error.unwrap().contains("scripted outage"));
}

#[tokio::test(start_paused = true)]
async fn slow_generator_times_out_when_configured() {
    let mut config = FeedbackConfig::default();
    config.queue.generation_timeout_ms = 50;
    let engine = FeedbackEngine::with_generator(config, ScriptedGenerator::stalling(Duration::from_secs(5)));
    let mut events = engine.events();

    engine.add_task(TaskKind::NodeEditFeedback, json!({}), None);
    engine.wait_idle().await;

    assert_eq!(engine.documents(), MemoryDocuments::default());
    let failed = drain(&mut events).into_iter().find_map(|e| match e {
        CoordinatorEvent::Failed { error, .. } => Some(error),
        _ => None,
    });
    assert!(failed.unwrap().contains("timed out after 50ms"));
}

// ============================================================
// Final report
// ============================================================

#[tokio::test(start_paused = true)]
async fn final_report_is_delivered_then_folded_back() {
    let generator = ScriptedGenerator::new();
    let sink = Arc::new(RecordingSink::default());
    let engine = FeedbackEngine::new(
        FeedbackConfig::default(),
        generator.clone(),
        Arc::new(NoEntities),
        sink.clone(),
        Arc::new(InMemorySlot::new()),
    );
    let mut events = engine.events();

    engine.add_task(TaskKind::FinalReport, json!({}), Some(vec![ChatTurn::user("wrap it up")].as_slice()));
    engine.wait_idle().await;

    let delivered = sink.delivered.lock().unwrap().clone();
    assert_eq!(delivered, vec!["critique #1 for feedback:finalReport".to_string()]);

    let events = drain(&mut events);
    assert_eq!(queued(&events, &TaskKind::FinalReport), 1);
    assert_eq!(queued(&events, &TaskKind::UpdateGeneralMemory), 1);

    let synthesis = generator.prompts_for("feedback:updateGeneralMemory");
    assert_eq!(synthesis.len(), 1);
    assert!(synthesis[0].contains("## Final report\n\ncritique #1 for feedback:finalReport"));
    assert_eq!(engine.documents().general_memory, "critique #2 for feedback:updateGeneralMemory");
}

// ============================================================
// Persistence
// ============================================================

#[tokio::test(start_paused = true)]
async fn export_import_round_trip() {
    let engine_a = engine(ScriptedGenerator::new());
    complete_call(&engine_a, "t1", "tool_planning");
    engine_a.add_task(TaskKind::NodeEditFeedback, json!({"edit": "x"}), None);
    engine_a.wait_idle().await;
    let exported = engine_a.export_memory();

    let engine_b = engine(ScriptedGenerator::new());
    engine_b.import_memory(exported.clone());
    assert_eq!(engine_b.export_memory(), exported);

    let engine_c = engine(ScriptedGenerator::new());
    engine_c.import_memory_json(&exported.to_blob().unwrap()).unwrap();
    assert_eq!(engine_c.export_memory(), exported);
}

#[tokio::test(start_paused = true)]
async fn import_rejects_malformed_json() {
    let engine = engine(ScriptedGenerator::new());
    assert!(engine.import_memory_json("{ not json").is_err());
    assert_eq!(engine.documents(), MemoryDocuments::default());
}

#[tokio::test(start_paused = true)]
async fn state_survives_a_new_engine_on_the_same_slot() {
    let slot: Arc<dyn KvSlot> = Arc::new(InMemorySlot::new());
    let first = FeedbackEngine::new(
        FeedbackConfig::default(),
        ScriptedGenerator::new(),
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot.clone(),
    );
    first.add_task(TaskKind::AssistantFeedback, json!({"reply": "hello"}), None);
    first.wait_idle().await;
    let before = first.export_memory();

    let second = FeedbackEngine::new(
        FeedbackConfig::default(),
        ScriptedGenerator::new(),
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot,
    );
    assert_eq!(second.export_memory(), before);
}

#[tokio::test(start_paused = true)]
async fn slot_may_read_the_engine_while_persisting() {
    let slot = Arc::new(MirroringSlot::default());
    let engine = engine_on(slot.clone(), ScriptedGenerator::new());
    assert!(slot.engine.set(engine.clone()).is_ok());

    complete_call(&engine, "t1", "tool_planning");
    engine.add_task(TaskKind::NodeEditFeedback, json!({"edit": "x"}), None);
    engine.wait_idle().await;

    let mirrored = slot.mirrored.lock().unwrap().clone();
    assert!(mirrored.len() >= 4);
    assert_eq!(mirrored[0], 1);

    let blob = slot.get("worldloom_feedback_memory").unwrap().unwrap();
    assert_eq!(MemorySnapshot::from_blob(&blob), engine.export_memory());
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn corrupt_blob_resets_to_defaults() {
    let slot = Arc::new(InMemorySlot::new());
    let key = FeedbackConfig::default().memory.storage_key;
    slot.set(&key, "<<garbage>>").unwrap();

    let engine = FeedbackEngine::new(
        FeedbackConfig::default(),
        ScriptedGenerator::new(),
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot,
    );
    assert_eq!(engine.documents(), MemoryDocuments::default());
    assert!(engine.ledger_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn partial_blob_keeps_valid_sections() {
    let slot = Arc::new(InMemorySlot::new());
    let key = FeedbackConfig::default().memory.storage_key;
    slot.set(&key, r#"{"GeneralMemory": "kept", "nodeEdit": 7, "llmCalls": "nope"}"#).unwrap();

    let engine = FeedbackEngine::new(
        FeedbackConfig::default(),
        ScriptedGenerator::new(),
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot,
    );
    let docs = engine.documents();
    assert_eq!(docs.general_memory, "kept");
    assert_eq!(docs.node_edit, MemoryDocuments::default().node_edit);
    assert!(engine.ledger_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_memory_restores_defaults_and_persists() {
    let dir = tempfile::TempDir::new().unwrap();
    let slot = Arc::new(FileSlot::new(dir.path()));
    let engine = FeedbackEngine::new(
        FeedbackConfig::default(),
        ScriptedGenerator::new(),
        Arc::new(NoEntities),
        Arc::new(NullSink),
        slot.clone(),
    );
    complete_call(&engine, "t1", "tool_planning");
    engine.add_task(TaskKind::NodeEditFeedback, json!({}), None);
    engine.wait_idle().await;
    assert!(!engine.ledger_snapshot().is_empty());

    engine.reset_memory();
    assert_eq!(engine.documents(), MemoryDocuments::default());
    assert!(engine.ledger_snapshot().is_empty());

    let blob = slot.get("worldloom_feedback_memory").unwrap().unwrap();
    assert_eq!(MemorySnapshot::from_blob(&blob), MemorySnapshot::default());
}

// ============================================================
// Listeners and lifecycle
// ============================================================

#[tokio::test(start_paused = true)]
async fn listeners_see_each_mutation_until_unsubscribed() {
    let engine = engine(ScriptedGenerator::new());
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));

    let sink = seen.clone();
    let id = engine.subscribe(move |records| sink.lock().unwrap().push(records.len()));

    engine.initiate("t1", "tool_planning", "m", "p");
    engine.initiate("t2", "tool_planning", "m", "p");
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    assert!(engine.unsubscribe(id));
    assert!(!engine.unsubscribe(id));
    engine.initiate("t3", "tool_planning", "m", "p");
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn listener_may_read_the_engine() {
    let engine = engine(ScriptedGenerator::new());
    let reader = engine.clone();
    let lengths = Arc::new(Mutex::new(Vec::new()));
    let out = lengths.clone();
    engine.subscribe(move |_| out.lock().unwrap().push(reader.ledger_snapshot().len()));

    engine.initiate("t1", "tool_planning", "m", "p");
    assert_eq!(*lengths.lock().unwrap(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn engines_are_independent() {
    let a = engine(ScriptedGenerator::new());
    let b = engine(ScriptedGenerator::new());
    a.initiate("t1", "tool_planning", "m", "p");
    assert_eq!(a.ledger_snapshot().len(), 1);
    assert!(b.ledger_snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_new_work() {
    let generator = ScriptedGenerator::new();
    let engine = engine(generator.clone());
    engine.shutdown();
    engine.add_task(TaskKind::NodeEditFeedback, json!({}), None);
    engine.wait_idle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(generator.calls().is_empty());
}

//! Prompt composition for every feedback task
//!
//! Payloads reach the generator only through [`bounded_payload`], which keeps
//! known shapes to an allow-list, strips image data and caps string length.

use crate::config::{MemoryConfig, PromptConfig};
use crate::memory::{DocumentId, MemoryDocuments};
use serde_json::{Map, Value};
use worldloom_core::text::truncate;
use worldloom_core::{CallRecord, ChatTurn, Entity, Role, TaskKind};

const MESSAGE_FIELDS: &[&str] = &["role", "content", "timestamp"];
const ENTITY_FIELDS: &[&str] = &["id", "name", "type", "longDescription", "rules", "children", "parentId"];
const IMAGE_FIELDS: &[&str] = &["image", "images", "imageUrl", "image_url", "imageData", "thumbnail", "base64"];

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Freeze the last relevant chat turns into prompt text. System turns and
/// empty turns are not relevant. Returns `None` when nothing is left.
pub fn format_chat_history(turns: &[ChatTurn], max_turns: usize, turn_max_chars: usize) -> Option<String> {
    let relevant: Vec<&ChatTurn> = turns
        .iter()
        .filter(|t| t.role != Role::System && !t.content.trim().is_empty())
        .collect();
    if relevant.is_empty() || max_turns == 0 {
        return None;
    }
    let start = relevant.len().saturating_sub(max_turns);
    let lines: Vec<String> = relevant[start..]
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), truncate(t.content.trim(), turn_max_chars)))
        .collect();
    Some(lines.join("\n"))
}

/// Personality notes taken from "assistant"-typed entities.
pub fn personality_context(entities: &[Entity]) -> Option<String> {
    let parts: Vec<String> = entities
        .iter()
        .filter(|e| e.is_assistant())
        .map(|e| {
            let mut part = format!("### {}", if e.name.is_empty() { &e.id } else { &e.name });
            if !e.long_description.trim().is_empty() {
                part.push('\n');
                part.push_str(e.long_description.trim());
            }
            if !e.rules.trim().is_empty() {
                part.push_str("\nRules: ");
                part.push_str(e.rules.trim());
            }
            part
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Copy a payload for prompting: allow-listed fields for chat messages and
/// world entities, no image data anywhere, long strings truncated.
pub fn bounded_payload(value: &Value, string_max_chars: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, string_max_chars).into_owned()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| !is_image_data(v))
                .map(|v| bounded_payload(v, string_max_chars))
                .collect(),
        ),
        Value::Object(map) => {
            let allow = if looks_like_message(map) {
                Some(MESSAGE_FIELDS)
            } else if looks_like_entity(map) {
                Some(ENTITY_FIELDS)
            } else {
                None
            };
            let mut out = Map::new();
            for (key, v) in map {
                if IMAGE_FIELDS.contains(&key.as_str()) || is_image_data(v) {
                    continue;
                }
                if allow.is_some_and(|fields| !fields.contains(&key.as_str())) {
                    continue;
                }
                out.insert(key.clone(), bounded_payload(v, string_max_chars));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn is_image_data(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.starts_with("data:image/"))
}

fn looks_like_message(map: &Map<String, Value>) -> bool {
    map.get("role").is_some_and(Value::is_string) && map.contains_key("content")
}

fn looks_like_entity(map: &Map<String, Value>) -> bool {
    map.contains_key("longDescription")
        || (map.contains_key("id") && map.contains_key("name") && map.contains_key("type"))
}

fn render_payload(payload: &Value, string_max_chars: usize) -> String {
    let bounded = bounded_payload(payload, string_max_chars);
    serde_json::to_string_pretty(&bounded).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builds the prompt for each task family from config and engine state.
pub struct PromptBuilder<'a> {
    prompts: &'a PromptConfig,
    limits: &'a MemoryConfig,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(prompts: &'a PromptConfig, limits: &'a MemoryConfig) -> Self {
        Self { prompts, limits }
    }

    fn section(&self, out: &mut String, title: &str, body: &str) {
        out.push_str("## ");
        out.push_str(title);
        out.push_str("\n\n");
        out.push_str(body.trim());
        out.push_str("\n\n");
    }

    fn document_section(&self, out: &mut String, docs: &MemoryDocuments, id: DocumentId) {
        let text = truncate(docs.get(id), self.limits.document_max_chars);
        self.section(out, &format!("Document: {}", id), &text);
    }

    /// Critique-only rewrite of one document in light of a task payload.
    pub fn document_update(
        &self,
        kind: &TaskKind,
        document: DocumentId,
        current: &str,
        payload: &Value,
        personality: Option<&str>,
        chat_history: Option<&str>,
    ) -> String {
        let mut out = String::new();
        self.section(&mut out, "Instructions", &self.prompts.document_update);
        if let Some(p) = personality {
            self.section(&mut out, "Assistant personality", p);
        }
        if let Some(history) = chat_history {
            self.section(&mut out, "Recent conversation", history);
        }
        let current = truncate(current, self.limits.document_max_chars);
        self.section(&mut out, &format!("Current document: {}", document), &current);
        self.section(
            &mut out,
            &format!("New event ({})", kind),
            &render_payload(payload, self.limits.payload_string_max_chars),
        );
        out
    }

    /// Critique of a single ledgered model call.
    pub fn call_critique(&self, kind: &TaskKind, payload: &Value, chat_history: Option<&str>) -> String {
        let instructions = if *kind == TaskKind::ChatTextFeedback {
            &self.prompts.chat_text_critique
        } else {
            &self.prompts.call_critique
        };
        let mut out = String::new();
        self.section(&mut out, "Instructions", instructions);
        if let Some(history) = chat_history {
            self.section(&mut out, "Recent conversation", history);
        }
        self.section(
            &mut out,
            "Model call",
            &render_payload(payload, self.limits.payload_string_max_chars),
        );
        out
    }

    /// Fold every document plus recent call feedback into general memory.
    /// `report` is a final report whose observations should be kept.
    pub fn synthesis(&self, docs: &MemoryDocuments, recent: &[&CallRecord], report: Option<&str>) -> String {
        let mut out = String::new();
        self.section(&mut out, "Instructions", &self.prompts.synthesis);
        for id in DocumentId::ALL {
            self.document_section(&mut out, docs, id);
        }
        if let Some(report) = report {
            let report = truncate(report, self.limits.document_max_chars);
            self.section(&mut out, "Final report", &report);
        }
        if !recent.is_empty() {
            let lines: Vec<String> = recent
                .iter()
                .filter_map(|r| {
                    r.feedback.as_deref().map(|fb| {
                        format!(
                            "- [{}] {}",
                            r.call_type,
                            truncate(fb, self.limits.payload_string_max_chars)
                        )
                    })
                })
                .collect();
            self.section(&mut out, "Recent call feedback", &lines.join("\n"));
        }
        out
    }

    /// Short report for the user.
    pub fn final_report(&self, docs: &MemoryDocuments, chat_history: Option<&str>) -> String {
        let mut out = String::new();
        self.section(&mut out, "Instructions", &self.prompts.final_report);
        for id in [DocumentId::GeneralMemory, DocumentId::ChatText, DocumentId::NodeEdition] {
            self.document_section(&mut out, docs, id);
        }
        if let Some(history) = chat_history {
            self.section(&mut out, "Recent conversation", history);
        }
        out
    }
}

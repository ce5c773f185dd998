//! Memory store: the five rolling critique documents and their persisted form
//!
//! Documents are whole-text replaced by each update (last write wins). The
//! persisted blob holds the documents and the call ledger together, and any
//! part that is missing or unreadable is rebuilt from defaults on load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;
use worldloom_core::{CallRecord, TaskKind};

pub const DEFAULT_GENERAL_MEMORY: &str = "# General Memory\n\n\
    No observations yet. Standing lessons about how the assistant works with this user will \
    collect here.";
pub const DEFAULT_NODE_EDITION: &str = "# Node Edition\n\n\
    No critiques yet of how the assistant creates and updates world nodes.";
pub const DEFAULT_CHAT_TEXT: &str = "# Chat Text\n\n\
    No critiques yet of the narrative text the assistant writes in chat.";
pub const DEFAULT_ASSISTANT_FEEDBACK: &str = "# Assistant Feedback\n\n\
    No critiques yet of the assistant's conversational behaviour.";
pub const DEFAULT_NODE_EDIT: &str = "# Node Edit\n\n\
    No critiques yet of the field edits the assistant proposes.";

/// One of the five critique documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentId {
    GeneralMemory,
    NodeEdition,
    ChatText,
    AssistantFeedback,
    NodeEdit,
}

impl DocumentId {
    pub const ALL: [DocumentId; 5] = [
        DocumentId::GeneralMemory,
        DocumentId::NodeEdition,
        DocumentId::ChatText,
        DocumentId::AssistantFeedback,
        DocumentId::NodeEdit,
    ];

    /// Key used in the persisted blob.
    pub fn key(self) -> &'static str {
        match self {
            DocumentId::GeneralMemory => "GeneralMemory",
            DocumentId::NodeEdition => "nodeEdition",
            DocumentId::ChatText => "chatText",
            DocumentId::AssistantFeedback => "assistantFeedback",
            DocumentId::NodeEdit => "nodeEdit",
        }
    }

    pub fn default_text(self) -> &'static str {
        match self {
            DocumentId::GeneralMemory => DEFAULT_GENERAL_MEMORY,
            DocumentId::NodeEdition => DEFAULT_NODE_EDITION,
            DocumentId::ChatText => DEFAULT_CHAT_TEXT,
            DocumentId::AssistantFeedback => DEFAULT_ASSISTANT_FEEDBACK,
            DocumentId::NodeEdit => DEFAULT_NODE_EDIT,
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where the result of a task ends up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Rewrite one document.
    Document(DocumentId),
    /// Attach critique to the originating ledger record, then optionally
    /// rewrite a document as well.
    Call { document: Option<DocumentId> },
    /// Fold every document into `GeneralMemory`.
    Synthesis,
    /// Deliver a report to the user.
    Report,
}

/// Routing table from task kind to target.
pub fn route(kind: &TaskKind) -> Route {
    match kind {
        TaskKind::NodeEditFeedback => Route::Document(DocumentId::NodeEdit),
        TaskKind::StoryFeedback | TaskKind::NodeUpdateFeedback => {
            Route::Document(DocumentId::NodeEdition)
        }
        TaskKind::AssistantFeedback => Route::Document(DocumentId::AssistantFeedback),
        TaskKind::LlmCallFeedback => Route::Call { document: None },
        TaskKind::ChatTextFeedback => Route::Call {
            document: Some(DocumentId::ChatText),
        },
        TaskKind::UpdateGeneralMemory => Route::Synthesis,
        TaskKind::FinalReport => Route::Report,
        TaskKind::Other(_) => Route::Document(DocumentId::GeneralMemory),
    }
}

/// The five documents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDocuments {
    #[serde(rename = "GeneralMemory")]
    pub general_memory: String,
    #[serde(rename = "nodeEdition")]
    pub node_edition: String,
    #[serde(rename = "chatText")]
    pub chat_text: String,
    #[serde(rename = "assistantFeedback")]
    pub assistant_feedback: String,
    #[serde(rename = "nodeEdit")]
    pub node_edit: String,
}

impl Default for MemoryDocuments {
    fn default() -> Self {
        Self {
            general_memory: DEFAULT_GENERAL_MEMORY.to_string(),
            node_edition: DEFAULT_NODE_EDITION.to_string(),
            chat_text: DEFAULT_CHAT_TEXT.to_string(),
            assistant_feedback: DEFAULT_ASSISTANT_FEEDBACK.to_string(),
            node_edit: DEFAULT_NODE_EDIT.to_string(),
        }
    }
}

impl MemoryDocuments {
    pub fn get(&self, id: DocumentId) -> &str {
        match id {
            DocumentId::GeneralMemory => &self.general_memory,
            DocumentId::NodeEdition => &self.node_edition,
            DocumentId::ChatText => &self.chat_text,
            DocumentId::AssistantFeedback => &self.assistant_feedback,
            DocumentId::NodeEdit => &self.node_edit,
        }
    }

    fn slot_mut(&mut self, id: DocumentId) -> &mut String {
        match id {
            DocumentId::GeneralMemory => &mut self.general_memory,
            DocumentId::NodeEdition => &mut self.node_edition,
            DocumentId::ChatText => &mut self.chat_text,
            DocumentId::AssistantFeedback => &mut self.assistant_feedback,
            DocumentId::NodeEdit => &mut self.node_edit,
        }
    }

    /// Replace a document verbatim. Returns the previous text.
    pub fn replace(&mut self, id: DocumentId, text: String) -> String {
        std::mem::replace(self.slot_mut(id), text)
    }

    /// Put the default template back into any empty document.
    fn fill_empty(&mut self) -> bool {
        let mut repaired = false;
        for id in DocumentId::ALL {
            let slot = self.slot_mut(id);
            if slot.trim().is_empty() {
                *slot = id.default_text().to_string();
                repaired = true;
            }
        }
        repaired
    }
}

/// Everything persisted under the engine's storage key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySnapshot {
    #[serde(flatten)]
    pub documents: MemoryDocuments,
    #[serde(rename = "llmCalls")]
    pub calls: Vec<CallRecord>,
}

impl MemorySnapshot {
    pub fn to_blob(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Lenient load: never fails. A blob that is not a JSON object resets to
    /// defaults; missing or mistyped sections are repopulated one by one.
    pub fn from_blob(blob: &str) -> Self {
        let value: Value = match serde_json::from_str(blob) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                warn!("Persisted memory is not an object, resetting to defaults");
                return Self::default();
            }
            Err(e) => {
                warn!("Persisted memory unreadable ({}), resetting to defaults", e);
                return Self::default();
            }
        };

        let mut documents = MemoryDocuments::default();
        for id in DocumentId::ALL {
            match value.get(id.key()).and_then(Value::as_str) {
                Some(text) => {
                    documents.replace(id, text.to_string());
                }
                None => warn!("Persisted memory missing {}, using default", id),
            }
        }
        documents.fill_empty();

        let calls = match value.get("llmCalls") {
            None => Vec::new(),
            Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
                warn!("Persisted ledger unreadable ({}), starting empty", e);
                Vec::new()
            }),
        };

        Self { documents, calls }
    }

    /// Strict parse for user-supplied imports. Missing sections still default.
    pub fn from_json_strict(json: &str) -> serde_json::Result<Self> {
        let mut snapshot: Self = serde_json::from_str(json)?;
        snapshot.documents.fill_empty();
        Ok(snapshot)
    }
}

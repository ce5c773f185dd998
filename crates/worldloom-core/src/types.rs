//! Core types for Worldloom

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Call ledger records
// ---------------------------------------------------------------------------

/// Lifecycle state of an outbound model call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Running => "running",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CallStatus::Queued | CallStatus::Running)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model interaction as seen by the call ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub status: CallStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub call_type: String,
    pub model_used: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Injected by the host application rather than produced by a model.
    #[serde(default)]
    pub external: bool,
}

impl CallRecord {
    pub fn has_feedback(&self) -> bool {
        self.feedback.as_deref().is_some_and(|f| !f.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Feedback tasks
// ---------------------------------------------------------------------------

/// What a feedback task critiques. Unknown names survive as `Other` so that
/// newer producers do not break older engines.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    AssistantFeedback,
    NodeEditFeedback,
    StoryFeedback,
    NodeUpdateFeedback,
    FinalReport,
    LlmCallFeedback,
    ChatTextFeedback,
    UpdateGeneralMemory,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::AssistantFeedback => "assistantFeedback",
            TaskKind::NodeEditFeedback => "nodeEditFeedback",
            TaskKind::StoryFeedback => "storyFeedback",
            TaskKind::NodeUpdateFeedback => "nodeUpdateFeedback",
            TaskKind::FinalReport => "finalReport",
            TaskKind::LlmCallFeedback => "llmCallFeedback",
            TaskKind::ChatTextFeedback => "chatTextFeedback",
            TaskKind::UpdateGeneralMemory => "updateGeneralMemory",
            TaskKind::Other(name) => name,
        }
    }

    /// Tasks that critique a single ledger record.
    pub fn targets_call(&self) -> bool {
        matches!(self, TaskKind::LlmCallFeedback | TaskKind::ChatTextFeedback)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        match s {
            "assistantFeedback" => TaskKind::AssistantFeedback,
            "nodeEditFeedback" => TaskKind::NodeEditFeedback,
            "storyFeedback" => TaskKind::StoryFeedback,
            "nodeUpdateFeedback" => TaskKind::NodeUpdateFeedback,
            "finalReport" => TaskKind::FinalReport,
            "llmCallFeedback" => TaskKind::LlmCallFeedback,
            "chatTextFeedback" => TaskKind::ChatTextFeedback,
            "updateGeneralMemory" => TaskKind::UpdateGeneralMemory,
            other => TaskKind::Other(other.to_string()),
        }
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        TaskKind::from(s.as_str())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of critique work. Consumed exactly once by the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackTask {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub payload: Value,
    /// Formatted recent chat turns, frozen when the task was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<String>,
    pub enqueue_time: i64,
}

// ---------------------------------------------------------------------------
// Chat and world entities (read-only inputs)
// ---------------------------------------------------------------------------

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of the interactive chat.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A node of the world graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub long_description: String,
    #[serde(default)]
    pub rules: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    pub fn is_assistant(&self) -> bool {
        self.entity_type.eq_ignore_ascii_case("assistant")
    }
}

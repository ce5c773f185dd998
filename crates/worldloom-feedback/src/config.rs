//! Feedback engine configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::Path;
use worldloom_core::{Error, Result};
use std::time::Duration;

/// Top-level feedback engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Call ledger retention and classification.
    pub ledger: LedgerConfig,
    /// Task queue timing and synthesis cadence.
    pub queue: QueueConfig,
    /// Memory documents and prompt bounds.
    pub memory: MemoryConfig,
    /// Instruction text for each prompt family.
    pub prompts: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Host records kept after each finalize, newest by start time.
    pub max_records: usize,
    /// Feedback-generation records kept, in their own list.
    pub max_internal_records: usize,
    pub prompt_max_chars: usize,
    pub response_max_chars: usize,
    pub error_max_chars: usize,
    /// Call types of the form `<prefix>:<kind>` are feedback generation and
    /// are never critiqued themselves.
    pub internal_call_prefix: String,
    /// Call types that always count as narrative (chat text) generation.
    pub narrative_call_types: Vec<String>,
    /// Call ids starting with any of these count as narrative generation.
    pub narrative_id_prefixes: Vec<String>,
    /// Prompt fragments that mark narrative generation.
    pub narrative_prompt_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Coalescing window for bursts of `add_task` calls.
    pub debounce_ms: u64,
    /// Enqueue a general memory synthesis every N critiqued calls.
    pub synthesis_every: usize,
    /// Delay between delivering a final report and folding it back into memory.
    pub report_fold_delay_ms: u64,
    /// Per-generation timeout. 0 disables it.
    pub generation_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Durable slot key holding documents and ledger together.
    pub storage_key: String,
    /// Max chars of each document quoted into a prompt.
    pub document_max_chars: usize,
    /// Max chars of any string field of a task payload.
    pub payload_string_max_chars: usize,
    /// Relevant chat turns frozen into a task.
    pub chat_history_turns: usize,
    pub chat_turn_max_chars: usize,
    /// Ledger feedback entries quoted into a synthesis prompt.
    pub recent_feedback_count: usize,
    /// Hard cap on the synthesized general memory.
    pub general_memory_max_chars: usize,
}

/// Instruction preambles. Every prompt family is critique-only: the generator
/// is asked to evaluate, never to produce story content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub document_update: String,
    pub call_critique: String,
    pub chat_text_critique: String,
    pub synthesis: String,
    pub final_report: String,
}

// ============================================================
// Defaults
// ============================================================

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_records: 50,
            max_internal_records: 50,
            prompt_max_chars: 5_000,
            response_max_chars: 5_000,
            error_max_chars: 1_000,
            internal_call_prefix: "feedback".into(),
            narrative_call_types: vec!["chat_text_generation".into(), "chat_text".into()],
            narrative_id_prefixes: vec!["chat_text".into(), "chat-text".into()],
            narrative_prompt_markers: vec![
                "[STORY_CONTINUATION]".into(),
                "Continue the story".into(),
            ],
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 25,
            synthesis_every: 5,
            report_fold_delay_ms: 500,
            generation_timeout_ms: 0,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_key: "worldloom_feedback_memory".into(),
            document_max_chars: 5_000,
            payload_string_max_chars: 5_000,
            chat_history_turns: 10,
            chat_turn_max_chars: 1_500,
            recent_feedback_count: 5,
            general_memory_max_chars: 5_000,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            document_update: "You maintain a critique document about how an AI assistant helps a \
                user build a fictional world. Read the current document and the new event below, \
                then rewrite the document so it captures what worked, what did not, and what the \
                assistant should do differently. Critique only: do not write story content. \
                Respond with the full updated document and nothing else."
                .into(),
            call_critique: "Critique the following model call. Judge whether the response \
                followed the prompt, stayed consistent with the world, and was useful to the user. \
                Be specific and brief. Do not rewrite the response."
                .into(),
            chat_text_critique: "Critique the following piece of narrative the assistant wrote \
                for the user. Comment on voice, pacing, consistency with established world facts, \
                and whether it respected the user's direction. Do not continue the story."
                .into(),
            synthesis: "Merge the feature critiques and recent call feedback below into one \
                concise general memory of the assistant's strengths, weaknesses, and standing \
                corrections. Drop anything stale or redundant. Respond with the new general \
                memory only."
                .into(),
            final_report: "Write a short report, addressed to the user, summarising how the \
                assistant has been performing in this session and what it will do differently. \
                Critique only: a few honest paragraphs, no story content."
                .into(),
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl FeedbackConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("{} in {}, using defaults", e, path.display());
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse TOML text. Missing keys take their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl QueueConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn report_fold_delay(&self) -> Duration {
        Duration::from_millis(self.report_fold_delay_ms)
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        (self.generation_timeout_ms > 0).then(|| Duration::from_millis(self.generation_timeout_ms))
    }
}

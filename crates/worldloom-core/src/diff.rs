//! Text patch engine: applies model-proposed find/replace edits to a field
//!
//! Model output is unreliable, so an instruction that cannot be located is a
//! no-op rather than an error. Instructions apply strictly in order, each one
//! seeing the text produced by the previous step.

use serde::{Deserialize, Serialize};

/// One find/replace step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffInstruction {
    /// Text to find. Empty means "append".
    #[serde(default)]
    pub prev_txt: String,
    /// Replacement. Empty means "delete".
    #[serde(default)]
    pub next_txt: String,
    /// 1-indexed occurrence of `prev_txt` to replace.
    #[serde(default = "default_occurrence")]
    pub occ: usize,
}

fn default_occurrence() -> usize {
    1
}

impl DiffInstruction {
    pub fn replace(prev: impl Into<String>, next: impl Into<String>) -> Self {
        Self {
            prev_txt: prev.into(),
            next_txt: next.into(),
            occ: 1,
        }
    }

    pub fn append(next: impl Into<String>) -> Self {
        Self::replace("", next)
    }

    pub fn with_occurrence(mut self, occ: usize) -> Self {
        self.occ = occ;
        self
    }
}

/// Apply `instructions` to `base` in order.
pub fn apply_diff(base: &str, instructions: &[DiffInstruction]) -> String {
    instructions
        .iter()
        .fold(base.to_string(), |text, instruction| apply_one(text, instruction))
}

fn apply_one(mut text: String, instruction: &DiffInstruction) -> String {
    if instruction.prev_txt.is_empty() {
        text.push_str(&instruction.next_txt);
        return text;
    }

    // occ is 1-indexed; 0 never names a match.
    let Some(skip) = instruction.occ.checked_sub(1) else {
        return text;
    };

    let found = text
        .match_indices(instruction.prev_txt.as_str())
        .nth(skip)
        .map(|(start, _)| start);

    if let Some(start) = found {
        let end = start + instruction.prev_txt.len();
        text.replace_range(start..end, &instruction.next_txt);
    }
    text
}

/// Parse instructions from JSON. Accepts a single object or an array.
pub fn parse_instructions(json: &str) -> serde_json::Result<Vec<DiffInstruction>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<DiffInstruction>),
        One(DiffInstruction),
    }

    Ok(match serde_json::from_str::<OneOrMany>(json)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(single) => vec![single],
    })
}

//! Bounded text helpers shared by the ledger and prompt builders

use std::borrow::Cow;

/// Appended to any text cut down by [`truncate`].
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Keep at most `max_chars` characters, marking the cut.
pub fn truncate(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        None => Cow::Borrowed(text),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATION_MARKER);
            Cow::Owned(out)
        }
    }
}

/// Owned variant of [`truncate`].
pub fn truncate_owned(text: &str, max_chars: usize) -> String {
    truncate(text, max_chars).into_owned()
}

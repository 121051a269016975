// Heuristic token accounting for turns and chat contexts

use crate::protocol::HistoryEntry;

/// Per-message overhead for the role header in chat templates.
const ROLE_OVERHEAD: usize = 4;

/// Word-based estimate, ~1.3 tokens per whitespace-separated word.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_words(text.split_whitespace().count())
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn tokens_for_words(words: usize) -> usize {
    ((words as f64) * 1.3).ceil() as usize
}

pub fn count_message_tokens(content: &str) -> usize {
    ROLE_OVERHEAD + estimate_tokens(content)
}

/// Message estimate from an already known word count.
pub fn message_tokens_for_words(words: usize) -> usize {
    ROLE_OVERHEAD + tokens_for_words(words)
}

/// Words `chunk` adds when appended to `existing`; a word split across the
/// boundary is counted once.
pub fn words_added(existing: &str, chunk: &str) -> usize {
    let words = chunk.split_whitespace().count();
    let joins = existing.ends_with(|c: char| !c.is_whitespace())
        && chunk.starts_with(|c: char| !c.is_whitespace());
    if joins {
        words.saturating_sub(1)
    } else {
        words
    }
}

/// Estimated prompt size of the context attached to a `chat` command.
pub fn count_context_tokens(history: &[HistoryEntry]) -> usize {
    history
        .iter()
        .map(|entry| count_message_tokens(&entry.content))
        .sum()
}

#[allow(clippy::cast_precision_loss)]
pub fn context_usage_percentage(used_tokens: usize, context_window_size: usize) -> f64 {
    if context_window_size == 0 {
        return 0.0;
    }
    (used_tokens as f64 / context_window_size as f64) * 100.0
}

//! Token estimation for compaction decisions.
//!
//! Uses a character heuristic of ~4 characters per token, the same one
//! [`Message::estimated_tokens`] applies to stored messages.

use codeloom_core::message::Message;

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> u64 {
    text.len().div_ceil(4) as u64
}

/// Estimate a full prompt: system text, history, and any text still to be
/// appended (the new user message, a summary request).
pub fn estimate_prompt(system: &str, history: &[Message], pending: &str) -> u64 {
    estimate_tokens(system)
        + history.iter().map(Message::estimated_tokens).sum::<u64>()
        + estimate_tokens(pending)
}

/// Whether `estimated` fills at least `threshold` of `window`.
pub fn needs_compaction(estimated: u64, window: u64, threshold: f64) -> bool {
    if window == 0 {
        return false;
    }
    estimated as f64 / window as f64 >= threshold
}

use serde_json::Value;

use ctxgate_protocol::Envelope;

/// Byte-length estimate: `len / ratio` tokens per message, summed.
pub fn estimate_tokens(messages: &[Value], ratio: u32) -> u64 {
    let ratio = ratio.max(1) as u64;
    messages
        .iter()
        .map(|message| Envelope::message_bytes(message) as u64 / ratio)
        .sum()
}

pub fn usage_pct(tokens: u64, context_window: u64) -> u64 {
    if context_window == 0 {
        return 100;
    }
    tokens * 100 / context_window
}

/// Tokens kept verbatim once compaction triggers: the most recent
/// `(100 - threshold)%` of the window.
pub fn keep_tokens(context_window: u64, trigger_threshold: u8) -> u64 {
    let keep_pct = 100u64.saturating_sub(trigger_threshold as u64);
    context_window * keep_pct / 100
}

/// Walks messages newest to oldest accumulating estimated tokens; the first
/// index at which the accumulator crosses `keep_tokens` is the boundary.
/// Returns the cutoff (largest summarized index), leaving at least one
/// message on each side, or None when the conversation is too short.
pub fn cutoff_index(messages: &[Value], keep: u64, ratio: u32) -> Option<usize> {
    if messages.len() < 2 {
        return None;
    }
    let ratio = ratio.max(1) as u64;
    let mut accumulated = 0u64;
    for index in (0..messages.len()).rev() {
        accumulated += Envelope::message_bytes(&messages[index]) as u64 / ratio;
        if accumulated >= keep {
            if index == 0 {
                return Some(0.min(messages.len() - 2));
            }
            return Some((index - 1).min(messages.len() - 2));
        }
    }
    // Everything fits in the keep budget; compact all but the last message.
    Some(messages.len() - 2)
}

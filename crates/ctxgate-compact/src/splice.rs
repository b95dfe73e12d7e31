use ctxgate_protocol::Envelope;
use ctxgate_protocol::envelope::{message_has_tool_result, summary_message};

use crate::cache::SummaryRecord;

#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceOutcome {
    pub dropped_messages: usize,
    pub saved_bytes: u64,
}

/// Rewrites the outgoing messages to `[summary] ++ messages[k+1..]`.
/// Tool-call/tool-result pairs straddling the boundary are promoted wholly
/// into the kept region so pairing survives the splice.
pub fn splice_summary(envelope: &mut Envelope, record: &SummaryRecord) -> Option<SpliceOutcome> {
    let messages = envelope.messages();
    let len = messages.len();
    if len == 0 || record.last_summarized_index + 1 >= len {
        return None;
    }

    let mut start = record.last_summarized_index + 1;
    let shape = envelope.shape();
    while start > 1 && message_has_tool_result(shape, &messages[start]) {
        start -= 1;
    }
    if start == 0 {
        return None;
    }

    let dropped: u64 = messages[..start]
        .iter()
        .map(|message| Envelope::message_bytes(message) as u64)
        .sum();
    let summary = summary_message(shape, &record.summary_text);
    let summary_bytes = Envelope::message_bytes(&summary) as u64;

    let mut spliced = Vec::with_capacity(len - start + 1);
    spliced.push(summary);
    spliced.extend(messages[start..].iter().cloned());
    let dropped_messages = start;
    envelope.replace_messages(spliced);

    Some(SpliceOutcome {
        dropped_messages,
        saved_bytes: dropped.saturating_sub(summary_bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use time::OffsetDateTime;

    use ctxgate_protocol::WireShape;

    fn record(index: usize) -> SummaryRecord {
        SummaryRecord {
            fingerprint: "fp".to_string(),
            summary_text: "what happened before".to_string(),
            summary_tokens: 10,
            last_summarized_index: index,
            generated_at: OffsetDateTime::now_utc(),
            pre_compaction_len: 10,
        }
    }

    fn plain(role: &str, text: &str) -> Value {
        json!({ "role": role, "content": text })
    }

    #[test]
    fn splice_replaces_prefix_with_summary() {
        let messages: Vec<Value> = (0..10)
            .map(|index| plain(if index % 2 == 0 { "user" } else { "assistant" }, "turn"))
            .collect();
        let mut envelope =
            Envelope::from_value(WireShape::Claude, json!({ "messages": messages }));
        let outcome = splice_summary(&mut envelope, &record(6)).unwrap();
        assert_eq!(outcome.dropped_messages, 7);
        // 10 - 6 - 1 kept + 1 summary.
        assert_eq!(envelope.messages().len(), 4);
        let first = ctxgate_protocol::envelope::flatten_message_text(
            WireShape::Claude,
            &envelope.messages()[0],
        );
        assert!(first.contains("what happened before"));
    }

    #[test]
    fn straddling_tool_pair_is_promoted() {
        let messages = vec![
            plain("user", "start"),
            plain("assistant", "working"),
            json!({ "role": "assistant", "content": [
                { "type": "tool_use", "id": "tu_1", "name": "read_file", "input": {} }
            ]}),
            json!({ "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "tu_1", "content": "data" }
            ]}),
            plain("assistant", "done"),
        ];
        let mut envelope =
            Envelope::from_value(WireShape::Claude, json!({ "messages": messages }));
        // Cutoff lands on the tool_use; the pair moves wholly into the kept
        // region instead of being split.
        let outcome = splice_summary(&mut envelope, &record(2)).unwrap();
        assert_eq!(outcome.dropped_messages, 2);
        let kept = envelope.messages();
        assert_eq!(kept.len(), 4);
        assert!(
            ctxgate_protocol::envelope::message_has_tool_result(WireShape::Claude, &kept[2])
        );
    }

    #[test]
    fn summary_covering_everything_is_ignored() {
        let messages = vec![plain("user", "only"), plain("assistant", "turn")];
        let mut envelope =
            Envelope::from_value(WireShape::Claude, json!({ "messages": messages }));
        assert!(splice_summary(&mut envelope, &record(5)).is_none());
        assert!(!envelope.is_dirty());
    }
}

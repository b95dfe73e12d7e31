use ctxgate_protocol::Envelope;
use ctxgate_protocol::envelope::flatten_message_text;

/// Stable identity for a conversation: a blake3 hash over the role and
/// flattened text of the first `n` messages. The same conversation
/// continuing across requests keeps the same fingerprint.
pub fn conversation_fingerprint(envelope: &Envelope, n: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    for message in envelope.messages().iter().take(n.max(1)) {
        let role = envelope.role_of(message).unwrap_or_default();
        hasher.update(role.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(flatten_message_text(envelope.shape(), message).as_bytes());
        hasher.update(b"\x1e");
    }
    let digest = hasher.finalize();
    digest.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use ctxgate_protocol::WireShape;

    fn envelope(messages: serde_json::Value) -> Envelope {
        Envelope::from_value(WireShape::Claude, json!({ "messages": messages }))
    }

    #[test]
    fn same_prefix_same_fingerprint() {
        let first = envelope(json!([
            { "role": "user", "content": "hello" },
            { "role": "assistant", "content": "hi" },
            { "role": "user", "content": "do the thing" }
        ]));
        let second = envelope(json!([
            { "role": "user", "content": "hello" },
            { "role": "assistant", "content": "hi" },
            { "role": "user", "content": "do the thing" },
            { "role": "assistant", "content": "done" },
            { "role": "user", "content": "and another" }
        ]));
        assert_eq!(
            conversation_fingerprint(&first, 3),
            conversation_fingerprint(&second, 3)
        );
    }

    #[test]
    fn different_prefix_different_fingerprint() {
        let first = envelope(json!([{ "role": "user", "content": "hello" }]));
        let second = envelope(json!([{ "role": "user", "content": "goodbye" }]));
        assert_ne!(
            conversation_fingerprint(&first, 3),
            conversation_fingerprint(&second, 3)
        );
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let envelope = envelope(json!([{ "role": "user", "content": "hello" }]));
        let fingerprint = conversation_fingerprint(&envelope, 3);
        assert_eq!(fingerprint.len(), 16);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::WireShape;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
}

impl UsageDelta {
    pub fn merge(&mut self, incoming: UsageDelta) {
        if incoming.input_tokens.is_some() {
            self.input_tokens = incoming.input_tokens;
        }
        if incoming.output_tokens.is_some() {
            self.output_tokens = incoming.output_tokens;
        }
        if incoming.cache_read_tokens.is_some() {
            self.cache_read_tokens = incoming.cache_read_tokens;
        }
        if incoming.cache_write_tokens.is_some() {
            self.cache_write_tokens = incoming.cache_write_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.cache_read_tokens.is_none()
            && self.cache_write_tokens.is_none()
    }
}

/// Accumulates usage counters across streaming frames. Later frames win
/// field-by-field; for Anthropic streams that reproduces the
/// message_start → message_delta progression.
#[derive(Debug)]
pub struct UsageMeter {
    shape: WireShape,
    latest: UsageDelta,
    seen: bool,
}

impl UsageMeter {
    pub fn new(shape: WireShape) -> Self {
        Self {
            shape,
            latest: UsageDelta::default(),
            seen: false,
        }
    }

    /// Feeds one parsed frame payload. Returns true when the frame carried
    /// usage counters.
    pub fn observe(&mut self, payload: &Value) -> bool {
        let incoming = extract_usage(self.shape, payload);
        match incoming {
            Some(delta) if !delta.is_empty() => {
                self.latest.merge(delta);
                self.seen = true;
                true
            }
            _ => false,
        }
    }

    pub fn finalize(&self) -> Option<UsageDelta> {
        self.seen.then_some(self.latest)
    }
}

/// Pulls usage counters out of one provider-shaped response or frame.
pub fn extract_usage(shape: WireShape, payload: &Value) -> Option<UsageDelta> {
    match shape {
        WireShape::Claude => {
            let usage = payload
                .get("usage")
                .or_else(|| payload.get("message").and_then(|m| m.get("usage")))?;
            Some(UsageDelta {
                input_tokens: field(usage, "input_tokens"),
                output_tokens: field(usage, "output_tokens"),
                cache_read_tokens: field(usage, "cache_read_input_tokens"),
                cache_write_tokens: field(usage, "cache_creation_input_tokens"),
            })
        }
        WireShape::OpenAiChat => {
            let usage = payload.get("usage")?;
            if usage.is_null() {
                return None;
            }
            Some(UsageDelta {
                input_tokens: field(usage, "prompt_tokens"),
                output_tokens: field(usage, "completion_tokens"),
                cache_read_tokens: usage
                    .get("prompt_tokens_details")
                    .and_then(|details| details.get("cached_tokens"))
                    .and_then(Value::as_u64),
                cache_write_tokens: None,
            })
        }
        WireShape::Gemini => {
            let usage = payload.get("usageMetadata")?;
            Some(UsageDelta {
                input_tokens: field(usage, "promptTokenCount"),
                output_tokens: field(usage, "candidatesTokenCount"),
                cache_read_tokens: field(usage, "cachedContentTokenCount"),
                cache_write_tokens: None,
            })
        }
    }
}

fn field(usage: &Value, name: &str) -> Option<u64> {
    usage.get(name).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claude_message_start_then_delta() {
        let mut meter = UsageMeter::new(WireShape::Claude);
        meter.observe(&json!({
            "type": "message_start",
            "message": { "usage": { "input_tokens": 120, "output_tokens": 1,
                "cache_read_input_tokens": 50, "cache_creation_input_tokens": 10 } }
        }));
        meter.observe(&json!({
            "type": "message_delta",
            "usage": { "output_tokens": 250 }
        }));
        let usage = meter.finalize().unwrap();
        assert_eq!(usage.input_tokens, Some(120));
        assert_eq!(usage.output_tokens, Some(250));
        assert_eq!(usage.cache_read_tokens, Some(50));
        assert_eq!(usage.cache_write_tokens, Some(10));
    }

    #[test]
    fn openai_last_chunk_usage() {
        let mut meter = UsageMeter::new(WireShape::OpenAiChat);
        assert!(!meter.observe(&json!({ "choices": [], "usage": null })));
        assert!(meter.observe(&json!({
            "choices": [],
            "usage": { "prompt_tokens": 90, "completion_tokens": 42,
                "prompt_tokens_details": { "cached_tokens": 30 } }
        })));
        let usage = meter.finalize().unwrap();
        assert_eq!(usage.input_tokens, Some(90));
        assert_eq!(usage.output_tokens, Some(42));
        assert_eq!(usage.cache_read_tokens, Some(30));
    }

    #[test]
    fn gemini_usage_metadata() {
        let usage = extract_usage(
            WireShape::Gemini,
            &json!({ "usageMetadata": { "promptTokenCount": 7, "candidatesTokenCount": 3 } }),
        )
        .unwrap();
        assert_eq!(usage.input_tokens, Some(7));
        assert_eq!(usage.output_tokens, Some(3));
    }

    #[test]
    fn absent_usage_yields_none() {
        let mut meter = UsageMeter::new(WireShape::OpenAiChat);
        meter.observe(&json!({ "choices": [{ "delta": { "content": "hi" } }] }));
        assert!(meter.finalize().is_none());
    }
}

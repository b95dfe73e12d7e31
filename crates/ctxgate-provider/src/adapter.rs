use bytes::Bytes;
use serde_json::Value;

use ctxgate_protocol::usage::{UsageDelta, extract_usage};
use ctxgate_protocol::{Envelope, ErrorKind, build_error};

use crate::identity::{ProviderId, StreamFraming};

/// Maps a provider identity to its wire format. Adapters do not own I/O;
/// the gateway runtime does.
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Serializes the (possibly rewritten) envelope for the upstream.
    fn format_request(&self, envelope: &Envelope) -> Bytes {
        envelope.to_bytes()
    }

    /// Extracts usage counters from one response frame or body.
    fn parse_usage(&self, payload: &Value) -> Option<UsageDelta> {
        extract_usage(self.id().caps().shape, payload)
    }

    /// Provider-native error envelope bytes.
    fn build_error(&self, kind: ErrorKind, message: &str) -> Bytes {
        build_error(self.id().caps().shape, kind, message)
    }

    fn streaming_framing(&self) -> StreamFraming {
        self.id().caps().framing
    }
}

struct AnthropicAdapter;
struct OpenAiAdapter;
struct GeminiAdapter;
struct BedrockAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn streaming_framing(&self) -> StreamFraming {
        StreamFraming::JsonLines
    }
}

impl ProviderAdapter for BedrockAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Bedrock
    }
}

pub fn adapter_for(id: ProviderId) -> &'static dyn ProviderAdapter {
    match id {
        ProviderId::Anthropic => &AnthropicAdapter,
        ProviderId::OpenAi => &OpenAiAdapter,
        ProviderId::Gemini => &GeminiAdapter,
        ProviderId::Bedrock => &BedrockAdapter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adapter_usage_follows_shape() {
        let adapter = adapter_for(ProviderId::Anthropic);
        let usage = adapter
            .parse_usage(&json!({ "usage": { "input_tokens": 5, "output_tokens": 2 } }))
            .unwrap();
        assert_eq!(usage.input_tokens, Some(5));
    }

    #[test]
    fn error_bodies_are_provider_native() {
        let adapter = adapter_for(ProviderId::OpenAi);
        let body = adapter.build_error(ErrorKind::RateLimited, "cap");
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "rate_limit_exceeded");
    }
}

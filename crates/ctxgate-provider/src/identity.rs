use serde::{Deserialize, Serialize};

use ctxgate_protocol::WireShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Anthropic,
    OpenAi,
    Gemini,
    Bedrock,
}

impl ProviderId {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::Bedrock => "bedrock",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeaderStyle {
    /// `x-api-key: <key>`
    XApiKey,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-goog-api-key: <key>`
    GoogApiKey,
    /// AWS SigV4; signing is delegated to the SDK adapter seam.
    SigV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    Sse,
    JsonLines,
    None,
}

/// Static capability record for a provider identity.
#[derive(Debug, Clone)]
pub struct ProviderCaps {
    pub id: ProviderId,
    pub endpoint: &'static str,
    pub inference_path: &'static str,
    pub auth_header: AuthHeaderStyle,
    pub framing: StreamFraming,
    pub shape: WireShape,
}

impl ProviderId {
    pub fn caps(&self) -> ProviderCaps {
        match self {
            ProviderId::Anthropic => ProviderCaps {
                id: *self,
                endpoint: "https://api.anthropic.com",
                inference_path: "/v1/messages",
                auth_header: AuthHeaderStyle::XApiKey,
                framing: StreamFraming::Sse,
                shape: WireShape::Claude,
            },
            ProviderId::OpenAi => ProviderCaps {
                id: *self,
                endpoint: "https://api.openai.com",
                inference_path: "/v1/chat/completions",
                auth_header: AuthHeaderStyle::Bearer,
                framing: StreamFraming::Sse,
                shape: WireShape::OpenAiChat,
            },
            ProviderId::Gemini => ProviderCaps {
                id: *self,
                endpoint: "https://generativelanguage.googleapis.com",
                inference_path: "/v1beta/models",
                auth_header: AuthHeaderStyle::GoogApiKey,
                framing: StreamFraming::JsonLines,
                shape: WireShape::Gemini,
            },
            ProviderId::Bedrock => ProviderCaps {
                id: *self,
                endpoint: "https://bedrock-runtime.us-east-1.amazonaws.com",
                inference_path: "/model",
                auth_header: AuthHeaderStyle::SigV4,
                framing: StreamFraming::Sse,
                shape: WireShape::Claude,
            },
        }
    }

    /// Bedrock endpoints are regional; everything else ignores the region.
    pub fn endpoint_for_region(&self, region: Option<&str>) -> String {
        match (self, region) {
            (ProviderId::Bedrock, Some(region)) => {
                format!("https://bedrock-runtime.{region}.amazonaws.com")
            }
            _ => self.caps().endpoint.to_string(),
        }
    }
}

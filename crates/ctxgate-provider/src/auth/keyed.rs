use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};

use ctxgate_common::AuthMode;

use crate::identity::{AuthHeaderStyle, ProviderId};

use super::{AuthConfig, AuthHandler, DetectedAuth, header_value};

/// API-key-only handler used for Gemini and Bedrock. Bedrock's SigV4
/// signing lives behind the SDK adapter seam; this handler only carries the
/// key material the gateway knows about.
pub struct KeyedAuth {
    provider: ProviderId,
    config: AuthConfig,
}

impl KeyedAuth {
    pub fn initialize(provider: ProviderId, config: AuthConfig) -> Arc<Self> {
        Arc::new(Self { provider, config })
    }
}

#[async_trait]
impl AuthHandler for KeyedAuth {
    fn provider(&self) -> ProviderId {
        self.provider
    }

    fn auth_mode(&self) -> AuthMode {
        AuthMode::ApiKey
    }

    fn detect_auth(&self, headers: &HeaderMap) -> DetectedAuth {
        if header_value(headers, "x-api-key").is_some()
            || header_value(headers, "x-goog-api-key").is_some()
            || super::bearer_token(headers).is_some()
        {
            return DetectedAuth::ApiKey;
        }
        DetectedAuth::None
    }

    async fn oauth_token(&self) -> Option<String> {
        None
    }

    fn subscription_ok(&self) -> bool {
        false
    }

    async fn outbound_headers(&self) -> Option<HeaderMap> {
        let api_key = self.config.api_key.as_deref()?;
        let mut headers = HeaderMap::new();
        match self.provider.caps().auth_header {
            AuthHeaderStyle::GoogApiKey => {
                headers.insert("x-goog-api-key", HeaderValue::from_str(api_key).ok()?);
            }
            AuthHeaderStyle::Bearer => {
                let bearer = format!("Bearer {api_key}");
                headers.insert(http::header::AUTHORIZATION, HeaderValue::from_str(&bearer).ok()?);
            }
            AuthHeaderStyle::XApiKey | AuthHeaderStyle::SigV4 => {
                headers.insert("x-api-key", HeaderValue::from_str(api_key).ok()?);
            }
        }
        Some(headers)
    }

    fn should_fallback(&self, _status: StatusCode, _body: &str) -> bool {
        false
    }

    fn fallback_headers(&self) -> Option<HeaderMap> {
        None
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gemini_uses_goog_header() {
        let auth = KeyedAuth::initialize(
            ProviderId::Gemini,
            AuthConfig {
                mode: AuthMode::ApiKey,
                api_key: Some("g-key".to_string()),
            },
        );
        let headers = auth.outbound_headers().await.unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "g-key");
    }

    #[test]
    fn keyed_handler_never_falls_back() {
        let auth = KeyedAuth::initialize(ProviderId::Gemini, AuthConfig::default());
        assert!(!auth.should_fallback(StatusCode::from_u16(429).unwrap(), "rate limit"));
    }
}

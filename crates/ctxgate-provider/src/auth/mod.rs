mod anthropic;
mod credentials;
mod keyed;
mod openai;
mod refresh;

pub use anthropic::AnthropicAuth;
pub use credentials::{CredentialSource, OAuthCredential, load_credential, persist_credential};
pub use keyed::KeyedAuth;
pub use openai::OpenAiAuth;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};

use ctxgate_common::AuthMode;

use crate::identity::ProviderId;

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub api_key: Option<String>,
}

/// How the inbound request authenticated itself. A request that already
/// arrived with an API key is not eligible for subscription fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedAuth {
    ApiKey,
    Subscription,
    None,
}

/// Lifecycle of a subscription-auth handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninit,
    Loaded,
    Fresh,
    Refreshing,
    Broken,
}

#[async_trait]
pub trait AuthHandler: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn auth_mode(&self) -> AuthMode;

    fn detect_auth(&self, headers: &HeaderMap) -> DetectedAuth;

    /// Observes inbound auth material; passthrough handlers remember it.
    fn capture_inbound(&self, _headers: &HeaderMap) {}

    /// Current OAuth access token, if the handler manages one.
    async fn oauth_token(&self) -> Option<String>;

    /// Flipped to false when OAuth fails unrecoverably.
    fn subscription_ok(&self) -> bool;

    /// Headers for the primary upstream attempt.
    async fn outbound_headers(&self) -> Option<HeaderMap>;

    fn should_fallback(&self, status: StatusCode, body: &str) -> bool;

    fn fallback_headers(&self) -> Option<HeaderMap>;

    /// Called on successful fallback so later requests skip the broken path.
    fn note_fallback_result(&self, _success: bool) {}

    async fn stop(&self);
}

#[derive(Default)]
pub struct AuthRegistry {
    handlers: HashMap<ProviderId, Arc<dyn AuthHandler>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn AuthHandler>) {
        self.handlers.insert(handler.provider(), handler);
    }

    pub fn get(&self, provider: ProviderId) -> Option<Arc<dyn AuthHandler>> {
        self.handlers.get(&provider).cloned()
    }

    pub async fn stop_all(&self) {
        for handler in self.handlers.values() {
            handler.stop().await;
        }
    }
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

pub(crate) fn body_has_signal(body: &str, signals: &[&str]) -> bool {
    let lowered = body.to_ascii_lowercase();
    signals.iter().any(|signal| lowered.contains(signal))
}

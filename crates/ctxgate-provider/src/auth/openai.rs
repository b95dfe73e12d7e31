use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};

use ctxgate_common::AuthMode;

use crate::identity::ProviderId;

use super::{AuthConfig, AuthHandler, DetectedAuth, body_has_signal, header_value};

const FALLBACK_STATUSES: &[u16] = &[401, 429, 402, 403];
const FALLBACK_SIGNALS: &[&str] = &[
    "insufficient_quota",
    "rate_limit_exceeded",
    "billing_hard_limit_reached",
    "quota exceeded",
    "invalid_api_key",
    "token_expired",
];

/// OpenAI handler: the CLI owns login, so the gateway passes the inbound
/// OAuth token through and never refreshes it. Because it cannot refresh,
/// 401 *is* in the fallback set.
pub struct OpenAiAuth {
    config: AuthConfig,
    /// Token captured from the most recent inbound request.
    passthrough_token: ArcSwapOption<String>,
    subscription_ok: AtomicBool,
}

impl OpenAiAuth {
    pub fn initialize(config: AuthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            passthrough_token: ArcSwapOption::empty(),
            subscription_ok: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl AuthHandler for OpenAiAuth {
    fn provider(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn auth_mode(&self) -> AuthMode {
        self.config.mode
    }

    fn detect_auth(&self, headers: &HeaderMap) -> DetectedAuth {
        if header_value(headers, "x-api-key").is_some() {
            return DetectedAuth::ApiKey;
        }
        match super::bearer_token(headers) {
            // API keys are `sk-` prefixed; anything else is a login token.
            Some(token) if token.starts_with("sk-") => DetectedAuth::ApiKey,
            Some(_) => DetectedAuth::Subscription,
            None => DetectedAuth::None,
        }
    }

    /// Remembers the inbound login token so replays and the summarizer can
    /// reuse it.
    fn capture_inbound(&self, headers: &HeaderMap) {
        if let Some(token) = super::bearer_token(headers)
            && !token.starts_with("sk-")
        {
            self.passthrough_token.store(Some(Arc::new(token)));
        }
    }

    async fn oauth_token(&self) -> Option<String> {
        self.passthrough_token
            .load_full()
            .map(|token| token.as_ref().clone())
    }

    fn subscription_ok(&self) -> bool {
        self.subscription_ok.load(Ordering::Relaxed)
    }

    async fn outbound_headers(&self) -> Option<HeaderMap> {
        if self.config.mode != AuthMode::ApiKey
            && self.subscription_ok()
            && let Some(token) = self.oauth_token().await
        {
            let mut headers = HeaderMap::new();
            let bearer = format!("Bearer {token}");
            headers.insert(http::header::AUTHORIZATION, HeaderValue::from_str(&bearer).ok()?);
            return Some(headers);
        }
        self.fallback_headers()
    }

    fn should_fallback(&self, status: StatusCode, body: &str) -> bool {
        if self.config.api_key.is_none() || self.config.mode == AuthMode::ApiKey {
            return false;
        }
        FALLBACK_STATUSES.contains(&status.as_u16()) && body_has_signal(body, FALLBACK_SIGNALS)
    }

    fn fallback_headers(&self) -> Option<HeaderMap> {
        let api_key = self.config.api_key.as_deref()?;
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {api_key}");
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_str(&bearer).ok()?);
        Some(headers)
    }

    fn note_fallback_result(&self, success: bool) {
        if success {
            self.subscription_ok.store(false, Ordering::Relaxed);
        }
    }

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(mode: AuthMode, api_key: Option<&str>) -> Arc<OpenAiAuth> {
        OpenAiAuth::initialize(AuthConfig {
            mode,
            api_key: api_key.map(|key| key.to_string()),
        })
    }

    #[test]
    fn expired_token_401_falls_back_with_bearer() {
        let auth = handler(AuthMode::Both, Some("sk-fallback"));
        assert!(auth.should_fallback(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"token_expired","type":"invalid_request_error"}}"#,
        ));
        let headers = auth.fallback_headers().unwrap();
        assert_eq!(
            headers.get(http::header::AUTHORIZATION).unwrap(),
            "Bearer sk-fallback"
        );
    }

    #[test]
    fn quota_exhaustion_falls_back() {
        let auth = handler(AuthMode::Both, Some("sk-fallback"));
        let status = StatusCode::from_u16(429).unwrap();
        assert!(auth.should_fallback(status, r#"{"error":{"code":"insufficient_quota"}}"#));
    }

    #[test]
    fn api_key_mode_never_falls_back() {
        let auth = handler(AuthMode::ApiKey, Some("sk-fallback"));
        let status = StatusCode::from_u16(429).unwrap();
        assert!(!auth.should_fallback(status, "rate_limit_exceeded"));
    }

    #[test]
    fn sk_prefixed_bearer_counts_as_api_key() {
        let auth = handler(AuthMode::Both, None);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-live-123"),
        );
        assert_eq!(auth.detect_auth(&headers), DetectedAuth::ApiKey);
    }

    #[tokio::test]
    async fn captured_token_feeds_outbound_headers() {
        let auth = handler(AuthMode::Both, None);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer login-token"),
        );
        auth.capture_inbound(&headers);
        let outbound = auth.outbound_headers().await.unwrap();
        assert_eq!(
            outbound.get(http::header::AUTHORIZATION).unwrap(),
            "Bearer login-token"
        );
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::watch;
use tracing::{info, warn};

use ctxgate_common::AuthMode;

use crate::identity::ProviderId;

use super::credentials::{OAuthCredential, load_credential, persist_credential};
use super::refresh::{
    MAX_CONSECUTIVE_FAILURES, REFRESH_MARGIN_SECS, RefreshError, refresh_access_token,
};
use super::{AuthConfig, AuthHandler, DetectedAuth, HandlerState, body_has_signal, header_value};

const OAUTH_BETA: &str = "oauth-2025-04-20";
const FALLBACK_STATUSES: &[u16] = &[429, 529, 402];
const FALLBACK_SIGNALS: &[&str] = &[
    "rate_limit_error",
    "rate limit",
    "overloaded_error",
    "quota exceeded",
    "credit balance",
    "usage limit",
    "subscription",
];

/// Anthropic handler: actively manages the Claude OAuth grant and falls
/// back to the configured API key on quota-class failures. 401 never
/// triggers fallback here; the refresh loop owns expiry.
pub struct AnthropicAuth {
    config: AuthConfig,
    credential: ArcSwapOption<OAuthCredential>,
    subscription_ok: AtomicBool,
    state: std::sync::Mutex<HandlerState>,
    failures: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl AnthropicAuth {
    pub fn initialize(config: AuthConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let auth = Arc::new(Self {
            config,
            credential: ArcSwapOption::empty(),
            subscription_ok: AtomicBool::new(true),
            state: std::sync::Mutex::new(HandlerState::Uninit),
            failures: AtomicU32::new(0),
            shutdown,
        });

        if auth.config.mode != AuthMode::ApiKey {
            match load_credential() {
                Some(credential) => {
                    info!(
                        event = "auth.credential_loaded",
                        provider = "anthropic",
                        source = ?credential.source,
                    );
                    auth.credential.store(Some(Arc::new(credential)));
                    auth.set_state(HandlerState::Fresh);
                    auth.spawn_refresh_loop();
                }
                None => {
                    warn!(event = "auth.credential_missing", provider = "anthropic");
                    auth.subscription_ok.store(false, Ordering::Relaxed);
                    auth.set_state(HandlerState::Loaded);
                }
            }
        } else {
            auth.set_state(HandlerState::Loaded);
        }
        auth
    }

    pub fn state(&self) -> HandlerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(HandlerState::Broken)
    }

    fn set_state(&self, state: HandlerState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn spawn_refresh_loop(self: &Arc<Self>) {
        let auth = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let sleep_for = auth.time_until_refresh();
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                if !auth.refresh_now().await {
                    break;
                }
            }
        });
    }

    fn time_until_refresh(&self) -> Duration {
        let Some(credential) = self.credential.load_full() else {
            return Duration::from_secs(300);
        };
        let Some(expires_at) = credential.expires_at else {
            // No expiry on record: poll occasionally in case the grant is
            // replaced out from under us.
            return Duration::from_secs(15 * 60);
        };
        let now_ms = time::OffsetDateTime::now_utc().unix_timestamp() * 1000;
        let wake_at = expires_at - REFRESH_MARGIN_SECS * 1000;
        Duration::from_millis((wake_at - now_ms).max(0) as u64)
    }

    /// One refresh attempt. Returns false when the loop should stop.
    async fn refresh_now(&self) -> bool {
        let Some(current) = self.credential.load_full() else {
            return false;
        };
        if !current.expires_within(REFRESH_MARGIN_SECS) {
            return true;
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!(event = "auth.refresh_impossible", provider = "anthropic");
            self.mark_broken();
            return false;
        };

        self.set_state(HandlerState::Refreshing);
        match refresh_access_token(&refresh_token).await {
            Ok(tokens) => {
                let refreshed = OAuthCredential {
                    access_token: tokens.access_token,
                    refresh_token: tokens.refresh_token.or(Some(refresh_token)),
                    expires_at: tokens.expires_at,
                    scopes: if tokens.scopes.is_empty() {
                        current.scopes.clone()
                    } else {
                        tokens.scopes
                    },
                    source: current.source,
                };
                if let Err(err) = persist_credential(&refreshed) {
                    warn!(event = "auth.persist_failed", provider = "anthropic", error = %err);
                }
                self.credential.store(Some(Arc::new(refreshed)));
                self.failures.store(0, Ordering::Relaxed);
                self.subscription_ok.store(true, Ordering::Relaxed);
                self.set_state(HandlerState::Fresh);
                info!(event = "auth.refreshed", provider = "anthropic");
                true
            }
            Err(RefreshError::Rejected(message)) => {
                warn!(event = "auth.refresh_rejected", provider = "anthropic", error = %message);
                self.mark_broken();
                false
            }
            Err(RefreshError::Transient(message)) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event = "auth.refresh_failed",
                    provider = "anthropic",
                    attempt = failures,
                    error = %message,
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    self.mark_broken();
                    return false;
                }
                self.set_state(HandlerState::Fresh);
                tokio::time::sleep(Duration::from_secs(30)).await;
                true
            }
        }
    }

    fn mark_broken(&self) {
        self.subscription_ok.store(false, Ordering::Relaxed);
        self.set_state(HandlerState::Broken);
    }
}

#[async_trait]
impl AuthHandler for AnthropicAuth {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn auth_mode(&self) -> AuthMode {
        self.config.mode
    }

    fn detect_auth(&self, headers: &HeaderMap) -> DetectedAuth {
        if header_value(headers, "x-api-key").is_some() {
            return DetectedAuth::ApiKey;
        }
        if super::bearer_token(headers).is_some() {
            return DetectedAuth::Subscription;
        }
        DetectedAuth::None
    }

    async fn oauth_token(&self) -> Option<String> {
        self.credential
            .load_full()
            .map(|credential| credential.access_token.clone())
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
            headers.insert("anthropic-beta", HeaderValue::from_static(OAUTH_BETA));
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
        headers.insert("x-api-key", HeaderValue::from_str(api_key).ok()?);
        Some(headers)
    }

    fn note_fallback_result(&self, success: bool) {
        if success {
            self.subscription_ok.store(false, Ordering::Relaxed);
        }
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(mode: AuthMode, api_key: Option<&str>) -> Arc<AnthropicAuth> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(AnthropicAuth {
            config: AuthConfig {
                mode,
                api_key: api_key.map(|key| key.to_string()),
            },
            credential: ArcSwapOption::empty(),
            subscription_ok: AtomicBool::new(true),
            state: std::sync::Mutex::new(HandlerState::Fresh),
            failures: AtomicU32::new(0),
            shutdown,
        })
    }

    #[test]
    fn overloaded_529_with_key_falls_back() {
        let auth = handler(AuthMode::Both, Some("sk-ant-test"));
        let status = StatusCode::from_u16(529).unwrap();
        assert!(auth.should_fallback(status, r#"{"type":"error","error":{"type":"overloaded_error"}}"#));
        let headers = auth.fallback_headers().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
    }

    #[test]
    fn unauthorized_401_never_falls_back() {
        let auth = handler(AuthMode::Both, Some("sk-ant-test"));
        assert!(!auth.should_fallback(
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"type":"authentication_error","message":"invalid_api_key"}}"#,
        ));
    }

    #[test]
    fn no_api_key_means_no_fallback() {
        let auth = handler(AuthMode::Both, None);
        let status = StatusCode::from_u16(429).unwrap();
        assert!(!auth.should_fallback(status, "rate_limit_error"));
    }

    #[test]
    fn status_without_signal_is_not_fallback() {
        let auth = handler(AuthMode::Both, Some("sk-ant-test"));
        let status = StatusCode::from_u16(429).unwrap();
        assert!(!auth.should_fallback(status, r#"{"error":{"message":"something else"}}"#));
    }

    #[test]
    fn detect_auth_prefers_api_key_header() {
        let auth = handler(AuthMode::Both, None);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant"));
        assert_eq!(auth.detect_auth(&headers), DetectedAuth::ApiKey);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer oauth-token"),
        );
        assert_eq!(auth.detect_auth(&headers), DetectedAuth::Subscription);
    }

    #[test]
    fn successful_fallback_flips_subscription_flag() {
        let auth = handler(AuthMode::Both, Some("sk-ant-test"));
        assert!(auth.subscription_ok());
        auth.note_fallback_result(true);
        assert!(!auth.subscription_ok());
    }
}

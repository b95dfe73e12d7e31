use std::sync::OnceLock;
use std::time::Duration;

use http::HeaderValue;
use http::header::CONTENT_TYPE;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

pub(super) const REFRESH_MARGIN_SECS: i64 = 5 * 60;
pub(super) const REFRESH_TIMEOUT_SECS: u64 = 30;
pub(super) const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

static REFRESH_CLIENT: OnceLock<wreq::Client> = OnceLock::new();

#[derive(Debug)]
pub(super) struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
}

#[derive(Debug)]
pub(super) enum RefreshError {
    /// The grant itself was rejected; retrying will not help.
    Rejected(String),
    /// Network or transient upstream trouble.
    Transient(String),
}

fn client() -> &'static wreq::Client {
    REFRESH_CLIENT.get_or_init(|| {
        wreq::Client::builder()
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default()
    })
}

pub(super) async fn refresh_access_token(
    refresh_token: &str,
) -> Result<RefreshedTokens, RefreshError> {
    let payload = serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": CLIENT_ID,
        "refresh_token": refresh_token,
    });
    let response = client()
        .post(TOKEN_URL)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .json(&payload)
        .send()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    if !status.is_success() {
        let message = format!("{status}: {}", String::from_utf8_lossy(&body));
        if status.as_u16() == 400 || status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RefreshError::Rejected(message));
        }
        return Err(RefreshError::Transient(message));
    }

    let raw: JsonValue =
        serde_json::from_slice(&body).map_err(|err| RefreshError::Transient(err.to_string()))?;
    let access_token = raw
        .get("access_token")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            RefreshError::Transient("refresh response missing access_token".to_string())
        })?
        .to_string();
    let refresh_token = raw
        .get("refresh_token")
        .and_then(JsonValue::as_str)
        .map(|token| token.to_string());
    let expires_at = raw
        .get("expires_in")
        .and_then(JsonValue::as_i64)
        .map(|seconds| (OffsetDateTime::now_utc().unix_timestamp() + seconds) * 1000);
    let scopes = raw
        .get("scope")
        .and_then(JsonValue::as_str)
        .map(|scope| scope.split_whitespace().map(|s| s.to_string()).collect())
        .unwrap_or_default();
    Ok(RefreshedTokens {
        access_token,
        refresh_token,
        expires_at,
        scopes,
    })
}

use std::path::PathBuf;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::warn;

const KEYRING_SERVICE: &str = "Claude Code-credentials";
const CREDENTIALS_FILE: &str = ".claude/.credentials.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Keystore,
    CredentialsFile,
}

/// One in-memory OAuth record per provider; mutated only by the refresh
/// task and swapped atomically.
#[derive(Debug, Clone)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix milliseconds.
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub source: CredentialSource,
}

impl OAuthCredential {
    pub fn expires_within(&self, margin_secs: i64) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let now_ms = time::OffsetDateTime::now_utc().unix_timestamp() * 1000;
        expires_at - now_ms < margin_secs * 1000
    }
}

/// System keychain preferred; `~/.claude/.credentials.json` on disk as the
/// fallback source.
pub fn load_credential() -> Option<OAuthCredential> {
    match load_from_keystore() {
        Some(credential) => Some(credential),
        None => load_from_file(),
    }
}

/// Persists a refreshed credential back to wherever it was loaded from.
pub fn persist_credential(credential: &OAuthCredential) -> Result<(), String> {
    let payload = credential_json(credential).to_string();
    match credential.source {
        CredentialSource::Keystore => {
            let entry = keyring_entry().map_err(|err| err.to_string())?;
            entry.set_password(&payload).map_err(|err| err.to_string())
        }
        CredentialSource::CredentialsFile => {
            let path = credentials_path().ok_or_else(|| "no home directory".to_string())?;
            std::fs::write(&path, payload).map_err(|err| err.to_string())
        }
    }
}

fn load_from_keystore() -> Option<OAuthCredential> {
    let entry = keyring_entry().ok()?;
    let payload = entry.get_password().ok()?;
    parse_credential(&payload, CredentialSource::Keystore)
}

fn load_from_file() -> Option<OAuthCredential> {
    let path = credentials_path()?;
    let payload = std::fs::read_to_string(&path).ok()?;
    let credential = parse_credential(&payload, CredentialSource::CredentialsFile);
    if credential.is_none() {
        warn!(event = "auth.credentials_parse_failed", path = %path.display());
    }
    credential
}

fn keyring_entry() -> Result<keyring::Entry, keyring::Error> {
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    keyring::Entry::new(KEYRING_SERVICE, &user)
}

fn credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CREDENTIALS_FILE))
}

fn parse_credential(payload: &str, source: CredentialSource) -> Option<OAuthCredential> {
    let value: JsonValue = serde_json::from_str(payload).ok()?;
    let oauth = value.get("claudeAiOauth")?;
    let access_token = oauth.get("accessToken")?.as_str()?.to_string();
    let refresh_token = oauth
        .get("refreshToken")
        .and_then(JsonValue::as_str)
        .map(|token| token.to_string());
    let expires_at = oauth.get("expiresAt").and_then(JsonValue::as_i64);
    let scopes = oauth
        .get("scopes")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|scope| scope.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Some(OAuthCredential {
        access_token,
        refresh_token,
        expires_at,
        scopes,
        source,
    })
}

fn credential_json(credential: &OAuthCredential) -> JsonValue {
    let mut oauth = JsonMap::new();
    oauth.insert(
        "accessToken".to_string(),
        JsonValue::String(credential.access_token.clone()),
    );
    if let Some(refresh_token) = credential.refresh_token.clone() {
        oauth.insert("refreshToken".to_string(), JsonValue::String(refresh_token));
    }
    if let Some(expires_at) = credential.expires_at {
        oauth.insert("expiresAt".to_string(), JsonValue::Number(expires_at.into()));
    }
    if !credential.scopes.is_empty() {
        let scopes = credential
            .scopes
            .iter()
            .cloned()
            .map(JsonValue::String)
            .collect::<Vec<_>>();
        oauth.insert("scopes".to_string(), JsonValue::Array(scopes));
    }
    let mut root = JsonMap::new();
    root.insert("claudeAiOauth".to_string(), JsonValue::Object(oauth));
    JsonValue::Object(root)
}

use std::path::PathBuf;

use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use ctxgate_common::GatewayConfig;

/// Per-process session record. The session directory itself is created by
/// the launcher; the gateway only writes into it when it exists.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub start_time: OffsetDateTime,
    pub session_dir: Option<PathBuf>,
}

impl Session {
    pub fn new(config: &GatewayConfig) -> Self {
        let session_dir = config
            .session_dir
            .as_ref()
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir());
        if config.session_dir.is_some() && session_dir.is_none() {
            warn!(event = "session.dir_missing", dir = ?config.session_dir);
        }
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: OffsetDateTime::now_utc(),
            session_dir,
        }
    }

    /// Writes the merged config snapshot next to the telemetry files.
    pub fn write_config_snapshot(&self, config: &GatewayConfig) {
        let Some(dir) = self.session_dir.as_ref() else {
            return;
        };
        let mut redacted = config.clone();
        redacted.anthropic.api_key = redacted.anthropic.api_key.map(|_| "<set>".to_string());
        redacted.openai.api_key = redacted.openai.api_key.map(|_| "<set>".to_string());
        redacted.gemini.api_key = redacted.gemini.api_key.map(|_| "<set>".to_string());
        redacted.compresr_api_key = redacted.compresr_api_key.map(|_| "<set>".to_string());
        match serde_json::to_vec_pretty(&redacted) {
            Ok(snapshot) => {
                if let Err(err) = std::fs::write(dir.join("config_snapshot.json"), snapshot) {
                    warn!(event = "session.snapshot_failed", error = %err);
                }
            }
            Err(err) => warn!(event = "session.snapshot_failed", error = %err),
        }
    }
}

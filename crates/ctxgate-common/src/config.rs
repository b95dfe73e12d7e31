use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    Subscription,
    Both,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::ApiKey
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeStrategy {
    Compresr,
    ExternalProvider,
    ToolSearch,
    Relevance,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeSettings {
    pub enabled: bool,
    pub strategy: PipeStrategy,
    /// Minimum tool_result size before the output pipe considers a block.
    pub min_bytes: usize,
    /// Fraction of the original the compressed output must beat to be kept.
    pub target_ratio: f64,
    pub max_tools: usize,
    pub min_tools: usize,
    pub always_keep: Vec<String>,
    pub expand_context: bool,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: PipeStrategy::Passthrough,
            min_bytes: 2048,
            target_ratio: 0.3,
            max_tools: 20,
            min_tools: 3,
            always_keep: Vec::new(),
            expand_context: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Percentage of the context window at which compaction is scheduled.
    pub trigger_threshold: u8,
    /// Bytes-per-token ratio for the usage estimate.
    pub estimate_ratio: u32,
    /// Messages hashed into the conversation fingerprint.
    pub fingerprint_messages: usize,
    /// Seconds before an installed summary expires.
    pub summary_ttl_secs: u64,
    pub strategy: PipeStrategy,
    pub summarizer_model: Option<String>,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_threshold: 85,
            estimate_ratio: 4,
            fingerprint_messages: 3,
            summary_ttl_secs: 3 * 60 * 60,
            strategy: PipeStrategy::Compresr,
            summarizer_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CostCaps {
    /// USD ceiling for the session; 0 means unlimited.
    pub session_cap_usd: f64,
    /// USD ceiling across sessions; 0 means unlimited.
    pub global_cap_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub endpoint_override: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub auth_mode: AuthMode,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            endpoint_override: None,
            api_key: None,
            model: None,
            auth_mode: AuthMode::ApiKey,
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults. A snapshot of the merged value is
/// written into the session directory at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub session_dir: Option<String>,
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
    pub gemini: ProviderSettings,
    pub bedrock: ProviderSettings,
    pub aws_region: Option<String>,
    pub compresr_api_key: Option<String>,
    pub compresr_base_url: String,
    pub caps: CostCaps,
    pub tool_output: PipeSettings,
    pub tool_discovery: PipeSettings,
    pub compaction: CompactionSettings,
    /// Upstream inference read timeout in seconds.
    pub upstream_timeout_secs: u64,
}

pub const DEFAULT_COMPRESR_BASE_URL: &str = "https://api.compresr.ai";

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub session_dir: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub aws_region: Option<String>,
    pub compresr_api_key: Option<String>,
    pub compresr_base_url: Option<String>,
    pub session_cap_usd: Option<f64>,
    pub global_cap_usd: Option<f64>,
    pub tool_output: Option<PipeSettings>,
    pub tool_discovery: Option<PipeSettings>,
    pub compaction: Option<CompactionSettings>,
    pub anthropic_auth_mode: Option<AuthMode>,
    pub openai_auth_mode: Option<AuthMode>,
    pub upstream_timeout_secs: Option<u64>,
}

impl GatewayConfigPatch {
    /// Reads the environment variables the gateway consumes. Unset or
    /// malformed values leave the corresponding field untouched.
    pub fn from_env() -> Self {
        let mut patch = Self::default();
        patch.port = std::env::var("GATEWAY_PORT")
            .ok()
            .and_then(|value| value.parse().ok());
        patch.session_dir = std::env::var("SESSION_DIR").ok();
        patch.anthropic_api_key = non_empty(std::env::var("ANTHROPIC_API_KEY").ok());
        patch.openai_api_key = non_empty(std::env::var("OPENAI_API_KEY").ok());
        patch.gemini_api_key = non_empty(std::env::var("GEMINI_API_KEY").ok());
        patch.aws_region = non_empty(std::env::var("AWS_REGION").ok());
        patch.compresr_api_key = non_empty(std::env::var("COMPRESR_API_KEY").ok());
        patch.compresr_base_url = non_empty(std::env::var("COMPRESR_BASE_URL").ok());
        patch
    }

    /// Reads `~/.config/ctxgate/.env` (key=value lines, the installer's
    /// credential store). Layered below the process environment.
    pub fn from_dotenv() -> Self {
        let Some(path) = dirs::config_dir().map(|dir| dir.join("ctxgate").join(".env")) else {
            return Self::default();
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        Self::from_dotenv_str(&contents)
    }

    fn from_dotenv_str(contents: &str) -> Self {
        let mut patch = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "ANTHROPIC_API_KEY" => patch.anthropic_api_key = Some(value),
                "OPENAI_API_KEY" => patch.openai_api_key = Some(value),
                "GEMINI_API_KEY" => patch.gemini_api_key = Some(value),
                "COMPRESR_API_KEY" => patch.compresr_api_key = Some(value),
                "COMPRESR_BASE_URL" => patch.compresr_base_url = Some(value),
                "AWS_REGION" => patch.aws_region = Some(value),
                "GATEWAY_PORT" => patch.port = value.parse().ok(),
                "SESSION_DIR" => patch.session_dir = Some(value),
                _ => {}
            }
        }
        patch
    }

    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.session_dir.is_some() {
            self.session_dir = other.session_dir;
        }
        if other.anthropic_api_key.is_some() {
            self.anthropic_api_key = other.anthropic_api_key;
        }
        if other.openai_api_key.is_some() {
            self.openai_api_key = other.openai_api_key;
        }
        if other.gemini_api_key.is_some() {
            self.gemini_api_key = other.gemini_api_key;
        }
        if other.aws_region.is_some() {
            self.aws_region = other.aws_region;
        }
        if other.compresr_api_key.is_some() {
            self.compresr_api_key = other.compresr_api_key;
        }
        if other.compresr_base_url.is_some() {
            self.compresr_base_url = other.compresr_base_url;
        }
        if other.session_cap_usd.is_some() {
            self.session_cap_usd = other.session_cap_usd;
        }
        if other.global_cap_usd.is_some() {
            self.global_cap_usd = other.global_cap_usd;
        }
        if other.tool_output.is_some() {
            self.tool_output = other.tool_output;
        }
        if other.tool_discovery.is_some() {
            self.tool_discovery = other.tool_discovery;
        }
        if other.compaction.is_some() {
            self.compaction = other.compaction;
        }
        if other.anthropic_auth_mode.is_some() {
            self.anthropic_auth_mode = other.anthropic_auth_mode;
        }
        if other.openai_auth_mode.is_some() {
            self.openai_auth_mode = other.openai_auth_mode;
        }
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let trigger = self
            .compaction
            .as_ref()
            .map(|settings| settings.trigger_threshold)
            .unwrap_or(85);
        if trigger == 0 || trigger >= 100 {
            return Err(GatewayConfigError::InvalidValue {
                field: "compaction.trigger_threshold",
                message: format!("{trigger} is outside (0, 100)"),
            });
        }

        // external_provider exists for the output pipe only; the discovery
        // strategy set is compresr, tool_search, relevance, passthrough.
        if self
            .tool_discovery
            .as_ref()
            .map(|settings| settings.strategy == PipeStrategy::ExternalProvider)
            .unwrap_or(false)
        {
            return Err(GatewayConfigError::InvalidValue {
                field: "tool_discovery.strategy",
                message: "external_provider is not a tool_discovery strategy".to_string(),
            });
        }

        let anthropic_mode = self.anthropic_auth_mode.unwrap_or(AuthMode::Both);
        let openai_mode = self.openai_auth_mode.unwrap_or(AuthMode::Both);
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8484),
            session_dir: self.session_dir,
            anthropic: ProviderSettings {
                api_key: self.anthropic_api_key,
                auth_mode: anthropic_mode,
                ..ProviderSettings::default()
            },
            openai: ProviderSettings {
                api_key: self.openai_api_key,
                auth_mode: openai_mode,
                ..ProviderSettings::default()
            },
            gemini: ProviderSettings {
                api_key: self.gemini_api_key,
                ..ProviderSettings::default()
            },
            bedrock: ProviderSettings::default(),
            aws_region: self.aws_region,
            compresr_api_key: self.compresr_api_key,
            compresr_base_url: self
                .compresr_base_url
                .unwrap_or_else(|| DEFAULT_COMPRESR_BASE_URL.to_string()),
            caps: CostCaps {
                session_cap_usd: self.session_cap_usd.unwrap_or(0.0),
                global_cap_usd: self.global_cap_usd.unwrap_or(0.0),
            },
            tool_output: self.tool_output.unwrap_or_default(),
            tool_discovery: self.tool_discovery.unwrap_or_default(),
            compaction: self.compaction.unwrap_or_default(),
            upstream_timeout_secs: self.upstream_timeout_secs.unwrap_or(1000),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            session_dir: value.session_dir,
            anthropic_api_key: value.anthropic.api_key,
            openai_api_key: value.openai.api_key,
            gemini_api_key: value.gemini.api_key,
            aws_region: value.aws_region,
            compresr_api_key: value.compresr_api_key,
            compresr_base_url: Some(value.compresr_base_url),
            session_cap_usd: Some(value.caps.session_cap_usd),
            global_cap_usd: Some(value.caps.global_cap_usd),
            tool_output: Some(value.tool_output),
            tool_discovery: Some(value.tool_discovery),
            compaction: Some(value.compaction),
            anthropic_auth_mode: Some(value.anthropic.auth_mode),
            openai_auth_mode: Some(value.openai.auth_mode),
            upstream_timeout_secs: Some(value.upstream_timeout_secs),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layer() {
        let mut base = GatewayConfigPatch {
            port: Some(8484),
            anthropic_api_key: Some("env-key".to_string()),
            ..GatewayConfigPatch::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9090),
            ..GatewayConfigPatch::default()
        });
        assert_eq!(base.port, Some(9090));
        assert_eq!(base.anthropic_api_key.as_deref(), Some("env-key"));
    }

    #[test]
    fn into_config_applies_defaults() {
        let config = GatewayConfigPatch::default().into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8484);
        assert_eq!(config.caps.session_cap_usd, 0.0);
        assert_eq!(config.compaction.trigger_threshold, 85);
        assert_eq!(config.upstream_timeout_secs, 1000);
    }

    #[test]
    fn dotenv_lines_parse_into_patch() {
        let patch = GatewayConfigPatch::from_dotenv_str(
            "# creds\nANTHROPIC_API_KEY=sk-ant-x\nCOMPRESR_API_KEY=\"ck-1\"\nGATEWAY_PORT=9191\nnot a line\n",
        );
        assert_eq!(patch.anthropic_api_key.as_deref(), Some("sk-ant-x"));
        assert_eq!(patch.compresr_api_key.as_deref(), Some("ck-1"));
        assert_eq!(patch.port, Some(9191));
        assert!(patch.openai_api_key.is_none());
    }

    #[test]
    fn into_config_rejects_external_provider_discovery() {
        let patch = GatewayConfigPatch {
            tool_discovery: Some(PipeSettings {
                enabled: true,
                strategy: PipeStrategy::ExternalProvider,
                ..PipeSettings::default()
            }),
            ..GatewayConfigPatch::default()
        };
        assert!(patch.into_config().is_err());

        let patch = GatewayConfigPatch {
            tool_output: Some(PipeSettings {
                enabled: true,
                strategy: PipeStrategy::ExternalProvider,
                ..PipeSettings::default()
            }),
            ..GatewayConfigPatch::default()
        };
        assert!(patch.into_config().is_ok());
    }

    #[test]
    fn into_config_rejects_bad_threshold() {
        let patch = GatewayConfigPatch {
            compaction: Some(CompactionSettings {
                trigger_threshold: 100,
                ..CompactionSettings::default()
            }),
            ..GatewayConfigPatch::default()
        };
        assert!(patch.into_config().is_err());
    }
}

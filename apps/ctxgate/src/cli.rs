use clap::Parser;

use ctxgate_common::{AuthMode, GatewayConfigPatch, PipeSettings, PipeStrategy};

#[derive(Parser)]
#[command(name = "ctxgate", about = "Local context-optimization gateway for agentic LLM clients")]
pub(crate) struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8484)]
    pub(crate) port: u16,
    #[arg(long, env = "SESSION_DIR")]
    pub(crate) session_dir: Option<String>,
    /// USD ceiling for this session; 0 disables the cap.
    #[arg(long, default_value_t = 0.0)]
    pub(crate) session_cap: f64,
    /// USD ceiling across sessions; 0 disables the cap.
    #[arg(long, default_value_t = 0.0)]
    pub(crate) global_cap: f64,
    /// tool_output pipe strategy: compresr, external_provider, passthrough.
    #[arg(long)]
    pub(crate) tool_output: Option<String>,
    /// tool_discovery pipe strategy: compresr, tool-search, relevance, passthrough.
    #[arg(long)]
    pub(crate) tool_discovery: Option<String>,
    /// Context-window percentage that schedules compaction.
    #[arg(long)]
    pub(crate) trigger_threshold: Option<u8>,
    #[arg(long)]
    pub(crate) no_compaction: bool,
    /// anthropic auth: api_key, subscription, both.
    #[arg(long)]
    pub(crate) anthropic_auth: Option<String>,
    /// openai auth: api_key, subscription, both.
    #[arg(long)]
    pub(crate) openai_auth: Option<String>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GatewayConfigPatch {
        let mut patch = GatewayConfigPatch {
            host: Some(self.host),
            port: Some(self.port),
            session_dir: self.session_dir,
            session_cap_usd: Some(self.session_cap),
            global_cap_usd: Some(self.global_cap),
            anthropic_auth_mode: self.anthropic_auth.as_deref().and_then(parse_auth_mode),
            openai_auth_mode: self.openai_auth.as_deref().and_then(parse_auth_mode),
            ..GatewayConfigPatch::default()
        };
        if let Some(strategy) = self.tool_output.as_deref().and_then(parse_strategy) {
            patch.tool_output = Some(PipeSettings {
                enabled: strategy != PipeStrategy::Passthrough,
                strategy,
                ..PipeSettings::default()
            });
        }
        if let Some(strategy) = self.tool_discovery.as_deref().and_then(parse_strategy) {
            patch.tool_discovery = Some(PipeSettings {
                enabled: strategy != PipeStrategy::Passthrough,
                strategy,
                ..PipeSettings::default()
            });
        }
        if self.no_compaction || self.trigger_threshold.is_some() {
            let mut compaction = ctxgate_common::CompactionSettings::default();
            if let Some(threshold) = self.trigger_threshold {
                compaction.trigger_threshold = threshold;
            }
            compaction.enabled = !self.no_compaction;
            patch.compaction = Some(compaction);
        }
        patch
    }
}

fn parse_strategy(value: &str) -> Option<PipeStrategy> {
    match value {
        "compresr" => Some(PipeStrategy::Compresr),
        "external_provider" | "external-provider" => Some(PipeStrategy::ExternalProvider),
        "tool-search" | "tool_search" => Some(PipeStrategy::ToolSearch),
        "relevance" => Some(PipeStrategy::Relevance),
        "passthrough" => Some(PipeStrategy::Passthrough),
        _ => None,
    }
}

fn parse_auth_mode(value: &str) -> Option<AuthMode> {
    match value {
        "api_key" | "api-key" => Some(AuthMode::ApiKey),
        "subscription" => Some(AuthMode::Subscription),
        "both" => Some(AuthMode::Both),
        _ => None,
    }
}

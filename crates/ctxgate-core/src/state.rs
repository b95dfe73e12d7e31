use std::sync::Arc;

use arc_swap::ArcSwapOption;

use ctxgate_common::{AuthMode, GatewayConfig, PipeStrategy};
use ctxgate_compact::{
    CapturedAuth, Compactor, ExternalLlmConfig, Summarizer, SummarizerStrategy,
};
use ctxgate_cost::{CostTracker, SavingsTracker};
use ctxgate_pipes::{
    CompresrClient, ExpandContextStore, ToolDiscoveryPipe, ToolOutputPipe, ToolSearchStore,
};
use ctxgate_provider::ProviderId;
use ctxgate_provider::auth::{AnthropicAuth, AuthConfig, AuthRegistry, KeyedAuth, OpenAiAuth};

use crate::compressor::LlmCompressor;
use crate::session::Session;
use crate::status::StatusReporter;
use crate::telemetry::EventHub;
use crate::upstream::UpstreamClient;

/// Everything the request handlers share. Owned for the process lifetime;
/// per-request objects live and die with their handler task.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub session: Session,
    pub auth: AuthRegistry,
    pub cost: Arc<CostTracker>,
    pub savings: Arc<SavingsTracker>,
    pub tool_output: ToolOutputPipe,
    pub tool_discovery: ToolDiscoveryPipe,
    pub compactor: Compactor,
    pub upstream: UpstreamClient,
    pub events: EventHub,
    pub status: Arc<StatusReporter>,
    /// Most recent auth captured from any inbound request, for the
    /// summarizer's last-resort key resolution.
    pub captured_auth: ArcSwapOption<CapturedAuth>,
}

pub fn build_state(config: GatewayConfig) -> Result<Arc<GatewayState>, String> {
    let session = Session::new(&config);
    session.write_config_snapshot(&config);

    let compresr = config.compresr_api_key.as_ref().map(|api_key| {
        Arc::new(
            CompresrClient::new(config.compresr_base_url.clone(), api_key.clone())
                .with_model(config.compaction.summarizer_model.clone()),
        )
    });

    let mut auth = AuthRegistry::new();
    auth.register(AnthropicAuth::initialize(AuthConfig {
        mode: config.anthropic.auth_mode,
        api_key: config.anthropic.api_key.clone(),
    }));
    auth.register(OpenAiAuth::initialize(AuthConfig {
        mode: config.openai.auth_mode,
        api_key: config.openai.api_key.clone(),
    }));
    auth.register(KeyedAuth::initialize(
        ProviderId::Gemini,
        AuthConfig {
            mode: AuthMode::ApiKey,
            api_key: config.gemini.api_key.clone(),
        },
    ));
    auth.register(KeyedAuth::initialize(
        ProviderId::Bedrock,
        AuthConfig {
            mode: AuthMode::ApiKey,
            api_key: config.bedrock.api_key.clone(),
        },
    ));

    let cost = Arc::new(CostTracker::new(config.caps));
    let savings = Arc::new(SavingsTracker::new());

    let expand = Arc::new(ExpandContextStore::new());
    let external_compressor: Option<Arc<dyn ctxgate_pipes::TextCompressor>> =
        match (config.tool_output.strategy, config.anthropic.api_key.clone()) {
            (PipeStrategy::ExternalProvider, Some(api_key)) => {
                Some(Arc::new(LlmCompressor::new(
                    config.anthropic.endpoint_override.clone(),
                    api_key,
                    config
                        .compaction
                        .summarizer_model
                        .clone()
                        .unwrap_or_else(|| "claude-haiku-4-5".to_string()),
                )))
            }
            _ => None,
        };
    let tool_output = ToolOutputPipe::new(
        config.tool_output.clone(),
        compresr.clone(),
        external_compressor,
        expand,
    );
    let tool_discovery = ToolDiscoveryPipe::new(
        config.tool_discovery.clone(),
        compresr.clone(),
        Arc::new(ToolSearchStore::new()),
    );

    let strategy = match (config.compaction.strategy, compresr.clone()) {
        (PipeStrategy::Compresr, Some(client)) => SummarizerStrategy::Compresr(client),
        _ => SummarizerStrategy::External(ExternalLlmConfig {
            api_key: config.anthropic.api_key.clone(),
            endpoint: config.anthropic.endpoint_override.clone(),
            model: config
                .compaction
                .summarizer_model
                .clone()
                .unwrap_or_else(|| "claude-haiku-4-5".to_string()),
        }),
    };
    let compactor =
        Compactor::new(config.compaction.clone(), Summarizer::new(strategy)).with_cost(cost.clone());

    let upstream = UpstreamClient::new(config.upstream_timeout_secs)?;
    let status = StatusReporter::new(cost.clone(), savings.clone(), compresr);

    Ok(Arc::new(GatewayState {
        config,
        session,
        auth,
        cost,
        savings,
        tool_output,
        tool_discovery,
        compactor,
        upstream,
        events: EventHub::new(),
        status,
        captured_auth: ArcSwapOption::empty(),
    }))
}

impl GatewayState {
    /// Upstream base URL for a provider, honoring config overrides and the
    /// Bedrock region.
    pub fn endpoint_for(&self, provider: ProviderId) -> String {
        let settings = match provider {
            ProviderId::Anthropic => &self.config.anthropic,
            ProviderId::OpenAi => &self.config.openai,
            ProviderId::Gemini => &self.config.gemini,
            ProviderId::Bedrock => &self.config.bedrock,
        };
        settings
            .endpoint_override
            .clone()
            .unwrap_or_else(|| provider.endpoint_for_region(self.config.aws_region.as_deref()))
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

const COMPRESR_TIMEOUT_SECS: u64 = 30;
const API_KEY_HEADER: &str = "X-API-Key";
const SOURCE: &str = "ctxgate";

#[derive(Debug)]
pub struct CompresrError(pub String);

impl std::fmt::Display for CompresrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CompresrError {}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayStatus {
    pub tier: Option<String>,
    pub credits_remaining_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ToolOutputResponse {
    compressed_output: String,
}

#[derive(Debug, Deserialize)]
struct ToolDiscoveryResponse {
    relevant_tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostedModelPrice {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub summary: String,
    #[serde(default)]
    pub summary_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Client for the hosted compression API. All calls carry `X-API-Key` and a
/// 30 second deadline.
pub struct CompresrClient {
    base_url: String,
    api_key: String,
    model_name: Option<String>,
    client: wreq::Client,
}

impl CompresrClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model_name: None,
            client: wreq::Client::builder()
                .timeout(Duration::from_secs(COMPRESR_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model_name = model;
        self
    }

    pub async fn compress_tool_output(
        &self,
        tool_output: &str,
        query: &str,
        tool_name: Option<&str>,
    ) -> Result<String, CompresrError> {
        let payload = json!({
            "tool_output": tool_output,
            "query": query,
            "tool_name": tool_name,
            "compression_model_name": self.model_name,
            "source": SOURCE,
        });
        let parsed: ToolOutputResponse = self.post("/api/compress/tool-output/", &payload).await?;
        Ok(parsed.compressed_output)
    }

    pub async fn filter_tools(
        &self,
        query: &str,
        always_keep: &[String],
        tools: &[serde_json::Value],
        max_tools: usize,
    ) -> Result<Vec<String>, CompresrError> {
        let payload = json!({
            "query": query,
            "always_keep": always_keep,
            "tools": tools,
            "max_tools": max_tools,
            "compression_model_name": self.model_name,
        });
        let parsed: ToolDiscoveryResponse =
            self.post("/api/compress/tool-discovery/", &payload).await?;
        Ok(parsed.relevant_tools)
    }

    pub async fn compress_history(
        &self,
        messages: &[HistoryMessage],
        keep_recent: usize,
    ) -> Result<HistoryResponse, CompresrError> {
        let payload = json!({
            "messages": messages,
            "keep_recent": keep_recent,
            "compression_model_name": self.model_name,
            "source": SOURCE,
        });
        self.post("/api/compress/history/", &payload).await
    }

    pub async fn gateway_status(&self) -> Result<GatewayStatus, CompresrError> {
        self.get("/api/gateway/status").await
    }

    /// Hosted pricing for a model group, e.g. `anthropic`.
    pub async fn pricing_models(
        &self,
        group: &str,
    ) -> Result<Vec<HostedModelPrice>, CompresrError> {
        self.get(&format!("/api/pricing/models/{group}")).await
    }

    pub async fn subscription(&self) -> Result<GatewayStatus, CompresrError> {
        self.get("/api/pricing/subscription").await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<T, CompresrError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(payload)
            .send()
            .await
            .map_err(|err| CompresrError(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| CompresrError(err.to_string()))?;
        if !status.is_success() {
            return Err(CompresrError(format!(
                "{path} returned {status}: {}",
                String::from_utf8_lossy(&body),
            )));
        }
        serde_json::from_slice(&body).map_err(|err| CompresrError(err.to_string()))
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CompresrError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .send()
            .await
            .map_err(|err| CompresrError(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| CompresrError(err.to_string()))?;
        if !status.is_success() {
            return Err(CompresrError(format!("{path} returned {status}")));
        }
        serde_json::from_slice(&body).map_err(|err| CompresrError(err.to_string()))
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use ctxgate_pipes::{PipeError, TextCompressor};

const COMPRESS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const COMPRESS_SYSTEM_PROMPT: &str = "You compress tool output for a coding agent. Rewrite the \
tool output keeping only what is relevant to the user's current query: error messages, file \
paths, identifiers, counts, and conclusions. Drop boilerplate and repetition. Reply with the \
compressed output only.";

/// External-provider strategy for the tool-output pipe: one fixed-prompt LLM
/// call per oversized block.
pub struct LlmCompressor {
    endpoint: String,
    api_key: String,
    model: String,
    client: wreq::Client,
}

impl LlmCompressor {
    pub fn new(endpoint: Option<String>, api_key: String, model: String) -> Self {
        Self {
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key,
            model,
            client: wreq::Client::builder()
                .timeout(Duration::from_secs(COMPRESS_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl TextCompressor for LlmCompressor {
    async fn compress(&self, text: &str, query: &str) -> Result<String, PipeError> {
        let prompt = format!("Current query:\n{query}\n\nTool output:\n{text}");
        let payload = json!({
            "model": self.model,
            "max_tokens": 1024,
            "system": COMPRESS_SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("anthropic-version", "2023-06-01")
            .header("x-api-key", self.api_key.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|err| PipeError(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| PipeError(err.to_string()))?;
        if !status.is_success() {
            return Err(PipeError(format!("compressor upstream returned {status}")));
        }
        let parsed: Value =
            serde_json::from_slice(&body).map_err(|err| PipeError(err.to_string()))?;
        parsed
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks.iter().find_map(|block| {
                    block.get("text").and_then(Value::as_str).map(|t| t.to_string())
                })
            })
            .ok_or_else(|| PipeError("compressor response had no text".to_string()))
    }
}

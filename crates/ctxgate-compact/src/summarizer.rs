use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::debug;

use ctxgate_pipes::CompresrClient;
use ctxgate_pipes::compresr::HistoryMessage;

use crate::meter::keep_tokens;

const EXTERNAL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SUMMARY_ENDPOINT: &str = "https://api.anthropic.com";
const SUMMARY_SYSTEM_PROMPT: &str = "You are a conversation compactor for a coding agent. \
Summarize the transcript you are given into a dense brief that preserves: the user's goals, \
decisions made, file paths and identifiers touched, tool activity and outcomes, unresolved \
errors, and any constraints stated. Write plain prose. Do not add commentary.";

#[derive(Debug)]
pub struct SummarizeError(pub String);

impl std::fmt::Display for SummarizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SummarizeError {}

/// Immutable snapshot of auth captured from an inbound request, taken at
/// job creation time so a compaction job never reads another session's
/// credentials.
#[derive(Debug, Clone, Default)]
pub struct CapturedAuth {
    pub endpoint: Option<String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ExternalLlmConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: String,
}

pub enum SummarizerStrategy {
    Compresr(Arc<CompresrClient>),
    External(ExternalLlmConfig),
}

#[derive(Debug, Clone)]
pub struct SummaryInput {
    /// (role, flattened text) pairs; tool_use blocks arrive pre-flattened
    /// as `[Tool: name]` placeholders.
    pub messages: Vec<(String, String)>,
    /// Explicit override for determinism in tests; defaults to the
    /// threshold-derived budget.
    pub keep_recent_tokens: Option<u64>,
    pub trigger_threshold: u8,
    pub context_window: u64,
    pub estimate_ratio: u32,
    pub model: String,
    pub per_job_auth: Option<CapturedAuth>,
    pub global_auth: Option<CapturedAuth>,
}

#[derive(Debug, Clone)]
pub struct SummaryOutput {
    pub summary_text: String,
    pub summary_tokens: u64,
    pub last_summarized_index: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration: Duration,
}

pub struct Summarizer {
    strategy: SummarizerStrategy,
    client: wreq::Client,
}

impl Summarizer {
    pub fn new(strategy: SummarizerStrategy) -> Self {
        Self {
            strategy,
            client: wreq::Client::builder()
                .timeout(Duration::from_secs(EXTERNAL_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn summarize(&self, input: SummaryInput) -> Result<SummaryOutput, SummarizeError> {
        let started = Instant::now();
        let keep = input
            .keep_recent_tokens
            .unwrap_or_else(|| keep_tokens(input.context_window, input.trigger_threshold));
        let cutoff = text_cutoff_index(&input.messages, keep, input.estimate_ratio)
            .ok_or_else(|| SummarizeError("conversation too short to compact".to_string()))?;
        let to_summarize = &input.messages[..=cutoff];

        let (summary_text, summary_tokens, input_tokens, output_tokens) = match &self.strategy {
            SummarizerStrategy::Compresr(client) => {
                let messages: Vec<HistoryMessage> = to_summarize
                    .iter()
                    .map(|(role, content)| HistoryMessage {
                        role: role.clone(),
                        content: content.clone(),
                    })
                    .collect();
                let keep_recent = input.messages.len() - cutoff - 1;
                let response = client
                    .compress_history(&messages, keep_recent)
                    .await
                    .map_err(|err| SummarizeError(err.to_string()))?;
                let tokens = response
                    .summary_tokens
                    .unwrap_or(response.summary.len() as u64 / input.estimate_ratio.max(1) as u64);
                (response.summary, tokens, 0, 0)
            }
            SummarizerStrategy::External(config) => {
                self.summarize_external(config, &input, to_summarize).await?
            }
        };

        debug!(
            event = "summarizer.done",
            cutoff,
            summary_tokens,
            elapsed_ms = started.elapsed().as_millis(),
        );
        Ok(SummaryOutput {
            summary_text,
            summary_tokens,
            last_summarized_index: cutoff,
            input_tokens,
            output_tokens,
            duration: started.elapsed(),
        })
    }

    async fn summarize_external(
        &self,
        config: &ExternalLlmConfig,
        input: &SummaryInput,
        to_summarize: &[(String, String)],
    ) -> Result<(String, u64, u64, u64), SummarizeError> {
        // Key precedence: configured > per-job captured > globally captured.
        // A captured OAuth token is endpoint-bound, so the captured endpoint
        // rides along with it.
        let (endpoint, headers) = if let Some(api_key) = config.api_key.as_deref() {
            let endpoint = config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_SUMMARY_ENDPOINT.to_string());
            (endpoint, vec![("x-api-key".to_string(), api_key.to_string())])
        } else {
            let captured = input
                .per_job_auth
                .clone()
                .or_else(|| input.global_auth.clone())
                .ok_or_else(|| {
                    SummarizeError("no api key configured and no captured auth".to_string())
                })?;
            let endpoint = captured
                .endpoint
                .clone()
                .or_else(|| config.endpoint.clone())
                .unwrap_or_else(|| DEFAULT_SUMMARY_ENDPOINT.to_string());
            (endpoint, captured.headers)
        };

        let transcript = to_summarize
            .iter()
            .map(|(role, text)| format!("{role}: {text}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let model = if config.model.is_empty() {
            input.model.clone()
        } else {
            config.model.clone()
        };
        let payload = json!({
            "model": model,
            "max_tokens": 2048,
            "system": SUMMARY_SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": transcript }],
        });

        let url = format!("{}/v1/messages", endpoint.trim_end_matches('/'));
        let mut request = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("anthropic-version", "2023-06-01");
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .json(&payload)
            .send()
            .await
            .map_err(|err| SummarizeError(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| SummarizeError(err.to_string()))?;
        if !status.is_success() {
            return Err(SummarizeError(format!(
                "summarizer upstream returned {status}: {}",
                String::from_utf8_lossy(&body),
            )));
        }
        let parsed: Value =
            serde_json::from_slice(&body).map_err(|err| SummarizeError(err.to_string()))?;
        let summary = parsed
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks.iter().find_map(|block| {
                    block.get("text").and_then(Value::as_str).map(|t| t.to_string())
                })
            })
            .ok_or_else(|| SummarizeError("summarizer response had no text".to_string()))?;
        let input_tokens = parsed
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output_tokens = parsed
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok((summary, output_tokens.max(1), input_tokens, output_tokens))
    }
}

/// Same walk as the envelope cutoff, over flattened text lengths.
fn text_cutoff_index(messages: &[(String, String)], keep: u64, ratio: u32) -> Option<usize> {
    if messages.len() < 2 {
        return None;
    }
    let ratio = ratio.max(1) as u64;
    let mut accumulated = 0u64;
    for index in (0..messages.len()).rev() {
        accumulated += messages[index].1.len() as u64 / ratio;
        if accumulated >= keep {
            if index == 0 {
                return Some(0);
            }
            return Some((index - 1).min(messages.len() - 2));
        }
    }
    Some(messages.len() - 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(count: usize, bytes: usize) -> Vec<(String, String)> {
        (0..count)
            .map(|index| {
                let role = if index % 2 == 0 { "user" } else { "assistant" };
                (role.to_string(), "x".repeat(bytes))
            })
            .collect()
    }

    #[test]
    fn explicit_keep_budget_drives_cutoff() {
        // 10 messages of ~1000 tokens; keeping 2000 leaves the last two.
        let messages = turns(10, 4000);
        let cutoff = text_cutoff_index(&messages, 2000, 4).unwrap();
        assert_eq!(cutoff, 7);
    }

    #[test]
    fn threshold_derived_budget_matches_meter() {
        let keep = keep_tokens(100_000, 80);
        assert_eq!(keep, 20_000);
        let messages = turns(10, 40_000);
        let cutoff = text_cutoff_index(&messages, keep, 4).unwrap();
        // Each message estimates to 10_000 tokens; two fit in the budget.
        assert_eq!(cutoff, 7);
    }

    #[test]
    fn too_short_to_compact() {
        let messages = turns(1, 100);
        assert!(text_cutoff_index(&messages, 10, 4).is_none());
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use ctxgate_common::{PipeSettings, PipeStrategy};
use ctxgate_protocol::Envelope;
use ctxgate_protocol::envelope::ToolResultView;

use crate::PipeError;
use crate::compresr::CompresrClient;
use crate::expand::ExpandContextStore;

/// Seam for the external-provider strategy; the gateway runtime supplies an
/// implementation backed by a configured LLM.
#[async_trait]
pub trait TextCompressor: Send + Sync {
    async fn compress(&self, text: &str, query: &str) -> Result<String, PipeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOutcome {
    pub candidates: usize,
    pub compressed: usize,
    pub saved_bytes: u64,
}

/// Rewrites oversized tool_result blocks on the inbound path. Failures are
/// silent: the original content always survives a misbehaving strategy.
pub struct ToolOutputPipe {
    settings: PipeSettings,
    compresr: Option<Arc<CompresrClient>>,
    external: Option<Arc<dyn TextCompressor>>,
    expand: Arc<ExpandContextStore>,
}

impl ToolOutputPipe {
    pub fn new(
        settings: PipeSettings,
        compresr: Option<Arc<CompresrClient>>,
        external: Option<Arc<dyn TextCompressor>>,
        expand: Arc<ExpandContextStore>,
    ) -> Self {
        Self {
            settings,
            compresr,
            external,
            expand,
        }
    }

    pub fn expand_store(&self) -> Arc<ExpandContextStore> {
        self.expand.clone()
    }

    pub async fn apply(&self, envelope: &mut Envelope) -> OutputOutcome {
        let mut outcome = OutputOutcome::default();
        if !self.settings.enabled || self.settings.strategy == PipeStrategy::Passthrough {
            return outcome;
        }

        if self.settings.expand_context {
            self.answer_expand_calls(envelope);
        }

        let query = envelope.last_user_query().unwrap_or_default();
        let mut views: Vec<ToolResultView> = Vec::new();
        envelope.rewrite_tool_results(|view| {
            views.push(view.clone());
            None
        });
        let has_live_trailer = views.iter().any(|view| view.text.contains("ec_"));

        let mut replacements: Vec<Option<String>> = Vec::with_capacity(views.len());
        for view in &views {
            // Blocks that already carry the trailer were compressed on an
            // earlier turn; touching them again would compound losses.
            if view.byte_len < self.settings.min_bytes
                || view.tool_name.as_deref() == Some(crate::expand::EXPAND_TOOL_NAME)
                || view.text.contains(crate::expand::TRAILER_MARK)
            {
                replacements.push(None);
                continue;
            }
            outcome.candidates += 1;
            match self.compress_one(view, &query).await {
                Ok(Some(compressed)) => {
                    let saved = view.byte_len.saturating_sub(compressed.len());
                    outcome.compressed += 1;
                    outcome.saved_bytes += saved as u64;
                    replacements.push(Some(compressed));
                }
                Ok(None) => replacements.push(None),
                Err(err) => {
                    warn!(
                        event = "pipe.tool_output_failed",
                        tool = view.tool_name.as_deref().unwrap_or("unknown"),
                        error = %err,
                    );
                    replacements.push(None);
                }
            }
        }

        let mut cursor = 0usize;
        envelope.rewrite_tool_results(|_| {
            let replacement = replacements.get(cursor).cloned().flatten();
            cursor += 1;
            replacement
        });

        if self.settings.expand_context
            && (outcome.compressed > 0 || has_live_trailer)
            && !envelope.tools().is_empty()
            && !envelope
                .tool_catalog()
                .iter()
                .any(|entry| entry.name == crate::expand::EXPAND_TOOL_NAME)
        {
            envelope.append_tool(crate::expand::expand_tool_schema());
        }
        outcome
    }

    /// Resolves pending `expand_context` calls from the LRU store so the
    /// trailer's promise is always honored locally.
    fn answer_expand_calls(&self, envelope: &mut Envelope) {
        let calls = envelope.tool_use_inputs();
        let store = &self.expand;
        envelope.rewrite_tool_results(|view| {
            if view.tool_name.as_deref() != Some(crate::expand::EXPAND_TOOL_NAME) {
                return None;
            }
            let id = view.tool_use_id.as_deref().and_then(|call_id| {
                calls
                    .iter()
                    .find(|(known, _, _)| known == call_id)
                    .and_then(|(_, _, input)| {
                        input
                            .get("id")
                            .and_then(serde_json::Value::as_str)
                            .map(|id| id.to_string())
                    })
            })?;
            Some(store.get(&id).unwrap_or_else(|| {
                format!("[expand_context entry {id} has expired from the gateway cache]")
            }))
        });
    }

    /// Returns Ok(None) when the strategy result did not beat the target
    /// ratio and the original should be kept.
    async fn compress_one(
        &self,
        view: &ToolResultView,
        query: &str,
    ) -> Result<Option<String>, PipeError> {
        let compressed = match self.settings.strategy {
            PipeStrategy::Compresr => {
                let client = self
                    .compresr
                    .as_ref()
                    .ok_or_else(|| PipeError("compresr client not configured".to_string()))?;
                client
                    .compress_tool_output(&view.text, query, view.tool_name.as_deref())
                    .await
                    .map_err(|err| PipeError(err.to_string()))?
            }
            PipeStrategy::ExternalProvider => {
                let external = self
                    .external
                    .as_ref()
                    .ok_or_else(|| PipeError("external compressor not configured".to_string()))?;
                external.compress(&view.text, query).await?
            }
            _ => return Ok(None),
        };

        let budget = (view.byte_len as f64 * (1.0 - self.settings.target_ratio)) as usize;
        if compressed.len() >= budget {
            debug!(
                event = "pipe.tool_output_kept_original",
                original = view.byte_len,
                compressed = compressed.len(),
            );
            return Ok(None);
        }

        if self.settings.expand_context {
            let id = self.expand.insert(view.text.clone());
            let trailer = self.expand.trailer(&id);
            return Ok(Some(format!("{compressed}{trailer}")));
        }
        Ok(Some(compressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use ctxgate_protocol::WireShape;
    use ctxgate_protocol::envelope::flatten_message_text;

    struct HalvingCompressor;

    #[async_trait]
    impl TextCompressor for HalvingCompressor {
        async fn compress(&self, text: &str, _query: &str) -> Result<String, PipeError> {
            Ok(text.chars().take(text.len() / 4).collect())
        }
    }

    struct FailingCompressor;

    #[async_trait]
    impl TextCompressor for FailingCompressor {
        async fn compress(&self, _text: &str, _query: &str) -> Result<String, PipeError> {
            Err(PipeError("strategy exploded".to_string()))
        }
    }

    fn envelope_with_result(payload: &str) -> Envelope {
        Envelope::from_value(
            WireShape::Claude,
            json!({
                "model": "claude-sonnet-4-5",
                "messages": [
                    { "role": "user", "content": "summarize the log" },
                    { "role": "assistant", "content": [
                        { "type": "tool_use", "id": "tu_1", "name": "read_log", "input": {} }
                    ]},
                    { "role": "user", "content": [
                        { "type": "tool_result", "tool_use_id": "tu_1", "content": payload }
                    ]}
                ]
            }),
        )
    }

    fn pipe(settings: PipeSettings, external: Arc<dyn TextCompressor>) -> ToolOutputPipe {
        ToolOutputPipe::new(settings, None, Some(external), Arc::new(ExpandContextStore::new()))
    }

    fn settings(min_bytes: usize) -> PipeSettings {
        PipeSettings {
            enabled: true,
            strategy: PipeStrategy::ExternalProvider,
            min_bytes,
            target_ratio: 0.3,
            expand_context: true,
            ..PipeSettings::default()
        }
    }

    #[tokio::test]
    async fn small_results_are_untouched() {
        let pipe = pipe(settings(1024), Arc::new(HalvingCompressor));
        let mut envelope = envelope_with_result("tiny");
        let outcome = pipe.apply(&mut envelope).await;
        assert_eq!(outcome.candidates, 0);
        assert!(!envelope.is_dirty());
    }

    #[tokio::test]
    async fn large_results_get_compressed_with_trailer() {
        let pipe = pipe(settings(64), Arc::new(HalvingCompressor));
        let payload = "x".repeat(1000);
        let mut envelope = envelope_with_result(&payload);
        let outcome = pipe.apply(&mut envelope).await;
        assert_eq!(outcome.compressed, 1);
        assert!(outcome.saved_bytes > 0);
        let text = flatten_message_text(WireShape::Claude, &envelope.messages()[2]);
        assert!(text.contains("expand_context"));
        assert!(text.len() < payload.len());
    }

    #[tokio::test]
    async fn strategy_failure_keeps_original() {
        let pipe = pipe(settings(64), Arc::new(FailingCompressor));
        let payload = "y".repeat(500);
        let mut envelope = envelope_with_result(&payload);
        let outcome = pipe.apply(&mut envelope).await;
        assert_eq!(outcome.compressed, 0);
        let text = flatten_message_text(WireShape::Claude, &envelope.messages()[2]);
        assert_eq!(text, payload);
    }

    #[tokio::test]
    async fn already_compressed_blocks_are_not_recompressed() {
        let pipe = pipe(settings(64), Arc::new(HalvingCompressor));
        let payload = "x".repeat(1000);
        let mut envelope = envelope_with_result(&payload);
        pipe.apply(&mut envelope).await;
        let after_first =
            flatten_message_text(WireShape::Claude, &envelope.messages()[2]);

        let outcome = pipe.apply(&mut envelope).await;
        assert_eq!(outcome.compressed, 0);
        let after_second =
            flatten_message_text(WireShape::Claude, &envelope.messages()[2]);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn disabled_pipe_is_passthrough() {
        let mut off = settings(64);
        off.enabled = false;
        let pipe = pipe(off, Arc::new(HalvingCompressor));
        let mut envelope = envelope_with_result(&"z".repeat(500));
        let outcome = pipe.apply(&mut envelope).await;
        assert_eq!(outcome.candidates, 0);
        assert!(!envelope.is_dirty());
    }
}

use std::sync::Arc;

use tracing::warn;

use ctxgate_common::{PipeSettings, PipeStrategy};
use ctxgate_protocol::Envelope;
use ctxgate_protocol::envelope::tool_value_for_shape;

use crate::compresr::CompresrClient;
use crate::relevance::score_tools;
use crate::tool_search::{TOOL_SEARCH_NAME, ToolSearchStore, tool_search_meta_tool};

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryOutcome {
    pub original_tools: usize,
    pub kept_tools: usize,
    pub saved_bytes: u64,
}

/// Filters the tools array of an inbound request against the current query.
/// Like the output pipe, it degrades to passthrough on any strategy error.
pub struct ToolDiscoveryPipe {
    settings: PipeSettings,
    compresr: Option<Arc<CompresrClient>>,
    search_store: Arc<ToolSearchStore>,
}

impl ToolDiscoveryPipe {
    pub fn new(
        settings: PipeSettings,
        compresr: Option<Arc<CompresrClient>>,
        search_store: Arc<ToolSearchStore>,
    ) -> Self {
        Self {
            settings,
            compresr,
            search_store,
        }
    }

    pub fn search_store(&self) -> Arc<ToolSearchStore> {
        self.search_store.clone()
    }

    pub async fn apply(&self, envelope: &mut Envelope, catalog_key: &str) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::default();
        let catalog = envelope.tool_catalog();
        outcome.original_tools = catalog.len();
        outcome.kept_tools = catalog.len();
        if !self.settings.enabled
            || catalog.is_empty()
            || self.settings.strategy == PipeStrategy::Passthrough
        {
            return outcome;
        }
        let before = tools_size(envelope);

        match self.settings.strategy {
            PipeStrategy::Compresr => {
                let query = envelope.last_user_query().unwrap_or_default();
                let Some(client) = self.compresr.as_ref() else {
                    warn!(event = "pipe.tool_discovery_failed", error = "compresr client not configured");
                    return outcome;
                };
                match client
                    .filter_tools(
                        &query,
                        &self.settings.always_keep,
                        envelope.tools(),
                        self.settings.max_tools,
                    )
                    .await
                {
                    Ok(relevant) => {
                        let mut keep = self.merge_always_keep(relevant);
                        keep.truncate(self.settings.always_keep.len() + self.settings.max_tools);
                        envelope.retain_tools(&keep);
                    }
                    Err(err) => {
                        warn!(event = "pipe.tool_discovery_failed", error = %err);
                        return outcome;
                    }
                }
            }
            PipeStrategy::Relevance => {
                let query = envelope.last_user_query().unwrap_or_default();
                let scored = score_tools(
                    &catalog,
                    &query,
                    self.settings.max_tools,
                    self.settings.min_tools,
                    self.settings.target_ratio,
                );
                let keep = self.merge_always_keep(scored);
                envelope.retain_tools(&keep);
            }
            PipeStrategy::ToolSearch => {
                self.apply_tool_search(envelope, catalog_key);
            }
            PipeStrategy::Passthrough => return outcome,
            // Rejected at config validation; reachable only through direct
            // construction.
            PipeStrategy::ExternalProvider => {
                warn!(
                    event = "pipe.tool_discovery_failed",
                    error = "external_provider is not a tool_discovery strategy",
                );
                return outcome;
            }
        }

        outcome.kept_tools = envelope.tool_catalog().len();
        outcome.saved_bytes = before.saturating_sub(tools_size(envelope)) as u64;
        outcome
    }

    /// Replaces the catalog with the search meta-tool and answers any
    /// pending tool_search calls from the stored original catalog.
    fn apply_tool_search(&self, envelope: &mut Envelope, catalog_key: &str) {
        let original = envelope.tools().to_vec();
        let already_searching = envelope
            .tool_catalog()
            .iter()
            .any(|entry| entry.name == TOOL_SEARCH_NAME);
        if !already_searching {
            self.search_store.remember(catalog_key, original);
            let shape = envelope.shape();
            let meta = tool_value_for_shape(shape, &tool_search_meta_tool());
            let mut tools = if shape == ctxgate_protocol::WireShape::Gemini {
                vec![serde_json::json!({ "functionDeclarations": [meta] })]
            } else {
                vec![meta]
            };
            for name in &self.settings.always_keep {
                if let Some(tool) = envelope
                    .tools()
                    .iter()
                    .find(|tool| {
                        tool.get("name").and_then(serde_json::Value::as_str) == Some(name.as_str())
                    })
                {
                    tools.push(tool.clone());
                }
            }
            envelope.replace_tools(tools);
        }

        let calls = envelope.tool_use_inputs();
        let store = &self.search_store;
        envelope.rewrite_tool_results(|view| {
            if view.tool_name.as_deref() != Some(TOOL_SEARCH_NAME) {
                return None;
            }
            let pattern = view.tool_use_id.as_deref().and_then(|id| {
                calls.iter().find(|(call_id, _, _)| call_id == id).map(|(_, _, input)| {
                    input
                        .get("pattern")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or(".*")
                        .to_string()
                })
            })?;
            Some(store.search_result_text(catalog_key, &pattern))
        });
    }

    fn merge_always_keep(&self, relevant: Vec<String>) -> Vec<String> {
        let mut keep = self.settings.always_keep.clone();
        for name in relevant {
            if !keep.contains(&name) {
                keep.push(name);
            }
        }
        keep
    }
}

fn tools_size(envelope: &Envelope) -> usize {
    serde_json::to_string(envelope.tools()).map(|s| s.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use ctxgate_protocol::WireShape;

    fn envelope_with_tools(count: usize) -> Envelope {
        let tools: Vec<serde_json::Value> = (0..count)
            .map(|index| {
                let (name, description) = match index {
                    0 => ("read_file".to_string(), "Read a file from disk".to_string()),
                    1 => ("write_file".to_string(), "Write a file to disk".to_string()),
                    _ => (
                        format!("tool_{index}"),
                        format!("Utility number {index} for unrelated work"),
                    ),
                };
                json!({ "name": name, "description": description, "input_schema": {} })
            })
            .collect();
        Envelope::from_value(
            WireShape::Claude,
            json!({
                "model": "claude-sonnet-4-5",
                "messages": [{ "role": "user", "content": "read the main.go file" }],
                "tools": tools,
            }),
        )
    }

    fn settings(strategy: PipeStrategy, max_tools: usize) -> PipeSettings {
        PipeSettings {
            enabled: true,
            strategy,
            max_tools,
            min_tools: 1,
            target_ratio: 1.0,
            ..PipeSettings::default()
        }
    }

    #[tokio::test]
    async fn relevance_keeps_matching_tool_within_bound() {
        let pipe = ToolDiscoveryPipe::new(
            settings(PipeStrategy::Relevance, 3),
            None,
            Arc::new(ToolSearchStore::new()),
        );
        let mut envelope = envelope_with_tools(20);
        let outcome = pipe.apply(&mut envelope, "fp").await;
        assert!(outcome.kept_tools <= 3);
        let names: Vec<_> = envelope
            .tool_catalog()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert!(names.contains(&"read_file".to_string()));
        assert!(outcome.saved_bytes > 0);
    }

    #[tokio::test]
    async fn passthrough_leaves_catalog_alone() {
        let pipe = ToolDiscoveryPipe::new(
            settings(PipeStrategy::Passthrough, 3),
            None,
            Arc::new(ToolSearchStore::new()),
        );
        let mut envelope = envelope_with_tools(5);
        let outcome = pipe.apply(&mut envelope, "fp").await;
        assert_eq!(outcome.kept_tools, 5);
        assert!(!envelope.is_dirty());
    }

    #[tokio::test]
    async fn external_provider_strategy_degrades_to_passthrough() {
        let pipe = ToolDiscoveryPipe::new(
            settings(PipeStrategy::ExternalProvider, 3),
            None,
            Arc::new(ToolSearchStore::new()),
        );
        let mut envelope = envelope_with_tools(5);
        let outcome = pipe.apply(&mut envelope, "fp").await;
        assert_eq!(outcome.kept_tools, 5);
        assert!(!envelope.is_dirty());
    }

    #[tokio::test]
    async fn tool_search_replaces_catalog_with_meta_tool() {
        let store = Arc::new(ToolSearchStore::new());
        let pipe = ToolDiscoveryPipe::new(
            settings(PipeStrategy::ToolSearch, 3),
            None,
            store.clone(),
        );
        let mut envelope = envelope_with_tools(10);
        pipe.apply(&mut envelope, "fp").await;
        let names: Vec<_> = envelope
            .tool_catalog()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec![TOOL_SEARCH_NAME.to_string()]);
        assert_eq!(store.catalog("fp").unwrap().len(), 10);
    }

    #[tokio::test]
    async fn tool_search_answers_pending_call() {
        let store = Arc::new(ToolSearchStore::new());
        let pipe = ToolDiscoveryPipe::new(
            settings(PipeStrategy::ToolSearch, 3),
            None,
            store.clone(),
        );
        let mut first = envelope_with_tools(10);
        pipe.apply(&mut first, "fp").await;

        let mut followup = Envelope::from_value(
            WireShape::Claude,
            json!({
                "model": "claude-sonnet-4-5",
                "messages": [
                    { "role": "user", "content": "read the main.go file" },
                    { "role": "assistant", "content": [
                        { "type": "tool_use", "id": "tu_9", "name": TOOL_SEARCH_NAME,
                          "input": { "pattern": "read" } }
                    ]},
                    { "role": "user", "content": [
                        { "type": "tool_result", "tool_use_id": "tu_9", "content": "" }
                    ]}
                ],
                "tools": [tool_search_meta_tool()],
            }),
        );
        pipe.apply(&mut followup, "fp").await;
        let text = ctxgate_protocol::envelope::flatten_message_text(
            WireShape::Claude,
            &followup.messages()[2],
        );
        assert!(text.contains("read_file"));
    }
}

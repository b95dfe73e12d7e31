use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ctxgate_common::CompactionSettings;
use ctxgate_cost::{CostDirection, CostTracker, context_window};
use ctxgate_protocol::Envelope;
use ctxgate_protocol::envelope::flatten_message_text;

use crate::cache::{CompactionCache, SummaryRecord};
use crate::fingerprint::conversation_fingerprint;
use crate::meter::{cutoff_index, estimate_tokens, keep_tokens, usage_pct};
use crate::splice::{SpliceOutcome, splice_summary};
use crate::summarizer::{CapturedAuth, Summarizer, SummaryInput};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOutcome {
    pub spliced: Option<SpliceOutcome>,
    pub scheduled: bool,
    pub usage_pct: u64,
}

/// Watches context usage per conversation, splices installed summaries into
/// outgoing requests, and schedules single-flight background summarization.
pub struct Compactor {
    settings: CompactionSettings,
    cache: Arc<CompactionCache>,
    summarizer: Arc<Summarizer>,
    cost: Option<Arc<CostTracker>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Compactor {
    pub fn new(settings: CompactionSettings, summarizer: Summarizer) -> Self {
        let ttl = Duration::from_secs(settings.summary_ttl_secs);
        Self {
            settings,
            cache: Arc::new(CompactionCache::new(ttl)),
            summarizer: Arc::new(summarizer),
            cost: None,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Summarizer LLM spend lands in the ledger as maintenance traffic.
    pub fn with_cost(mut self, cost: Arc<CostTracker>) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn cache(&self) -> Arc<CompactionCache> {
        self.cache.clone()
    }

    /// Runs before the pipes: splices the current summary (if any) and
    /// schedules a new job when usage crossed the threshold. Indices are
    /// always in the client's original message coordinates; the client
    /// resends the full conversation each turn.
    pub fn process(
        &self,
        envelope: &mut Envelope,
        per_job_auth: Option<CapturedAuth>,
        global_auth: Option<CapturedAuth>,
    ) -> CompactionOutcome {
        let mut outcome = CompactionOutcome::default();
        if !self.settings.enabled {
            return outcome;
        }
        let messages = envelope.messages();
        if messages.len() < 2 {
            return outcome;
        }

        let fingerprint =
            conversation_fingerprint(envelope, self.settings.fingerprint_messages);
        let original_len = messages.len();
        let model = envelope.model().unwrap_or("unknown").to_string();
        let window = context_window(&model);
        let tokens = estimate_tokens(messages, self.settings.estimate_ratio);
        outcome.usage_pct = usage_pct(tokens, window);

        if outcome.usage_pct >= self.settings.trigger_threshold as u64 {
            let keep = keep_tokens(window, self.settings.trigger_threshold);
            let prospective =
                cutoff_index(messages, keep, self.settings.estimate_ratio);
            if let Some(prospective) = prospective
                && !self.cache.covers(&fingerprint, prospective)
                && self.cache.try_begin(&fingerprint)
            {
                let flattened: Vec<(String, String)> = messages
                    .iter()
                    .map(|message| {
                        let role = message
                            .get("role")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("user")
                            .to_string();
                        (role, flatten_message_text(envelope.shape(), message))
                    })
                    .collect();
                self.spawn_job(
                    fingerprint.clone(),
                    flattened,
                    original_len,
                    model.clone(),
                    window,
                    per_job_auth,
                    global_auth,
                );
                outcome.scheduled = true;
            }
        }

        if let Some(record) = self.cache.lookup(&fingerprint, original_len) {
            outcome.spliced = splice_summary(envelope, &record);
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_job(
        &self,
        fingerprint: String,
        messages: Vec<(String, String)>,
        original_len: usize,
        model: String,
        window: u64,
        per_job_auth: Option<CapturedAuth>,
        global_auth: Option<CapturedAuth>,
    ) {
        info!(
            event = "compaction.scheduled",
            fingerprint = %fingerprint,
            messages = original_len,
        );
        let cache = self.cache.clone();
        let summarizer = self.summarizer.clone();
        let cost = self.cost.clone();
        let input = SummaryInput {
            messages,
            keep_recent_tokens: None,
            trigger_threshold: self.settings.trigger_threshold,
            context_window: window,
            estimate_ratio: self.settings.estimate_ratio,
            model: model.clone(),
            per_job_auth,
            global_auth,
        };
        // Decoupled from the triggering request: client disconnects do not
        // cancel the job, only process shutdown does.
        let handle = tokio::spawn(async move {
            match summarizer.summarize(input).await {
                Ok(output) => {
                    info!(
                        event = "compaction.completed",
                        fingerprint = %fingerprint,
                        cutoff = output.last_summarized_index,
                        summary_tokens = output.summary_tokens,
                        elapsed_ms = output.duration.as_millis(),
                    );
                    if let Some(cost) = cost.as_ref()
                        && (output.input_tokens > 0 || output.output_tokens > 0)
                    {
                        cost.record(
                            "summarizer",
                            &model,
                            output.input_tokens,
                            output.output_tokens,
                            0,
                            0,
                            CostDirection::Maintenance,
                            false,
                        );
                    }
                    cache.install(SummaryRecord {
                        fingerprint,
                        summary_text: output.summary_text,
                        summary_tokens: output.summary_tokens,
                        last_summarized_index: output.last_summarized_index,
                        generated_at: time::OffsetDateTime::now_utc(),
                        pre_compaction_len: original_len,
                    });
                }
                Err(err) => {
                    warn!(
                        event = "compaction.failed",
                        fingerprint = %fingerprint,
                        error = %err,
                    );
                    cache.abort(&fingerprint);
                }
            }
        });
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.retain(|job| !job.is_finished());
            jobs.push(handle);
        }
    }

    /// Process shutdown: compaction jobs are the only place we hard-cancel.
    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            for job in jobs.drain(..) {
                job.abort();
            }
            debug!(event = "compaction.shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    use ctxgate_protocol::WireShape;

    use crate::summarizer::{ExternalLlmConfig, SummarizerStrategy};

    fn compactor(threshold: u8) -> Compactor {
        let settings = CompactionSettings {
            enabled: true,
            trigger_threshold: threshold,
            ..CompactionSettings::default()
        };
        // External strategy with no key and no captured auth: jobs fail
        // fast, which is enough to observe scheduling behavior.
        let summarizer = Summarizer::new(SummarizerStrategy::External(
            ExternalLlmConfig::default(),
        ));
        Compactor::new(settings, summarizer)
    }

    fn big_envelope(messages: usize, bytes_each: usize) -> Envelope {
        let messages: Vec<Value> = (0..messages)
            .map(|index| {
                json!({
                    "role": if index % 2 == 0 { "user" } else { "assistant" },
                    "content": "x".repeat(bytes_each),
                })
            })
            .collect();
        Envelope::from_value(
            WireShape::Claude,
            json!({ "model": "claude-sonnet-4-5", "messages": messages }),
        )
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let compactor = compactor(85);
        let mut envelope = big_envelope(4, 1000);
        let outcome = compactor.process(&mut envelope, None, None);
        assert!(!outcome.scheduled);
        assert!(outcome.spliced.is_none());
    }

    #[tokio::test]
    async fn over_threshold_schedules_exactly_one_job() {
        let compactor = compactor(80);
        // ~180k estimated tokens on a 200k window: over 80%.
        let mut first = big_envelope(10, 72_000);
        let outcome = compactor.process(&mut first, None, None);
        assert!(outcome.scheduled);

        // Same conversation again while the job slot is still claimed.
        let mut second = big_envelope(10, 72_000);
        let outcome = compactor.process(&mut second, None, None);
        assert!(!outcome.scheduled);
    }

    #[tokio::test]
    async fn installed_summary_is_spliced_on_next_request() {
        let compactor = compactor(80);
        let mut envelope = big_envelope(10, 72_000);
        let fingerprint = conversation_fingerprint(&envelope, 3);
        compactor.cache().install(SummaryRecord {
            fingerprint,
            summary_text: "prior work summary".to_string(),
            summary_tokens: 50,
            last_summarized_index: 6,
            generated_at: time::OffsetDateTime::now_utc(),
            pre_compaction_len: 10,
        });
        let outcome = compactor.process(&mut envelope, None, None);
        let spliced = outcome.spliced.unwrap();
        assert_eq!(spliced.dropped_messages, 7);
        assert_eq!(envelope.messages().len(), 4);
    }
}

mod cache;
mod compactor;
mod fingerprint;
mod meter;
mod splice;
mod summarizer;

pub use cache::{CompactionCache, SummaryRecord};
pub use compactor::{CompactionOutcome, Compactor};
pub use fingerprint::conversation_fingerprint;
pub use meter::{cutoff_index, estimate_tokens, keep_tokens, usage_pct};
pub use splice::{SpliceOutcome, splice_summary};
pub use summarizer::{
    CapturedAuth, ExternalLlmConfig, SummarizeError, Summarizer, SummarizerStrategy, SummaryInput,
    SummaryOutput,
};

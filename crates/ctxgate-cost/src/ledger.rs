use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostDirection {
    /// A request proxied for the client.
    Inference,
    /// A request the gateway made on its own behalf (summarization).
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
    pub direction: CostDirection,
    /// Set when usage counters were absent and the entry was derived from a
    /// byte-ratio estimate.
    pub estimated: bool,
}

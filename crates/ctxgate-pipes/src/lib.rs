pub mod compresr;
mod expand;
mod relevance;
mod tool_discovery;
mod tool_output;
mod tool_search;

pub use compresr::{CompresrClient, CompresrError, GatewayStatus, HostedModelPrice};
pub use expand::{EXPAND_TOOL_NAME, ExpandContextStore};
pub use relevance::score_tools;
pub use tool_discovery::{DiscoveryOutcome, ToolDiscoveryPipe};
pub use tool_output::{OutputOutcome, TextCompressor, ToolOutputPipe};
pub use tool_search::{TOOL_SEARCH_NAME, ToolSearchStore, tool_search_meta_tool};

/// Pipe errors never surface to the client; the caller logs at warn and
/// keeps the original payload.
#[derive(Debug)]
pub struct PipeError(pub String);

impl std::fmt::Display for PipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PipeError {}

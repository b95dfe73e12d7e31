mod config;
mod error;

pub use config::{
    AuthMode, CompactionSettings, CostCaps, GatewayConfig, GatewayConfigError, GatewayConfigPatch,
    PipeSettings, PipeStrategy, ProviderSettings,
};
pub use error::{GatewayError, PassthroughError};

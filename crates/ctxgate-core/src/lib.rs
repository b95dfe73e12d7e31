pub mod classify;
pub mod compressor;
pub mod handler;
pub mod session;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod upstream;

pub use classify::{ClassifiedRoute, classify_inference};
pub use session::Session;
pub use state::{GatewayState, build_state};
pub use status::StatusReporter;
pub use telemetry::{Event, EventHub, EventSink, JsonlSink};
pub use upstream::UpstreamClient;

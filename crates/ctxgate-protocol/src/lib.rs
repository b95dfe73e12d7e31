pub mod envelope;
pub mod error_body;
pub mod sse;
pub mod usage;

pub use envelope::{Envelope, WireShape};
pub use error_body::{ErrorKind, build_error};
pub use sse::{FrameDecoder, SseEvent, SseParser};
pub use usage::{UsageDelta, UsageMeter};

//! Live push channel: per-user fan-out of queue outcome events.

pub mod registry;
pub mod sse;

pub use registry::{PushEvent, PushRegistry, SinkId};
pub use sse::event_stream;

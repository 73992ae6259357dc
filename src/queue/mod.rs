//! Queue policies shared by the store and the processor.

pub mod backoff;
pub mod retention;

pub use backoff::Backoff;
pub use retention::RetentionSweep;

//! Queue processing: transform seam and the worker loop that drives it.

pub mod transform;
pub mod worker;

pub use transform::{
    HttpTransform, MessageTransform, PassthroughTransform, ProcessedMessage, ProcessingOptions,
};
pub use worker::{BatchReport, ProcessorConfig, QueueProcessor};

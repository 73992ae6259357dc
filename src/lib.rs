//! Inbox relay: ingests provider messages into a durable work queue and pushes outcomes live.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod monitor;
pub mod processor;
pub mod push;
pub mod queue;
pub mod sources;
pub mod store;

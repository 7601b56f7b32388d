//! Staged message pipeline for webmon.
//!
//! A pipeline is an ordered chain of stages, each running as its own tokio
//! task, connected by queues. A stage reads from its source queue until it
//! sees the terminal value, writes results to its sink queue, and exits;
//! the engine then forwards the terminal value downstream so the rest of
//! the chain drains and shuts down in order. Feeding the terminal value
//! into the head queue is the only shutdown trigger.

pub mod engine;
pub mod queue;

pub use engine::{Pipeline, PipelineError, Stage};
pub use queue::{queue, Receiver, Sender, Sentinel};

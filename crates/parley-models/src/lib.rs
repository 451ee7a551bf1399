//! Inference engine lifecycle.
//!
//! Each pipeline stage is backed by an engine implementing one of the traits
//! in [`engine`]. A [`handle::ModelHandle`] owns that engine: it constructs it
//! lazily through an [`engine::EngineFactory`], reports load progress, swaps
//! it when the identity changes, and releases it on dispose. The
//! [`coordinator::PipelineContext`] holds the three handles of one worker.

pub mod coordinator;
pub mod device;
pub mod engine;
pub mod fetch;
pub mod handle;
pub mod loopback;
pub mod progress;

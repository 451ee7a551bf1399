//! The speech-to-speech worker.
//!
//! A worker owns one [`parley_models::coordinator::PipelineContext`] and
//! serves [`parley_core::protocol::HostMessage`]s from a single host,
//! running one inference at a time and streaming
//! [`parley_core::protocol::WorkerMessage`]s back.

pub mod emitter;
pub mod orchestrator;
pub mod prompt;
pub mod worker;

pub use orchestrator::{Orchestrator, PipelineOptions};
pub use worker::{WorkerHandle, spawn_worker};

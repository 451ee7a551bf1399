//! Media pipeline: speech text cleanup, streaming text splitter, WAV encoding, chunk ordering.

pub mod clean;
pub mod sequencer;
pub mod splitter;
pub mod wav;

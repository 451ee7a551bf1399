//! Playback-side ordering check for streamed audio chunks.

use tracing::warn;

use parley_core::error::{ParleyError, Result};
use parley_core::types::AudioChunk;

/// Accepts chunks of one synthesis session and enforces `0, 1, 2, ...` order.
///
/// A gap or repeat is a protocol violation and is reported, never skipped.
#[derive(Debug, Default)]
pub struct ChunkSequencer {
    next: u32,
}

impl ChunkSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next chunk, or fail if it is out of sequence.
    pub fn accept(&mut self, chunk: AudioChunk) -> Result<AudioChunk> {
        if chunk.sequence_index != self.next {
            warn!(
                expected = self.next,
                got = chunk.sequence_index,
                "Audio chunk out of sequence"
            );
            return Err(ParleyError::SequenceGap {
                expected: self.next,
                got: chunk.sequence_index,
            });
        }
        self.next += 1;
        Ok(chunk)
    }

    /// Chunks accepted so far in this session.
    pub fn accepted(&self) -> u32 {
        self.next
    }

    /// Start a new session.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32) -> AudioChunk {
        AudioChunk {
            sequence_index: index,
            waveform: vec![index as u8],
        }
    }

    #[test]
    fn test_in_order_chunks_pass() {
        let mut seq = ChunkSequencer::new();
        for i in 0..3 {
            assert_eq!(seq.accept(chunk(i)).unwrap().sequence_index, i);
        }
        assert_eq!(seq.accepted(), 3);
    }

    #[test]
    fn test_gap_is_reported() {
        let mut seq = ChunkSequencer::new();
        seq.accept(chunk(0)).unwrap();
        let err = seq.accept(chunk(2)).unwrap_err();
        assert!(matches!(err, ParleyError::SequenceGap { expected: 1, got: 2 }));
    }

    #[test]
    fn test_repeat_is_reported() {
        let mut seq = ChunkSequencer::new();
        seq.accept(chunk(0)).unwrap();
        assert!(seq.accept(chunk(0)).is_err());
    }

    #[test]
    fn test_reset_starts_new_session() {
        let mut seq = ChunkSequencer::new();
        seq.accept(chunk(0)).unwrap();
        seq.reset();
        assert!(seq.accept(chunk(0)).is_ok());
    }
}

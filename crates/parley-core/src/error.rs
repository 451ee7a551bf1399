use thiserror::Error;

use crate::types::ModelKind;

#[derive(Debug, Error)]
pub enum ParleyError {
    /// Engine construction failed (bad id, unsupported device, weight fetch).
    #[error("Failed to load {kind} model '{model_id}': {reason}")]
    ModelLoad {
        kind: ModelKind,
        model_id: String,
        reason: String,
    },

    /// No usable engine: load failed upstream or the engine was released mid-flight.
    #[error("{0} model not ready")]
    EngineNotReady(ModelKind),

    /// The engine call itself failed.
    #[error("{0}")]
    InferenceRuntime(String),

    #[error("Invalid payload for {kind}: expected {expected}")]
    InvalidPayload {
        kind: ModelKind,
        expected: &'static str,
    },

    #[error("Audio chunk out of sequence: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },

    #[error("Text stream ended before it was closed")]
    StreamAbandoned,

    #[error("Worker has stopped")]
    WorkerStopped,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Wrap an engine failure, keeping the full context chain as the reason.
    pub fn runtime(err: anyhow::Error) -> Self {
        Self::InferenceRuntime(format!("{err:#}"))
    }

    /// Text carried by the `error` event sent to the host.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_reason_is_bare_message() {
        let err = ParleyError::runtime(anyhow::anyhow!("device lost"));
        assert_eq!(err.reason(), "device lost");
    }

    #[test]
    fn test_runtime_reason_keeps_context() {
        let err = ParleyError::runtime(
            anyhow::anyhow!("out of memory").context("decoder step failed"),
        );
        assert_eq!(err.reason(), "decoder step failed: out of memory");
    }

    #[test]
    fn test_not_ready_names_kind() {
        let err = ParleyError::EngineNotReady(ModelKind::TextToSpeech);
        assert_eq!(err.reason(), "TTS model not ready");
    }
}

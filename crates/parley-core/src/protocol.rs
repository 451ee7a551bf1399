//! Host <-> worker wire protocol.
//!
//! Every message is a JSON object tagged by `type`. Inbound messages may
//! carry a `request_id`; the worker echoes it on every message it produces
//! while handling that request.

use serde::{Deserialize, Serialize};

use crate::types::{
    InferenceData, InferenceEvent, LoadProgress, ModelKind, ModelSettings, Utterance,
};

/// Host -> worker command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Load the model(s) for a kind ahead of the first inference.
    Init {
        model_kind: ModelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Run one inference invocation.
    Inference {
        model_kind: ModelKind,
        payload: InferencePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Release the engine(s) for a kind.
    Dispose {
        model_kind: ModelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Swap the model id and/or settings for a kind. Takes effect on the next load.
    Configure {
        model_kind: ModelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<ModelSettings>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Dispose everything and stop the worker.
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl HostMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            HostMessage::Init { request_id, .. }
            | HostMessage::Inference { request_id, .. }
            | HostMessage::Dispose { request_id, .. }
            | HostMessage::Configure { request_id, .. }
            | HostMessage::Terminate { request_id } => request_id.as_deref(),
        }
    }

    /// Method-style name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::Init { .. } => "init",
            HostMessage::Inference { .. } => "inference",
            HostMessage::Dispose { .. } => "dispose",
            HostMessage::Configure { .. } => "configure",
            HostMessage::Terminate { .. } => "terminate",
        }
    }
}

/// Input of an inference request: text for TG/TTS, audio for STT/STS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferencePayload {
    Text(String),
    Audio(Utterance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Inferencing,
    Streaming,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposeStatus {
    Disposed,
}

/// Worker -> host message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Init {
        model_kind: ModelKind,
        progress: LoadProgress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Inference {
        model_kind: ModelKind,
        status: InferenceStatus,
        data: InferenceData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Dispose {
        model_kind: ModelKind,
        status: DisposeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Configured {
        model_kind: ModelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    Terminated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// A request failed outside an inference invocation (init, unreadable frame).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_kind: Option<ModelKind>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl WorkerMessage {
    /// Build the wire form of an inference lifecycle event.
    pub fn inference(model_kind: ModelKind, event: InferenceEvent, request_id: Option<String>) -> Self {
        let (status, data) = match event {
            InferenceEvent::Inferencing => (InferenceStatus::Inferencing, InferenceData::Empty),
            InferenceEvent::Streaming(data) => (InferenceStatus::Streaming, data),
            InferenceEvent::Ready(data) => (InferenceStatus::Ready, data),
            InferenceEvent::Error(reason) => (InferenceStatus::Error, InferenceData::Text(reason)),
        };
        WorkerMessage::Inference {
            model_kind,
            status,
            data,
            request_id,
        }
    }

    pub fn model_kind(&self) -> Option<ModelKind> {
        match self {
            WorkerMessage::Init { model_kind, .. }
            | WorkerMessage::Inference { model_kind, .. }
            | WorkerMessage::Dispose { model_kind, .. }
            | WorkerMessage::Configured { model_kind, .. } => Some(*model_kind),
            WorkerMessage::Error { model_kind, .. } => *model_kind,
            WorkerMessage::Terminated { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerMessage::Init { request_id, .. }
            | WorkerMessage::Inference { request_id, .. }
            | WorkerMessage::Dispose { request_id, .. }
            | WorkerMessage::Configured { request_id, .. }
            | WorkerMessage::Terminated { request_id }
            | WorkerMessage::Error { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Whether this message ends an inference invocation.
    pub fn is_inference_terminal(&self) -> bool {
        matches!(
            self,
            WorkerMessage::Inference {
                status: InferenceStatus::Ready | InferenceStatus::Error,
                ..
            }
        )
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline stage a handle, request, or event refers to.
///
/// `SpeechToSpeech` is not backed by an engine of its own; it fans out to
/// the three real kinds in [`ModelKind::ENGINES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "STT", alias = "speech_to_text")]
    SpeechToText,
    #[serde(rename = "TG", alias = "text_generation")]
    TextGeneration,
    #[serde(rename = "TTS", alias = "text_to_speech")]
    TextToSpeech,
    #[serde(rename = "STS", alias = "speech_to_speech")]
    SpeechToSpeech,
}

impl ModelKind {
    /// Engine-backed kinds in fan-out order.
    pub const ENGINES: [ModelKind; 3] = [
        ModelKind::SpeechToText,
        ModelKind::TextGeneration,
        ModelKind::TextToSpeech,
    ];

    pub fn is_composite(self) -> bool {
        matches!(self, ModelKind::SpeechToSpeech)
    }

    /// The engine-backed kinds this kind stands for.
    pub fn components(self) -> &'static [ModelKind] {
        match self {
            ModelKind::SpeechToText => &[ModelKind::SpeechToText],
            ModelKind::TextGeneration => &[ModelKind::TextGeneration],
            ModelKind::TextToSpeech => &[ModelKind::TextToSpeech],
            ModelKind::SpeechToSpeech => &Self::ENGINES,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::SpeechToText => "STT",
            ModelKind::TextGeneration => "TG",
            ModelKind::TextToSpeech => "TTS",
            ModelKind::SpeechToSpeech => "STS",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stt" | "speech_to_text" => Ok(ModelKind::SpeechToText),
            "tg" | "text_generation" => Ok(ModelKind::TextGeneration),
            "tts" | "text_to_speech" => Ok(ModelKind::TextToSpeech),
            "sts" | "speech_to_speech" => Ok(ModelKind::SpeechToSpeech),
            other => Err(format!("Unknown model kind: {other}")),
        }
    }
}

/// Numeric precision of the model weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    #[serde(alias = "q4")]
    Int4,
}

/// Compute device an engine runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    #[serde(alias = "webgpu")]
    Gpu,
    /// CPU fallback path.
    #[serde(alias = "wasm")]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Gpu => f.write_str("gpu"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: Device,
}

impl ModelSettings {
    pub fn new(precision: Precision, device: Device) -> Self {
        Self { precision, device }
    }

    pub fn with_device(self, device: Device) -> Self {
        Self { device, ..self }
    }
}

/// Which model a handle should load, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub model_id: String,
    #[serde(default)]
    pub settings: ModelSettings,
}

impl ModelIdentity {
    pub fn new(model_id: impl Into<String>, settings: ModelSettings) -> Self {
        Self {
            model_id: model_id.into(),
            settings,
        }
    }
}

/// One step of a model load cycle.
///
/// A cycle starts with `Initiating`, reports per-file download stages, and
/// ends with `Ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadProgress {
    Initiating,
    Downloading {
        file: String,
        name: String,
    },
    Progressing {
        file: String,
        name: String,
        percent: f32,
    },
    Done {
        file: String,
        name: String,
    },
    Ready {
        model: String,
    },
}

impl LoadProgress {
    pub fn stage(&self) -> &'static str {
        match self {
            LoadProgress::Initiating => "initiating",
            LoadProgress::Downloading { .. } => "downloading",
            LoadProgress::Progressing { .. } => "progressing",
            LoadProgress::Done { .. } => "done",
            LoadProgress::Ready { .. } => "ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LoadProgress::Ready { .. })
    }
}

/// A captured utterance handed to the transcription stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Mono float samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// Raw synthesized waveform, before container encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// One encoded unit of synthesized speech.
///
/// `sequence_index` is contiguous from 0 within one synthesis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    #[serde(alias = "part")]
    pub sequence_index: u32,
    /// WAV container bytes.
    #[serde(with = "base64_bytes")]
    pub waveform: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Payload of a streaming or terminal inference event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferenceData {
    Empty,
    Text(String),
    Audio(AudioChunk),
}

impl InferenceData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InferenceData::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioChunk> {
        match self {
            InferenceData::Audio(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// Lifecycle of one inference invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceEvent {
    Inferencing,
    Streaming(InferenceData),
    Ready(InferenceData),
    Error(String),
}

impl InferenceEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InferenceEvent::Ready(_) | InferenceEvent::Error(_))
    }
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

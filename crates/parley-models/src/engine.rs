//! Engine traits: one per pipeline stage.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use parley_core::types::{ChatMessage, Device, ModelIdentity, RawAudio, Utterance};

use crate::progress::ProgressReporter;

/// Token fragments in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// Behaviour shared by every instantiated engine.
#[async_trait]
pub trait Engine: Send + Sync {
    fn model_id(&self) -> &str;

    /// Device the engine was actually constructed for.
    fn device(&self) -> Device;

    /// Release native resources. Calls made after this should fail.
    async fn dispose(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// Spoken language hint, e.g. "en". `None` lets the engine detect it.
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_new_tokens: u32,
    /// Sample instead of greedy decoding.
    pub sample: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            sample: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub voice: String,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            voice: "af_heart".into(),
        }
    }
}

#[async_trait]
pub trait SpeechToText: Engine {
    /// Run one-shot recognition over a whole utterance.
    async fn transcribe(
        &self,
        utterance: &Utterance,
        options: &TranscribeOptions,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait TextGenerator: Engine {
    /// Stream the reply to a conversation, one decoded fragment at a time.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> anyhow::Result<TokenStream>;
}

#[async_trait]
pub trait TextToSpeech: Engine {
    /// Synthesize one unit of text.
    async fn synthesize(&self, text: &str, options: &SynthesisOptions) -> anyhow::Result<RawAudio>;
}

/// Builds engines of type `E` for a model handle.
///
/// Implementations fetch weights, report file-level progress through the
/// reporter, and fail with a descriptive error when the model id, device,
/// or weights are unusable.
#[async_trait]
pub trait EngineFactory<E: ?Sized>: Send + Sync {
    async fn construct(
        &self,
        identity: &ModelIdentity,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Arc<E>>;
}

//! Loopback engines: deterministic stand-ins for real inference runtimes.
//!
//! The transcriber reports how much audio it heard, the generator streams a
//! reply word by word, and the synthesizer renders a tone whose length tracks
//! the text. Every construction and disposal is recorded in
//! [`LoopbackStats`], and failures can be injected per stage through
//! [`LoopbackBehavior`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use parley_core::config::ParleyConfig;
use parley_core::types::{
    ChatMessage, Device, ModelIdentity, ModelKind, RawAudio, Role, Utterance,
};

use crate::coordinator::EngineSet;
use crate::engine::{
    Engine, EngineFactory, GenerateOptions, SpeechToText, SynthesisOptions, TextGenerator,
    TextToSpeech, TokenStream, TranscribeOptions,
};
use crate::fetch::WeightFetcher;
use crate::progress::ProgressReporter;

pub const LOOPBACK_SAMPLE_RATE: u32 = 24_000;

/// Injected behaviour for one stage.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBehavior {
    /// Fixed transcript instead of the audio-length description.
    pub transcript: Option<String>,
    /// Scripted token fragments instead of echoing the prompt.
    pub tokens: Option<Vec<String>>,
    /// Every inference call fails with this reason.
    pub fail_with: Option<String>,
    /// Construction fails with this reason.
    pub fail_construct: Option<String>,
    /// Pause before each transcription, token, or synthesis.
    pub step_delay: Option<Duration>,
    /// Pause inside construction, after the weight files are in place.
    pub construct_delay: Option<Duration>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackBehaviors {
    pub speech_to_text: LoopbackBehavior,
    pub text_generation: LoopbackBehavior,
    pub text_to_speech: LoopbackBehavior,
}

/// Construction and disposal record shared by all loopback engines of a pipeline.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    constructions: AtomicUsize,
    disposals: AtomicUsize,
    log: Mutex<Vec<String>>,
    devices: Mutex<Vec<(ModelKind, Device)>>,
}

impl LoopbackStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Lifecycle entries in order, e.g. `"construct STT whisper-base"`.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Device each construction actually used.
    pub fn devices(&self) -> Vec<(ModelKind, Device)> {
        self.devices.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn record(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }
}

/// Builds loopback engines for any stage.
#[derive(Clone)]
pub struct LoopbackFactory {
    stats: Arc<LoopbackStats>,
    behavior: LoopbackBehavior,
    weights: Option<(Arc<WeightFetcher>, Vec<String>)>,
}

impl LoopbackFactory {
    pub fn new(stats: Arc<LoopbackStats>, behavior: LoopbackBehavior) -> Self {
        Self {
            stats,
            behavior,
            weights: None,
        }
    }

    /// Fetch these weight files through `fetcher` before each construction.
    pub fn with_weights(mut self, fetcher: Arc<WeightFetcher>, files: Vec<String>) -> Self {
        self.weights = Some((fetcher, files));
        self
    }

    async fn build(
        &self,
        kind: ModelKind,
        identity: &ModelIdentity,
        progress: &ProgressReporter,
    ) -> anyhow::Result<LoopbackEngine> {
        let model_id = identity.model_id.as_str();
        match &self.weights {
            Some((fetcher, files)) => {
                for file in files {
                    fetcher.fetch(model_id, file, progress).await?;
                }
            }
            None => {
                progress.downloading("onnx/model.onnx", model_id);
                progress.progressing("onnx/model.onnx", model_id, 100.0);
                progress.done("onnx/model.onnx", model_id);
            }
        }

        if let Some(delay) = self.behavior.construct_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.behavior.fail_construct {
            anyhow::bail!("{reason}");
        }

        self.stats.constructions.fetch_add(1, Ordering::SeqCst);
        self.stats.record(format!("construct {kind} {model_id}"));
        if let Ok(mut devices) = self.stats.devices.lock() {
            devices.push((kind, identity.settings.device));
        }
        debug!(kind = %kind, model_id, device = %identity.settings.device, "Loopback engine constructed");

        Ok(LoopbackEngine {
            kind,
            model_id: model_id.to_string(),
            device: identity.settings.device,
            behavior: self.behavior.clone(),
            disposed: Arc::new(AtomicBool::new(false)),
            stats: self.stats.clone(),
        })
    }
}

#[async_trait]
impl EngineFactory<dyn SpeechToText> for LoopbackFactory {
    async fn construct(
        &self,
        identity: &ModelIdentity,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Arc<dyn SpeechToText>> {
        let engine = self.build(ModelKind::SpeechToText, identity, progress).await?;
        Ok(Arc::new(engine))
    }
}

#[async_trait]
impl EngineFactory<dyn TextGenerator> for LoopbackFactory {
    async fn construct(
        &self,
        identity: &ModelIdentity,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Arc<dyn TextGenerator>> {
        let engine = self.build(ModelKind::TextGeneration, identity, progress).await?;
        Ok(Arc::new(engine))
    }
}

#[async_trait]
impl EngineFactory<dyn TextToSpeech> for LoopbackFactory {
    async fn construct(
        &self,
        identity: &ModelIdentity,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Arc<dyn TextToSpeech>> {
        let engine = self.build(ModelKind::TextToSpeech, identity, progress).await?;
        Ok(Arc::new(engine))
    }
}

/// Factories for all three stages sharing one stats record.
pub fn loopback_engines(stats: Arc<LoopbackStats>, behaviors: LoopbackBehaviors) -> EngineSet {
    EngineSet {
        speech_to_text: Arc::new(LoopbackFactory::new(stats.clone(), behaviors.speech_to_text)),
        text_generation: Arc::new(LoopbackFactory::new(stats.clone(), behaviors.text_generation)),
        text_to_speech: Arc::new(LoopbackFactory::new(stats, behaviors.text_to_speech)),
    }
}

/// Factories that fetch each stage's configured weight files before
/// constructing. A missing or unreachable file fails the load.
pub fn fetching_loopback_engines(
    config: &ParleyConfig,
    stats: Arc<LoopbackStats>,
    behaviors: LoopbackBehaviors,
) -> EngineSet {
    let fetcher = Arc::new(WeightFetcher::from_config(config));
    let factory = |kind: ModelKind, behavior: LoopbackBehavior| {
        Arc::new(
            LoopbackFactory::new(stats.clone(), behavior)
                .with_weights(fetcher.clone(), config.weight_files(kind)),
        )
    };
    EngineSet {
        speech_to_text: factory(ModelKind::SpeechToText, behaviors.speech_to_text),
        text_generation: factory(ModelKind::TextGeneration, behaviors.text_generation),
        text_to_speech: factory(ModelKind::TextToSpeech, behaviors.text_to_speech),
    }
}

pub struct LoopbackEngine {
    kind: ModelKind,
    model_id: String,
    device: Device,
    behavior: LoopbackBehavior,
    disposed: Arc<AtomicBool>,
    stats: Arc<LoopbackStats>,
}

impl LoopbackEngine {
    async fn step(&self) -> anyhow::Result<()> {
        if let Some(delay) = self.behavior.step_delay {
            tokio::time::sleep(delay).await;
        }
        if self.disposed.load(Ordering::Acquire) {
            anyhow::bail!("{} engine has been disposed", self.kind);
        }
        if let Some(reason) = &self.behavior.fail_with {
            anyhow::bail!("{reason}");
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for LoopbackEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn device(&self) -> Device {
        self.device
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stats.disposals.fetch_add(1, Ordering::SeqCst);
        self.stats
            .record(format!("dispose {} {}", self.kind, self.model_id));
        Ok(())
    }
}

#[async_trait]
impl SpeechToText for LoopbackEngine {
    async fn transcribe(
        &self,
        utterance: &Utterance,
        _options: &TranscribeOptions,
    ) -> anyhow::Result<String> {
        self.step().await?;
        Ok(self.behavior.transcript.clone().unwrap_or_else(|| {
            format!("I heard {} milliseconds of audio.", utterance.duration_ms())
        }))
    }
}

#[async_trait]
impl TextGenerator for LoopbackEngine {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> anyhow::Result<TokenStream> {
        if let Some(reason) = &self.behavior.fail_with {
            anyhow::bail!("{reason}");
        }

        let tokens = match &self.behavior.tokens {
            Some(tokens) => tokens.clone(),
            None => {
                let prompt = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                word_tokens(&format!("You said: {prompt}"))
            }
        };

        let disposed = self.disposed.clone();
        let delay = self.behavior.step_delay;
        let kind = self.kind;
        let stream = futures::stream::iter(tokens)
            .take(options.max_new_tokens as usize)
            .then(move |token| {
                let disposed = disposed.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if disposed.load(Ordering::Acquire) {
                        anyhow::bail!("{kind} engine has been disposed");
                    }
                    Ok::<_, anyhow::Error>(token)
                }
            });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl TextToSpeech for LoopbackEngine {
    async fn synthesize(&self, text: &str, _options: &SynthesisOptions) -> anyhow::Result<RawAudio> {
        self.step().await?;
        if text.trim().is_empty() {
            anyhow::bail!("Nothing to synthesize");
        }
        let sample_rate = self.behavior.sample_rate.unwrap_or(LOOPBACK_SAMPLE_RATE);
        Ok(RawAudio {
            samples: tone(text.chars().count(), sample_rate),
            sample_rate,
        })
    }
}

/// Split text into word fragments the way a tokenizer streamer emits them.
fn word_tokens(text: &str) -> Vec<String> {
    text.split(' ')
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            }
        })
        .collect()
}

/// 10 ms of 220 Hz sine per character.
fn tone(chars: usize, sample_rate: u32) -> Vec<f32> {
    let len = (sample_rate as usize / 100) * chars.clamp(1, 1000);
    (0..len)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            0.2 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
        })
        .collect()
}

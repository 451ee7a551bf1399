//! Per-worker registry of the three model handles.

use std::sync::Arc;

use tracing::info;

use parley_core::config::ParleyConfig;
use parley_core::error::Result;
use parley_core::types::{ModelIdentity, ModelKind, ModelSettings};

use crate::device::DeviceDetector;
use crate::engine::{EngineFactory, SpeechToText, TextGenerator, TextToSpeech};
use crate::handle::{ManagedModel, ModelHandle, ModelStatus};
use crate::progress::ProgressSink;

/// Engine factories for the three stages.
#[derive(Clone)]
pub struct EngineSet {
    pub speech_to_text: Arc<dyn EngineFactory<dyn SpeechToText>>,
    pub text_generation: Arc<dyn EngineFactory<dyn TextGenerator>>,
    pub text_to_speech: Arc<dyn EngineFactory<dyn TextToSpeech>>,
}

/// One handle per engine-backed kind, owned by a single worker.
///
/// `SpeechToSpeech` has no handle of its own: operations on it fan out to
/// STT, TextGen, TTS in that order.
pub struct PipelineContext {
    stt: ModelHandle<dyn SpeechToText>,
    text_gen: ModelHandle<dyn TextGenerator>,
    tts: ModelHandle<dyn TextToSpeech>,
}

impl PipelineContext {
    pub fn new(
        engines: EngineSet,
        identities: [ModelIdentity; 3],
        detector: Arc<dyn DeviceDetector>,
    ) -> Self {
        let [stt, text_gen, tts] = identities;
        Self {
            stt: ModelHandle::new(
                ModelKind::SpeechToText,
                stt,
                engines.speech_to_text,
                detector.clone(),
            ),
            text_gen: ModelHandle::new(
                ModelKind::TextGeneration,
                text_gen,
                engines.text_generation,
                detector.clone(),
            ),
            tts: ModelHandle::new(ModelKind::TextToSpeech, tts, engines.text_to_speech, detector),
        }
    }

    /// Build handles with the identities configured for each stage.
    pub fn from_config(
        config: &ParleyConfig,
        engines: EngineSet,
        detector: Arc<dyn DeviceDetector>,
    ) -> Self {
        let identities = ModelKind::ENGINES.map(|kind| {
            config
                .identity(kind)
                .unwrap_or_else(|| ModelIdentity::new(kind.as_str(), ModelSettings::default()))
        });
        Self::new(engines, identities, detector)
    }

    pub fn stt(&self) -> &ModelHandle<dyn SpeechToText> {
        &self.stt
    }

    pub fn text_gen(&self) -> &ModelHandle<dyn TextGenerator> {
        &self.text_gen
    }

    pub fn tts(&self) -> &ModelHandle<dyn TextToSpeech> {
        &self.tts
    }

    /// Handles backing `kind`, in fan-out order. Never empty.
    pub fn handles(&self, kind: ModelKind) -> Vec<&dyn ManagedModel> {
        kind.components()
            .iter()
            .map(|&component| self.engine_handle(component))
            .collect()
    }

    fn engine_handle(&self, kind: ModelKind) -> &dyn ManagedModel {
        match kind {
            ModelKind::SpeechToText => &self.stt,
            ModelKind::TextGeneration => &self.text_gen,
            _ => &self.tts,
        }
    }

    /// Register `sink` on every handle backing `kind`.
    pub fn set_progress_sink(&self, kind: ModelKind, sink: Option<ProgressSink>) {
        for handle in self.handles(kind) {
            handle.set_progress_sink(sink.clone());
        }
    }

    /// Load every handle backing `kind`, stopping at the first failure.
    pub async fn load(&self, kind: ModelKind) -> Result<()> {
        for handle in self.handles(kind) {
            handle.load().await?;
        }
        Ok(())
    }

    /// Dispose every handle backing `kind`. Best effort; never fails.
    pub async fn dispose_kind(&self, kind: ModelKind) {
        for handle in self.handles(kind) {
            handle.dispose().await;
        }
    }

    /// Full teardown: dispose all handles and drop their progress sinks.
    pub async fn shutdown(&self) {
        self.dispose_kind(ModelKind::SpeechToSpeech).await;
        self.set_progress_sink(ModelKind::SpeechToSpeech, None);
        info!("Pipeline torn down");
    }

    pub fn snapshot(&self) -> Vec<ModelStatus> {
        self.handles(ModelKind::SpeechToSpeech)
            .into_iter()
            .map(|handle| handle.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::device::StaticDetector;
    use crate::loopback::{LoopbackBehaviors, LoopbackStats, loopback_engines};
    use parley_core::types::LoadProgress;

    fn context(stats: &Arc<LoopbackStats>) -> PipelineContext {
        PipelineContext::from_config(
            &ParleyConfig::default(),
            loopback_engines(stats.clone(), LoopbackBehaviors::default()),
            Arc::new(StaticDetector::new(true)),
        )
    }

    #[test]
    fn test_handles_fan_out_in_order() {
        let ctx = context(&LoopbackStats::new());
        let kinds: Vec<ModelKind> = ctx
            .handles(ModelKind::SpeechToSpeech)
            .iter()
            .map(|h| h.kind())
            .collect();
        assert_eq!(kinds, ModelKind::ENGINES.to_vec());
        assert_eq!(ctx.handles(ModelKind::TextGeneration).len(), 1);
    }

    #[test]
    fn test_identities_from_config() {
        let ctx = context(&LoopbackStats::new());
        assert_eq!(
            ctx.tts().identity().model_id,
            parley_core::config::DEFAULT_TTS_MODEL_ID
        );
    }

    #[tokio::test]
    async fn test_composite_dispose_order_and_idempotence() {
        let stats = LoopbackStats::new();
        let ctx = context(&stats);
        ctx.load(ModelKind::SpeechToSpeech).await.unwrap();
        assert_eq!(stats.constructions(), 3);

        ctx.dispose_kind(ModelKind::SpeechToSpeech).await;
        ctx.dispose_kind(ModelKind::SpeechToSpeech).await;
        assert_eq!(stats.disposals(), 3);

        let disposals: Vec<String> = stats
            .log()
            .into_iter()
            .filter(|entry| entry.starts_with("dispose"))
            .collect();
        assert_eq!(
            disposals,
            vec![
                "dispose STT onnx-community/whisper-base",
                "dispose TG onnx-community/LFM2-1.2B-ONNX",
                "dispose TTS onnx-community/Kokoro-82M-v1.0-ONNX",
            ]
        );
    }

    #[tokio::test]
    async fn test_single_kind_dispose_leaves_others() {
        let stats = LoopbackStats::new();
        let ctx = context(&stats);
        ctx.load(ModelKind::SpeechToSpeech).await.unwrap();

        ctx.dispose_kind(ModelKind::TextGeneration).await;
        assert!(ctx.stt().is_loaded());
        assert!(!ctx.text_gen().is_loaded());
        assert!(ctx.tts().is_loaded());
    }

    #[tokio::test]
    async fn test_composite_sink_sees_every_stage() {
        let stats = LoopbackStats::new();
        let ctx = context(&stats);
        let ready = Arc::new(Mutex::new(Vec::new()));
        let ready_clone = ready.clone();
        let sink: ProgressSink = Arc::new(move |kind: ModelKind, progress: &LoadProgress| {
            if progress.is_ready() {
                ready_clone.lock().unwrap().push(kind);
            }
        });
        ctx.set_progress_sink(ModelKind::SpeechToSpeech, Some(sink));

        ctx.load(ModelKind::SpeechToSpeech).await.unwrap();
        assert_eq!(*ready.lock().unwrap(), ModelKind::ENGINES.to_vec());
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let stats = LoopbackStats::new();
        let ctx = context(&stats);
        ctx.load(ModelKind::SpeechToSpeech).await.unwrap();
        ctx.shutdown().await;
        assert!(ctx.snapshot().iter().all(|s| !s.loaded && s.status.is_none()));
    }
}

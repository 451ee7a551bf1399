//! Lazy lifecycle of a single inference engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::types::{Device, LoadProgress, ModelIdentity, ModelKind, ModelSettings};

use crate::device::{DeviceDetector, effective_settings};
use crate::engine::{Engine, EngineFactory};
use crate::progress::{ProgressReporter, ProgressSink, StatusCell};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Borrowed use of a loaded engine.
///
/// The handle may release the engine while a lease is still held (dispose or
/// identity change mid-flight). Every access goes through
/// [`Lease::engine`], which fails with `EngineNotReady` once that happened.
pub struct Lease<E: ?Sized> {
    kind: ModelKind,
    engine: Arc<E>,
    released: Arc<AtomicBool>,
}

impl<E: ?Sized> Lease<E> {
    pub fn engine(&self) -> Result<&E> {
        if self.is_released() {
            return Err(ParleyError::EngineNotReady(self.kind));
        }
        Ok(&self.engine)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }
}

impl<E: ?Sized> Clone for Lease<E> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            engine: self.engine.clone(),
            released: self.released.clone(),
        }
    }
}

struct Loaded<E: ?Sized> {
    engine: Arc<E>,
    released: Arc<AtomicBool>,
    settings: ModelSettings,
    loaded_at: DateTime<Utc>,
}

impl<E: ?Sized> Loaded<E> {
    fn lease(&self, kind: ModelKind) -> Lease<E> {
        Lease {
            kind,
            engine: self.engine.clone(),
            released: self.released.clone(),
        }
    }
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub kind: ModelKind,
    pub model_id: String,
    /// Configured settings; the loaded engine may run on a fallback device.
    pub settings: ModelSettings,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LoadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Owns at most one engine of type `E` for one pipeline stage.
///
/// Loads are serialized by `loading`, which is held across engine
/// construction. `slot` is only ever locked briefly, so dispose and identity
/// changes never wait for a load. Each load belongs to the status cycle it
/// started in; a construction that finishes after its cycle was superseded
/// is disposed instead of stored.
pub struct ModelHandle<E: ?Sized> {
    kind: ModelKind,
    factory: Arc<dyn EngineFactory<E>>,
    detector: Arc<dyn DeviceDetector>,
    identity: StdMutex<ModelIdentity>,
    loading: Mutex<()>,
    slot: StdMutex<Option<Loaded<E>>>,
    status: Arc<StdMutex<StatusCell>>,
    sink: StdMutex<Option<ProgressSink>>,
}

impl<E: ?Sized + Engine + 'static> ModelHandle<E> {
    pub fn new(
        kind: ModelKind,
        identity: ModelIdentity,
        factory: Arc<dyn EngineFactory<E>>,
        detector: Arc<dyn DeviceDetector>,
    ) -> Self {
        Self {
            kind,
            factory,
            detector,
            identity: StdMutex::new(identity),
            loading: Mutex::new(()),
            slot: StdMutex::new(None),
            status: Arc::new(StdMutex::new(StatusCell::default())),
            sink: StdMutex::new(None),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn identity(&self) -> ModelIdentity {
        lock(&self.identity).clone()
    }

    /// Last load progress of the current cycle; `None` when unloaded.
    pub fn status(&self) -> Option<LoadProgress> {
        lock(&self.status).status.clone()
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn set_progress_sink(&self, sink: Option<ProgressSink>) {
        *lock(&self.sink) = sink;
    }

    /// Return the loaded engine, constructing it first if needed.
    ///
    /// The device check runs on every call. If the effective settings no
    /// longer match the loaded engine, it is released and rebuilt. A failed
    /// construction leaves the handle unloaded. If the handle is disposed or
    /// reconfigured while constructing, the new engine is discarded and the
    /// call fails with `EngineNotReady`.
    pub async fn acquire(&self) -> Result<Lease<E>> {
        let _loading = self.loading.lock().await;
        let identity = self.identity();
        let settings = effective_settings(self.kind, identity.settings, &*self.detector);

        let (cycle, stale) = {
            let mut slot = lock(&self.slot);
            if let Some(loaded) = slot.as_ref() {
                if loaded.settings == settings {
                    return Ok(loaded.lease(self.kind));
                }
                info!(
                    kind = %self.kind,
                    from = %loaded.settings.device,
                    to = %settings.device,
                    "Effective device changed, reloading"
                );
            }
            self.detach(&mut slot)
        };
        self.release(stale).await;

        let sink = lock(&self.sink).clone();
        let reporter = ProgressReporter::new(self.kind, cycle, self.status.clone(), sink);
        reporter.initiating();

        info!(
            kind = %self.kind,
            model_id = %identity.model_id,
            device = %settings.device,
            "Loading model"
        );
        let target = ModelIdentity::new(identity.model_id.clone(), settings);
        let engine = match self.factory.construct(&target, &reporter).await {
            Ok(engine) => engine,
            Err(err) => {
                {
                    let mut status = lock(&self.status);
                    if status.cycle == cycle {
                        status.reset();
                    }
                }
                let reason = format!("{err:#}");
                warn!(kind = %self.kind, model_id = %identity.model_id, error = %reason, "Model load failed");
                return Err(ParleyError::ModelLoad {
                    kind: self.kind,
                    model_id: identity.model_id,
                    reason,
                });
            }
        };

        let loaded = Loaded {
            engine,
            released: Arc::new(AtomicBool::new(false)),
            settings,
            loaded_at: Utc::now(),
        };
        let outcome = {
            let mut slot = lock(&self.slot);
            if lock(&self.status).cycle == cycle {
                let lease = loaded.lease(self.kind);
                *slot = Some(loaded);
                Ok(lease)
            } else {
                loaded.released.store(true, Ordering::Release);
                Err(loaded)
            }
        };

        match outcome {
            Ok(lease) => {
                reporter.ready(&identity.model_id);
                info!(kind = %self.kind, model_id = %identity.model_id, "Model ready");
                Ok(lease)
            }
            Err(discarded) => {
                info!(kind = %self.kind, model_id = %identity.model_id, "Released while loading, discarding engine");
                self.release(Some(discarded)).await;
                Err(ParleyError::EngineNotReady(self.kind))
            }
        }
    }

    /// Change model id and/or settings. The loaded engine, if any, is
    /// released now and a load in progress is superseded; the next
    /// `acquire` constructs the new one.
    pub async fn set_identity(&self, model_id: Option<String>, settings: Option<ModelSettings>) {
        {
            let mut identity = lock(&self.identity);
            if let Some(model_id) = model_id {
                identity.model_id = model_id;
            }
            if let Some(settings) = settings {
                identity.settings = settings;
            }
            info!(
                kind = %self.kind,
                model_id = %identity.model_id,
                device = %identity.settings.device,
                "Model identity updated"
            );
        }

        let (_, stale) = self.detach(&mut lock(&self.slot));
        self.release(stale).await;
    }

    /// Release the engine and clear status. Never waits for a load in
    /// progress; that load is superseded instead. No-op when unloaded.
    pub async fn dispose(&self) {
        let (_, stale) = self.detach(&mut lock(&self.slot));
        self.release(stale).await;
    }

    pub fn snapshot(&self) -> ModelStatus {
        let identity = self.identity();
        let loaded = lock(&self.slot)
            .as_ref()
            .map(|loaded| (loaded.settings.device, loaded.loaded_at));
        ModelStatus {
            kind: self.kind,
            model_id: identity.model_id,
            settings: identity.settings,
            loaded: loaded.is_some(),
            device: loaded.map(|(device, _)| device),
            status: self.status(),
            loaded_at: loaded.map(|(_, at)| at),
        }
    }

    /// Start a new status cycle and take the engine out of the slot,
    /// marking outstanding leases released.
    fn detach(&self, slot: &mut Option<Loaded<E>>) -> (u64, Option<Loaded<E>>) {
        let cycle = lock(&self.status).reset();
        let taken = slot.take();
        if let Some(loaded) = &taken {
            loaded.released.store(true, Ordering::Release);
        }
        (cycle, taken)
    }

    async fn release(&self, loaded: Option<Loaded<E>>) {
        let Some(loaded) = loaded else {
            return;
        };
        let model_id = loaded.engine.model_id().to_string();
        info!(kind = %self.kind, model_id = %model_id, "Disposing model");
        if let Err(err) = loaded.engine.dispose().await {
            warn!(kind = %self.kind, model_id = %model_id, error = %format!("{err:#}"), "Engine dispose failed, ignoring");
        }
    }
}

/// Kind-erased view of a handle, for fan-out over pipeline stages.
#[async_trait]
pub trait ManagedModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn identity(&self) -> ModelIdentity;

    fn status(&self) -> Option<LoadProgress>;

    fn set_progress_sink(&self, sink: Option<ProgressSink>);

    fn snapshot(&self) -> ModelStatus;

    /// Construct the engine if it is not loaded yet.
    async fn load(&self) -> Result<()>;

    async fn set_identity(&self, model_id: Option<String>, settings: Option<ModelSettings>);

    async fn dispose(&self);
}

#[async_trait]
impl<E: ?Sized + Engine + 'static> ManagedModel for ModelHandle<E> {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn identity(&self) -> ModelIdentity {
        ModelHandle::identity(self)
    }

    fn status(&self) -> Option<LoadProgress> {
        ModelHandle::status(self)
    }

    fn set_progress_sink(&self, sink: Option<ProgressSink>) {
        ModelHandle::set_progress_sink(self, sink)
    }

    fn snapshot(&self) -> ModelStatus {
        ModelHandle::snapshot(self)
    }

    async fn load(&self) -> Result<()> {
        self.acquire().await.map(|_| ())
    }

    async fn set_identity(&self, model_id: Option<String>, settings: Option<ModelSettings>) {
        ModelHandle::set_identity(self, model_id, settings).await
    }

    async fn dispose(&self) {
        ModelHandle::dispose(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::device::StaticDetector;
    use crate::engine::{SpeechToText, SynthesisOptions, TextToSpeech, TranscribeOptions};
    use crate::fetch::WeightFetcher;
    use crate::loopback::{LoopbackBehavior, LoopbackFactory, LoopbackStats};
    use parley_core::types::{Precision, Utterance};

    fn stt_handle(
        stats: &Arc<LoopbackStats>,
        behavior: LoopbackBehavior,
        gpu: bool,
    ) -> ModelHandle<dyn SpeechToText> {
        ModelHandle::new(
            ModelKind::SpeechToText,
            ModelIdentity::new("whisper-base", ModelSettings::new(Precision::Fp32, Device::Gpu)),
            Arc::new(LoopbackFactory::new(stats.clone(), behavior)),
            Arc::new(StaticDetector::new(gpu)),
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_engine() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), true);

        let first = handle.acquire().await.unwrap();
        let second = handle.acquire().await.unwrap();
        assert_eq!(stats.constructions(), 1);
        assert!(Arc::ptr_eq(&first.engine, &second.engine));
        assert!(handle.is_loaded());
        assert!(handle.status().unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_set_identity_disposes_before_reconstructing() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), true);

        let old = handle.acquire().await.unwrap();
        handle
            .set_identity(Some("moonshine-base".into()), None)
            .await;
        assert!(!handle.is_loaded());
        assert!(handle.status().is_none());
        assert!(old.is_released());

        let new = handle.acquire().await.unwrap();
        assert_eq!(new.engine().unwrap().model_id(), "moonshine-base");
        assert_eq!(stats.constructions(), 2);
        assert_eq!(
            stats.log(),
            vec![
                "construct STT whisper-base",
                "dispose STT whisper-base",
                "construct STT moonshine-base",
            ]
        );
    }

    #[tokio::test]
    async fn test_gpu_falls_back_to_cpu_without_adapter() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), false);

        let lease = handle.acquire().await.unwrap();
        assert_eq!(lease.engine().unwrap().device(), Device::Cpu);
        assert_eq!(stats.devices(), vec![(ModelKind::SpeechToText, Device::Cpu)]);

        // Fallback is not written back into the identity
        assert_eq!(handle.identity().settings.device, Device::Gpu);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.settings.device, Device::Gpu);
        assert_eq!(snapshot.device, Some(Device::Cpu));
    }

    #[tokio::test]
    async fn test_load_failure_leaves_handle_unloaded() {
        let stats = LoopbackStats::new();
        let behavior = LoopbackBehavior {
            fail_construct: Some("no such model".into()),
            ..Default::default()
        };
        let handle = stt_handle(&stats, behavior, true);

        let err = handle.acquire().await.err().unwrap();
        match err {
            ParleyError::ModelLoad {
                kind,
                model_id,
                reason,
            } => {
                assert_eq!(kind, ModelKind::SpeechToText);
                assert_eq!(model_id, "whisper-base");
                assert_eq!(reason, "no such model");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!handle.is_loaded());
        assert!(handle.status().is_none());
        assert_eq!(stats.constructions(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let stats = LoopbackStats::new();
        let fetcher = Arc::new(WeightFetcher::new(
            dir.path().to_string_lossy().to_string(),
            PathBuf::from(dir.path()).join("cache"),
            false,
        ));
        let factory = LoopbackFactory::new(stats.clone(), LoopbackBehavior::default())
            .with_weights(fetcher, vec!["onnx/model.onnx".into()]);
        let handle: ModelHandle<dyn TextToSpeech> = ModelHandle::new(
            ModelKind::TextToSpeech,
            ModelIdentity::new("kokoro", ModelSettings::default()),
            Arc::new(factory),
            Arc::new(StaticDetector::new(true)),
        );

        let err = handle.acquire().await.err().unwrap();
        assert!(matches!(err, ParleyError::ModelLoad { .. }));
        assert!(err.reason().contains("Weight file not found"));

        std::fs::create_dir_all(dir.path().join("kokoro/onnx")).unwrap();
        std::fs::write(dir.path().join("kokoro/onnx/model.onnx"), [0u8; 8]).unwrap();
        let lease = handle.acquire().await.unwrap();
        assert!(
            lease
                .engine()
                .unwrap()
                .synthesize("Hi.", &SynthesisOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), true);

        handle.dispose().await;
        assert_eq!(stats.disposals(), 0);

        handle.acquire().await.unwrap();
        handle.dispose().await;
        handle.dispose().await;
        assert_eq!(stats.disposals(), 1);
        assert!(handle.status().is_none());
    }

    #[tokio::test]
    async fn test_dispose_does_not_wait_for_hung_load() {
        let stats = LoopbackStats::new();
        let behavior = LoopbackBehavior {
            construct_delay: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let handle = Arc::new(stt_handle(&stats, behavior, true));

        let loading = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire().await.map(|_| ()) }
        });
        while handle.status().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(1), handle.dispose())
            .await
            .expect("dispose blocked behind the load");
        tokio::time::timeout(
            Duration::from_secs(1),
            handle.set_identity(None, Some(ModelSettings::default())),
        )
        .await
        .expect("set_identity blocked behind the load");

        loading.abort();
        assert!(!handle.is_loaded());
        assert_eq!(stats.constructions(), 0);
    }

    #[tokio::test]
    async fn test_load_finished_after_dispose_is_discarded() {
        let stats = LoopbackStats::new();
        let behavior = LoopbackBehavior {
            construct_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let handle = Arc::new(stt_handle(&stats, behavior, true));

        let loading = tokio::spawn({
            let handle = handle.clone();
            async move { handle.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.dispose().await;

        let err = loading.await.unwrap().unwrap_err();
        assert!(matches!(err, ParleyError::EngineNotReady(ModelKind::SpeechToText)));
        assert!(!handle.is_loaded());
        assert!(handle.status().is_none());
        assert_eq!(stats.constructions(), 1);
        assert_eq!(stats.disposals(), 1);

        handle.acquire().await.unwrap();
        assert_eq!(stats.constructions(), 2);
        assert!(handle.status().unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_lease_fails_after_dispose() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), true);

        let lease = handle.acquire().await.unwrap();
        let utterance = Utterance::new(vec![0.0; 1600], 16000);
        assert!(
            lease
                .engine()
                .unwrap()
                .transcribe(&utterance, &TranscribeOptions::default())
                .await
                .is_ok()
        );

        handle.dispose().await;
        assert!(matches!(
            lease.engine().err().unwrap(),
            ParleyError::EngineNotReady(ModelKind::SpeechToText)
        ));
    }

    #[tokio::test]
    async fn test_progress_sink_sees_full_cycle() {
        let stats = LoopbackStats::new();
        let handle = stt_handle(&stats, LoopbackBehavior::default(), true);
        let stages = Arc::new(StdMutex::new(Vec::new()));
        let stages_clone = stages.clone();
        let sink: ProgressSink = Arc::new(move |kind: ModelKind, progress: &LoadProgress| {
            assert_eq!(kind, ModelKind::SpeechToText);
            stages_clone.lock().unwrap().push(progress.stage());
        });
        handle.set_progress_sink(Some(sink));

        handle.acquire().await.unwrap();
        handle.acquire().await.unwrap();

        assert_eq!(
            *stages.lock().unwrap(),
            vec!["initiating", "downloading", "progressing", "done", "ready"]
        );
    }
}

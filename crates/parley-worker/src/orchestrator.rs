//! Inference orchestrator: runs each operation against the pipeline handles
//! and reports its lifecycle to the host.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use parley_core::config::ParleyConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::protocol::{DisposeStatus, InferencePayload, WorkerMessage};
use parley_core::types::{
    AudioChunk, InferenceData, LoadProgress, ModelKind, ModelSettings, Utterance,
};
use parley_media::splitter::{SentenceStream, TextSplitter};
use parley_media::wav::encode_wav;
use parley_models::coordinator::PipelineContext;
use parley_models::engine::{GenerateOptions, SynthesisOptions, TranscribeOptions};
use parley_models::progress::ProgressSink;

use crate::emitter::{InvocationEmitter, Outbox};
use crate::prompt::build_conversation;

/// Per-worker inference settings.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub system_prompt: String,
    pub generate: GenerateOptions,
    pub transcribe: TranscribeOptions,
    /// Language hint for the transcription stage of speech-to-speech.
    pub sts_language: String,
    pub synthesis: SynthesisOptions,
    pub max_unit_chars: usize,
}

impl PipelineOptions {
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            system_prompt: config.system_prompt(),
            generate: GenerateOptions {
                max_new_tokens: config.max_new_tokens(),
                sample: config.sample(),
            },
            transcribe: TranscribeOptions {
                language: Some(config.language()),
            },
            sts_language: "en".into(),
            synthesis: SynthesisOptions {
                voice: config.voice(),
            },
            max_unit_chars: config.max_unit_chars(),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&ParleyConfig::default())
    }
}

/// Text to synthesize: complete, or still being produced.
pub enum SynthesisInput {
    Text(String),
    Stream(SentenceStream),
}

/// Progress sink forwarding load events to the host as `Init` messages.
pub fn progress_sink(outbox: Outbox, request_id: Option<String>) -> ProgressSink {
    Arc::new(move |kind: ModelKind, progress: &LoadProgress| {
        let _ = outbox.send(WorkerMessage::Init {
            model_kind: kind,
            progress: progress.clone(),
            request_id: request_id.clone(),
        });
    })
}

/// Runs operations for one worker. Cheap to clone; clones share the
/// pipeline context and the outbox.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
    options: Arc<PipelineOptions>,
    outbox: Outbox,
}

impl Orchestrator {
    pub fn new(ctx: Arc<PipelineContext>, options: Arc<PipelineOptions>, outbox: Outbox) -> Self {
        Self {
            ctx,
            options,
            outbox,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Route load progress of `kind` to the host, tagged with `request_id`.
    pub fn attach_progress(&self, kind: ModelKind, request_id: Option<String>) {
        self.ctx
            .set_progress_sink(kind, Some(progress_sink(self.outbox.clone(), request_id)));
    }

    /// Dispatch an inference request by kind and payload shape.
    pub async fn infer(
        &self,
        kind: ModelKind,
        payload: InferencePayload,
        request_id: Option<String>,
    ) -> Result<()> {
        match (kind, payload) {
            (ModelKind::SpeechToText, InferencePayload::Audio(utterance)) => self
                .transcribe(&utterance, &self.options.transcribe, request_id)
                .await
                .map(drop),
            (ModelKind::TextGeneration, InferencePayload::Text(prompt)) => {
                self.generate(&prompt, None, request_id).await.map(drop)
            }
            (ModelKind::TextToSpeech, InferencePayload::Text(text)) => self
                .synthesize(SynthesisInput::Text(text), request_id)
                .await
                .map(drop),
            (ModelKind::SpeechToSpeech, InferencePayload::Audio(utterance)) => {
                self.speech_to_speech(&utterance, request_id).await
            }
            (kind, _) => {
                let emitter = self.emitter(kind, request_id);
                emitter.inferencing();
                let expected = match kind {
                    ModelKind::SpeechToText | ModelKind::SpeechToSpeech => "audio",
                    ModelKind::TextGeneration | ModelKind::TextToSpeech => "text",
                };
                let err = ParleyError::InvalidPayload { kind, expected };
                warn!(kind = %kind, "Rejected inference payload");
                emitter.error(err.reason());
                Err(err)
            }
        }
    }

    /// One-shot recognition. No streaming events.
    pub async fn transcribe(
        &self,
        utterance: &Utterance,
        options: &TranscribeOptions,
        request_id: Option<String>,
    ) -> Result<String> {
        let emitter = self.emitter(ModelKind::SpeechToText, request_id);
        emitter.inferencing();
        let result = self.run_transcribe(utterance, options).await;
        finish(emitter, result, |text| InferenceData::Text(text.clone()))
    }

    /// Stream a reply to `prompt`, feeding every fragment to `splitter` if
    /// given. The splitter is closed on success and abandoned on failure.
    pub async fn generate(
        &self,
        prompt: &str,
        splitter: Option<TextSplitter>,
        request_id: Option<String>,
    ) -> Result<String> {
        let emitter = self.emitter(ModelKind::TextGeneration, request_id);
        emitter.inferencing();
        let result = self.run_generate(prompt, splitter, &emitter).await;
        finish(emitter, result, |text| InferenceData::Text(text.clone()))
    }

    /// Synthesize every unit of `input`, one audio chunk per unit. Returns
    /// the number of chunks sent.
    pub async fn synthesize(&self, input: SynthesisInput, request_id: Option<String>) -> Result<u32> {
        let emitter = self.emitter(ModelKind::TextToSpeech, request_id);
        emitter.inferencing();
        let result = self.run_synthesize(input, &emitter).await;
        finish(emitter, result, |_| InferenceData::Text("TTS completed".into()))
    }

    /// Transcribe, then generate and synthesize concurrently through a
    /// splitter. The first failing stage ends the whole operation.
    pub async fn speech_to_speech(
        &self,
        utterance: &Utterance,
        request_id: Option<String>,
    ) -> Result<()> {
        let emitter = self.emitter(ModelKind::SpeechToSpeech, request_id.clone());
        emitter.inferencing();
        let result = self.run_speech_to_speech(utterance, request_id).await;
        finish(emitter, result, |_| InferenceData::Text("STS completed".into()))
    }

    /// Load every handle backing `kind`, streaming progress as `Init`
    /// messages tagged with `request_id`.
    ///
    /// A handle that was already loaded reports a single `Ready`. For the
    /// composite kind a final `Ready` under its own kind follows.
    pub async fn init(&self, kind: ModelKind, request_id: Option<String>) -> Result<()> {
        self.attach_progress(kind, request_id.clone());
        let result = self.load_all(kind, &request_id).await;
        self.attach_progress(kind, None);

        if let Err(err) = &result {
            self.send(WorkerMessage::Error {
                model_kind: Some(kind),
                reason: err.reason(),
                request_id,
            });
        }
        result
    }

    /// Change the identity of the handles backing `kind`. A model id is
    /// ignored for the composite kind; settings apply to all three.
    pub async fn configure(
        &self,
        kind: ModelKind,
        model_id: Option<String>,
        settings: Option<ModelSettings>,
        request_id: Option<String>,
    ) {
        let model_id = match model_id {
            Some(model_id) if kind.is_composite() => {
                warn!(model_id = %model_id, "Model id cannot apply to STS, ignoring it");
                None
            }
            other => other,
        };
        for handle in self.ctx.handles(kind) {
            handle.set_identity(model_id.clone(), settings).await;
        }
        self.send(WorkerMessage::Configured {
            model_kind: kind,
            request_id,
        });
    }

    /// Release the engines backing `kind`. Always acknowledged.
    pub async fn dispose(&self, kind: ModelKind, request_id: Option<String>) {
        self.ctx.dispose_kind(kind).await;
        self.send(WorkerMessage::Dispose {
            model_kind: kind,
            status: DisposeStatus::Disposed,
            request_id,
        });
    }

    async fn run_transcribe(
        &self,
        utterance: &Utterance,
        options: &TranscribeOptions,
    ) -> Result<String> {
        let lease = self.ctx.stt().acquire().await?;
        let text = lease
            .engine()?
            .transcribe(utterance, options)
            .await
            .map_err(ParleyError::runtime)?;
        debug!(chars = text.len(), duration_ms = utterance.duration_ms(), "Transcribed utterance");
        Ok(text)
    }

    async fn run_generate(
        &self,
        prompt: &str,
        mut splitter: Option<TextSplitter>,
        emitter: &InvocationEmitter,
    ) -> Result<String> {
        let lease = self.ctx.text_gen().acquire().await?;
        let messages = build_conversation(Some(&self.options.system_prompt), prompt);
        let mut tokens = lease
            .engine()?
            .generate(&messages, &self.options.generate)
            .await
            .map_err(ParleyError::runtime)?;

        let mut text = String::new();
        while let Some(token) = tokens.next().await {
            let token = token.map_err(ParleyError::runtime)?;
            lease.engine()?;
            text.push_str(&token);
            if let Some(splitter) = splitter.as_mut() {
                splitter.push(&token);
            }
            emitter.streaming(InferenceData::Text(token));
        }

        if let Some(splitter) = splitter {
            splitter.close();
        }
        Ok(text)
    }

    async fn run_synthesize(&self, input: SynthesisInput, emitter: &InvocationEmitter) -> Result<u32> {
        let lease = self.ctx.tts().acquire().await?;
        let mut units = match input {
            SynthesisInput::Text(text) => SentenceStream::from_text(&text, self.options.max_unit_chars),
            SynthesisInput::Stream(stream) => stream,
        };

        let mut sequence_index = 0u32;
        while let Some(unit) = units.next_unit().await {
            let unit = unit?;
            let audio = lease
                .engine()?
                .synthesize(&unit, &self.options.synthesis)
                .await
                .map_err(ParleyError::runtime)?;
            let waveform = encode_wav(&audio).map_err(|e| ParleyError::runtime(e.into()))?;
            debug!(sequence_index, bytes = waveform.len(), "Synthesized chunk");
            emitter.streaming(InferenceData::Audio(AudioChunk {
                sequence_index,
                waveform,
            }));
            sequence_index += 1;
        }
        Ok(sequence_index)
    }

    async fn run_speech_to_speech(
        &self,
        utterance: &Utterance,
        request_id: Option<String>,
    ) -> Result<()> {
        let options = TranscribeOptions {
            language: Some(self.options.sts_language.clone()),
        };
        let prompt = self.transcribe(utterance, &options, request_id.clone()).await?;

        let (splitter, units) = TextSplitter::new(self.options.max_unit_chars);
        let (reply, chunks) = futures::try_join!(
            self.generate(&prompt, Some(splitter), request_id.clone()),
            self.synthesize(SynthesisInput::Stream(units), request_id),
        )?;
        info!(prompt_chars = prompt.len(), reply_chars = reply.len(), chunks, "Speech-to-speech turn complete");
        Ok(())
    }

    async fn load_all(&self, kind: ModelKind, request_id: &Option<String>) -> Result<()> {
        for handle in self.ctx.handles(kind) {
            let before = handle.snapshot().loaded_at;
            handle.load().await?;
            let after = handle.snapshot().loaded_at;

            // Reused engine: the sink saw nothing, so report Ready explicitly
            if before.is_some() && before == after {
                self.send(WorkerMessage::Init {
                    model_kind: handle.kind(),
                    progress: LoadProgress::Ready {
                        model: handle.identity().model_id,
                    },
                    request_id: request_id.clone(),
                });
            }
        }

        if kind.is_composite() {
            self.send(WorkerMessage::Init {
                model_kind: kind,
                progress: LoadProgress::Ready {
                    model: kind.as_str().to_string(),
                },
                request_id: request_id.clone(),
            });
        }
        Ok(())
    }

    fn emitter(&self, kind: ModelKind, request_id: Option<String>) -> InvocationEmitter {
        InvocationEmitter::new(kind, request_id, self.outbox.clone())
    }

    fn send(&self, message: WorkerMessage) {
        if self.outbox.send(message).is_err() {
            debug!("Host gone, dropping worker message");
        }
    }
}

fn finish<T>(
    emitter: InvocationEmitter,
    result: Result<T>,
    ready: impl FnOnce(&T) -> InferenceData,
) -> Result<T> {
    match &result {
        Ok(value) => emitter.ready(ready(value)),
        Err(err) => {
            warn!(kind = %emitter.kind(), error = %err, "Inference failed");
            emitter.error(err.reason());
        }
    }
    result
}

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use parley_core::config::ParleyConfig;
use parley_core::protocol::{HostMessage, InferencePayload, InferenceStatus, WorkerMessage};
use parley_core::types::{AudioChunk, InferenceData, LoadProgress, ModelKind, Utterance};
use parley_gateway::GatewayState;
use parley_media::sequencer::ChunkSequencer;
use parley_media::wav::pcm16_to_float;
use parley_models::coordinator::{EngineSet, PipelineContext};
use parley_models::device::{DeviceDetector, SystemDetector};
use parley_models::fetch::WeightFetcher;
use parley_models::loopback::{
    LoopbackBehavior, LoopbackBehaviors, LoopbackStats, fetching_loopback_engines,
};
use parley_models::progress::{ProgressReporter, ProgressSink};
use parley_worker::{PipelineOptions, WorkerHandle, spawn_worker};

mod logging;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Local speech-to-speech: transcribe, reply, and speak in one process",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket gateway
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Synthesize text to WAV chunks
    Say {
        text: String,

        /// Directory for the chunk files
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Stream a text reply to a prompt
    Ask { prompt: String },

    /// One speech-to-speech turn from a WAV recording
    Talk {
        /// Input WAV file
        input: PathBuf,

        /// Directory for the reply chunk files
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Load models ahead of use and report progress
    Load {
        /// Model kind: STT, TG, TTS, or STS for all three
        #[arg(long, default_value = "STS")]
        kind: ModelKind,
    },

    /// Download weight files into the cache
    Fetch {
        model_id: String,

        /// Files relative to the model directory, e.g. onnx/model.onnx
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(ParleyConfig::default_path);

    let mut config = ParleyConfig::load(&config_path)?;

    logging::init(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            if port.is_some() || bind.is_some() {
                let gateway = config.gateway.get_or_insert_with(Default::default);
                if let Some(port) = port {
                    gateway.port = port;
                }
                if bind.is_some() {
                    gateway.bind = bind;
                }
            }
            tracing::info!("Starting Parley gateway on port {}", config.gateway_port());
            let state = Arc::new(GatewayState::new(
                Arc::new(config.clone()),
                engines(&config),
                Arc::new(SystemDetector),
            ));
            parley_gateway::start_gateway(state).await?;
        }
        Commands::Say { text, out } => {
            run_turn(
                &config,
                ModelKind::TextToSpeech,
                InferencePayload::Text(text),
                Some(&out),
            )
            .await?;
        }
        Commands::Ask { prompt } => {
            run_turn(
                &config,
                ModelKind::TextGeneration,
                InferencePayload::Text(prompt),
                None,
            )
            .await?;
        }
        Commands::Talk { input, out } => {
            let utterance = read_utterance(&input)?;
            tracing::info!(
                duration_ms = utterance.duration_ms(),
                sample_rate = utterance.sample_rate,
                "Loaded recording"
            );
            run_turn(
                &config,
                ModelKind::SpeechToSpeech,
                InferencePayload::Audio(utterance),
                Some(&out),
            )
            .await?;
        }
        Commands::Load { kind } => {
            let mut worker = local_worker(&config);
            worker.send(HostMessage::Init {
                model_kind: kind,
                request_id: None,
            })?;
            let messages = worker
                .recv_until(|msg| match msg {
                    WorkerMessage::Init {
                        model_kind,
                        progress,
                        ..
                    } => {
                        print_progress(*model_kind, progress);
                        *model_kind == kind && progress.is_ready()
                    }
                    WorkerMessage::Error { .. } => true,
                    _ => false,
                })
                .await;
            worker.join().await;
            if let Some(WorkerMessage::Error { reason, .. }) = messages.last() {
                anyhow::bail!("{reason}");
            }
            println!("{kind} ready");
        }
        Commands::Fetch { model_id, files } => {
            let fetcher = WeightFetcher::from_config(&config);
            let sink: ProgressSink = Arc::new(|kind: ModelKind, progress: &LoadProgress| {
                print_progress(kind, progress);
            });
            let reporter = ProgressReporter::forwarding(ModelKind::SpeechToSpeech, sink);
            for file in &files {
                let path = fetcher.fetch(&model_id, file, &reporter).await?;
                println!("{}", path.display());
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Set { key, value } => {
                let value = serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value));
                config.set_path(&key, value)?;
                config.save(&config_path)?;
                println!("Set {key} in {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            for kind in ModelKind::ENGINES {
                if let Some(identity) = config.identity(kind) {
                    println!(
                        "{kind}: {} ({:?}, {})",
                        identity.model_id, identity.settings.precision, identity.settings.device
                    );
                }
            }
            println!(
                "GPU adapter: {}",
                if SystemDetector.gpu_available() {
                    "available"
                } else {
                    "not found, using CPU"
                }
            );
            println!("Weights: {}", config.weights_base_url());
            println!("Cache: {}", config.cache_dir().display());

            let addr = format!("{}:{}", config.gateway_bind(), config.gateway_port());
            match gateway_health(&addr).await {
                Some(health) => println!(
                    "Gateway: running on {addr} ({} connection(s))",
                    health["connections"]
                ),
                None => println!("Gateway: not running"),
            }
        }
    }

    Ok(())
}

/// Loopback engines built from the configured weight files; the
/// synthesizer renders at the configured rate.
fn engines(config: &ParleyConfig) -> EngineSet {
    let behaviors = LoopbackBehaviors {
        text_to_speech: LoopbackBehavior {
            sample_rate: Some(config.synthesis_sample_rate()),
            ..Default::default()
        },
        ..Default::default()
    };
    fetching_loopback_engines(config, LoopbackStats::new(), behaviors)
}

fn local_worker(config: &ParleyConfig) -> WorkerHandle {
    let ctx = PipelineContext::from_config(config, engines(config), Arc::new(SystemDetector));
    spawn_worker(Arc::new(ctx), PipelineOptions::from_config(config))
}

/// Run one inference on a local worker, printing text and writing audio
/// chunks to `out`.
async fn run_turn(
    config: &ParleyConfig,
    kind: ModelKind,
    payload: InferencePayload,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let mut worker = local_worker(config);
    worker.send(HostMessage::Inference {
        model_kind: kind,
        payload,
        request_id: None,
    })?;

    let mut sequencer = ChunkSequencer::new();
    let mut failure = None;
    while let Some(message) = worker.recv().await {
        let done = message.is_inference_terminal() && message.model_kind() == Some(kind);
        match message {
            WorkerMessage::Init {
                model_kind,
                progress,
                ..
            } => print_progress(model_kind, &progress),
            WorkerMessage::Inference {
                model_kind,
                status,
                data,
                ..
            } => match (status, data) {
                (InferenceStatus::Streaming, InferenceData::Text(token)) => {
                    print!("{token}");
                    std::io::stdout().flush()?;
                }
                (InferenceStatus::Streaming, InferenceData::Audio(chunk)) => {
                    let chunk = sequencer.accept(chunk)?;
                    if let Some(dir) = out {
                        save_chunk(dir, &chunk)?;
                    }
                }
                (InferenceStatus::Ready, InferenceData::Text(text)) => match model_kind {
                    ModelKind::SpeechToText => println!("> {text}"),
                    ModelKind::TextGeneration => println!(),
                    _ => {}
                },
                (InferenceStatus::Error, data) if done => {
                    failure = Some(data.as_text().unwrap_or("unknown error").to_string());
                }
                _ => {}
            },
            _ => {}
        }
        if done {
            break;
        }
    }
    worker.join().await;

    if let Some(reason) = failure {
        anyhow::bail!("{kind} failed: {reason}");
    }
    if sequencer.accepted() > 0 {
        if let Some(dir) = out {
            println!("Wrote {} chunk(s) to {}", sequencer.accepted(), dir.display());
        }
    }
    Ok(())
}

fn save_chunk(dir: &Path, chunk: &AudioChunk) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("chunk-{:03}.wav", chunk.sequence_index));
    std::fs::write(&path, &chunk.waveform)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read a WAV file into a mono utterance.
fn read_utterance(path: &Path) -> anyhow::Result<Utterance> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => {
            let pcm = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
            pcm16_to_float(&pcm)
        }
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok(Utterance::new(samples, spec.sample_rate))
}

fn print_progress(kind: ModelKind, progress: &LoadProgress) {
    match progress {
        LoadProgress::Initiating => eprintln!("[{kind}] loading"),
        LoadProgress::Downloading { file, .. } => eprintln!("[{kind}] downloading {file}"),
        LoadProgress::Progressing { file, percent, .. } => {
            eprintln!("[{kind}] {file} {percent:.0}%")
        }
        LoadProgress::Done { file, .. } => eprintln!("[{kind}] {file} done"),
        LoadProgress::Ready { model } => eprintln!("[{kind}] ready ({model})"),
    }
}

async fn gateway_health(addr: &str) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client.get(format!("http://{addr}/health")).send().await.ok()?;
    resp.json().await.ok()
}

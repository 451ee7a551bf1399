//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Device, ModelIdentity, ModelKind, ModelSettings, Precision};

pub const DEFAULT_STT_MODEL_ID: &str = "onnx-community/whisper-base";
pub const DEFAULT_TEXT_GENERATION_MODEL_ID: &str = "onnx-community/LFM2-1.2B-ONNX";
pub const DEFAULT_TTS_MODEL_ID: &str = "onnx-community/Kokoro-82M-v1.0-ONNX";
pub const DEFAULT_WEIGHTS_BASE_URL: &str = "http://localhost:3001/models";
/// Files every model directory must provide when none are configured.
pub const DEFAULT_WEIGHT_FILES: &[&str] = &["config.json"];
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Do not use special characters. Do not use * character.";

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<WeightsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_to_text: Option<ModelEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_generation: Option<ModelEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_to_speech: Option<ModelEntry>,
}

/// Model id and settings for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    #[serde(default)]
    pub settings: ModelSettings,
    /// Weight files fetched before construction, relative to the model directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
}

/// Where engine factories find weight files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightsConfig {
    /// Local directory or http(s) URL that model ids are resolved against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,

    /// Permit fetching from non-local hosts.
    #[serde(default)]
    pub allow_remote: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,

    /// Sample instead of greedy decoding.
    #[serde(default)]
    pub sample: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Longest unit handed to the synthesis engine in one call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unit_chars: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_gateway_port() -> u16 {
    18790
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_models=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

/// Whether a weights location points at a non-local HTTP host.
pub fn is_remote(location: &str) -> bool {
    let Some(rest) = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("https://"))
    else {
        return false;
    };
    let host = rest.split(['/', ':']).next().unwrap_or_default();
    !matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

impl ParleyConfig {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::ParleyError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: ParleyConfig = json5::from_str(&substituted)
            .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;

        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    fn entry(&self, kind: ModelKind) -> Option<&ModelEntry> {
        let models = self.models.as_ref()?;
        match kind {
            ModelKind::SpeechToText => models.speech_to_text.as_ref(),
            ModelKind::TextGeneration => models.text_generation.as_ref(),
            ModelKind::TextToSpeech => models.text_to_speech.as_ref(),
            ModelKind::SpeechToSpeech => None,
        }
    }

    /// Configured identity for an engine-backed kind; `None` for the composite kind.
    pub fn identity(&self, kind: ModelKind) -> Option<ModelIdentity> {
        if let Some(entry) = self.entry(kind) {
            return Some(ModelIdentity::new(entry.model_id.clone(), entry.settings));
        }
        let (model_id, precision) = match kind {
            ModelKind::SpeechToText => (DEFAULT_STT_MODEL_ID, Precision::Fp32),
            ModelKind::TextGeneration => (DEFAULT_TEXT_GENERATION_MODEL_ID, Precision::Int4),
            ModelKind::TextToSpeech => (DEFAULT_TTS_MODEL_ID, Precision::Fp32),
            ModelKind::SpeechToSpeech => return None,
        };
        Some(ModelIdentity::new(
            model_id,
            ModelSettings::new(precision, Device::Gpu),
        ))
    }

    /// Weight files the engine for `kind` is built from; empty for the composite kind.
    pub fn weight_files(&self, kind: ModelKind) -> Vec<String> {
        if kind.is_composite() {
            return Vec::new();
        }
        match self.entry(kind) {
            Some(entry) if !entry.files.is_empty() => entry.files.clone(),
            _ => DEFAULT_WEIGHT_FILES.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn weights_base_url(&self) -> String {
        self.weights
            .as_ref()
            .and_then(|w| w.base_url.clone())
            .unwrap_or_else(|| DEFAULT_WEIGHTS_BASE_URL.to_string())
    }

    /// Directory fetched weight files are cached in.
    pub fn cache_dir(&self) -> PathBuf {
        self.weights
            .as_ref()
            .and_then(|w| w.cache_dir.as_ref())
            .map(|dir| {
                let expanded = shellexpand::tilde(dir);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("models"))
    }

    pub fn allow_remote(&self) -> bool {
        self.weights.as_ref().is_some_and(|w| w.allow_remote)
    }

    pub fn language(&self) -> String {
        self.transcription
            .as_ref()
            .and_then(|t| t.language.clone())
            .unwrap_or_else(|| "en".to_string())
    }

    pub fn system_prompt(&self) -> String {
        self.generation
            .as_ref()
            .and_then(|g| g.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn max_new_tokens(&self) -> u32 {
        self.generation
            .as_ref()
            .and_then(|g| g.max_new_tokens)
            .unwrap_or(1024)
    }

    pub fn sample(&self) -> bool {
        self.generation.as_ref().is_some_and(|g| g.sample)
    }

    pub fn voice(&self) -> String {
        self.synthesis
            .as_ref()
            .and_then(|s| s.voice.clone())
            .unwrap_or_else(|| "af_heart".to_string())
    }

    pub fn max_unit_chars(&self) -> usize {
        self.synthesis
            .as_ref()
            .and_then(|s| s.max_unit_chars)
            .unwrap_or(300)
    }

    pub fn synthesis_sample_rate(&self) -> u32 {
        self.synthesis
            .as_ref()
            .and_then(|s| s.sample_rate)
            .unwrap_or(24_000)
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway
            .as_ref()
            .map(|g| g.port)
            .unwrap_or_else(default_gateway_port)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Get a config value by dotted path (e.g. "synthesis.voice").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| anyhow::anyhow!("Config serialization error: {e}"))?;

        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            anyhow::bail!("Empty path");
        };

        let mut current = &mut json;
        for segment in parents {
            if current.get(segment).is_none() {
                current[segment] = serde_json::json!({});
            }
            current = current
                .get_mut(segment)
                .ok_or_else(|| anyhow::anyhow!("Cannot descend into '{segment}'"))?;
        }
        current[last] = value;

        *self = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Config deserialization error: {e}"))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for kind in ModelKind::ENGINES {
            if let Some(entry) = self.entry(kind) {
                if entry.model_id.trim().is_empty() {
                    errors.push(format!("Model id for {kind} is empty"));
                }
            }
        }

        let base_url = self.weights_base_url();
        if is_remote(&base_url) && !self.allow_remote() {
            warnings.push(format!(
                "Weights base URL '{base_url}' is remote but weights.allow_remote is false"
            ));
        }

        if self.max_unit_chars() == 0 {
            errors.push("synthesis.max_unit_chars cannot be 0".to_string());
        }
        if self.synthesis_sample_rate() == 0 {
            errors.push("synthesis.sample_rate cannot be 0".to_string());
        }
        if self.max_new_tokens() == 0 {
            errors.push("generation.max_new_tokens cannot be 0".to_string());
        }
        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_PARLEY_VOICE", "am_adam") };
        let input = r#"{"voice": "${TEST_PARLEY_VOICE}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("am_adam"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_VOICE") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_identities() {
        let config = ParleyConfig::default();
        let stt = config.identity(ModelKind::SpeechToText).unwrap();
        assert_eq!(stt.model_id, DEFAULT_STT_MODEL_ID);
        assert_eq!(stt.settings, ModelSettings::new(Precision::Fp32, Device::Gpu));

        let tg = config.identity(ModelKind::TextGeneration).unwrap();
        assert_eq!(tg.settings.precision, Precision::Int4);

        assert!(config.identity(ModelKind::SpeechToSpeech).is_none());
    }

    #[test]
    fn test_default_accessors() {
        let config = ParleyConfig::default();
        assert_eq!(config.weights_base_url(), DEFAULT_WEIGHTS_BASE_URL);
        assert_eq!(config.language(), "en");
        assert_eq!(config.max_new_tokens(), 1024);
        assert!(!config.sample());
        assert_eq!(config.voice(), "af_heart");
        assert_eq!(config.max_unit_chars(), 300);
        assert_eq!(config.gateway_port(), 18790);
        assert!(config.system_prompt().contains("Do not use * character"));
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                models: {
                    speech_to_text: {
                        model_id: "moonshine-base-ONNX",
                        settings: { device: "wasm" },
                        files: ["config.json", "onnx/encoder_model.onnx"],
                    },
                },
                weights: { base_url: "/srv/models", cache_dir: "/tmp/parley-cache" },
                synthesis: { voice: "bf_emma", max_unit_chars: 120 },
            }"#,
        )
        .unwrap();

        let config = ParleyConfig::load(&path).unwrap();
        let stt = config.identity(ModelKind::SpeechToText).unwrap();
        assert_eq!(stt.model_id, "moonshine-base-ONNX");
        assert_eq!(stt.settings.device, Device::Cpu);
        assert_eq!(config.weights_base_url(), "/srv/models");
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/parley-cache"));
        assert_eq!(config.voice(), "bf_emma");
        assert_eq!(config.max_unit_chars(), 120);
        assert_eq!(
            config.weight_files(ModelKind::SpeechToText),
            vec!["config.json", "onnx/encoder_model.onnx"]
        );
        // Unconfigured kinds keep their defaults
        assert_eq!(config.weight_files(ModelKind::TextToSpeech), vec!["config.json"]);
        assert_eq!(
            config.identity(ModelKind::TextToSpeech).unwrap().model_id,
            DEFAULT_TTS_MODEL_ID
        );
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = ParleyConfig::load(Path::new("/nonexistent/parley/config.json")).unwrap();
        assert!(config.models.is_none());
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ models: ").unwrap();
        let err = ParleyConfig::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::ParleyError::Config(_)));
    }

    #[test]
    fn test_get_and_set_path() {
        let mut config = ParleyConfig::default();
        config
            .set_path("synthesis.voice", serde_json::json!("am_michael"))
            .unwrap();
        assert_eq!(config.voice(), "am_michael");
        assert_eq!(
            config.get_path("synthesis.voice"),
            Some(serde_json::json!("am_michael"))
        );
        assert!(config.get_path("synthesis.missing").is_none());
        assert!(config.set_path("", serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: ParleyConfig = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_remote_weights_warns() {
        let config = ParleyConfig {
            weights: Some(WeightsConfig {
                base_url: Some("https://huggingface.co".into()),
                cache_dir: None,
                allow_remote: false,
            }),
            ..ParleyConfig::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(
            warnings.iter().any(|w| w.contains("allow_remote")),
            "Expected a remote weights warning, got: {warnings:?}"
        );

        // localhost is not remote
        let (warnings, _) = ParleyConfig::default().validate();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_validate_bad_values_error() {
        let config = ParleyConfig {
            models: Some(ModelsConfig {
                text_generation: Some(ModelEntry {
                    model_id: " ".into(),
                    settings: ModelSettings::default(),
                    files: Vec::new(),
                }),
                ..ModelsConfig::default()
            }),
            synthesis: Some(SynthesisConfig {
                voice: None,
                max_unit_chars: Some(0),
                sample_rate: None,
            }),
            gateway: Some(GatewayConfig { port: 0, bind: None }),
            ..ParleyConfig::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("TG")));
        assert!(errors.iter().any(|e| e.contains("max_unit_chars")));
        assert!(errors.iter().any(|e| e.contains("port")));
    }
}

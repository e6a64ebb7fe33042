//! TOML configuration file loading
//!
//! Supports `~/.config/reachy-bridge/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfigFile {
    /// Run mode ("normal", "standalone", "demo")
    #[serde(default)]
    pub mode: Option<String>,

    /// Gateway connection
    #[serde(default)]
    pub gateway: GatewayFileConfig,

    /// Speech-to-text backend
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech provider
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Microphone and silence detection
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Conversation behavior
    #[serde(default)]
    pub behavior: BehaviorFileConfig,

    /// Robot action defaults and limits
    #[serde(default)]
    pub robot: RobotFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Gateway connection configuration
#[derive(Debug, Default, Deserialize)]
pub struct GatewayFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,

    /// Use `wss://` instead of `ws://`
    pub tls: Option<bool>,

    /// Seconds to wait for a reply before the turn times out
    pub reply_timeout_secs: Option<u64>,

    /// Seconds between keep-alive pings
    pub ping_interval_secs: Option<u64>,

    /// Reconnect policy
    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Reconnect/backoff configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_total_wait_secs: Option<u64>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Backend ("local", "openai", "deepgram")
    pub backend: Option<String>,

    /// Model name or size (e.g. "base", "whisper-1", "nova-2")
    pub model: Option<String>,

    /// Base URL of the local OpenAI-compatible transcription server
    pub local_url: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// Provider ("openai", "elevenlabs")
    pub provider: Option<String>,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub speed: Option<f32>,
}

/// Audio capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_secs: Option<f64>,
    pub onset_frames: Option<usize>,
    pub max_recording_secs: Option<f64>,
}

/// Behavior configuration
#[derive(Debug, Default, Deserialize)]
pub struct BehaviorFileConfig {
    pub wake_word: Option<String>,
    pub keep_awake: Option<bool>,
    pub play_emotions: Option<bool>,
    pub idle_animations: Option<bool>,

    /// Phrase spoken after a failed turn; empty string disables it
    pub apology: Option<String>,
    pub idle_interval_secs: Option<u64>,
}

/// Robot configuration
#[derive(Debug, Default, Deserialize)]
pub struct RobotFileConfig {
    pub capture_dir: Option<String>,
    pub head_duration_secs: Option<f32>,
    pub antenna_duration_secs: Option<f32>,
    pub max_roll: Option<f32>,
    pub max_pitch: Option<f32>,
    pub max_yaw: Option<f32>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from `REACHY_BRIDGE_CONFIG` or the standard path
///
/// Returns `BridgeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BridgeConfigFile {
    let path = std::env::var("REACHY_BRIDGE_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    let Some(path) = path else {
        return BridgeConfigFile::default();
    };

    if !path.exists() {
        return BridgeConfigFile::default();
    }

    load_from_path(&path)
}

/// Parse a config file at an explicit path
pub fn load_from_path(path: &Path) -> BridgeConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                BridgeConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            BridgeConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/reachy-bridge/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("reachy-bridge").join("config.toml"))
}

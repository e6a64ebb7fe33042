//! Configuration management for the Reachy bridge

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::gateway::retry::RetryPolicy;
use crate::{Error, Result};

use self::file::BridgeConfigFile;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 18789;
const DEFAULT_LOCAL_STT_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_APOLOGY: &str = "Sorry, I had trouble with that.";

/// Reachy bridge configuration
///
/// Read once at startup and shared as `Arc<Config>` afterwards.
#[derive(Debug)]
pub struct Config {
    /// How the bridge runs
    pub mode: Mode,

    /// Gateway connection
    pub gateway: GatewayConfig,

    /// Speech-to-text backend
    pub stt: SttConfig,

    /// Text-to-speech provider
    pub tts: TtsConfig,

    /// Microphone capture and silence detection
    pub audio: AudioConfig,

    /// Conversation behavior toggles
    pub behavior: BehaviorConfig,

    /// Robot action settings
    pub robot: RobotConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Cache directory
    pub cache_dir: PathBuf,
}

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Full loop through the gateway
    #[default]
    Normal,
    /// Echo transcripts back without a gateway
    Standalone,
    /// Scripted robot demo, no audio input
    Demo,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "standalone" => Ok(Self::Standalone),
            "demo" => Ok(Self::Demo),
            other => Err(Error::Config(format!("unknown mode: {other}"))),
        }
    }
}

/// Gateway connection configuration
#[derive(Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Bearer token sent at connect time
    pub token: Option<SecretString>,

    /// Use `wss://`
    pub tls: bool,

    /// How long a turn waits for its reply
    pub reply_timeout: Duration,

    /// Keep-alive ping interval
    pub ping_interval: Duration,

    /// Connect and reconnect backoff
    pub retry: RetryPolicy,
}

impl GatewayConfig {
    /// WebSocket URL of the gateway
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Speech-to-text backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttBackend {
    /// OpenAI-compatible server on the local machine
    #[default]
    Local,
    /// OpenAI Whisper API
    OpenAi,
    /// Deepgram API
    Deepgram,
}

impl SttBackend {
    /// Model used when none is configured
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::Local => "base",
            Self::OpenAi => "whisper-1",
            Self::Deepgram => "nova-2",
        }
    }
}

impl FromStr for SttBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" | "whisper" | "faster-whisper" => Ok(Self::Local),
            "openai" => Ok(Self::OpenAi),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT backend: {other}"))),
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub backend: SttBackend,

    /// Model name or whisper size
    pub model: String,

    /// Base URL for the local backend
    pub local_url: String,
}

/// Text-to-speech provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    #[default]
    OpenAi,
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,

    /// Voice name (`OpenAI`) or voice id (`ElevenLabs`)
    pub voice: String,
    pub model: String,
    pub speed: f32,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,

    /// Samples per analysis frame
    pub frame_size: usize,

    /// RMS energy that counts as speech
    pub silence_threshold: f32,

    /// Trailing silence that closes an utterance
    pub silence_duration: Duration,

    /// Consecutive loud frames needed to start an utterance
    pub onset_frames: usize,

    /// Hard cap on utterance length
    pub max_recording: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 1024,
            silence_threshold: 0.01,
            silence_duration: Duration::from_millis(1500),
            onset_frames: 2,
            max_recording: Duration::from_secs(30),
        }
    }
}

impl AudioConfig {
    /// Duration of one frame
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / f64::from(self.sample_rate))
    }

    /// Number of quiet frames that end an utterance (at least one)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn trailing_silence_frames(&self) -> usize {
        let frames = self.silence_duration.as_secs_f64() / self.frame_duration().as_secs_f64();
        (frames.ceil() as usize).max(1)
    }

    /// Maximum frames in one utterance (at least the onset)
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn max_frames(&self) -> usize {
        let frames = self.max_recording.as_secs_f64() / self.frame_duration().as_secs_f64();
        (frames.floor() as usize).max(self.onset_frames.max(1))
    }
}

/// Conversation behavior
#[derive(Debug, Clone)]
pub struct BehaviorConfig {
    /// Phrase required before each utterance
    pub wake_word: Option<String>,

    /// Stay activated after the first wake phrase
    pub keep_awake: bool,
    pub play_emotions: bool,
    pub idle_animations: bool,

    /// Spoken after a failed turn
    pub apology: Option<String>,

    /// Time between idle motion rolls
    pub idle_interval: Duration,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            wake_word: None,
            keep_awake: false,
            play_emotions: true,
            idle_animations: true,
            apology: Some(DEFAULT_APOLOGY.to_string()),
            idle_interval: Duration::from_secs(5),
        }
    }
}

/// Safety limits for head motion, in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionLimits {
    pub max_roll: f32,
    pub max_pitch: f32,
    pub max_yaw: f32,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            max_roll: 30.0,
            max_pitch: 30.0,
            max_yaw: 45.0,
        }
    }
}

/// Robot action configuration
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Where captured images are written
    pub capture_dir: PathBuf,
    pub head_duration: f32,
    pub antenna_duration: f32,
    pub limits: MotionLimits,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    pub openai: Option<SecretString>,
    pub deepgram: Option<SecretString>,
    pub elevenlabs: Option<SecretString>,
}

/// Values supplied on the command line, highest precedence
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub gateway_host: Option<String>,
    pub gateway_port: Option<u16>,
    pub gateway_token: Option<String>,
    pub stt_backend: Option<String>,
    pub whisper_model: Option<String>,
    pub wake_word: Option<String>,
    pub no_emotions: bool,
    pub no_idle: bool,
    pub mode: Option<Mode>,
}

impl Config {
    /// Load configuration from overrides, environment, config file and defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value is invalid or a directory cannot be created
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(overrides, |key| std::env::var(key).ok(), fc)?;
        config.ensure_dirs()?;
        Ok(config)
    }

    /// Layer the sources (overrides > env > file > default) and validate
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is invalid
    pub fn resolve(
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
        fc: BridgeConfigFile,
    ) -> Result<Self> {
        let mode = match overrides.mode {
            Some(mode) => mode,
            None => env("REACHY_MODE")
                .or(fc.mode)
                .map(|m| m.parse::<Mode>())
                .transpose()?
                .unwrap_or_default(),
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or_else(|| env("OPENCLAW_OPENAI_TOKEN"))
                .or(fc.api_keys.openai)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: fc.gateway.retry.max_attempts.unwrap_or(retry_defaults.max_attempts),
            base_delay: fc
                .gateway
                .retry
                .base_delay_ms
                .map_or(retry_defaults.base_delay, Duration::from_millis),
            max_delay: fc
                .gateway
                .retry
                .max_delay_ms
                .map_or(retry_defaults.max_delay, Duration::from_millis),
            max_total_wait: fc
                .gateway
                .retry
                .max_total_wait_secs
                .map(Duration::from_secs)
                .or(retry_defaults.max_total_wait),
        };

        let gateway = GatewayConfig {
            host: overrides
                .gateway_host
                .clone()
                .or_else(|| env("OPENCLAW_HOST"))
                .or(fc.gateway.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: overrides
                .gateway_port
                .or_else(|| env("OPENCLAW_PORT").and_then(|p| p.parse().ok()))
                .or(fc.gateway.port)
                .unwrap_or(DEFAULT_PORT),
            token: overrides
                .gateway_token
                .clone()
                .or_else(|| env("OPENCLAW_TOKEN"))
                .or(fc.gateway.token)
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            tls: fc.gateway.tls.unwrap_or(false),
            reply_timeout: Duration::from_secs(fc.gateway.reply_timeout_secs.unwrap_or(120)),
            ping_interval: Duration::from_secs(fc.gateway.ping_interval_secs.unwrap_or(20)),
            retry,
        };

        let backend: SttBackend = overrides
            .stt_backend
            .clone()
            .or_else(|| env("STT_BACKEND"))
            .or(fc.stt.backend)
            .map(|b| b.parse::<SttBackend>())
            .transpose()?
            .unwrap_or_default();
        let stt = SttConfig {
            backend,
            model: overrides
                .whisper_model
                .clone()
                .or_else(|| env("WHISPER_MODEL"))
                .or(fc.stt.model)
                .unwrap_or_else(|| backend.default_model().to_string()),
            local_url: env("STT_LOCAL_URL")
                .or(fc.stt.local_url)
                .unwrap_or_else(|| DEFAULT_LOCAL_STT_URL.to_string()),
        };

        let provider: TtsProvider = fc
            .tts
            .provider
            .map(|p| p.parse::<TtsProvider>())
            .transpose()?
            .unwrap_or_default();
        let tts = TtsConfig {
            provider,
            voice: fc.tts.voice.unwrap_or_else(|| match provider {
                TtsProvider::OpenAi => "alloy".to_string(),
                TtsProvider::ElevenLabs => "21m00Tcm4TlvDq8Ikwam".to_string(),
            }),
            model: fc.tts.model.unwrap_or_else(|| match provider {
                TtsProvider::OpenAi => "tts-1".to_string(),
                TtsProvider::ElevenLabs => "eleven_monolingual_v1".to_string(),
            }),
            speed: fc.tts.speed.unwrap_or(1.0),
        };

        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(audio_defaults.sample_rate),
            frame_size: fc.audio.frame_size.unwrap_or(audio_defaults.frame_size),
            silence_threshold: fc
                .audio
                .silence_threshold
                .unwrap_or(audio_defaults.silence_threshold),
            silence_duration: seconds(
                fc.audio.silence_duration_secs,
                audio_defaults.silence_duration,
                "audio.silence_duration_secs",
            )?,
            onset_frames: fc.audio.onset_frames.unwrap_or(audio_defaults.onset_frames),
            max_recording: seconds(
                fc.audio.max_recording_secs,
                audio_defaults.max_recording,
                "audio.max_recording_secs",
            )?,
        };

        let behavior = BehaviorConfig {
            wake_word: overrides
                .wake_word
                .clone()
                .or_else(|| env("WAKE_WORD"))
                .or(fc.behavior.wake_word)
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty()),
            keep_awake: fc.behavior.keep_awake.unwrap_or(false),
            play_emotions: !overrides.no_emotions && fc.behavior.play_emotions.unwrap_or(true),
            idle_animations: !overrides.no_idle && fc.behavior.idle_animations.unwrap_or(true),
            apology: match fc.behavior.apology {
                Some(a) if a.is_empty() => None,
                Some(a) => Some(a),
                None => Some(DEFAULT_APOLOGY.to_string()),
            },
            idle_interval: Duration::from_secs(fc.behavior.idle_interval_secs.unwrap_or(5)),
        };

        let limit_defaults = MotionLimits::default();
        let robot = RobotConfig {
            capture_dir: fc
                .robot
                .capture_dir
                .map_or_else(default_capture_dir, PathBuf::from),
            head_duration: fc.robot.head_duration_secs.unwrap_or(1.0),
            antenna_duration: fc.robot.antenna_duration_secs.unwrap_or(0.5),
            limits: MotionLimits {
                max_roll: fc.robot.max_roll.unwrap_or(limit_defaults.max_roll),
                max_pitch: fc.robot.max_pitch.unwrap_or(limit_defaults.max_pitch),
                max_yaw: fc.robot.max_yaw.unwrap_or(limit_defaults.max_yaw),
            },
        };

        let config = Self {
            mode,
            gateway,
            stt,
            tts,
            audio,
            behavior,
            robot,
            api_keys,
            cache_dir: default_cache_dir(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and required keys
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            return Err(Error::Config("gateway port must be non-zero".into()));
        }
        if self.gateway.reply_timeout.is_zero() {
            return Err(Error::Config("gateway.reply_timeout_secs must be positive".into()));
        }
        if self.gateway.retry.max_attempts == 0 {
            return Err(Error::Config("gateway.retry.max_attempts must be positive".into()));
        }
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".into()));
        }
        if self.audio.frame_size == 0 {
            return Err(Error::Config("audio.frame_size must be positive".into()));
        }
        if self.audio.onset_frames == 0 {
            return Err(Error::Config("audio.onset_frames must be positive".into()));
        }
        if self.audio.silence_threshold.is_nan() || self.audio.silence_threshold <= 0.0 {
            return Err(Error::Config("audio.silence_threshold must be positive".into()));
        }
        if self.audio.silence_duration.is_zero() || self.audio.max_recording.is_zero() {
            return Err(Error::Config("audio durations must be positive".into()));
        }
        if self.tts.speed.is_nan() || self.tts.speed <= 0.0 {
            return Err(Error::Config("tts.speed must be positive".into()));
        }

        if self.mode == Mode::Demo {
            return Ok(());
        }

        match self.stt.backend {
            SttBackend::OpenAi if self.api_keys.openai.is_none() => {
                return Err(Error::Config(
                    "STT backend 'openai' requires OPENAI_API_KEY".into(),
                ));
            }
            SttBackend::Deepgram if self.api_keys.deepgram.is_none() => {
                return Err(Error::Config(
                    "STT backend 'deepgram' requires DEEPGRAM_API_KEY".into(),
                ));
            }
            _ => {}
        }

        match self.tts.provider {
            TtsProvider::OpenAi if self.api_keys.openai.is_none() => Err(Error::Config(
                "TTS provider 'openai' requires OPENAI_API_KEY".into(),
            )),
            TtsProvider::ElevenLabs if self.api_keys.elevenlabs.is_none() => Err(Error::Config(
                "TTS provider 'elevenlabs' requires ELEVENLABS_API_KEY".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Create the cache and capture directories
    ///
    /// # Errors
    ///
    /// Returns error if a directory cannot be created
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.robot.capture_dir)?;
        Ok(())
    }
}

fn seconds(value: Option<f64>, default: Duration, key: &str) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(Error::Config(format!("{key} must be positive, got {secs}"))),
    }
}

fn default_cache_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".reachy-bridge/cache"),
        |d| d.cache_dir().join("reachy-bridge"),
    )
}

fn default_capture_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".reachy-bridge/captures"),
        |d| d.home_dir().join(".reachy-bridge").join("captures"),
    )
}

//! Speech-to-text (STT) processing

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::capture::{Utterance, samples_to_wav};
use crate::config::{Config, SttBackend};
use crate::error::TranscriptionError;
use crate::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEEPGRAM_BASE_URL: &str = "https://api.deepgram.com";

/// One recognized word with its position in the audio, in seconds
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Result of a transcription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Word timings when the backend provides them; may be empty
    pub words: Vec<WordTiming>,
}

/// Converts one utterance to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an utterance; never retries
    async fn transcribe(
        &self,
        utterance: &Utterance,
    ) -> std::result::Result<Transcript, TranscriptionError>;
}

/// Build the transcriber selected in the configuration
///
/// # Errors
///
/// Returns error if a cloud backend has no API key
pub fn from_config(config: &Config, client: reqwest::Client) -> Result<Arc<dyn Transcriber>> {
    let model = config.stt.model.clone();
    let transcriber: Arc<dyn Transcriber> = match config.stt.backend {
        SttBackend::Local => Arc::new(WhisperTranscriber {
            client,
            base_url: config.stt.local_url.trim_end_matches('/').to_string(),
            api_key: None,
            model,
        }),
        SttBackend::OpenAi => Arc::new(WhisperTranscriber {
            client,
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: Some(required_key(config.api_keys.openai.as_ref(), "OPENAI_API_KEY")?),
            model,
        }),
        SttBackend::Deepgram => Arc::new(DeepgramTranscriber {
            client,
            base_url: DEEPGRAM_BASE_URL.to_string(),
            api_key: required_key(config.api_keys.deepgram.as_ref(), "DEEPGRAM_API_KEY")?,
            model,
        }),
    };

    tracing::info!(backend = ?config.stt.backend, model = %config.stt.model, "speech-to-text ready");
    Ok(transcriber)
}

fn required_key(key: Option<&SecretString>, name: &str) -> Result<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_string()))
        .ok_or_else(|| Error::Config(format!("{name} required for this STT backend")))
}

fn encode(utterance: &Utterance) -> std::result::Result<Vec<u8>, TranscriptionError> {
    if utterance.samples.is_empty() {
        return Err(TranscriptionError::EmptyAudio);
    }
    samples_to_wav(&utterance.samples, utterance.sample_rate)
        .map_err(|e| TranscriptionError::Decode(e.to_string()))
}

fn finish(text: &str, words: Vec<WordTiming>) -> std::result::Result<Transcript, TranscriptionError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TranscriptionError::NoSpeech);
    }
    tracing::info!(transcript = %text, "transcription complete");
    Ok(Transcript {
        text: text.to_string(),
        words,
    })
}

fn request_failed(e: &reqwest::Error) -> TranscriptionError {
    tracing::error!(error = %e, "transcription request failed");
    TranscriptionError::Unreachable(e.to_string())
}

async fn check_status(
    response: reqwest::Response,
    backend: &str,
) -> std::result::Result<reqwest::Response, TranscriptionError> {
    let status = response.status();
    tracing::debug!(status = %status, "received response");

    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = %status, body = %body, "{backend} API error");
    Err(TranscriptionError::Backend(format!("{backend} API error {status}: {body}")))
}

/// Response from an OpenAI-compatible transcription endpoint
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    words: Vec<WordTiming>,
}

/// OpenAI Whisper API, or a local server speaking the same protocol
pub struct WhisperTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(
        &self,
        utterance: &Utterance,
    ) -> std::result::Result<Transcript, TranscriptionError> {
        let audio = encode(utterance)?;
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let file = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");

        let mut request = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| request_failed(&e))?;
        let response = check_status(response, "Whisper").await?;

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            TranscriptionError::Decode(e.to_string())
        })?;

        finish(&result.text, result.words)
    }
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    words: Vec<WordTiming>,
}

/// Deepgram listen API
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(
        &self,
        utterance: &Utterance,
    ) -> std::result::Result<Transcript, TranscriptionError> {
        let audio = encode(utterance)?;
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "{}/v1/listen?model={}&punctuate=true",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await
            .map_err(|e| request_failed(&e))?;
        let response = check_status(response, "Deepgram").await?;

        let result: DeepgramResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            TranscriptionError::Decode(e.to_string())
        })?;

        let alternative = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next());

        match alternative {
            Some(alt) => finish(&alt.transcript, alt.words),
            None => Err(TranscriptionError::NoSpeech),
        }
    }
}

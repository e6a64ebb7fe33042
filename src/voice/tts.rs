//! Text-to-speech (TTS) processing

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{Config, TtsProvider};
use crate::{Error, Result};

/// Synthesizes speech from text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`, optionally in a specific voice
    ///
    /// Returns MP3 audio bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tts` if synthesis fails
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>>;
}

/// Build the synthesizer selected in the configuration
///
/// Returns `None` when the provider has no API key.
#[must_use]
pub fn from_config(config: &Config, client: reqwest::Client) -> Option<Arc<dyn Synthesizer>> {
    let tts = &config.tts;
    let synthesizer: Arc<dyn Synthesizer> = match tts.provider {
        TtsProvider::OpenAi => Arc::new(OpenAiSynthesizer {
            client,
            api_key: copy_key(config.api_keys.openai.as_ref())?,
            voice: tts.voice.clone(),
            model: tts.model.clone(),
            speed: tts.speed,
        }),
        TtsProvider::ElevenLabs => Arc::new(ElevenLabsSynthesizer {
            client,
            api_key: copy_key(config.api_keys.elevenlabs.as_ref())?,
            voice_id: tts.voice.clone(),
            model: tts.model.clone(),
        }),
    };
    tracing::info!(provider = ?tts.provider, voice = %tts.voice, "text-to-speech ready");
    Some(synthesizer)
}

fn copy_key(key: Option<&SecretString>) -> Option<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_string()))
}

/// `OpenAI` speech endpoint
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    model: String,
    speed: f32,
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: voice.unwrap_or(&self.voice),
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

/// `ElevenLabs` text-to-speech endpoint
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    voice_id: String,
    model: String,
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            voice.unwrap_or(&self.voice_id)
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::config::file::BridgeConfigFile;

    fn config() -> Config {
        Config::resolve(
            &Overrides::default(),
            |key: &str| (key == "OPENAI_API_KEY").then(|| "sk-test".to_string()),
            BridgeConfigFile::default(),
        )
        .unwrap()
    }

    #[test]
    fn openai_with_key_is_built() {
        let config = config();
        assert_eq!(config.tts.provider, TtsProvider::OpenAi);
        assert!(from_config(&config, reqwest::Client::new()).is_some());
    }

    #[test]
    fn missing_key_means_no_synthesizer() {
        let mut config = config();
        config.api_keys.openai = None;
        assert!(from_config(&config, reqwest::Client::new()).is_none());

        let mut config = self::config();
        config.tts.provider = TtsProvider::ElevenLabs;
        assert!(from_config(&config, reqwest::Client::new()).is_none());
    }
}

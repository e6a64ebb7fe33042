//! Wake word detection
//!
//! The gate sits between segmentation and transcription. It asks a spotter
//! where the wake phrase ends inside a speech segment and decides whether the
//! segment (or its tail) becomes the utterance.

use std::sync::Arc;

use async_trait::async_trait;

use super::capture::Utterance;
use super::segmenter::contains_speech;
use super::stt::{Transcriber, WordTiming};
use crate::error::TranscriptionError;
use crate::Result;

/// Locates a wake phrase in audio
#[async_trait]
pub trait WakePhraseSpotter: Send + Sync {
    /// Sample offset just past the end of `phrase`, or `None` if absent
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be analyzed
    async fn spot(
        &self,
        samples: &[f32],
        sample_rate: u32,
        phrase: &str,
    ) -> Result<Option<usize>>;
}

/// Spots the phrase by transcribing the segment
pub struct TranscriptSpotter {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscriptSpotter {
    #[must_use]
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl WakePhraseSpotter for TranscriptSpotter {
    async fn spot(
        &self,
        samples: &[f32],
        sample_rate: u32,
        phrase: &str,
    ) -> Result<Option<usize>> {
        let window = Utterance::from_samples(samples.to_vec(), sample_rate);
        let transcript = match self.transcriber.transcribe(&window).await {
            Ok(t) => t,
            Err(TranscriptionError::NoSpeech | TranscriptionError::EmptyAudio) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(heard = %transcript.text, "checking for wake phrase");

        let phrase = tokenize(phrase);
        if phrase.is_empty() {
            return Ok(None);
        }

        if let Some(end_secs) = phrase_end_in_words(&transcript.words, &phrase) {
            return Ok(Some(seconds_to_offset(end_secs, sample_rate, samples.len())));
        }

        Ok(phrase_end_fraction(&transcript.text, &phrase).map(|fraction| {
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            let offset = (fraction * samples.len() as f64).round() as usize;
            offset.min(samples.len())
        }))
    }
}

/// Lowercase alphanumeric tokens
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// End time of the first run of words matching `phrase`
fn phrase_end_in_words(words: &[WordTiming], phrase: &[String]) -> Option<f64> {
    let tokens: Vec<(String, f64)> = words
        .iter()
        .flat_map(|w| tokenize(&w.word).into_iter().map(move |t| (t, w.end)))
        .collect();

    tokens
        .windows(phrase.len())
        .find(|window| window.iter().zip(phrase).all(|((t, _), p)| t == p))
        .and_then(|window| window.last().map(|(_, end)| *end))
}

/// Position (0..=1) just past the phrase in the transcript text
#[allow(clippy::cast_precision_loss)]
fn phrase_end_fraction(text: &str, phrase: &[String]) -> Option<f64> {
    let normalized = tokenize(text).join(" ");
    let needle = phrase.join(" ");
    let start = normalized.find(&needle)?;
    let end = start + needle.len();
    Some(end as f64 / normalized.len().max(1) as f64)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn seconds_to_offset(secs: f64, sample_rate: u32, len: usize) -> usize {
    let offset = (secs.max(0.0) * f64::from(sample_rate)).round() as usize;
    offset.min(len)
}

/// What the gate decided for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Deliver the segment from this sample offset
    Pass { offset: usize },
    /// Phrase matched with speech after it; deliver the tail
    Woke { offset: usize },
    /// Phrase matched alone; the next segment is the utterance
    Armed,
    /// No phrase, drop the segment
    Rejected,
}

/// Gates capture on a wake phrase
pub struct WakeWordGate {
    phrase: String,
    spotter: Arc<dyn WakePhraseSpotter>,
    keep_awake: bool,
    frame_size: usize,
    threshold: f32,
    armed: bool,
    awake: bool,
}

impl WakeWordGate {
    /// Create a gate for `phrase`
    ///
    /// `frame_size` and `threshold` decide whether audio after the phrase
    /// counts as speech.
    #[must_use]
    pub fn new(
        phrase: &str,
        spotter: Arc<dyn WakePhraseSpotter>,
        keep_awake: bool,
        frame_size: usize,
        threshold: f32,
    ) -> Self {
        let phrase = phrase.trim().to_lowercase();
        tracing::debug!(wake_word = %phrase, keep_awake, "wake word gate initialized");
        Self {
            phrase,
            spotter,
            keep_awake,
            frame_size,
            threshold,
            armed: false,
            awake: false,
        }
    }

    /// Decide what to do with a speech segment
    ///
    /// Gate state only changes after the spotter returns, so dropping the
    /// future leaves the gate untouched.
    pub async fn check(&mut self, samples: &[f32], sample_rate: u32) -> GateDecision {
        if self.awake {
            return GateDecision::Pass { offset: 0 };
        }
        if self.armed {
            self.armed = false;
            return GateDecision::Pass { offset: 0 };
        }

        let spotted = match self.spotter.spot(samples, sample_rate, &self.phrase).await {
            Ok(spotted) => spotted,
            Err(e) => {
                tracing::warn!(error = %e, "wake phrase check failed");
                return GateDecision::Rejected;
            }
        };

        let Some(offset) = spotted else {
            tracing::debug!("no wake phrase, ignoring segment");
            return GateDecision::Rejected;
        };

        tracing::info!(wake_word = %self.phrase, "wake word detected");
        if self.keep_awake {
            self.awake = true;
        }

        let tail = &samples[offset.min(samples.len())..];
        if contains_speech(tail, self.frame_size, self.threshold) {
            GateDecision::Woke { offset }
        } else {
            if !self.keep_awake {
                self.armed = true;
            }
            GateDecision::Armed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(word: &str, start: f64, end: f64) -> WordTiming {
        WordTiming {
            word: word.into(),
            start,
            end,
        }
    }

    #[test]
    fn test_wake_word_detection() {
        let phrase = tokenize("hey robot");
        assert!(phrase_end_fraction("Hey Robot, what time is it?", &phrase).is_some());
        assert!(phrase_end_fraction("HEY ROBOT", &phrase).is_some());
        assert!(phrase_end_fraction("hello there", &phrase).is_none());
    }

    #[test]
    fn word_timings_locate_phrase_end() {
        let words = [
            word("Hey", 0.0, 0.3),
            word("robot,", 0.3, 0.8),
            word("hello", 1.0, 1.4),
        ];
        let end = phrase_end_in_words(&words, &tokenize("hey robot")).unwrap();
        assert!((end - 0.8).abs() < f64::EPSILON);
        assert!(phrase_end_in_words(&words, &tokenize("hello robot")).is_none());
    }

    #[test]
    fn fraction_falls_at_phrase_end() {
        let fraction = phrase_end_fraction("hey robot hello", &tokenize("hey robot")).unwrap();
        // "hey robot" is 9 of 15 characters
        assert!((fraction - 0.6).abs() < 1e-9);
    }

    #[test]
    fn offset_is_clamped() {
        assert_eq!(seconds_to_offset(10.0, 16_000, 1000), 1000);
        assert_eq!(seconds_to_offset(-1.0, 16_000, 1000), 0);
        assert_eq!(seconds_to_offset(0.5, 1000, 1000), 500);
    }
}

//! Speech output with synchronized motion

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::playback::{AudioSink, DecodedAudio, decode_mp3};
use super::tts::Synthesizer;
use crate::robot::{Robot, motion};
use crate::{Error, Result};

/// Strip markdown emphasis and code markers before synthesis
#[must_use]
pub fn clean_for_speech(text: &str) -> String {
    text.replace("**", "")
        .replace("__", "")
        .replace(['*', '`'], "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Owns audio output for spoken replies and expressive cues
///
/// `speak` returns only after playback has finished, so callers can rely on
/// the speaker being idle before reopening the microphone.
pub struct Speaker {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    sink: Arc<dyn AudioSink>,
    robot: Arc<dyn Robot>,
    play_emotions: bool,
    cancel: CancellationToken,
}

impl Speaker {
    #[must_use]
    pub fn new(
        synthesizer: Option<Arc<dyn Synthesizer>>,
        sink: Arc<dyn AudioSink>,
        robot: Arc<dyn Robot>,
        play_emotions: bool,
        cancel: CancellationToken,
    ) -> Self {
        if synthesizer.is_none() {
            tracing::info!("no text-to-speech provider, replies go to the robot voice");
        }
        Self {
            synthesizer,
            sink,
            robot,
            play_emotions,
            cancel,
        }
    }

    /// Speak `text` in the default voice
    pub async fn speak(&self, text: &str) {
        self.speak_with_voice(text, None).await;
    }

    /// Speak `text`, blocking until playback completes or is cancelled
    ///
    /// Synthesis or playback failures are logged and fall back to the
    /// robot's own voice; they never fail the caller.
    pub async fn speak_with_voice(&self, text: &str, voice: Option<&str>) {
        let text = clean_for_speech(text);
        if text.is_empty() {
            return;
        }

        let Some(synthesizer) = &self.synthesizer else {
            self.fallback(&text, voice).await;
            return;
        };

        let audio = match render(synthesizer.as_ref(), &text, voice).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(error = %e, "speech synthesis failed");
                self.fallback(&text, voice).await;
                return;
            }
        };

        tracing::info!(text = %text, "speaking");
        if let Err(e) = self.play(audio).await {
            tracing::warn!(error = %e, "speech playback failed");
            self.fallback(&text, voice).await;
        }
    }

    /// Play an emotion if emotions are enabled
    pub async fn emote(&self, name: &str) {
        if !self.play_emotions {
            return;
        }
        if let Err(e) = self.robot.play_emotion(name).await {
            tracing::debug!(emotion = name, error = %e, "emotion failed");
        }
    }

    /// Start the thinking animation; stop it with `Thinking::stop`
    #[must_use]
    pub fn thinking(&self) -> Thinking {
        let stop = self.cancel.child_token();
        let handle = tokio::spawn(motion::thinking(Arc::clone(&self.robot), stop.clone()));
        Thinking {
            stop,
            handle: Some(handle),
        }
    }

    /// Antenna snap acknowledging the wake phrase
    pub async fn wake_cue(&self) {
        motion::wake_cue(self.robot.as_ref()).await;
    }

    async fn play(&self, audio: DecodedAudio) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let bob_stop = self.cancel.child_token();
        let bob = tokio::spawn(motion::head_bob(
            Arc::clone(&self.robot),
            bob_stop.clone(),
        ));

        let sink = Arc::clone(&self.sink);
        let flag = Arc::clone(&stop);
        let mut playback = tokio::task::spawn_blocking(move || {
            sink.play(audio.samples, audio.sample_rate, &flag)
        });

        let joined = tokio::select! {
            joined = &mut playback => joined,
            () = self.cancel.cancelled() => {
                stop.store(true, Ordering::Relaxed);
                playback.await
            }
        };

        bob_stop.cancel();
        if let Err(e) = bob.await {
            tracing::debug!(error = %e, "head bob task failed");
        }

        match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Audio(format!("playback task failed: {e}"))),
        }
    }

    async fn fallback(&self, text: &str, voice: Option<&str>) {
        if let Err(e) = self.robot.say(text, voice).await {
            tracing::debug!(error = %e, "robot voice unavailable");
            tracing::info!(text = %text, "reply (not spoken)");
        }
    }
}

async fn render(
    synthesizer: &dyn Synthesizer,
    text: &str,
    voice: Option<&str>,
) -> Result<DecodedAudio> {
    let mp3 = synthesizer.synthesize(text, voice).await?;
    let audio = decode_mp3(&mp3)?;
    if audio.samples.is_empty() {
        return Err(Error::Tts("synthesized audio was empty".into()));
    }
    Ok(audio)
}

/// Running thinking animation
///
/// Dropping it stops the animation without waiting for the antenna reset.
pub struct Thinking {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Thinking {
    /// Stop the animation and wait for the antennas to reset
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::debug!(error = %e, "thinking animation task failed");
            }
        }
    }
}

impl Drop for Thinking {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::SimulatedRobot;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<usize>,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, _samples: Vec<f32>, _rate: u32, _stop: &AtomicBool) -> Result<()> {
            *self.played.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct FailingSynthesizer;

    #[async_trait]
    impl Synthesizer for FailingSynthesizer {
        async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
            Err(Error::Tts("quota exceeded".into()))
        }
    }

    fn build(
        synthesizer: Option<Arc<dyn Synthesizer>>,
        robot: Arc<SimulatedRobot>,
        emotions: bool,
    ) -> (Speaker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let speaker = Speaker::new(
            synthesizer,
            sink.clone(),
            robot,
            emotions,
            CancellationToken::new(),
        );
        (speaker, sink)
    }

    #[test]
    fn markdown_is_stripped() {
        assert_eq!(
            clean_for_speech("**Sure!** Run `ls`  *now*"),
            "Sure! Run ls now"
        );
        assert_eq!(clean_for_speech("  ** "), "");
    }

    #[tokio::test]
    async fn without_synthesizer_the_robot_speaks() {
        let robot = Arc::new(SimulatedRobot::new());
        let (speaker, sink) = build(None, robot.clone(), true);
        speaker.speak("Hello *there*").await;

        assert_eq!(robot.calls(), vec!["say Hello there".to_string()]);
        assert_eq!(*sink.played.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn synthesis_failure_falls_back() {
        let robot = Arc::new(SimulatedRobot::new());
        let (speaker, _sink) = build(Some(Arc::new(FailingSynthesizer)), robot.clone(), true);
        speaker.speak("hi").await;
        assert_eq!(robot.calls(), vec!["say hi".to_string()]);
    }

    #[tokio::test]
    async fn emotions_can_be_disabled() {
        let robot = Arc::new(SimulatedRobot::new());
        let (speaker, _) = build(None, robot.clone(), false);
        speaker.emote("sad").await;
        assert!(robot.calls().is_empty());

        let (speaker, _) = build(None, robot.clone(), true);
        speaker.emote("sad").await;
        assert_eq!(robot.calls(), vec!["play_emotion sad".to_string()]);
    }

    #[tokio::test]
    async fn thinking_stops_cleanly() {
        let robot = Arc::new(SimulatedRobot::new());
        let (speaker, _) = build(None, robot.clone(), true);
        let thinking = speaker.thinking();
        tokio::task::yield_now().await;
        thinking.stop().await;
        assert_eq!(robot.status().await.unwrap().antennas, [0.0, 0.0]);
    }
}

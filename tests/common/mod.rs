//! Shared test fakes
//!
//! Audio runs at a 1 kHz sample rate with 100-sample frames so scripted
//! utterances stay small.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use reachy_bridge::config::{AudioConfig, BehaviorConfig, MotionLimits, RobotConfig};
use reachy_bridge::error::TranscriptionError;
use reachy_bridge::gateway::{
    GatewaySession, MemoryConnector, PeerHandle, RetryPolicy, SessionOptions,
};
use reachy_bridge::robot::{ActionExecutor, HeadPose, Robot, RobotStatus, SimulatedRobot};
use reachy_bridge::voice::{
    AudioCapture, AudioInput, AudioSink, FrameSource, Speaker, Synthesizer, Transcriber,
    Transcript, Utterance, WordTiming,
};
use reachy_bridge::{ConversationLoop, Error, LoopOptions, Result};

pub const RATE: u32 = 1000;
pub const FRAME: usize = 100;

/// Capture settings for the scripted audio
pub fn audio_config() -> AudioConfig {
    AudioConfig {
        sample_rate: RATE,
        frame_size: FRAME,
        silence_threshold: 0.1,
        silence_duration: Duration::from_millis(300),
        onset_frames: 2,
        max_recording: Duration::from_secs(2),
    }
}

/// Retry policy that fails fast
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_total_wait: None,
    }
}

/// Loud square wave (RMS 0.5)
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn speech(secs: f32) -> Vec<f32> {
    let count = (secs * RATE as f32) as usize;
    (0..count)
        .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
        .collect()
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn silence(secs: f32) -> Vec<f32> {
    vec![0.0; (secs * RATE as f32) as usize]
}

/// One scripted microphone event
#[derive(Clone)]
pub enum Feed {
    Audio(Vec<f32>),
    /// Hold the stream until notified
    Wait(Arc<Notify>),
    /// Report a device failure
    Fail,
}

/// Split audio into frame-sized feed chunks
pub fn feed(samples: &[f32]) -> Vec<Feed> {
    samples
        .chunks(FRAME)
        .map(|c| Feed::Audio(c.to_vec()))
        .collect()
}

/// Speech followed by enough silence to close the utterance
pub fn utterance_feed(speech_secs: f32) -> Vec<Feed> {
    let mut samples = silence(0.2);
    samples.extend(speech(speech_secs));
    samples.extend(silence(0.5));
    feed(&samples)
}

/// Ordered record of microphone and robot voice events
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until at least `count` entries are recorded
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = self.entries();
                if entries.len() >= count {
                    return entries;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for journal entries")
    }
}

/// Microphone fed from a shared script
///
/// Every opened source reads the same queue, so a reopened microphone
/// continues where the previous one stopped. An empty queue is a quiet
/// microphone. Opens and closes go to the journal as `mic open` and
/// `mic closed`.
#[derive(Clone, Default)]
pub struct ScriptedInput {
    queue: Arc<Mutex<VecDeque<Feed>>>,
    opens: Arc<AtomicUsize>,
    failing_opens: Arc<AtomicUsize>,
    journal: Journal,
}

impl ScriptedInput {
    pub fn new(items: impl IntoIterator<Item = Feed>) -> Self {
        let input = Self::default();
        input.push(items);
        input
    }

    pub fn push(&self, items: impl IntoIterator<Item = Feed>) {
        self.queue.lock().unwrap().extend(items);
    }

    /// Make the next `count` opens fail
    pub fn fail_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl AudioInput for ScriptedInput {
    fn open(&self, _sample_rate: u32) -> Result<Box<dyn FrameSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Device("scripted open failure".into()));
        }
        self.journal.record("mic open");
        Ok(Box::new(ScriptedSource {
            queue: Arc::clone(&self.queue),
            journal: self.journal.clone(),
        }))
    }
}

struct ScriptedSource {
    queue: Arc<Mutex<VecDeque<Feed>>>,
    journal: Journal,
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.journal.record("mic closed");
    }
}

impl ScriptedSource {
    fn front(&self) -> Option<Feed> {
        self.queue.lock().unwrap().front().cloned()
    }

    fn pop(&self) {
        self.queue.lock().unwrap().pop_front();
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_chunk(&mut self) -> Result<Vec<f32>> {
        loop {
            match self.front() {
                None => std::future::pending::<()>().await,
                Some(Feed::Wait(notify)) => {
                    notify.notified().await;
                    self.pop();
                }
                Some(Feed::Audio(samples)) => {
                    self.pop();
                    tokio::task::yield_now().await;
                    return Ok(samples);
                }
                Some(Feed::Fail) => {
                    self.pop();
                    return Err(Error::Device("scripted stream failure".into()));
                }
            }
        }
    }
}

type Scripted = std::result::Result<Transcript, TranscriptionError>;

/// Transcriber returning scripted results in order
///
/// Runs out with `NoSpeech`.
#[derive(Default)]
pub struct FakeTranscriber {
    results: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(results: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Transcriber that hears each text in turn
    pub fn hearing(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(text(t))))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _utterance: &Utterance) -> Scripted {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TranscriptionError::NoSpeech))
    }
}

pub fn text(text: &str) -> Transcript {
    Transcript {
        text: text.to_string(),
        words: Vec::new(),
    }
}

/// Transcript with word timings, one `(word, start, end)` per entry
pub fn timed(words: &[(&str, f64, f64)]) -> Transcript {
    Transcript {
        text: words
            .iter()
            .map(|(w, _, _)| *w)
            .collect::<Vec<_>>()
            .join(" "),
        words: words
            .iter()
            .map(|(w, start, end)| WordTiming {
                word: (*w).to_string(),
                start: *start,
                end: *end,
            })
            .collect(),
    }
}

/// Output device that discards audio
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _samples: Vec<f32>, _rate: u32, _stop: &AtomicBool) -> Result<()> {
        Ok(())
    }
}

/// Three silent MPEG-1 Layer III frames (128 kbps, 44.1 kHz, mono)
pub fn silent_mp3() -> Vec<u8> {
    let mut frame = vec![0u8; 417];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0xC0]);
    frame.repeat(3)
}

/// Synthesizer producing silence
pub struct SilentSynthesizer;

#[async_trait]
impl Synthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str, _voice: Option<&str>) -> Result<Vec<u8>> {
        Ok(silent_mp3())
    }
}

/// Output device that plays until told to stop
#[derive(Default)]
pub struct HoldingSink {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl HoldingSink {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl AudioSink for HoldingSink {
    fn play(&self, _samples: Vec<f32>, _rate: u32, stop: &AtomicBool) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while std::time::Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                self.stopped.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Simulated robot that journals each `say`
pub struct JournalRobot {
    inner: Arc<SimulatedRobot>,
    journal: Journal,
}

#[async_trait]
impl Robot for JournalRobot {
    async fn move_head(&self, pose: HeadPose, duration: f32) -> Result<()> {
        self.inner.move_head(pose, duration).await
    }

    async fn move_antennas(&self, left: f32, right: f32, duration: f32) -> Result<()> {
        self.inner.move_antennas(left, right, duration).await
    }

    async fn play_emotion(&self, name: &str) -> Result<()> {
        self.inner.play_emotion(name).await
    }

    async fn dance(&self, name: &str) -> Result<()> {
        self.inner.dance(name).await
    }

    async fn capture_frame(&self) -> Result<Vec<u8>> {
        self.inner.capture_frame().await
    }

    async fn say(&self, text: &str, voice: Option<&str>) -> Result<()> {
        self.journal.record(format!("say {text}"));
        self.inner.say(text, voice).await
    }

    async fn status(&self) -> Result<RobotStatus> {
        self.inner.status().await
    }
}

/// A conversation loop wired to fakes
pub struct Rig {
    pub robot: Arc<SimulatedRobot>,
    pub input: ScriptedInput,
    pub transcriber: Arc<FakeTranscriber>,
    pub cancel: CancellationToken,
    pub capture_dir: tempfile::TempDir,
    body: Arc<dyn Robot>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    sink: Arc<dyn AudioSink>,
}

impl Rig {
    pub fn new(robot: SimulatedRobot, input: ScriptedInput, transcriber: FakeTranscriber) -> Self {
        let robot = Arc::new(robot);
        let body = Arc::new(JournalRobot {
            inner: Arc::clone(&robot),
            journal: input.journal(),
        });
        Self {
            robot,
            input,
            transcriber: Arc::new(transcriber),
            cancel: CancellationToken::new(),
            capture_dir: tempfile::tempdir().unwrap(),
            body,
            synthesizer: None,
            sink: Arc::new(NullSink),
        }
    }

    /// Speak through `synthesizer` and `sink` instead of the robot voice
    pub fn with_audio_out(
        mut self,
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        self.synthesizer = Some(synthesizer);
        self.sink = sink;
        self
    }

    pub fn journal(&self) -> Journal {
        self.input.journal()
    }

    pub fn robot_config(&self) -> RobotConfig {
        RobotConfig {
            capture_dir: self.capture_dir.path().to_path_buf(),
            head_duration: 1.0,
            antenna_duration: 0.5,
            limits: MotionLimits::default(),
        }
    }

    pub fn speaker(&self) -> Arc<Speaker> {
        Arc::new(Speaker::new(
            self.synthesizer.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.body),
            true,
            self.cancel.child_token(),
        ))
    }

    pub fn executor(&self) -> ActionExecutor {
        ActionExecutor::new(Arc::clone(&self.body), self.speaker(), self.robot_config())
    }

    pub fn conversation(&self, options: LoopOptions) -> ConversationLoop {
        let capture = AudioCapture::new(Arc::new(self.input.clone()), audio_config());
        ConversationLoop::new(
            capture,
            self.transcriber.clone(),
            self.speaker(),
            self.executor(),
            options,
            self.cancel.clone(),
        )
    }

    /// Robot `say` calls, in order
    pub fn spoken(&self) -> Vec<String> {
        self.robot
            .calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("say ").map(str::to_string))
            .collect()
    }
}

/// Loop options with a short reply timeout
pub fn options(reply_timeout: Duration) -> LoopOptions {
    LoopOptions {
        behavior: BehaviorConfig {
            idle_animations: false,
            ..BehaviorConfig::default()
        },
        reply_timeout,
        device_retry: fast_retry(3),
    }
}

pub fn session_options(max_attempts: u32) -> SessionOptions {
    SessionOptions {
        retry: fast_retry(max_attempts),
        ping_interval: Duration::from_secs(30),
    }
}

/// Connect a session over the in-memory transport
pub async fn connect(
    outcomes: Vec<bool>,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> (
    Result<GatewaySession>,
    Arc<MemoryConnector>,
    mpsc::UnboundedReceiver<PeerHandle>,
) {
    let (connector, peers) = MemoryConnector::new(outcomes);
    let connector = Arc::new(connector);
    let session =
        GatewaySession::connect(connector.clone(), session_options(max_attempts), cancel).await;
    (session, connector, peers)
}

/// Next frame the bridge wrote, parsed
pub async fn next_frame(peer: &mut PeerHandle) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(5), peer.from_client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    serde_json::from_str(&text).unwrap()
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<PeerHandle>) -> PeerHandle {
    tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Deliver a frame to the bridge
pub fn deliver(peer: &PeerHandle, frame: &Value) {
    peer.to_client.send(frame.to_string()).unwrap();
}

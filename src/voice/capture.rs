//! Audio capture from microphone
//!
//! `AudioCapture::open` acquires the input device and returns a
//! `CaptureSession` guard. The guard re-frames incoming chunks, runs the
//! segmenter and the optional wake gate, and yields one `Utterance` at a time.
//! Dropping the guard releases the device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, watch};

use super::segmenter::{Segment, Segmenter};
use super::wake_word::{GateDecision, WakeWordGate};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Chunks buffered between the audio callback and the async reader
const CHUNK_QUEUE: usize = 64;

/// One bounded span of speech
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Offset of the first sample from capture open
    pub start: Duration,
    /// Offset just past the last sample
    pub end: Duration,
    /// Wall-clock time of speech onset
    pub started_at: DateTime<Utc>,
}

impl Utterance {
    /// Wrap raw samples with no capture context
    #[must_use]
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        let end = samples_duration(samples.len(), sample_rate);
        Self {
            samples,
            sample_rate,
            start: Duration::ZERO,
            end,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[allow(clippy::cast_precision_loss)]
fn samples_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

/// Stream of raw microphone chunks
#[async_trait]
pub trait FrameSource: Send {
    /// Next chunk of mono samples
    ///
    /// Must be cancel safe.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the input stream failed or closed
    async fn next_chunk(&mut self) -> Result<Vec<f32>>;
}

/// Opens frame sources
pub trait AudioInput: Send + Sync {
    /// Acquire the input device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device cannot be opened
    fn open(&self, sample_rate: u32) -> Result<Box<dyn FrameSource>>;
}

/// Re-frames variable-size chunks into fixed-size frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    size: usize,
    pending: Vec<f32>,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[f32]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Take the next full frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.pending.len() < self.size {
            return None;
        }
        let rest = self.pending.split_off(self.size);
        Some(std::mem::replace(&mut self.pending, rest))
    }
}

type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// Owns the microphone pipeline configuration and wake gate
pub struct AudioCapture {
    input: Arc<dyn AudioInput>,
    config: AudioConfig,
    gate: Option<WakeWordGate>,
    on_wake: Option<WakeCallback>,
    speech: watch::Sender<bool>,
}

impl AudioCapture {
    #[must_use]
    pub fn new(input: Arc<dyn AudioInput>, config: AudioConfig) -> Self {
        let (speech, _) = watch::channel(false);
        Self {
            input,
            config,
            gate: None,
            on_wake: None,
            speech,
        }
    }

    /// Require a wake phrase before each utterance
    #[must_use]
    pub fn with_wake_gate(mut self, gate: WakeWordGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run `callback` whenever the wake phrase matches
    #[must_use]
    pub fn on_wake(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_wake = Some(Arc::new(callback));
        self
    }

    /// True from speech onset until the segment closes
    #[must_use]
    pub fn speech_activity(&self) -> watch::Receiver<bool> {
        self.speech.subscribe()
    }

    #[must_use]
    pub const fn config(&self) -> &AudioConfig {
        &self.config
    }

    #[must_use]
    pub const fn has_wake_gate(&self) -> bool {
        self.gate.is_some()
    }

    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the input device cannot be opened
    pub fn open(&mut self) -> Result<CaptureSession<'_>> {
        let source = self.input.open(self.config.sample_rate)?;
        tracing::debug!(sample_rate = self.config.sample_rate, "microphone opened");

        let framer = FrameBuffer::new(self.config.frame_size);
        let segmenter = Segmenter::new(&self.config);
        Ok(CaptureSession {
            capture: self,
            source,
            framer,
            segmenter,
            pending: None,
            opened_at: Utc::now(),
        })
    }
}

/// Scoped hold on the microphone
///
/// All segmentation state lives here, so `next_utterance` can be dropped
/// mid-await without losing frames already read.
pub struct CaptureSession<'a> {
    capture: &'a mut AudioCapture,
    source: Box<dyn FrameSource>,
    framer: FrameBuffer,
    segmenter: Segmenter,
    pending: Option<Segment>,
    opened_at: DateTime<Utc>,
}

impl CaptureSession<'_> {
    /// Wait for the next utterance
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the input stream drops
    pub async fn next_utterance(&mut self) -> Result<Utterance> {
        let sample_rate = self.capture.config.sample_rate;
        loop {
            if let Some(segment) = &self.pending {
                let decision = match self.capture.gate.as_mut() {
                    None => GateDecision::Pass { offset: 0 },
                    Some(gate) => gate.check(&segment.samples, sample_rate).await,
                };

                let Some(segment) = self.pending.take() else {
                    continue;
                };
                let offset = match decision {
                    GateDecision::Pass { offset } => offset,
                    GateDecision::Woke { offset } => {
                        self.notify_wake();
                        offset
                    }
                    GateDecision::Armed => {
                        self.notify_wake();
                        continue;
                    }
                    GateDecision::Rejected => continue,
                };
                return Ok(self.utterance(segment, offset));
            }

            while let Some(frame) = self.framer.next_frame() {
                let was_speaking = self.segmenter.in_speech();
                if let Some(segment) = self.segmenter.push(&frame) {
                    self.capture.speech.send_replace(false);
                    tracing::debug!(
                        samples = segment.samples.len(),
                        boundary = ?segment.boundary,
                        "speech segment complete"
                    );
                    self.pending = Some(segment);
                    break;
                }
                if !was_speaking && self.segmenter.in_speech() {
                    self.capture.speech.send_replace(true);
                }
            }
            if self.pending.is_some() {
                continue;
            }

            let chunk = self.source.next_chunk().await?;
            self.framer.push(&chunk);
        }
    }

    fn notify_wake(&self) {
        if let Some(callback) = &self.capture.on_wake {
            callback();
        }
    }

    fn utterance(&self, segment: Segment, offset: usize) -> Utterance {
        let sample_rate = self.capture.config.sample_rate;
        let frame_size = self.capture.config.frame_size;
        let offset = offset.min(segment.samples.len());

        let first_sample = usize::try_from(segment.start_frame)
            .unwrap_or(usize::MAX)
            .saturating_mul(frame_size)
            .saturating_add(offset);
        let start = samples_duration(first_sample, sample_rate);

        let samples = if offset == 0 {
            segment.samples
        } else {
            segment.samples[offset..].to_vec()
        };
        let end = start + samples_duration(samples.len(), sample_rate);
        let started_at = self.opened_at
            + chrono::Duration::from_std(start).unwrap_or_else(|_| chrono::Duration::zero());

        tracing::info!(
            duration_ms = (end - start).as_millis(),
            "utterance captured"
        );

        Utterance {
            samples,
            sample_rate,
            start,
            end,
            started_at,
        }
    }
}

impl Drop for CaptureSession<'_> {
    fn drop(&mut self) {
        self.capture.speech.send_replace(false);
        tracing::debug!("microphone released");
    }
}

/// Default cpal input device
pub struct Microphone;

impl AudioInput for Microphone {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(MicrophoneSource::start(sample_rate)?))
    }
}

type Chunk = std::result::Result<Vec<f32>, String>;

/// Live microphone stream
///
/// cpal streams are not `Send`, so the stream lives on its own thread and
/// forwards chunks over a bounded channel. The thread stops when this is
/// dropped.
pub struct MicrophoneSource {
    chunks: mpsc::Receiver<Chunk>,
    _stop: std::sync::mpsc::Sender<()>,
}

impl MicrophoneSource {
    /// Start capturing from the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no suitable input device is available
    pub fn start(sample_rate: u32) -> Result<Self> {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("reachy-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Device(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Blocks until the source is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("capture thread exited".to_string()))??;

        Ok(Self {
            chunks: chunk_rx,
            _stop: stop_tx,
        })
    }
}

#[async_trait]
impl FrameSource for MicrophoneSource {
    async fn next_chunk(&mut self) -> Result<Vec<f32>> {
        match self.chunks.recv().await {
            Some(Ok(chunk)) => Ok(chunk),
            Some(Err(e)) => Err(Error::Device(e)),
            None => Err(Error::Device("input stream closed".to_string())),
        }
    }
}

fn build_input_stream(sample_rate: u32, chunks: mpsc::Sender<Chunk>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .filter(|c| {
            c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Device("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let errors = chunks.clone();
    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                if chunks.try_send(Ok(mono)).is_err() {
                    tracing::warn!("capture queue full, dropping audio");
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = errors.try_send(Err(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

/// Average interleaved channels into mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

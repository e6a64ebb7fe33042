//! Energy-based utterance segmentation
//!
//! Consumes fixed-size frames and reports where speech starts and stops.

use crate::config::AudioConfig;

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    /// Waiting for speech
    Idle,
    /// Loud frames seen, fewer than the onset count
    Onset,
    /// Inside an utterance
    Recording,
}

/// Why a segment closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Trailing silence reached the configured duration
    Silence,
    /// The maximum recording length was hit
    MaxDuration,
}

/// A closed speech segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub samples: Vec<f32>,
    /// Index of the first frame, counted from capture open
    pub start_frame: u64,
    /// Index one past the last frame
    pub end_frame: u64,
    pub boundary: Boundary,
}

/// Finds utterance boundaries in a frame sequence
#[derive(Debug)]
pub struct Segmenter {
    threshold: f32,
    onset_frames: usize,
    trailing_frames: usize,
    max_frames: usize,

    state: SegmenterState,
    samples: Vec<f32>,
    frames: usize,
    loud_run: usize,
    quiet_run: usize,
    start_frame: u64,
    next_frame: u64,
}

impl Segmenter {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            threshold: config.silence_threshold,
            onset_frames: config.onset_frames.max(1),
            trailing_frames: config.trailing_silence_frames(),
            max_frames: config.max_frames(),
            state: SegmenterState::Idle,
            samples: Vec::new(),
            frames: 0,
            loud_run: 0,
            quiet_run: 0,
            start_frame: 0,
            next_frame: 0,
        }
    }

    /// Feed one frame; returns a segment when a boundary is reached
    pub fn push(&mut self, frame: &[f32]) -> Option<Segment> {
        let index = self.next_frame;
        self.next_frame += 1;

        let energy = calculate_energy(frame);
        let loud = energy > self.threshold;

        match self.state {
            SegmenterState::Idle => {
                if loud {
                    self.begin(frame, index);
                    if self.onset_frames == 1 {
                        self.state = SegmenterState::Recording;
                        tracing::debug!(energy, frame = index, "speech onset");
                    }
                }
                None
            }
            SegmenterState::Onset => {
                if loud {
                    self.append(frame);
                    self.loud_run += 1;
                    if self.loud_run >= self.onset_frames {
                        self.state = SegmenterState::Recording;
                        tracing::debug!(energy, frame = self.start_frame, "speech onset");
                    }
                } else {
                    // Burst too short to count as speech
                    tracing::trace!(frames = self.frames, "discarding short burst");
                    self.reset();
                }
                None
            }
            SegmenterState::Recording => {
                self.append(frame);
                if loud {
                    self.quiet_run = 0;
                } else {
                    self.quiet_run += 1;
                }

                tracing::trace!(
                    frames = self.frames,
                    quiet = self.quiet_run,
                    energy,
                    "recording"
                );

                if self.quiet_run >= self.trailing_frames {
                    Some(self.close(Boundary::Silence))
                } else if self.frames >= self.max_frames {
                    tracing::debug!(frames = self.frames, "max recording length reached");
                    Some(self.close(Boundary::MaxDuration))
                } else {
                    None
                }
            }
        }
    }

    /// Whether an utterance is being recorded
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.state == SegmenterState::Recording
    }

    #[must_use]
    pub const fn state(&self) -> SegmenterState {
        self.state
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.state = SegmenterState::Idle;
        self.samples.clear();
        self.frames = 0;
        self.loud_run = 0;
        self.quiet_run = 0;
    }

    fn begin(&mut self, frame: &[f32], index: u64) {
        self.state = SegmenterState::Onset;
        self.samples.clear();
        self.samples.extend_from_slice(frame);
        self.frames = 1;
        self.loud_run = 1;
        self.quiet_run = 0;
        self.start_frame = index;
    }

    fn append(&mut self, frame: &[f32]) {
        self.samples.extend_from_slice(frame);
        self.frames += 1;
    }

    fn close(&mut self, boundary: Boundary) -> Segment {
        let segment = Segment {
            samples: std::mem::take(&mut self.samples),
            start_frame: self.start_frame,
            end_frame: self.next_frame,
            boundary,
        };
        self.reset();
        segment
    }
}

/// Whether any frame of `samples` rises above `threshold`
#[must_use]
pub fn contains_speech(samples: &[f32], frame_size: usize, threshold: f32) -> bool {
    samples
        .chunks(frame_size.max(1))
        .any(|frame| calculate_energy(frame) > threshold)
}

//! Voice processing module
//!
//! Microphone capture with silence segmentation and wake word gating,
//! pluggable speech-to-text and text-to-speech, and speaker playback.

pub mod capture;
pub mod playback;
pub mod segmenter;
pub mod speaker;
pub mod stt;
pub mod tts;
pub mod wake_word;

pub use capture::{
    AudioCapture, AudioInput, CaptureSession, FrameSource, Microphone, SAMPLE_RATE, Utterance,
    samples_to_wav,
};
pub use playback::{AudioPlayback, AudioSink, PLAYBACK_SAMPLE_RATE, decode_mp3, sine_tone};
pub use segmenter::{Boundary, Segment, Segmenter, SegmenterState, calculate_energy};
pub use speaker::{Speaker, Thinking};
pub use stt::{Transcriber, Transcript, WordTiming};
pub use tts::Synthesizer;
pub use wake_word::{GateDecision, TranscriptSpotter, WakePhraseSpotter, WakeWordGate};

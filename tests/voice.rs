//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reachy_bridge::voice::{
    AudioCapture, Boundary, SAMPLE_RATE, Segmenter, SegmenterState, TranscriptSpotter,
    WakeWordGate, samples_to_wav,
};

mod common;

use common::{
    FRAME, FakeTranscriber, Feed, ScriptedInput, audio_config, feed, silence, speech, timed,
};

fn close_to(actual: Duration, secs: f64) -> bool {
    (actual.as_secs_f64() - secs).abs() < 1e-6
}

fn gated_capture(
    input: ScriptedInput,
    transcriber: FakeTranscriber,
    wakes: Arc<AtomicUsize>,
) -> AudioCapture {
    let spotter = Arc::new(TranscriptSpotter::new(Arc::new(transcriber)));
    let gate = WakeWordGate::new("Hey Robot", spotter, false, FRAME, 0.1);
    AudioCapture::new(Arc::new(input), audio_config())
        .with_wake_gate(gate)
        .on_wake(move || {
            wakes.fetch_add(1, Ordering::SeqCst);
        })
}

#[test]
fn segmenter_closes_on_trailing_silence() {
    let mut segmenter = Segmenter::new(&audio_config());
    let mut samples = silence(0.2);
    samples.extend(speech(0.5));
    samples.extend(silence(0.5));

    let segments: Vec<_> = samples
        .chunks(FRAME)
        .filter_map(|frame| segmenter.push(frame))
        .collect();

    assert_eq!(segments.len(), 1);
    let segment = &segments[0];
    assert_eq!(segment.boundary, Boundary::Silence);
    assert_eq!(segment.start_frame, 2);
    // Five speech frames plus three trailing silent frames
    assert_eq!(segment.samples.len(), 800);
    assert_eq!(segmenter.state(), SegmenterState::Idle);
}

#[test]
fn segmenter_caps_long_speech() {
    let mut segmenter = Segmenter::new(&audio_config());
    let segment = speech(3.0)
        .chunks(FRAME)
        .find_map(|frame| segmenter.push(frame))
        .unwrap();

    assert_eq!(segment.boundary, Boundary::MaxDuration);
    assert_eq!(segment.samples.len(), 2000);
}

#[test]
fn short_bursts_are_not_speech() {
    let mut segmenter = Segmenter::new(&audio_config());
    let mut samples = speech(0.1);
    samples.extend(silence(1.0));

    assert!(samples.chunks(FRAME).all(|f| segmenter.push(f).is_none()));
    assert!(!segmenter.in_speech());
}

#[tokio::test]
async fn capture_yields_one_utterance_without_leading_silence() {
    let input = ScriptedInput::new(common::utterance_feed(0.5));
    let mut capture = AudioCapture::new(Arc::new(input), audio_config());
    let mut speech_activity = capture.speech_activity();
    let mut mic = capture.open().unwrap();

    let utterance = mic.next_utterance().await.unwrap();
    assert_eq!(utterance.sample_rate, 1000);
    assert_eq!(utterance.samples.len(), 800);
    assert!(close_to(utterance.start, 0.2));
    assert!(close_to(utterance.end, 1.0));
    assert!(utterance.samples[..500].iter().all(|s| s.abs() > 0.0));

    // The remaining silence holds no second utterance
    let next = tokio::time::timeout(Duration::from_millis(100), mic.next_utterance()).await;
    assert!(next.is_err());

    drop(mic);
    assert!(!*speech_activity.borrow_and_update());
}

#[tokio::test]
async fn speech_without_wake_phrase_is_ignored() {
    let input = ScriptedInput::new(common::utterance_feed(0.5));
    let transcriber = FakeTranscriber::hearing(&["hello"]);
    let wakes = Arc::new(AtomicUsize::new(0));
    let mut capture = gated_capture(input, transcriber, wakes.clone());
    let mut mic = capture.open().unwrap();

    let next = tokio::time::timeout(Duration::from_millis(200), mic.next_utterance()).await;
    assert!(next.is_err(), "no utterance without the wake phrase");
    assert_eq!(wakes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wake_phrase_is_cut_from_the_utterance() {
    let input = ScriptedInput::new(common::utterance_feed(1.0));
    let transcriber = FakeTranscriber::new([Ok(timed(&[
        ("Hey", 0.0, 0.2),
        ("robot,", 0.2, 0.4),
        ("hello", 0.5, 0.9),
    ]))]);
    let wakes = Arc::new(AtomicUsize::new(0));
    let mut capture = gated_capture(input, transcriber, wakes.clone());
    let mut mic = capture.open().unwrap();

    let utterance = mic.next_utterance().await.unwrap();
    // Segment is 10 speech frames plus 3 silent ones; the phrase ends 400 samples in
    assert_eq!(utterance.samples.len(), 900);
    assert!(close_to(utterance.start, 0.6));
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wake_phrase_alone_arms_the_next_segment() {
    let mut items = common::utterance_feed(0.5);
    items.extend(common::utterance_feed(0.7));
    let input = ScriptedInput::new(items);
    let transcriber = Arc::new(FakeTranscriber::new([Ok(timed(&[
        ("hey", 0.0, 0.2),
        ("robot", 0.2, 0.5),
    ]))]));

    let spotter = Arc::new(TranscriptSpotter::new(transcriber.clone()));
    let gate = WakeWordGate::new("hey robot", spotter, false, FRAME, 0.1);
    let wakes = Arc::new(AtomicUsize::new(0));
    let counter = wakes.clone();
    let mut capture = AudioCapture::new(Arc::new(input), audio_config())
        .with_wake_gate(gate)
        .on_wake(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let mut mic = capture.open().unwrap();

    let utterance = mic.next_utterance().await.unwrap();
    // Whole second segment: 7 speech frames plus 3 silent ones
    assert_eq!(utterance.samples.len(), 1000);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    // The armed segment is not checked for the phrase
    assert_eq!(transcriber.calls(), 1);
}

#[tokio::test]
async fn reopening_discards_partial_speech() {
    let resume = Arc::new(tokio::sync::Notify::new());
    let mut items = feed(&speech(0.3));
    items.push(Feed::Wait(resume.clone()));
    items.extend(common::utterance_feed(0.4));
    let input = ScriptedInput::new(items);
    let mut capture = AudioCapture::new(Arc::new(input.clone()), audio_config());

    // Read part of the first burst, then close as if a tool had to run
    let mut mic = capture.open().unwrap();
    let partial = tokio::time::timeout(Duration::from_millis(50), mic.next_utterance()).await;
    assert!(partial.is_err());
    drop(mic);
    assert!(!*capture.speech_activity().borrow());

    let mut mic = capture.open().unwrap();
    resume.notify_one();
    let utterance = mic.next_utterance().await.unwrap();
    assert_eq!(utterance.samples.len(), 700);
    assert_eq!(input.opens(), 2);
}

#[test]
fn wav_encoding_roundtrip() {
    let samples: Vec<f32> = speech(0.1).iter().map(|s| s * 0.5).collect();
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);

    let decoded: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(decoded.len(), samples.len());
    assert_eq!(decoded[0], 8191);
    assert_eq!(decoded[1], -8191);
}

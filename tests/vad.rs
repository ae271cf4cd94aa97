//! Voice activity detection integration tests
//!
//! Runs synthetic audio through frame assembly and the detector

use std::time::Duration;

use voiceturn::vad::{
    Environment, VadConfig, VadParams, VadResult, VoiceActivityDetector, auto_detect_environment,
};
use voiceturn::voice::{FRAME_SIZE, FrameAssembler, SAMPLE_RATE};

mod common;

use common::{sine_samples, square_frame};

/// Assemble `samples` into frames and classify each one
fn classify(vad: &mut VoiceActivityDetector, samples: &[f32]) -> Vec<VadResult> {
    let mut assembler = FrameAssembler::new(FRAME_SIZE, SAMPLE_RATE);
    let mut results = Vec::new();
    // Feed in uneven callback-sized pieces, as a device would
    for piece in samples.chunks(441) {
        assembler.push(piece, |frame| results.push(vad.process(&frame)));
    }
    results
}

fn detector(environment: Environment) -> VoiceActivityDetector {
    VoiceActivityDetector::new(VadConfig::new(environment)).unwrap()
}

fn frames(level: f32, count: usize, start: usize) -> Vec<voiceturn::AudioFrame> {
    (start..start + count)
        .map(|i| square_frame(level, Duration::from_millis(32 * i as u64)))
        .collect()
}

#[test]
fn speech_confirmed_on_tenth_moderate_frame() {
    let mut vad = detector(Environment::Moderate);
    assert_eq!(vad.min_speech_frames(), 10);

    let results: Vec<bool> = frames(0.2, 12, 0)
        .iter()
        .map(|f| vad.process(f).is_speech)
        .collect();

    assert!(results[..9].iter().all(|s| !s));
    assert!(results[9..].iter().all(|s| *s));
}

#[test]
fn noisy_preset_needs_longer_speech() {
    let mut vad = detector(Environment::Noisy);
    assert_eq!(vad.min_speech_frames(), 13);

    let confirmed_at = frames(0.2, 20, 0)
        .iter()
        .position(|f| vad.process(f).is_speech);

    assert_eq!(confirmed_at, Some(12));
}

#[test]
fn short_burst_is_not_speech() {
    let mut vad = detector(Environment::Quiet);

    let mut stream = frames(0.3, 4, 0);
    stream.extend(frames(0.0, 20, 4));

    assert!(stream.iter().all(|f| !vad.process(f).is_speech));
}

#[test]
fn pause_inside_utterance_is_tolerated() {
    let mut vad = detector(Environment::Moderate);
    let max_silence = vad.params().max_silence_frames as usize;

    for frame in frames(0.2, 12, 0) {
        vad.process(&frame);
    }
    // A breath shorter than the tolerance keeps the utterance open
    for frame in frames(0.0, max_silence, 12) {
        assert!(vad.process(&frame).is_speech);
    }
    assert!(vad.process(&square_frame(0.2, Duration::from_secs(2))).is_speech);
}

#[test]
fn utterance_closes_once_silence_exceeds_tolerance() {
    let mut vad = detector(Environment::Moderate);
    let max_silence = vad.params().max_silence_frames as usize;

    for frame in frames(0.2, 12, 0) {
        vad.process(&frame);
    }
    let results: Vec<VadResult> = frames(0.0, max_silence + 1, 12)
        .iter()
        .map(|f| vad.process(f))
        .collect();

    let ends: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.end_of_speech)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(ends, vec![max_silence]);
    assert!(!results[max_silence].is_speech);
}

#[test]
fn spoken_sentence_through_assembler() {
    let mut vad = detector(Environment::Moderate);

    let mut audio = sine_samples(220.0, 0.5, 0.0);
    audio.extend(sine_samples(220.0, 1.0, 0.3));
    audio.extend(sine_samples(220.0, 1.5, 0.0));

    let results = classify(&mut vad, &audio);

    let first_speech = results.iter().position(|r| r.is_speech).unwrap();
    let end = results.iter().position(|r| r.end_of_speech).unwrap();
    // Half a second of lead-in plus the confirmation delay
    assert!(results[first_speech].timestamp >= Duration::from_millis(500 + 9 * 32 - 32));
    assert!(end > first_speech);
    assert!(!results.last().unwrap().is_speech);

    // Timestamps advance by exactly one frame
    for pair in results.windows(2) {
        assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::from_millis(32));
    }
}

#[test]
fn calibration_chooses_environment_from_ambient_level() {
    for (level, expected) in [
        (0.004, Environment::Quiet),
        (0.012, Environment::Moderate),
        (0.03, Environment::Noisy),
    ] {
        let mut vad = detector(Environment::Auto);
        let ambient: Vec<f32> = frames(level, 32, 0)
            .iter()
            .flat_map(|f| f.samples().to_vec())
            .collect();

        let profile = vad.calibrate(&ambient).unwrap();

        assert_eq!(profile.environment, expected, "level {level}");
        assert_eq!(auto_detect_environment(level), expected);
        assert_eq!(*vad.params(), VadParams::for_environment(expected));
    }
}

#[test]
fn calibrated_floor_raises_threshold_in_noise() {
    let mut vad = detector(Environment::Noisy);
    let ambient: Vec<f32> = frames(0.02, 32, 0)
        .iter()
        .flat_map(|f| f.samples().to_vec())
        .collect();
    vad.calibrate(&ambient).unwrap();

    // Threshold is noise floor times the noisy multiplier
    assert!((vad.threshold() - 0.06).abs() < 1e-3);

    // Background chatter at the calibrated level never confirms
    assert!(frames(0.02, 40, 0).iter().all(|f| !vad.process(f).is_speech));
}

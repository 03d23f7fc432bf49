//! Per-session speech/silence state machine.
//!
//! The gate consumes one 512-sample frame plus its speech probability per
//! step and demarcates utterances: hysteresis between `threshold_on` and
//! `threshold_off` keeps borderline frames from flapping the state, pre-roll
//! recovers the consonant that precedes the detector's trigger, and hangover
//! keeps trailing fricatives. Probabilities come from the caller so the gate
//! itself stays model-free.

use crate::frame_assembler::FRAME_SAMPLES;
use crate::ring_buffer::{Mark, SampleRing};
use crate::session::SessionId;
use crate::utterance::{Utterance, UtteranceBuilder};
use crate::SAMPLE_RATE;

/// Voice activity states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    PossibleSpeech,
    Speech,
    PossibleSilence,
}

#[derive(Debug, Clone)]
pub struct VadGateConfig {
    /// Probability at or above which a frame counts toward speech onset.
    pub threshold_on: f32,
    /// Probability below which a speech frame counts toward silence.
    pub threshold_off: f32,
    /// Consecutive qualifying frames before speech is confirmed.
    pub min_speech_frames: usize,
    /// Consecutive sub-threshold frames before an utterance is sealed.
    pub hangover_frames: usize,
    /// Samples of context prepended before the confirmed onset.
    pub pre_roll_samples: usize,
    /// Hard utterance cap in samples.
    pub max_utterance_samples: usize,
}

impl Default for VadGateConfig {
    fn default() -> Self {
        Self {
            threshold_on: 0.5,
            threshold_off: 0.35,
            min_speech_frames: 2,
            hangover_frames: 16,                   // ~512 ms
            pre_roll_samples: SAMPLE_RATE * 512 / 1000, // 512 ms
            max_utterance_samples: 30 * SAMPLE_RATE,
        }
    }
}

#[derive(Debug)]
pub enum GateEvent {
    SpeechStart { time: f64 },
    SpeechEnd { utterance: Utterance },
}

pub struct VadGate {
    config: VadGateConfig,
    ring: SampleRing,
    builder: UtteranceBuilder,
    state: VadState,
    frames_in_state: usize,
    /// Absolute sample position where the candidate utterance starts
    /// (onset minus pre-roll), taken when `PossibleSpeech` is entered.
    candidate: Option<Mark>,
    samples_seen: u64,
}

impl VadGate {
    pub fn new(session: SessionId, config: VadGateConfig) -> Self {
        // Pre-roll plus hangover plus a frame, with room for the onset
        // frames still unconfirmed.
        let ring_capacity = config.pre_roll_samples
            + (config.hangover_frames + config.min_speech_frames + 1) * FRAME_SAMPLES;
        let max_samples = config.max_utterance_samples
            + config.pre_roll_samples
            + config.hangover_frames * FRAME_SAMPLES;
        Self {
            ring: SampleRing::new(ring_capacity),
            builder: UtteranceBuilder::new(session, max_samples),
            config,
            state: VadState::Silence,
            frames_in_state: 0,
            candidate: None,
            samples_seen: 0,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::PossibleSilence)
    }

    /// Stream time in seconds of the samples observed so far.
    pub fn stream_time(&self) -> f64 {
        self.samples_seen as f64 / SAMPLE_RATE as f64
    }

    /// Feeds one frame and its speech probability. Returns at most one event.
    pub fn observe(&mut self, frame: &[f32; FRAME_SAMPLES], prob: f32) -> Option<GateEvent> {
        let head_before = self.ring.head();
        self.ring.append(frame);
        self.samples_seen += FRAME_SAMPLES as u64;

        match self.state {
            VadState::Silence => {
                if prob >= self.config.threshold_on {
                    self.state = VadState::PossibleSpeech;
                    self.frames_in_state = 1;
                    let start =
                        head_before.saturating_sub(self.config.pre_roll_samples as u64);
                    self.candidate = Some(Mark(start));
                    self.maybe_confirm_speech()
                } else {
                    None
                }
            }
            VadState::PossibleSpeech => {
                if prob >= self.config.threshold_on {
                    self.frames_in_state += 1;
                    self.maybe_confirm_speech()
                } else {
                    // The onset run must be consecutive; one miss resets it.
                    self.state = VadState::Silence;
                    self.frames_in_state = 0;
                    self.candidate = None;
                    None
                }
            }
            VadState::Speech => {
                self.builder.append(frame);
                if prob < self.config.threshold_off {
                    self.state = VadState::PossibleSilence;
                    self.frames_in_state = 1;
                }
                self.seal_if_full()
            }
            VadState::PossibleSilence => {
                self.builder.append(frame);
                if prob < self.config.threshold_off {
                    self.frames_in_state += 1;
                    if self.frames_in_state >= self.config.hangover_frames {
                        return Some(self.seal());
                    }
                    self.seal_if_full()
                } else {
                    self.state = VadState::Speech;
                    self.frames_in_state = 0;
                    self.seal_if_full()
                }
            }
        }
    }

    /// Seals any in-progress utterance, as when the client signals end-mark
    /// or closes the socket mid-speech.
    pub fn flush(&mut self) -> Option<GateEvent> {
        if self.is_speaking() && !self.builder.is_empty() {
            Some(self.seal())
        } else {
            self.reset_to_silence();
            None
        }
    }

    fn maybe_confirm_speech(&mut self) -> Option<GateEvent> {
        if self.frames_in_state < self.config.min_speech_frames {
            return None;
        }
        let mark = self.candidate.take()?;
        // If the mark got overwritten (tiny pre-roll config), fall back to
        // everything the ring still holds.
        let seed = self.ring.since(mark).unwrap_or_else(|_| {
            let available = (self.ring.head() - self.ring.oldest()) as usize;
            self.ring.tail(available).unwrap_or_default()
        });
        let start_time = mark.0 as f64 / SAMPLE_RATE as f64;
        self.builder.begin(seed, start_time);
        self.state = VadState::Speech;
        self.frames_in_state = 0;
        Some(GateEvent::SpeechStart {
            time: self.stream_time(),
        })
    }

    fn seal_if_full(&mut self) -> Option<GateEvent> {
        if self.builder.is_full() {
            Some(self.seal())
        } else {
            None
        }
    }

    fn seal(&mut self) -> GateEvent {
        let utterance = self.builder.seal(self.stream_time());
        self.reset_to_silence();
        GateEvent::SpeechEnd { utterance }
    }

    fn reset_to_silence(&mut self) {
        self.state = VadState::Silence;
        self.frames_in_state = 0;
        self.candidate = None;
        self.builder.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(config: VadGateConfig) -> VadGate {
        VadGate::new(SessionId(1), config)
    }

    fn small_config() -> VadGateConfig {
        VadGateConfig {
            threshold_on: 0.5,
            threshold_off: 0.35,
            min_speech_frames: 2,
            hangover_frames: 3,
            pre_roll_samples: FRAME_SAMPLES, // one frame of pre-roll
            max_utterance_samples: 20 * FRAME_SAMPLES,
        }
    }

    fn feed(g: &mut VadGate, prob: f32, value: f32) -> Option<GateEvent> {
        g.observe(&[value; FRAME_SAMPLES], prob)
    }

    #[test]
    fn silence_stream_emits_nothing() {
        let mut g = gate(small_config());
        for _ in 0..200 {
            assert!(feed(&mut g, 0.0, 0.0).is_none());
        }
        assert_eq!(g.state(), VadState::Silence);
    }

    #[test]
    fn start_requires_consecutive_frames() {
        let mut g = gate(small_config());
        // One hot frame followed by a cold one aborts the candidate.
        assert!(feed(&mut g, 0.9, 0.1).is_none());
        assert!(feed(&mut g, 0.1, 0.0).is_none());
        assert_eq!(g.state(), VadState::Silence);

        // Two consecutive hot frames confirm.
        assert!(feed(&mut g, 0.9, 0.1).is_none());
        let ev = feed(&mut g, 0.9, 0.2);
        assert!(matches!(ev, Some(GateEvent::SpeechStart { .. })));
        assert_eq!(g.state(), VadState::Speech);
    }

    #[test]
    fn every_start_is_followed_by_one_end() {
        // Property: for an arbitrary probability stream, starts and ends
        // strictly alternate, starting with a start.
        let mut g = gate(small_config());
        let probs: Vec<f32> = (0..500)
            .map(|i| ((i * 7919 + 13) % 100) as f32 / 100.0)
            .collect();
        let mut expect_start = true;
        for p in probs {
            match feed(&mut g, p, 0.1) {
                Some(GateEvent::SpeechStart { .. }) => {
                    assert!(expect_start, "start without intervening end");
                    expect_start = false;
                }
                Some(GateEvent::SpeechEnd { .. }) => {
                    assert!(!expect_start, "end without preceding start");
                    expect_start = true;
                }
                None => {}
            }
        }
        if let Some(GateEvent::SpeechEnd { .. }) = g.flush() {
            assert!(!expect_start);
        }
    }

    #[test]
    fn utterance_includes_pre_roll_and_hangover() {
        let cfg = small_config();
        let mut g = gate(cfg.clone());

        // Fill pre-roll context with distinguishable silence.
        for _ in 0..4 {
            assert!(feed(&mut g, 0.0, 0.25).is_none());
        }
        // Speech: 6 hot frames.
        for i in 0..6 {
            let ev = feed(&mut g, 0.9, 1.0);
            if i == 1 {
                assert!(matches!(ev, Some(GateEvent::SpeechStart { .. })));
            } else {
                assert!(ev.is_none());
            }
        }
        // Hangover: 3 cold frames seal it.
        assert!(feed(&mut g, 0.1, 0.0).is_none());
        assert!(feed(&mut g, 0.1, 0.0).is_none());
        let ev = feed(&mut g, 0.1, 0.0);
        let Some(GateEvent::SpeechEnd { utterance }) = ev else {
            panic!("expected seal after hangover");
        };

        // pre-roll (1 frame) + 6 speech + 3 hangover frames.
        assert_eq!(utterance.samples.len(), 10 * FRAME_SAMPLES);
        // The seed starts with the pre-roll frame of 0.25s.
        assert_eq!(utterance.samples[0], 0.25);
        // The tail is hangover silence.
        assert_eq!(*utterance.samples.last().unwrap(), 0.0);
        assert_eq!(utterance.seq, 0);
    }

    #[test]
    fn sealed_length_stays_within_bounds() {
        let cfg = small_config();
        let min = cfg.min_speech_frames * FRAME_SAMPLES;
        let max = cfg.max_utterance_samples
            + cfg.pre_roll_samples
            + cfg.hangover_frames * FRAME_SAMPLES;
        let mut g = gate(cfg);
        let probs: Vec<f32> = (0..2000)
            .map(|i| ((i * 31 + 7) % 97) as f32 / 97.0)
            .collect();
        for p in probs {
            if let Some(GateEvent::SpeechEnd { utterance }) = feed(&mut g, p, 0.1) {
                assert!(utterance.samples.len() >= min);
                assert!(utterance.samples.len() <= max);
            }
        }
    }

    #[test]
    fn dip_below_off_shorter_than_hangover_continues_speech() {
        let mut g = gate(small_config());
        feed(&mut g, 0.9, 0.1);
        feed(&mut g, 0.9, 0.1);
        assert_eq!(g.state(), VadState::Speech);

        // Two cold frames (hangover is 3), then hot again.
        feed(&mut g, 0.1, 0.0);
        feed(&mut g, 0.1, 0.0);
        assert_eq!(g.state(), VadState::PossibleSilence);
        assert!(feed(&mut g, 0.6, 0.1).is_none());
        assert_eq!(g.state(), VadState::Speech);
    }

    #[test]
    fn dead_zone_probability_does_not_end_speech() {
        // Between threshold_off and threshold_on the gate holds its state.
        let mut g = gate(small_config());
        feed(&mut g, 0.9, 0.1);
        feed(&mut g, 0.9, 0.1);
        for _ in 0..50 {
            assert!(feed(&mut g, 0.4, 0.1).is_none());
            assert_eq!(g.state(), VadState::Speech);
        }
    }

    #[test]
    fn max_duration_seals_mid_speech() {
        let cfg = small_config(); // cap at 20 frames of utterance + margins
        let cap = cfg.max_utterance_samples + cfg.pre_roll_samples
            + cfg.hangover_frames * FRAME_SAMPLES;
        let mut g = gate(cfg);
        let mut sealed = None;
        for _ in 0..100 {
            if let Some(GateEvent::SpeechEnd { utterance }) = feed(&mut g, 0.95, 0.5) {
                sealed = Some(utterance);
                break;
            }
        }
        let utterance = sealed.expect("cap should have sealed the utterance");
        assert_eq!(utterance.samples.len(), cap);
        assert_eq!(g.state(), VadState::Silence);
    }

    #[test]
    fn flush_seals_active_utterance() {
        let mut g = gate(small_config());
        feed(&mut g, 0.9, 0.3);
        feed(&mut g, 0.9, 0.3);
        feed(&mut g, 0.9, 0.3);
        let Some(GateEvent::SpeechEnd { utterance }) = g.flush() else {
            panic!("flush mid-speech should seal");
        };
        assert!(utterance.samples.len() >= 3 * FRAME_SAMPLES);
        // Nothing left to flush.
        assert!(g.flush().is_none());
    }
}

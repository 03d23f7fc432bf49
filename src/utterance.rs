//! The utterance being accumulated by a session, and its sealed form.

use std::sync::Arc;

use crate::session::SessionId;

/// A sealed, immutable speech segment ready for transcription and audit.
///
/// Samples are shared rather than cloned because every utterance travels to
/// two consumers (the worker pool and the audio logger).
#[derive(Debug, Clone)]
pub struct Utterance {
    pub session: SessionId,
    /// Per-session seal order, starting at 0.
    pub seq: u64,
    pub samples: Arc<[f32]>,
    /// Stream time of the first sample, in seconds.
    pub start_time: f64,
    /// Stream time one past the last sample, in seconds.
    pub end_time: f64,
}

impl Utterance {
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / crate::SAMPLE_RATE as f64
    }
}

/// Accumulates the active utterance between `speech_start` and `speech_end`.
///
/// The cap is a hard bound: appends beyond it are discarded, and the caller
/// is expected to seal once [`is_full`](Self::is_full) reports true.
pub struct UtteranceBuilder {
    session: SessionId,
    next_seq: u64,
    samples: Vec<f32>,
    start_time: f64,
    max_samples: usize,
}

impl UtteranceBuilder {
    pub fn new(session: SessionId, max_samples: usize) -> Self {
        Self {
            session,
            next_seq: 0,
            samples: Vec::new(),
            start_time: 0.0,
            max_samples,
        }
    }

    /// Begins a new utterance with the pre-roll (and trigger frames) already
    /// captured from the ring.
    pub fn begin(&mut self, seed: Vec<f32>, start_time: f64) {
        self.samples = seed;
        self.samples.truncate(self.max_samples);
        self.start_time = start_time;
    }

    pub fn append(&mut self, frame: &[f32]) {
        let room = self.max_samples - self.samples.len();
        self.samples.extend_from_slice(&frame[..frame.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.max_samples
    }

    /// Seals the accumulated samples into an immutable [`Utterance`].
    pub fn seal(&mut self, end_time: f64) -> Utterance {
        let seq = self.next_seq;
        self.next_seq += 1;
        Utterance {
            session: self.session,
            seq,
            samples: std::mem::take(&mut self.samples).into(),
            start_time: self.start_time,
            end_time,
        }
    }

    /// Drops the accumulated samples without sealing (aborted utterance).
    pub fn discard(&mut self) {
        self.samples.clear();
    }
}

//! Turns the transport's arbitrarily-sized byte chunks into fixed 512-sample
//! float frames.
//!
//! The wire contract guarantees an even total byte count per connection but
//! not per chunk, so the assembler carries at most one byte and at most one
//! frame's worth of samples between calls.

use crate::protocol::WireError;

/// Samples per assembled frame (the VAD's native frame size).
pub const FRAME_SAMPLES: usize = 512;

#[derive(Default)]
pub struct FrameAssembler {
    carry_byte: Option<u8>,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns every complete frame it yields,
    /// in arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<[f32; FRAME_SAMPLES]> {
        let mut frames = Vec::new();
        let mut bytes = chunk;

        if let Some(lo) = self.carry_byte.take() {
            if let Some((&hi, rest)) = bytes.split_first() {
                self.pending.push(decode(lo, hi));
                bytes = rest;
            } else {
                self.carry_byte = Some(lo);
                return frames;
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.pending.push(decode(pair[0], pair[1]));
            if self.pending.len() == FRAME_SAMPLES {
                let mut frame = [0.0f32; FRAME_SAMPLES];
                frame.copy_from_slice(&self.pending);
                self.pending.clear();
                frames.push(frame);
            }
        }
        if let [lo] = pairs.remainder() {
            self.carry_byte = Some(*lo);
        }

        frames
    }

    /// Number of decoded samples waiting for the frame to fill.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Drains the partial frame at end of stream, zero-padded to a full
    /// frame so the tail of an utterance still reaches the VAD. Returns
    /// `OddByteCount` if the transport left a dangling byte (the byte is
    /// dropped either way).
    pub fn finish(&mut self) -> (Option<[f32; FRAME_SAMPLES]>, Result<(), WireError>) {
        let status = if self.carry_byte.take().is_some() {
            Err(WireError::OddByteCount)
        } else {
            Ok(())
        };

        if self.pending.is_empty() {
            return (None, status);
        }
        let mut frame = [0.0f32; FRAME_SAMPLES];
        frame[..self.pending.len()].copy_from_slice(&self.pending);
        self.pending.clear();
        (Some(frame), status)
    }
}

fn decode(lo: u8, hi: u8) -> f32 {
    (f32::from(i16::from_le_bytes([lo, hi])) / 32768.0).clamp(-1.0, 1.0)
}

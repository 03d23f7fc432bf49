//! Per-connection supervisor.
//!
//! One task per socket, owning the frame assembler, VAD gate, ring and
//! utterance buffers exclusively. The transport itself stays in `server`;
//! the supervisor speaks through an inbound event channel and an outbound
//! message channel, which is also what the integration tests drive.
//!
//! State machine: `handshake → listening ⇄ speaking → closed`, with a
//! shadow `transcribing` phase after each `speech_end` during which the gate
//! is already back in silence and further audio is accepted.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio_logger::AudioLogHandle;
use crate::backend::{TranscribeRequest, VadEngine, VadStream};
use crate::dispatcher::{SubmitError, TranscriptionPool};
use crate::frame_assembler::{FrameAssembler, FRAME_SAMPLES};
use crate::protocol::{
    is_end_mark, ErrorKind, Hello, RecognitionPayload, ServerMessage, WireError,
};
use crate::vad_gate::{GateEvent, VadGate, VadGateConfig};

/// Monotonically increasing connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out session ids process-wide.
#[derive(Default)]
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Input-side lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    Listening,
    Speaking,
    Transcribing,
    Closed,
}

/// Events the transport bridge feeds into the supervisor.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Graceful close from the peer; treated as an implicit end-mark.
    Closed,
}

/// Everything a session shares with the rest of the process. Cheap to clone
/// per connection.
#[derive(Clone)]
pub struct SessionContext {
    pub vad_engine: Arc<dyn VadEngine>,
    pub pool: Arc<TranscriptionPool>,
    pub audio_log: AudioLogHandle,
    pub gate_config: VadGateConfig,
    pub drain_timeout: Duration,
}

type PendingResult = Pin<Box<dyn Future<Output = RecognitionPayload> + Send>>;

/// Runs one session to completion. Returns when the peer closes, the
/// transport drops, or the handshake fails.
pub async fn run_session(
    id: SessionId,
    ctx: SessionContext,
    mut inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    // ── Handshake ────────────────────────────────────────────────────────
    let hello = match inbound.recv().await {
        Some(Inbound::Text(text)) => match Hello::parse(&text) {
            Ok(hello) => hello,
            Err(e) => {
                warn!(session_id = id.0, error = %e, "handshake rejected");
                send_error(&outbound, ErrorKind::BadHandshake, e.to_string()).await;
                return;
            }
        },
        Some(_) => {
            warn!(session_id = id.0, "first message was not a text handshake");
            send_error(&outbound, ErrorKind::BadHandshake, "expected JSON hello").await;
            return;
        }
        None => return,
    };

    let mut vad_stream = match ctx.vad_engine.open_stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session_id = id.0, error = %e, "could not open VAD stream");
            send_error(&outbound, ErrorKind::ModelFailure, e.to_string()).await;
            return;
        }
    };

    info!(session_id = id.0, lang = %hello.lang, "session established");

    let gate = VadGate::new(id, ctx.gate_config.clone());
    let mut session = Session {
        id,
        ctx,
        hello,
        state: InputState::Listening,
        assembler: FrameAssembler::new(),
        gate,
        pending: VecDeque::new(),
        outbound,
        seq_sealed: 0,
    };

    // ── Main loop ────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(Inbound::Binary(data)) => {
                    if is_end_mark(&data) {
                        debug!(session_id = id.0, "end-mark received");
                        session.finish(&mut vad_stream).await;
                        return;
                    }
                    if !session.consume_audio(&data, &mut vad_stream).await {
                        return;
                    }
                }
                Some(Inbound::Text(text)) => {
                    debug!(session_id = id.0, %text, "ignoring unexpected text frame");
                }
                Some(Inbound::Closed) => {
                    session.finish(&mut vad_stream).await;
                    return;
                }
                None => {
                    // Transport died; in-flight work is discarded.
                    info!(session_id = id.0, "transport dropped, session closed");
                    return;
                }
            },
            payload = next_result(&mut session.pending), if !session.pending.is_empty() => {
                session.pending.pop_front();
                if session.pending.is_empty() && session.state == InputState::Transcribing {
                    session.state = InputState::Listening;
                }
                if !session.deliver(payload).await {
                    return;
                }
            }
        }
    }
}

async fn next_result(pending: &mut VecDeque<PendingResult>) -> RecognitionPayload {
    pending
        .front_mut()
        .expect("guarded by !is_empty")
        .as_mut()
        .await
}

struct Session {
    id: SessionId,
    ctx: SessionContext,
    hello: Hello,
    state: InputState,
    assembler: FrameAssembler,
    gate: VadGate,
    pending: VecDeque<PendingResult>,
    outbound: mpsc::Sender<ServerMessage>,
    seq_sealed: u64,
}

impl Session {
    /// Feeds one binary chunk through assembler, detector and gate.
    /// Returns false when the outbound side is gone.
    async fn consume_audio(&mut self, data: &[u8], vad: &mut Box<dyn VadStream>) -> bool {
        for frame in self.assembler.push(data) {
            if !self.process_frame(&frame, vad).await {
                return false;
            }
        }
        true
    }

    async fn process_frame(
        &mut self,
        frame: &[f32; FRAME_SAMPLES],
        vad: &mut Box<dyn VadStream>,
    ) -> bool {
        let prob = match vad.predict(frame) {
            Ok(p) => p,
            Err(e) => {
                // A detector hiccup must not kill the stream; the frame
                // counts as silence.
                warn!(session_id = self.id.0, error = %e, "VAD predict failed");
                0.0
            }
        };
        if let Some(event) = self.gate.observe(frame, prob) {
            return self.handle_gate_event(event).await;
        }
        true
    }

    async fn handle_gate_event(&mut self, event: GateEvent) -> bool {
        match event {
            GateEvent::SpeechStart { .. } => {
                self.state = InputState::Speaking;
                self.send(ServerMessage::speech_start(epoch_now())).await
            }
            GateEvent::SpeechEnd { utterance } => {
                self.state = InputState::Transcribing;
                debug!(
                    session_id = self.id.0,
                    seq = utterance.seq,
                    samples = utterance.samples.len(),
                    "utterance sealed"
                );
                self.seq_sealed += 1;
                if !self.send(ServerMessage::speech_end(epoch_now())).await {
                    return false;
                }

                // The logger and the pool each get a cheap clone; samples
                // are shared, not copied.
                self.ctx.audio_log.submit(utterance.clone());

                let request = TranscribeRequest {
                    samples: utterance.samples,
                    language: self.hello.lang.clone(),
                    prompt: self.hello.prompt.clone(),
                };
                match self.ctx.pool.submit(request) {
                    Ok(receipt) => self.pending.push_back(Box::pin(receipt.wait())),
                    Err(e @ SubmitError::Overloaded { .. }) => {
                        warn!(session_id = self.id.0, error = %e, "utterance rejected");
                        let payload =
                            RecognitionPayload::error(ErrorKind::Overloaded, e.to_string());
                        self.pending.push_back(Box::pin(async move { payload }));
                    }
                }
                true
            }
        }
    }

    /// End of input (end-mark or graceful close): flush the assembler and
    /// gate, then wait out pending results up to the drain timeout.
    async fn finish(&mut self, vad: &mut Box<dyn VadStream>) {
        let (last_frame, status) = self.assembler.finish();
        if let Err(WireError::OddByteCount) = status {
            warn!(session_id = self.id.0, "dropping trailing odd byte");
        }
        if let Some(frame) = last_frame {
            self.process_frame(&frame, vad).await;
        }
        if let Some(event) = self.gate.flush() {
            self.handle_gate_event(event).await;
        }

        let deadline = Instant::now() + self.ctx.drain_timeout;
        while let Some(front) = self.pending.pop_front() {
            match tokio::time::timeout_at(deadline, front).await {
                Ok(payload) => {
                    if !self.deliver(payload).await {
                        break;
                    }
                }
                Err(_) => {
                    warn!(
                        session_id = self.id.0,
                        outstanding = self.pending.len() + 1,
                        "drain timeout, discarding outstanding results"
                    );
                    break;
                }
            }
        }
        self.state = InputState::Closed;
        info!(session_id = self.id.0, utterances = self.seq_sealed, "session closed");
    }

    async fn deliver(&self, payload: RecognitionPayload) -> bool {
        self.send(ServerMessage::RecognitionResult {
            timestamp: epoch_now(),
            result: payload,
        })
        .await
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }
}

async fn send_error(outbound: &mpsc::Sender<ServerMessage>, kind: ErrorKind, message: String) {
    let _ = outbound
        .send(ServerMessage::RecognitionResult {
            timestamp: epoch_now(),
            result: RecognitionPayload::error(kind, message),
        })
        .await;
}

fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

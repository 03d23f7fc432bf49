//! Model adapters behind the engine seams.
//!
//! Both models are heavy and load once at startup. Engines are shared by
//! `Arc`; the per-session / per-worker mutable state (VAD recurrent state,
//! whisper decode state) lives in the stream/worker handles they open.

pub mod silero;
pub mod whisper_cpp;

use std::sync::Arc;

use crate::config::ModelConfig;
use crate::protocol::Transcription;

/// Unified error type for model operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Model not loaded or initialization failed
    #[error("model not available: {0}")]
    NotAvailable(String),

    /// Backend-specific inference error
    #[error("inference failed: {0}")]
    Inference(String),

    /// Invalid audio format or parameters
    #[error("invalid audio: {0}")]
    InvalidAudio(String),
}

/// One utterance handed to a speech worker.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub samples: Arc<[f32]>,
    pub language: String,
    pub prompt: String,
}

/// Shared voice-activity model. Opens one stream per session; the stream
/// carries the model's recurrent state for that session only.
pub trait VadEngine: Send + Sync {
    fn open_stream(&self) -> Result<Box<dyn VadStream>, ModelError>;
}

/// Per-session VAD state. `predict` takes one 512-sample frame and returns
/// the speech probability in [0, 1].
pub trait VadStream: Send {
    fn predict(&mut self, frame: &[f32]) -> Result<f32, ModelError>;
    fn reset(&mut self);
}

/// Shared speech-to-text model. Opens one worker handle per pool thread.
pub trait SpeechEngine: Send + Sync {
    fn open_worker(&self) -> Result<Box<dyn SpeechWorker>, ModelError>;
}

/// Per-thread transcription handle. `transcribe` blocks for the duration of
/// inference and must only be called from a pool thread.
pub trait SpeechWorker: Send {
    fn transcribe(&mut self, request: &TranscribeRequest) -> Result<Transcription, ModelError>;
}

/// Loads both models from the configured paths. Called once from `main`,
/// never from a session task.
pub fn load_engines(
    config: &ModelConfig,
) -> anyhow::Result<(Arc<dyn VadEngine>, Arc<dyn SpeechEngine>)> {
    let vad = silero::SileroEngine::load(&config.vad_model_path)?;
    let stt = whisper_cpp::WhisperCppEngine::load(
        &config.speech_model_path,
        config.threads_per_worker,
        config.gpu_enabled,
    )?;
    Ok((Arc::new(vad), Arc::new(stt)))
}

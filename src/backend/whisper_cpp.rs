//! whisper.cpp speech-to-text via whisper-rs bindings.
//!
//! The context (loaded GGML model) is shared across the pool; each worker
//! thread opens its own [`WhisperState`] so inferences run concurrently
//! without locking the model.

use std::path::Path;

use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
};

use super::{ModelError, SpeechEngine, SpeechWorker, TranscribeRequest};
use crate::protocol::{Transcription, TranscriptSegment};

pub struct WhisperCppEngine {
    context: WhisperContext,
    threads: usize,
}

impl WhisperCppEngine {
    pub fn load(
        model_path: impl AsRef<Path>,
        threads: usize,
        gpu_enabled: bool,
    ) -> Result<Self, ModelError> {
        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = gpu_enabled;

        let path = model_path.as_ref().to_str().ok_or_else(|| {
            ModelError::NotAvailable("model path is not valid UTF-8".to_string())
        })?;

        let context = WhisperContext::new_with_params(path, ctx_params).map_err(|e| {
            ModelError::NotAvailable(format!("failed to load GGML model: {e:?}"))
        })?;

        tracing::info!(
            path,
            multilingual = context.is_multilingual(),
            "whisper.cpp model loaded"
        );

        Ok(Self { context, threads })
    }
}

impl SpeechEngine for WhisperCppEngine {
    fn open_worker(&self) -> Result<Box<dyn SpeechWorker>, ModelError> {
        let state = self.context.create_state().map_err(|e| {
            ModelError::NotAvailable(format!("failed to create whisper state: {e:?}"))
        })?;
        Ok(Box::new(WhisperCppWorker {
            state,
            threads: self.threads,
        }))
    }
}

struct WhisperCppWorker {
    state: WhisperState,
    threads: usize,
}

impl SpeechWorker for WhisperCppWorker {
    fn transcribe(&mut self, request: &TranscribeRequest) -> Result<Transcription, ModelError> {
        if request.samples.is_empty() {
            return Err(ModelError::InvalidAudio("empty utterance".to_string()));
        }

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(self.threads as i32);
        params.set_language(Some(&request.language));
        if !request.prompt.is_empty() {
            params.set_initial_prompt(&request.prompt);
        }

        // Utterances are capped at 30 s upstream, whisper's native window.
        params.set_single_segment(false);
        params.set_no_timestamps(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        self.state
            .full(params, &request.samples)
            .map_err(|e| ModelError::Inference(format!("transcription failed: {e:?}")))?;

        let mut text = String::new();
        let mut segments = Vec::new();
        for i in 0..self.state.full_n_segments() {
            let Some(segment) = self.state.get_segment(i) else {
                continue;
            };
            let segment_text = segment
                .to_str()
                .map_err(|e| ModelError::Inference(format!("segment text: {e:?}")))?;
            let trimmed = segment_text.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(trimmed);
            // Timestamps arrive in centiseconds.
            segments.push(TranscriptSegment {
                start: segment.start_timestamp() as f64 / 100.0,
                end: segment.end_timestamp() as f64 / 100.0,
                text: trimmed.to_string(),
            });
        }

        Ok(Transcription {
            text,
            segments,
            language: Some(request.language.clone()),
        })
    }
}

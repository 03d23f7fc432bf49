//! Silero VAD over ONNX Runtime.
//!
//! One ONNX session serves every connection; each [`VadStream`] owns the
//! model's recurrent state tensor for its session, so predictions from
//! concurrent sessions never contaminate each other.

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array, Array2, ArrayD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputs};
use ort::value::Tensor;
use parking_lot::Mutex;

use super::{ModelError, VadEngine, VadStream};
use crate::frame_assembler::FRAME_SAMPLES;
use crate::SAMPLE_RATE;

pub struct SileroEngine {
    session: Arc<Mutex<Session>>,
}

impl SileroEngine {
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(model_path.as_ref()))
            .map_err(|e| ModelError::NotAvailable(format!("silero load: {e}")))?;

        tracing::info!(path = %model_path.as_ref().display(), "silero VAD model loaded");
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }
}

impl VadEngine for SileroEngine {
    fn open_stream(&self) -> Result<Box<dyn VadStream>, ModelError> {
        Ok(Box::new(SileroStream {
            session: self.session.clone(),
            state: fresh_state(),
        }))
    }
}

fn fresh_state() -> ArrayD<f32> {
    ArrayD::<f32>::zeros([2, 1, 128].as_slice())
}

struct SileroStream {
    session: Arc<Mutex<Session>>,
    state: ArrayD<f32>,
}

impl VadStream for SileroStream {
    fn predict(&mut self, frame: &[f32]) -> Result<f32, ModelError> {
        if frame.len() != FRAME_SAMPLES {
            return Err(ModelError::InvalidAudio(format!(
                "silero expects {FRAME_SAMPLES}-sample frames, got {}",
                frame.len()
            )));
        }

        let frame_arr =
            Array2::from_shape_vec((1, FRAME_SAMPLES), frame.to_vec()).map_err(infer_err)?;
        let frame_tensor = Tensor::from_array(frame_arr).map_err(infer_err)?;
        let state_tensor =
            Tensor::from_array(std::mem::replace(&mut self.state, fresh_state())).map_err(infer_err)?;
        let rate_tensor =
            Tensor::from_array(Array::from_shape_vec([1], vec![SAMPLE_RATE as i64]).unwrap())
                .map_err(infer_err)?;

        let inputs = ort::inputs![frame_tensor, state_tensor, rate_tensor];
        let mut session = self.session.lock();
        let outputs = session
            .run(SessionInputs::ValueSlice::<3>(&inputs))
            .map_err(infer_err)?;

        self.state = outputs["stateN"]
            .try_extract_array()
            .map_err(infer_err)?
            .to_owned();
        let prob = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(infer_err)?
            .1[0];
        Ok(prob.clamp(0.0, 1.0))
    }

    fn reset(&mut self) {
        self.state = fresh_state();
    }
}

fn infer_err(e: impl std::fmt::Display) -> ModelError {
    ModelError::Inference(e.to_string())
}

//! Application configuration, read from a TOML file with per-section
//! defaults. The `[audio_log]` section only seeds the runtime-mutable
//! snapshot; everything else is fixed for the life of the process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio_logger::AudioLogConfig;
use crate::vad_gate::VadGateConfig;
use crate::SAMPLE_RATE;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub vad: VadSettings,
    pub transcribe: TranscribeSettings,
    pub models: ModelConfig,
    pub audio_log: AudioLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the combined audio-socket + admin listener binds to.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8710".to_string(),
        }
    }
}

/// Endpoint-detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Probability at or above which a frame counts toward speech onset.
    pub threshold_on: f32,
    /// Probability below which a speech frame counts toward silence.
    pub threshold_off: f32,
    /// Consecutive onset frames required before `speech_start`.
    pub min_speech_frames: usize,
    /// Consecutive silence frames required before `speech_end`.
    pub hangover_frames: usize,
    /// Context retained before the detected onset, in milliseconds.
    pub pre_roll_ms: usize,
    /// Hard per-utterance cap, in seconds.
    pub max_utterance_sec: usize,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold_on: 0.5,
            threshold_off: 0.35,
            min_speech_frames: 2,
            hangover_frames: 16, // ~512 ms of trailing context
            pre_roll_ms: 512,
            max_utterance_sec: 30,
        }
    }
}

impl VadSettings {
    pub fn gate_config(&self) -> VadGateConfig {
        VadGateConfig {
            threshold_on: self.threshold_on,
            threshold_off: self.threshold_off,
            min_speech_frames: self.min_speech_frames,
            hangover_frames: self.hangover_frames,
            pre_roll_samples: self.pre_roll_ms * SAMPLE_RATE / 1000,
            max_utterance_samples: self.max_utterance_sec * SAMPLE_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscribeSettings {
    /// Worker threads. Zero means one per CPU.
    pub workers: usize,
    /// Jobs allowed in the queue before submissions are rejected.
    pub max_queue_depth: usize,
    /// Per-job deadline in seconds.
    pub job_deadline_secs: u64,
    /// How long an end-mark waits for outstanding results.
    pub drain_timeout_secs: u64,
}

impl Default for TranscribeSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            max_queue_depth: 32,
            job_deadline_secs: 30,
            drain_timeout_secs: 10,
        }
    }
}

impl TranscribeSettings {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn job_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.job_deadline_secs)
    }

    pub fn drain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Silero VAD ONNX model.
    pub vad_model_path: PathBuf,
    /// whisper.cpp GGML model.
    pub speech_model_path: PathBuf,
    /// Inference threads inside each pool worker.
    pub threads_per_worker: usize,
    pub gpu_enabled: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vad_model_path: PathBuf::from("models/silero_vad.onnx"),
            speech_model_path: PathBuf::from("models/ggml-base.bin"),
            threads_per_worker: num_cpus::get().min(4),
            gpu_enabled: false,
        }
    }
}

impl AppConfig {
    /// Reads the config file, falling back to defaults with a logged warning
    /// when it is missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e,
                        "failed to parse config, using defaults");
                    AppConfig::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e,
                    "failed to read config, using defaults");
                AppConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [vad]
            threshold_on = 0.6

            [audio_log]
            enabled = true
            max_files = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.vad.threshold_on, 0.6);
        assert_eq!(config.vad.hangover_frames, 16);
        assert!(config.audio_log.enabled);
        assert_eq!(config.audio_log.max_files, 5);
        assert_eq!(config.transcribe.max_queue_depth, 32);
        assert_eq!(config.server.bind_addr, "127.0.0.1:8710");
    }

    #[test]
    fn gate_config_converts_units() {
        let settings = VadSettings::default();
        let gate = settings.gate_config();
        assert_eq!(gate.pre_roll_samples, 512 * 16000 / 1000);
        assert_eq!(gate.max_utterance_samples, 30 * 16000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/harken.toml"));
        assert_eq!(config.transcribe.job_deadline_secs, 30);
    }
}

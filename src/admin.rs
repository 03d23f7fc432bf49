//! Admin HTTP handlers: health, audio-log configuration, log listing.
//!
//! Configuration mutation is the single writer for the audio-log snapshot;
//! a patch is validated against a copy and swapped in whole, so a rejected
//! request leaves the running config untouched.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::audio_logger::{list_audio_logs, AudioLogConfig, AudioLogListing};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub model_loaded: bool,
    pub audio_log_enabled: bool,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.pool_health.is_degraded() {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        active_sessions: state
            .active_sessions
            .load(std::sync::atomic::Ordering::Relaxed),
        model_loaded: state.model_loaded,
        audio_log_enabled: state.audio_log_config.read().enabled,
    })
}

/// `GET /config/audio-log`
pub async fn get_audio_log(State(state): State<AppState>) -> Json<AudioLogConfig> {
    Json(state.audio_log_config.read().clone())
}

/// Partial update body for `POST /config/audio-log`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioLogPatch {
    pub enabled: Option<bool>,
    pub output_dir: Option<std::path::PathBuf>,
    pub max_files: Option<usize>,
}

/// `POST /config/audio-log`: applied atomically; 400 leaves the running
/// config unchanged. The logger picks the new snapshot up on its next
/// utterance.
pub async fn set_audio_log(
    State(state): State<AppState>,
    Json(patch): Json<AudioLogPatch>,
) -> Result<Json<AudioLogConfig>, (StatusCode, Json<serde_json::Value>)> {
    let current = state.audio_log_config.read().clone();
    let candidate = apply_patch(current, patch)
        .map_err(|msg| (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))))?;

    *state.audio_log_config.write() = candidate.clone();
    info!(
        enabled = candidate.enabled,
        output_dir = %candidate.output_dir.display(),
        max_files = candidate.max_files,
        "audio-log config updated"
    );
    Ok(Json(candidate))
}

/// `GET /logs/audio/list`: newest first.
pub async fn list_logs(State(state): State<AppState>) -> Json<Vec<AudioLogListing>> {
    let dir = state.audio_log_config.read().output_dir.clone();
    Json(list_audio_logs(&dir))
}

/// Validates a patch against a copy of the current config and returns the
/// candidate to swap in.
fn apply_patch(mut config: AudioLogConfig, patch: AudioLogPatch) -> Result<AudioLogConfig, String> {
    if let Some(enabled) = patch.enabled {
        config.enabled = enabled;
    }
    if let Some(max_files) = patch.max_files {
        if max_files < 1 {
            return Err("max_files must be at least 1".to_string());
        }
        config.max_files = max_files;
    }
    if let Some(dir) = patch.output_dir {
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("output_dir not creatable: {e}"))?;
        // Probe writability with an unnamed tempfile that vanishes on drop.
        tempfile::tempfile_in(&dir).map_err(|e| format!("output_dir not writable: {e}"))?;
        config.output_dir = dir;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AudioLogConfig {
        AudioLogConfig {
            enabled: false,
            output_dir: std::path::PathBuf::from("unused"),
            max_files: 10,
        }
    }

    #[test]
    fn empty_patch_changes_nothing() {
        let out = apply_patch(base(), AudioLogPatch::default()).unwrap();
        assert_eq!(out, base());
    }

    #[test]
    fn zero_max_files_is_rejected() {
        let patch = AudioLogPatch {
            max_files: Some(0),
            ..Default::default()
        };
        assert!(apply_patch(base(), patch).is_err());
    }

    #[test]
    fn unwritable_dir_is_rejected_and_config_untouched() {
        let patch = AudioLogPatch {
            enabled: Some(true),
            output_dir: Some("/proc/definitely/not/writable".into()),
            ..Default::default()
        };
        assert!(apply_patch(base(), patch).is_err());
    }

    #[test]
    fn valid_patch_applies_every_field() {
        let tmp = tempfile::TempDir::new().unwrap();
        let patch = AudioLogPatch {
            enabled: Some(true),
            output_dir: Some(tmp.path().join("logs")),
            max_files: Some(3),
        };
        let out = apply_patch(base(), patch).unwrap();
        assert!(out.enabled);
        assert_eq!(out.max_files, 3);
        assert_eq!(out.output_dir, tmp.path().join("logs"));
        assert!(out.output_dir.is_dir());
    }
}

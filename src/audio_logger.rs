//! Audit persistence for sealed utterances.
//!
//! One task owns every filesystem mutation in the log directory. Each
//! utterance becomes a headerless float32 `.raw` file plus a `.meta` JSON
//! sidecar, both published atomically (tempfile, fsync, rename). Retention
//! is a bounded file count: the rotator deletes the oldest pairs by the
//! timestamp embedded in the filename, never by mtime, so externally copied
//! files sort where their name says they belong.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::utterance::Utterance;
use crate::SAMPLE_RATE;

/// Interval between directory re-scans that pick up externally added files.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide audio-log configuration. Mutated only by the admin surface;
/// everyone else clones a snapshot per utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioLogConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub max_files: usize,
}

impl Default for AudioLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            output_dir: PathBuf::from("audio_log"),
            max_files: 100,
        }
    }
}

/// `.meta` sidecar document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMeta {
    pub filename: String,
    pub session_id: u64,
    pub timestamp: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub data_type: String,
    pub duration_seconds: f64,
    pub samples: usize,
}

/// One `(raw, meta)` pair tracked by the rotator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LogEntry {
    /// Embedded timestamp, millisecond resolution; first in the struct so
    /// derived ordering is oldest-first with the filename as tiebreak.
    stamp: NaiveDateTime,
    raw_name: String,
}

/// Entry returned by [`list_audio_logs`] for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct AudioLogListing {
    pub filename: String,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub timestamp: String,
}

/// Cheap handle sessions use to enqueue sealed utterances.
#[derive(Clone)]
pub struct AudioLogHandle {
    tx: mpsc::UnboundedSender<Utterance>,
}

impl AudioLogHandle {
    /// Never blocks; a logger that has shut down drops the utterance.
    pub fn submit(&self, utterance: Utterance) {
        if self.tx.send(utterance).is_err() {
            debug!("audio logger gone; utterance not persisted");
        }
    }
}

pub struct AudioLogger {
    config: Arc<RwLock<AudioLogConfig>>,
    rx: mpsc::UnboundedReceiver<Utterance>,
    tracked: Vec<LogEntry>,
    tracked_dir: PathBuf,
}

impl AudioLogger {
    pub fn new(config: Arc<RwLock<AudioLogConfig>>) -> (AudioLogHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracked_dir = config.read().output_dir.clone();
        (
            AudioLogHandle { tx },
            Self {
                config,
                rx,
                tracked: Vec::new(),
                tracked_dir,
            },
        )
    }

    /// Runs until every handle is dropped. An in-flight pair write always
    /// completes before the task exits.
    pub fn start(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.resync();
            let mut sweep = tokio::time::interval_at(
                tokio::time::Instant::now() + SWEEP_INTERVAL,
                SWEEP_INTERVAL,
            );
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    utterance = self.rx.recv() => match utterance {
                        Some(utterance) => self.persist(utterance).await,
                        None => break,
                    },
                    _ = sweep.tick() => self.resync(),
                }
            }
            info!("audio logger stopped");
        })
    }

    async fn persist(&mut self, utterance: Utterance) {
        let snapshot = self.config.read().clone();
        if !snapshot.enabled {
            return;
        }
        if snapshot.output_dir != self.tracked_dir {
            // Directory changed under us: forget the old directory's files
            // and adopt whatever the new one already contains.
            self.tracked_dir = snapshot.output_dir.clone();
            self.resync();
        }

        let session_id = utterance.session.0;
        let dir = snapshot.output_dir.clone();
        let stamp = Utc::now();
        let written = tokio::task::spawn_blocking(move || write_pair(&dir, stamp, &utterance))
            .await
            .unwrap_or_else(|e| Err(StorageError::Io(format!("logger write task: {e}"))));

        match written {
            Ok(entry) => {
                debug!(session_id, file = %entry.raw_name, "utterance persisted");
                self.tracked.push(entry);
                self.rotate(snapshot.max_files);
            }
            // Storage trouble is logged and swallowed; recognition delivery
            // must not depend on the audit channel.
            Err(e) => error!(session_id, error = %e, "audio log write failed"),
        }
    }

    fn rotate(&mut self, max_files: usize) {
        if self.tracked.len() <= max_files {
            return;
        }
        self.tracked.sort();
        while self.tracked.len() > max_files {
            let oldest = self.tracked.remove(0);
            let raw = self.tracked_dir.join(&oldest.raw_name);
            let meta = raw.with_extension("meta");
            for path in [&raw, &meta] {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "rotation delete failed");
                }
            }
            debug!(file = %oldest.raw_name, "rotated out oldest pair");
        }
    }

    /// Re-lists the tracked directory, rebuilding the rotator's set from the
    /// filenames actually present, then enforces the bound.
    fn resync(&mut self) {
        let snapshot = self.config.read().clone();
        self.tracked_dir = snapshot.output_dir.clone();
        self.tracked = scan_directory(&self.tracked_dir);
        self.rotate(snapshot.max_files);
    }
}

#[derive(Debug, thiserror::Error)]
enum StorageError {
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

fn log_filename(stamp: DateTime<Utc>, session_id: u64) -> String {
    format!(
        "audio_{}_{:03}_session_{}.raw",
        stamp.format("%Y%m%d_%H%M%S"),
        stamp.timestamp_subsec_millis(),
        session_id
    )
}

/// Parses `audio_YYYYMMDD_HHMMSS_mmm_session_<id>.raw` back into its
/// embedded timestamp. Foreign filenames return `None` and are left alone.
fn parse_log_filename(name: &str) -> Option<NaiveDateTime> {
    let rest = name.strip_prefix("audio_")?.strip_suffix(".raw")?;
    // YYYYMMDD_HHMMSS_mmm_session_<id>
    let (stamp_part, rest) = rest.split_at_checked(19)?;
    rest.strip_prefix("_session_")?.parse::<u64>().ok()?;
    let (datetime, millis) = stamp_part.split_at(15);
    let base = NaiveDateTime::parse_from_str(datetime, "%Y%m%d_%H%M%S").ok()?;
    let millis: u32 = millis.strip_prefix('_')?.parse().ok()?;
    if millis >= 1000 {
        return None;
    }
    Some(base + chrono::Duration::milliseconds(i64::from(millis)))
}

/// Writes the `(raw, meta)` pair atomically: each file goes to a tempfile in
/// the target directory, is fsynced, and only then renamed into place.
fn write_pair(
    dir: &Path,
    stamp: DateTime<Utc>,
    utterance: &Utterance,
) -> Result<LogEntry, StorageError> {
    std::fs::create_dir_all(dir)?;

    let raw_name = log_filename(stamp, utterance.session.0);
    let raw_path = dir.join(&raw_name);

    let mut raw_bytes = Vec::with_capacity(utterance.samples.len() * 4);
    for sample in utterance.samples.iter() {
        raw_bytes.extend_from_slice(&sample.to_le_bytes());
    }
    publish_atomic(dir, &raw_path, &raw_bytes)?;

    let meta = AudioMeta {
        filename: raw_name.clone(),
        session_id: utterance.session.0,
        timestamp: stamp.to_rfc3339(),
        sample_rate: SAMPLE_RATE as u32,
        channels: 1,
        data_type: "float32".to_string(),
        duration_seconds: utterance.duration_seconds(),
        samples: utterance.samples.len(),
    };
    let meta_path = raw_path.with_extension("meta");
    let meta_bytes = serde_json::to_vec_pretty(&meta)
        .map_err(|e| StorageError::Io(format!("meta encode: {e}")))?;
    if let Err(e) = publish_atomic(dir, &meta_path, &meta_bytes) {
        // Don't leave a raw file with no sidecar behind.
        let _ = std::fs::remove_file(&raw_path);
        return Err(e);
    }

    Ok(LogEntry {
        stamp: stamp.naive_utc(),
        raw_name,
    })
}

fn publish_atomic(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    use std::io::Write;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(final_path)
        .map_err(|e| StorageError::Io(format!("rename into place: {e}")))?;
    Ok(())
}

fn scan_directory(dir: &Path) -> Vec<LogEntry> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut tracked: Vec<LogEntry> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let stamp = parse_log_filename(&name)?;
            Some(LogEntry {
                stamp,
                raw_name: name,
            })
        })
        .collect();
    tracked.sort();
    tracked
}

/// Reads a `.raw` file back into samples. Used by the admin surface and by
/// tests; the format is bare f32le, so length must be a multiple of 4.
pub fn read_raw(path: &Path) -> std::io::Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "raw audio length is not a multiple of 4",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Newest-first listing of the log directory for `GET /logs/audio/list`.
pub fn list_audio_logs(dir: &Path) -> Vec<AudioLogListing> {
    let mut entries = scan_directory(dir);
    entries.reverse();
    entries
        .into_iter()
        .filter_map(|entry| {
            let size_bytes = std::fs::metadata(dir.join(&entry.raw_name)).ok()?.len();
            Some(AudioLogListing {
                duration_seconds: size_bytes as f64 / 4.0 / SAMPLE_RATE as f64,
                timestamp: entry.stamp.and_utc().to_rfc3339(),
                filename: entry.raw_name,
                size_bytes,
            })
        })
        .collect()
}

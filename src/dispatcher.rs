//! Process-wide transcription worker pool.
//!
//! Inference is CPU-heavy and must not run on the async scheduler, so the
//! pool owns dedicated OS threads, each holding one worker handle opened
//! from the shared speech engine. Sessions submit through an unbounded FIFO
//! guarded by an explicit depth gauge: past `max_queue_depth` the submission
//! is rejected with `Overloaded` instead of queueing without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::backend::{ModelError, SpeechEngine, TranscribeRequest};
use crate::protocol::{ErrorKind, RecognitionPayload, Transcription};

/// Consecutive failures after which a worker thread is retired.
const RETIRE_AFTER_FAILURES: u32 = 3;

struct Job {
    request: TranscribeRequest,
    result_tx: oneshot::Sender<Result<Transcription, ModelError>>,
}

/// Degraded-capacity telemetry for the health surface.
pub struct PoolHealth {
    started: usize,
    active: AtomicUsize,
}

impl PoolHealth {
    pub fn started_workers(&self) -> usize {
        self.started
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.active_workers() < self.started
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("transcription queue is at capacity ({depth} jobs)")]
    Overloaded { depth: usize },
}

pub struct TranscriptionPool {
    job_tx: crossbeam_channel::Sender<Job>,
    depth: Arc<AtomicUsize>,
    max_queue_depth: usize,
    deadline: Duration,
    health: Arc<PoolHealth>,
}

impl TranscriptionPool {
    /// Spawns `workers` threads, each opening its own handle on the engine.
    /// Worker handles that fail to open reduce capacity but do not abort
    /// startup as long as at least one worker came up.
    pub fn start(
        engine: Arc<dyn SpeechEngine>,
        workers: usize,
        max_queue_depth: usize,
        deadline: Duration,
    ) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));
        let health = Arc::new(PoolHealth {
            started: workers,
            active: AtomicUsize::new(workers),
        });

        let mut spawned = 0;
        for idx in 0..workers {
            let engine = engine.clone();
            let job_rx = job_rx.clone();
            let worker_depth = depth.clone();
            let worker_health = health.clone();
            let spawn = std::thread::Builder::new()
                .name(format!("stt-worker-{idx}"))
                .spawn(move || worker_loop(idx, engine, job_rx, worker_depth, worker_health));
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => {
                    error!(worker = idx, error = %e, "failed to spawn worker thread");
                    health.active.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        anyhow::ensure!(spawned > 0, "no transcription workers could be started");
        info!(workers = spawned, max_queue_depth, "transcription pool started");

        Ok(Self {
            job_tx,
            depth,
            max_queue_depth,
            deadline,
            health,
        })
    }

    pub fn health(&self) -> Arc<PoolHealth> {
        self.health.clone()
    }

    /// Queues one utterance. Non-blocking; fails fast when saturated.
    pub fn submit(&self, request: TranscribeRequest) -> Result<PendingTranscription, SubmitError> {
        let depth = self.depth.load(Ordering::Relaxed);
        if depth >= self.max_queue_depth {
            return Err(SubmitError::Overloaded { depth });
        }

        let (result_tx, result_rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self
            .job_tx
            .send(Job { request, result_tx })
            .is_err()
        {
            // Every worker has exited; treat as saturation from the
            // session's point of view.
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(SubmitError::Overloaded { depth });
        }

        Ok(PendingTranscription {
            result_rx,
            deadline: self.deadline,
        })
    }
}

/// A submitted job's receipt. Awaiting it yields the wire payload for the
/// utterance, with the per-job deadline applied.
pub struct PendingTranscription {
    result_rx: oneshot::Receiver<Result<Transcription, ModelError>>,
    deadline: Duration,
}

impl PendingTranscription {
    pub async fn wait(self) -> RecognitionPayload {
        match tokio::time::timeout(self.deadline, self.result_rx).await {
            Ok(Ok(Ok(transcription))) => RecognitionPayload::Ok(transcription),
            Ok(Ok(Err(e))) => RecognitionPayload::error(ErrorKind::ModelFailure, e.to_string()),
            // Worker thread died with the job in hand.
            Ok(Err(_)) => {
                RecognitionPayload::error(ErrorKind::ModelFailure, "worker exited mid-job")
            }
            Err(_) => RecognitionPayload::error(
                ErrorKind::Timeout,
                format!("transcription exceeded {:?}", self.deadline),
            ),
        }
    }
}

fn worker_loop(
    idx: usize,
    engine: Arc<dyn SpeechEngine>,
    job_rx: crossbeam_channel::Receiver<Job>,
    depth: Arc<AtomicUsize>,
    health: Arc<PoolHealth>,
) {
    let mut worker = match engine.open_worker() {
        Ok(w) => w,
        Err(e) => {
            error!(worker = idx, error = %e, "could not open speech worker");
            health.active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let mut consecutive_failures = 0u32;
    while let Ok(job) = job_rx.recv() {
        depth.fetch_sub(1, Ordering::Relaxed);
        let outcome = worker.transcribe(&job.request);
        match &outcome {
            Ok(_) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!(worker = idx, consecutive_failures, error = %e, "transcription failed");
            }
        }
        // The session may have gone away; a dropped receiver is fine.
        let _ = job.result_tx.send(outcome);

        if consecutive_failures >= RETIRE_AFTER_FAILURES {
            error!(worker = idx, "retiring worker after repeated failures");
            break;
        }
    }

    health.active.fetch_sub(1, Ordering::Relaxed);
    info!(worker = idx, "worker thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SpeechWorker;
    use std::sync::Mutex;

    /// Engine whose workers run a caller-supplied closure per job.
    struct StubEngine<F>(F);

    impl<F> SpeechEngine for StubEngine<F>
    where
        F: Fn(&TranscribeRequest) -> Result<Transcription, ModelError> + Send + Sync + Clone + 'static,
    {
        fn open_worker(&self) -> Result<Box<dyn SpeechWorker>, ModelError> {
            Ok(Box::new(StubWorker(self.0.clone())))
        }
    }

    struct StubWorker<F>(F);

    impl<F> SpeechWorker for StubWorker<F>
    where
        F: Fn(&TranscribeRequest) -> Result<Transcription, ModelError> + Send,
    {
        fn transcribe(&mut self, request: &TranscribeRequest) -> Result<Transcription, ModelError> {
            (self.0)(request)
        }
    }

    fn request(text: &str) -> TranscribeRequest {
        TranscribeRequest {
            samples: vec![0.0f32; 160].into(),
            language: "en".into(),
            prompt: text.into(),
        }
    }

    fn echo_engine() -> Arc<dyn SpeechEngine> {
        Arc::new(StubEngine(|req: &TranscribeRequest| {
            Ok(Transcription {
                text: req.prompt.clone(),
                segments: vec![],
                language: Some(req.language.clone()),
            })
        }))
    }

    #[tokio::test]
    async fn transcribes_and_returns_result() {
        let pool =
            TranscriptionPool::start(echo_engine(), 2, 8, Duration::from_secs(5)).unwrap();
        let pending = pool.submit(request("hello")).unwrap();
        match pending.wait().await {
            RecognitionPayload::Ok(t) => assert_eq!(t.text, "hello"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_come_back_in_submission_order_with_one_worker() {
        let pool =
            TranscriptionPool::start(echo_engine(), 1, 32, Duration::from_secs(5)).unwrap();
        let pendings: Vec<_> = (0..5)
            .map(|i| pool.submit(request(&format!("utt-{i}"))).unwrap())
            .collect();
        for (i, pending) in pendings.into_iter().enumerate() {
            match pending.wait().await {
                RecognitionPayload::Ok(t) => assert_eq!(t.text, format!("utt-{i}")),
                other => panic!("unexpected payload: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn saturation_rejects_with_overloaded() {
        // Workers park on a mutex the test holds, so jobs pile up.
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();
        let gate_for_worker = gate.clone();
        let engine = Arc::new(StubEngine(move |_req: &TranscribeRequest| {
            let _hold = gate_for_worker.lock().unwrap();
            Ok(Transcription {
                text: String::new(),
                segments: vec![],
                language: None,
            })
        }));

        let pool = TranscriptionPool::start(engine, 1, 2, Duration::from_secs(5)).unwrap();
        // First job is picked up by the worker (and blocks); two more fill
        // the queue to its cap.
        let mut pendings = Vec::new();
        pendings.push(pool.submit(request("a")).unwrap());
        // Give the worker a moment to dequeue the first job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pendings.push(pool.submit(request("b")).unwrap());
        pendings.push(pool.submit(request("c")).unwrap());

        match pool.submit(request("d")) {
            Err(SubmitError::Overloaded { .. }) => {}
            other => panic!("expected Overloaded, got {:?}", other.map(|_| ())),
        }

        drop(guard);
        for pending in pendings {
            assert!(matches!(pending.wait().await, RecognitionPayload::Ok(_)));
        }
        // Capacity recovers once the queue drains.
        assert!(pool.submit(request("e")).is_ok());
    }

    #[tokio::test]
    async fn deadline_yields_timeout_error() {
        let engine = Arc::new(StubEngine(|_req: &TranscribeRequest| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Transcription {
                text: String::new(),
                segments: vec![],
                language: None,
            })
        }));
        let pool = TranscriptionPool::start(engine, 1, 8, Duration::from_millis(50)).unwrap();
        let payload = pool.submit(request("slow")).unwrap().wait().await;
        match payload {
            RecognitionPayload::Err { error } => assert_eq!(error.kind, ErrorKind::Timeout),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn model_errors_are_per_utterance_and_retire_the_worker() {
        let engine = Arc::new(StubEngine(|_req: &TranscribeRequest| {
            Err(ModelError::Inference("broken".into()))
        }));
        let pool = TranscriptionPool::start(engine, 1, 8, Duration::from_secs(5)).unwrap();
        let health = pool.health();

        for _ in 0..RETIRE_AFTER_FAILURES {
            let payload = pool.submit(request("x")).unwrap().wait().await;
            match payload {
                RecognitionPayload::Err { error } => {
                    assert_eq!(error.kind, ErrorKind::ModelFailure)
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }

        // The lone worker retires; health reflects degraded capacity.
        for _ in 0..50 {
            if health.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(health.is_degraded());
        assert_eq!(health.active_workers(), 0);
    }
}

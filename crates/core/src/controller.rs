//! Job controller: owns the single encode slot, runs each job on a worker
//! thread and relays its progress and terminal outcome back to the caller.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{finalize, Artifact, ArtifactStore, ArtifactSummary};
use crate::error::{PipelineError, PipelineResult};
use crate::logging;
use crate::pipeline::run_pipeline;
use crate::types::{validate_request, Background, EncodeOptions, Frame};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Broadcast to every subscriber, independent of the per-job progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        total_frames: usize,
    },
    Progress {
        job_id: Uuid,
        percent: u8,
    },
    Finished {
        job_id: Uuid,
        state: JobState,
        artifact: Option<ArtifactSummary>,
        error: Option<String>,
    },
}

/// Exactly one of these is delivered per job.
#[derive(Debug)]
pub enum JobOutcome {
    Completed(Artifact),
    Cancelled,
    Failed(PipelineError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Cancelled => JobState::Cancelled,
            Self::Failed(_) => JobState::Failed,
        }
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Completed(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// Point-in-time view of the controller slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub state: JobState,
    pub job_id: Option<Uuid>,
    pub progress: u8,
    pub total_frames: usize,
    pub started_at: Option<DateTime<Utc>>,
}

struct JobSlot {
    state: JobState,
    job_id: Option<Uuid>,
    progress: u8,
    total_frames: usize,
    started_at: Option<DateTime<Utc>>,
    cancel_token: Option<CancellationToken>,
}

impl JobSlot {
    fn idle() -> Self {
        Self {
            state: JobState::Idle,
            job_id: None,
            progress: 0,
            total_frames: 0,
            started_at: None,
            cancel_token: None,
        }
    }

    fn owns(&self, job_id: Uuid) -> bool {
        self.job_id == Some(job_id)
    }
}

struct ControllerInner {
    slot: Mutex<JobSlot>,
    events: broadcast::Sender<JobEvent>,
    artifacts: ArtifactStore,
    background: Background,
}

impl ControllerInner {
    fn lock_slot(&self) -> MutexGuard<'_, JobSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn report_progress(&self, job_id: Uuid, percent: u8, progress_tx: &mpsc::UnboundedSender<u8>) {
        {
            let mut slot = self.lock_slot();
            if slot.owns(job_id) {
                slot.progress = slot.progress.max(percent);
            }
        }
        let _ = progress_tx.send(percent);
        let _ = self.events.send(JobEvent::Progress { job_id, percent });
        debug!(job_id = %job_id, percent, "Job progress");
    }

    fn record_outcome(&self, job_id: Uuid, outcome: &JobOutcome) {
        {
            let mut slot = self.lock_slot();
            if slot.owns(job_id) {
                slot.state = outcome.state();
                slot.cancel_token = None;
            }
        }

        match outcome {
            JobOutcome::Completed(artifact) => info!(
                job_id = %job_id,
                handle = %artifact.handle(),
                bytes = artifact.size_bytes(),
                frames = artifact.frame_count(),
                "Job completed"
            ),
            JobOutcome::Cancelled => warn!(job_id = %job_id, "Job cancelled"),
            JobOutcome::Failed(err) => error!(job_id = %job_id, error = %err, "Job failed"),
        }

        let _ = self.events.send(JobEvent::Finished {
            job_id,
            state: outcome.state(),
            artifact: outcome.artifact().map(Artifact::summary),
            error: match outcome {
                JobOutcome::Failed(err) => Some(err.to_string()),
                _ => None,
            },
        });
    }

    /// Return the slot to `Idle` once the terminal outcome has been handed over.
    fn acknowledge(&self, job_id: Uuid) {
        let mut slot = self.lock_slot();
        if slot.owns(job_id) && slot.state.is_terminal() {
            *slot = JobSlot::idle();
        }
    }
}

/// One-job-at-a-time front door to the encoding pipeline.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<ControllerInner>,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new(Background::default())
    }
}

impl JobController {
    pub fn new(background: Background) -> Self {
        Self::with_store(background, ArtifactStore::new())
    }

    pub fn with_store(background: Background, artifacts: ArtifactStore) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                slot: Mutex::new(JobSlot::idle()),
                events,
                artifacts,
                background,
            }),
        }
    }

    pub fn background(&self) -> Background {
        self.inner.background
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let slot = self.inner.lock_slot();
        JobSnapshot {
            state: slot.state,
            job_id: slot.job_id,
            progress: slot.progress,
            total_frames: slot.total_frames,
            started_at: slot.started_at,
        }
    }

    pub fn state(&self) -> JobState {
        self.inner.lock_slot().state
    }

    /// Start encoding `frames` on a dedicated worker thread.
    ///
    /// Rejected synchronously, with no state change, if the request is
    /// invalid or another job is still running.
    pub fn start(&self, frames: Vec<Frame>, options: EncodeOptions) -> PipelineResult<JobHandle> {
        validate_request(&frames, &options)?;

        let job_id = Uuid::new_v4();
        let total_frames = frames.len();
        let cancel_token = CancellationToken::new();
        {
            let mut slot = self.inner.lock_slot();
            if slot.state == JobState::Running {
                let running = slot.job_id.map(|id| id.to_string()).unwrap_or_default();
                return Err(PipelineError::CallerMisuse(format!(
                    "an encode job is already running: {running}"
                )));
            }
            *slot = JobSlot {
                state: JobState::Running,
                job_id: Some(job_id),
                progress: 0,
                total_frames,
                started_at: Some(Utc::now()),
                cancel_token: Some(cancel_token.clone()),
            };
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let _ = self.inner.events.send(JobEvent::Started {
            job_id,
            total_frames,
        });
        let _ = progress_tx.send(0);
        let _ = self.inner.events.send(JobEvent::Progress { job_id, percent: 0 });

        let worker = Worker {
            inner: Arc::clone(&self.inner),
            job_id,
            frames,
            options,
            cancel_token,
            progress_tx,
            outcome_tx,
        };
        let spawned = thread::Builder::new()
            .name(format!("gifsmith-encode-{}", &job_id.simple().to_string()[..8]))
            .spawn(move || worker.run());

        if let Err(err) = spawned {
            let reason = format!("failed to spawn encoder worker: {err}");
            let outcome = JobOutcome::Failed(PipelineError::encode(None, reason.clone()));
            self.inner.record_outcome(job_id, &outcome);
            self.inner.acknowledge(job_id);
            return Err(PipelineError::encode(None, reason));
        }

        info!(job_id = %job_id, total_frames, "Job started");
        Ok(JobHandle {
            job_id,
            total_frames,
            progress_rx,
            outcome_rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Ask the running job to stop at its next frame boundary.
    ///
    /// Idempotent while running; a no-op once the job reached a terminal
    /// state. Calling it on an idle controller is a caller error.
    pub fn cancel(&self) -> PipelineResult<()> {
        let slot = self.inner.lock_slot();
        match slot.state {
            JobState::Idle => Err(PipelineError::CallerMisuse(
                "no encode job is running".to_string(),
            )),
            JobState::Running => {
                if let Some(token) = &slot.cancel_token {
                    if !token.is_cancelled() {
                        info!(job_id = ?slot.job_id, "Cancellation requested");
                    }
                    token.cancel();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

struct Worker {
    inner: Arc<ControllerInner>,
    job_id: Uuid,
    frames: Vec<Frame>,
    options: EncodeOptions,
    cancel_token: CancellationToken,
    progress_tx: mpsc::UnboundedSender<u8>,
    outcome_tx: oneshot::Sender<JobOutcome>,
}

impl Worker {
    fn run(self) {
        let Worker {
            inner,
            job_id,
            frames,
            options,
            cancel_token,
            progress_tx,
            outcome_tx,
        } = self;
        let started = Instant::now();
        let _context = logging::enter_encode_context(Some(job_id), frames.len());

        let result = {
            let mut on_progress =
                |percent: u8| inner.report_progress(job_id, percent, &progress_tx);
            panic::catch_unwind(AssertUnwindSafe(|| {
                run_pipeline(
                    &frames,
                    &options,
                    inner.background,
                    &mut on_progress,
                    &cancel_token,
                )
            }))
            .unwrap_or_else(|payload| {
                Err(PipelineError::encode(
                    None,
                    format!(
                        "encoder worker panicked: {}",
                        logging::describe_panic_payload(payload.as_ref())
                    ),
                ))
            })
        };

        // Release the borrowed inputs and close the progress stream before
        // the outcome is delivered.
        drop(frames);
        drop(progress_tx);

        let outcome = match result {
            Ok(stream) => {
                let artifact = finalize(stream);
                inner.artifacts.insert(artifact.clone());
                JobOutcome::Completed(artifact)
            }
            Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
            Err(err) => JobOutcome::Failed(err),
        };

        debug!(
            job_id = %job_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Encoder worker finished"
        );
        inner.record_outcome(job_id, &outcome);
        let _ = outcome_tx.send(outcome);
    }
}

/// Caller side of a started job.
pub struct JobHandle {
    job_id: Uuid,
    total_frames: usize,
    progress_rx: mpsc::UnboundedReceiver<u8>,
    outcome_rx: oneshot::Receiver<JobOutcome>,
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("total_frames", &self.total_frames)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.job_id
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Next progress value, or `None` once the worker closed the stream.
    pub async fn next_progress(&mut self) -> Option<u8> {
        self.progress_rx.recv().await
    }

    /// Drain the progress stream into `on_progress`, then deliver the
    /// terminal outcome and return the controller to `Idle`.
    pub async fn wait_with_progress(mut self, mut on_progress: impl FnMut(u8)) -> JobOutcome {
        while let Some(percent) = self.progress_rx.recv().await {
            on_progress(percent);
        }

        let outcome = match self.outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = PipelineError::encode(None, "encoder worker exited without an outcome");
                let outcome = JobOutcome::Failed(err);
                self.inner.record_outcome(self.job_id, &outcome);
                outcome
            }
        };
        self.inner.acknowledge(self.job_id);
        outcome
    }

    pub async fn wait(self) -> JobOutcome {
        self.wait_with_progress(|_| {}).await
    }
}

use crate::{
    config::env_parse,
    models::{ApiError, ResearchRequest},
    pipeline::Pipeline,
    rows::RowStatus,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info};
use uuid::Uuid;

const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);
const MAX_TRACKED_JOBS: usize = 10_000;

/// Background runner for triggered requests. Jobs are received in order and
/// each runs on its own task; at most `concurrency` run at once. Finished
/// jobs stay visible for `JOB_RETENTION_SECS` (default one hour).
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<ResearchRequest>,
    statuses: Arc<Mutex<Statuses>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { row_key: String, status: RowStatus },
    Failed { error: String, stage: Option<String> },
}

impl JobState {
    fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

struct Tracked {
    state: JobState,
    updated: Instant,
}

struct Statuses {
    jobs: HashMap<Uuid, Tracked>,
    retention: Duration,
    cap: usize,
}

impl Statuses {
    fn new(retention: Duration, cap: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            retention,
            cap: cap.max(1),
        }
    }

    fn set(&mut self, id: Uuid, state: JobState) {
        let now = Instant::now();
        self.jobs.insert(id, Tracked { state, updated: now });
        self.prune(now);
    }

    /// Drops finished jobs past their retention, then the oldest finished
    /// jobs while the map is over its cap. Queued and running jobs are kept.
    fn prune(&mut self, now: Instant) {
        let retention = self.retention;
        self.jobs.retain(|_, tracked| {
            !tracked.state.is_finished() || now.duration_since(tracked.updated) < retention
        });
        if self.jobs.len() <= self.cap {
            return;
        }
        let mut finished: Vec<(Instant, Uuid)> = self
            .jobs
            .iter()
            .filter(|(_, tracked)| tracked.state.is_finished())
            .map(|(id, tracked)| (tracked.updated, *id))
            .collect();
        finished.sort();
        let excess = self.jobs.len() - self.cap;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
        debug!(target = "research.api", tracked = self.jobs.len(), "job statuses pruned");
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize, concurrency: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ResearchRequest>(capacity.max(1));
        let retention = env_parse::<u64>("JOB_RETENTION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETENTION);
        let statuses = Arc::new(Mutex::new(Statuses::new(retention, MAX_TRACKED_JOBS)));
        let statuses_bg = statuses.clone();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let pipeline = pipeline.clone();
                let statuses = statuses_bg.clone();
                tokio::spawn(async move {
                    let id = request.request_id;
                    statuses.lock().await.set(id, JobState::Running);
                    let state = match pipeline.run(request).await {
                        Ok(outcome) => JobState::Completed {
                            row_key: outcome.row_key,
                            status: outcome.status,
                        },
                        Err(err) => JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        },
                    };
                    statuses.lock().await.set(id, state);
                    drop(permit);
                });
            }
            error!(target = "research.api", "job queue closed");
        });

        (Self { tx, statuses }, handle)
    }

    /// The job id is the request id.
    pub async fn enqueue(&self, request: ResearchRequest) -> Result<Uuid, ApiError> {
        let id = request.request_id;
        self.statuses.lock().await.set(id, JobState::Queued);
        if self.tx.send(request).await.is_err() {
            self.statuses.lock().await.jobs.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        info!(target = "research.api", job_id = %id, "research job queued");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.jobs.get(&id).map(|tracked| JobInfo {
            id: id.to_string(),
            state: tracked.state.clone(),
        })
    }
}

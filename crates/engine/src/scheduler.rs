//! The job scheduler turns a built task graph into jobs and drives them through
//! a bounded worker pool.
//!
//! `Scheduler::submit` creates one `JobInstance` per task (in topological
//! order) and spawns a driver that repeatedly dispatches every job whose
//! graph predecessors have all completed. Actual execution is gated by the
//! process-wide [`WorkerPool`]: at most `max_workers` computations run at
//! once, across *all* active submissions. A long-running computation simply
//! occupies its worker slot; that is the engine's backpressure.
//!
//! Failure policy: a failed job's direct and transitive downstream jobs are
//! transitioned to Skipped (their inputs can never become ready) while
//! independent branches keep running. There are no automatic retries.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use computations::{Computation, ExecutionContext};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, TaskConfig};
use crate::graph::TaskGraph;
use crate::store::{DataNodeStore, WriteSource};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Execution configuration / worker pool
// ---------------------------------------------------------------------------

/// How jobs are executed. Only an in-process pool exists today; a distributed
/// mode would slot in here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Standalone,
}

/// Process-wide execution settings, fixed before the first submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobExecutionConfig {
    pub mode: ExecutionMode,
    /// Number of worker slots shared by every submission in the process.
    pub max_workers: usize,
}

impl Default for JobExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Standalone,
            max_workers: 2,
        }
    }
}

impl JobExecutionConfig {
    pub fn standalone(max_workers: usize) -> Self {
        Self {
            mode: ExecutionMode::Standalone,
            max_workers,
        }
    }
}

/// The shared, fixed-size worker pool. Constructed once per process, before
/// any submission; the size is not reconfigurable while submissions are in
/// flight.
#[derive(Debug)]
pub struct WorkerPool {
    config: JobExecutionConfig,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(config: JobExecutionConfig) -> Self {
        let slots = config.max_workers.max(1);
        Self {
            config,
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn config(&self) -> JobExecutionConfig {
        self.config
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(JobExecutionConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle of one task's execution attempt within one submission.
///
/// `Pending -> Running -> {Completed | Failed}`; `Pending -> Skipped` when an
/// upstream job failed (or the submission was cancelled before the job
/// started); `Running -> Cancelled` when a cancelled submission's job ran to
/// completion and its outputs were discarded. Everything but Pending/Running
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

/// One task's execution attempt. Created at submission, never resurrected
/// once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub task_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Message of the wrapped computation error, when `state` is Failed.
    pub error: Option<String>,
}

impl JobInstance {
    fn pending(task_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    fn mark_running(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
    }

    fn mark_completed(&mut self) {
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
    }

    fn mark_failed(&mut self, message: String) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(message);
    }

    fn mark_skipped(&mut self) {
        self.state = JobState::Skipped;
        self.finished_at = Some(Utc::now());
    }

    fn mark_cancelled(&mut self) {
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Submission handle
// ---------------------------------------------------------------------------

/// Aggregate outcome of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Running,
    /// Every job completed.
    Completed,
    /// At least one job failed; per-job detail is on the handle.
    Failed,
    /// The submission was cancelled before every job could complete.
    Cancelled,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubmissionStatus::Running)
    }
}

/// Handle to an in-flight (or finished) submission. Cheap to clone; all
/// clones observe the same jobs and status.
///
/// Task-level failures never surface as errors here; inspect the per-job
/// states instead.
#[derive(Debug, Clone)]
pub struct Submission {
    id: Uuid,
    scenario_instance_id: Uuid,
    jobs: Arc<RwLock<Vec<JobInstance>>>,
    status: watch::Receiver<SubmissionStatus>,
    token: CancellationToken,
}

impl Submission {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scenario_instance_id(&self) -> Uuid {
        self.scenario_instance_id
    }

    /// Current aggregate status.
    pub fn status(&self) -> SubmissionStatus {
        *self.status.borrow()
    }

    /// Snapshot of every job, in topological order.
    pub fn jobs(&self) -> Vec<JobInstance> {
        self.jobs.read().unwrap().clone()
    }

    /// Snapshot of the job created for `task_id`, if the graph contains it.
    pub fn job(&self, task_id: &str) -> Option<JobInstance> {
        self.jobs
            .read()
            .unwrap()
            .iter()
            .find(|job| job.task_id == task_id)
            .cloned()
    }

    /// Request cancellation: pending jobs are skipped immediately, running
    /// jobs are asked to stop cooperatively (outputs of a job that keeps
    /// running anyway are discarded).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait until every job has reached a terminal state.
    pub async fn wait(&self) -> SubmissionStatus {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if status.changed().await.is_err() {
                // Driver finished and dropped the sender; the last value is
                // the final status.
                return *status.borrow();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Dispatches submissions onto the shared worker pool.
pub struct Scheduler {
    config: Arc<EngineConfig>,
    store: Arc<DataNodeStore>,
    pool: Arc<WorkerPool>,
}

impl Scheduler {
    pub fn new(config: Arc<EngineConfig>, store: Arc<DataNodeStore>, pool: Arc<WorkerPool>) -> Self {
        Self { config, store, pool }
    }

    /// Start executing `graph` against `instance_id` and return a handle.
    ///
    /// Must be called from within a tokio runtime: the submission driver is
    /// spawned as a background task.
    ///
    /// # Errors
    /// [`EngineError::NotWritten`] if an external input (a data node with no
    /// producing task) has never been written: the submission could never
    /// drain. Job-level failures do not error; they end up on the handle.
    pub fn submit(
        &self,
        graph: Arc<TaskGraph>,
        instance_id: Uuid,
    ) -> Result<Submission, EngineError> {
        for node_id in graph.external_inputs() {
            if !self.store.is_written(instance_id, &node_id) {
                return Err(EngineError::NotWritten {
                    instance: instance_id,
                    data_node: node_id,
                });
            }
        }

        let jobs: Vec<JobInstance> = graph
            .nodes()
            .iter()
            .map(|node| JobInstance::pending(node.task.id.clone()))
            .collect();
        let jobs = Arc::new(RwLock::new(jobs));
        let (status_tx, status_rx) = watch::channel(SubmissionStatus::Running);
        let token = CancellationToken::new();
        let submission_id = Uuid::new_v4();

        info!(
            submission = %submission_id,
            scenario = graph.scenario_id(),
            jobs = graph.len(),
            "submission accepted"
        );

        tokio::spawn(run_submission(
            submission_id,
            Arc::clone(&graph),
            instance_id,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.pool),
            Arc::clone(&jobs),
            token.clone(),
            status_tx,
        ));

        Ok(Submission {
            id: submission_id,
            scenario_instance_id: instance_id,
            jobs,
            status: status_rx,
            token,
        })
    }
}

// ---------------------------------------------------------------------------
// Submission driver
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(submission = %submission_id, scenario = graph.scenario_id()))]
async fn run_submission(
    submission_id: Uuid,
    graph: Arc<TaskGraph>,
    instance_id: Uuid,
    config: Arc<EngineConfig>,
    store: Arc<DataNodeStore>,
    pool: Arc<WorkerPool>,
    jobs: Arc<RwLock<Vec<JobInstance>>>,
    token: CancellationToken,
    status_tx: watch::Sender<SubmissionStatus>,
) {
    let mut join_set: JoinSet<(usize, JobOutcome)> = JoinSet::new();
    let mut dispatched: HashSet<usize> = HashSet::new();

    loop {
        let cancelled = token.is_cancelled();
        if cancelled {
            // Jobs that never reached a worker are skipped right away.
            let mut guard = jobs.write().unwrap();
            for (index, job) in guard.iter_mut().enumerate() {
                if !dispatched.contains(&index) && job.state == JobState::Pending {
                    job.mark_skipped();
                }
            }
        } else {
            for index in ready_jobs(&graph, &jobs, &dispatched) {
                dispatched.insert(index);
                let node = &graph.nodes()[index];
                let computation = config
                    .computation(&node.task.computation)
                    .expect("validated at registration")
                    .clone();
                join_set.spawn(run_job(
                    index,
                    node.task.clone(),
                    computation,
                    Arc::clone(&store),
                    instance_id,
                    Arc::clone(&jobs),
                    Arc::clone(&pool.permits),
                    token.clone(),
                ));
            }
        }

        if join_set.is_empty() {
            break;
        }

        tokio::select! {
            joined = join_set.join_next() => match joined {
                Some(Ok((index, outcome))) => {
                    if outcome == JobOutcome::Failed {
                        skip_downstream(&graph, &jobs, index);
                    }
                }
                Some(Err(join_error)) => {
                    error!(%join_error, "worker task aborted");
                }
                None => {}
            },
            // Wake immediately on first cancellation to skip pending jobs;
            // afterwards only job completions move the loop forward.
            _ = token.cancelled(), if !cancelled => {}
        }
    }

    // Anything still Pending is unreachable now (upstream failed, was skipped
    // or was cancelled); its inputs can never become ready.
    {
        let mut guard = jobs.write().unwrap();
        for job in guard.iter_mut() {
            if job.state == JobState::Pending {
                job.mark_skipped();
            }
        }
    }

    let final_status = {
        let guard = jobs.read().unwrap();
        let any_failed = guard.iter().any(|job| job.state == JobState::Failed);
        let all_completed = guard.iter().all(|job| job.state == JobState::Completed);
        if any_failed {
            SubmissionStatus::Failed
        } else if token.is_cancelled() && !all_completed {
            SubmissionStatus::Cancelled
        } else {
            SubmissionStatus::Completed
        }
    };

    info!(status = ?final_status, "submission finished");
    let _ = status_tx.send(final_status);
}

/// Pending, not-yet-dispatched jobs whose every graph predecessor has
/// completed. Predecessor state, not data-node written-ness, is the gate: a
/// produced data node may carry a config default (written from creation), and
/// its consumer must still wait for the producer. External inputs have no
/// predecessor and were pre-flight checked at submission. Ascending index
/// order = topological order with declaration-order tie-breaks.
fn ready_jobs(
    graph: &TaskGraph,
    jobs: &RwLock<Vec<JobInstance>>,
    dispatched: &HashSet<usize>,
) -> Vec<usize> {
    let guard = jobs.read().unwrap();
    (0..graph.len())
        .filter(|index| !dispatched.contains(index))
        .filter(|&index| guard[index].state == JobState::Pending)
        .filter(|&index| {
            graph
                .predecessors(index)
                .iter()
                .all(|&pred| guard[pred].state == JobState::Completed)
        })
        .collect()
}

/// Mark every pending transitive successor of `failed` as Skipped. None of
/// them can have been dispatched: their predecessors never all completed.
fn skip_downstream(graph: &TaskGraph, jobs: &RwLock<Vec<JobInstance>>, failed: usize) {
    let mut guard = jobs.write().unwrap();
    let mut frontier = vec![failed];
    let mut seen = HashSet::new();
    while let Some(index) = frontier.pop() {
        for &next in graph.successors(index) {
            if seen.insert(next) {
                if guard[next].state == JobState::Pending {
                    warn!(task = %guard[next].task_id, "skipping: upstream job failed");
                    guard[next].mark_skipped();
                }
                frontier.push(next);
            }
        }
    }
}

/// Execute one job on the shared pool.
#[allow(clippy::too_many_arguments)]
async fn run_job(
    index: usize,
    task: TaskConfig,
    computation: Arc<dyn Computation>,
    store: Arc<DataNodeStore>,
    instance_id: Uuid,
    jobs: Arc<RwLock<Vec<JobInstance>>>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
) -> (usize, JobOutcome) {
    let mark_failed = |message: String| {
        jobs.write().unwrap()[index].mark_failed(message);
    };

    let permit = match Arc::clone(&permits).acquire_owned().await {
        Ok(permit) => permit,
        // The pool only closes when the process is shutting down.
        Err(_) => {
            jobs.write().unwrap()[index].mark_skipped();
            return (index, JobOutcome::Skipped);
        }
    };

    // Dispatched but cancelled before a worker slot opened: never started.
    if token.is_cancelled() {
        jobs.write().unwrap()[index].mark_skipped();
        return (index, JobOutcome::Skipped);
    }

    let job_id = {
        let mut guard = jobs.write().unwrap();
        guard[index].mark_running();
        guard[index].id
    };
    info!(task = %task.id, job = %job_id, "job started");

    let mut inputs = Vec::with_capacity(task.inputs.len());
    for node_id in &task.inputs {
        match store.read(instance_id, node_id) {
            Ok(value) => inputs.push(value),
            Err(err) => {
                // Readiness guaranteed a write; losing it is a bug upstream.
                error!(task = %task.id, %err, "input vanished before execution");
                mark_failed(err.to_string());
                return (index, JobOutcome::Failed);
            }
        }
    }

    let ctx = ExecutionContext {
        scenario_instance_id: instance_id,
        job_id,
        task_id: task.id.clone(),
        cancellation: token.child_token(),
    };
    let result = computation.run(inputs, &ctx).await;
    drop(permit);

    if token.is_cancelled() {
        warn!(task = %task.id, "submission cancelled; discarding outputs");
        jobs.write().unwrap()[index].mark_cancelled();
        return (index, JobOutcome::Cancelled);
    }

    match result {
        Ok(outputs) if outputs.len() != task.outputs.len() => {
            let err = EngineError::TaskExecution {
                task: task.id.clone(),
                message: format!(
                    "declared {} output(s), computation returned {}",
                    task.outputs.len(),
                    outputs.len()
                ),
            };
            error!(%err, "job failed");
            mark_failed(err.to_string());
            (index, JobOutcome::Failed)
        }
        Ok(outputs) => {
            // One write at a time so downstream jobs may start as soon as the
            // specific input they need is committed.
            for (node_id, value) in task.outputs.iter().zip(outputs) {
                if let Err(err) =
                    store.write(instance_id, node_id, value, WriteSource::Task(task.id.clone()))
                {
                    error!(task = %task.id, %err, "output write rejected");
                    mark_failed(err.to_string());
                    return (index, JobOutcome::Failed);
                }
            }
            info!(task = %task.id, job = %job_id, "job completed");
            jobs.write().unwrap()[index].mark_completed();
            (index, JobOutcome::Completed)
        }
        Err(computation_error) => {
            let err = EngineError::TaskExecution {
                task: task.id.clone(),
                message: computation_error.to_string(),
            };
            error!(%err, "job failed");
            mark_failed(err.to_string());
            (index, JobOutcome::Failed)
        }
    }
}

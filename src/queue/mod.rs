pub mod events;
pub mod job;
pub mod store;

use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::enhancement::{ConfigError, EnhancementConfig};
use crate::pipeline::PipelineError;
pub use events::{CurrentJob, EventSink, FailedJob, LogLevel, QueueEvent, QueueObserver, QueueStatus, TracingObserver};
pub use job::{Job, JobStatus, OutputPaths};
pub use store::{QueueStore, StoreError};

/// Everything a runner needs for one job, snapshotted when the job starts
pub struct JobContext {
    pub job: Job,
    pub config: EnhancementConfig,
    pub credential: String,
    pub events: EventSink,
    /// Records outputs on the job while it is still running
    pub outputs: OutputSink,
}

/// Callback receiving a job's outputs each time a file is written
///
/// Lets a job that fails halfway keep the paths it already produced.
#[derive(Clone)]
pub struct OutputSink(Arc<dyn Fn(&OutputPaths) + Send + Sync>);

impl OutputSink {
    pub fn new(f: impl Fn(&OutputPaths) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn record(&self, outputs: &OutputPaths) {
        (self.0)(outputs)
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

/// Executes a single job; the scheduler's only view of the pipeline
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, ctx: JobContext) -> impl Future<Output = Result<OutputPaths, PipelineError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("The scheduler must be opened inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_retries: u32,
    /// Backoff after the n-th failure is `backoff_base * 2^n`
    pub backoff_base: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl SchedulerSettings {
    pub fn backoff_for(&self, retries: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(retries))
    }
}

struct State {
    jobs: Vec<Job>,
    credential: Option<String>,
    enabled: bool,
    config: EnhancementConfig,
    /// A loop task is alive
    running: bool,
    /// Id of the job in `processing`
    current: Option<String>,
    cancel: CancellationToken,
    /// Bumped on every mutation, orders snapshots handed to the store
    revision: u64,
}

impl State {
    fn can_run(&self) -> bool {
        self.enabled && self.credential.is_some() && !self.cancel.is_cancelled()
    }

    fn has_pending(&self) -> bool {
        self.jobs.iter().any(|j| j.status == JobStatus::Pending)
    }

    fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn status(&self) -> QueueStatus {
        let mut status = QueueStatus {
            has_api_key: self.credential.is_some(),
            enabled: self.enabled,
            is_processing: self.current.is_some(),
            ..QueueStatus::default()
        };
        for job in &self.jobs {
            match job.status {
                JobStatus::Pending => status.pending += 1,
                JobStatus::Processing => status.processing += 1,
                JobStatus::Completed => status.completed += 1,
                JobStatus::Failed => status.failed += 1,
            }
        }
        status.current = self
            .current
            .as_deref()
            .and_then(|id| self.jobs.iter().find(|j| j.id == id))
            .map(|job| CurrentJob {
                id: job.id.clone(),
                group_label: job.group_label.clone(),
                base_name: job.base_name.clone(),
            });
        status
    }
}

struct Inner<R> {
    state: Mutex<State>,
    store: QueueStore,
    runner: Arc<R>,
    settings: SchedulerSettings,
    events: EventSink,
    status_tx: watch::Sender<QueueStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    /// Revision last written to the queue file
    persisted: Mutex<u64>,
}

/// Durable single-worker job queue
///
/// Cheap to clone; all clones share one job list. Every mutation rewrites
/// the queue file and publishes the new status. Methods that may start work
/// spawn onto the runtime captured by [`Scheduler::open`].
pub struct Scheduler<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: JobRunner> Scheduler<R> {
    /// Load the persisted queue and build a scheduler around it
    ///
    /// Starts disabled and without a credential.
    pub fn open(store: QueueStore, runner: R, settings: SchedulerSettings) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let jobs = store.load()?;

        let state = State {
            jobs,
            credential: None,
            enabled: false,
            config: EnhancementConfig::default(),
            running: false,
            current: None,
            cancel: CancellationToken::new(),
            revision: 0,
        };
        let (status_tx, _) = watch::channel(state.status());

        let scheduler = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                store,
                runner: Arc::new(runner),
                settings,
                events: EventSink::default(),
                status_tx,
                task: Mutex::new(None),
                runtime,
                persisted: Mutex::new(0),
            }),
        };
        // Reload may have demoted or dropped jobs
        scheduler.mutate(|_, _| ());
        Ok(scheduler)
    }

    pub fn runner(&self) -> &R {
        &self.inner.runner
    }

    pub fn subscribe(&self, observer: Arc<dyn QueueObserver>) {
        self.inner.events.subscribe(observer);
    }

    /// Receiver updated after every mutation
    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn enqueue(
        &self,
        source_path: impl Into<PathBuf>,
        output_folder: impl Into<PathBuf>,
        group_label: impl Into<String>,
        base_name: impl Into<String>,
    ) -> String {
        let job = Job::new(source_path, output_folder, group_label, base_name);
        let id = job.id.clone();
        tracing::info!(job_id = %id, source = %job.source_path.display(), "Enqueued job");

        self.mutate(|state, events| {
            events.push(QueueEvent::Log {
                level: LogLevel::Info,
                message: format!("Queued {}", job.label()),
            });
            state.jobs.push(job);
        });
        self.kick();
        id
    }

    pub fn set_credential(&self, credential: Option<String>) {
        let credential = credential.filter(|c| !c.trim().is_empty());
        self.mutate(|state, _| state.credential = credential);
        self.kick();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.mutate(|state, _| {
            state.enabled = enabled;
            if enabled && state.cancel.is_cancelled() {
                state.cancel = CancellationToken::new();
            }
        });
        self.kick();
    }

    /// Replace the enhancement config used by jobs started from now on
    pub fn set_config(&self, config: EnhancementConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.lock().config = config;
        Ok(())
    }

    pub fn config(&self) -> EnhancementConfig {
        self.lock().config.clone()
    }

    /// Halt processing and disable auto-start
    ///
    /// A job in flight goes back to `pending` with its retry count intact.
    pub fn stop(&self) {
        self.mutate(|state, events| {
            state.enabled = false;
            state.cancel.cancel();
            if let Some(label) = Self::release_current(state) {
                events.push(QueueEvent::Log {
                    level: LogLevel::Warning,
                    message: format!("Stopped, {} returned to the queue", label),
                });
            }
        });
    }

    /// Failed job back to pending with a fresh retry budget
    pub fn retry(&self, job_id: &str) -> bool {
        let found = self.mutate(|state, events| match state.job_mut(job_id) {
            Some(job) if job.status == JobStatus::Failed => {
                reset_for_retry(job);
                events.push(QueueEvent::Log {
                    level: LogLevel::Info,
                    message: format!("Retrying {}", job.label()),
                });
                true
            }
            _ => false,
        });
        if found {
            self.kick();
        }
        found
    }

    pub fn retry_all(&self) -> usize {
        let count = self.mutate(|state, events| {
            let mut count = 0;
            for job in state.jobs.iter_mut().filter(|j| j.status == JobStatus::Failed) {
                reset_for_retry(job);
                count += 1;
            }
            if count > 0 {
                events.push(QueueEvent::Log {
                    level: LogLevel::Info,
                    message: format!("Retrying {} failed job(s)", count),
                });
            }
            count
        });
        if count > 0 {
            self.kick();
        }
        count
    }

    pub fn clear_completed(&self) -> usize {
        self.mutate(|state, _| {
            let before = state.jobs.len();
            state.jobs.retain(|j| j.status != JobStatus::Completed);
            before - state.jobs.len()
        })
    }

    /// Remove pending and processing jobs, and failed ones when asked
    ///
    /// Halts the job in flight. Completed jobs always stay. The enabled flag
    /// keeps its value, so new jobs start as soon as they are enqueued.
    pub fn clear_queue(&self, include_failed: bool) -> usize {
        self.mutate(|state, events| {
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.current = None;

            let before = state.jobs.len();
            state.jobs.retain(|j| match j.status {
                JobStatus::Pending | JobStatus::Processing => false,
                JobStatus::Failed => !include_failed,
                JobStatus::Completed => true,
            });
            let removed = before - state.jobs.len();
            events.push(QueueEvent::Log {
                level: LogLevel::Info,
                message: format!("Cleared {} job(s) from the queue", removed),
            });
            removed
        })
    }

    pub fn status(&self) -> QueueStatus {
        self.lock().status()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| FailedJob {
                id: j.id.clone(),
                group_label: j.group_label.clone(),
                base_name: j.base_name.clone(),
                error: j.error.clone(),
                retries: j.retries,
            })
            .collect()
    }

    /// Write the queue file now, reporting failures to the caller
    pub fn save(&self) -> Result<(), StoreError> {
        let (revision, jobs) = {
            let state = self.lock();
            (state.revision, state.jobs.clone())
        };
        self.persist(revision, &jobs, true)
    }

    /// Resolve once nothing is pending or in flight
    pub async fn wait_until_idle(&self) {
        let mut rx = self.watch_status();
        // Only fails if the sender is gone, which cannot happen while `self` lives
        let _ = rx.wait_for(|s| s.pending == 0 && !s.is_processing).await;
    }

    /// Stop and wait for the loop task to exit
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation, persist, then notify outside the lock
    fn mutate<T>(&self, f: impl FnOnce(&mut State, &mut Vec<QueueEvent>) -> T) -> T {
        let mut events = Vec::new();
        let (result, status, revision, jobs) = {
            let mut state = self.lock();
            let result = f(&mut state, &mut events);
            state.revision += 1;
            (result, state.status(), state.revision, state.jobs.clone())
        };

        // Disk IO happens outside the state lock
        if let Err(e) = self.persist(revision, &jobs, false) {
            tracing::error!(error = %e, path = %self.inner.store.path().display(), "Failed to persist queue");
            events.push(QueueEvent::Log {
                level: LogLevel::Error,
                message: format!("Failed to save queue: {}", e),
            });
        }

        self.inner.status_tx.send_replace(status.clone());
        for event in &events {
            self.inner.events.emit(event);
        }
        self.inner.events.emit(&QueueEvent::StatusChanged(status));
        result
    }

    /// Write a snapshot unless a newer one already reached the file
    fn persist(&self, revision: u64, jobs: &[Job], force: bool) -> Result<(), StoreError> {
        let mut persisted = self.inner.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if revision < *persisted || (revision == *persisted && !force) {
            return Ok(());
        }
        self.inner.store.save(jobs)?;
        *persisted = revision;
        Ok(())
    }

    /// Revert the in-flight job to pending, returning its label
    fn release_current(state: &mut State) -> Option<String> {
        let id = state.current.take()?;
        let job = state.job_mut(&id)?;
        if job.status != JobStatus::Processing {
            return None;
        }
        job.status = JobStatus::Pending;
        Some(job.label())
    }

    /// Start the loop task if it is idle and allowed to run
    fn kick(&self) {
        {
            let mut state = self.lock();
            if state.running || !state.can_run() || !state.has_pending() {
                return;
            }
            state.running = true;
        }

        let this = self.clone();
        let handle = self.inner.runtime.spawn(async move { this.run_loop().await });
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn run_loop(self) {
        tracing::debug!("Scheduler loop started");
        while let Some((ctx, token)) = self.take_next() {
            let job_id = ctx.job.id.clone();
            let label = ctx.job.label();

            let runner = self.inner.runner.clone();
            let mut handle = self.inner.runtime.spawn(async move { runner.run(ctx).await });

            let result = tokio::select! {
                joined = &mut handle => match joined {
                    Ok(result) => result,
                    Err(e) => Err(PipelineError::Join(e.to_string())),
                },
                _ = token.cancelled() => {
                    handle.abort();
                    tracing::info!(job_id = %job_id, "Job interrupted");
                    continue;
                }
            };

            if let Some(delay) = self.finish(&job_id, &label, result) {
                tracing::info!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Backing off before next job");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }

            tokio::task::yield_now().await;
        }
        tracing::debug!("Scheduler loop idle");
    }

    /// Claim the first pending job, or mark the loop as stopped
    fn take_next(&self) -> Option<(JobContext, CancellationToken)> {
        let next = self.mutate(|state, events| {
            let credential = match state.credential.clone() {
                Some(credential) if state.can_run() => credential,
                _ => {
                    state.running = false;
                    return None;
                }
            };
            let config = state.config.clone();
            let Some(job) = state.jobs.iter_mut().find(|j| j.status == JobStatus::Pending) else {
                state.running = false;
                return None;
            };

            job.status = JobStatus::Processing;
            job.error = None;
            let job = job.clone();
            state.current = Some(job.id.clone());
            events.push(QueueEvent::Log {
                level: LogLevel::Info,
                message: format!("Processing {}", job.label()),
            });

            let this = self.clone();
            let job_id = job.id.clone();
            let ctx = JobContext {
                job,
                config,
                credential,
                events: self.inner.events.clone(),
                outputs: OutputSink::new(move |outputs| this.record_outputs(&job_id, outputs)),
            };
            Some((ctx, state.cancel.clone()))
        });

        if let Some((ctx, _)) = &next {
            tracing::info!(job_id = %ctx.job.id, attempt = ctx.job.retries + 1, "Starting job");
        }
        next
    }

    /// Store outputs written so far, unless the job was stopped or removed
    fn record_outputs(&self, job_id: &str, outputs: &OutputPaths) {
        self.mutate(|state, _| {
            if state.current.as_deref() != Some(job_id) {
                return;
            }
            if let Some(job) = state.job_mut(job_id) {
                job.outputs = outputs.clone();
            }
        });
    }

    /// Record a job outcome; returns the backoff to wait on a retryable failure
    fn finish(&self, job_id: &str, label: &str, result: Result<OutputPaths, PipelineError>) -> Option<Duration> {
        let max_retries = self.inner.settings.max_retries;
        let settings = &self.inner.settings;

        self.mutate(|state, events| {
            if state.current.as_deref() == Some(job_id) {
                state.current = None;
            }
            let job = match state.job_mut(job_id) {
                Some(job) if job.status == JobStatus::Processing => job,
                _ => {
                    tracing::info!(job_id, "Job was stopped or removed while running, result discarded");
                    return None;
                }
            };

            match result {
                Ok(outputs) => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    job.error = None;
                    job.outputs = outputs.clone();
                    tracing::info!(job_id, outputs = outputs.len(), "Job completed");
                    events.push(QueueEvent::Log {
                        level: LogLevel::Success,
                        message: format!("Completed {}", label),
                    });
                    events.push(QueueEvent::JobCompleted {
                        job_id: job_id.to_string(),
                        outputs,
                    });
                    None
                }
                // Outputs recorded while running stay on the job
                Err(e) => {
                    job.retries = (job.retries + 1).min(max_retries);
                    job.error = Some(e.to_string());
                    if job.retries >= max_retries {
                        job.status = JobStatus::Failed;
                        tracing::error!(job_id, retries = job.retries, error = %e, "Job failed permanently");
                        events.push(QueueEvent::Log {
                            level: LogLevel::Error,
                            message: format!("Failed {} after {} attempts: {}", label, job.retries, e),
                        });
                        None
                    } else {
                        job.status = JobStatus::Pending;
                        let delay = settings.backoff_for(job.retries);
                        tracing::warn!(job_id, retries = job.retries, error = %e, "Job failed, will retry");
                        events.push(QueueEvent::Log {
                            level: LogLevel::Warning,
                            message: format!(
                                "{} failed (attempt {}/{}), retrying in {}: {}",
                                label,
                                job.retries,
                                max_retries,
                                crate::utils::format_duration(delay),
                                e
                            ),
                        });
                        Some(delay)
                    }
                }
            }
        })
    }
}

fn reset_for_retry(job: &mut Job) {
    job.status = JobStatus::Pending;
    job.retries = 0;
    job.error = None;
}

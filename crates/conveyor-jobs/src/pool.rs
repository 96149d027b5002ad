// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded worker pool.
//!
//! Each submitted job becomes a task that parks until one of `max_workers`
//! semaphore permits is free, claims the job in the store (`queued` →
//! `running`), heartbeats while the handler runs, and records the outcome.
//! Job errors and panics never escape the task.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_jobs_db::{JobPatch, JobRecord, JobStatus, JobStore};
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{classify, classify_error, ClassifiedError, ErrorCategory};
use crate::context::{Cancellable, ExecutionControl, JobContext};
use crate::error::{JobError, Result};
use crate::handler::{JobHandler, JobOutput};
use crate::retry::{should_retry, RetryPolicy};
use crate::tracker::JobRunTracker;

/// How long released jobs get to record their hand-back after a forced shutdown.
const RELEASE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
	pub max_workers: usize,
	pub heartbeat_interval: Duration,
	pub retry_policy: RetryPolicy,
}

impl Default for WorkerPoolConfig {
	fn default() -> Self {
		Self {
			max_workers: std::thread::available_parallelism()
				.map(|n| n.get())
				.unwrap_or(4),
			heartbeat_interval: Duration::from_secs(30),
			retry_policy: RetryPolicy::default(),
		}
	}
}

/// What happened to one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
	Succeeded,
	RetryScheduled {
		retry_count: u32,
		retry_at: DateTime<Utc>,
	},
	Failed {
		error: String,
		category: ErrorCategory,
	},
	Cancelled,
	/// Handed back to the queue on shutdown; no attempt was counted.
	Released,
	/// The job was no longer queued when a slot came free.
	Skipped,
	/// The job changed underneath the worker (usually stale recovery); the
	/// outcome was not recorded.
	Superseded,
	/// A store error prevented recording the outcome.
	Abandoned,
}

pub struct JobHandle {
	job_id: String,
	rx: oneshot::Receiver<ExecutionOutcome>,
}

impl JobHandle {
	pub fn job_id(&self) -> &str {
		&self.job_id
	}

	pub async fn wait(self) -> ExecutionOutcome {
		self.rx.await.unwrap_or(ExecutionOutcome::Abandoned)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
	Waiting,
	Running,
}

struct ActiveJob {
	control: ExecutionControl,
	state: SlotState,
}

#[derive(Clone)]
pub struct WorkerPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	store: Arc<dyn JobStore>,
	config: WorkerPoolConfig,
	semaphore: Arc<Semaphore>,
	active: Mutex<HashMap<String, ActiveJob>>,
	tasks: TaskTracker,
	closing: tokio_util::sync::CancellationToken,
	worker_seq: AtomicU64,
	instance_id: String,
}

impl WorkerPool {
	pub fn new(store: Arc<dyn JobStore>, config: WorkerPoolConfig) -> Self {
		let max_workers = config.max_workers.max(1);
		let instance = Uuid::new_v4().simple().to_string();
		info!(max_workers, "starting worker pool");
		Self {
			inner: Arc::new(PoolInner {
				store,
				semaphore: Arc::new(Semaphore::new(max_workers)),
				config,
				active: Mutex::new(HashMap::new()),
				tasks: TaskTracker::new(),
				closing: tokio_util::sync::CancellationToken::new(),
				worker_seq: AtomicU64::new(0),
				instance_id: instance[..8].to_string(),
			}),
		}
	}

	/// Queue `job_id` for execution. The returned handle resolves once the
	/// outcome has been recorded.
	pub fn submit(
		&self,
		job_id: &str,
		payload: Value,
		handler: Arc<dyn JobHandler>,
	) -> Result<JobHandle> {
		if self.inner.closing.is_cancelled() {
			return Err(JobError::PoolClosed);
		}

		let control = ExecutionControl::new();
		{
			let mut active = self.inner.lock_active();
			if active.contains_key(job_id) {
				return Err(JobError::AlreadyActive(job_id.to_string()));
			}
			active.insert(
				job_id.to_string(),
				ActiveJob {
					control: control.clone(),
					state: SlotState::Waiting,
				},
			);
		}

		let (tx, rx) = oneshot::channel();
		let inner = self.inner.clone();
		let id = job_id.to_string();
		let span = tracing::info_span!("job", job_id = %id, job_type = %handler.job_type());
		self.inner.tasks.spawn(
			async move {
				let outcome = inner.execute(&id, payload, handler, control).await;
				inner.lock_active().remove(&id);
				debug!(?outcome, "job finished");
				let _ = tx.send(outcome);
			}
			.instrument(span),
		);

		Ok(JobHandle {
			job_id: job_id.to_string(),
			rx,
		})
	}

	/// Request cancellation. Returns `false` if the job is not in this pool.
	pub fn cancel(&self, job_id: &str, force: bool) -> bool {
		let active = self.inner.lock_active();
		let Some(job) = active.get(job_id) else {
			return false;
		};
		if force {
			job.control.force_cancel();
		} else {
			job.control.cancel();
		}
		info!(job_id, force, "cancellation requested");
		true
	}

	pub fn active_jobs(&self) -> Vec<String> {
		self.inner.lock_active().keys().cloned().collect()
	}

	pub fn contains(&self, job_id: &str) -> bool {
		self.inner.lock_active().contains_key(job_id)
	}

	/// `Queued` while waiting for a slot, `Running` once claimed, `None` if the
	/// job is not in this pool.
	pub fn status(&self, job_id: &str) -> Option<JobStatus> {
		self.inner.lock_active().get(job_id).map(|job| match job.state {
			SlotState::Waiting => JobStatus::Queued,
			SlotState::Running => JobStatus::Running,
		})
	}

	pub fn max_workers(&self) -> usize {
		self.inner.config.max_workers.max(1)
	}

	/// Stop accepting work and drain. Jobs still waiting for a slot stay
	/// queued in the store. Running jobs get `timeout` to finish; after that
	/// they are aborted and released back to `queued`.
	///
	/// Returns `true` if everything finished within `timeout`.
	pub async fn shutdown(&self, timeout: Duration) -> bool {
		info!(timeout_secs = timeout.as_secs_f64(), "shutting down worker pool");
		self.inner.closing.cancel();
		self.inner.tasks.close();

		if tokio::time::timeout(timeout, self.inner.tasks.wait()).await.is_ok() {
			info!("worker pool drained");
			return true;
		}

		let controls: Vec<(String, ExecutionControl)> = self
			.inner
			.lock_active()
			.iter()
			.map(|(id, job)| (id.clone(), job.control.clone()))
			.collect();
		warn!(remaining = controls.len(), "shutdown timeout elapsed, releasing running jobs");
		for (job_id, control) in controls {
			debug!(job_id = %job_id, "releasing job");
			control.release();
			control.force_cancel();
		}

		if tokio::time::timeout(RELEASE_GRACE, self.inner.tasks.wait())
			.await
			.is_err()
		{
			error!("released jobs did not stop in time");
		}
		false
	}
}

impl PoolInner {
	fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
		self.active.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn set_state(&self, job_id: &str, state: SlotState) {
		if let Some(job) = self.lock_active().get_mut(job_id) {
			job.state = state;
		}
	}

	fn next_worker_id(&self) -> String {
		let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
		format!("worker-{}-{seq}", self.instance_id)
	}

	async fn execute(
		&self,
		job_id: &str,
		payload: Value,
		handler: Arc<dyn JobHandler>,
		control: ExecutionControl,
	) -> ExecutionOutcome {
		let _permit = tokio::select! {
			biased;
			_ = control.token.cancelled() => {
				return self.cancel_waiting(job_id).await;
			}
			_ = self.closing.cancelled() => {
				debug!("pool closing, leaving job queued");
				return ExecutionOutcome::Released;
			}
			permit = self.semaphore.clone().acquire_owned() => match permit {
				Ok(permit) => permit,
				Err(_) => return ExecutionOutcome::Released,
			},
		};
		self.set_state(job_id, SlotState::Running);

		let worker_id = self.next_worker_id();
		let tracker = JobRunTracker::new(self.store.clone(), job_id, worker_id.clone());
		match tracker.start().await {
			Ok(true) => {}
			Ok(false) => return ExecutionOutcome::Skipped,
			Err(e) => {
				error!(error = %e, "failed to claim job");
				return ExecutionOutcome::Abandoned;
			}
		}

		let job = match self.store.get_job(job_id).await {
			Ok(Some(job)) => job,
			Ok(None) => {
				error!("claimed job disappeared from the store");
				return ExecutionOutcome::Abandoned;
			}
			Err(e) => {
				error!(error = %e, "failed to load claimed job");
				return ExecutionOutcome::Abandoned;
			}
		};

		info!(
			worker_id = %worker_id,
			attempt = job.retry_count + 1,
			max_retries = job.max_retries,
			correlation_id = ?job.correlation_id,
			"job started"
		);

		let heartbeat = tokio::spawn(
			heartbeat_loop(tracker.clone(), self.config.heartbeat_interval).in_current_span(),
		);

		let ctx = JobContext::new(
			job_id.to_string(),
			job.job_type.clone(),
			job.correlation_id.clone(),
			job.retry_count + 1,
			worker_id,
			&control,
			tracker.clone(),
		);
		let run = tokio::spawn(
			async move { handler.run(&ctx, payload).await }.in_current_span(),
		);
		let abort = run.abort_handle();

		let joined = tokio::select! {
			joined = run => Some(joined),
			_ = control.force.cancelled() => {
				abort.abort();
				control.processes.kill_all();
				None
			}
		};
		heartbeat.abort();

		match joined {
			Some(Ok(Ok(output))) => self.record_success(&tracker, output).await,
			Some(Ok(Err(err))) if matches!(err, JobError::Cancelled) || control.is_cancel_requested() => {
				debug!(error = %err, "handler stopped after cancellation");
				self.record_stop(&tracker, &control).await
			}
			Some(Ok(Err(err))) => {
				self.record_failure(&tracker, &job, classify_job_error(&err))
					.await
			}
			Some(Err(join_err)) if join_err.is_panic() => {
				let message = panic_message(join_err.into_panic());
				error!(panic = %message, "job handler panicked");
				let classified = ClassifiedError::unknown(&format!("job handler panicked: {message}"));
				self.record_failure(&tracker, &job, classified).await
			}
			Some(Err(_)) | None => self.record_stop(&tracker, &control).await,
		}
	}

	async fn cancel_waiting(&self, job_id: &str) -> ExecutionOutcome {
		let patch = JobPatch {
			error: Some(Some("job cancelled".to_string())),
			finished_at: Some(Some(Utc::now())),
			..JobPatch::new()
				.status(JobStatus::Cancelled)
				.only_if(JobStatus::Queued)
		};
		match self.store.update_job_fields(job_id, &patch).await {
			Ok(true) => {
				info!("job cancelled before it started");
				ExecutionOutcome::Cancelled
			}
			Ok(false) => ExecutionOutcome::Skipped,
			Err(e) => {
				error!(error = %e, "failed to record cancellation");
				ExecutionOutcome::Abandoned
			}
		}
	}

	async fn record_success(&self, tracker: &JobRunTracker, output: JobOutput) -> ExecutionOutcome {
		match tracker.succeed(output.result).await {
			Ok(true) => {
				info!(message = %output.message, "job succeeded");
				ExecutionOutcome::Succeeded
			}
			Ok(false) => ExecutionOutcome::Superseded,
			Err(e) => {
				error!(error = %e, "failed to record success");
				ExecutionOutcome::Abandoned
			}
		}
	}

	async fn record_stop(&self, tracker: &JobRunTracker, control: &ExecutionControl) -> ExecutionOutcome {
		let (written, outcome) = if control.is_released() {
			(tracker.release().await, ExecutionOutcome::Released)
		} else {
			(tracker.cancelled().await, ExecutionOutcome::Cancelled)
		};
		match written {
			Ok(true) => {
				info!(outcome = ?outcome, "job stopped");
				outcome
			}
			Ok(false) => ExecutionOutcome::Superseded,
			Err(e) => {
				error!(error = %e, "failed to record stop");
				ExecutionOutcome::Abandoned
			}
		}
	}

	async fn record_failure(
		&self,
		tracker: &JobRunTracker,
		job: &JobRecord,
		classified: ClassifiedError,
	) -> ExecutionOutcome {
		let retry_count = job.retry_count.saturating_add(1);

		if should_retry(&classified, job.retry_count, job.max_retries) {
			let retry_at = self
				.config
				.retry_policy
				.next_retry_at(retry_count, classified.backoff_multiplier);
			warn!(
				retry_count,
				max_retries = job.max_retries,
				category = %classified.category,
				retry_at = %retry_at,
				error = %classified.original_message,
				"job failed, retry scheduled"
			);
			return match tracker.schedule_retry(&classified, retry_count, retry_at).await {
				Ok(true) => ExecutionOutcome::RetryScheduled {
					retry_count,
					retry_at,
				},
				Ok(false) => ExecutionOutcome::Superseded,
				Err(e) => {
					error!(error = %e, "failed to schedule retry");
					ExecutionOutcome::Abandoned
				}
			};
		}

		// permanent failures go straight to the DLQ threshold
		let retry_count = if classified.is_retriable {
			retry_count
		} else {
			retry_count.max(job.max_retries)
		};
		warn!(
			retry_count,
			category = %classified.category,
			error = %classified.original_message,
			"job failed"
		);
		match tracker.fail_terminal(&classified, retry_count).await {
			Ok(true) => ExecutionOutcome::Failed {
				error: classified.original_message,
				category: classified.category,
			},
			Ok(false) => ExecutionOutcome::Superseded,
			Err(e) => {
				error!(error = %e, "failed to record failure");
				ExecutionOutcome::Abandoned
			}
		}
	}
}

async fn heartbeat_loop(tracker: JobRunTracker, interval: Duration) {
	let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
	loop {
		ticker.tick().await;
		match tracker.heartbeat().await {
			Ok(true) => {}
			Ok(false) => {
				debug!("job no longer running, stopping heartbeat");
				return;
			}
			Err(e) => warn!(error = %e, "heartbeat failed"),
		}
	}
}

fn classify_job_error(err: &JobError) -> ClassifiedError {
	match err {
		JobError::InvalidPayload(_)
		| JobError::Permanent(_)
		| JobError::UnknownJobType(_)
		| JobError::Serialization(_) => ClassifiedError::permanent(&err.to_string()),
		JobError::Failed(message) => classify(message),
		other => classify_error(other),
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_jobs_db::{FailureHistoryEntry, JobPatch, JobRecord, JobStatus, JobStore, NewJob};
use tracing::{debug, info, instrument, warn};

use crate::classifier::ErrorCategory;
use crate::error::{JobError, Result};
use crate::handler::HandlerRegistry;
use crate::pool::{JobHandle, WorkerPool};

/// Hands a job that was moved back to `queued` to something that will run it.
#[async_trait]
pub trait JobRescheduler: Send + Sync {
	async fn reschedule(&self, job: &JobRecord) -> Result<()>;
}

/// Connects the store, the handler registry and the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
	store: Arc<dyn JobStore>,
	pool: WorkerPool,
	registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
	pub fn new(store: Arc<dyn JobStore>, pool: WorkerPool, registry: Arc<HandlerRegistry>) -> Self {
		Self {
			store,
			pool,
			registry,
		}
	}

	pub fn pool(&self) -> &WorkerPool {
		&self.pool
	}

	pub fn store(&self) -> &Arc<dyn JobStore> {
		&self.store
	}

	/// Persist a job and submit it. With a live idempotency key the existing
	/// job is returned and only dispatched if it is still queued.
	#[instrument(skip(self, job), fields(job_type = %job.job_type))]
	pub async fn enqueue(&self, job: NewJob) -> Result<(JobRecord, Option<JobHandle>)> {
		let record = self.store.create_job(&job).await?;
		info!(job_id = %record.id, status = %record.status, "job enqueued");

		if record.status != JobStatus::Queued {
			return Ok((record, None));
		}
		let handle = self.dispatch(&record).await?;
		Ok((record, handle))
	}

	/// Submit a queued job to the pool. Returns `None` if it is already there.
	/// A job type with no handler fails the job permanently.
	pub async fn dispatch(&self, job: &JobRecord) -> Result<Option<JobHandle>> {
		let Some(handler) = self.registry.get(&job.job_type) else {
			self.fail_unknown_type(job).await?;
			return Err(JobError::UnknownJobType(job.job_type.clone()));
		};

		match self.pool.submit(&job.id, job.payload.clone(), handler) {
			Ok(handle) => Ok(Some(handle)),
			Err(JobError::AlreadyActive(_)) => {
				debug!(job_id = %job.id, "job already active");
				Ok(None)
			}
			Err(e) => Err(e),
		}
	}

	/// Submit jobs left `queued` by a previous process. Returns how many were
	/// submitted.
	#[instrument(skip(self))]
	pub async fn dispatch_queued(&self, limit: u32) -> Result<usize> {
		let jobs = self.store.find_queued_jobs(limit).await?;
		let mut submitted = 0;
		for job in &jobs {
			match self.dispatch(job).await {
				Ok(Some(_)) => submitted += 1,
				Ok(None) => {}
				Err(JobError::UnknownJobType(job_type)) => {
					warn!(job_id = %job.id, job_type = %job_type, "no handler for queued job");
				}
				Err(e) => return Err(e),
			}
		}
		if submitted > 0 {
			info!(submitted, "dispatched queued jobs");
		}
		Ok(submitted)
	}

	/// Cancel a job in the pool, or a queued job that has not been submitted.
	pub async fn cancel(&self, job_id: &str, force: bool) -> Result<bool> {
		if self.pool.cancel(job_id, force) {
			return Ok(true);
		}
		let patch = JobPatch {
			error: Some(Some("job cancelled".to_string())),
			finished_at: Some(Some(Utc::now())),
			..JobPatch::new()
				.status(JobStatus::Cancelled)
				.only_if(JobStatus::Queued)
		};
		Ok(self.store.update_job_fields(job_id, &patch).await?)
	}

	async fn fail_unknown_type(&self, job: &JobRecord) -> Result<()> {
		let message = JobError::UnknownJobType(job.job_type.clone()).to_string();
		let retry_count = job.retry_count.saturating_add(1).max(job.max_retries);
		warn!(job_id = %job.id, job_type = %job.job_type, "failing job with unknown type");
		let patch = JobPatch {
			retry_count: Some(retry_count),
			error: Some(Some(message.clone())),
			finished_at: Some(Some(Utc::now())),
			append_failure: Some(FailureHistoryEntry {
				attempt: retry_count,
				error: message,
				timestamp: Utc::now(),
				category: ErrorCategory::Permanent.as_str().to_string(),
			}),
			..JobPatch::new()
				.status(JobStatus::Failed)
				.only_if(JobStatus::Queued)
		};
		self.store.update_job_fields(&job.id, &patch).await?;
		Ok(())
	}
}

#[async_trait]
impl JobRescheduler for Dispatcher {
	async fn reschedule(&self, job: &JobRecord) -> Result<()> {
		self.dispatch(job).await.map(|_| ())
	}
}

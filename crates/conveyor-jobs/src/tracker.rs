// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent progress and lifecycle writes for one job execution.
//!
//! Every call goes straight to the store. Writes after `start` only apply while
//! the job is still `running`; if the recovery daemon got there first the write
//! is dropped and the call returns `Ok(false)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_jobs_db::{FailureHistoryEntry, JobPatch, JobStatus, JobStore, StepTransition};
use serde_json::Value;
use tracing::{debug, warn};

use crate::classifier::ClassifiedError;
use crate::error::Result;

#[derive(Clone)]
pub struct JobRunTracker {
	store: Arc<dyn JobStore>,
	job_id: String,
	worker_id: String,
}

impl JobRunTracker {
	pub fn new(store: Arc<dyn JobStore>, job_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
		Self {
			store,
			job_id: job_id.into(),
			worker_id: worker_id.into(),
		}
	}

	pub fn job_id(&self) -> &str {
		&self.job_id
	}

	pub fn worker_id(&self) -> &str {
		&self.worker_id
	}

	/// Claim the job: `queued` → `running`. Returns `false` if it was no longer
	/// queued (cancelled, or claimed by another worker).
	pub async fn start(&self) -> Result<bool> {
		let now = Utc::now();
		let patch = JobPatch {
			started_at: Some(Some(now)),
			last_heartbeat_at: Some(Some(now)),
			worker_id: Some(Some(self.worker_id.clone())),
			error: Some(None),
			finished_at: Some(None),
			..JobPatch::new().status(JobStatus::Running).only_if(JobStatus::Queued)
		};
		let claimed = self.store.update_job_fields(&self.job_id, &patch).await?;
		if !claimed {
			debug!(job_id = %self.job_id, "job was not queued, skipping");
		}
		Ok(claimed)
	}

	pub async fn heartbeat(&self) -> Result<bool> {
		Ok(self
			.store
			.update_job_heartbeat(&self.job_id, &self.worker_id)
			.await?)
	}

	/// Overall progress, clamped to 0..=100. Decreases are accepted.
	pub async fn progress(&self, value: f64) -> Result<bool> {
		self.write(
			JobPatch {
				progress: Some(value),
				..JobPatch::new()
			},
			"progress",
		)
		.await
	}

	pub async fn step_running(&self, name: &str, label: Option<&str>) -> Result<bool> {
		self.step(StepTransition::running(name, label.map(str::to_string)))
			.await
	}

	pub async fn step_succeeded(&self, name: &str, progress: Option<f64>) -> Result<bool> {
		self.step(StepTransition::succeeded(name, progress)).await
	}

	pub async fn step_failed(&self, name: &str, error: &str) -> Result<bool> {
		self.step(StepTransition::failed(name, error)).await
	}

	pub async fn succeed(&self, result: Option<Value>) -> Result<bool> {
		self.write(
			JobPatch {
				progress: Some(100.0),
				result: Some(result),
				error: Some(None),
				finished_at: Some(Some(Utc::now())),
				..JobPatch::new().status(JobStatus::Succeeded)
			},
			"succeed",
		)
		.await
	}

	/// Finish the job with an error. `status` is normally `Failed`.
	pub async fn fail(&self, error: &str, status: JobStatus) -> Result<bool> {
		self.write(
			JobPatch {
				error: Some(Some(error.to_string())),
				finished_at: Some(Some(Utc::now())),
				..JobPatch::new().status(status)
			},
			"fail",
		)
		.await
	}

	pub async fn cancelled(&self) -> Result<bool> {
		self.fail("job cancelled", JobStatus::Cancelled).await
	}

	/// Record failure number `retry_count` and park the job until `retry_at`.
	pub async fn schedule_retry(
		&self,
		error: &ClassifiedError,
		retry_count: u32,
		retry_at: DateTime<Utc>,
	) -> Result<bool> {
		self.write(
			JobPatch {
				retry_count: Some(retry_count),
				retry_at: Some(Some(retry_at)),
				error: Some(Some(error.original_message.clone())),
				worker_id: Some(None),
				append_failure: Some(history_entry(error, retry_count)),
				..JobPatch::new().status(JobStatus::PendingRetry)
			},
			"schedule_retry",
		)
		.await
	}

	/// Record failure number `retry_count` as final.
	pub async fn fail_terminal(&self, error: &ClassifiedError, retry_count: u32) -> Result<bool> {
		self.write(
			JobPatch {
				retry_count: Some(retry_count),
				error: Some(Some(error.original_message.clone())),
				finished_at: Some(Some(Utc::now())),
				append_failure: Some(history_entry(error, retry_count)),
				..JobPatch::new().status(JobStatus::Failed)
			},
			"fail_terminal",
		)
		.await
	}

	/// Hand the job back to the queue without counting an attempt.
	pub async fn release(&self) -> Result<bool> {
		self.write(
			JobPatch {
				worker_id: Some(None),
				..JobPatch::new().status(JobStatus::Queued)
			},
			"release",
		)
		.await
	}

	async fn step(&self, transition: StepTransition) -> Result<bool> {
		let applied = self
			.store
			.record_step_transition(&self.job_id, &transition)
			.await?;
		if !applied {
			debug!(job_id = %self.job_id, step = %transition.name, "step update not applied");
		}
		Ok(applied)
	}

	async fn write(&self, patch: JobPatch, op: &'static str) -> Result<bool> {
		let patch = patch.only_if(JobStatus::Running);
		let applied = self.store.update_job_fields(&self.job_id, &patch).await?;
		if !applied {
			warn!(
				job_id = %self.job_id,
				worker_id = %self.worker_id,
				op,
				"job no longer running, write dropped"
			);
		}
		Ok(applied)
	}
}

fn history_entry(error: &ClassifiedError, attempt: u32) -> FailureHistoryEntry {
	FailureHistoryEntry {
		attempt,
		error: error.original_message.clone(),
		timestamp: Utc::now(),
		category: error.category.as_str().to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classifier::classify;
	use conveyor_jobs_db::testing::create_job_test_pool;
	use conveyor_jobs_db::{JobRepository, NewJob, StepStatus};

	async fn setup() -> (Arc<JobRepository>, JobRunTracker) {
		let repo = Arc::new(JobRepository::new(create_job_test_pool().await));
		let job = repo
			.create_job(
				&NewJob::new("render", serde_json::json!({}))
					.with_step("fetch", "Fetching")
					.with_step("render", "Rendering"),
			)
			.await
			.unwrap();
		let tracker = JobRunTracker::new(repo.clone(), job.id, "worker-1");
		(repo, tracker)
	}

	#[tokio::test]
	async fn test_start_claims_queued_job_once() {
		let (repo, tracker) = setup().await;
		assert!(tracker.start().await.unwrap());
		assert!(!tracker.start().await.unwrap());

		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Running);
		assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
		assert!(job.started_at.is_some());
		assert!(job.last_heartbeat_at.is_some());
	}

	#[tokio::test]
	async fn test_writes_require_running() {
		let (repo, tracker) = setup().await;
		assert!(!tracker.progress(10.0).await.unwrap());
		assert!(!tracker.succeed(None).await.unwrap());

		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Queued);
	}

	#[tokio::test]
	async fn test_progress_is_clamped_and_may_decrease() {
		let (repo, tracker) = setup().await;
		tracker.start().await.unwrap();

		tracker.progress(150.0).await.unwrap();
		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.progress, 100.0);

		tracker.progress(40.0).await.unwrap();
		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.progress, 40.0);
	}

	#[tokio::test]
	async fn test_step_lifecycle() {
		let (repo, tracker) = setup().await;
		tracker.start().await.unwrap();

		assert!(tracker.step_running("fetch", Some("Fetching page")).await.unwrap());
		assert!(tracker.step_succeeded("fetch", Some(50.0)).await.unwrap());
		assert!(tracker.step_failed("render", "font missing").await.unwrap());
		assert!(!tracker.step_running("nope", None).await.unwrap());

		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		let fetch = job.step("fetch").unwrap();
		assert_eq!(fetch.status, StepStatus::Succeeded);
		assert_eq!(fetch.label, "Fetching page");
		assert_eq!(job.progress, 50.0);
		let render = job.step("render").unwrap();
		assert_eq!(render.status, StepStatus::Failed);
		assert_eq!(render.error.as_deref(), Some("font missing"));
	}

	#[tokio::test]
	async fn test_succeed_sets_result_and_full_progress() {
		let (repo, tracker) = setup().await;
		tracker.start().await.unwrap();
		assert!(tracker
			.succeed(Some(serde_json::json!({"pages": 3})))
			.await
			.unwrap());

		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Succeeded);
		assert_eq!(job.progress, 100.0);
		assert_eq!(job.result, Some(serde_json::json!({"pages": 3})));
		assert!(job.finished_at.is_some());
	}

	#[tokio::test]
	async fn test_schedule_retry_records_history() {
		let (repo, tracker) = setup().await;
		tracker.start().await.unwrap();
		let error = classify("connection refused");
		let retry_at = Utc::now();
		assert!(tracker.schedule_retry(&error, 1, retry_at).await.unwrap());

		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::PendingRetry);
		assert_eq!(job.retry_count, 1);
		assert!(job.worker_id.is_none());
		assert_eq!(job.failure_history.len(), 1);
		assert_eq!(job.failure_history[0].category, "transient");
		assert_eq!(job.failure_history[0].attempt, 1);
	}

	#[tokio::test]
	async fn test_fail_terminal_and_release() {
		let (repo, tracker) = setup().await;
		tracker.start().await.unwrap();
		assert!(tracker.release().await.unwrap());
		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Queued);
		assert_eq!(job.retry_count, 0);

		tracker.start().await.unwrap();
		let error = classify("validation failed");
		assert!(tracker.fail_terminal(&error, 3).await.unwrap());
		let job = repo.get_job(tracker.job_id()).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Failed);
		assert_eq!(job.retry_count, 3);
		assert_eq!(job.error.as_deref(), Some("validation failed"));
	}
}

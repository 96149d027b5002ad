// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background reconciliation of job state.
//!
//! One task polls the store every `poll_interval` and, in order:
//! 1. recovers `running` jobs whose heartbeat is older than `heartbeat_timeout`
//! 2. moves `pending_retry` jobs whose `retry_at` has passed back to `queued`
//!    and hands them to the rescheduler
//! 3. delivers completion webhooks that have not been sent
//! 4. deletes expired idempotency keys
//! 5. dead-letters failed jobs that exhausted their retries
//!
//! A failing step, or a failing job within a step, is logged and counted in
//! [`RecoveryStats::errors`]; the cycle carries on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_jobs_db::{FailureHistoryEntry, JobPatch, JobRecord, JobStatus, JobStore};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::JobRescheduler;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::webhook::{WebhookPayload, WebhookService};

const STALE_REASON: &str = "heartbeat timeout";

#[derive(Debug, Clone)]
pub struct RecoveryDaemonConfig {
	pub poll_interval: Duration,
	pub heartbeat_timeout: Duration,
	/// Upper bound on jobs examined per step per cycle.
	pub scan_batch_size: u32,
	pub webhook_concurrency: usize,
	pub retry_policy: RetryPolicy,
}

impl Default for RecoveryDaemonConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(30),
			heartbeat_timeout: Duration::from_secs(120),
			scan_batch_size: 500,
			webhook_concurrency: 4,
			retry_policy: RetryPolicy::default(),
		}
	}
}

/// Cumulative counters since the daemon was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
	pub stale_recovered: u64,
	pub requeued: u64,
	pub moved_to_dlq: u64,
	pub webhooks_sent: u64,
	pub webhooks_failed: u64,
	pub idempotency_keys_cleaned: u64,
	pub errors: u64,
	pub runs: u64,
	pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
	stale_recovered: AtomicU64,
	requeued: AtomicU64,
	moved_to_dlq: AtomicU64,
	webhooks_sent: AtomicU64,
	webhooks_failed: AtomicU64,
	idempotency_keys_cleaned: AtomicU64,
	errors: AtomicU64,
	runs: AtomicU64,
	last_run_at: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
	fn add(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}

	fn snapshot(&self) -> RecoveryStats {
		RecoveryStats {
			stale_recovered: self.stale_recovered.load(Ordering::Relaxed),
			requeued: self.requeued.load(Ordering::Relaxed),
			moved_to_dlq: self.moved_to_dlq.load(Ordering::Relaxed),
			webhooks_sent: self.webhooks_sent.load(Ordering::Relaxed),
			webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
			idempotency_keys_cleaned: self.idempotency_keys_cleaned.load(Ordering::Relaxed),
			errors: self.errors.load(Ordering::Relaxed),
			runs: self.runs.load(Ordering::Relaxed),
			last_run_at: *self
				.last_run_at
				.lock()
				.unwrap_or_else(PoisonError::into_inner),
		}
	}
}

enum WebhookAttempt {
	Sent,
	/// Delivered, but another cycle recorded the delivery first.
	AlreadyRecorded,
	Failed,
	Error,
}

/// Everything one cycle needs. Cloned into the background task.
#[derive(Clone)]
struct Cycle {
	store: Arc<dyn JobStore>,
	webhook: Arc<WebhookService>,
	rescheduler: Option<Arc<dyn JobRescheduler>>,
	config: RecoveryDaemonConfig,
	counters: Arc<Counters>,
}

pub struct RecoveryDaemon {
	cycle: Cycle,
	running: Arc<AtomicBool>,
	task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl RecoveryDaemon {
	pub fn new(
		store: Arc<dyn JobStore>,
		webhook: Arc<WebhookService>,
		config: RecoveryDaemonConfig,
	) -> Self {
		Self {
			cycle: Cycle {
				store,
				webhook,
				rescheduler: None,
				config,
				counters: Arc::new(Counters::default()),
			},
			running: Arc::new(AtomicBool::new(false)),
			task: Mutex::new(None),
		}
	}

	/// Dispatch requeued retries through `rescheduler`. Without one they stay
	/// `queued` until something else submits them.
	pub fn with_rescheduler(mut self, rescheduler: Arc<dyn JobRescheduler>) -> Self {
		self.cycle.rescheduler = Some(rescheduler);
		self
	}

	/// Spawn the polling loop. Returns `false` if it is already running.
	pub fn start(&self) -> bool {
		let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
		if task.is_some() {
			return false;
		}

		let shutdown = CancellationToken::new();
		let cycle = self.cycle.clone();
		let running = self.running.clone();
		let token = shutdown.clone();
		running.store(true, Ordering::SeqCst);

		info!(
			poll_interval_secs = cycle.config.poll_interval.as_secs(),
			heartbeat_timeout_secs = cycle.config.heartbeat_timeout.as_secs(),
			"starting recovery daemon"
		);
		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = cycle.run() => {}
				}
				tokio::select! {
					_ = token.cancelled() => break,
					_ = tokio::time::sleep(cycle.config.poll_interval) => {}
				}
			}
			running.store(false, Ordering::SeqCst);
			debug!("recovery loop exited");
		});

		*task = Some((handle, shutdown));
		true
	}

	/// Stop the loop, waiting at most `timeout` for an in-flight cycle.
	/// Returns `false` if the task had to be aborted. Calling it again, or on
	/// a daemon that never started, returns `true`.
	pub async fn stop(&self, timeout: Duration) -> bool {
		let task = self
			.task
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		let Some((mut handle, shutdown)) = task else {
			return true;
		};

		shutdown.cancel();
		let stopped = match tokio::time::timeout(timeout, &mut handle).await {
			Ok(_) => true,
			Err(_) => {
				warn!("recovery daemon did not stop in time, aborting");
				handle.abort();
				false
			}
		};
		self.running.store(false, Ordering::SeqCst);
		info!("recovery daemon stopped");
		stopped
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn stats(&self) -> RecoveryStats {
		self.cycle.counters.snapshot()
	}

	/// Run one full cycle on the caller's task.
	pub async fn run_cycle(&self) {
		self.cycle.run().await;
	}
}

impl Cycle {
	async fn run(&self) {
		let started = Utc::now();
		let errors_before = self.counters.errors.load(Ordering::Relaxed);

		let stale = self.step("stale_recovery", self.recover_stale()).await;
		let requeued = self.step("retry_requeue", self.requeue_retries()).await;
		let webhooks = self.step("webhook_delivery", self.deliver_webhooks()).await;
		let keys = self
			.step("idempotency_cleanup", self.clean_idempotency_keys())
			.await;
		let dead_lettered = self.step("dlq_promotion", self.promote_to_dlq()).await;

		Counters::add(&self.counters.runs, 1);
		*self
			.counters
			.last_run_at
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(started);

		let errors = self
			.counters
			.errors
			.load(Ordering::Relaxed)
			.saturating_sub(errors_before);
		if stale + requeued + webhooks + keys + dead_lettered + errors > 0 {
			info!(
				stale,
				requeued,
				webhooks,
				keys,
				dead_lettered,
				errors,
				"recovery cycle complete"
			);
		} else {
			debug!("recovery cycle found nothing to do");
		}
	}

	async fn step(&self, name: &'static str, work: impl std::future::Future<Output = Result<u64>>) -> u64 {
		match work.await {
			Ok(n) => n,
			Err(e) => {
				error!(step = name, error = %e, "recovery step failed");
				self.count_error();
				0
			}
		}
	}

	fn count_error(&self) {
		Counters::add(&self.counters.errors, 1);
	}

	async fn recover_stale(&self) -> Result<u64> {
		let jobs = self
			.store
			.find_stale_running_jobs(self.config.heartbeat_timeout, self.config.scan_batch_size)
			.await?;

		let mut recovered = 0;
		for job in jobs {
			let outcome = if job.has_retry_budget() {
				let retry_at = self
					.config
					.retry_policy
					.next_retry_at(job.retry_count.saturating_add(1), 1.0);
				self.store
					.mark_job_for_retry(&job.id, STALE_REASON, retry_at)
					.await
			} else {
				self.fail_stale(&job).await
			};

			match outcome {
				Ok(true) => {
					warn!(
						job_id = %job.id,
						worker_id = ?job.worker_id,
						retry_count = job.retry_count,
						"recovered stale job"
					);
					recovered += 1;
				}
				Ok(false) => debug!(job_id = %job.id, "stale job changed before recovery"),
				Err(e) => {
					error!(job_id = %job.id, error = %e, "failed to recover stale job");
					self.count_error();
				}
			}
		}

		Counters::add(&self.counters.stale_recovered, recovered);
		Ok(recovered)
	}

	async fn fail_stale(&self, job: &JobRecord) -> conveyor_jobs_db::Result<bool> {
		let now = Utc::now();
		let retry_count = job.retry_count.saturating_add(1);
		let patch = JobPatch {
			retry_count: Some(retry_count),
			error: Some(Some(STALE_REASON.to_string())),
			finished_at: Some(Some(now)),
			worker_id: Some(None),
			append_failure: Some(FailureHistoryEntry {
				attempt: retry_count,
				error: STALE_REASON.to_string(),
				timestamp: now,
				category: "stale".to_string(),
			}),
			..JobPatch::new()
				.status(JobStatus::Failed)
				.only_if(JobStatus::Running)
		};
		self.store.update_job_fields(&job.id, &patch).await
	}

	async fn requeue_retries(&self) -> Result<u64> {
		let jobs = self
			.store
			.find_jobs_ready_for_retry(self.config.scan_batch_size)
			.await?;

		let mut requeued = 0;
		for mut job in jobs {
			match self.store.requeue_job_for_retry(&job.id).await {
				Ok(true) => {}
				Ok(false) => continue,
				Err(e) => {
					error!(job_id = %job.id, error = %e, "failed to requeue job");
					self.count_error();
					continue;
				}
			}
			requeued += 1;
			job.status = JobStatus::Queued;
			job.retry_at = None;
			debug!(job_id = %job.id, retry_count = job.retry_count, "job requeued for retry");

			if let Some(rescheduler) = &self.rescheduler {
				if let Err(e) = rescheduler.reschedule(&job).await {
					error!(job_id = %job.id, error = %e, "failed to reschedule job");
					self.count_error();
				}
			}
		}

		Counters::add(&self.counters.requeued, requeued);
		Ok(requeued)
	}

	async fn deliver_webhooks(&self) -> Result<u64> {
		let jobs = self
			.store
			.find_jobs_pending_webhook(self.config.scan_batch_size)
			.await?;
		if jobs.is_empty() {
			return Ok(0);
		}

		let attempts: Vec<WebhookAttempt> = stream::iter(jobs)
			.map(|job| self.deliver_webhook(job))
			.buffer_unordered(self.config.webhook_concurrency.max(1))
			.collect()
			.await;

		let mut sent = 0;
		for attempt in attempts {
			match attempt {
				WebhookAttempt::Sent => sent += 1,
				WebhookAttempt::AlreadyRecorded => {}
				WebhookAttempt::Failed => Counters::add(&self.counters.webhooks_failed, 1),
				WebhookAttempt::Error => self.count_error(),
			}
		}
		Counters::add(&self.counters.webhooks_sent, sent);
		Ok(sent)
	}

	async fn deliver_webhook(&self, job: JobRecord) -> WebhookAttempt {
		let Some(url) = job.webhook_url.as_deref() else {
			return WebhookAttempt::Failed;
		};

		let payload = WebhookPayload::from_job(&job);
		let result = self
			.webhook
			.deliver(url, &payload, job.webhook_secret.as_ref())
			.await;
		if !result.success {
			warn!(
				job_id = %job.id,
				attempts = result.attempts,
				status_code = ?result.status_code,
				error = ?result.error,
				"webhook delivery failed, will retry next cycle"
			);
			return WebhookAttempt::Failed;
		}

		let patch = JobPatch {
			webhook_sent_at: Some(Some(Utc::now())),
			only_if_webhook_pending: true,
			..JobPatch::new()
		};
		match self.store.update_job_fields(&job.id, &patch).await {
			Ok(true) => WebhookAttempt::Sent,
			Ok(false) => {
				warn!(job_id = %job.id, "webhook delivery already recorded elsewhere");
				WebhookAttempt::AlreadyRecorded
			}
			Err(e) => {
				error!(job_id = %job.id, error = %e, "webhook sent but not recorded");
				WebhookAttempt::Error
			}
		}
	}

	async fn clean_idempotency_keys(&self) -> Result<u64> {
		let cleaned = self.store.clean_expired_idempotency_keys().await?;
		Counters::add(&self.counters.idempotency_keys_cleaned, cleaned);
		Ok(cleaned)
	}

	async fn promote_to_dlq(&self) -> Result<u64> {
		let jobs = self
			.store
			.find_dlq_candidates(self.config.scan_batch_size)
			.await?;

		let mut moved = 0;
		for job in jobs {
			let entry = FailureHistoryEntry {
				attempt: job.retry_count,
				error: job
					.error
					.clone()
					.unwrap_or_else(|| "retries exhausted".to_string()),
				timestamp: Utc::now(),
				category: "exhausted".to_string(),
			};
			match self.store.move_job_to_dlq(&job.id, &entry).await {
				Ok(true) => {
					warn!(
						job_id = %job.id,
						retry_count = job.retry_count,
						max_retries = job.max_retries,
						"job moved to dead-letter queue"
					);
					moved += 1;
				}
				Ok(false) => {}
				Err(e) => {
					error!(job_id = %job.id, error = %e, "failed to dead-letter job");
					self.count_error();
				}
			}
		}

		Counters::add(&self.counters.moved_to_dlq, moved);
		Ok(moved)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::JobError;
	use crate::webhook::WebhookServiceConfig;
	use async_trait::async_trait;
	use conveyor_common_secret::SecretString;
	use conveyor_jobs_db::testing::create_job_test_pool;
	use conveyor_jobs_db::{JobRepository, NewJob};
	use serde_json::Value;

	#[derive(Default)]
	struct RecordingRescheduler {
		seen: Mutex<Vec<String>>,
		fail: bool,
	}

	#[async_trait]
	impl JobRescheduler for RecordingRescheduler {
		async fn reschedule(&self, job: &JobRecord) -> Result<()> {
			self.seen.lock().unwrap().push(job.id.clone());
			if self.fail {
				return Err(JobError::PoolClosed);
			}
			Ok(())
		}
	}

	fn webhook_service() -> Arc<WebhookService> {
		Arc::new(WebhookService::new(WebhookServiceConfig {
			max_retries: 1,
			initial_backoff: Duration::from_millis(1),
			timeout: Duration::from_secs(2),
			signing_secret: Some(SecretString::from("whsec_test")),
		}))
	}

	async fn setup() -> (Arc<JobRepository>, RecoveryDaemon) {
		let repo = Arc::new(JobRepository::new(create_job_test_pool().await));
		let daemon = RecoveryDaemon::new(
			repo.clone(),
			webhook_service(),
			RecoveryDaemonConfig {
				poll_interval: Duration::from_millis(20),
				heartbeat_timeout: Duration::from_secs(60),
				..RecoveryDaemonConfig::default()
			},
		);
		(repo, daemon)
	}

	async fn job_in(repo: &JobRepository, patch: JobPatch, max_retries: u32) -> String {
		let job = repo
			.create_job(&NewJob::new("test", Value::Null).with_max_retries(max_retries))
			.await
			.unwrap();
		assert!(repo.update_job_fields(&job.id, &patch).await.unwrap());
		job.id
	}

	fn stale_running(retry_count: u32) -> JobPatch {
		let long_ago = Utc::now() - chrono::Duration::minutes(10);
		JobPatch {
			retry_count: Some(retry_count),
			started_at: Some(Some(long_ago)),
			last_heartbeat_at: Some(Some(long_ago)),
			worker_id: Some(Some("worker-gone".to_string())),
			..JobPatch::new().status(JobStatus::Running)
		}
	}

	#[tokio::test]
	async fn test_stale_job_with_budget_goes_to_pending_retry() {
		let (repo, daemon) = setup().await;
		let id = job_in(&repo, stale_running(0), 3).await;

		daemon.run_cycle().await;

		let job = repo.get_job(&id).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::PendingRetry);
		assert_eq!(job.retry_count, 1);
		assert_eq!(job.error.as_deref(), Some(STALE_REASON));
		assert!(job.worker_id.is_none());
		assert!(job.retry_at.unwrap() > Utc::now());
		assert_eq!(daemon.stats().stale_recovered, 1);
	}

	#[tokio::test]
	async fn test_stale_job_without_budget_fails() {
		let (repo, daemon) = setup().await;
		let id = job_in(&repo, stale_running(3), 3).await;

		daemon.run_cycle().await;

		let job = repo.get_job(&id).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Failed);
		assert_eq!(job.retry_count, 4);
		assert!(job.finished_at.is_some());
		// same cycle promotes it
		assert!(job.is_dead_lettered());
		assert_eq!(daemon.stats().moved_to_dlq, 1);
	}

	#[tokio::test]
	async fn test_fresh_running_job_untouched() {
		let (repo, daemon) = setup().await;
		let now = Utc::now();
		let id = job_in(
			&repo,
			JobPatch {
				started_at: Some(Some(now)),
				last_heartbeat_at: Some(Some(now)),
				..JobPatch::new().status(JobStatus::Running)
			},
			3,
		)
		.await;

		daemon.run_cycle().await;
		assert_eq!(
			repo.get_job(&id).await.unwrap().unwrap().status,
			JobStatus::Running
		);
		assert_eq!(daemon.stats().stale_recovered, 0);
	}

	#[tokio::test]
	async fn test_due_retry_requeued_and_rescheduled() {
		let repo = Arc::new(JobRepository::new(create_job_test_pool().await));
		let rescheduler = Arc::new(RecordingRescheduler::default());
		let daemon = RecoveryDaemon::new(repo.clone(), webhook_service(), RecoveryDaemonConfig::default())
			.with_rescheduler(rescheduler.clone());

		let due = job_in(
			&repo,
			JobPatch {
				retry_count: Some(1),
				retry_at: Some(Some(Utc::now() - chrono::Duration::seconds(1))),
				..JobPatch::new().status(JobStatus::PendingRetry)
			},
			3,
		)
		.await;
		let later = job_in(
			&repo,
			JobPatch {
				retry_at: Some(Some(Utc::now() + chrono::Duration::hours(1))),
				..JobPatch::new().status(JobStatus::PendingRetry)
			},
			3,
		)
		.await;

		daemon.run_cycle().await;

		let job = repo.get_job(&due).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Queued);
		assert_eq!(job.retry_count, 1);
		assert!(job.retry_at.is_none());
		assert_eq!(*rescheduler.seen.lock().unwrap(), vec![due.clone()]);
		assert_eq!(
			repo.get_job(&later).await.unwrap().unwrap().status,
			JobStatus::PendingRetry
		);
		assert_eq!(daemon.stats().requeued, 1);
	}

	#[tokio::test]
	async fn test_reschedule_error_is_counted_and_cycle_continues() {
		let repo = Arc::new(JobRepository::new(create_job_test_pool().await));
		let rescheduler = Arc::new(RecordingRescheduler {
			fail: true,
			..Default::default()
		});
		let daemon = RecoveryDaemon::new(repo.clone(), webhook_service(), RecoveryDaemonConfig::default())
			.with_rescheduler(rescheduler);

		job_in(
			&repo,
			JobPatch {
				retry_at: Some(Some(Utc::now() - chrono::Duration::seconds(1))),
				..JobPatch::new().status(JobStatus::PendingRetry)
			},
			3,
		)
		.await;
		let failed = job_in(
			&repo,
			JobPatch {
				retry_count: Some(3),
				error: Some(Some("boom".to_string())),
				..JobPatch::new().status(JobStatus::Failed)
			},
			3,
		)
		.await;

		daemon.run_cycle().await;

		let stats = daemon.stats();
		assert_eq!(stats.errors, 1);
		assert_eq!(stats.requeued, 1);
		assert_eq!(stats.moved_to_dlq, 1);
		assert!(repo.get_job(&failed).await.unwrap().unwrap().is_dead_lettered());
	}

	#[tokio::test]
	async fn test_dlq_promotion_is_idempotent() {
		let (repo, daemon) = setup().await;
		let id = job_in(
			&repo,
			JobPatch {
				retry_count: Some(3),
				error: Some(Some("connection refused".to_string())),
				..JobPatch::new().status(JobStatus::Failed)
			},
			3,
		)
		.await;
		let with_budget = job_in(
			&repo,
			JobPatch {
				retry_count: Some(1),
				..JobPatch::new().status(JobStatus::Failed)
			},
			3,
		)
		.await;

		daemon.run_cycle().await;
		daemon.run_cycle().await;

		let job = repo.get_job(&id).await.unwrap().unwrap();
		assert!(job.is_dead_lettered());
		let last = job.failure_history.last().unwrap();
		assert_eq!(last.category, "exhausted");
		assert_eq!(last.error, "connection refused");
		assert_eq!(last.attempt, 3);
		assert_eq!(job.failure_history.len(), 1);

		assert!(!repo.get_job(&with_budget).await.unwrap().unwrap().is_dead_lettered());
		let stats = daemon.stats();
		assert_eq!(stats.moved_to_dlq, 1);
		assert_eq!(stats.runs, 2);
		assert!(stats.last_run_at.is_some());
	}

	#[cfg(feature = "http")]
	#[tokio::test]
	async fn test_webhook_sent_once() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let (repo, daemon) = setup().await;
		let job = repo
			.create_job(&NewJob::new("test", Value::Null).with_webhook(server.uri(), None))
			.await
			.unwrap();
		repo.update_job_fields(
			&job.id,
			&JobPatch {
				finished_at: Some(Some(Utc::now())),
				..JobPatch::new().status(JobStatus::Succeeded)
			},
		)
		.await
		.unwrap();

		daemon.run_cycle().await;
		daemon.run_cycle().await;

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert!(job.webhook_sent_at.is_some());
		assert_eq!(daemon.stats().webhooks_sent, 1);
	}

	#[cfg(feature = "http")]
	#[tokio::test]
	async fn test_webhook_recorded_elsewhere_not_counted() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;

		let (repo, daemon) = setup().await;
		let job = repo
			.create_job(&NewJob::new("test", Value::Null).with_webhook(server.uri(), None))
			.await
			.unwrap();
		repo.update_job_fields(&job.id, &JobPatch::new().status(JobStatus::Failed))
			.await
			.unwrap();
		let pending = repo.get_job(&job.id).await.unwrap().unwrap();

		let recorded = JobPatch {
			webhook_sent_at: Some(Some(Utc::now())),
			..JobPatch::new()
		};
		assert!(repo.update_job_fields(&job.id, &recorded).await.unwrap());

		let attempt = daemon.cycle.deliver_webhook(pending).await;
		assert!(matches!(attempt, WebhookAttempt::AlreadyRecorded));
		assert_eq!(daemon.stats().webhooks_sent, 0);
		assert_eq!(daemon.stats().errors, 0);
	}

	#[cfg(feature = "http")]
	#[tokio::test]
	async fn test_failed_webhook_left_for_next_cycle() {
		use wiremock::matchers::method;
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let (repo, daemon) = setup().await;
		let job = repo
			.create_job(
				&NewJob::new("test", Value::Null)
					.with_webhook(server.uri(), Some(SecretString::from("whsec_job"))),
			)
			.await
			.unwrap();
		repo.update_job_fields(&job.id, &JobPatch::new().status(JobStatus::Cancelled))
			.await
			.unwrap();

		daemon.run_cycle().await;

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert!(job.webhook_sent_at.is_none());
		let stats = daemon.stats();
		assert_eq!(stats.webhooks_failed, 1);
		assert_eq!(stats.webhooks_sent, 0);
	}

	#[tokio::test]
	async fn test_start_stop_lifecycle() {
		let (_repo, daemon) = setup().await;
		assert!(!daemon.is_running());
		assert!(daemon.start());
		assert!(!daemon.start());
		assert!(daemon.is_running());

		tokio::time::sleep(Duration::from_millis(60)).await;
		assert!(daemon.stats().runs >= 1);

		assert!(daemon.stop(Duration::from_secs(2)).await);
		assert!(!daemon.is_running());
		assert!(daemon.stop(Duration::from_secs(2)).await);
	}

	#[tokio::test]
	async fn test_stop_without_start_is_noop() {
		let (_repo, daemon) = setup().await;
		assert!(daemon.stop(Duration::from_millis(10)).await);
	}
}

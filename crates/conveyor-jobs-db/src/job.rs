// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_common_secret::SecretString;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::types::{
	clamp_progress, format_ts, FailureHistoryEntry, JobPatch, JobRecord, JobStatus, JobStep,
	NewJob, StepDefinition, StepTransition,
};

const JOB_COLUMNS: &str = "id, job_type, correlation_id, status, payload, result, error, steps, \
	progress, retry_count, max_retries, retry_at, last_heartbeat_at, worker_id, started_at, \
	finished_at, dead_letter_at, failure_history, webhook_url, webhook_secret, webhook_sent_at, \
	requeued_from, idempotency_key, version, created_at, updated_at";

const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts at a step-list compare-and-set before giving up.
const MAX_STEP_CAS_ATTEMPTS: usize = 8;

#[derive(sqlx::FromRow)]
struct JobRow {
	id: String,
	job_type: String,
	correlation_id: Option<String>,
	status: String,
	payload: String,
	result: Option<String>,
	error: Option<String>,
	steps: String,
	progress: f64,
	retry_count: i64,
	max_retries: i64,
	retry_at: Option<String>,
	last_heartbeat_at: Option<String>,
	worker_id: Option<String>,
	started_at: Option<String>,
	finished_at: Option<String>,
	dead_letter_at: Option<String>,
	failure_history: String,
	webhook_url: Option<String>,
	webhook_secret: Option<String>,
	webhook_sent_at: Option<String>,
	requeued_from: Option<String>,
	idempotency_key: Option<String>,
	version: i64,
	created_at: String,
	updated_at: String,
}

impl TryFrom<JobRow> for JobRecord {
	type Error = DbError;

	fn try_from(row: JobRow) -> Result<Self> {
		let job_id = row.id.clone();
		let corrupt = |message: String| DbError::CorruptRow {
			job_id: job_id.clone(),
			message,
		};
		let ts = |value: &str| -> Result<DateTime<Utc>> {
			DateTime::parse_from_rfc3339(value)
				.map(|t| t.with_timezone(&Utc))
				.map_err(|e| corrupt(format!("bad timestamp '{value}': {e}")))
		};
		let opt_ts = |value: Option<String>| value.as_deref().map(ts).transpose();

		Ok(JobRecord {
			id: row.id,
			job_type: row.job_type,
			correlation_id: row.correlation_id,
			status: row.status.parse().map_err(corrupt)?,
			payload: serde_json::from_str(&row.payload)?,
			result: row.result.as_deref().map(serde_json::from_str).transpose()?,
			error: row.error,
			steps: serde_json::from_str(&row.steps)?,
			progress: row.progress,
			retry_count: row.retry_count.max(0) as u32,
			max_retries: row.max_retries.max(0) as u32,
			retry_at: opt_ts(row.retry_at)?,
			last_heartbeat_at: opt_ts(row.last_heartbeat_at)?,
			worker_id: row.worker_id,
			started_at: opt_ts(row.started_at)?,
			finished_at: opt_ts(row.finished_at)?,
			dead_letter_at: opt_ts(row.dead_letter_at)?,
			failure_history: serde_json::from_str(&row.failure_history)?,
			webhook_url: row.webhook_url,
			webhook_secret: row.webhook_secret.and_then(|s| SecretString::non_empty(s)),
			webhook_sent_at: opt_ts(row.webhook_sent_at)?,
			requeued_from: row.requeued_from,
			idempotency_key: row.idempotency_key,
			version: row.version,
			created_at: ts(&row.created_at)?,
			updated_at: ts(&row.updated_at)?,
		})
	}
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
	chrono::Duration::from_std(duration)
		.map_err(|e| DbError::Internal(format!("duration out of range: {e}")))
}

/// SQLite-backed job store.
///
/// Every mutation is a single conditional `UPDATE`; callers learn whether
/// their transition won from the returned `bool`.
#[derive(Clone)]
pub struct JobRepository {
	pool: SqlitePool,
	idempotency_ttl: Duration,
}

impl JobRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self {
			pool,
			idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
		}
	}

	pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
		self.idempotency_ttl = ttl;
		self
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Insert a queued job. When `idempotency_key` names a live key the
	/// existing job is returned instead and nothing is written.
	#[tracing::instrument(skip(self, job), fields(job_type = %job.job_type))]
	pub async fn create_job(&self, job: &NewJob) -> Result<JobRecord> {
		let now = Utc::now();
		let now_str = format_ts(&now);
		let id = Uuid::new_v4().to_string();
		let steps: Vec<JobStep> = job.steps.iter().map(JobStep::pending).collect();
		let steps_json = serde_json::to_string(&steps)?;
		let payload_json = serde_json::to_string(&job.payload)?;

		let mut tx = self.pool.begin().await?;

		if let Some(key) = &job.idempotency_key {
			let expires_at = format_ts(&(now + to_chrono(self.idempotency_ttl)?));
			let claimed = sqlx::query(
				r#"
				INSERT INTO idempotency_keys (key, job_id, created_at, expires_at)
				VALUES (?, ?, ?, ?)
				ON CONFLICT(key) DO UPDATE SET
					job_id = excluded.job_id,
					created_at = excluded.created_at,
					expires_at = excluded.expires_at
				WHERE idempotency_keys.expires_at <= excluded.created_at
				"#,
			)
			.bind(key)
			.bind(&id)
			.bind(&now_str)
			.bind(&expires_at)
			.execute(&mut *tx)
			.await?;

			if claimed.rows_affected() == 0 {
				let (existing_id,): (String,) =
					sqlx::query_as("SELECT job_id FROM idempotency_keys WHERE key = ?")
						.bind(key)
						.fetch_one(&mut *tx)
						.await?;
				tx.rollback().await?;

				tracing::debug!(job_id = %existing_id, "idempotency key is live, returning existing job");
				let existing = self.get_job(&existing_id).await?;
				return existing.ok_or(DbError::NotFound(existing_id));
			}
		}

		sqlx::query(
			r#"
			INSERT INTO jobs (
				id, job_type, correlation_id, status, payload, steps, progress,
				retry_count, max_retries, webhook_url, webhook_secret,
				requeued_from, idempotency_key, version, created_at, updated_at
			)
			VALUES (?, ?, ?, 'queued', ?, ?, 0, 0, ?, ?, ?, ?, ?, 0, ?, ?)
			"#,
		)
		.bind(&id)
		.bind(&job.job_type)
		.bind(&job.correlation_id)
		.bind(&payload_json)
		.bind(&steps_json)
		.bind(job.max_retries as i64)
		.bind(&job.webhook_url)
		.bind(job.webhook_secret.as_ref().map(|s| s.expose().as_str()))
		.bind(&job.requeued_from)
		.bind(&job.idempotency_key)
		.bind(&now_str)
		.bind(&now_str)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;

		tracing::debug!(job_id = %id, "job created");
		let created = self.get_job(&id).await?;
		created.ok_or(DbError::NotFound(id))
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
		let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
		let row = sqlx::query_as::<_, JobRow>(&sql)
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;

		row.map(JobRecord::try_from).transpose()
	}

	/// Apply a patch. Returns `false` when the row is missing, a guard did not
	/// hold, or the patch is empty.
	#[tracing::instrument(skip(self, patch), fields(status = ?patch.status, only_if = ?patch.only_if_status))]
	pub async fn update_job_fields(&self, id: &str, patch: &JobPatch) -> Result<bool> {
		if patch.is_empty() {
			return Ok(false);
		}

		let result_json = match &patch.result {
			Some(Some(value)) => Some(Some(serde_json::to_string(value)?)),
			Some(None) => Some(None),
			None => None,
		};
		let failure_json = patch
			.append_failure
			.as_ref()
			.map(serde_json::to_string)
			.transpose()?;

		let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET updated_at = ");
		qb.push_bind(format_ts(&Utc::now()));

		if let Some(status) = patch.status {
			qb.push(", status = ").push_bind(status.as_str());
		}
		if let Some(count) = patch.retry_count {
			// retry_count never decreases
			qb.push(", retry_count = MAX(retry_count, ")
				.push_bind(count as i64)
				.push(")");
		}
		if let Some(retry_at) = &patch.retry_at {
			qb.push(", retry_at = ").push_bind(retry_at.as_ref().map(format_ts));
		}
		if let Some(heartbeat) = &patch.last_heartbeat_at {
			qb.push(", last_heartbeat_at = ")
				.push_bind(heartbeat.as_ref().map(format_ts));
		}
		if let Some(worker_id) = &patch.worker_id {
			qb.push(", worker_id = ").push_bind(worker_id.clone());
		}
		if let Some(started_at) = &patch.started_at {
			qb.push(", started_at = ")
				.push_bind(started_at.as_ref().map(format_ts));
		}
		if let Some(finished_at) = &patch.finished_at {
			qb.push(", finished_at = ")
				.push_bind(finished_at.as_ref().map(format_ts));
		}
		if let Some(error) = &patch.error {
			qb.push(", error = ").push_bind(error.clone());
		}
		if let Some(progress) = patch.progress {
			qb.push(", progress = ").push_bind(clamp_progress(progress));
		}
		if let Some(result) = result_json {
			qb.push(", result = ").push_bind(result);
		}
		if let Some(sent_at) = &patch.webhook_sent_at {
			qb.push(", webhook_sent_at = ")
				.push_bind(sent_at.as_ref().map(format_ts));
		}
		if let Some(entry) = failure_json {
			qb.push(", failure_history = json_insert(failure_history, '$[#]', json(")
				.push_bind(entry)
				.push("))");
		}

		qb.push(" WHERE id = ").push_bind(id.to_string());
		if let Some(expected) = patch.only_if_status {
			qb.push(" AND status = ").push_bind(expected.as_str());
		}
		if patch.only_if_webhook_pending {
			qb.push(" AND webhook_sent_at IS NULL");
		}

		let result = qb.build().execute(&self.pool).await?;
		Ok(result.rows_affected() == 1)
	}

	/// Rewrite one step of a running job. Returns `false` when the job is no
	/// longer running or has no step with that name.
	#[tracing::instrument(skip(self, transition), fields(step = %transition.name, step_status = ?transition.status))]
	pub async fn record_step_transition(
		&self,
		id: &str,
		transition: &StepTransition,
	) -> Result<bool> {
		for _ in 0..MAX_STEP_CAS_ATTEMPTS {
			let row = sqlx::query_as::<_, (String, String, i64)>(
				"SELECT status, steps, version FROM jobs WHERE id = ?",
			)
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;

			let Some((status, steps_json, version)) = row else {
				return Err(DbError::NotFound(id.to_string()));
			};
			if status != JobStatus::Running.as_str() {
				return Ok(false);
			}

			let mut steps: Vec<JobStep> = serde_json::from_str(&steps_json)?;
			let now = Utc::now();
			if !transition.apply(&mut steps, now) {
				tracing::debug!("ignoring transition for unknown step");
				return Ok(false);
			}

			let result = sqlx::query(
				r#"
				UPDATE jobs
				SET steps = ?,
					progress = COALESCE(?, progress),
					version = version + 1,
					updated_at = ?
				WHERE id = ? AND version = ? AND status = 'running'
				"#,
			)
			.bind(serde_json::to_string(&steps)?)
			.bind(transition.progress.map(clamp_progress))
			.bind(format_ts(&now))
			.bind(id)
			.bind(version)
			.execute(&self.pool)
			.await?;

			if result.rows_affected() == 1 {
				return Ok(true);
			}
			tokio::task::yield_now().await;
		}

		Err(DbError::Conflict(format!(
			"step update for job {id} lost {MAX_STEP_CAS_ATTEMPTS} consecutive races"
		)))
	}

	async fn select_jobs(&self, filter: &str, binds: Vec<String>, limit: u32) -> Result<Vec<JobRecord>> {
		let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE {filter} LIMIT ?");
		let mut query = sqlx::query_as::<_, JobRow>(&sql);
		for value in binds {
			query = query.bind(value);
		}
		let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

		rows.into_iter().map(JobRecord::try_from).collect()
	}

	/// Running jobs whose last heartbeat is older than `heartbeat_timeout`.
	#[tracing::instrument(skip(self))]
	pub async fn find_stale_running_jobs(
		&self,
		heartbeat_timeout: Duration,
		limit: u32,
	) -> Result<Vec<JobRecord>> {
		let cutoff = Utc::now() - to_chrono(heartbeat_timeout)?;
		self
			.select_jobs(
				"status = 'running' AND COALESCE(last_heartbeat_at, started_at, created_at) < ? \
				 ORDER BY COALESCE(last_heartbeat_at, started_at, created_at)",
				vec![format_ts(&cutoff)],
				limit,
			)
			.await
	}

	#[tracing::instrument(skip(self))]
	pub async fn find_jobs_ready_for_retry(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self
			.select_jobs(
				"status = 'pending_retry' AND (retry_at IS NULL OR retry_at <= ?) ORDER BY retry_at",
				vec![format_ts(&Utc::now())],
				limit,
			)
			.await
	}

	/// Terminal jobs with a webhook URL whose notification has not been sent.
	#[tracing::instrument(skip(self))]
	pub async fn find_jobs_pending_webhook(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self
			.select_jobs(
				"status IN ('succeeded', 'failed', 'cancelled') \
				 AND webhook_url IS NOT NULL AND webhook_sent_at IS NULL \
				 ORDER BY finished_at",
				Vec::new(),
				limit,
			)
			.await
	}

	/// Failed jobs that exhausted their retries and are not yet dead-lettered.
	#[tracing::instrument(skip(self))]
	pub async fn find_dlq_candidates(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self
			.select_jobs(
				"status = 'failed' AND dead_letter_at IS NULL AND retry_count >= max_retries \
				 ORDER BY finished_at",
				Vec::new(),
				limit,
			)
			.await
	}

	#[tracing::instrument(skip(self))]
	pub async fn find_queued_jobs(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self
			.select_jobs("status = 'queued' ORDER BY created_at", Vec::new(), limit)
			.await
	}

	/// Move a running job to `pending_retry`, counting the lost attempt.
	#[tracing::instrument(skip(self))]
	pub async fn mark_job_for_retry(
		&self,
		id: &str,
		reason: &str,
		retry_at: DateTime<Utc>,
	) -> Result<bool> {
		let now = format_ts(&Utc::now());
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET status = 'pending_retry',
				failure_history = json_insert(
					failure_history, '$[#]',
					json_object('attempt', retry_count + 1, 'error', ?, 'timestamp', ?, 'category', 'stale')
				),
				retry_count = retry_count + 1,
				retry_at = ?,
				error = ?,
				worker_id = NULL,
				updated_at = ?
			WHERE id = ? AND status = 'running'
			"#,
		)
		.bind(reason)
		.bind(&now)
		.bind(format_ts(&retry_at))
		.bind(reason)
		.bind(&now)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// `pending_retry` → `queued`. The retry count is carried forward.
	#[tracing::instrument(skip(self))]
	pub async fn requeue_job_for_retry(&self, id: &str) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET status = 'queued', retry_at = NULL, worker_id = NULL, updated_at = ?
			WHERE id = ? AND status = 'pending_retry'
			"#,
		)
		.bind(format_ts(&Utc::now()))
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Set `dead_letter_at` and record the final history entry. A job that is
	/// already dead-lettered is left untouched and `false` is returned.
	#[tracing::instrument(skip(self, entry))]
	pub async fn move_job_to_dlq(&self, id: &str, entry: &FailureHistoryEntry) -> Result<bool> {
		let now = format_ts(&Utc::now());
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET dead_letter_at = ?,
				failure_history = json_insert(failure_history, '$[#]', json(?)),
				updated_at = ?
			WHERE id = ? AND status = 'failed' AND dead_letter_at IS NULL
			"#,
		)
		.bind(&now)
		.bind(serde_json::to_string(entry)?)
		.bind(&now)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	#[tracing::instrument(skip(self))]
	pub async fn clean_expired_idempotency_keys(&self) -> Result<u64> {
		let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?")
			.bind(format_ts(&Utc::now()))
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self))]
	pub async fn update_job_heartbeat(&self, id: &str, worker_id: &str) -> Result<bool> {
		let now = format_ts(&Utc::now());
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET last_heartbeat_at = ?, worker_id = ?, updated_at = ?
			WHERE id = ? AND status = 'running'
			"#,
		)
		.bind(&now)
		.bind(worker_id)
		.bind(&now)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_jobs(
		&self,
		status: Option<JobStatus>,
		limit: u32,
		offset: u32,
	) -> Result<Vec<JobRecord>> {
		let mut qb: QueryBuilder<Sqlite> =
			QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs"));
		if let Some(status) = status {
			qb.push(" WHERE status = ").push_bind(status.as_str());
		}
		qb.push(" ORDER BY created_at DESC LIMIT ")
			.push_bind(limit as i64)
			.push(" OFFSET ")
			.push_bind(offset as i64);

		let rows = qb.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
		rows.into_iter().map(JobRecord::try_from).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_dead_letter_jobs(&self, limit: u32, offset: u32) -> Result<Vec<JobRecord>> {
		let sql = format!(
			"SELECT {JOB_COLUMNS} FROM jobs WHERE dead_letter_at IS NOT NULL \
			 ORDER BY dead_letter_at DESC LIMIT ? OFFSET ?"
		);
		let rows = sqlx::query_as::<_, JobRow>(&sql)
			.bind(limit as i64)
			.bind(offset as i64)
			.fetch_all(&self.pool)
			.await?;

		rows.into_iter().map(JobRecord::try_from).collect()
	}

	/// Operator requeue: create a fresh queued job from a dead-lettered one.
	/// The original keeps its id, status and history.
	#[tracing::instrument(skip(self))]
	pub async fn requeue_dead_letter_job(&self, id: &str) -> Result<JobRecord> {
		let job = self
			.get_job(id)
			.await?
			.ok_or_else(|| DbError::NotFound(id.to_string()))?;

		if !job.is_dead_lettered() {
			return Err(DbError::Conflict(format!(
				"job {id} is not in the dead-letter queue"
			)));
		}

		let existing = sqlx::query_as::<_, (String,)>("SELECT id FROM jobs WHERE requeued_from = ?")
			.bind(id)
			.fetch_optional(&self.pool)
			.await?;
		if let Some((existing_id,)) = existing {
			return Err(DbError::Conflict(format!(
				"job {id} was already requeued as {existing_id}"
			)));
		}

		let new_job = NewJob {
			job_type: job.job_type,
			payload: job.payload,
			correlation_id: job.correlation_id,
			max_retries: job.max_retries,
			steps: job
				.steps
				.iter()
				.map(|s| StepDefinition::new(s.name.clone(), s.label.clone()))
				.collect(),
			webhook_url: job.webhook_url,
			webhook_secret: job.webhook_secret,
			idempotency_key: None,
			requeued_from: Some(job.id),
		};

		let created = self.create_job(&new_job).await?;
		tracing::info!(job_id = %created.id, requeued_from = %id, "dead-lettered job requeued");
		Ok(created)
	}
}

#[async_trait]
pub trait JobStore: Send + Sync {
	async fn create_job(&self, job: &NewJob) -> Result<JobRecord>;
	async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;
	async fn update_job_fields(&self, id: &str, patch: &JobPatch) -> Result<bool>;
	async fn record_step_transition(&self, id: &str, transition: &StepTransition)
		-> Result<bool>;
	async fn find_stale_running_jobs(
		&self,
		heartbeat_timeout: Duration,
		limit: u32,
	) -> Result<Vec<JobRecord>>;
	async fn find_jobs_ready_for_retry(&self, limit: u32) -> Result<Vec<JobRecord>>;
	async fn find_jobs_pending_webhook(&self, limit: u32) -> Result<Vec<JobRecord>>;
	async fn find_dlq_candidates(&self, limit: u32) -> Result<Vec<JobRecord>>;
	async fn find_queued_jobs(&self, limit: u32) -> Result<Vec<JobRecord>>;
	async fn mark_job_for_retry(
		&self,
		id: &str,
		reason: &str,
		retry_at: DateTime<Utc>,
	) -> Result<bool>;
	async fn requeue_job_for_retry(&self, id: &str) -> Result<bool>;
	async fn move_job_to_dlq(&self, id: &str, entry: &FailureHistoryEntry) -> Result<bool>;
	async fn clean_expired_idempotency_keys(&self) -> Result<u64>;
	async fn update_job_heartbeat(&self, id: &str, worker_id: &str) -> Result<bool>;
	async fn list_jobs(
		&self,
		status: Option<JobStatus>,
		limit: u32,
		offset: u32,
	) -> Result<Vec<JobRecord>>;
	async fn list_dead_letter_jobs(&self, limit: u32, offset: u32) -> Result<Vec<JobRecord>>;
	async fn requeue_dead_letter_job(&self, id: &str) -> Result<JobRecord>;
}

#[async_trait]
impl JobStore for JobRepository {
	async fn create_job(&self, job: &NewJob) -> Result<JobRecord> {
		self.create_job(job).await
	}

	async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
		self.get_job(id).await
	}

	async fn update_job_fields(&self, id: &str, patch: &JobPatch) -> Result<bool> {
		self.update_job_fields(id, patch).await
	}

	async fn record_step_transition(
		&self,
		id: &str,
		transition: &StepTransition,
	) -> Result<bool> {
		self.record_step_transition(id, transition).await
	}

	async fn find_stale_running_jobs(
		&self,
		heartbeat_timeout: Duration,
		limit: u32,
	) -> Result<Vec<JobRecord>> {
		self.find_stale_running_jobs(heartbeat_timeout, limit).await
	}

	async fn find_jobs_ready_for_retry(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self.find_jobs_ready_for_retry(limit).await
	}

	async fn find_jobs_pending_webhook(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self.find_jobs_pending_webhook(limit).await
	}

	async fn find_dlq_candidates(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self.find_dlq_candidates(limit).await
	}

	async fn find_queued_jobs(&self, limit: u32) -> Result<Vec<JobRecord>> {
		self.find_queued_jobs(limit).await
	}

	async fn mark_job_for_retry(
		&self,
		id: &str,
		reason: &str,
		retry_at: DateTime<Utc>,
	) -> Result<bool> {
		self.mark_job_for_retry(id, reason, retry_at).await
	}

	async fn requeue_job_for_retry(&self, id: &str) -> Result<bool> {
		self.requeue_job_for_retry(id).await
	}

	async fn move_job_to_dlq(&self, id: &str, entry: &FailureHistoryEntry) -> Result<bool> {
		self.move_job_to_dlq(id, entry).await
	}

	async fn clean_expired_idempotency_keys(&self) -> Result<u64> {
		self.clean_expired_idempotency_keys().await
	}

	async fn update_job_heartbeat(&self, id: &str, worker_id: &str) -> Result<bool> {
		self.update_job_heartbeat(id, worker_id).await
	}

	async fn list_jobs(
		&self,
		status: Option<JobStatus>,
		limit: u32,
		offset: u32,
	) -> Result<Vec<JobRecord>> {
		self.list_jobs(status, limit, offset).await
	}

	async fn list_dead_letter_jobs(&self, limit: u32, offset: u32) -> Result<Vec<JobRecord>> {
		self.list_dead_letter_jobs(limit, offset).await
	}

	async fn requeue_dead_letter_job(&self, id: &str) -> Result<JobRecord> {
		self.requeue_dead_letter_job(id).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_job_test_pool;
	use serde_json::json;

	async fn repo() -> JobRepository {
		JobRepository::new(create_job_test_pool().await)
	}

	fn render_job() -> NewJob {
		NewJob::new("render", json!({ "template": "invoice" }))
			.with_correlation_id("corr-1")
			.with_step("fetch", "Fetch data")
			.with_step("render", "Render document")
	}

	async fn start(repo: &JobRepository, id: &str) {
		let now = Utc::now();
		let started = repo
			.update_job_fields(
				id,
				&JobPatch {
					status: Some(JobStatus::Running),
					started_at: Some(Some(now)),
					last_heartbeat_at: Some(Some(now)),
					worker_id: Some(Some("worker-1".into())),
					only_if_status: Some(JobStatus::Queued),
					..Default::default()
				},
			)
			.await
			.unwrap();
		assert!(started);
	}

	async fn fail_exhausted(repo: &JobRepository, id: &str) {
		start(repo, id).await;
		let patch = JobPatch {
			status: Some(JobStatus::Failed),
			retry_count: Some(3),
			error: Some(Some("validation failed".into())),
			finished_at: Some(Some(Utc::now())),
			only_if_status: Some(JobStatus::Running),
			..Default::default()
		};
		assert!(repo.update_job_fields(id, &patch).await.unwrap());
	}

	#[tokio::test]
	async fn test_create_and_get_job() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();

		assert_eq!(job.status, JobStatus::Queued);
		assert_eq!(job.retry_count, 0);
		assert_eq!(job.max_retries, 3);
		assert_eq!(job.steps.len(), 2);
		assert_eq!(job.correlation_id.as_deref(), Some("corr-1"));

		let fetched = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(fetched.payload, json!({ "template": "invoice" }));
		assert!(repo.get_job("missing").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_idempotency_key_returns_existing_job() {
		let repo = repo().await;
		let first = repo
			.create_job(&render_job().with_idempotency_key("req-42"))
			.await
			.unwrap();
		let second = repo
			.create_job(&render_job().with_idempotency_key("req-42"))
			.await
			.unwrap();
		assert_eq!(first.id, second.id);

		let all = repo.list_jobs(None, 10, 0).await.unwrap();
		assert_eq!(all.len(), 1);
	}

	#[tokio::test]
	async fn test_expired_idempotency_key_is_reclaimed_and_cleaned() {
		let repo = repo().await.with_idempotency_ttl(Duration::ZERO);
		let first = repo
			.create_job(&render_job().with_idempotency_key("req-1"))
			.await
			.unwrap();
		let second = repo
			.create_job(&render_job().with_idempotency_key("req-1"))
			.await
			.unwrap();
		assert_ne!(first.id, second.id);

		assert_eq!(repo.clean_expired_idempotency_keys().await.unwrap(), 1);
		assert_eq!(repo.clean_expired_idempotency_keys().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_conditional_update_respects_status_guard() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();

		let patch = JobPatch::new()
			.status(JobStatus::Succeeded)
			.only_if(JobStatus::Running);
		assert!(!repo.update_job_fields(&job.id, &patch).await.unwrap());

		start(&repo, &job.id).await;
		assert!(repo.update_job_fields(&job.id, &patch).await.unwrap());
		assert!(!repo.update_job_fields(&job.id, &patch).await.unwrap());
	}

	#[tokio::test]
	async fn test_retry_count_never_decreases() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();

		let up = JobPatch {
			retry_count: Some(2),
			..Default::default()
		};
		repo.update_job_fields(&job.id, &up).await.unwrap();
		let down = JobPatch {
			retry_count: Some(1),
			..Default::default()
		};
		repo.update_job_fields(&job.id, &down).await.unwrap();

		assert_eq!(repo.get_job(&job.id).await.unwrap().unwrap().retry_count, 2);
	}

	#[tokio::test]
	async fn test_webhook_pending_guard() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();

		let patch = JobPatch {
			webhook_sent_at: Some(Some(Utc::now())),
			only_if_webhook_pending: true,
			..Default::default()
		};
		assert!(repo.update_job_fields(&job.id, &patch).await.unwrap());
		assert!(!repo.update_job_fields(&job.id, &patch).await.unwrap());
	}

	#[tokio::test]
	async fn test_step_transition_only_while_running() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();

		let running = StepTransition::running("fetch", None);
		assert!(!repo.record_step_transition(&job.id, &running).await.unwrap());

		start(&repo, &job.id).await;
		assert!(repo.record_step_transition(&job.id, &running).await.unwrap());
		assert!(repo
			.record_step_transition(&job.id, &StepTransition::succeeded("fetch", Some(50.0)))
			.await
			.unwrap());
		assert!(!repo
			.record_step_transition(&job.id, &StepTransition::running("nope", None))
			.await
			.unwrap());

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(job.step("fetch").unwrap().status, crate::StepStatus::Succeeded);
		assert_eq!(job.step("render").unwrap().status, crate::StepStatus::Pending);
		assert_eq!(job.progress, 50.0);
		assert_eq!(job.version, 2);
	}

	#[tokio::test]
	async fn test_step_transition_missing_job() {
		let repo = repo().await;
		let err = repo
			.record_step_transition("missing", &StepTransition::running("fetch", None))
			.await
			.unwrap_err();
		assert!(matches!(err, DbError::NotFound(_)));
	}

	#[tokio::test]
	async fn test_stale_detection_and_mark_for_retry() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();
		start(&repo, &job.id).await;

		let fresh = repo
			.find_stale_running_jobs(Duration::from_secs(120), 10)
			.await
			.unwrap();
		assert!(fresh.is_empty());

		let old = Utc::now() - chrono::Duration::minutes(10);
		repo
			.update_job_fields(
				&job.id,
				&JobPatch {
					last_heartbeat_at: Some(Some(old)),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let stale = repo
			.find_stale_running_jobs(Duration::from_secs(120), 10)
			.await
			.unwrap();
		assert_eq!(stale.len(), 1);

		assert!(repo
			.mark_job_for_retry(&job.id, "heartbeat timeout", Utc::now())
			.await
			.unwrap());
		assert!(!repo
			.mark_job_for_retry(&job.id, "heartbeat timeout", Utc::now())
			.await
			.unwrap());

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::PendingRetry);
		assert_eq!(job.retry_count, 1);
		assert_eq!(job.error.as_deref(), Some("heartbeat timeout"));
		assert_eq!(job.failure_history.len(), 1);
		assert_eq!(job.failure_history[0].attempt, 1);
		assert_eq!(job.failure_history[0].category, "stale");
	}

	#[tokio::test]
	async fn test_retry_ready_and_requeue() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();
		start(&repo, &job.id).await;

		let later = Utc::now() + chrono::Duration::hours(1);
		repo
			.mark_job_for_retry(&job.id, "connection reset", later)
			.await
			.unwrap();
		assert!(repo.find_jobs_ready_for_retry(10).await.unwrap().is_empty());

		repo
			.update_job_fields(
				&job.id,
				&JobPatch {
					retry_at: Some(Some(Utc::now() - chrono::Duration::seconds(1))),
					..Default::default()
				},
			)
			.await
			.unwrap();
		let ready = repo.find_jobs_ready_for_retry(10).await.unwrap();
		assert_eq!(ready.len(), 1);

		assert!(repo.requeue_job_for_retry(&job.id).await.unwrap());
		assert!(!repo.requeue_job_for_retry(&job.id).await.unwrap());

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(job.status, JobStatus::Queued);
		assert_eq!(job.retry_count, 1);
		assert!(job.retry_at.is_none());
		assert_eq!(repo.find_queued_jobs(10).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_dlq_promotion_is_idempotent() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();
		fail_exhausted(&repo, &job.id).await;

		let candidates = repo.find_dlq_candidates(10).await.unwrap();
		assert_eq!(candidates.len(), 1);

		let entry = FailureHistoryEntry {
			attempt: 3,
			error: "validation failed".into(),
			timestamp: Utc::now(),
			category: "exhausted".into(),
		};
		assert!(repo.move_job_to_dlq(&job.id, &entry).await.unwrap());
		assert!(!repo.move_job_to_dlq(&job.id, &entry).await.unwrap());
		assert!(repo.find_dlq_candidates(10).await.unwrap().is_empty());

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert!(job.is_dead_lettered());
		assert_eq!(job.failure_history.len(), 1);
		assert_eq!(job.failure_history[0].category, "exhausted");
		assert_eq!(repo.list_dead_letter_jobs(10, 0).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_requeue_dead_letter_job_creates_new_job() {
		let repo = repo().await;
		let original = repo
			.create_job(&render_job().with_webhook("https://example.test/hook", Some("whsec".into())))
			.await
			.unwrap();
		fail_exhausted(&repo, &original.id).await;

		let err = repo.requeue_dead_letter_job(&original.id).await.unwrap_err();
		assert!(matches!(err, DbError::Conflict(_)));

		let entry = FailureHistoryEntry {
			attempt: 3,
			error: "boom".into(),
			timestamp: Utc::now(),
			category: "exhausted".into(),
		};
		repo.move_job_to_dlq(&original.id, &entry).await.unwrap();

		let requeued = repo.requeue_dead_letter_job(&original.id).await.unwrap();
		assert_ne!(requeued.id, original.id);
		assert_eq!(requeued.status, JobStatus::Queued);
		assert_eq!(requeued.retry_count, 0);
		assert_eq!(requeued.requeued_from.as_deref(), Some(original.id.as_str()));
		assert_eq!(requeued.steps.len(), 2);
		assert_eq!(
			requeued.webhook_secret.as_ref().map(|s| s.expose().as_str()),
			Some("whsec")
		);

		let again = repo.requeue_dead_letter_job(&original.id).await.unwrap_err();
		assert!(matches!(again, DbError::Conflict(_)));

		let original = repo.get_job(&original.id).await.unwrap().unwrap();
		assert!(original.is_dead_lettered());
		assert_eq!(original.status, JobStatus::Failed);
	}

	#[tokio::test]
	async fn test_pending_webhook_scan() {
		let repo = repo().await;
		let with_hook = repo
			.create_job(&render_job().with_webhook("https://example.test/hook", None))
			.await
			.unwrap();
		let without_hook = repo.create_job(&render_job()).await.unwrap();

		for id in [&with_hook.id, &without_hook.id] {
			start(&repo, id).await;
			repo
				.update_job_fields(
					id,
					&JobPatch::new()
						.status(JobStatus::Succeeded)
						.only_if(JobStatus::Running),
				)
				.await
				.unwrap();
		}

		let pending = repo.find_jobs_pending_webhook(10).await.unwrap();
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].id, with_hook.id);
	}

	#[tokio::test]
	async fn test_heartbeat_only_for_running_jobs() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();
		assert!(!repo.update_job_heartbeat(&job.id, "w").await.unwrap());

		start(&repo, &job.id).await;
		assert!(repo.update_job_heartbeat(&job.id, "worker-2").await.unwrap());
		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(job.worker_id.as_deref(), Some("worker-2"));
	}

	#[tokio::test]
	async fn test_list_jobs_by_status() {
		let repo = repo().await;
		let a = repo.create_job(&render_job()).await.unwrap();
		repo.create_job(&render_job()).await.unwrap();
		start(&repo, &a.id).await;

		assert_eq!(repo.list_jobs(None, 10, 0).await.unwrap().len(), 2);
		assert_eq!(
			repo
				.list_jobs(Some(JobStatus::Running), 10, 0)
				.await
				.unwrap()
				.len(),
			1
		);
		assert_eq!(repo.list_jobs(None, 1, 1).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_append_failure_and_result() {
		let repo = repo().await;
		let job = repo.create_job(&render_job()).await.unwrap();
		start(&repo, &job.id).await;

		let patch = JobPatch {
			status: Some(JobStatus::Succeeded),
			result: Some(Some(json!({ "artifact": "s3://bucket/out.pdf" }))),
			progress: Some(250.0),
			append_failure: Some(FailureHistoryEntry {
				attempt: 1,
				error: "transient".into(),
				timestamp: Utc::now(),
				category: "transient".into(),
			}),
			..Default::default()
		};
		assert!(repo.update_job_fields(&job.id, &patch).await.unwrap());

		let job = repo.get_job(&job.id).await.unwrap().unwrap();
		assert_eq!(job.result, Some(json!({ "artifact": "s3://bucket/out.pdf" })));
		assert_eq!(job.progress, 100.0);
		assert_eq!(job.failure_history.len(), 1);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job records and the values used to create and mutate them.

use chrono::{DateTime, SecondsFormat, Utc};
use conveyor_common_secret::SecretString;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle state of a job.
///
/// Dead-lettered jobs are `Failed` with `dead_letter_at` set; see
/// [`JobRecord::is_dead_lettered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Queued,
	Running,
	Succeeded,
	Failed,
	PendingRetry,
	Cancelled,
}

impl JobStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobStatus::Queued => "queued",
			JobStatus::Running => "running",
			JobStatus::Succeeded => "succeeded",
			JobStatus::Failed => "failed",
			JobStatus::PendingRetry => "pending_retry",
			JobStatus::Cancelled => "cancelled",
		}
	}

	/// Terminal as far as the executor is concerned. A `Failed` job can still
	/// be promoted to the dead-letter queue by recovery.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
		)
	}
}

impl std::fmt::Display for JobStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for JobStatus {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"queued" => Ok(JobStatus::Queued),
			"running" => Ok(JobStatus::Running),
			"succeeded" => Ok(JobStatus::Succeeded),
			"failed" => Ok(JobStatus::Failed),
			"pending_retry" => Ok(JobStatus::PendingRetry),
			"cancelled" => Ok(JobStatus::Cancelled),
			_ => Err(format!("unknown job status: {s}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
	Pending,
	Running,
	Succeeded,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
	pub name: String,
	pub label: String,
	pub status: StepStatus,
	pub error: Option<String>,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
}

impl JobStep {
	pub fn pending(def: &StepDefinition) -> Self {
		Self {
			name: def.name.clone(),
			label: def.label.clone(),
			status: StepStatus::Pending,
			error: None,
			started_at: None,
			finished_at: None,
		}
	}
}

/// A step declared when the job is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
	pub name: String,
	pub label: String,
}

impl StepDefinition {
	pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			label: label.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureHistoryEntry {
	pub attempt: u32,
	pub error: String,
	pub timestamp: DateTime<Utc>,
	pub category: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
	pub id: String,
	pub job_type: String,
	pub correlation_id: Option<String>,
	pub status: JobStatus,
	pub payload: serde_json::Value,
	pub result: Option<serde_json::Value>,
	pub error: Option<String>,
	pub steps: Vec<JobStep>,
	pub progress: f64,
	pub retry_count: u32,
	pub max_retries: u32,
	pub retry_at: Option<DateTime<Utc>>,
	pub last_heartbeat_at: Option<DateTime<Utc>>,
	pub worker_id: Option<String>,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
	pub dead_letter_at: Option<DateTime<Utc>>,
	pub failure_history: Vec<FailureHistoryEntry>,
	pub webhook_url: Option<String>,
	pub webhook_secret: Option<SecretString>,
	pub webhook_sent_at: Option<DateTime<Utc>>,
	pub requeued_from: Option<String>,
	pub idempotency_key: Option<String>,
	pub version: i64,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl JobRecord {
	pub fn is_dead_lettered(&self) -> bool {
		self.dead_letter_at.is_some()
	}

	pub fn has_retry_budget(&self) -> bool {
		self.retry_count < self.max_retries
	}

	pub fn step(&self, name: &str) -> Option<&JobStep> {
		self.steps.iter().find(|s| s.name == name)
	}
}

/// Input to [`crate::JobRepository::create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
	pub job_type: String,
	pub payload: serde_json::Value,
	pub correlation_id: Option<String>,
	pub max_retries: u32,
	pub steps: Vec<StepDefinition>,
	pub webhook_url: Option<String>,
	pub webhook_secret: Option<SecretString>,
	pub idempotency_key: Option<String>,
	pub requeued_from: Option<String>,
}

impl NewJob {
	pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
		Self {
			job_type: job_type.into(),
			payload,
			correlation_id: None,
			max_retries: DEFAULT_MAX_RETRIES,
			steps: Vec::new(),
			webhook_url: None,
			webhook_secret: None,
			idempotency_key: None,
			requeued_from: None,
		}
	}

	pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
		self.correlation_id = Some(id.into());
		self
	}

	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;
		self
	}

	pub fn with_step(mut self, name: impl Into<String>, label: impl Into<String>) -> Self {
		self.steps.push(StepDefinition::new(name, label));
		self
	}

	pub fn with_webhook(mut self, url: impl Into<String>, secret: Option<SecretString>) -> Self {
		self.webhook_url = Some(url.into());
		self.webhook_secret = secret;
		self
	}

	pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
		self.idempotency_key = Some(key.into());
		self
	}
}

/// A set of column changes applied by
/// [`crate::JobRepository::update_job_fields`].
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable column.
/// The guards turn the write into a compare-and-set so that the executor and
/// the recovery daemon never overwrite each other's transitions.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
	pub status: Option<JobStatus>,
	pub retry_count: Option<u32>,
	pub retry_at: Option<Option<DateTime<Utc>>>,
	pub last_heartbeat_at: Option<Option<DateTime<Utc>>>,
	pub worker_id: Option<Option<String>>,
	pub started_at: Option<Option<DateTime<Utc>>>,
	pub finished_at: Option<Option<DateTime<Utc>>>,
	pub error: Option<Option<String>>,
	pub progress: Option<f64>,
	pub result: Option<Option<serde_json::Value>>,
	pub webhook_sent_at: Option<Option<DateTime<Utc>>>,
	pub append_failure: Option<FailureHistoryEntry>,

	pub only_if_status: Option<JobStatus>,
	pub only_if_webhook_pending: bool,
}

impl JobPatch {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn status(mut self, status: JobStatus) -> Self {
		self.status = Some(status);
		self
	}

	pub fn only_if(mut self, status: JobStatus) -> Self {
		self.only_if_status = Some(status);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.status.is_none()
			&& self.retry_count.is_none()
			&& self.retry_at.is_none()
			&& self.last_heartbeat_at.is_none()
			&& self.worker_id.is_none()
			&& self.started_at.is_none()
			&& self.finished_at.is_none()
			&& self.error.is_none()
			&& self.progress.is_none()
			&& self.result.is_none()
			&& self.webhook_sent_at.is_none()
			&& self.append_failure.is_none()
	}
}

/// One step's state change, applied by
/// [`crate::JobRepository::record_step_transition`].
#[derive(Debug, Clone)]
pub struct StepTransition {
	pub name: String,
	pub status: StepStatus,
	pub label: Option<String>,
	pub error: Option<String>,
	pub progress: Option<f64>,
}

impl StepTransition {
	pub fn running(name: impl Into<String>, label: Option<String>) -> Self {
		Self {
			name: name.into(),
			status: StepStatus::Running,
			label,
			error: None,
			progress: None,
		}
	}

	pub fn succeeded(name: impl Into<String>, progress: Option<f64>) -> Self {
		Self {
			name: name.into(),
			status: StepStatus::Succeeded,
			label: None,
			error: None,
			progress,
		}
	}

	pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			status: StepStatus::Failed,
			label: None,
			error: Some(error.into()),
			progress: None,
		}
	}

	/// Apply to a step list in place. Returns `false` when no step has this name.
	pub fn apply(&self, steps: &mut [JobStep], now: DateTime<Utc>) -> bool {
		let Some(step) = steps.iter_mut().find(|s| s.name == self.name) else {
			return false;
		};

		step.status = self.status;
		match self.status {
			StepStatus::Pending => {
				step.started_at = None;
				step.finished_at = None;
				step.error = None;
			}
			StepStatus::Running => {
				step.started_at = Some(now);
				step.finished_at = None;
				step.error = None;
			}
			StepStatus::Succeeded => {
				step.finished_at = Some(now);
				step.error = None;
			}
			StepStatus::Failed => {
				step.finished_at = Some(now);
				step.error = self.error.clone();
			}
		}
		if let Some(label) = &self.label {
			step.label = label.clone();
		}
		true
	}
}

/// Fixed-width UTC timestamps so that lexical order in SQLite matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn clamp_progress(value: f64) -> f64 {
	if value.is_nan() {
		0.0
	} else {
		value.clamp(0.0, 100.0)
	}
}

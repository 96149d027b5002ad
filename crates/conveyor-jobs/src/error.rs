// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use conveyor_jobs_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
	/// Work failed; the classifier decides whether it is retried.
	#[error("{0}")]
	Failed(String),

	/// Work failed in a way that can never succeed on retry.
	#[error("{0}")]
	Permanent(String),

	#[error("invalid payload: {0}")]
	InvalidPayload(String),

	#[error("job cancelled")]
	Cancelled,

	#[error("job not found: {0}")]
	NotFound(String),

	#[error("no handler registered for job type '{0}'")]
	UnknownJobType(String),

	#[error("handler already registered for job type '{0}'")]
	DuplicateHandler(String),

	#[error("job {0} is already active in this pool")]
	AlreadyActive(String),

	#[error("worker pool is shutting down")]
	PoolClosed,

	#[error("database error: {0}")]
	Database(#[from] DbError),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl JobError {
	pub fn failed(message: impl Into<String>) -> Self {
		JobError::Failed(message.into())
	}

	pub fn permanent(message: impl Into<String>) -> Self {
		JobError::Permanent(message.into())
	}
}

pub type Result<T> = std::result::Result<T, JobError>;

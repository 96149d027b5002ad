// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job store errors.

#[derive(Debug, thiserror::Error)]
pub enum DbError {
	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Job not found: {0}")]
	NotFound(String),

	/// A conditional update kept losing to concurrent writers, or a
	/// requested transition is not allowed from the job's current state.
	#[error("Conflict: {0}")]
	Conflict(String),

	#[error("Corrupt job row {job_id}: {message}")]
	CorruptRow { job_id: String, message: String },

	#[error("Internal: {0}")]
	Internal(String),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;

use crate::error::DbError;

const SCHEMA: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS jobs (
		id TEXT PRIMARY KEY NOT NULL,
		job_type TEXT NOT NULL,
		correlation_id TEXT,
		status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'succeeded', 'failed', 'pending_retry', 'cancelled')),
		payload TEXT NOT NULL,
		result TEXT,
		error TEXT,
		steps TEXT NOT NULL DEFAULT '[]',
		progress REAL NOT NULL DEFAULT 0,
		retry_count INTEGER NOT NULL DEFAULT 0,
		max_retries INTEGER NOT NULL DEFAULT 3,
		retry_at TEXT,
		last_heartbeat_at TEXT,
		worker_id TEXT,
		started_at TEXT,
		finished_at TEXT,
		dead_letter_at TEXT,
		failure_history TEXT NOT NULL DEFAULT '[]',
		webhook_url TEXT,
		webhook_secret TEXT,
		webhook_sent_at TEXT,
		requeued_from TEXT,
		idempotency_key TEXT,
		version INTEGER NOT NULL DEFAULT 0,
		created_at TEXT NOT NULL,
		updated_at TEXT NOT NULL
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_jobs_status_heartbeat ON jobs(status, last_heartbeat_at)",
	"CREATE INDEX IF NOT EXISTS idx_jobs_status_retry_at ON jobs(status, retry_at)",
	"CREATE INDEX IF NOT EXISTS idx_jobs_status_created_at ON jobs(status, created_at)",
	"CREATE INDEX IF NOT EXISTS idx_jobs_webhook_pending ON jobs(webhook_sent_at) WHERE webhook_url IS NOT NULL",
	"CREATE INDEX IF NOT EXISTS idx_jobs_dlq ON jobs(status, dead_letter_at, retry_count)",
	r#"
	CREATE TABLE IF NOT EXISTS idempotency_keys (
		key TEXT PRIMARY KEY NOT NULL,
		job_id TEXT NOT NULL,
		created_at TEXT NOT NULL,
		expires_at TEXT NOT NULL
	)
	"#,
	"CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires_at ON idempotency_keys(expires_at)",
];

/// Create a SqlitePool with WAL mode and common settings.
///
/// # Errors
/// Returns `DbError::Internal` if the URL is invalid or connection fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, DbError> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| DbError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;

	tracing::debug!("database pool created");
	Ok(pool)
}

/// Create the job tables and indexes if they do not exist.
#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
	for statement in SCHEMA {
		sqlx::query(statement).execute(pool).await?;
	}
	tracing::debug!(statements = SCHEMA.len(), "job schema applied");
	Ok(())
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable job store for the conveyor engine.
//!
//! [`JobRepository`] persists jobs in SQLite and exposes every state change
//! as a conditional update; [`JobStore`] is the trait the engine depends on.

pub mod error;
pub mod job;
pub mod pool;
pub mod testing;
pub mod types;

pub use error::{DbError, Result};
pub use job::{JobRepository, JobStore};
pub use pool::{create_pool, run_migrations};
pub use sqlx::SqlitePool;
pub use types::{
	FailureHistoryEntry, JobPatch, JobRecord, JobStatus, JobStep, NewJob, StepDefinition,
	StepStatus, StepTransition, DEFAULT_MAX_RETRIES,
};

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::JobContext;
use crate::error::{JobError, Result};

#[derive(Debug, Clone, Default)]
pub struct JobOutput {
	pub message: String,
	/// Persisted as the job's `result`.
	pub result: Option<Value>,
}

impl JobOutput {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			result: None,
		}
	}

	pub fn with_result(mut self, result: Value) -> Self {
		self.result = Some(result);
		self
	}
}

/// Work function for one job type.
///
/// Returning `Err(JobError::Cancelled)` after observing the context's token
/// marks the job cancelled. `JobError::Permanent` and `JobError::InvalidPayload`
/// are never retried; other errors go through the classifier.
#[async_trait]
pub trait JobHandler: Send + Sync {
	fn job_type(&self) -> &str;

	fn description(&self) -> &str {
		""
	}

	async fn run(&self, ctx: &JobContext, payload: Value) -> Result<JobOutput>;
}

/// Job-type string to handler, populated once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
	handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
		let job_type = handler.job_type().to_string();
		if self.handlers.contains_key(&job_type) {
			return Err(JobError::DuplicateHandler(job_type));
		}
		tracing::debug!(job_type = %job_type, "registered job handler");
		self.handlers.insert(job_type, handler);
		Ok(())
	}

	pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
		self.handlers.get(job_type).cloned()
	}

	pub fn job_types(&self) -> Vec<&str> {
		let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
		types.sort_unstable();
		types
	}
}

/// Deserialize a payload into the handler's input type.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
	serde_json::from_value(payload).map_err(|e| JobError::InvalidPayload(e.to_string()))
}

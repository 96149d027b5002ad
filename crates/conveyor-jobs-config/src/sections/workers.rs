// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Worker pool configuration section.

use serde::{Deserialize, Serialize};

fn default_max_workers() -> usize {
	std::thread::available_parallelism()
		.map(|n| n.get())
		.unwrap_or(4)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfigLayer {
	pub max_workers: Option<usize>,
	pub heartbeat_interval_secs: Option<u64>,
	pub max_retries: Option<u32>,
	pub retry_base_delay_secs: Option<u64>,
	pub retry_max_delay_secs: Option<u64>,
	pub shutdown_timeout_secs: Option<u64>,
}

impl WorkersConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.max_workers.is_some() {
			self.max_workers = other.max_workers;
		}
		if other.heartbeat_interval_secs.is_some() {
			self.heartbeat_interval_secs = other.heartbeat_interval_secs;
		}
		if other.max_retries.is_some() {
			self.max_retries = other.max_retries;
		}
		if other.retry_base_delay_secs.is_some() {
			self.retry_base_delay_secs = other.retry_base_delay_secs;
		}
		if other.retry_max_delay_secs.is_some() {
			self.retry_max_delay_secs = other.retry_max_delay_secs;
		}
		if other.shutdown_timeout_secs.is_some() {
			self.shutdown_timeout_secs = other.shutdown_timeout_secs;
		}
	}

	pub fn finalize(self) -> WorkersConfig {
		WorkersConfig {
			max_workers: self.max_workers.unwrap_or_else(default_max_workers),
			heartbeat_interval_secs: self.heartbeat_interval_secs.unwrap_or(30),
			max_retries: self.max_retries.unwrap_or(3),
			retry_base_delay_secs: self.retry_base_delay_secs.unwrap_or(30),
			retry_max_delay_secs: self.retry_max_delay_secs.unwrap_or(3600),
			shutdown_timeout_secs: self.shutdown_timeout_secs.unwrap_or(30),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
	pub max_workers: usize,
	pub heartbeat_interval_secs: u64,
	/// Default retry ceiling for jobs enqueued without one.
	pub max_retries: u32,
	pub retry_base_delay_secs: u64,
	pub retry_max_delay_secs: u64,
	pub shutdown_timeout_secs: u64,
}

impl Default for WorkersConfig {
	fn default() -> Self {
		WorkersConfigLayer::default().finalize()
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Recovery daemon configuration section.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfigLayer {
	pub enabled: Option<bool>,
	pub poll_interval_secs: Option<u64>,
	pub heartbeat_timeout_secs: Option<u64>,
	pub scan_batch_size: Option<u32>,
	pub webhook_concurrency: Option<usize>,
	pub stop_timeout_secs: Option<u64>,
}

impl RecoveryConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.enabled.is_some() {
			self.enabled = other.enabled;
		}
		if other.poll_interval_secs.is_some() {
			self.poll_interval_secs = other.poll_interval_secs;
		}
		if other.heartbeat_timeout_secs.is_some() {
			self.heartbeat_timeout_secs = other.heartbeat_timeout_secs;
		}
		if other.scan_batch_size.is_some() {
			self.scan_batch_size = other.scan_batch_size;
		}
		if other.webhook_concurrency.is_some() {
			self.webhook_concurrency = other.webhook_concurrency;
		}
		if other.stop_timeout_secs.is_some() {
			self.stop_timeout_secs = other.stop_timeout_secs;
		}
	}

	pub fn finalize(self) -> RecoveryConfig {
		RecoveryConfig {
			enabled: self.enabled.unwrap_or(true),
			poll_interval_secs: self.poll_interval_secs.unwrap_or(30),
			heartbeat_timeout_secs: self.heartbeat_timeout_secs.unwrap_or(120),
			scan_batch_size: self.scan_batch_size.unwrap_or(500),
			webhook_concurrency: self.webhook_concurrency.unwrap_or(4),
			stop_timeout_secs: self.stop_timeout_secs.unwrap_or(10),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryConfig {
	pub enabled: bool,
	pub poll_interval_secs: u64,
	pub heartbeat_timeout_secs: u64,
	/// Upper bound on jobs fetched per reconciliation step per cycle.
	pub scan_batch_size: u32,
	pub webhook_concurrency: usize,
	pub stop_timeout_secs: u64,
}

impl Default for RecoveryConfig {
	fn default() -> Self {
		RecoveryConfigLayer::default().finalize()
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job store configuration.

use serde::{Deserialize, Serialize};

const DEFAULT_URL: &str = "sqlite:./conveyor.db";
const DEFAULT_IDEMPOTENCY_KEY_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
	pub url: String,
	/// How long an enqueue idempotency key keeps deduplicating.
	pub idempotency_key_ttl_secs: u64,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		DatabaseConfigLayer::default().finalize()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfigLayer {
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub idempotency_key_ttl_secs: Option<u64>,
}

impl DatabaseConfigLayer {
	pub fn merge(&mut self, other: DatabaseConfigLayer) {
		if other.url.is_some() {
			self.url = other.url;
		}
		if other.idempotency_key_ttl_secs.is_some() {
			self.idempotency_key_ttl_secs = other.idempotency_key_ttl_secs;
		}
	}

	pub fn finalize(self) -> DatabaseConfig {
		DatabaseConfig {
			url: self.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
			idempotency_key_ttl_secs: self
				.idempotency_key_ttl_secs
				.unwrap_or(DEFAULT_IDEMPOTENCY_KEY_TTL_SECS),
		}
	}
}

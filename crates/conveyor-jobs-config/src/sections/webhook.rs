// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Completion webhook configuration section.

use conveyor_common_secret::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfigLayer {
	pub max_retries: Option<u32>,
	pub initial_backoff_secs: Option<u64>,
	pub timeout_secs: Option<u64>,
	pub signing_secret: Option<SecretString>,
}

impl WebhookConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.max_retries.is_some() {
			self.max_retries = other.max_retries;
		}
		if other.initial_backoff_secs.is_some() {
			self.initial_backoff_secs = other.initial_backoff_secs;
		}
		if other.timeout_secs.is_some() {
			self.timeout_secs = other.timeout_secs;
		}
		if other.signing_secret.is_some() {
			self.signing_secret = other.signing_secret;
		}
	}

	pub fn finalize(self) -> WebhookConfig {
		WebhookConfig {
			max_retries: self.max_retries.unwrap_or(3),
			initial_backoff_secs: self.initial_backoff_secs.unwrap_or(1),
			timeout_secs: self.timeout_secs.unwrap_or(10),
			signing_secret: self.signing_secret,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
	pub max_retries: u32,
	pub initial_backoff_secs: u64,
	pub timeout_secs: u64,
	/// Fallback key for jobs enqueued without their own webhook secret.
	pub signing_secret: Option<SecretString>,
}

impl Default for WebhookConfig {
	fn default() -> Self {
		WebhookConfigLayer::default().finalize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_values() {
		let config = WebhookConfig::default();
		assert_eq!(config.max_retries, 3);
		assert_eq!(config.initial_backoff_secs, 1);
		assert_eq!(config.timeout_secs, 10);
		assert!(config.signing_secret.is_none());
	}

	#[test]
	fn test_secret_from_toml_is_redacted_in_debug() {
		let layer: WebhookConfigLayer =
			toml::from_str("signing_secret = \"whsec_toml\"\n").unwrap();
		let config = layer.finalize();
		assert_eq!(
			config.signing_secret.as_ref().map(|s| s.expose().as_str()),
			Some("whsec_toml")
		);
		assert!(!format!("{config:?}").contains("whsec_toml"));
	}
}

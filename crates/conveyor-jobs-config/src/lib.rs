// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered configuration for the conveyor job engine.
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults
//! - TOML file (`/etc/conveyor/conveyor.toml` or a path given on the command line)
//! - environment variables (`CONVEYOR_*`)
//!
//! ```ignore
//! use conveyor_jobs_config::load_config;
//!
//! let config = load_config()?;
//! println!("running {} workers", config.workers.max_workers);
//! ```

pub mod env;
pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use env::{load_secret_env, SecretEnvError};
pub use error::ConfigError;
pub use layer::ConveyorConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ConveyorConfig {
	pub database: DatabaseConfig,
	pub workers: WorkersConfig,
	pub recovery: RecoveryConfig,
	pub webhook: WebhookConfig,
	pub logging: LoggingConfig,
}

pub fn load_config() -> Result<ConveyorConfig, ConfigError> {
	load_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(
	config_path: impl Into<std::path::PathBuf>,
) -> Result<ConveyorConfig, ConfigError> {
	load_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

/// Load configuration from environment only.
pub fn load_config_from_env() -> Result<ConveyorConfig, ConfigError> {
	let mut merged = ConveyorConfigLayer::default();
	merged.merge(EnvSource.load()?);
	finalize(merged)
}

fn load_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ConveyorConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ConveyorConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	finalize(merged)
}

/// Finalize a merged layer into resolved config.
pub fn finalize(layer: ConveyorConfigLayer) -> Result<ConveyorConfig, ConfigError> {
	let config = ConveyorConfig {
		database: layer.database.unwrap_or_default().finalize(),
		workers: layer.workers.unwrap_or_default().finalize(),
		recovery: layer.recovery.unwrap_or_default().finalize(),
		webhook: layer.webhook.unwrap_or_default().finalize(),
		logging: layer.logging.unwrap_or_default().finalize(),
	};

	validate_config(&config)?;

	info!(
		database = %config.database.url,
		max_workers = config.workers.max_workers,
		recovery_enabled = config.recovery.enabled,
		poll_interval_secs = config.recovery.poll_interval_secs,
		heartbeat_timeout_secs = config.recovery.heartbeat_timeout_secs,
		webhook_secret_configured = config.webhook.signing_secret.is_some(),
		"conveyor configuration loaded"
	);

	Ok(config)
}

/// Validate cross-field configuration rules.
fn validate_config(config: &ConveyorConfig) -> Result<(), ConfigError> {
	if config.workers.max_workers == 0 {
		return Err(ConfigError::Validation(
			"workers.max_workers must be at least 1".to_string(),
		));
	}
	if config.recovery.poll_interval_secs == 0 {
		return Err(ConfigError::Validation(
			"recovery.poll_interval_secs must be at least 1".to_string(),
		));
	}
	if config.recovery.heartbeat_timeout_secs <= config.workers.heartbeat_interval_secs {
		return Err(ConfigError::Validation(format!(
			"recovery.heartbeat_timeout_secs ({}) must exceed workers.heartbeat_interval_secs ({})",
			config.recovery.heartbeat_timeout_secs, config.workers.heartbeat_interval_secs
		)));
	}
	if config.webhook.max_retries == 0 {
		return Err(ConfigError::Validation(
			"webhook.max_retries must be at least 1".to_string(),
		));
	}
	if config.recovery.scan_batch_size == 0 {
		return Err(ConfigError::Validation(
			"recovery.scan_batch_size must be at least 1".to_string(),
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_validate() {
		let config = finalize(ConveyorConfigLayer::default()).unwrap();
		assert_eq!(config.recovery.heartbeat_timeout_secs, 120);
		assert_eq!(config.workers.heartbeat_interval_secs, 30);
	}

	#[test]
	fn test_zero_workers_rejected() {
		let layer = ConveyorConfigLayer {
			workers: Some(WorkersConfigLayer {
				max_workers: Some(0),
				..Default::default()
			}),
			..Default::default()
		};
		assert!(matches!(finalize(layer), Err(ConfigError::Validation(_))));
	}

	#[test]
	fn test_heartbeat_timeout_must_exceed_interval() {
		let layer = ConveyorConfigLayer {
			workers: Some(WorkersConfigLayer {
				heartbeat_interval_secs: Some(60),
				..Default::default()
			}),
			recovery: Some(RecoveryConfigLayer {
				heartbeat_timeout_secs: Some(60),
				..Default::default()
			}),
			..Default::default()
		};
		let err = finalize(layer).unwrap_err();
		assert!(err.to_string().contains("heartbeat_timeout_secs"));
	}

	#[test]
	fn test_zero_poll_interval_rejected() {
		let layer = ConveyorConfigLayer {
			recovery: Some(RecoveryConfigLayer {
				poll_interval_secs: Some(0),
				..Default::default()
			}),
			..Default::default()
		};
		assert!(finalize(layer).is_err());
	}

	#[test]
	fn test_file_values_used_when_env_unset() {
		use std::io::Write;
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[webhook]\ninitial_backoff_secs = 7").unwrap();
		let config = load_config_with_file(file.path()).unwrap();
		assert_eq!(config.webhook.initial_backoff_secs, 7);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::env::load_secret_env;
use crate::error::ConfigError;
use crate::layer::ConveyorConfigLayer;
use crate::sections::{
	DatabaseConfigLayer, LogFormat, LoggingConfigLayer, RecoveryConfigLayer, WebhookConfigLayer,
	WorkersConfigLayer,
};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ConveyorConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ConveyorConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ConveyorConfigLayer::default())
	}
}

/// TOML file source. A missing file is not an error.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/conveyor/conveyor.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ConveyorConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ConveyorConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ConveyorConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: CONVEYOR_<FIELD>, with webhook settings under CONVEYOR_WEBHOOK_*.
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ConveyorConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ConveyorConfigLayer {
			database: Some(load_database_from_env()?),
			workers: Some(load_workers_from_env()?),
			recovery: Some(load_recovery_from_env()?),
			webhook: Some(load_webhook_from_env()?),
			logging: Some(load_logging_from_env()?),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str, kind: &str) -> Result<Option<T>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid {kind} value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn load_database_from_env() -> Result<DatabaseConfigLayer, ConfigError> {
	Ok(DatabaseConfigLayer {
		url: env_var("CONVEYOR_DATABASE_URL"),
		idempotency_key_ttl_secs: env_parse("CONVEYOR_IDEMPOTENCY_KEY_TTL_SECS", "u64")?,
	})
}

fn load_workers_from_env() -> Result<WorkersConfigLayer, ConfigError> {
	Ok(WorkersConfigLayer {
		max_workers: env_parse("CONVEYOR_MAX_WORKERS", "usize")?,
		heartbeat_interval_secs: env_parse("CONVEYOR_HEARTBEAT_INTERVAL_SECS", "u64")?,
		max_retries: env_parse("CONVEYOR_MAX_RETRIES", "u32")?,
		retry_base_delay_secs: env_parse("CONVEYOR_RETRY_BASE_DELAY_SECS", "u64")?,
		retry_max_delay_secs: env_parse("CONVEYOR_RETRY_MAX_DELAY_SECS", "u64")?,
		shutdown_timeout_secs: env_parse("CONVEYOR_SHUTDOWN_TIMEOUT_SECS", "u64")?,
	})
}

fn load_recovery_from_env() -> Result<RecoveryConfigLayer, ConfigError> {
	Ok(RecoveryConfigLayer {
		enabled: env_bool("CONVEYOR_RECOVERY_ENABLED"),
		poll_interval_secs: env_parse("CONVEYOR_POLL_INTERVAL_SECS", "u64")?,
		heartbeat_timeout_secs: env_parse("CONVEYOR_HEARTBEAT_TIMEOUT_SECS", "u64")?,
		scan_batch_size: env_parse("CONVEYOR_SCAN_BATCH_SIZE", "u32")?,
		webhook_concurrency: env_parse("CONVEYOR_WEBHOOK_CONCURRENCY", "usize")?,
		stop_timeout_secs: env_parse("CONVEYOR_RECOVERY_STOP_TIMEOUT_SECS", "u64")?,
	})
}

fn load_webhook_from_env() -> Result<WebhookConfigLayer, ConfigError> {
	Ok(WebhookConfigLayer {
		max_retries: env_parse("CONVEYOR_WEBHOOK_MAX_RETRIES", "u32")?,
		initial_backoff_secs: env_parse("CONVEYOR_WEBHOOK_INITIAL_BACKOFF_SECS", "u64")?,
		timeout_secs: env_parse("CONVEYOR_WEBHOOK_TIMEOUT_SECS", "u64")?,
		signing_secret: load_secret_env("CONVEYOR_WEBHOOK_SIGNING_SECRET")
			.map_err(|e| ConfigError::Secret(e.to_string()))?,
	})
}

fn load_logging_from_env() -> Result<LoggingConfigLayer, ConfigError> {
	let format = match env_var("CONVEYOR_LOG_FORMAT") {
		Some(v) => Some(v.parse::<LogFormat>().map_err(|message| {
			ConfigError::InvalidValue {
				key: "CONVEYOR_LOG_FORMAT".to_string(),
				message,
			}
		})?),
		None => None,
	};

	Ok(LoggingConfigLayer {
		level: env_var("CONVEYOR_LOG_LEVEL"),
		format,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[test]
	fn test_precedence_ordering() {
		assert!(Precedence::Defaults < Precedence::ConfigFile);
		assert!(Precedence::ConfigFile < Precedence::Environment);
	}

	#[test]
	fn test_toml_source_missing_file_is_empty_layer() {
		let layer = TomlSource::new("/nonexistent/conveyor.toml").load().unwrap();
		assert!(layer.workers.is_none());
	}

	#[test]
	fn test_toml_source_reads_file() {
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "[recovery]\nheartbeat_timeout_secs = 45").unwrap();
		let layer = TomlSource::new(file.path()).load().unwrap();
		assert_eq!(layer.recovery.unwrap().heartbeat_timeout_secs, Some(45));
	}

	#[test]
	fn test_toml_source_reports_parse_errors() {
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "[recovery\nbroken").unwrap();
		let err = TomlSource::new(file.path()).load().unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}

	#[test]
	fn test_env_parse_rejects_garbage() {
		let var = "CONVEYOR_TEST_PARSE_GARBAGE_4411";
		std::env::set_var(var, "not-a-number");
		let err = env_parse::<u64>(var, "u64").unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
		std::env::remove_var(var);
	}

	#[test]
	fn test_env_parse_unset_is_none() {
		let var = "CONVEYOR_TEST_PARSE_UNSET_4412";
		std::env::remove_var(var);
		assert_eq!(env_parse::<u64>(var, "u64").unwrap(), None);
	}
}

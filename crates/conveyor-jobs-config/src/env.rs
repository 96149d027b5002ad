// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loading secrets from `VAR` or `VAR_FILE`.

use std::path::PathBuf;
use std::{env, fs};

use conveyor_common_secret::SecretString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretEnvError {
	#[error("failed to read secret file at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("secret file path in {var} is empty")]
	EmptyPath { var: String },
}

/// Load a secret from `{var}_FILE` (preferred) or `{var}`.
///
/// A single trailing newline is stripped from file contents, which is how
/// Docker and Kubernetes mount secrets. Empty values count as unset.
pub fn load_secret_env(var: &str) -> Result<Option<SecretString>, SecretEnvError> {
	let file_var = format!("{var}_FILE");

	if let Ok(path_str) = env::var(&file_var) {
		if path_str.is_empty() {
			return Err(SecretEnvError::EmptyPath { var: file_var });
		}

		let path = PathBuf::from(&path_str);
		let content = fs::read_to_string(&path).map_err(|e| SecretEnvError::Io {
			path: path.clone(),
			source: e,
		})?;

		let secret = content.strip_suffix('\n').unwrap_or(&content);
		return Ok(SecretString::non_empty(secret));
	}

	Ok(env::var(var).ok().and_then(|v| SecretString::non_empty(v)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[test]
	fn returns_none_when_not_set() {
		let var = "CONVEYOR_TEST_SECRET_UNSET_8812";
		env::remove_var(var);
		env::remove_var(format!("{var}_FILE"));
		assert!(load_secret_env(var).unwrap().is_none());
	}

	#[test]
	fn reads_direct_value() {
		let var = "CONVEYOR_TEST_SECRET_DIRECT_8813";
		env::set_var(var, "whsec_direct");
		let secret = load_secret_env(var).unwrap().unwrap();
		assert_eq!(secret.expose(), "whsec_direct");
		env::remove_var(var);
	}

	#[test]
	fn file_takes_precedence_and_strips_newline() {
		let var = "CONVEYOR_TEST_SECRET_FILE_8814";
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "whsec_from_file").unwrap();

		env::set_var(var, "whsec_direct");
		env::set_var(format!("{var}_FILE"), file.path());

		let secret = load_secret_env(var).unwrap().unwrap();
		assert_eq!(secret.expose(), "whsec_from_file");

		env::remove_var(var);
		env::remove_var(format!("{var}_FILE"));
	}

	#[test]
	fn empty_file_path_is_an_error() {
		let var = "CONVEYOR_TEST_SECRET_EMPTY_PATH_8815";
		env::set_var(format!("{var}_FILE"), "");
		let err = load_secret_env(var).unwrap_err();
		assert!(matches!(err, SecretEnvError::EmptyPath { .. }));
		env::remove_var(format!("{var}_FILE"));
	}
}

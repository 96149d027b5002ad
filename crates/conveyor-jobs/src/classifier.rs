// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Failure classification.
//!
//! Messages are lower-cased and matched against ordered pattern groups. Permanent
//! patterns are checked first, so "404 not found: connection refused" is
//! permanent. Anything that matches nothing is `unknown` and retried.

use std::error::Error as StdError;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
	Transient,
	Timeout,
	Resource,
	Permanent,
	Unknown,
}

impl ErrorCategory {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCategory::Transient => "transient",
			ErrorCategory::Timeout => "timeout",
			ErrorCategory::Resource => "resource",
			ErrorCategory::Permanent => "permanent",
			ErrorCategory::Unknown => "unknown",
		}
	}
}

impl std::fmt::Display for ErrorCategory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
	pub category: ErrorCategory,
	pub is_retriable: bool,
	/// Scales the retry delay. 2.0 for resource exhaustion, 1.0 otherwise.
	pub backoff_multiplier: f64,
	pub original_message: String,
	pub normalized_message: String,
}

impl ClassifiedError {
	fn new(category: ErrorCategory, message: &str, normalized: String) -> Self {
		let (is_retriable, backoff_multiplier) = match category {
			ErrorCategory::Permanent => (false, 1.0),
			ErrorCategory::Resource => (true, 2.0),
			_ => (true, 1.0),
		};
		Self {
			category,
			is_retriable,
			backoff_multiplier,
			original_message: message.to_string(),
			normalized_message: normalized,
		}
	}

	pub fn permanent(message: &str) -> Self {
		Self::new(ErrorCategory::Permanent, message, normalize(message))
	}

	pub fn unknown(message: &str) -> Self {
		Self::new(ErrorCategory::Unknown, message, normalize(message))
	}
}

static PERMANENT: LazyLock<Regex> = LazyLock::new(|| {
	pattern(&[
		r"not found",
		r"does not exist",
		r"validation",
		r"invalid",
		r"malformed",
		r"missing required",
		r"required field",
		r"missing field",
		r"unauthori[sz]ed",
		r"forbidden",
		r"permission denied",
		r"access denied",
		r"authentication failed",
		r"\b(400|401|403|404|422)\b",
		r"bad request",
		r"unprocessable",
	])
});

static RESOURCE: LazyLock<Regex> = LazyLock::new(|| {
	pattern(&[
		r"rate.?limit",
		r"too many requests",
		r"\b429\b",
		r"quota",
		r"disk (space|full)",
		r"no space left",
		r"out of memory",
		r"cannot allocate memory",
		r"resource exhausted",
	])
});

static TIMEOUT: LazyLock<Regex> =
	LazyLock::new(|| pattern(&[r"timed? ?out", r"timeout", r"deadline exceeded"]));

static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
	pattern(&[
		r"connection (refused|reset|closed|aborted)",
		r"econnrefused",
		r"econnreset",
		r"broken pipe",
		r"temporar",
		r"unavailable",
		r"\b50\d\b",
		r"bad gateway",
		r"try again",
		r"\block",
		r"deadlock",
		r"busy",
		r"crash",
		r"(browser|target) (has been )?closed",
		r"process (exited|died|killed)",
		r"network",
		r"dns",
	])
});

fn pattern(alternatives: &[&str]) -> Regex {
	Regex::new(&alternatives.join("|")).expect("classifier patterns are valid regexes")
}

fn normalize(message: &str) -> String {
	message.trim().to_lowercase()
}

pub fn classify(message: &str) -> ClassifiedError {
	let normalized = normalize(message);
	let category = if normalized.is_empty() {
		ErrorCategory::Unknown
	} else if PERMANENT.is_match(&normalized) {
		ErrorCategory::Permanent
	} else if RESOURCE.is_match(&normalized) {
		ErrorCategory::Resource
	} else if TIMEOUT.is_match(&normalized) {
		ErrorCategory::Timeout
	} else if TRANSIENT.is_match(&normalized) {
		ErrorCategory::Transient
	} else {
		ErrorCategory::Unknown
	};
	ClassifiedError::new(category, message, normalized)
}

/// Classify an error using its whole `source()` chain.
pub fn classify_error(error: &(dyn StdError + 'static)) -> ClassifiedError {
	let mut message = error.to_string();
	let mut source = error.source();
	while let Some(cause) = source {
		message.push_str(": ");
		message.push_str(&cause.to_string());
		source = cause.source();
	}
	classify(&message)
}

pub fn classify_optional(message: Option<&str>) -> ClassifiedError {
	classify(message.unwrap_or_default())
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::classifier::ClassifiedError;

const RETRY_FACTOR: f64 = 2.0;

/// Exponential retry delays with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(30),
			max_delay: Duration::from_secs(3600),
		}
	}
}

impl RetryPolicy {
	pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
		Self {
			base_delay,
			max_delay,
		}
	}

	/// Delay before the attempt following failure number `retry_count`
	/// (1 for the first failure). Scaled by the classifier's multiplier.
	pub fn delay_for(&self, retry_count: u32, multiplier: f64) -> Duration {
		let exponent = retry_count.saturating_sub(1).min(63) as i32;
		let secs = self.base_delay.as_secs_f64() * RETRY_FACTOR.powi(exponent) * multiplier.max(0.0);
		if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
			return self.max_delay;
		}
		Duration::from_secs_f64(secs)
	}

	pub fn next_retry_at(&self, retry_count: u32, multiplier: f64) -> DateTime<Utc> {
		let delay = self.delay_for(retry_count, multiplier);
		Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
	}
}

/// Whether the attempt that just failed with `error` earns another run.
///
/// `retry_count` is the number of failures recorded before this one.
pub fn should_retry(error: &ClassifiedError, retry_count: u32, max_retries: u32) -> bool {
	error.is_retriable && retry_count.saturating_add(1) < max_retries
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::classifier::classify;

	fn policy() -> RetryPolicy {
		RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(3600))
	}

	#[test]
	fn test_delay_first_failure_is_base() {
		assert_eq!(policy().delay_for(1, 1.0), Duration::from_secs(30));
	}

	#[test]
	fn test_delay_doubles() {
		assert_eq!(policy().delay_for(2, 1.0), Duration::from_secs(60));
		assert_eq!(policy().delay_for(3, 1.0), Duration::from_secs(120));
	}

	#[test]
	fn test_delay_applies_multiplier() {
		assert_eq!(policy().delay_for(1, 2.0), Duration::from_secs(60));
	}

	#[test]
	fn test_delay_caps_at_max() {
		assert_eq!(policy().delay_for(10, 1.0), Duration::from_secs(3600));
		assert_eq!(policy().delay_for(u32::MAX, 2.0), Duration::from_secs(3600));
	}

	#[test]
	fn test_zero_base_is_immediate() {
		let policy = RetryPolicy::new(Duration::ZERO, Duration::from_secs(10));
		assert_eq!(policy.delay_for(5, 2.0), Duration::ZERO);
		assert!(policy.next_retry_at(1, 1.0) <= Utc::now());
	}

	#[test]
	fn test_should_retry_respects_budget() {
		let transient = classify("connection refused");
		assert!(should_retry(&transient, 0, 2));
		assert!(!should_retry(&transient, 1, 2));
		assert!(!should_retry(&transient, 0, 1));
	}

	#[test]
	fn test_should_retry_never_for_permanent() {
		let permanent = classify("validation failed");
		assert!(!should_retry(&permanent, 0, 10));
	}
}

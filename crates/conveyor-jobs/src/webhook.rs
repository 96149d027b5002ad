// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Signed completion notifications.
//!
//! The body is canonical JSON, signed with HMAC-SHA256 and POSTed with
//! `X-Event`, `X-Signature`, `X-Delivery-Timestamp` and `X-Delivery-Id`
//! headers. Each `deliver` call retries on 5xx and network errors with
//! exponential backoff; a 4xx ends it immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_common_secret::SecretString;
use conveyor_common_webhook::{canonical_json, sign_payload};
use conveyor_jobs_db::{JobRecord, JobStatus};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const EVENT_TYPE: &str = "job.completed";

#[cfg(feature = "http")]
const USER_AGENT: &str = concat!("conveyor-webhook/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct WebhookServiceConfig {
	/// Attempts per `deliver` call, including the first.
	pub max_retries: u32,
	pub initial_backoff: Duration,
	/// Per-request timeout.
	pub timeout: Duration,
	/// Used when a job has no secret of its own.
	pub signing_secret: Option<SecretString>,
}

impl Default for WebhookServiceConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_backoff: Duration::from_secs(1),
			timeout: Duration::from_secs(10),
			signing_secret: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
	pub job_id: String,
	pub job_type: String,
	pub status: JobStatus,
	pub event_type: &'static str,
	pub correlation_id: Option<String>,
	pub result: Option<Value>,
	pub error: Option<String>,
	pub completed_at: Option<DateTime<Utc>>,
	pub retry_count: u32,
	pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
	pub fn from_job(job: &JobRecord) -> Self {
		Self {
			job_id: job.id.clone(),
			job_type: job.job_type.clone(),
			status: job.status,
			event_type: EVENT_TYPE,
			correlation_id: job.correlation_id.clone(),
			result: job.result.clone(),
			error: job.error.clone(),
			completed_at: job.finished_at,
			retry_count: job.retry_count,
			timestamp: Utc::now(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
	pub success: bool,
	pub status_code: Option<u16>,
	pub attempts: u32,
	pub error: Option<String>,
}

impl DeliveryResult {
	fn failed(attempts: u32, status_code: Option<u16>, error: impl Into<String>) -> Self {
		Self {
			success: false,
			status_code,
			attempts,
			error: Some(error.into()),
		}
	}

	fn not_installed(reason: &str) -> Self {
		Self::failed(0, None, format!("webhook delivery not installed: {reason}"))
	}
}

pub struct WebhookService {
	config: WebhookServiceConfig,
	#[cfg(feature = "http")]
	client: Option<reqwest::Client>,
}

impl WebhookService {
	pub fn new(config: WebhookServiceConfig) -> Self {
		#[cfg(feature = "http")]
		let client = match reqwest::Client::builder()
			.timeout(config.timeout)
			.user_agent(USER_AGENT)
			.build()
		{
			Ok(client) => Some(client),
			Err(e) => {
				warn!(error = %e, "failed to build webhook HTTP client; deliveries disabled");
				None
			}
		};

		Self {
			config,
			#[cfg(feature = "http")]
			client,
		}
	}

	/// A service that cannot send, as when the HTTP client failed to build.
	#[cfg(test)]
	fn without_client(config: WebhookServiceConfig) -> Self {
		Self {
			config,
			#[cfg(feature = "http")]
			client: None,
		}
	}

	pub fn config(&self) -> &WebhookServiceConfig {
		&self.config
	}

	/// Sign and POST `payload` to `url`. Never panics; every failure is
	/// reported in the returned [`DeliveryResult`].
	#[tracing::instrument(skip(self, payload, secret), fields(job_id = %payload.job_id))]
	pub async fn deliver(
		&self,
		url: &str,
		payload: &WebhookPayload,
		secret: Option<&SecretString>,
	) -> DeliveryResult {
		let Some(secret) = secret.or(self.config.signing_secret.as_ref()) else {
			warn!("no webhook signing secret configured");
			return DeliveryResult::failed(0, None, "no webhook signing secret configured");
		};

		let body = match canonical_json(payload) {
			Ok(body) => body,
			Err(e) => return DeliveryResult::failed(0, None, format!("failed to serialize payload: {e}")),
		};
		let signature = sign_payload(secret.as_bytes(), &body);

		self.send(url, body, signature).await
	}

	#[cfg(feature = "http")]
	async fn send(&self, url: &str, body: Vec<u8>, signature: String) -> DeliveryResult {
		use chrono::SecondsFormat;
		use conveyor_common_webhook::headers;
		use reqwest::header::CONTENT_TYPE;

		let Some(client) = &self.client else {
			return DeliveryResult::not_installed("HTTP client unavailable");
		};

		let delivery_id = uuid::Uuid::new_v4().to_string();
		let max_attempts = self.config.max_retries.max(1);
		let mut status_code = None;
		let mut last_error = String::new();

		for attempt in 0..max_attempts {
			let response = client
				.post(url)
				.header(CONTENT_TYPE, "application/json")
				.header(headers::EVENT, EVENT_TYPE)
				.header(headers::SIGNATURE, &signature)
				.header(
					headers::DELIVERY_TIMESTAMP,
					Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
				)
				.header(headers::DELIVERY_ID, &delivery_id)
				.body(body.clone())
				.send()
				.await;

			match response {
				Ok(resp) => {
					let status = resp.status().as_u16();
					status_code = Some(status);
					if status < 400 {
						tracing::debug!(status, attempts = attempt + 1, "webhook delivered");
						return DeliveryResult {
							success: true,
							status_code,
							attempts: attempt + 1,
							error: None,
						};
					}
					if status < 500 {
						warn!(status, "webhook rejected by receiver");
						return DeliveryResult::failed(
							attempt + 1,
							status_code,
							format!("webhook rejected with status {status}"),
						);
					}
					last_error = format!("webhook endpoint returned status {status}");
				}
				Err(e) => {
					status_code = None;
					last_error = e.to_string();
				}
			}

			tracing::debug!(attempt = attempt + 1, error = %last_error, "webhook attempt failed");
			if attempt + 1 < max_attempts {
				let backoff = self
					.config
					.initial_backoff
					.saturating_mul(2u32.saturating_pow(attempt));
				tokio::time::sleep(backoff).await;
			}
		}

		warn!(attempts = max_attempts, error = %last_error, "webhook delivery failed");
		DeliveryResult::failed(max_attempts, status_code, last_error)
	}

	#[cfg(not(feature = "http"))]
	async fn send(&self, _url: &str, _body: Vec<u8>, _signature: String) -> DeliveryResult {
		DeliveryResult::not_installed("built without the `http` feature")
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wires configuration into the store, worker pool, dispatcher and recovery
//! daemon.

use std::sync::Arc;
use std::time::Duration;

use conveyor_jobs::{
	Dispatcher, HandlerRegistry, RecoveryDaemon, RecoveryDaemonConfig, RetryPolicy, WebhookService,
	WebhookServiceConfig, WorkerPool, WorkerPoolConfig,
};
use conveyor_jobs_config::ConveyorConfig;
use conveyor_jobs_db::{JobRepository, JobStore, SqlitePool};

pub fn retry_policy(config: &ConveyorConfig) -> RetryPolicy {
	RetryPolicy::new(
		Duration::from_secs(config.workers.retry_base_delay_secs),
		Duration::from_secs(config.workers.retry_max_delay_secs),
	)
}

pub fn pool_config(config: &ConveyorConfig) -> WorkerPoolConfig {
	WorkerPoolConfig {
		max_workers: config.workers.max_workers,
		heartbeat_interval: Duration::from_secs(config.workers.heartbeat_interval_secs),
		retry_policy: retry_policy(config),
	}
}

pub fn recovery_config(config: &ConveyorConfig) -> RecoveryDaemonConfig {
	RecoveryDaemonConfig {
		poll_interval: Duration::from_secs(config.recovery.poll_interval_secs),
		heartbeat_timeout: Duration::from_secs(config.recovery.heartbeat_timeout_secs),
		scan_batch_size: config.recovery.scan_batch_size,
		webhook_concurrency: config.recovery.webhook_concurrency,
		retry_policy: retry_policy(config),
	}
}

pub fn webhook_config(config: &ConveyorConfig) -> WebhookServiceConfig {
	WebhookServiceConfig {
		max_retries: config.webhook.max_retries,
		initial_backoff: Duration::from_secs(config.webhook.initial_backoff_secs),
		timeout: Duration::from_secs(config.webhook.timeout_secs),
		signing_secret: config.webhook.signing_secret.clone(),
	}
}

/// Everything a worker process runs.
pub struct Runtime {
	pub store: Arc<dyn JobStore>,
	pub dispatcher: Dispatcher,
	pub daemon: RecoveryDaemon,
}

impl Runtime {
	pub fn new(pool: SqlitePool, config: &ConveyorConfig, registry: HandlerRegistry) -> Self {
		let repo = JobRepository::new(pool).with_idempotency_ttl(Duration::from_secs(
			config.database.idempotency_key_ttl_secs,
		));
		let store: Arc<dyn JobStore> = Arc::new(repo);

		let workers = WorkerPool::new(store.clone(), pool_config(config));
		let dispatcher = Dispatcher::new(store.clone(), workers, Arc::new(registry));
		let webhook = Arc::new(WebhookService::new(webhook_config(config)));
		let daemon = RecoveryDaemon::new(store.clone(), webhook, recovery_config(config))
			.with_rescheduler(Arc::new(dispatcher.clone()));

		Self {
			store,
			dispatcher,
			daemon,
		}
	}

	/// Stop recovery first so it cannot hand the pool new work, then drain the
	/// pool. Returns whether every running job finished in time.
	pub async fn shutdown(&self, config: &ConveyorConfig) -> bool {
		let recovery_stopped = self
			.daemon
			.stop(Duration::from_secs(config.recovery.stop_timeout_secs))
			.await;
		if !recovery_stopped {
			tracing::warn!("recovery daemon did not stop in time");
		}
		self
			.dispatcher
			.pool()
			.shutdown(Duration::from_secs(config.workers.shutdown_timeout_secs))
			.await
	}
}

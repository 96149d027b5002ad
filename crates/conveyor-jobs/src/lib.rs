// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable background-job engine.
//!
//! A bounded [`WorkerPool`] runs jobs under a [`JobRunTracker`] that persists
//! progress, failures are classified into retry or terminal outcomes, and a
//! [`RecoveryDaemon`] reconciles what dispatch alone cannot: crashed workers,
//! due retries, unsent webhooks and exhausted jobs for the dead-letter queue.

pub mod classifier;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod pool;
pub mod recovery;
pub mod retry;
pub mod tracker;
pub mod webhook;

pub use classifier::{classify, classify_error, classify_optional, ClassifiedError, ErrorCategory};
pub use context::{Cancellable, CancellationToken, JobContext, ManagedChild, ProcessRegistry};
pub use dispatch::{Dispatcher, JobRescheduler};
pub use error::{JobError, Result};
pub use handler::{decode_payload, HandlerRegistry, JobHandler, JobOutput};
pub use pool::{ExecutionOutcome, JobHandle, WorkerPool, WorkerPoolConfig};
pub use recovery::{RecoveryDaemon, RecoveryDaemonConfig, RecoveryStats};
pub use retry::{should_retry, RetryPolicy};
pub use tracker::JobRunTracker;
pub use webhook::{DeliveryResult, WebhookPayload, WebhookService, WebhookServiceConfig};

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections.

mod database;
mod logging;
mod recovery;
mod webhook;
mod workers;

pub use database::{DatabaseConfig, DatabaseConfigLayer};
pub use logging::{LogFormat, LoggingConfig, LoggingConfigLayer};
pub use recovery::{RecoveryConfig, RecoveryConfigLayer};
pub use webhook::{WebhookConfig, WebhookConfigLayer};
pub use workers::{WorkersConfig, WorkersConfigLayer};

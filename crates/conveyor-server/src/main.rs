// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Conveyor worker process and operator commands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use conveyor_common_secret::SecretString;
use conveyor_jobs_config::{ConveyorConfig, LogFormat};
use conveyor_jobs_db::{JobRecord, JobStatus, NewJob};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod handlers;
mod runtime;

use runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "conveyor", about = "Durable background job engine", version)]
struct Args {
	/// Path to a TOML config file. Defaults to the system config location.
	#[arg(long, short, env = "CONVEYOR_CONFIG", global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run workers and the recovery daemon until interrupted (default)
	Serve,
	/// Persist a new job. A running `serve` process picks it up.
	Enqueue {
		job_type: String,
		/// JSON payload
		#[arg(long, default_value = "null")]
		payload: String,
		#[arg(long)]
		max_retries: Option<u32>,
		#[arg(long)]
		correlation_id: Option<String>,
		#[arg(long)]
		idempotency_key: Option<String>,
		#[arg(long)]
		webhook_url: Option<String>,
		#[arg(long, env = "CONVEYOR_JOB_WEBHOOK_SECRET", hide_env_values = true)]
		webhook_secret: Option<String>,
		/// Declared step as `name` or `name:label`; repeatable
		#[arg(long = "step")]
		steps: Vec<String>,
	},
	/// Print one job as JSON
	Show { id: String },
	/// List jobs, newest first
	List {
		#[arg(long)]
		status: Option<JobStatus>,
		#[arg(long, default_value_t = 50)]
		limit: u32,
		#[arg(long, default_value_t = 0)]
		offset: u32,
	},
	/// Cancel a job that has not started yet
	Cancel { id: String },
	/// Inspect or requeue dead-lettered jobs
	Dlq {
		#[command(subcommand)]
		command: DlqCommand,
	},
	/// List registered job types
	Handlers,
	/// Show version information
	Version,
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
	List {
		#[arg(long, default_value_t = 50)]
		limit: u32,
		#[arg(long, default_value_t = 0)]
		offset: u32,
	},
	/// Create a fresh queued copy of a dead-lettered job
	Requeue { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	match &args.command {
		Some(Command::Version) => {
			println!("conveyor {}", env!("CARGO_PKG_VERSION"));
			return Ok(());
		}
		Some(Command::Handlers) => {
			let registry = handlers::builtin_registry()?;
			for job_type in registry.job_types() {
				let description = registry
					.get(job_type)
					.map(|h| h.description().to_string())
					.unwrap_or_default();
				println!("{job_type:<12} {description}");
			}
			return Ok(());
		}
		_ => {}
	}

	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => conveyor_jobs_config::load_config_with_file(path)?,
		None => conveyor_jobs_config::load_config()?,
	};
	init_tracing(&config);

	let pool = conveyor_jobs_db::create_pool(&config.database.url)
		.await
		.context("opening job database")?;
	conveyor_jobs_db::run_migrations(&pool).await?;
	let runtime = Runtime::new(pool, &config, handlers::builtin_registry()?);

	match args.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(&runtime, &config).await,
		Command::Enqueue {
			job_type,
			payload,
			max_retries,
			correlation_id,
			idempotency_key,
			webhook_url,
			webhook_secret,
			steps,
		} => {
			let payload: serde_json::Value =
				serde_json::from_str(&payload).context("payload is not valid JSON")?;
			let mut job = NewJob::new(job_type, payload)
				.with_max_retries(max_retries.unwrap_or(config.workers.max_retries));
			if let Some(id) = correlation_id {
				job = job.with_correlation_id(id);
			}
			if let Some(key) = idempotency_key {
				job = job.with_idempotency_key(key);
			}
			if let Some(url) = webhook_url {
				job = job.with_webhook(url, webhook_secret.and_then(SecretString::non_empty));
			}
			for step in steps {
				let (name, label) = step
					.split_once(':')
					.unwrap_or((step.as_str(), step.as_str()));
				job = job.with_step(name, label);
			}
			let record = runtime.store.create_job(&job).await?;
			print_json(&record)
		}
		Command::Show { id } => match runtime.store.get_job(&id).await? {
			Some(record) => print_json(&record),
			None => bail!("job {id} not found"),
		},
		Command::List {
			status,
			limit,
			offset,
		} => {
			let jobs = runtime.store.list_jobs(status, limit, offset).await?;
			print_table(&jobs);
			Ok(())
		}
		Command::Cancel { id } => {
			if runtime.dispatcher.cancel(&id, false).await? {
				println!("cancelled {id}");
				Ok(())
			} else {
				bail!("job {id} is not queued")
			}
		}
		Command::Dlq { command } => match command {
			DlqCommand::List { limit, offset } => {
				let jobs = runtime.store.list_dead_letter_jobs(limit, offset).await?;
				print_table(&jobs);
				Ok(())
			}
			DlqCommand::Requeue { id } => {
				let record = runtime.store.requeue_dead_letter_job(&id).await?;
				print_json(&record)
			}
		},
		Command::Handlers | Command::Version => Ok(()),
	}
}

async fn serve(runtime: &Runtime, config: &ConveyorConfig) -> anyhow::Result<()> {
	tracing::info!(
		database = %config.database.url,
		max_workers = config.workers.max_workers,
		recovery = config.recovery.enabled,
		"starting conveyor"
	);

	if config.recovery.enabled {
		runtime.daemon.start();
	}

	// Jobs persisted by other processes are only seen through the queue scan.
	let mut ticker = tokio::time::interval(Duration::from_secs(
		config.recovery.poll_interval_secs.max(1),
	));
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				if let Err(e) = runtime
					.dispatcher
					.dispatch_queued(config.recovery.scan_batch_size)
					.await
				{
					tracing::error!(error = %e, "failed to dispatch queued jobs");
				}
			}
			_ = tokio::signal::ctrl_c() => {
				tracing::info!("received shutdown signal");
				break;
			}
		}
	}

	let drained = runtime.shutdown(config).await;
	let stats = runtime.daemon.stats();
	tracing::info!(
		drained,
		stale_recovered = stats.stale_recovered,
		requeued = stats.requeued,
		moved_to_dlq = stats.moved_to_dlq,
		webhooks_sent = stats.webhooks_sent,
		"conveyor shutdown complete"
	);
	Ok(())
}

fn init_tracing(config: &ConveyorConfig) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| config.logging.level.clone().into());
	let (pretty, json) = match config.logging.format {
		LogFormat::Pretty => (Some(tracing_subscriber::fmt::layer()), None),
		LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
	};
	tracing_subscriber::registry()
		.with(filter)
		.with(pretty)
		.with(json)
		.init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

fn print_table(jobs: &[JobRecord]) {
	for job in jobs {
		println!(
			"{}  {:<14} {:<16} retries {}/{}  {}",
			job.id,
			job.status.as_str(),
			job.job_type,
			job.retry_count,
			job.max_retries,
			job.error.as_deref().unwrap_or("")
		);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Built-in job handlers registered by the worker process.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_jobs::{
	decode_payload, HandlerRegistry, JobContext, JobError, JobHandler, JobOutput, Result,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{info, instrument};

pub fn builtin_registry() -> Result<HandlerRegistry> {
	let mut registry = HandlerRegistry::new();
	registry.register(Arc::new(EchoJob))?;
	registry.register(Arc::new(CommandJob))?;
	Ok(registry)
}

/// Returns its payload as the job result.
pub struct EchoJob;

#[async_trait]
impl JobHandler for EchoJob {
	fn job_type(&self) -> &str {
		"echo"
	}

	fn description(&self) -> &str {
		"Store the payload as the job result"
	}

	async fn run(&self, ctx: &JobContext, payload: Value) -> Result<JobOutput> {
		ctx.checkpoint()?;
		Ok(JobOutput::new("echoed payload").with_result(payload))
	}
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
	program: String,
	#[serde(default)]
	args: Vec<String>,
	#[serde(default)]
	cwd: Option<String>,
}

/// Runs an external program. A non-zero exit fails the attempt and the
/// captured output decides how it is classified.
pub struct CommandJob;

#[async_trait]
impl JobHandler for CommandJob {
	fn job_type(&self) -> &str {
		"command"
	}

	fn description(&self) -> &str {
		"Run an external program as a two-step job"
	}

	#[instrument(skip(self, ctx, payload), fields(job_id = %ctx.job_id))]
	async fn run(&self, ctx: &JobContext, payload: Value) -> Result<JobOutput> {
		let payload: CommandPayload = decode_payload(payload)?;

		ctx.tracker.step_running("spawn", Some("Start process")).await?;
		let mut command = ctx.command(&payload.program);
		command
			.args(&payload.args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());
		if let Some(cwd) = &payload.cwd {
			command.current_dir(cwd);
		}
		let mut child = match ctx.spawn(&mut command) {
			Ok(child) => child,
			Err(e) => {
				ctx.tracker.step_failed("spawn", &e.to_string()).await?;
				return Err(e);
			}
		};
		ctx.tracker.step_succeeded("spawn", Some(10.0)).await?;

		ctx.tracker.step_running("wait", Some("Wait for exit")).await?;
		let stdout = child.inner_mut().stdout.take();
		let stderr = child.inner_mut().stderr.take();
		// Drain the pipes while waiting so cancellation is observed mid-run.
		let (stdout, stderr, status) =
			tokio::join!(read_all(stdout), read_all(stderr), child.wait());
		let status = status?;
		info!(program = %payload.program, status = %status, "process exited");

		if !status.success() {
			let detail = stderr.trim();
			let message = if detail.is_empty() {
				format!("{} exited with {status}", payload.program)
			} else {
				format!("{} exited with {status}: {detail}", payload.program)
			};
			ctx.tracker.step_failed("wait", &message).await?;
			return Err(JobError::failed(message));
		}
		ctx.tracker.step_succeeded("wait", Some(100.0)).await?;

		Ok(JobOutput::new(format!("{} finished", payload.program)).with_result(json!({
			"exit_code": status.code(),
			"stdout": stdout,
			"stderr": stderr,
		})))
	}
}

async fn read_all<R>(pipe: Option<R>) -> String
where
	R: tokio::io::AsyncRead + Unpin,
{
	let mut out = String::new();
	if let Some(mut pipe) = pipe {
		let mut buf = Vec::new();
		if pipe.read_to_end(&mut buf).await.is_ok() {
			out = String::from_utf8_lossy(&buf).into_owned();
		}
	}
	out
}

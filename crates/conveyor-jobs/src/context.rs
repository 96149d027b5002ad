// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-execution context handed to job handlers, and the cancellation
//! machinery behind it.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{JobError, Result};
use crate::tracker::JobRunTracker;

/// Cooperative cancellation flag polled by handlers at safe points.
#[derive(Clone, Default)]
pub struct CancellationToken {
	inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.inner.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.is_cancelled()
	}

	/// Resolves once cancellation has been requested.
	pub async fn cancelled(&self) {
		self.inner.cancelled().await
	}

	/// `Err(JobError::Cancelled)` once cancellation has been requested.
	pub fn check(&self) -> Result<()> {
		if self.is_cancelled() {
			Err(JobError::Cancelled)
		} else {
			Ok(())
		}
	}
}

/// Pids of child processes a job has spawned and not yet reaped.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
	pids: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRegistry {
	pub fn register(&self, pid: u32) {
		self.lock().insert(pid);
	}

	pub fn unregister(&self, pid: u32) {
		self.lock().remove(&pid);
	}

	pub fn pids(&self) -> Vec<u32> {
		self.lock().iter().copied().collect()
	}

	/// Send SIGKILL to every registered process. Returns how many signals were
	/// delivered.
	pub fn kill_all(&self) -> usize {
		let pids: Vec<u32> = self.lock().drain().collect();
		pids.into_iter().filter(|pid| kill_process(*pid)).count()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
		self.pids.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[cfg(unix)]
fn kill_process(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	// SAFETY: kill(2) has no memory-safety preconditions.
	let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
	if rc == 0 {
		debug!(pid, "killed child process");
		true
	} else {
		debug!(pid, error = %std::io::Error::last_os_error(), "kill failed");
		false
	}
}

#[cfg(not(unix))]
fn kill_process(pid: u32) -> bool {
	warn!(pid, "forced process termination is not supported on this platform");
	false
}

/// Forced cancellation capability for an executing job.
///
/// `cancel` only asks; `force_cancel` also aborts the handler at its next
/// suspension point and kills registered child processes. Neither guarantees
/// the job has stopped by the time it returns.
pub trait Cancellable: Send + Sync {
	fn cancel(&self);
	fn force_cancel(&self);
	fn is_cancel_requested(&self) -> bool;
}

/// Cancellation state for one job held by the worker pool.
#[derive(Clone, Default)]
pub struct ExecutionControl {
	pub(crate) token: CancellationToken,
	pub(crate) force: tokio_util::sync::CancellationToken,
	pub(crate) processes: ProcessRegistry,
	released: Arc<AtomicBool>,
}

impl ExecutionControl {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark the job as being handed back to the queue rather than cancelled.
	pub(crate) fn release(&self) {
		self.released.store(true, Ordering::SeqCst);
	}

	pub(crate) fn is_released(&self) -> bool {
		self.released.load(Ordering::SeqCst)
	}
}

impl Cancellable for ExecutionControl {
	fn cancel(&self) {
		self.token.cancel();
	}

	fn force_cancel(&self) {
		self.token.cancel();
		self.force.cancel();
		let killed = self.processes.kill_all();
		if killed > 0 {
			debug!(killed, "terminated child processes");
		}
	}

	fn is_cancel_requested(&self) -> bool {
		self.token.is_cancelled()
	}
}

pub struct JobContext {
	pub job_id: String,
	pub job_type: String,
	pub correlation_id: Option<String>,
	/// 1 for the first execution, 2 for the first retry, and so on.
	pub attempt: u32,
	pub worker_id: String,
	pub cancellation_token: CancellationToken,
	pub tracker: JobRunTracker,
	processes: ProcessRegistry,
}

impl JobContext {
	pub(crate) fn new(
		job_id: String,
		job_type: String,
		correlation_id: Option<String>,
		attempt: u32,
		worker_id: String,
		control: &ExecutionControl,
		tracker: JobRunTracker,
	) -> Self {
		Self {
			job_id,
			job_type,
			correlation_id,
			attempt,
			worker_id,
			cancellation_token: control.token.clone(),
			tracker,
			processes: control.processes.clone(),
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancellation_token.is_cancelled()
	}

	/// Safe point: returns `Err(JobError::Cancelled)` once cancellation was requested.
	pub fn checkpoint(&self) -> Result<()> {
		self.cancellation_token.check()
	}

	/// A command that is killed if its handle is dropped.
	pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
		let mut command = Command::new(program);
		command.kill_on_drop(true);
		command
	}

	/// Spawn a child and register its pid so forced cancellation can kill it.
	pub fn spawn(&self, command: &mut Command) -> Result<ManagedChild> {
		command.kill_on_drop(true);
		let child = command.spawn()?;
		let pid = child.id();
		if let Some(pid) = pid {
			self.processes.register(pid);
		}
		debug!(job_id = %self.job_id, pid = ?pid, "spawned child process");
		Ok(ManagedChild {
			child,
			pid,
			registry: self.processes.clone(),
			token: self.cancellation_token.clone(),
		})
	}
}

/// A child process owned by a job. Unregistered from the job's process set
/// when dropped.
pub struct ManagedChild {
	child: Child,
	pid: Option<u32>,
	registry: ProcessRegistry,
	token: CancellationToken,
}

impl ManagedChild {
	/// `None` once the child has been reaped.
	pub fn id(&self) -> Option<u32> {
		self.pid
	}

	pub fn inner_mut(&mut self) -> &mut Child {
		&mut self.child
	}

	/// Wait for exit. Cooperative cancellation kills the child and returns
	/// `Err(JobError::Cancelled)`.
	pub async fn wait(&mut self) -> Result<ExitStatus> {
		let outcome = tokio::select! {
			status = self.child.wait() => status.map_err(JobError::from),
			_ = self.token.cancelled() => {
				if let Err(e) = self.child.start_kill() {
					warn!(pid = ?self.pid, error = %e, "failed to kill child on cancellation");
				}
				let _ = self.child.wait().await;
				Err(JobError::Cancelled)
			}
		};
		// Reaped pids can be reused by unrelated processes.
		self.unregister();
		outcome
	}

	fn unregister(&mut self) {
		if let Some(pid) = self.pid.take() {
			self.registry.unregister(pid);
		}
	}
}

impl Drop for ManagedChild {
	fn drop(&mut self) {
		self.unregister();
	}
}

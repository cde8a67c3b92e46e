//! Error types.

use std::{path::PathBuf, time::Duration};

use miette::Diagnostic;
use thiserror::Error;

use crate::{process::ProcessEnd, watchdog::Phase};

/// The classified cause of a failed launch attempt.
///
/// Only [`CrashedAtStartup`](LaunchError::CrashedAtStartup) and
/// [`NeverCheckedIn`](LaunchError::NeverCheckedIn) are retried; everything else ends the launch
/// immediately.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum LaunchError {
	/// The launch configuration is unusable.
	///
	/// This indicates a misconfiguration rather than a flaky worker, and is never retried.
	#[error("configuration: {reason}")]
	#[diagnostic(code(launchguard::launch::configuration))]
	Configuration {
		/// What was wrong.
		reason: String,
	},

	/// The operating system refused to start the worker (missing or unexecutable binary, etc).
	#[error("could not spawn {}: {err}", program.display())]
	#[diagnostic(code(launchguard::launch::spawn))]
	Spawn {
		/// The program which was being spawned.
		program: PathBuf,

		/// The underlying I/O error.
		#[source]
		err: std::io::Error,
	},

	/// The worker exited on its own before checking in.
	#[error("worker crashed on startup ({end})")]
	#[diagnostic(code(launchguard::launch::crashed_at_startup))]
	CrashedAtStartup {
		/// How the process ended.
		end: ProcessEnd,

		/// Whether a known benign startup error was seen during this attempt.
		benign: bool,
	},

	/// The worker never checked in before a startup watchdog expired, and was killed.
	#[error("worker never checked in (timed out waiting: {phase})")]
	#[diagnostic(code(launchguard::launch::never_checked_in))]
	NeverCheckedIn {
		/// The watchdog which expired.
		phase: Phase,
	},

	/// The launch was abandoned because a shutdown was requested while it was in progress.
	#[error("launch aborted by shutdown request")]
	#[diagnostic(code(launchguard::launch::aborted))]
	Aborted,
}

impl LaunchError {
	/// Whether the retry policy may try again after this failure.
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		matches!(self, Self::CrashedAtStartup { .. } | Self::NeverCheckedIn { .. })
	}
}

/// Errors returned by [`Supervisor`](crate::Supervisor) operations.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum SupervisorError {
	/// The launch failed terminally, either with a non-retryable error or after exhausting retries.
	#[error("launch failed after {attempts} attempt(s): {cause}")]
	#[diagnostic(code(launchguard::launch_failed))]
	LaunchFailed {
		/// The last classified failure.
		#[source]
		#[diagnostic_source]
		cause: LaunchError,

		/// How many spawn attempts were consumed.
		attempts: u32,
	},

	/// A launch was requested while a worker is already launched or launching.
	#[error("worker is already launched")]
	#[diagnostic(code(launchguard::already_launched))]
	AlreadyLaunched,

	/// The worker exited on its own while running.
	#[error("abnormal exit while running ({end})")]
	#[diagnostic(code(launchguard::abnormal_exit))]
	AbnormalExit {
		/// How the process ended.
		end: ProcessEnd,
	},

	/// The worker did not exit within the grace period after being asked to stop.
	///
	/// The process may still be alive; use [`Supervisor::force_stop`](crate::Supervisor::force_stop)
	/// to escalate.
	#[error("worker did not terminate within {grace:?}")]
	#[diagnostic(code(launchguard::shutdown_timeout))]
	ShutdownTimeout {
		/// The grace period which elapsed.
		grace: Duration,
	},

	/// A command was sent to a supervisor which has no command channel configured.
	#[error("command channel is not enabled")]
	#[diagnostic(code(launchguard::channel_disabled))]
	ChannelDisabled,

	/// A command was sent while no worker is launched.
	#[error("worker is not running")]
	#[diagnostic(code(launchguard::not_running))]
	NotRunning,

	/// The command was discarded because the command channel was torn down.
	#[error("command cancelled: channel torn down")]
	#[diagnostic(code(launchguard::command_cancelled))]
	CommandCancelled,

	/// The worker dropped the connection carrying this command before replying.
	#[error("command abandoned: {reason}")]
	#[diagnostic(code(launchguard::command_abandoned))]
	CommandAbandoned {
		/// What happened to the connection.
		reason: String,
	},

	/// The supervisor task has stopped and can no longer be controlled.
	#[error("supervisor task is gone")]
	#[diagnostic(code(launchguard::gone))]
	Gone,
}

use std::{fmt, path::PathBuf};

use crate::process::ProcessEnd;

/// Where the supervisor is in a worker's lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LaunchState {
	/// Nothing launched yet.
	#[default]
	Idle,

	/// Resolving deferred configuration.
	Configuring,

	/// Preparing the work area and starting the process.
	Spawning,

	/// The process is up; waiting for it to check in.
	AwaitingCheckIn,

	/// The process exited before checking in.
	CrashedAtStartup,

	/// A startup watchdog expired; the process is being killed.
	NeverCheckedIn,

	/// Waiting before the next attempt.
	RetryBackoff,

	/// The worker checked in and is serving.
	Running,

	/// A stop was requested; waiting for the process to exit.
	ShuttingDown,

	/// The process is gone after having been launched.
	Terminated,

	/// The launch failed terminally.
	LaunchFailed,
}

impl LaunchState {
	/// Whether a new launch may begin from here.
	#[must_use]
	pub const fn can_launch(self) -> bool {
		matches!(self, Self::Idle | Self::Terminated | Self::LaunchFailed)
	}
}

impl fmt::Display for LaunchState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// Attempt accounting, kept across launches until explicitly reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RetryState {
	pub attempts: u32,
	pub benign_error: bool,
}

/// How a supervised worker came to an end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ending {
	/// It exited after a requested stop.
	Stopped,

	/// It exited on its own while running.
	AbnormalExit(ProcessEnd),

	/// It never got running.
	LaunchFailed {
		/// Spawn attempts consumed.
		attempts: u32,

		/// The final error, rendered.
		reason: String,
	},
}

/// A snapshot of the supervisor's state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
	/// The lifecycle state.
	pub state: LaunchState,

	/// Spawn attempts consumed since the last reset.
	pub attempts: u32,

	/// Whether a benign startup error was seen and not yet acted upon.
	pub benign_error_seen: bool,

	/// The worker's process ID, while there is one.
	pub pid: Option<u32>,

	/// The result artifact directory picked for the current attempt.
	pub result_dir: Option<PathBuf>,

	/// The result location the worker itself declared in its output.
	pub result_location: Option<PathBuf>,

	/// Set once the current launch has come to an end.
	pub ending: Option<Ending>,
}

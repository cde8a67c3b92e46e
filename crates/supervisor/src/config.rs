//! Launch configuration.

use std::{
	ffi::OsString,
	path::{Path, PathBuf},
	str::FromStr,
	time::Duration,
};

use miette::Diagnostic;
use nix::sys::signal::Signal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::stream::ClassifierPatterns;

/// Default startup deadline.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(90);

/// Default grace period between the stop signal and giving up on shutdown.
pub const DEFAULT_TERM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default transient working area.
pub const DEFAULT_WORK_DIR: &str = "/tmp/launchguard";

/// Configuration for one [`Supervisor`](crate::Supervisor).
///
/// Fields are public, but the chaining methods are preferred: each logs the new value with
/// `debug!`, which makes it easy to see what an application configured.
///
/// Arguments and environment values may contain placeholders, substituted at each spawn:
///
/// - `{work_dir}`: the transient working area,
/// - `{result_dir}`: the result artifact directory picked for this attempt,
/// - `{socket}`: the command channel socket path (empty if there is none).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct LaunchConfig {
	/// Path or name of the worker executable.
	pub program: PathBuf,

	/// Arguments to pass to the worker.
	pub args: Vec<String>,

	/// Environment variables to set on top of the inherited environment.
	pub env: Vec<(String, String)>,

	/// Start the worker in its own process group, so signals reach its descendants.
	pub grouped: bool,

	/// The transient working area, wiped and recreated before every attempt.
	pub work_dir: PathBuf,

	/// Where result artifact directories are created. Defaults to `work_dir`.
	pub result_dir: Option<PathBuf>,

	/// File name prefix for result artifact directories.
	pub result_prefix: String,

	/// Startup deadlines.
	pub launch_timeout: LaunchTimeout,

	/// Grace period given to the worker to exit after the stop signal.
	pub term_timeout: Duration,

	/// The signal sent to request a graceful stop.
	pub stop_signal: Signal,

	/// How many times a flaky startup failure is retried.
	pub flaky_retries: u32,

	/// Delays between retries.
	pub backoff: Backoff,

	/// Markers looked for in the worker's output.
	pub patterns: ClassifierPatterns,

	/// Listening socket path for the command channel, if the worker uses one.
	///
	/// Must be outside `work_dir`, which is wiped before every attempt.
	pub socket: Option<PathBuf>,
}

impl LaunchConfig {
	/// A configuration with defaults for everything but the program.
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: Vec::new(),
			grouped: true,
			work_dir: PathBuf::from(DEFAULT_WORK_DIR),
			result_dir: None,
			result_prefix: "trace".into(),
			launch_timeout: LaunchTimeout::default(),
			term_timeout: DEFAULT_TERM_TIMEOUT,
			stop_signal: Signal::SIGTERM,
			flaky_retries: 0,
			backoff: Backoff::default(),
			patterns: ClassifierPatterns::default(),
			socket: None,
		}
	}

	/// Set the worker's arguments.
	#[must_use]
	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args = args.into_iter().map(Into::into).collect();
		debug!(args=?self.args, "LaunchConfig: args");
		self
	}

	/// Add an environment variable.
	#[must_use]
	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		let (key, value) = (key.into(), value.into());
		debug!(%key, %value, "LaunchConfig: env");
		self.env.push((key, value));
		self
	}

	/// Set whether the worker gets its own process group.
	#[must_use]
	pub fn grouped(mut self, grouped: bool) -> Self {
		debug!(?grouped, "LaunchConfig: grouped");
		self.grouped = grouped;
		self
	}

	/// Set the transient working area.
	#[must_use]
	pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.work_dir = dir.into();
		debug!(work_dir=?self.work_dir, "LaunchConfig: work_dir");
		self
	}

	/// Set where result artifact directories are created.
	#[must_use]
	pub fn result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.result_dir = Some(dir.into());
		debug!(result_dir=?self.result_dir, "LaunchConfig: result_dir");
		self
	}

	/// Set the startup deadlines.
	#[must_use]
	pub fn launch_timeout(mut self, timeout: impl Into<LaunchTimeout>) -> Self {
		self.launch_timeout = timeout.into();
		debug!(launch_timeout=?self.launch_timeout, "LaunchConfig: launch_timeout");
		self
	}

	/// Set the shutdown grace period.
	#[must_use]
	pub fn term_timeout(mut self, grace: Duration) -> Self {
		debug!(?grace, "LaunchConfig: term_timeout");
		self.term_timeout = grace;
		self
	}

	/// Set the graceful stop signal.
	#[must_use]
	pub fn stop_signal(mut self, signal: Signal) -> Self {
		debug!(%signal, "LaunchConfig: stop_signal");
		self.stop_signal = signal;
		self
	}

	/// Set how many times a flaky startup is retried.
	#[must_use]
	pub fn flaky_retries(mut self, retries: u32) -> Self {
		debug!(retries, "LaunchConfig: flaky_retries");
		self.flaky_retries = retries;
		self
	}

	/// Set the retry delays.
	#[must_use]
	pub fn backoff(mut self, backoff: Backoff) -> Self {
		debug!(?backoff, "LaunchConfig: backoff");
		self.backoff = backoff;
		self
	}

	/// Set the output markers.
	#[must_use]
	pub fn patterns(mut self, patterns: ClassifierPatterns) -> Self {
		debug!(?patterns, "LaunchConfig: patterns");
		self.patterns = patterns;
		self
	}

	/// Enable the command channel on a socket at this path.
	#[must_use]
	pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
		self.socket = Some(path.into());
		debug!(socket=?self.socket, "LaunchConfig: socket");
		self
	}

	/// Where result artifact directories are created.
	#[must_use]
	pub fn result_base(&self) -> &Path {
		self.result_dir.as_deref().unwrap_or(&self.work_dir)
	}

	/// Check what can be checked without touching the system.
	pub(crate) fn validate(&self) -> Result<(), String> {
		if self.program.as_os_str().is_empty() {
			return Err("no worker program given".into());
		}

		if self.launch_timeout.global.is_zero() {
			return Err("global launch timeout must be greater than zero".into());
		}

		if self.work_dir.as_os_str().is_empty() {
			return Err("work directory must not be empty".into());
		}

		if let Some(socket) = &self.socket {
			if socket.as_os_str().is_empty() {
				return Err("socket path must not be empty".into());
			}

			// the work directory is wiped before every attempt, taking the socket with it
			if socket.starts_with(&self.work_dir) {
				return Err(format!(
					"socket {} must not be inside the work directory {}",
					socket.display(),
					self.work_dir.display()
				));
			}
		}

		Ok(())
	}

	/// Substitute placeholders into the arguments and environment.
	pub(crate) fn render(&self, result_dir: &Path) -> (Vec<OsString>, Vec<(String, OsString)>) {
		let socket = self
			.socket
			.as_deref()
			.map(|p| p.display().to_string())
			.unwrap_or_default();
		let work_dir = self.work_dir.display().to_string();
		let result_dir = result_dir.display().to_string();

		let fill = |s: &str| -> OsString {
			s.replace("{work_dir}", &work_dir)
				.replace("{result_dir}", &result_dir)
				.replace("{socket}", &socket)
				.into()
		};

		(
			self.args.iter().map(|arg| fill(arg)).collect(),
			self.env
				.iter()
				.map(|(key, value)| (key.clone(), fill(value)))
				.collect(),
		)
	}
}

/// Startup deadlines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchTimeout {
	/// Deadline for the whole startup, from spawn to check-in.
	pub global: Duration,

	/// Deadline from the milestone marker to check-in, if any.
	pub after_milestone: Option<Duration>,
}

impl Default for LaunchTimeout {
	fn default() -> Self {
		Self {
			global: DEFAULT_LAUNCH_TIMEOUT,
			after_milestone: None,
		}
	}
}

impl From<Duration> for LaunchTimeout {
	fn from(global: Duration) -> Self {
		Self {
			global,
			after_milestone: None,
		}
	}
}

/// Error parsing a [`LaunchTimeout`].
#[derive(Debug, Diagnostic, Error)]
#[error("invalid launch timeout {input:?}: expected milliseconds or a JSON object")]
#[diagnostic(
	code(launchguard::config::launch_timeout),
	help("e.g. 60000 or {{\"global\": 60000, \"afterSimLaunch\": 5000}}")
)]
pub struct LaunchTimeoutParseError {
	input: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LaunchTimeoutJson {
	global: u64,
	#[serde(default, rename = "afterSimLaunch", alias = "afterMilestone")]
	after_milestone: Option<u64>,
}

impl FromStr for LaunchTimeout {
	type Err = LaunchTimeoutParseError;

	/// Parse either a bare number of milliseconds, which sets only the global deadline, or a JSON
	/// object with `global` and optionally `afterSimLaunch` (alias `afterMilestone`) in ms.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let err = || LaunchTimeoutParseError { input: s.into() };
		let trimmed = s.trim();

		if let Ok(ms) = trimmed.parse::<u64>() {
			return Ok(Duration::from_millis(ms).into());
		}

		let parsed: LaunchTimeoutJson = serde_json::from_str(trimmed).map_err(|_| err())?;
		Ok(Self {
			global: Duration::from_millis(parsed.global),
			after_milestone: parsed.after_milestone.map(Duration::from_millis),
		})
	}
}

/// Delays between a failed attempt and the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
	/// After a known benign startup error; the backing process is left alone.
	pub benign: Duration,

	/// After any other startup failure; the backing process is reset first.
	pub reset: Duration,
}

impl Default for Backoff {
	fn default() -> Self {
		Self {
			benign: Duration::from_secs(1),
			reset: Duration::from_secs(5),
		}
	}
}

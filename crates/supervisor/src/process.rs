//! Worker process spawning and monitoring.

use std::{
	ffi::OsString,
	fmt,
	num::NonZeroI32,
	path::PathBuf,
	process::{ExitStatus, Stdio},
	time::Duration,
};

use nix::{
	sys::signal::{kill, killpg, Signal},
	unistd::Pid,
};
use process_wrap::tokio::{KillOnDrop, ProcessGroup, TokioChildWrapper, TokioCommandWrap};
use tokio::{
	process::Command as TokioCommand,
	select,
	sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, trace, warn};

use crate::stream::{pump, ClassifierPatterns, StreamKind, StreamSignal};

/// How long to wait for the output streams to drain after the process exits.
///
/// A grandchild which inherited the pipes can keep them open indefinitely; past this, whatever
/// the readers haven't seen yet is dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The end status of a process.
///
/// A structured, platform-neutral rendition of [`std::process::ExitStatus`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ProcessEnd {
	/// The process ended successfully, with exit status = 0.
	Success,

	/// The process exited with a non-zero exit status.
	ExitError(NonZeroI32),

	/// The process was terminated by a signal.
	ExitSignal(i32),

	/// The process was stopped (but not terminated).
	ExitStop(NonZeroI32),

	/// The exit status could not be obtained.
	Unknown,
}

impl From<ExitStatus> for ProcessEnd {
	fn from(es: ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;

		match (es.code(), es.signal(), es.stopped_signal()) {
			(Some(code), _, _) => NonZeroI32::new(code).map_or(Self::Success, Self::ExitError),
			(None, Some(_), Some(stopsig)) => {
				NonZeroI32::new(stopsig).map_or(Self::Success, Self::ExitStop)
			}
			(None, Some(signal), _) => Self::ExitSignal(signal),
			(None, None, _) => Self::Unknown,
		}
	}
}

impl fmt::Display for ProcessEnd {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Success => write!(f, "exit code 0"),
			Self::ExitError(code) => write!(f, "exit code {code}"),
			Self::ExitSignal(sig) => match Signal::try_from(*sig) {
				Ok(signal) => write!(f, "signal {signal}"),
				Err(_) => write!(f, "signal {sig}"),
			},
			Self::ExitStop(sig) => write!(f, "stopped by signal {sig}"),
			Self::Unknown => write!(f, "unknown status"),
		}
	}
}

/// What the monitor of one attempt reports back.
#[derive(Debug)]
pub(crate) struct ProcessEvent {
	pub attempt: u32,
	pub kind: ProcessEventKind,
}

#[derive(Debug)]
pub(crate) enum ProcessEventKind {
	Signal(StreamSignal),

	/// The process is gone; its output is still being drained.
	Exiting,

	Exited(ProcessEnd),
}

#[derive(Debug)]
enum ProcessControl {
	Kill,
}

/// Everything needed to start one attempt.
#[derive(Clone, Debug)]
pub(crate) struct Spawnable {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	pub env: Vec<(String, OsString)>,
	pub grouped: bool,
	pub patterns: ClassifierPatterns,
}

/// Handle to one live worker process.
///
/// The child itself is owned by a monitor task, which waits for it to exit, pumps its output
/// streams through classifiers, and reports everything as [`ProcessEvent`]s tagged with the
/// attempt number. Dropping the handle stops the monitor, which kills the process.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
	attempt: u32,
	pid: Option<u32>,
	grouped: bool,
	control: UnboundedSender<ProcessControl>,
	monitor: JoinHandle<()>,
}

impl ProcessHandle {
	pub fn spawn(
		spawnable: Spawnable,
		attempt: u32,
		events: UnboundedSender<ProcessEvent>,
	) -> std::io::Result<Self> {
		let Spawnable {
			program,
			args,
			env,
			grouped,
			patterns,
		} = spawnable;

		let mut command = TokioCommandWrap::with_new(&program, |cmd| {
			cmd.args(&args)
				.envs(env.iter().map(|(k, v)| (k, v)))
				.stdin(Stdio::null())
				.stdout(Stdio::piped())
				.stderr(Stdio::piped());
			reset_sigmask(cmd);
		});
		if grouped {
			command.wrap(ProcessGroup::leader());
		}
		command.wrap(KillOnDrop);

		debug!(?program, ?args, grouped, attempt, "spawning worker");
		let mut child = command.spawn()?;
		let pid = child.id();
		debug!(?pid, attempt, "worker spawned");

		let mut readers = Vec::with_capacity(2);
		if let Some(stdout) = child.stdout().take() {
			readers.push(spawn_reader(stdout, StreamKind::Stdout, &patterns, attempt, &events));
		}
		if let Some(stderr) = child.stderr().take() {
			readers.push(spawn_reader(stderr, StreamKind::Stderr, &patterns, attempt, &events));
		}

		let (control, control_rx) = unbounded_channel();
		let monitor = tokio::spawn(monitor(child, attempt, control_rx, readers, events));

		Ok(Self {
			attempt,
			pid,
			grouped,
			control,
			monitor,
		})
	}

	pub const fn attempt(&self) -> u32 {
		self.attempt
	}

	pub const fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Send a signal to the process (or its group).
	pub fn signal(&self, signal: Signal) -> std::io::Result<()> {
		let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
			return Ok(());
		};

		let pid = Pid::from_raw(pid);
		debug!(%pid, %signal, grouped=self.grouped, "signalling worker");
		if self.grouped {
			killpg(pid, signal)?;
		} else {
			kill(pid, signal)?;
		}
		Ok(())
	}

	/// Forcefully terminate the process.
	pub fn kill(&self) {
		self.control.send(ProcessControl::Kill).ok();
	}
}

impl Drop for ProcessHandle {
	fn drop(&mut self) {
		self.monitor.abort();
	}
}

fn spawn_reader<R>(
	reader: R,
	kind: StreamKind,
	patterns: &ClassifierPatterns,
	attempt: u32,
	events: &UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
	R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
	let patterns = patterns.clone();
	let events = events.clone();
	tokio::spawn(async move {
		pump(reader, kind, patterns, |signal| {
			events
				.send(ProcessEvent {
					attempt,
					kind: ProcessEventKind::Signal(signal),
				})
				.ok();
		})
		.await;
	})
}

async fn monitor(
	mut child: Box<dyn TokioChildWrapper>,
	attempt: u32,
	mut control: UnboundedReceiver<ProcessControl>,
	readers: Vec<JoinHandle<()>>,
	events: UnboundedSender<ProcessEvent>,
) {
	let status = loop {
		select! {
			status = Box::into_pin(child.wait()) => break status,
			Some(ProcessControl::Kill) = control.recv() => {
				trace!(attempt, "force-killing worker");
				if let Err(err) = child.start_kill() {
					warn!(attempt, %err, "could not kill worker");
				}
			}
		}
	};

	let end = match status {
		Ok(status) => ProcessEnd::from(status),
		Err(err) => {
			warn!(attempt, %err, "could not obtain worker exit status");
			ProcessEnd::Unknown
		}
	};
	debug!(attempt, %end, "worker exited");
	events
		.send(ProcessEvent {
			attempt,
			kind: ProcessEventKind::Exiting,
		})
		.ok();

	// signals printed right before the exit must reach the supervisor before the exit itself
	let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
	if timeout(DRAIN_TIMEOUT, futures::future::join_all(readers))
		.await
		.is_err()
	{
		debug!(attempt, "worker streams still open after exit, abandoning them");
		for abort in aborts {
			abort.abort();
		}
	}

	events
		.send(ProcessEvent {
			attempt,
			kind: ProcessEventKind::Exited(end),
		})
		.ok();
}

/// Resets the sigmask of the process before we spawn it.
///
/// Required from Rust 1.66:
/// https://github.com/rust-lang/rust/pull/101077
fn reset_sigmask(command: &mut TokioCommand) {
	use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
	unsafe {
		command.pre_exec(|| {
			let mut newset = SigSet::all();
			newset.remove(Signal::SIGHUP); // leave SIGHUP alone so nohup works
			sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&newset), None)?;
			Ok(())
		});
	}
}

#[cfg(test)]
mod tests {
	use std::os::unix::process::ExitStatusExt;

	use super::*;

	#[test]
	fn process_end_from_status() {
		assert_eq!(ProcessEnd::from(ExitStatus::from_raw(0)), ProcessEnd::Success);
		assert_eq!(
			ProcessEnd::from(ExitStatus::from_raw(1 << 8)),
			ProcessEnd::ExitError(NonZeroI32::new(1).unwrap())
		);
		assert_eq!(ProcessEnd::from(ExitStatus::from_raw(9)), ProcessEnd::ExitSignal(9));
	}

	#[test]
	fn process_end_display() {
		assert_eq!(ProcessEnd::ExitSignal(9).to_string(), "signal SIGKILL");
		assert_eq!(
			ProcessEnd::ExitError(NonZeroI32::new(3).unwrap()).to_string(),
			"exit code 3"
		);
	}
}

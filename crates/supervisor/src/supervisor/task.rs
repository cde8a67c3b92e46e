use std::{future::pending, future::Future, path::PathBuf, pin::Pin};

use tokio::{
	select,
	sync::{
		mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
		watch,
	},
	task::JoinHandle,
	time::sleep,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
	channel::{ChannelEvent, CommandChannel, CommandReply},
	config::LaunchConfig,
	errors::{LaunchError, SupervisorError},
	hooks::Hooks,
	process::{ProcessEnd, ProcessEvent, ProcessEventKind, ProcessHandle, Spawnable},
	stream::StreamSignal,
	watchdog::{Expired, Phase, WatchdogSet},
	workdir,
};

use super::{
	messages::{Control, Reply},
	state::{Ending, LaunchState, RetryState, Status},
	Supervisor,
};

type BackoffWait = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Start a supervisor task for the given worker.
///
/// Nothing is spawned until [`Supervisor::launch`] is called. The task runs until every
/// [`Supervisor`] handle has been dropped, at which point a live worker is killed.
pub fn start_supervisor(config: LaunchConfig, hooks: Hooks) -> (Supervisor, JoinHandle<()>) {
	let (control_tx, control_rx) = unbounded_channel();
	let (status_tx, status_rx) = watch::channel(Status::default());
	let (events_tx, events_rx) = unbounded_channel();

	let task = SupervisorTask {
		config: config.clone(),
		base: config,
		hooks,
		state: LaunchState::Idle,
		retry: RetryState::default(),
		process: None,
		exiting: false,
		watchdogs: WatchdogSet::new(),
		channel: None,
		events_tx,
		events_rx,
		backoff: None,
		launch_reply: None,
		stop_replies: Vec::new(),
		pending_failure: None,
		result_dir: None,
		result_location: None,
		ending: None,
		status: status_tx,
	};

	let handle = tokio::spawn(task.run(control_rx));
	(
		Supervisor {
			control: control_tx,
			status: status_rx,
		},
		handle,
	)
}

struct SupervisorTask {
	/// As given at construction.
	base: LaunchConfig,

	/// As resolved for the current launch.
	config: LaunchConfig,

	hooks: Hooks,
	state: LaunchState,
	retry: RetryState,
	process: Option<ProcessHandle>,

	/// The process has exited but its exit is held back until its output is drained.
	exiting: bool,

	/// Watchdogs carry the attempt they were armed for.
	watchdogs: WatchdogSet<u32>,

	channel: Option<CommandChannel>,
	events_tx: UnboundedSender<ProcessEvent>,
	events_rx: UnboundedReceiver<ProcessEvent>,
	backoff: Option<BackoffWait>,
	launch_reply: Option<Reply>,
	stop_replies: Vec<Reply>,
	pending_failure: Option<LaunchError>,
	result_dir: Option<PathBuf>,
	result_location: Option<PathBuf>,
	ending: Option<Ending>,
	status: watch::Sender<Status>,
}

impl SupervisorTask {
	async fn run(mut self, mut control: UnboundedReceiver<Control>) {
		loop {
			select! {
				message = control.recv() => {
					let Some(message) = message else { break };
					self.on_control(message).await;
				}
				Some(event) = self.events_rx.recv() => self.on_process_event(event),
				expired = self.watchdogs.next_expired() => self.on_watchdog(expired),
				event = next_channel_event(&mut self.channel) => self.on_channel_event(event),
				() = wait_backoff(&mut self.backoff) => {
					self.backoff = None;
					self.on_backoff_done().await;
				}
			}

			self.publish();
		}

		debug!(state=%self.state, "all handles dropped, supervisor stopping");
	}

	fn set_state(&mut self, state: LaunchState) {
		debug!(from=%self.state, to=%state, "state transition");
		self.state = state;
	}

	fn current_attempt(&self) -> Option<u32> {
		self.process.as_ref().map(ProcessHandle::attempt)
	}

	fn publish(&self) {
		let status = Status {
			state: self.state,
			attempts: self.retry.attempts,
			benign_error_seen: self.retry.benign_error,
			pid: self.process.as_ref().and_then(ProcessHandle::pid),
			result_dir: self.result_dir.clone(),
			result_location: self.result_location.clone(),
			ending: self.ending.clone(),
		};

		self.status.send_if_modified(|current| {
			if *current == status {
				false
			} else {
				*current = status;
				true
			}
		});
	}

	async fn on_control(&mut self, control: Control) {
		trace!(?control, state=%self.state, "handling control");
		match control {
			Control::Launch(reply) => self.launch(reply).await,
			Control::RegisterLaunchSuccess(reply) => {
				let result = match self.state {
					LaunchState::AwaitingCheckIn => {
						self.check_in("caller");
						Ok(())
					}
					LaunchState::Running => Ok(()),
					_ => Err(SupervisorError::NotRunning),
				};
				reply.send(result).ok();
			}
			Control::Shutdown(reply) => self.shutdown(reply),
			Control::ForceStop(reply) => self.force_stop(reply),
			Control::SendCommand { payload, reply } => self.send_command(payload, reply),
			Control::ResetRetries => {
				debug!(previous=?self.retry, "resetting retry state");
				self.retry = RetryState::default();
			}
		}
	}

	async fn launch(&mut self, reply: Reply) {
		if !self.state.can_launch() {
			debug!(state=%self.state, "launch requested while already launched");
			reply.send(Err(SupervisorError::AlreadyLaunched)).ok();
			return;
		}

		self.launch_reply = Some(reply);
		self.ending = None;
		self.result_dir = None;
		self.result_location = None;
		self.set_state(LaunchState::Configuring);

		let mut config = self.base.clone();
		if let Some(preflight) = self.hooks.preflight.clone() {
			if let Err(reason) = preflight.prepare(&mut config).await {
				self.fail_launch(LaunchError::Configuration { reason });
				return;
			}
		}

		if let Err(reason) = config.validate() {
			self.fail_launch(LaunchError::Configuration { reason });
			return;
		}

		if let Some(path) = &config.socket {
			match CommandChannel::bind(path) {
				Ok(channel) => self.channel = Some(channel),
				Err(err) => {
					self.fail_launch(LaunchError::Configuration {
						reason: format!("cannot bind command socket {}: {err}", path.display()),
					});
					return;
				}
			}
		}

		self.config = config;
		self.spawn_attempt().await;
	}

	async fn spawn_attempt(&mut self) {
		self.set_state(LaunchState::Spawning);
		self.retry.attempts += 1;
		let attempt = self.retry.attempts;
		info!(attempt, program=?self.config.program, "launching worker");

		if let Err(err) = workdir::prepare(&self.config.work_dir, self.config.result_base()).await {
			self.fail_launch(LaunchError::Configuration {
				reason: format!(
					"cannot prepare work directory {}: {err}",
					self.config.work_dir.display()
				),
			});
			return;
		}

		let result_dir =
			match workdir::next_result_dir(self.config.result_base(), &self.config.result_prefix)
				.await
			{
				Ok(dir) => dir,
				Err(err) => {
					self.fail_launch(LaunchError::Configuration {
						reason: format!("cannot pick a result directory: {err}"),
					});
					return;
				}
			};

		let (args, env) = self.config.render(&result_dir);
		let spawnable = Spawnable {
			program: self.config.program.clone(),
			args,
			env,
			grouped: self.config.grouped,
			patterns: self.config.patterns.clone(),
		};

		match ProcessHandle::spawn(spawnable, attempt, self.events_tx.clone()) {
			Ok(process) => {
				self.process = Some(process);
				self.exiting = false;
			}
			Err(err) => {
				self.fail_launch(LaunchError::Spawn {
					program: self.config.program.clone(),
					err,
				});
				return;
			}
		}

		self.result_dir = Some(result_dir);
		self.set_state(LaunchState::AwaitingCheckIn);
		self.watchdogs
			.arm(Phase::Global, self.config.launch_timeout.global, attempt);
	}

	fn check_in(&mut self, via: &str) {
		self.watchdogs.cancel_all();
		self.set_state(LaunchState::Running);
		info!(attempts = self.retry.attempts, via, "worker checked in");
		self.publish();
		if let Some(reply) = self.launch_reply.take() {
			reply.send(Ok(())).ok();
		}
	}

	fn on_process_event(&mut self, ProcessEvent { attempt, kind }: ProcessEvent) {
		if self.current_attempt() != Some(attempt) {
			trace!(attempt, ?kind, "discarding event from a previous attempt");
			return;
		}

		match kind {
			ProcessEventKind::Signal(signal) => self.on_signal(attempt, signal),
			ProcessEventKind::Exiting => {
				// no deadline applies to a process which is already gone
				trace!(attempt, state=%self.state, "worker exiting, draining its output");
				self.exiting = true;
				self.watchdogs.cancel_all();
			}
			ProcessEventKind::Exited(end) => self.on_exit(end),
		}
	}

	fn on_signal(&mut self, attempt: u32, signal: StreamSignal) {
		match signal {
			StreamSignal::MilestoneReached => {
				let Some(after) = self.config.launch_timeout.after_milestone else {
					return;
				};
				if self.state == LaunchState::AwaitingCheckIn
					&& !self.exiting
					&& !self.watchdogs.is_armed(Phase::AfterMilestone)
				{
					debug!(?after, "milestone reached, arming secondary watchdog");
					self.watchdogs.arm(Phase::AfterMilestone, after, attempt);
				}
			}
			StreamSignal::BenignStartupError => {
				info!(attempt, "worker hit a benign startup error");
				self.retry.benign_error = true;
			}
			StreamSignal::ResultLocationDiscovered(path) => {
				debug!(?path, "worker declared its result location");
				self.result_location = Some(path);
			}
			StreamSignal::Alert(message) => match &self.hooks.alerts {
				Some(sink) => sink.alert(&message),
				None => debug!(%message, "worker alert"),
			},
			StreamSignal::Ready => {
				if self.state == LaunchState::AwaitingCheckIn {
					self.check_in("ready marker");
				}
			}
		}
	}

	fn on_exit(&mut self, end: ProcessEnd) {
		self.process = None;
		self.exiting = false;
		match self.state {
			LaunchState::AwaitingCheckIn => {
				self.watchdogs.cancel_all();
				let benign = self.retry.benign_error;
				warn!(%end, benign, "worker crashed on startup");
				self.set_state(LaunchState::CrashedAtStartup);
				self.retry_decision(LaunchError::CrashedAtStartup { end, benign });
			}
			LaunchState::NeverCheckedIn => {
				debug!(%end, "timed-out worker is gone");
				let failure = self.pending_failure.take().unwrap_or(LaunchError::NeverCheckedIn {
					phase: Phase::Global,
				});
				self.retry_decision(failure);
			}
			LaunchState::Running => {
				warn!(%end, "worker exited while running");
				self.watchdogs.cancel_all();
				self.finish(LaunchState::Terminated, Ending::AbnormalExit(end));
			}
			LaunchState::ShuttingDown => {
				info!(%end, "worker stopped");
				self.watchdogs.cancel_all();
				self.pending_failure = None;
				self.finish(LaunchState::Terminated, Ending::Stopped);
				if let Some(reply) = self.launch_reply.take() {
					reply
						.send(Err(SupervisorError::LaunchFailed {
							cause: LaunchError::Aborted,
							attempts: self.retry.attempts,
						}))
						.ok();
				}
				for reply in self.stop_replies.drain(..) {
					reply.send(Ok(())).ok();
				}
			}
			state => debug!(%state, %end, "worker exited"),
		}
	}

	fn on_watchdog(&mut self, Expired { phase, action, .. }: Expired<u32>) {
		if self.current_attempt() != Some(action) {
			trace!(%phase, attempt = action, "discarding watchdog from a previous attempt");
			return;
		}

		match (self.state, phase) {
			(LaunchState::AwaitingCheckIn, Phase::Global | Phase::AfterMilestone) => {
				warn!(%phase, attempt = action, "worker never checked in, killing it");
				self.watchdogs.cancel_all();
				self.pending_failure = Some(LaunchError::NeverCheckedIn { phase });
				self.set_state(LaunchState::NeverCheckedIn);
				if let Some(process) = &self.process {
					process.kill();
				}
			}
			(LaunchState::ShuttingDown, Phase::TerminationGrace) => {
				let grace = self.config.term_timeout;
				warn!(?grace, "worker did not stop within the grace period");
				for reply in self.stop_replies.drain(..) {
					reply.send(Err(SupervisorError::ShutdownTimeout { grace })).ok();
				}
			}
			(state, phase) => trace!(%state, %phase, "ignoring watchdog"),
		}
	}

	fn retry_decision(&mut self, failure: LaunchError) {
		let attempts = self.retry.attempts;
		if !failure.is_retryable() {
			self.fail_launch(failure);
			return;
		}

		if attempts > self.config.flaky_retries {
			error!(
				attempts,
				retries = self.config.flaky_retries,
				"exceeded the number of retries allowed"
			);
			self.fail_launch(failure);
			return;
		}

		let (delay, backing) = if self.retry.benign_error {
			self.retry.benign_error = false;
			info!(attempts, %failure, "retrying without resetting the backing process");
			(self.config.backoff.benign, None)
		} else {
			info!(attempts, %failure, "resetting the backing process and retrying");
			(self.config.backoff.reset, self.hooks.backing.clone())
		};

		self.set_state(LaunchState::RetryBackoff);
		self.backoff = Some(Box::pin(async move {
			if let Some(backing) = backing {
				backing.restart().await;
			}
			sleep(delay).await;
		}));
	}

	async fn on_backoff_done(&mut self) {
		if self.state == LaunchState::RetryBackoff {
			self.spawn_attempt().await;
		}
	}

	fn fail_launch(&mut self, cause: LaunchError) {
		let attempts = self.retry.attempts;
		error!(attempts, %cause, "launch failed");

		self.watchdogs.cancel_all();
		self.process = None;
		self.backoff = None;
		self.pending_failure = None;

		let reason = cause.to_string();
		self.finish(
			LaunchState::LaunchFailed,
			Ending::LaunchFailed { attempts, reason },
		);
		if let Some(reply) = self.launch_reply.take() {
			reply
				.send(Err(SupervisorError::LaunchFailed { cause, attempts }))
				.ok();
		}
	}

	/// Callers must see the final state by the time their replies arrive.
	fn finish(&mut self, state: LaunchState, ending: Ending) {
		// dropping the channel cancels its commands and removes the socket
		self.channel = None;
		self.set_state(state);
		self.ending = Some(ending);
		self.publish();
	}

	fn shutdown(&mut self, reply: Reply) {
		match self.state {
			LaunchState::RetryBackoff => {
				debug!("shutdown requested between attempts");
				self.fail_launch(LaunchError::Aborted);
				reply.send(Ok(())).ok();
			}
			LaunchState::AwaitingCheckIn | LaunchState::NeverCheckedIn | LaunchState::Running => {
				self.stop_replies.push(reply);
				self.begin_shutdown();
			}
			LaunchState::ShuttingDown => {
				self.stop_replies.push(reply);
				if !self.watchdogs.is_armed(Phase::TerminationGrace) {
					self.begin_shutdown();
				}
			}
			state => {
				trace!(%state, "nothing to shut down");
				reply.send(Ok(())).ok();
			}
		}
	}

	fn begin_shutdown(&mut self) {
		self.watchdogs.cancel_all();
		self.set_state(LaunchState::ShuttingDown);

		let Some(process) = &self.process else {
			return;
		};
		if self.exiting {
			debug!("worker already exited, waiting for its output to drain");
			return;
		}

		let signal = self.config.stop_signal;
		let grace = self.config.term_timeout;
		info!(%signal, ?grace, "stopping worker");
		if let Err(err) = process.signal(signal) {
			warn!(%err, "could not signal worker");
		}

		let attempt = process.attempt();
		self.watchdogs.arm(Phase::TerminationGrace, grace, attempt);
	}

	fn force_stop(&mut self, reply: Reply) {
		if self.state == LaunchState::RetryBackoff {
			self.fail_launch(LaunchError::Aborted);
			reply.send(Ok(())).ok();
			return;
		}

		let Some(process) = &self.process else {
			reply.send(Ok(())).ok();
			return;
		};

		warn!(pid=?process.pid(), "force-stopping worker");
		process.kill();
		self.watchdogs.cancel_all();
		self.stop_replies.push(reply);
		if self.state != LaunchState::ShuttingDown {
			self.set_state(LaunchState::ShuttingDown);
		}
	}

	fn send_command(&mut self, payload: String, reply: CommandReply) {
		match &mut self.channel {
			Some(channel) => {
				channel.enqueue(payload, reply);
				trace!(
					queued = channel.queued(),
					in_flight = channel.is_in_flight(),
					"command channel"
				);
			}
			None if self.config.socket.is_none() => {
				reply.send(Err(SupervisorError::ChannelDisabled)).ok();
			}
			None => {
				reply.send(Err(SupervisorError::NotRunning)).ok();
			}
		}
	}

	fn on_channel_event(&mut self, event: ChannelEvent) {
		match event {
			ChannelEvent::Connected(stream) => {
				match self.state {
					LaunchState::AwaitingCheckIn => self.check_in("command channel"),
					LaunchState::Running => {}
					state => {
						debug!(%state, "dropping worker connection while not running");
						return;
					}
				}

				if let Some(channel) = &mut self.channel {
					channel.accept(stream);
				}
			}
			ChannelEvent::Replied { id, result } => {
				if let Some(channel) = &mut self.channel {
					channel.complete(id, result);
				}
			}
		}
	}
}

async fn next_channel_event(channel: &mut Option<CommandChannel>) -> ChannelEvent {
	match channel {
		Some(channel) => channel.next().await,
		None => pending().await,
	}
}

async fn wait_backoff(backoff: &mut Option<BackoffWait>) {
	match backoff {
		Some(wait) => wait.await,
		None => pending().await,
	}
}

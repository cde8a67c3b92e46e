//! The supervisor handle and its task.

use tokio::sync::{mpsc::UnboundedSender, oneshot, watch};

use crate::{channel::CommandResult, errors::SupervisorError};

use self::messages::{Control, Reply};

#[doc(inline)]
pub use self::{
	state::{Ending, LaunchState, Status},
	task::start_supervisor,
};

mod messages;
mod state;
mod task;

/// A handle to a supervisor task.
///
/// A supervisor manages one worker process across its launch attempts. All operations are
/// serialised onto the supervisor's task, in the order they are called; the futures returned here
/// resolve when the task has an answer. Dropping a future does not cancel the operation.
///
/// This struct is cloneable. Dropping the last instance stops the task, which kills the worker if
/// it is still alive.
#[derive(Debug, Clone)]
pub struct Supervisor {
	pub(crate) control: UnboundedSender<Control>,
	pub(crate) status: watch::Receiver<Status>,
}

impl Supervisor {
	async fn request(&self, control: impl FnOnce(Reply) -> Control) -> Result<(), SupervisorError> {
		let (tx, rx) = oneshot::channel();
		self.control
			.send(control(tx))
			.map_err(|_| SupervisorError::Gone)?;
		rx.await.map_err(|_| SupervisorError::Gone)?
	}

	/// Launch the worker, retrying flaky startups, and wait until it has checked in.
	///
	/// Resolves with an error if the launch fails terminally: with a non-retryable failure, after
	/// exhausting the configured retries, or when a shutdown is requested in the meantime.
	pub async fn launch(&self) -> Result<(), SupervisorError> {
		self.request(Control::Launch).await
	}

	/// Declare that the worker has checked in, for workers without a readiness marker or channel.
	///
	/// Does nothing if the worker is already running. Errors if no launch is awaiting check-in.
	pub async fn register_launch_success(&self) -> Result<(), SupervisorError> {
		self.request(Control::RegisterLaunchSuccess).await
	}

	/// Ask the worker to stop, and wait for it to exit.
	///
	/// The configured stop signal is sent, then the termination grace period runs. If the worker
	/// is still alive after that, this resolves with [`SupervisorError::ShutdownTimeout`] and the
	/// worker is left as it is. Resolves immediately if there is no worker.
	pub async fn shutdown(&self) -> Result<(), SupervisorError> {
		self.request(Control::Shutdown).await
	}

	/// Kill the worker outright, and wait for it to exit.
	pub async fn force_stop(&self) -> Result<(), SupervisorError> {
		self.request(Control::ForceStop).await
	}

	/// Queue a command for the worker, and wait for its result.
	///
	/// Commands are delivered in the order they're sent, one at a time, as the worker asks for
	/// them. If the channel is torn down first, this resolves with
	/// [`SupervisorError::CommandCancelled`].
	pub async fn send_command(
		&self,
		payload: impl Into<String>,
	) -> Result<CommandResult, SupervisorError> {
		let (tx, rx) = oneshot::channel();
		self.control
			.send(Control::SendCommand {
				payload: payload.into(),
				reply: tx,
			})
			.map_err(|_| SupervisorError::Gone)?;
		rx.await.map_err(|_| SupervisorError::Gone)?
	}

	/// Reset the attempt counter and benign-error flag.
	///
	/// These otherwise carry over from one launch to the next, and every attempt counts against
	/// [`flaky_retries`](crate::LaunchConfig::flaky_retries()), including successful ones. A worker
	/// launched once with two retries allowed gets only one retry on its next launch, and none
	/// after that. Call this before relaunching to give the next launch the full budget.
	pub fn reset_retries(&self) -> Result<(), SupervisorError> {
		self.control
			.send(Control::ResetRetries)
			.map_err(|_| SupervisorError::Gone)
	}

	/// The current state of the supervisor.
	#[must_use]
	pub fn status(&self) -> Status {
		self.status.borrow().clone()
	}

	/// Wait for the current launch to come to an end, however it does.
	///
	/// Resolves immediately if it already has.
	pub async fn ended(&self) -> Result<Ending, SupervisorError> {
		let mut status = self.status.clone();
		let status = status
			.wait_for(|status| status.ending.is_some())
			.await
			.map_err(|_| SupervisorError::Gone)?;
		status.ending.clone().ok_or(SupervisorError::Gone)
	}

	/// Whether the supervisor task has stopped.
	#[must_use]
	pub fn is_gone(&self) -> bool {
		self.control.is_closed()
	}
}

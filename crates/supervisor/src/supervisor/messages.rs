use tokio::sync::oneshot;

use crate::{channel::CommandReply, errors::SupervisorError};

pub(crate) type Reply = oneshot::Sender<Result<(), SupervisorError>>;

/// Requests from a [`Supervisor`](super::Supervisor) handle to its task.
#[derive(Debug)]
pub(crate) enum Control {
	Launch(Reply),
	RegisterLaunchSuccess(Reply),
	Shutdown(Reply),
	ForceStop(Reply),
	SendCommand { payload: String, reply: CommandReply },
	ResetRetries,
}

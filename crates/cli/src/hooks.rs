use std::process::Stdio;

use futures::future::BoxFuture;
use launchguard_supervisor::{BackingProcess, Hooks};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::args::LaunchArgs;

/// Resets the backing process by running a shell command.
#[derive(Debug, Clone)]
pub struct ShellBacking {
	command: String,
}

impl ShellBacking {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
		}
	}
}

impl BackingProcess for ShellBacking {
	fn restart(&self) -> BoxFuture<'_, ()> {
		Box::pin(async move {
			info!(command=%self.command, "resetting backing process");
			match Command::new("sh")
				.arg("-c")
				.arg(&self.command)
				.stdin(Stdio::null())
				.kill_on_drop(true)
				.status()
				.await
			{
				Ok(status) if status.success() => debug!("backing process reset"),
				Ok(status) => warn!(%status, "backing process reset command failed"),
				Err(err) => warn!(%err, "could not run backing process reset command"),
			}
		})
	}
}

fn log_alert(message: &str) {
	warn!(%message, "worker raised an alert");
}

pub fn make_hooks(args: &LaunchArgs) -> Hooks {
	let hooks = Hooks::default().alerts(log_alert);
	match &args.reset_backing_cmd {
		Some(command) => hooks.backing(ShellBacking::new(command)),
		None => hooks,
	}
}

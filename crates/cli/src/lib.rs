#![deny(rust_2018_idioms)]
#![allow(clippy::missing_const_for_fn, clippy::future_not_send)]

use launchguard_supervisor::{
	start_supervisor, CommandResult, Ending, Supervisor, SupervisorError, UNKNOWN_ERROR,
};
use miette::{IntoDiagnostic, Result};
use tokio::{
	io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader},
	select,
	signal::unix::{signal, SignalKind},
};
use tracing::{debug, info, warn};

use crate::args::Args;

pub mod args;
mod hooks;

async fn init() -> Result<(Args, Option<tracing_appender::non_blocking::WorkerGuard>)> {
	let log_on = args::logging::preargs();
	let args = args::get_args();

	let guard = if log_on {
		warn!("ignoring logging options from args");
		None
	} else {
		args::logging::postargs(&args.logging).await?
	};

	Ok((args, guard))
}

/// Resolves on Ctrl-C or SIGTERM.
async fn interrupted() -> Result<()> {
	let mut terminate = signal(SignalKind::terminate()).into_diagnostic()?;
	let mut interrupt = signal(SignalKind::interrupt()).into_diagnostic()?;
	select! {
		_ = terminate.recv() => debug!("got SIGTERM"),
		_ = interrupt.recv() => debug!("got SIGINT"),
	}
	Ok(())
}

/// Stop the worker, escalating to a kill if it doesn't go quietly.
async fn stop(supervisor: &Supervisor) -> Result<Ending> {
	match supervisor.shutdown().await {
		Ok(()) => {}
		Err(SupervisorError::ShutdownTimeout { grace }) => {
			warn!(?grace, "worker did not stop in time, killing it");
			supervisor.force_stop().await?;
		}
		Err(err) => return Err(err.into()),
	}

	Ok(supervisor.ended().await?)
}

/// Relay commands from stdin to the worker, one per line, printing results as JSON lines.
async fn relay_commands(supervisor: &Supervisor) -> Result<Ending> {
	let mut lines = BufReader::new(stdin()).lines();
	let mut out = stdout();
	let interrupt = interrupted();
	tokio::pin!(interrupt);

	loop {
		let line = select! {
			line = lines.next_line() => line.into_diagnostic()?,
			ending = supervisor.ended() => return Ok(ending?),
			done = &mut interrupt => { done?; break; }
		};

		let Some(line) = line else {
			debug!("end of input");
			break;
		};
		if line.trim().is_empty() {
			continue;
		}

		let result = select! {
			result = supervisor.send_command(line) => result,
			done = &mut interrupt => { done?; break; }
		};

		let output = match result {
			Ok(result) => serde_json::to_string(&result).into_diagnostic()?,
			Err(err) => {
				warn!(%err, "command failed");
				serde_json::to_string(&CommandResult {
					status: UNKNOWN_ERROR,
					value: err.to_string().into(),
				})
				.into_diagnostic()?
			}
		};

		out.write_all(output.as_bytes()).await.into_diagnostic()?;
		out.write_all(b"\n").await.into_diagnostic()?;
		out.flush().await.into_diagnostic()?;
	}

	stop(supervisor).await
}

async fn wait_for_worker(supervisor: &Supervisor) -> Result<Ending> {
	select! {
		ending = supervisor.ended() => Ok(ending?),
		done = interrupted() => {
			done?;
			stop(supervisor).await
		}
	}
}

async fn run_supervisor(args: Args) -> Result<()> {
	info!(version=%env!("CARGO_PKG_VERSION"), "starting supervisor");

	let config = args.launch.to_config(&args.program);
	let hooks = hooks::make_hooks(&args.launch);
	let (supervisor, task) = start_supervisor(config, hooks);

	supervisor.launch().await?;
	info!(status=?supervisor.status(), "worker is up");

	let ending = if args.launch.socket.is_some() {
		relay_commands(&supervisor).await?
	} else {
		wait_for_worker(&supervisor).await?
	};

	drop(supervisor);
	task.await.into_diagnostic()?;

	match ending {
		Ending::Stopped => {
			info!("worker stopped");
			Ok(())
		}
		Ending::AbnormalExit(end) => Err(SupervisorError::AbnormalExit { end }.into()),
		Ending::LaunchFailed { attempts, reason } => {
			Err(miette::miette!("launch failed after {attempts} attempt(s): {reason}"))
		}
	}
}

pub async fn run() -> Result<()> {
	let (args, _guard) = init().await?;
	debug!(?args, "arguments");
	run_supervisor(args).await
}

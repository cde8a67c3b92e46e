//! Launchguard's process launch supervisor.
//!
//! This crate supervises one long-lived worker process whose startup is unreliable: it may crash
//! straight away, hang without ever signalling readiness, or come up normally. The supervisor
//! starts the worker, tells these outcomes apart by watching its exit status and what it prints,
//! retries the flaky ones a bounded number of times, and stops the worker gracefully (or not) on
//! request.
//!
//! Optionally, the worker can pull commands from the supervisor over a Unix socket, one at a time.
//!
//! # Theory of Operation
//!
//! [`start_supervisor`] spawns a Tokio task and returns a [`Supervisor`], a cloneable handle which
//! sends control messages to it. The task runs an event loop over five sources: control messages,
//! events from the current worker process (classified output and its exit), watchdog expiries,
//! command channel connections, and the delay between retries. Everything which changes the
//! supervisor's state happens on that loop, one event at a time.
//!
//! Each spawn is an _attempt_. Events from the process and watchdogs are tagged with the attempt
//! they belong to, and anything tagged with an attempt other than the current one is discarded, so
//! a late exit or timer from a previous attempt never affects the next.
//!
//! A launch succeeds when the worker _checks in_: it prints the configured readiness marker,
//! connects to the command channel, or the application calls
//! [`Supervisor::register_launch_success`].
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> miette::Result<()> {
//! use std::time::Duration;
//! use launchguard_supervisor::{start_supervisor, Hooks, LaunchConfig};
//!
//! let config = LaunchConfig::new("/usr/local/bin/worker")
//! 	.args(["--results", "{result_dir}", "--socket", "{socket}"])
//! 	.socket("/tmp/worker.sock")
//! 	.launch_timeout(Duration::from_secs(60))
//! 	.flaky_retries(2);
//!
//! let (supervisor, task) = start_supervisor(config, Hooks::default());
//! supervisor.launch().await?;
//!
//! let result = supervisor.send_command("status()").await?;
//! println!("worker says: {}", result.value);
//!
//! supervisor.shutdown().await?;
//! drop(supervisor);
//! task.await.ok();
//! # Ok(()) }
//! ```

#![warn(clippy::unwrap_used, missing_docs, rustdoc::unescaped_backticks)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(rust_2018_idioms)]

#[doc(no_inline)]
pub use nix::sys::signal::Signal;

#[doc(inline)]
pub use self::{
	channel::{CommandResult, UNKNOWN_ERROR},
	config::{Backoff, LaunchConfig, LaunchTimeout},
	errors::{LaunchError, SupervisorError},
	hooks::{AlertSink, BackingProcess, Hooks, Preflight},
	process::ProcessEnd,
	supervisor::{start_supervisor, Ending, LaunchState, Status, Supervisor},
	watchdog::Phase,
};

pub mod config;
pub mod errors;
pub mod stream;
pub mod watchdog;

mod channel;
mod hooks;
mod process;
mod supervisor;
mod workdir;

use clap::Parser;
use tracing::debug;

pub use self::{launch::LaunchArgs, logging::LoggingArgs};

mod launch;
pub(crate) mod logging;

const OPTSET_LAUNCH: &str = "Launch options";
const OPTSET_WORKER: &str = "Worker options";
const OPTSET_DEBUGGING: &str = "Debugging options";

/// Launch a worker with unreliable startup, and supervise it.
///
/// The worker is started, retried if it crashes or hangs during startup, and stopped gracefully
/// when launchguard is interrupted or its input ends.
///
/// If a command socket is configured, each line read from standard input is sent to the worker as
/// a command once it asks for one, and each result is printed as a line of JSON.
#[derive(Debug, Clone, Parser)]
#[command(
	name = "launchguard",
	bin_name = "launchguard",
	author,
	version,
	long_about = None,
	after_help = "Arguments and environment values may contain the placeholders {work_dir}, {result_dir}, and {socket}."
)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	/// Worker program to run, and its arguments
	#[arg(
		trailing_var_arg = true,
		allow_hyphen_values = true,
		num_args = 1..,
		required = true,
		value_name = "PROGRAM",
	)]
	pub program: Vec<String>,

	#[command(flatten)]
	pub launch: LaunchArgs,

	#[command(flatten)]
	pub logging: LoggingArgs,
}

pub fn get_args() -> Args {
	let args = Args::parse();
	debug!(?args, "got arguments");
	args
}

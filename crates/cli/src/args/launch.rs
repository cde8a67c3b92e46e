use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueHint};
use launchguard_supervisor::{
	config::DEFAULT_WORK_DIR, stream::ClassifierPatterns, LaunchConfig, LaunchTimeout, Signal,
};
use regex::Regex;

#[derive(Debug, Clone, Parser)]
pub struct LaunchArgs {
	/// Startup deadline
	///
	/// Either a number of milliseconds, which bounds the whole startup, or a JSON object like
	/// '{"global": 60000, "afterSimLaunch": 5000}' which also bounds the time between the worker's
	/// milestone marker and its check-in.
	#[arg(
		long,
		env = "LAUNCHGUARD_LAUNCH_TIMEOUT",
		help_heading = super::OPTSET_LAUNCH,
		default_value = "90000",
		value_name = "MS|JSON",
	)]
	pub launch_timeout: LaunchTimeout,

	/// Time to wait for the worker to exit after the stop signal
	///
	/// Takes a time span such as "5s" or "1min 30s". If the worker is still alive after that, it
	/// is killed.
	#[arg(
		long,
		env = "LAUNCHGUARD_TERM_TIMEOUT",
		help_heading = super::OPTSET_LAUNCH,
		default_value = "5s",
		value_parser = humantime::parse_duration,
		value_name = "DURATION",
	)]
	pub term_timeout: Duration,

	/// How many times to retry a startup which crashed or never checked in
	#[arg(
		long,
		env = "LAUNCHGUARD_RETRIES",
		help_heading = super::OPTSET_LAUNCH,
		default_value = "0",
		value_name = "N",
	)]
	pub retries: u32,

	/// Shell command which resets the worker's backing process between retries
	///
	/// Run with 'sh -c' before retrying, except after a benign startup error.
	#[arg(
		long,
		env = "LAUNCHGUARD_RESET_BACKING_CMD",
		help_heading = super::OPTSET_LAUNCH,
		value_name = "SHELL",
	)]
	pub reset_backing_cmd: Option<String>,

	/// Output line which marks the worker as ready (regular expression)
	///
	/// Without this, the worker checks in by connecting to the command socket.
	#[arg(
		long,
		env = "LAUNCHGUARD_READY_MARKER",
		help_heading = super::OPTSET_LAUNCH,
		value_parser = Regex::new,
		value_name = "REGEX",
	)]
	pub ready_marker: Option<Regex>,

	/// Output text which marks a startup failure as benign
	///
	/// Benign failures are retried quickly without resetting the backing process. May be given
	/// multiple times; replaces the built-in list.
	#[arg(
		long,
		help_heading = super::OPTSET_LAUNCH,
		value_name = "TEXT",
	)]
	pub benign_error: Vec<String>,

	/// Transient working area, wiped before every attempt
	#[arg(
		long,
		env = "LAUNCHGUARD_WORK_DIR",
		help_heading = super::OPTSET_WORKER,
		default_value = DEFAULT_WORK_DIR,
		value_hint = ValueHint::DirPath,
		value_name = "PATH",
	)]
	pub work_dir: PathBuf,

	/// Where result directories are created (defaults to the work directory)
	#[arg(
		long,
		env = "LAUNCHGUARD_RESULT_DIR",
		help_heading = super::OPTSET_WORKER,
		value_hint = ValueHint::DirPath,
		value_name = "PATH",
	)]
	pub result_dir: Option<PathBuf>,

	/// Unix socket the worker connects to for commands
	#[arg(
		long,
		env = "LAUNCHGUARD_SOCKET",
		help_heading = super::OPTSET_WORKER,
		value_hint = ValueHint::FilePath,
		value_name = "PATH",
	)]
	pub socket: Option<PathBuf>,

	/// Set an environment variable for the worker
	///
	/// Use key=value syntax. May be given multiple times.
	#[arg(
		short = 'E',
		long = "env",
		help_heading = super::OPTSET_WORKER,
		value_parser = parse_env,
		value_name = "KEY=VALUE",
	)]
	pub env: Vec<(String, String)>,

	/// Signal sent to the worker to stop it
	///
	/// Takes a full signal name (like "SIGTERM"), a short name (like "TERM"), or a number.
	#[arg(
		long,
		env = "LAUNCHGUARD_STOP_SIGNAL",
		help_heading = super::OPTSET_WORKER,
		default_value = "SIGTERM",
		value_parser = parse_signal,
		value_name = "SIGNAL",
	)]
	pub stop_signal: Signal,

	/// Don't start the worker in its own process group
	///
	/// Signals then only reach the worker itself, not the processes it starts.
	#[arg(
		long,
		help_heading = super::OPTSET_WORKER,
	)]
	pub no_process_group: bool,
}

impl LaunchArgs {
	pub fn to_config(&self, program: &[String]) -> LaunchConfig {
		let (prog, args) = program.split_first().map_or_else(
			|| (String::new(), &[][..]),
			|(prog, args)| (prog.clone(), args),
		);

		let mut patterns = ClassifierPatterns::default();
		patterns.ready.clone_from(&self.ready_marker);
		if !self.benign_error.is_empty() {
			patterns.benign_errors.clone_from(&self.benign_error);
		}

		let mut config = LaunchConfig::new(prog)
			.args(args.iter().cloned())
			.grouped(!self.no_process_group)
			.work_dir(&self.work_dir)
			.launch_timeout(self.launch_timeout)
			.term_timeout(self.term_timeout)
			.stop_signal(self.stop_signal)
			.flaky_retries(self.retries)
			.patterns(patterns);

		for (key, value) in &self.env {
			config = config.env(key, value);
		}
		if let Some(dir) = &self.result_dir {
			config = config.result_dir(dir);
		}
		if let Some(socket) = &self.socket {
			config = config.socket(socket);
		}

		config
	}
}

fn parse_env(s: &str) -> Result<(String, String), String> {
	let (key, value) = s
		.split_once('=')
		.ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
	if key.is_empty() {
		return Err(format!("empty variable name in {s:?}"));
	}
	Ok((key.into(), value.into()))
}

fn parse_signal(s: &str) -> Result<Signal, String> {
	if let Ok(number) = s.parse::<i32>() {
		return Signal::try_from(number).map_err(|err| format!("{number}: {err}"));
	}

	let upper = s.trim().to_ascii_uppercase();
	let name = if upper.starts_with("SIG") {
		upper
	} else {
		format!("SIG{upper}")
	};
	name.parse::<Signal>()
		.map_err(|_| format!("unknown signal {s:?}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_pairs() {
		assert_eq!(
			parse_env("A=b=c").unwrap(),
			("A".to_string(), "b=c".to_string())
		);
		assert_eq!(parse_env("A=").unwrap(), ("A".to_string(), String::new()));
		assert!(parse_env("novalue").is_err());
		assert!(parse_env("=x").is_err());
	}

	#[test]
	fn signals() {
		assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
		assert_eq!(parse_signal("int").unwrap(), Signal::SIGINT);
		assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
		assert!(parse_signal("SIGNOPE").is_err());
	}
}

use std::time::Duration;

use assert_cmd::Command;

fn launchguard() -> Command {
	let mut cmd = Command::cargo_bin("launchguard").unwrap();
	cmd.env_remove("RUST_LOG").timeout(Duration::from_secs(30));
	cmd
}

#[test]
fn help_lists_options() {
	let output = launchguard().arg("--help").assert().success();
	let help = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
	for option in ["--launch-timeout", "--retries", "--socket", "--ready-marker"] {
		assert!(help.contains(option), "help is missing {option}:\n{help}");
	}
}

#[test]
fn invalid_launch_timeout_is_a_usage_error() {
	launchguard()
		.args(["--launch-timeout", "soon", "--", "true"])
		.assert()
		.code(2);
}

#[test]
fn failed_launch_exits_with_one() {
	let tmp = tempfile::tempdir().unwrap();
	let output = launchguard()
		.arg("--work-dir")
		.arg(tmp.path().join("work"))
		.args(["--retries", "1", "--", "sh", "-c", "exit 3"])
		.assert()
		.code(1);

	let stderr = String::from_utf8_lossy(&output.get_output().stderr).into_owned();
	assert!(stderr.contains("launch failed"), "stderr: {stderr}");
	assert!(stderr.contains("2 attempt"), "stderr: {stderr}");
}

#[test]
fn abnormal_exit_exits_with_one() {
	let tmp = tempfile::tempdir().unwrap();
	launchguard()
		.arg("--work-dir")
		.arg(tmp.path().join("work"))
		.args([
			"--ready-marker",
			"^READY$",
			"--",
			"sh",
			"-c",
			"echo READY; sleep 0.2; exit 5",
		])
		.assert()
		.code(1);
}

#[test]
fn end_of_input_stops_gracefully() {
	let tmp = tempfile::tempdir().unwrap();
	launchguard()
		.arg("--work-dir")
		.arg(tmp.path().join("work"))
		.arg("--socket")
		.arg(tmp.path().join("cmd.sock"))
		.args([
			"--ready-marker",
			"^READY$",
			"--term-timeout",
			"2s",
			"--",
			"sh",
			"-c",
			"echo READY; exec sleep 30",
		])
		.write_stdin("")
		.assert()
		.success();
}

use std::{
	num::NonZeroI32,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use launchguard_supervisor::{
	start_supervisor, Backoff, Ending, Hooks, LaunchConfig, LaunchError, LaunchState,
	LaunchTimeout, Phase, ProcessEnd, SupervisorError,
};

mod helpers;
use helpers::{sh_worker, wait_for_state, CountingBacking};

fn exit_code(code: i32) -> ProcessEnd {
	ProcessEnd::ExitError(NonZeroI32::new(code).unwrap())
}

#[tokio::test]
async fn crash_loop_makes_retries_plus_one_attempts() {
	let tmp = tempfile::tempdir().unwrap();
	let backing = CountingBacking::default();
	let (supervisor, _task) = start_supervisor(
		sh_worker(&tmp, "exit 3").flaky_retries(2),
		Hooks::default().backing(backing.clone()),
	);

	let err = supervisor.launch().await.unwrap_err();
	match err {
		SupervisorError::LaunchFailed {
			cause: LaunchError::CrashedAtStartup { end, benign },
			attempts,
		} => {
			assert_eq!(attempts, 3);
			assert_eq!(end, exit_code(3));
			assert!(!benign);
		}
		other => panic!("unexpected error: {other:?}"),
	}

	// reset before each retry, not after the last attempt
	assert_eq!(backing.count(), 2);

	let status = supervisor.status();
	assert_eq!(status.state, LaunchState::LaunchFailed);
	assert_eq!(status.attempts, 3);
	assert!(matches!(
		status.ending,
		Some(Ending::LaunchFailed { attempts: 3, .. })
	));
}

#[tokio::test]
async fn zero_retries_is_one_attempt() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exit 1"), Hooks::default());

	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 1, .. })
	));
}

#[tokio::test]
async fn benign_startup_error_takes_the_short_backoff() {
	let tmp = tempfile::tempdir().unwrap();
	let backing = CountingBacking::default();
	let config = sh_worker(
		&tmp,
		"echo '(FBSOpenApplicationErrorDomain error 8.)' >&2; exit 1",
	)
	.flaky_retries(1)
	.backoff(Backoff {
		benign: Duration::from_millis(10),
		reset: Duration::from_secs(30),
	});
	let (supervisor, _task) = start_supervisor(config, Hooks::default().backing(backing.clone()));

	let started = Instant::now();
	let err = supervisor.launch().await.unwrap_err();
	assert!(started.elapsed() < Duration::from_secs(10));

	assert!(matches!(
		err,
		SupervisorError::LaunchFailed {
			cause: LaunchError::CrashedAtStartup { benign: true, .. },
			attempts: 2,
		}
	));
	assert_eq!(backing.count(), 0, "backing process must be left alone");
}

#[tokio::test]
async fn succeeds_on_a_later_attempt() {
	let tmp = tempfile::tempdir().unwrap();
	let marker = tmp.path().join("tried");
	let config = sh_worker(
		&tmp,
		r#"if [ -e "$MARKER" ]; then echo READY; exec sleep 30; else touch "$MARKER"; exit 1; fi"#,
	)
	.env("MARKER", marker.display().to_string())
	.flaky_retries(2);
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	supervisor.launch().await.unwrap();
	let status = supervisor.status();
	assert_eq!(status.state, LaunchState::Running);
	assert_eq!(status.attempts, 2);
	assert!(status.pid.is_some());

	supervisor.shutdown().await.unwrap();
	assert_eq!(supervisor.ended().await.unwrap(), Ending::Stopped);
}

#[tokio::test]
async fn never_checking_in_is_killed() {
	let tmp = tempfile::tempdir().unwrap();
	let config = sh_worker(&tmp, "exec sleep 30").launch_timeout(Duration::from_millis(300));
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	let started = Instant::now();
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::NeverCheckedIn {
				phase: Phase::Global
			},
			attempts: 1,
		})
	));
	assert!(started.elapsed() < Duration::from_secs(10));
	assert_eq!(supervisor.status().pid, None);
}

#[tokio::test]
async fn crash_is_not_mistaken_for_a_timeout_while_output_drains() {
	let tmp = tempfile::tempdir().unwrap();
	// the background sleep keeps the output pipes open well past the deadline
	let config = sh_worker(&tmp, "sleep 2 & exit 3")
		.grouped(false)
		.launch_timeout(Duration::from_millis(200));
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	let result = supervisor.launch().await;
	assert!(
		matches!(
			result,
			Err(SupervisorError::LaunchFailed {
				cause: LaunchError::CrashedAtStartup { end, .. },
				attempts: 1,
			}) if end == exit_code(3)
		),
		"{result:?}"
	);
}

#[tokio::test]
async fn milestone_arms_the_secondary_deadline() {
	let tmp = tempfile::tempdir().unwrap();
	let config = sh_worker(&tmp, "echo 'CLTilesManagerClient: initialize'; exec sleep 30")
		.launch_timeout(LaunchTimeout {
			global: Duration::from_secs(20),
			after_milestone: Some(Duration::from_millis(300)),
		});
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	let started = Instant::now();
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::NeverCheckedIn {
				phase: Phase::AfterMilestone
			},
			..
		})
	));
	assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn exit_while_running_is_abnormal() {
	let tmp = tempfile::tempdir().unwrap();
	let config = sh_worker(&tmp, "echo READY; sleep 0.3; exit 4").flaky_retries(3);
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	supervisor.launch().await.unwrap();
	assert_eq!(
		supervisor.ended().await.unwrap(),
		Ending::AbnormalExit(exit_code(4))
	);

	let status = supervisor.status();
	assert_eq!(status.state, LaunchState::Terminated);
	assert_eq!(status.attempts, 1, "running workers are never restarted");
}

#[tokio::test]
async fn second_launch_is_refused() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) =
		start_supervisor(sh_worker(&tmp, "echo READY; exec sleep 30"), Hooks::default());

	supervisor.launch().await.unwrap();
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::AlreadyLaunched)
	));
	supervisor.shutdown().await.unwrap();

	// but once it's gone, it can be launched again
	supervisor.launch().await.unwrap();
	supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_without_worker() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exit 0"), Hooks::default());

	supervisor.shutdown().await.unwrap();
	supervisor.force_stop().await.unwrap();
	assert_eq!(supervisor.status().state, LaunchState::Idle);
}

#[tokio::test]
async fn stubborn_worker_times_out_then_force_stops() {
	let tmp = tempfile::tempdir().unwrap();
	let config = sh_worker(
		&tmp,
		"trap '' TERM; echo READY; while true; do sleep 0.1; done",
	)
	.term_timeout(Duration::from_millis(300));
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	supervisor.launch().await.unwrap();
	assert!(matches!(
		supervisor.shutdown().await,
		Err(SupervisorError::ShutdownTimeout { .. })
	));
	assert_eq!(supervisor.status().state, LaunchState::ShuttingDown);

	supervisor.force_stop().await.unwrap();
	assert_eq!(supervisor.ended().await.unwrap(), Ending::Stopped);
	assert_eq!(supervisor.status().state, LaunchState::Terminated);
}

#[tokio::test]
async fn missing_executable_is_not_retried() {
	let tmp = tempfile::tempdir().unwrap();
	let config = LaunchConfig::new(tmp.path().join("no-such-worker"))
		.work_dir(tmp.path().join("work"))
		.flaky_retries(5);
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::Spawn { .. },
			attempts: 1,
		})
	));
}

#[tokio::test]
async fn preflight_failure_is_a_configuration_error() {
	let tmp = tempfile::tempdir().unwrap();
	let hooks = Hooks::default().preflight(|_: &mut LaunchConfig| -> Result<(), String> {
		Err("no result template".into())
	});
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exit 1").flaky_retries(5), hooks);

	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::Configuration { .. },
			attempts: 0,
		})
	));
}

#[tokio::test]
async fn preflight_resolves_deferred_configuration() {
	let tmp = tempfile::tempdir().unwrap();
	let hooks = Hooks::default().preflight(|config: &mut LaunchConfig| -> Result<(), String> {
		config.args = vec!["-c".into(), "echo READY; exec sleep 30".into()];
		Ok(())
	});
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exit 1"), hooks);

	supervisor.launch().await.unwrap();
	supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn placeholders_and_work_area() {
	let tmp = tempfile::tempdir().unwrap();
	let work = tmp.path().join("work");
	std::fs::create_dir_all(&work).unwrap();
	std::fs::write(work.join("stale"), b"from a previous run").unwrap();

	let config = sh_worker(
		&tmp,
		r#"echo "{result_dir}" > "{work_dir}/picked"; echo READY; exec sleep 30"#,
	);
	let (supervisor, _task) = start_supervisor(config, Hooks::default());
	supervisor.launch().await.unwrap();

	assert!(!work.join("stale").exists());
	let expected = work.join("trace0.trace");
	assert_eq!(supervisor.status().result_dir, Some(expected.clone()));
	assert_eq!(
		std::fs::read_to_string(work.join("picked")).unwrap().trim(),
		expected.display().to_string()
	);

	supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn result_location_and_alerts_are_surfaced() {
	let tmp = tempfile::tempdir().unwrap();
	let alerts = Arc::new(Mutex::new(Vec::new()));
	let sink = alerts.clone();
	let hooks = Hooks::default().alerts(move |line: &str| {
		sink.lock().unwrap().push(line.to_owned());
	});

	let config = sh_worker(
		&tmp,
		r#"echo 'Instruments Trace Complete (Duration : 1s; Output : /tmp/run.trace)'
echo "Call to onAlert returned 'YES'"
echo READY
exec sleep 30"#,
	);
	let (supervisor, _task) = start_supervisor(config, hooks);
	supervisor.launch().await.unwrap();

	assert_eq!(
		supervisor.status().result_location,
		Some("/tmp/run.trace".into())
	);
	assert_eq!(
		alerts.lock().unwrap().as_slice(),
		["Call to onAlert returned 'YES'"]
	);

	supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn caller_can_register_success() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exec sleep 30"), Hooks::default());

	assert!(matches!(
		supervisor.register_launch_success().await,
		Err(SupervisorError::NotRunning)
	));

	let launching = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.launch().await }
	});
	wait_for_state(&supervisor, LaunchState::AwaitingCheckIn).await;

	supervisor.register_launch_success().await.unwrap();
	launching.await.unwrap().unwrap();
	assert_eq!(supervisor.status().state, LaunchState::Running);

	supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn successful_launches_use_up_retries() {
	let tmp = tempfile::tempdir().unwrap();
	let mark = tmp.path().join("launched-once");
	// checks in the first time, crashes every time after that
	let config = sh_worker(
		&tmp,
		r#"[ -e "$MARK" ] && exit 1; touch "$MARK"; echo READY; exec sleep 30"#,
	)
	.env("MARK", mark.display().to_string())
	.flaky_retries(1);
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	supervisor.launch().await.unwrap();
	supervisor.shutdown().await.unwrap();

	// the first launch's attempt leaves no retry for this one
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 2, .. })
	));

	supervisor.reset_retries().unwrap();
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 2, .. })
	));
	assert_eq!(supervisor.status().attempts, 2);
}

#[tokio::test]
async fn retry_state_carries_over_until_reset() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exit 1"), Hooks::default());

	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 1, .. })
	));
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 2, .. })
	));

	supervisor.reset_retries().unwrap();
	assert!(matches!(
		supervisor.launch().await,
		Err(SupervisorError::LaunchFailed { attempts: 1, .. })
	));
}

#[tokio::test]
async fn shutdown_between_attempts_aborts_the_launch() {
	let tmp = tempfile::tempdir().unwrap();
	let config = sh_worker(&tmp, "exit 1")
		.flaky_retries(5)
		.backoff(Backoff {
			benign: Duration::from_secs(30),
			reset: Duration::from_secs(30),
		});
	let (supervisor, _task) = start_supervisor(config, Hooks::default());

	let launching = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.launch().await }
	});
	wait_for_state(&supervisor, LaunchState::RetryBackoff).await;

	supervisor.shutdown().await.unwrap();
	assert!(matches!(
		launching.await.unwrap(),
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::Aborted,
			attempts: 1,
		})
	));
}

#[tokio::test]
async fn shutdown_while_awaiting_check_in_aborts_the_launch() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, _task) = start_supervisor(sh_worker(&tmp, "exec sleep 30"), Hooks::default());

	let launching = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.launch().await }
	});
	wait_for_state(&supervisor, LaunchState::AwaitingCheckIn).await;

	supervisor.shutdown().await.unwrap();
	assert!(matches!(
		launching.await.unwrap(),
		Err(SupervisorError::LaunchFailed {
			cause: LaunchError::Aborted,
			..
		})
	));
	assert_eq!(supervisor.ended().await.unwrap(), Ending::Stopped);
}

#[tokio::test]
async fn dropping_the_last_handle_stops_the_task() {
	let tmp = tempfile::tempdir().unwrap();
	let (supervisor, task) =
		start_supervisor(sh_worker(&tmp, "echo READY; exec sleep 30"), Hooks::default());

	supervisor.launch().await.unwrap();
	drop(supervisor);
	tokio::time::timeout(Duration::from_secs(5), task)
		.await
		.unwrap()
		.unwrap();
}

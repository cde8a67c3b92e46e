#![allow(dead_code)]

use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use futures::future::BoxFuture;
use launchguard_supervisor::{
	stream::ClassifierPatterns, Backoff, BackingProcess, LaunchConfig, LaunchState, Supervisor,
};
use regex::Regex;
use tempfile::TempDir;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::UnixStream,
	time::{sleep, timeout},
};

pub fn tracing_init() {
	use tracing_subscriber::{fmt::Subscriber, util::SubscriberInitExt, EnvFilter};
	Subscriber::builder()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.finish()
		.try_init()
		.ok();
}

/// A `sh -c` worker which checks in by printing `READY` on a line of its own.
pub fn sh_worker(tmp: &TempDir, script: &str) -> LaunchConfig {
	tracing_init();

	let mut patterns = ClassifierPatterns::default();
	patterns.ready = Regex::new("^READY$").ok();

	LaunchConfig::new("sh")
		.args(["-c", script])
		.work_dir(tmp.path().join("work"))
		.launch_timeout(Duration::from_secs(10))
		.term_timeout(Duration::from_secs(2))
		.backoff(Backoff {
			benign: Duration::from_millis(10),
			reset: Duration::from_millis(50),
		})
		.patterns(patterns)
}

/// Counts how many times the backing process was reset.
#[derive(Clone, Debug, Default)]
pub struct CountingBacking(pub Arc<AtomicUsize>);

impl CountingBacking {
	pub fn count(&self) -> usize {
		self.0.load(Ordering::SeqCst)
	}
}

impl BackingProcess for CountingBacking {
	fn restart(&self) -> BoxFuture<'_, ()> {
		self.0.fetch_add(1, Ordering::SeqCst);
		Box::pin(async {})
	}
}

pub async fn wait_for_state(supervisor: &Supervisor, state: LaunchState) {
	timeout(Duration::from_secs(10), async {
		while supervisor.status().state != state {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.unwrap_or_else(|_| panic!("never reached {state}, status: {:?}", supervisor.status()));
}

pub fn socket_path(tmp: &TempDir) -> PathBuf {
	tmp.path().join("cmd.sock")
}

/// Play the worker's side of the command channel: connect, take a command, answer it.
///
/// The answer is produced by `respond` from the command text. Returns the command.
pub async fn serve_one(path: &Path, respond: impl FnOnce(&str) -> String) -> String {
	let mut stream = UnixStream::connect(path).await.unwrap();
	let mut command = String::new();
	stream.read_to_string(&mut command).await.unwrap();

	stream
		.write_all(respond(&command).as_bytes())
		.await
		.unwrap();
	stream.shutdown().await.unwrap();

	// wait for the supervisor to be done with the connection
	let mut rest = Vec::new();
	stream.read_to_end(&mut rest).await.ok();
	command
}

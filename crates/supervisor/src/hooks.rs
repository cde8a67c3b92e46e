//! Collaborators the supervisor calls out to.

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;

use crate::config::LaunchConfig;

/// Resolves configuration which can only be known at launch time.
///
/// Runs once per launch, before the first spawn. An error here is a misconfiguration and fails
/// the launch without retrying.
pub trait Preflight: Send + Sync + 'static {
	/// Fill in or check the configuration.
	fn prepare<'a>(&'a self, config: &'a mut LaunchConfig) -> BoxFuture<'a, Result<(), String>>;
}

/// Controls the secondary process the worker depends on (a simulator, a device bridge...).
pub trait BackingProcess: Send + Sync + 'static {
	/// Reset the backing process, so the next attempt starts from a clean slate.
	fn restart(&self) -> BoxFuture<'_, ()>;
}

/// Receives the alerts the worker surfaces.
pub trait AlertSink: Send + Sync + 'static {
	/// Called with the alert line, verbatim.
	fn alert(&self, message: &str);
}

impl<F> Preflight for F
where
	F: Fn(&mut LaunchConfig) -> Result<(), String> + Send + Sync + 'static,
{
	fn prepare<'a>(&'a self, config: &'a mut LaunchConfig) -> BoxFuture<'a, Result<(), String>> {
		let result = self(config);
		Box::pin(async move { result })
	}
}

impl<F> AlertSink for F
where
	F: Fn(&str) + Send + Sync + 'static,
{
	fn alert(&self, message: &str) {
		self(message);
	}
}

/// The set of collaborators given to a supervisor. All are optional.
#[derive(Clone, Default)]
pub struct Hooks {
	/// Deferred configuration.
	pub preflight: Option<Arc<dyn Preflight>>,

	/// Backing process control.
	pub backing: Option<Arc<dyn BackingProcess>>,

	/// Alert forwarding.
	pub alerts: Option<Arc<dyn AlertSink>>,
}

impl fmt::Debug for Hooks {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Hooks")
			.field("preflight", &self.preflight.is_some())
			.field("backing", &self.backing.is_some())
			.field("alerts", &self.alerts.is_some())
			.finish()
	}
}

impl Hooks {
	/// Set the preflight hook.
	#[must_use]
	pub fn preflight(mut self, hook: impl Preflight) -> Self {
		self.preflight = Some(Arc::new(hook));
		self
	}

	/// Set the backing process controller.
	#[must_use]
	pub fn backing(mut self, hook: impl BackingProcess) -> Self {
		self.backing = Some(Arc::new(hook));
		self
	}

	/// Set the alert sink.
	#[must_use]
	pub fn alerts(mut self, hook: impl AlertSink) -> Self {
		self.alerts = Some(Arc::new(hook));
		self
	}
}

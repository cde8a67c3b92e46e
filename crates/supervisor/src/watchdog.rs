//! Cancellable deadline timers keyed by phase.
//!
//! A [`WatchdogSet`] arms any number of independent timers. Each timer runs as a small Tokio task
//! which sleeps and then reports its expiry through a channel owned by the set; the set only
//! surfaces an expiry from [`next_expired()`](WatchdogSet::next_expired) if the timer is still
//! armed at that point. Cancelling removes the timer from the armed table before returning, so an
//! expiry which was already queued but not yet consumed is discarded rather than delivered.

use std::{collections::HashMap, fmt, time::Duration};

use tokio::{
	sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
	task::JoinHandle,
	time::sleep,
};
use tracing::trace;

/// What a watchdog is guarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
	/// The overall startup deadline.
	Global,

	/// The secondary startup deadline, armed once the worker's backing process is up.
	AfterMilestone,

	/// The grace period given to the worker to exit after a stop signal.
	TerminationGrace,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Global => "global",
			Self::AfterMilestone => "afterMilestone",
			Self::TerminationGrace => "terminationGrace",
		})
	}
}

/// Opaque handle to an armed timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A timer which has fired.
#[derive(Debug, PartialEq, Eq)]
pub struct Expired<A> {
	/// The timer's handle.
	pub handle: TimerHandle,

	/// The phase the timer was armed for.
	pub phase: Phase,

	/// The action the timer was armed with.
	pub action: A,
}

#[derive(Debug)]
struct Armed<A> {
	phase: Phase,
	action: A,
	task: JoinHandle<()>,
}

/// A set of independently cancellable watchdog timers.
///
/// The `A` parameter is the action to take on expiry; it is handed back by
/// [`next_expired()`](Self::next_expired) and is never observed for a cancelled timer.
#[derive(Debug)]
pub struct WatchdogSet<A> {
	next_id: u64,
	armed: HashMap<TimerHandle, Armed<A>>,
	fired_tx: UnboundedSender<TimerHandle>,
	fired_rx: UnboundedReceiver<TimerHandle>,
}

impl<A> Default for WatchdogSet<A> {
	fn default() -> Self {
		Self::new()
	}
}

impl<A> WatchdogSet<A> {
	/// Create an empty set.
	#[must_use]
	pub fn new() -> Self {
		let (fired_tx, fired_rx) = unbounded_channel();
		Self {
			next_id: 0,
			armed: HashMap::new(),
			fired_tx,
			fired_rx,
		}
	}

	/// Arm a timer which expires after `duration`.
	///
	/// Arming never affects other timers, including ones armed for the same phase.
	pub fn arm(&mut self, phase: Phase, duration: Duration, action: A) -> TimerHandle {
		let handle = TimerHandle(self.next_id);
		self.next_id += 1;

		let fired = self.fired_tx.clone();
		let task = tokio::spawn(async move {
			sleep(duration).await;
			fired.send(handle).ok();
		});

		trace!(?handle, %phase, ?duration, "watchdog armed");
		self.armed.insert(
			handle,
			Armed {
				phase,
				action,
				task,
			},
		);
		handle
	}

	/// Cancel a timer.
	///
	/// Returns the action if the timer was still armed. Once this returns, the timer's expiry will
	/// never be delivered, even if its deadline has already passed.
	pub fn cancel(&mut self, handle: TimerHandle) -> Option<A> {
		let armed = self.armed.remove(&handle)?;
		armed.task.abort();
		trace!(?handle, phase=%armed.phase, "watchdog cancelled");
		Some(armed.action)
	}

	/// Cancel every armed timer.
	pub fn cancel_all(&mut self) {
		for (handle, armed) in self.armed.drain() {
			armed.task.abort();
			trace!(?handle, phase=%armed.phase, "watchdog cancelled");
		}
	}

	/// Cancel every armed timer for a phase.
	pub fn cancel_phase(&mut self, phase: Phase) {
		let handles: Vec<_> = self
			.armed
			.iter()
			.filter(|(_, armed)| armed.phase == phase)
			.map(|(handle, _)| *handle)
			.collect();
		for handle in handles {
			self.cancel(handle);
		}
	}

	/// Whether any timer is armed for a phase.
	#[must_use]
	pub fn is_armed(&self, phase: Phase) -> bool {
		self.armed.values().any(|armed| armed.phase == phase)
	}

	/// How many timers are armed.
	#[must_use]
	pub fn len(&self) -> usize {
		self.armed.len()
	}

	/// Whether no timers are armed.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.armed.is_empty()
	}

	/// Wait for the next armed timer to expire.
	///
	/// This is cancel-safe: if the future is dropped before it resolves, no expiry is lost. If no
	/// timer is ever armed, this never resolves.
	pub async fn next_expired(&mut self) -> Expired<A> {
		loop {
			let Some(handle) = self.fired_rx.recv().await else {
				// we hold a sender, so the channel can't close
				continue;
			};

			if let Some(armed) = self.armed.remove(&handle) {
				trace!(?handle, phase=%armed.phase, "watchdog fired");
				return Expired {
					handle,
					phase: armed.phase,
					action: armed.action,
				};
			}

			trace!(?handle, "discarding expiry of cancelled watchdog");
		}
	}
}

impl<A> Drop for WatchdogSet<A> {
	fn drop(&mut self) {
		for armed in self.armed.values() {
			armed.task.abort();
		}
	}
}

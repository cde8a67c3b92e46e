//! The command dispatch channel.
//!
//! When enabled, the worker pulls work from the supervisor: each time it is ready for a command
//! it connects to a Unix socket owned by the supervisor. The supervisor writes one queued command
//! to the connection and closes its write side; the worker writes the result back on the same
//! connection and closes it. Only one command is ever in flight.

use std::{
	collections::VecDeque,
	io::ErrorKind,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{UnixListener, UnixStream},
	sync::{
		mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
		oneshot,
	},
	task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::errors::SupervisorError;

/// Status code of a result synthesised by the supervisor rather than sent by the worker.
pub const UNKNOWN_ERROR: i64 = 13;

/// What the worker sent back for a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
	/// Zero for success; anything else is a worker-defined error code.
	pub status: i64,

	/// The command's return value or error detail.
	#[serde(default)]
	pub value: Value,
}

impl CommandResult {
	/// The result used when the worker's reply can't be parsed.
	#[must_use]
	pub fn unparseable(raw: &[u8]) -> Self {
		Self {
			status: UNKNOWN_ERROR,
			value: Value::String(format!(
				"unparseable result from worker: {:?}",
				String::from_utf8_lossy(raw)
			)),
		}
	}

	/// Parse a reply, falling back to [`unparseable`](Self::unparseable).
	#[must_use]
	pub fn parse(raw: &[u8]) -> Self {
		serde_json::from_slice(raw).unwrap_or_else(|err| {
			debug!(%err, "worker sent an unparseable result");
			Self::unparseable(raw)
		})
	}

	/// Whether the status is zero.
	#[must_use]
	pub const fn is_success(&self) -> bool {
		self.status == 0
	}
}

/// A single-use reply slot for a command.
pub(crate) type CommandReply = oneshot::Sender<Result<CommandResult, SupervisorError>>;

#[derive(Debug)]
struct PendingCommand {
	payload: String,
	reply: CommandReply,
}

#[derive(Debug)]
struct InFlight {
	id: u64,
	payload: String,
	reply: CommandReply,
	exchange: JoinHandle<()>,
}

/// How an exchange with the worker went wrong.
#[derive(Debug)]
pub(crate) enum ExchangeError {
	/// The connection was already dead; the worker never saw the command.
	Undelivered(std::io::Error),

	/// The command went out but no reply came back.
	Lost(std::io::Error),
}

/// Something that happened on the channel, to be handled by the supervisor loop.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
	Connected(UnixStream),
	Replied {
		id: u64,
		result: Result<Vec<u8>, ExchangeError>,
	},
}

/// What became of an incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accepted {
	Dispatched,
	Parked,
	Rejected,
}

/// The listening socket, queue, and in-flight state of the command channel.
#[derive(Debug)]
pub(crate) struct CommandChannel {
	path: PathBuf,
	listener: JoinHandle<()>,
	events_tx: UnboundedSender<ChannelEvent>,
	events_rx: UnboundedReceiver<ChannelEvent>,
	queue: VecDeque<PendingCommand>,
	parked: VecDeque<UnixStream>,
	in_flight: Option<InFlight>,
	next_id: u64,
}

impl CommandChannel {
	/// Bind the socket and start accepting connections.
	///
	/// A stale socket file at the path is removed first.
	pub fn bind(path: &Path) -> std::io::Result<Self> {
		match std::fs::remove_file(path) {
			Ok(()) => debug!(?path, "removed stale socket"),
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => return Err(err),
		}

		let listener = UnixListener::bind(path)?;
		debug!(?path, "command channel listening");

		let (events_tx, events_rx) = unbounded_channel();
		let accepted = events_tx.clone();
		let listener = tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, _)) => {
						trace!("worker connected");
						if accepted.send(ChannelEvent::Connected(stream)).is_err() {
							break;
						}
					}
					Err(err) => {
						warn!(%err, "command channel accept failed");
					}
				}
			}
		});

		Ok(Self {
			path: path.to_owned(),
			listener,
			events_tx,
			events_rx,
			queue: VecDeque::new(),
			parked: VecDeque::new(),
			in_flight: None,
			next_id: 0,
		})
	}

	/// Wait for the next channel event. Cancel-safe.
	pub async fn next(&mut self) -> ChannelEvent {
		// we hold a sender, so the stream never ends
		match self.events_rx.recv().await {
			Some(event) => event,
			None => std::future::pending().await,
		}
	}

	/// Number of commands waiting for the worker.
	pub fn queued(&self) -> usize {
		self.queue.len()
	}

	/// Whether a command has been delivered and is awaiting its result.
	pub const fn is_in_flight(&self) -> bool {
		self.in_flight.is_some()
	}

	/// Queue a command, delivering it at once if the worker is already waiting.
	pub fn enqueue(&mut self, payload: String, reply: CommandReply) {
		trace!(queued = self.queue.len(), "command enqueued");
		self.queue.push_back(PendingCommand { payload, reply });
		self.dispatch_next();
	}

	/// Serve the oldest parked connection, if there's a command for it and nothing in flight.
	fn dispatch_next(&mut self) {
		if self.in_flight.is_some() || self.queue.is_empty() {
			return;
		}

		if let Some(stream) = self.parked.pop_front() {
			self.dispatch(stream);
		}
	}

	/// Handle a worker connection.
	pub fn accept(&mut self, stream: UnixStream) -> Accepted {
		if let Some(in_flight) = &self.in_flight {
			warn!(
				in_flight = in_flight.id,
				"protocol violation: worker connected while a command is in flight, dropping connection"
			);
			return Accepted::Rejected;
		}

		if self.queue.is_empty() {
			trace!(parked = self.parked.len() + 1, "no command queued, parking connection");
			self.parked.push_back(stream);
			Accepted::Parked
		} else {
			self.dispatch(stream);
			Accepted::Dispatched
		}
	}

	fn dispatch(&mut self, stream: UnixStream) {
		let Some(PendingCommand { payload, reply }) = self.queue.pop_front() else {
			self.parked.push_front(stream);
			return;
		};

		let id = self.next_id;
		self.next_id += 1;
		debug!(id, "dispatching command to worker");

		let events = self.events_tx.clone();
		let sent = payload.clone();
		let exchange = tokio::spawn(async move {
			let result = round_trip(stream, sent).await;
			events.send(ChannelEvent::Replied { id, result }).ok();
		});

		self.in_flight = Some(InFlight {
			id,
			payload,
			reply,
			exchange,
		});
	}

	/// Resolve the in-flight command with what came back on its connection.
	///
	/// A command which never reached the worker goes back to the front of the queue, for the next
	/// parked connection to pick up.
	pub fn complete(&mut self, id: u64, result: Result<Vec<u8>, ExchangeError>) {
		if self.in_flight.as_ref().map(|f| f.id) != Some(id) {
			trace!(id, "discarding reply for a command no longer in flight");
			return;
		}
		let Some(in_flight) = self.in_flight.take() else {
			return;
		};

		let outcome = match result {
			Ok(raw) => {
				let parsed = CommandResult::parse(&raw);
				debug!(id, status = parsed.status, "command completed");
				Ok(parsed)
			}
			Err(ExchangeError::Undelivered(err)) => {
				debug!(id, %err, "worker connection was already closed, requeueing command");
				self.queue.push_front(PendingCommand {
					payload: in_flight.payload,
					reply: in_flight.reply,
				});
				self.dispatch_next();
				return;
			}
			Err(ExchangeError::Lost(err)) => {
				warn!(id, %err, "worker connection lost with command in flight");
				Err(SupervisorError::CommandAbandoned {
					reason: err.to_string(),
				})
			}
		};
		in_flight.reply.send(outcome).ok();
		self.dispatch_next();
	}

	/// Cancel everything: queued and in-flight commands resolve with a cancellation error.
	pub fn teardown(&mut self) {
		let mut cancelled = 0_usize;
		if let Some(in_flight) = self.in_flight.take() {
			in_flight.exchange.abort();
			in_flight.reply.send(Err(SupervisorError::CommandCancelled)).ok();
			cancelled += 1;
		}

		for pending in self.queue.drain(..) {
			pending.reply.send(Err(SupervisorError::CommandCancelled)).ok();
			cancelled += 1;
		}

		self.parked.clear();
		self.listener.abort();
		debug!(cancelled, "command channel torn down");
	}
}

impl Drop for CommandChannel {
	fn drop(&mut self) {
		self.teardown();
		if let Err(err) = std::fs::remove_file(&self.path) {
			if err.kind() != ErrorKind::NotFound {
				debug!(path=?self.path, %err, "could not remove socket");
			}
		}
	}
}

async fn round_trip(mut stream: UnixStream, payload: String) -> Result<Vec<u8>, ExchangeError> {
	stream
		.write_all(payload.as_bytes())
		.await
		.map_err(ExchangeError::Undelivered)?;
	stream.shutdown().await.map_err(ExchangeError::Undelivered)?;

	let mut raw = Vec::new();
	stream
		.read_to_end(&mut raw)
		.await
		.map_err(ExchangeError::Lost)?;
	Ok(raw)
}

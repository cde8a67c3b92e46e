//! Classification of the worker's output streams.
//!
//! The worker has no health-check API, so the supervisor learns about its progress by reading
//! what it prints. A [`Classifier`] is fed raw chunks as they're read from a pipe, strips the
//! worker's buffering noise, and derives [`StreamSignal`]s from complete lines.

use std::{fmt, path::PathBuf};

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Which output stream a chunk came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
	/// Standard output.
	Stdout,

	/// Standard error.
	Stderr,
}

impl fmt::Display for StreamKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Stdout => "stdout",
			Self::Stderr => "stderr",
		})
	}
}

/// Something noteworthy the worker printed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSignal {
	/// The worker's backing process has finished initialising.
	MilestoneReached,

	/// The worker hit a known startup race which is expected to clear on a quick retry.
	BenignStartupError,

	/// The worker declared where its result artifacts are.
	ResultLocationDiscovered(PathBuf),

	/// The worker's automation surfaced an alert; the line is carried verbatim.
	Alert(String),

	/// The worker printed the configured readiness marker.
	Ready,
}

/// The markers a [`Classifier`] looks for.
#[derive(Clone, Debug)]
pub struct ClassifierPatterns {
	/// Marker for [`StreamSignal::MilestoneReached`].
	pub milestone: Option<Regex>,

	/// Substrings for [`StreamSignal::BenignStartupError`].
	pub benign_errors: Vec<String>,

	/// Marker for [`StreamSignal::ResultLocationDiscovered`].
	///
	/// The first capture group (or the group named `path`, if present) is the location.
	pub result_location: Option<Regex>,

	/// Marker for [`StreamSignal::Alert`].
	pub alert: Option<Regex>,

	/// Marker for [`StreamSignal::Ready`].
	pub ready: Option<Regex>,
}

impl Default for ClassifierPatterns {
	fn default() -> Self {
		Self {
			milestone: Regex::new(r"CLTilesManagerClient: initialize").ok(),
			benign_errors: vec!["(FBSOpenApplicationErrorDomain error 8.)".into()],
			result_location: Regex::new(r"Instruments Trace Complete.*Output : (?P<path>.+?)\)")
				.ok(),
			alert: Regex::new(r"Call to onAlert returned 'YES'").ok(),
			ready: None,
		}
	}
}

impl ClassifierPatterns {
	/// Patterns which never match anything.
	#[must_use]
	pub fn none() -> Self {
		Self {
			milestone: None,
			benign_errors: Vec::new(),
			result_location: None,
			alert: None,
			ready: None,
		}
	}

	fn signals_for(&self, line: &str) -> Vec<StreamSignal> {
		let mut signals = Vec::new();

		if self.milestone.as_ref().is_some_and(|re| re.is_match(line)) {
			signals.push(StreamSignal::MilestoneReached);
		}

		if self
			.benign_errors
			.iter()
			.any(|needle| line.contains(needle.as_str()))
		{
			signals.push(StreamSignal::BenignStartupError);
		}

		if let Some(path) = self
			.result_location
			.as_ref()
			.and_then(|re| re.captures(line))
			.and_then(|caps| caps.name("path").or_else(|| caps.get(1)))
		{
			signals.push(StreamSignal::ResultLocationDiscovered(PathBuf::from(
				path.as_str().trim(),
			)));
		}

		if self.alert.as_ref().is_some_and(|re| re.is_match(line)) {
			signals.push(StreamSignal::Alert(line.to_owned()));
		}

		if self.ready.as_ref().is_some_and(|re| re.is_match(line)) {
			signals.push(StreamSignal::Ready);
		}

		signals
	}
}

/// The result of feeding a chunk to a [`Classifier`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classified {
	/// The completed lines of the chunk with buffering noise removed.
	pub text: String,

	/// Signals derived from those lines, in stream order.
	pub signals: Vec<StreamSignal>,
}

/// Stateful line classifier for one output stream.
///
/// Bytes are buffered until a newline completes a line, so markers which straddle a chunk
/// boundary are matched exactly once, when their line completes. Each line is classified once.
#[derive(Debug)]
pub struct Classifier {
	patterns: ClassifierPatterns,
	partial: Vec<u8>,
}

impl Classifier {
	/// Create a classifier for a stream.
	#[must_use]
	pub const fn new(patterns: ClassifierPatterns) -> Self {
		Self {
			patterns,
			partial: Vec::new(),
		}
	}

	/// Feed a raw chunk.
	pub fn feed(&mut self, chunk: &[u8]) -> Classified {
		self.partial.extend_from_slice(chunk);
		let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
			return Classified::default();
		};

		let rest = self.partial.split_off(last_newline + 1);
		let complete = std::mem::replace(&mut self.partial, rest);
		self.classify(&complete)
	}

	/// Flush whatever partial line remains, as at the end of the stream.
	pub fn finish(&mut self) -> Classified {
		let remaining = std::mem::take(&mut self.partial);
		self.classify(&remaining)
	}

	fn classify(&self, bytes: &[u8]) -> Classified {
		let decoded = String::from_utf8_lossy(bytes);
		let mut out = Classified::default();
		for line in decoded.split_inclusive('\n') {
			let content = line.trim_end_matches(['\n', '\r']);
			if is_buffering_noise(content) {
				continue;
			}

			out.text.push_str(line);
			out.signals.extend(self.patterns.signals_for(content));
		}
		out
	}
}

/// The worker pads its output with lines made of `*` when it flushes its buffers.
fn is_buffering_noise(line: &str) -> bool {
	!line.is_empty() && line.bytes().all(|b| b == b'*')
}

/// Read a stream to its end, logging its cleaned lines and passing signals to `on_signal`.
pub(crate) async fn pump<R, F>(
	mut reader: R,
	kind: StreamKind,
	patterns: ClassifierPatterns,
	mut on_signal: F,
) where
	R: AsyncRead + Unpin,
	F: FnMut(StreamSignal),
{
	let mut classifier = Classifier::new(patterns);
	let mut buf = vec![0_u8; 8192];

	loop {
		let classified = match reader.read(&mut buf).await {
			Ok(0) => {
				trace!(stream=%kind, "stream ended");
				break;
			}
			Ok(n) => classifier.feed(&buf[..n]),
			Err(err) => {
				debug!(stream=%kind, %err, "error reading worker stream");
				break;
			}
		};
		emit(kind, classified, &mut on_signal);
	}

	emit(kind, classifier.finish(), &mut on_signal);
}

fn emit(kind: StreamKind, classified: Classified, on_signal: &mut impl FnMut(StreamSignal)) {
	for line in classified.text.lines() {
		debug!(stream=%kind, "{line}");
	}
	for signal in classified.signals {
		trace!(stream=%kind, ?signal, "stream signal");
		on_signal(signal);
	}
}

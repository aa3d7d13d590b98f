//! Reconciler event types (spec §4.I "Reconciler framework").

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
	Create,
	Write,
	Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
	/// File name relative to the watch root, e.g. `"104.pid"`.
	pub name: String,
	pub op: FileOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
	File(FileEvent),
	/// The periodic `sync_delay` timer tick.
	Timer,
}

/// Two events are considered equal iff same type and key (spec §4.I); a
/// re-enqueue under the same key replaces the pending entry in the retry
/// queue rather than appending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryKey {
	kind: &'static str,
	key: String,
}

impl ReconcileEvent {
	pub fn retry_key(&self) -> RetryKey {
		match self {
			ReconcileEvent::File(e) => RetryKey {
				kind: "file",
				key: e.name.clone(),
			},
			ReconcileEvent::Timer => RetryKey {
				kind: "timer",
				key: "sync".to_string(),
			},
		}
	}
}

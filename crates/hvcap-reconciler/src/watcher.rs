//! File-system watcher (spec §4.I): wraps `notify`'s callback-based API and
//! bridges it onto a Tokio channel the reconciler's `select!` loop can poll.

use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::events::{FileEvent, FileOp};
use crate::handler::ReconcilerError;

/// Holds the live `notify` watcher so it isn't dropped (and torn down)
/// while the reconciler loop is still consuming its events.
pub struct FsWatcher {
	_inner: RecommendedWatcher,
}

impl FsWatcher {
	pub fn spawn(path: &Path) -> Result<(Self, UnboundedReceiver<FileEvent>), ReconcilerError> {
		let (tx, rx) = mpsc::unbounded_channel();

		let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
			let Ok(event) = res else { return };
			for file_event in translate(&event) {
				// The reconciler may have already shut down and dropped its
				// receiver; nothing to do but drop the event.
				let _ = tx.send(file_event);
			}
		})?;

		watcher.watch(path, RecursiveMode::NonRecursive)?;

		Ok((Self { _inner: watcher }, rx))
	}
}

/// One `notify::Event` can carry several paths (e.g. a rename); this maps
/// each to the filename-only `FileEvent` the reconciler keys retries on.
fn translate(event: &Event) -> Vec<FileEvent> {
	let op = match event.kind {
		EventKind::Create(_) => FileOp::Create,
		EventKind::Modify(_) => FileOp::Write,
		EventKind::Remove(_) => FileOp::Remove,
		_ => return Vec::new(),
	};

	event
		.paths
		.iter()
		.filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
		.map(|name| FileEvent { name, op })
		.collect()
}

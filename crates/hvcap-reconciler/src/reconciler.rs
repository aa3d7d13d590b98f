//! The central reconciler framework (spec §4.I): a single cooperative loop
//! driving a handler off file-watch events, a periodic sync timer, and a
//! retry queue, in the spirit of the teacher's `tokio::select!` WebSocket
//! relay in `pegboard-gateway`, generalized from two race arms to four.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::ReconcileEvent;
use crate::handler::{Handler, ReconcilerError};
use crate::queue::{RetryPolicy, RetryQueue};
use crate::watcher::FsWatcher;

pub struct Reconciler {
	watch_path: PathBuf,
	sync_delay: Duration,
	retry: RetryPolicy,
	queue_capacity: usize,
	handler: Arc<dyn Handler>,
}

impl Reconciler {
	pub fn new(watch_path: impl Into<PathBuf>, sync_delay: Duration, retry: RetryPolicy, queue_capacity: usize, handler: Arc<dyn Handler>) -> Self {
		Self {
			watch_path: watch_path.into(),
			sync_delay,
			retry,
			queue_capacity,
			handler,
		}
	}

	/// Runs until `cancel` fires. Stops the watcher and timer, then returns;
	/// the caller decides how long to wait for this to happen (spec §4.I
	/// "shutdown timeout bounds drain").
	pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReconcilerError> {
		let (_watcher, mut file_rx) = FsWatcher::spawn(&self.watch_path)?;
		let mut ticker = tokio::time::interval(self.sync_delay);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let mut queue = RetryQueue::new(self.queue_capacity);

		loop {
			let next_retry = queue
				.next_deadline()
				.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

			tokio::select! {
				_ = cancel.cancelled() => {
					tracing::info!("reconciler received shutdown signal");
					break;
				}
				_ = ticker.tick() => {
					self.dispatch(ReconcileEvent::Timer, &mut queue).await;
				}
				Some(event) = file_rx.recv() => {
					self.dispatch(ReconcileEvent::File(event), &mut queue).await;
				}
				_ = tokio::time::sleep_until(next_retry), if !queue.is_empty() => {
					for pending in queue.drain_due(Instant::now()) {
						self.retry_one(pending, &mut queue).await;
					}
				}
			}
		}

		Ok(())
	}

	async fn dispatch(&self, event: ReconcileEvent, queue: &mut RetryQueue) {
		if let Err(err) = self.handler.handle(&event).await {
			tracing::warn!(error = %err, "handler failed, scheduling retry");
			let not_before = Instant::now() + self.retry.delay_for(0);
			queue.schedule(event, 1, not_before);
		}
	}

	async fn retry_one(&self, pending: crate::queue::PendingRetry, queue: &mut RetryQueue) {
		match self.handler.handle(&pending.event).await {
			Ok(()) => {}
			Err(err) => {
				if pending.attempt >= self.retry.max_retries {
					tracing::error!(attempt = pending.attempt, error = %err, "giving up after max retries");
					return;
				}
				let not_before = Instant::now() + self.retry.delay_for(pending.attempt);
				queue.schedule(pending.event, pending.attempt + 1, not_before);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::FileEvent;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct CountingHandler {
		calls: AtomicUsize,
		fail_first: usize,
	}

	#[async_trait]
	impl Handler for CountingHandler {
		async fn handle(&self, _event: &ReconcileEvent) -> Result<(), ReconcilerError> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			if n < self.fail_first {
				return Err(ReconcilerError::HandlerFailure("synthetic failure".to_string()));
			}
			Ok(())
		}
	}

	#[tokio::test]
	async fn run_stops_promptly_on_cancellation() {
		let dir = tempfile::tempdir().unwrap();
		let handler = Arc::new(CountingHandler {
			calls: AtomicUsize::new(0),
			fail_first: 0,
		});
		let reconciler = Reconciler::new(
			dir.path(),
			Duration::from_secs(3600),
			RetryPolicy::default(),
			16,
			handler,
		);

		let cancel = CancellationToken::new();
		let cancel_clone = cancel.clone();
		let handle = tokio::spawn(async move { reconciler.run(cancel_clone).await });

		cancel.cancel();
		let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
		assert!(result.is_ok(), "reconciler did not stop within timeout");
	}

	#[tokio::test]
	async fn dispatch_schedules_retry_on_handler_failure() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicUsize::new(0),
			fail_first: 1,
		});
		let reconciler = Reconciler::new(
			"/run/qemu-server",
			Duration::from_secs(3600),
			RetryPolicy::default(),
			16,
			handler,
		);

		let mut queue = RetryQueue::new(16);
		let event = ReconcileEvent::File(FileEvent {
			name: "104.pid".to_string(),
			op: crate::events::FileOp::Write,
		});
		reconciler.dispatch(event, &mut queue).await;
		assert_eq!(queue.len(), 1);
	}

	#[tokio::test]
	async fn retry_one_drops_event_after_max_retries() {
		let handler = Arc::new(CountingHandler {
			calls: AtomicUsize::new(0),
			fail_first: usize::MAX,
		});
		let retry = RetryPolicy {
			max_retries: 2,
			..RetryPolicy::default()
		};
		let reconciler = Reconciler::new("/run/qemu-server", Duration::from_secs(3600), retry, 16, handler);

		let mut queue = RetryQueue::new(16);
		let pending = crate::queue::PendingRetry {
			event: ReconcileEvent::Timer,
			attempt: 2,
			not_before: Instant::now(),
		};
		reconciler.retry_one(pending, &mut queue).await;
		assert!(queue.is_empty());
	}
}

//! Bounded retry queue (spec §4.I): re-enqueuing the same key in place,
//! exponential backoff, and a hard cap on `max_retries`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::events::{ReconcileEvent, RetryKey};

/// `base=2s, max_delay=30s, max_retries=5` are the spec's stated defaults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub base: Duration,
	pub max_delay: Duration,
	pub max_retries: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base: Duration::from_secs(2),
			max_delay: Duration::from_secs(30),
			max_retries: 5,
		}
	}
}

impl RetryPolicy {
	/// `base * 2^attempt`, clamped to `max_delay`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let factor = 2f64.powi(attempt.min(32) as i32);
		let scaled = self.base.as_secs_f64() * factor;
		Duration::from_secs_f64(scaled).min(self.max_delay)
	}
}

pub struct PendingRetry {
	pub event: ReconcileEvent,
	pub attempt: u32,
	pub not_before: Instant,
}

/// Bounded in-memory queue of retryable events, keyed by [`RetryKey`]. A
/// `schedule` call for a key already present replaces it in place instead of
/// appending (spec §4.I).
pub struct RetryQueue {
	capacity: usize,
	entries: HashMap<RetryKey, PendingRetry>,
}

impl RetryQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			entries: HashMap::new(),
		}
	}

	/// Returns `false` (and drops the event) if the queue is at capacity and
	/// `event`'s key is not already present.
	pub fn schedule(&mut self, event: ReconcileEvent, attempt: u32, not_before: Instant) -> bool {
		let key = event.retry_key();
		if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
			return false;
		}
		self.entries.insert(key, PendingRetry { event, attempt, not_before });
		true
	}

	/// Removes and returns every entry whose `not_before` has elapsed.
	pub fn drain_due(&mut self, now: Instant) -> Vec<PendingRetry> {
		let due: Vec<RetryKey> = self
			.entries
			.iter()
			.filter(|(_, p)| p.not_before <= now)
			.map(|(k, _)| k.clone())
			.collect();
		due.into_iter().filter_map(|k| self.entries.remove(&k)).collect()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.values().map(|p| p.not_before).min()
	}
}

//! The handler seam the reconciler framework drives (spec §4.I).

use async_trait::async_trait;
use thiserror::Error;

use crate::events::ReconcileEvent;

#[derive(Debug, Error)]
pub enum ReconcilerError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("watcher error: {0}")]
	Watch(#[from] notify::Error),

	#[error("handler failed: {0}")]
	HandlerFailure(String),

	#[error("invalid input: {0}")]
	InvalidInput(String),
}

/// Implemented by whatever logic the reconciler framework should run on each
/// event. Failures are retried with exponential backoff by the framework;
/// the handler itself need not implement retry.
#[async_trait]
pub trait Handler: Send + Sync {
	async fn handle(&self, event: &ReconcileEvent) -> Result<(), ReconcilerError>;
}

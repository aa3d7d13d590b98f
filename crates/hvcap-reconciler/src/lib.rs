//! Host reconciler (spec §4.I): a file-watch + retry-queue cooperative loop
//! framework, and the thread-pinning/IRQ-steering handler that runs on each
//! hypervisor host.

mod events;
mod handler;
mod host;
mod queue;
mod reconciler;
mod watcher;

pub use events::{FileEvent, FileOp, ReconcileEvent, RetryKey};
pub use handler::{Handler, ReconcilerError};
pub use host::HostPinner;
pub use queue::{PendingRetry, RetryPolicy, RetryQueue};
pub use reconciler::Reconciler;
pub use watcher::FsWatcher;

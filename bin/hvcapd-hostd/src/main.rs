//! Host reconciler daemon: watches `<vmid>.pid` files under `--watch-path`
//! and pins guest vCPU threads and their passed-through device IRQs to the
//! cores declared in each guest's config.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::{consts::signal::SIGINT, consts::signal::SIGTERM, iterator::Signals};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use hvcap_config::FeatureFlags;
use hvcap_reconciler::{HostPinner, Reconciler, RetryPolicy};

/// Thread-pinning and IRQ-steering reconciler for a single hypervisor host.
#[derive(Parser)]
#[command(name = "hvcapd-hostd", version, about)]
struct Cli {
	/// Directory containing `<vmid>.pid` files to watch.
	#[arg(long, env = "WATCH_PATH", default_value = "/run/qemu-server")]
	watch_path: PathBuf,

	/// Directory containing `<vmid>.conf` guest configuration files.
	#[arg(long, env = "CONFIG_PATH", default_value = "/etc/pve/qemu-server")]
	config_path: PathBuf,

	/// Maximum retry attempts for a failed reconcile event before it is dropped.
	#[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
	max_retries: u32,

	/// Periodic full-resync interval, in seconds.
	#[arg(long, env = "RESYNC_INTERVAL", default_value_t = 3600)]
	resync_interval: u64,

	/// Log verbosity: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
	#[arg(long, env = "VERBOSITY", default_value_t = 1)]
	verbosity: u8,
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbosity);

	let flags = FeatureFlags::from_env();
	tracing::info!(flags = flags.len(), "loaded feature flags");

	let retry = RetryPolicy {
		max_retries: cli.max_retries,
		..RetryPolicy::default()
	};

	let handler = Arc::new(HostPinner::new(cli.watch_path.clone(), cli.config_path.clone()));
	let reconciler = Reconciler::new(
		cli.watch_path,
		Duration::from_secs(cli.resync_interval),
		retry,
		1024,
		handler,
	);

	let cancel = CancellationToken::new();
	spawn_signal_thread(cancel.clone());

	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
	match runtime.block_on(reconciler.run(cancel)) {
		Ok(()) => {
			tracing::info!("hvcapd-hostd shut down cleanly");
			Ok(())
		}
		Err(err) => {
			tracing::error!(error = %err, "reconciler exited with error");
			std::process::exit(1);
		}
	}
}

/// Mirrors the teacher's SIGTERM-forwarding thread
/// (`packages/infra/job-runner/src/main.rs`), but cancels a
/// `CancellationToken` instead of forwarding the signal to a child process.
fn spawn_signal_thread(cancel: CancellationToken) {
	let mut signals = match Signals::new([SIGTERM, SIGINT]) {
		Ok(signals) => signals,
		Err(err) => {
			tracing::warn!(error = %err, "failed to install signal handler, shutdown via signal disabled");
			return;
		}
	};

	thread::spawn(move || {
		if signals.forever().next().is_some() {
			tracing::info!("received shutdown signal");
			cancel.cancel();
		}
	});
}

fn init_tracing(verbosity: u8) {
	let level = match verbosity {
		0 => tracing_subscriber::filter::LevelFilter::WARN,
		1 => tracing_subscriber::filter::LevelFilter::INFO,
		2 => tracing_subscriber::filter::LevelFilter::DEBUG,
		_ => tracing_subscriber::filter::LevelFilter::TRACE,
	};

	tracing_subscriber::registry()
		.with(tracing_logfmt::builder().layer().with_filter(level))
		.init();
}

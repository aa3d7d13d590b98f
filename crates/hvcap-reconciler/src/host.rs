//! Host-side pinning/IRQ-steering handler (spec §4.I). Runs on each
//! hypervisor host, not in the control plane: on `CREATE`/`WRITE` of a
//! `<vmid>.pid` file it pins the guest's `"CPU"` threads to its declared
//! affinity, raises the CPU-frequency governor on those CPUs, and steers the
//! IRQs of any passed-through PCI devices onto the same set.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hvcap_topology::{CpuId, CpuSet};
use nix::sched::{sched_setaffinity, CpuSet as NixCpuSet};
use nix::unistd::Pid;

use crate::events::{FileEvent, FileOp, ReconcileEvent};
use crate::handler::{Handler, ReconcilerError};

const GOVERNOR: &str = "performance";

/// Declared guest affinity and core count, read from the hypervisor-side VM
/// config (spec §4.I: "from VM config or the `affinity=` token in its
/// description").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct DeclaredConfig {
	affinity: Option<CpuSet>,
	cores: Option<u32>,
}

/// Pins guest vCPU threads and steers VFIO IRQs for guests observed via the
/// reconciler's file watch (spec §4.I).
pub struct HostPinner {
	watch_path: PathBuf,
	config_dir: PathBuf,
}

impl HostPinner {
	/// `watch_path` is where `<vmid>.pid` files appear (default
	/// `/run/qemu-server`); `config_dir` is where the matching `<vmid>.conf`
	/// hypervisor config lives (default `/etc/pve/qemu-server`).
	pub fn new(watch_path: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
		Self {
			watch_path: watch_path.into(),
			config_dir: config_dir.into(),
		}
	}

	async fn handle_pid_file(&self, vmid: u64) -> Result<(), ReconcilerError> {
		let pid_path = self.watch_path.join(format!("{vmid}.pid"));
		let pid_str = tokio::fs::read_to_string(&pid_path).await?;
		let pid: i32 = pid_str
			.trim()
			.parse()
			.map_err(|_| ReconcilerError::InvalidInput(format!("{vmid}.pid does not contain an integer pid")))?;

		if !Path::new(&format!("/proc/{pid}")).exists() {
			return Err(ReconcilerError::HandlerFailure(format!("pid {pid} (vmid {vmid}) no longer exists")));
		}

		let config = self.read_declared_config(vmid).await?;
		let Some(affinity) = config.affinity else {
			tracing::debug!(vmid, "no declared affinity, skipping pin");
			return Ok(());
		};
		let Some(cores) = config.cores else {
			tracing::debug!(vmid, "no declared core count, skipping pin");
			return Ok(());
		};

		if affinity.len() != cores as usize {
			tracing::warn!(
				vmid,
				affinity_len = affinity.len(),
				cores,
				"affinity set size does not match declared core count, skipping pin"
			);
			return Ok(());
		}

		let cpu_threads = self.cpu_threads(pid).await?;
		let affinity_ids: Vec<CpuId> = affinity.iter().collect();

		for (k, tid) in cpu_threads.iter().enumerate() {
			if let Some(&cpu) = affinity_ids.get(k) {
				pin_thread(*tid, cpu)?;
			}
		}

		for cpu in &affinity_ids {
			raise_governor(*cpu).await;
		}

		let cmdline = tokio::fs::read(format!("/proc/{pid}/cmdline")).await?;
		for bdf in vfio_bdfs(&cmdline) {
			for irq in irqs_for_bdf(&bdf).await {
				write_smp_affinity(irq, &affinity_ids).await;
			}
		}

		Ok(())
	}

	async fn read_declared_config(&self, vmid: u64) -> Result<DeclaredConfig, ReconcilerError> {
		let path = self.config_dir.join(format!("{vmid}.conf"));
		let contents = match tokio::fs::read_to_string(&path).await {
			Ok(c) => c,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(DeclaredConfig::default()),
			Err(err) => return Err(err.into()),
		};

		let mut config = DeclaredConfig::default();
		for line in contents.lines() {
			let Some((key, value)) = line.split_once(':') else { continue };
			let key = key.trim();
			let value = value.trim();
			match key {
				"affinity" => config.affinity = CpuSet::parse(value).ok(),
				"cores" => config.cores = value.parse().ok(),
				"description" => {
					if config.affinity.is_none() {
						config.affinity = extract_affinity_token(value);
					}
				}
				_ => {}
			}
		}
		Ok(config)
	}

	/// Threads under `/proc/<pid>/task` whose `comm` contains `"CPU"`,
	/// sorted by tid (the ordering spec §4.I implies but does not name
	/// explicitly; lowest tid is assumed to be vCPU 0).
	async fn cpu_threads(&self, pid: i32) -> Result<Vec<i32>, ReconcilerError> {
		let task_dir = format!("/proc/{pid}/task");
		let mut entries = tokio::fs::read_dir(&task_dir).await?;
		let mut threads = Vec::new();

		while let Some(entry) = entries.next_entry().await? {
			let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() else {
				continue;
			};
			let comm_path = format!("{task_dir}/{tid}/comm");
			if let Ok(comm) = tokio::fs::read_to_string(&comm_path).await {
				if comm.contains("CPU") {
					threads.push(tid);
				}
			}
		}
		threads.sort_unstable();
		Ok(threads)
	}
}

#[async_trait]
impl Handler for HostPinner {
	async fn handle(&self, event: &ReconcileEvent) -> Result<(), ReconcilerError> {
		let ReconcileEvent::File(FileEvent { name, op }) = event else {
			return Ok(());
		};

		if *op == FileOp::Remove {
			return Ok(());
		}

		let Some(vmid_str) = name.strip_suffix(".pid") else {
			return Ok(());
		};
		let Ok(vmid) = vmid_str.parse::<u64>() else {
			return Ok(());
		};

		self.handle_pid_file(vmid).await
	}
}

fn extract_affinity_token(description: &str) -> Option<CpuSet> {
	let idx = description.find("affinity=")?;
	let rest = &description[idx + "affinity=".len()..];
	let token: String = rest.chars().take_while(|c| !c.is_whitespace() && *c != ',').collect();
	CpuSet::parse(&token).ok()
}

fn pin_thread(tid: i32, cpu: CpuId) -> Result<(), ReconcilerError> {
	let mut set = NixCpuSet::new();
	set.set(cpu as usize)
		.map_err(|e| ReconcilerError::HandlerFailure(format!("invalid cpu id {cpu}: {e}")))?;
	sched_setaffinity(Pid::from_raw(tid), &set)
		.map_err(|e| ReconcilerError::HandlerFailure(format!("failed to pin thread {tid} to cpu {cpu}: {e}")))?;
	Ok(())
}

async fn raise_governor(cpu: CpuId) {
	let base = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq");
	let available = match tokio::fs::read_to_string(format!("{base}/scaling_available_governors")).await {
		Ok(s) => s,
		Err(_) => return,
	};
	if !available.split_whitespace().any(|g| g == GOVERNOR) {
		return;
	}
	if let Err(err) = tokio::fs::write(format!("{base}/scaling_governor"), GOVERNOR).await {
		tracing::warn!(cpu, error = %err, "failed to set cpu governor");
	}
}

/// Scans NUL-separated argv for `-device vfio-pci,host=<bdf>,...` tokens.
fn vfio_bdfs(cmdline: &[u8]) -> Vec<String> {
	cmdline
		.split(|&b| b == 0)
		.filter_map(|tok| std::str::from_utf8(tok).ok())
		.filter(|tok| tok.starts_with("vfio-pci,"))
		.filter_map(|tok| {
			tok.split(',').find_map(|kv| kv.strip_prefix("host=")).map(|s| s.to_string())
		})
		.collect()
}

async fn irqs_for_bdf(bdf: &str) -> Vec<u32> {
	let msi_dir = format!("/sys/bus/pci/devices/{bdf}/msi_irqs");
	if let Ok(mut entries) = tokio::fs::read_dir(&msi_dir).await {
		let mut irqs = Vec::new();
		while let Ok(Some(entry)) = entries.next_entry().await {
			if let Ok(irq) = entry.file_name().to_string_lossy().parse::<u32>() {
				irqs.push(irq);
			}
		}
		if !irqs.is_empty() {
			return irqs;
		}
	}

	// Fall back to scanning /proc/interrupts for a line whose description
	// mentions this bdf.
	let Ok(contents) = tokio::fs::read_to_string("/proc/interrupts").await else {
		return Vec::new();
	};
	contents
		.lines()
		.filter(|line| line.contains(bdf))
		.filter_map(|line| line.split_once(':').map(|(irq, _)| irq.trim()))
		.filter_map(|irq| irq.parse().ok())
		.collect()
}

async fn write_smp_affinity(irq: u32, cpus: &[CpuId]) {
	let list = CpuSet::from_ids(cpus.iter().copied()).to_range_string();
	let path = format!("/proc/irq/{irq}/smp_affinity_list");
	if let Err(err) = tokio::fs::write(&path, format!("{list}\n")).await {
		tracing::warn!(irq, error = %err, "failed to steer irq affinity");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extract_affinity_token_reads_up_to_next_comma() {
		let desc = "autogenerated, affinity=0-3,8, do not edit";
		assert_eq!(extract_affinity_token(desc), Some(CpuSet::parse("0-3,8").unwrap()));
	}

	#[test]
	fn extract_affinity_token_absent_returns_none() {
		assert_eq!(extract_affinity_token("plain description"), None);
	}

	#[test]
	fn vfio_bdfs_extracts_host_field() {
		let cmdline = b"qemu-system-x86_64\0-device\0vfio-pci,host=0000:01:00.0,id=hostdev0\0-m\08192\0";
		assert_eq!(vfio_bdfs(cmdline), vec!["0000:01:00.0".to_string()]);
	}

	#[test]
	fn vfio_bdfs_ignores_unrelated_devices() {
		let cmdline = b"qemu-system-x86_64\0-device\0virtio-net-pci,netdev=net0\0";
		assert!(vfio_bdfs(cmdline).is_empty());
	}

	#[tokio::test]
	async fn read_declared_config_parses_affinity_and_cores() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("104.conf"), "cores: 4\naffinity: 0-3\nname: test-vm\n")
			.await
			.unwrap();

		let pinner = HostPinner::new("/run/qemu-server", dir.path());
		let config = pinner.read_declared_config(104).await.unwrap();
		assert_eq!(config.cores, Some(4));
		assert_eq!(config.affinity, Some(CpuSet::parse("0-3").unwrap()));
	}

	#[tokio::test]
	async fn read_declared_config_falls_back_to_description_token() {
		let dir = tempfile::tempdir().unwrap();
		tokio::fs::write(dir.path().join("105.conf"), "cores: 2\ndescription: affinity=4-5, managed by hvcapd\n")
			.await
			.unwrap();

		let pinner = HostPinner::new("/run/qemu-server", dir.path());
		let config = pinner.read_declared_config(105).await.unwrap();
		assert_eq!(config.affinity, Some(CpuSet::parse("4-5").unwrap()));
	}

	#[tokio::test]
	async fn read_declared_config_missing_file_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let pinner = HostPinner::new("/run/qemu-server", dir.path());
		let config = pinner.read_declared_config(999).await.unwrap();
		assert_eq!(config, DeclaredConfig::default());
	}

	#[tokio::test]
	async fn handle_ignores_non_integer_pid_filenames() {
		let pinner = HostPinner::new("/run/qemu-server", "/etc/pve/qemu-server");
		let event = ReconcileEvent::File(FileEvent {
			name: "not-a-vmid.pid".to_string(),
			op: FileOp::Write,
		});
		assert!(pinner.handle(&event).await.is_ok());
	}

	#[tokio::test]
	async fn handle_ignores_remove_events() {
		let pinner = HostPinner::new("/run/qemu-server", "/etc/pve/qemu-server");
		let event = ReconcileEvent::File(FileEvent {
			name: "104.pid".to_string(),
			op: FileOp::Remove,
		});
		assert!(pinner.handle(&event).await.is_ok());
	}

	#[tokio::test]
	async fn handle_ignores_timer_events() {
		let pinner = HostPinner::new("/run/qemu-server", "/etc/pve/qemu-server");
		assert!(pinner.handle(&ReconcileEvent::Timer).await.is_ok());
	}
}

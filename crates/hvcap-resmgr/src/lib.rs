//! Per-zone resource manager (spec §4.E): composes one CPU policy and one
//! memory policy behind a single allocate/allocate_or_update/release
//! contract, replaying the zone's current VM inventory at construction time
//! so the manager's view matches hypervisor reality at startup.

use hvcap_policy::cpu::{CpuPolicy, SimpleCpuPolicy, StaticCpuOptions, StaticCpuPolicy};
use hvcap_policy::memory::{MemoryPolicy, SimpleMemoryPolicy, StaticMemoryPolicy};
use hvcap_policy::PolicyError;
use hvcap_topology::discovery::{self, HypervisorSummary, NodeSettingsFile};
use hvcap_topology::{CpuSet, TopologyError};
use hvcap_vmresource::VmResource;
use thiserror::Error;

/// Selects which policy family a zone's resource manager is built with. Read
/// once at process startup and threaded through constructors (spec §9
/// "Global state": no hidden globals in hot paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodePolicy {
	#[default]
	Simple,
	Static,
}

#[derive(Debug, Error)]
pub enum ResourceManagerError {
	#[error("topology: {0}")]
	Topology(#[from] TopologyError),

	#[error(transparent)]
	Policy(#[from] PolicyError),

	#[error("invalid request: {0}")]
	InvalidInput(String),
}

/// A running guest reported by the hypervisor, replayed into the manager's
/// bookkeeping at construction. The concrete hypervisor HTTP client that
/// produces this list is out of scope (spec §1); this is the named external
/// interface it is accessed through.
pub trait HypervisorInventory {
	fn running_vms(&self) -> Vec<VmResource>;
}

/// One per zone (spec §4.E). Owns the CPU and memory policy instances and is
/// the only mutator of a zone's free capacity.
pub struct ResourceManager {
	zone: String,
	region: String,
	cpu: Box<dyn CpuPolicy>,
	memory: Box<dyn MemoryPolicy>,
}

impl ResourceManager {
	/// Builds a manager for `(region, zone)`: loads node-settings (falling
	/// back to `"*"`), discovers topology, instantiates one CPU and one
	/// memory policy per `policy`, then replays `inventory`'s currently
	/// running VMs via `allocate_or_update` so the manager's view matches the
	/// hypervisor at startup.
	pub fn new(
		region: &str,
		zone: &str,
		node_settings_file: Option<&NodeSettingsFile>,
		summary: Option<&HypervisorSummary>,
		policy: NodePolicy,
		inventory: &dyn HypervisorInventory,
	) -> Result<Self, ResourceManagerError> {
		let settings = node_settings_file.and_then(|f| f.lookup(region, zone));
		let discovered = discovery::discover(settings, summary)?;

		let reserved_cpus = settings
			.map(|s| CpuSet::from_ids(s.reservedcpus.iter().copied()))
			.unwrap_or_default();
		let reserved_memory = settings.and_then(|s| s.reservedmemory).unwrap_or(0);

		let (cpu, memory): (Box<dyn CpuPolicy>, Box<dyn MemoryPolicy>) = match policy {
			NodePolicy::Simple => (
				Box::new(SimpleCpuPolicy::new(discovered.cpu.all_cpus(), reserved_cpus)),
				Box::new(SimpleMemoryPolicy::new(
					discovered.memory.total_memory_bytes(),
					reserved_memory,
				)),
			),
			NodePolicy::Static => (
				Box::new(StaticCpuPolicy::new(
					discovered.cpu.clone(),
					reserved_cpus,
					StaticCpuOptions::default(),
				)),
				Box::new(StaticMemoryPolicy::new(&discovered.memory, reserved_memory)),
			),
		};

		let mut mgr = Self {
			zone: zone.to_string(),
			region: region.to_string(),
			cpu,
			memory,
		};

		for mut vm in inventory.running_vms() {
			if let Err(err) = mgr.allocate_or_update(&mut vm) {
				tracing::warn!(
					region = %mgr.region,
					zone = %mgr.zone,
					vm_id = vm.id,
					error = %err,
					"failed to replay running vm into resource manager at startup"
				);
			}
		}

		Ok(mgr)
	}

	fn validate(req: &VmResource) -> Result<(), ResourceManagerError> {
		if req.cpus == 0 || req.memory_bytes == 0 {
			return Err(ResourceManagerError::InvalidInput(
				"request must have cpus > 0 and memory != 0".to_string(),
			));
		}
		Ok(())
	}

	/// CPU first, then memory; if memory fails after CPU succeeded, the CPU
	/// allocation is rolled back before returning (spec §4.E ordering).
	pub fn allocate(&mut self, req: &mut VmResource) -> Result<(), ResourceManagerError> {
		Self::validate(req)?;

		self.cpu.allocate(req)?;
		if let Err(err) = self.memory.allocate(req) {
			// Roll back the CPU side; this cannot itself fail, the exact
			// set/count we just allocated still matches `req`.
			let _ = self.cpu.release(req);
			return Err(err.into());
		}
		Ok(())
	}

	pub fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), ResourceManagerError> {
		Self::validate(req)?;

		self.cpu.allocate_or_update(req)?;
		if let Err(err) = self.memory.allocate_or_update(req) {
			let _ = self.cpu.release(req);
			return Err(err.into());
		}
		Ok(())
	}

	/// Invalid inputs (`cpus == 0` or `memory == 0`) silently succeed on
	/// release, per spec §4.E.
	pub fn release(&mut self, req: &VmResource) -> Result<(), ResourceManagerError> {
		if req.cpus == 0 || req.memory_bytes == 0 {
			return Ok(());
		}

		self.cpu.release(req)?;
		self.memory.release(req)?;
		Ok(())
	}

	pub fn available_cpus(&self) -> u32 {
		self.cpu.available_cpus()
	}

	pub fn available_memory(&self) -> u64 {
		self.memory.available_memory()
	}

	pub fn zone(&self) -> &str {
		&self.zone
	}

	pub fn region(&self) -> &str {
		&self.region
	}

	/// Single human-readable string summarizing both policies (spec §4.E).
	pub fn status(&self) -> String {
		format!("{} | {}", self.cpu.status(), self.memory.status())
	}
}

//! Immutable CPU/memory/NUMA topology model (spec §3, §4.A) and the
//! discovery heuristics that build one (spec §4.B).

mod cpuset;
pub mod discovery;

pub use cpuset::{CpuId, CpuSet};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type CoreId = u32;
pub type SocketId = u32;
pub type NumaId = u32;
pub type UncoreId = u32;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TopologyError {
	#[error("invalid cpu range: {0}")]
	InvalidCpuRange(String),

	#[error("unknown cpu id: {0}")]
	UnknownCpu(CpuId),

	#[error("incomplete settings/cpu info: {0}")]
	Incomplete(String),

	#[error("invalid topology: {0}")]
	Invalid(String),
}

/// Per-CPU placement within the socket/core/NUMA/uncore hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuDetail {
	pub core_id: CoreId,
	pub socket_id: SocketId,
	pub numa_node_id: NumaId,
	pub uncore_cache_id: UncoreId,
}

/// Immutable once built. See spec §3 "CPU topology" for invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
	num_cpus: usize,
	num_sockets: usize,
	num_cores: usize,
	num_numa_nodes: usize,
	num_uncore_caches: usize,
	cpus: BTreeMap<CpuId, CpuDetail>,
}

impl CpuTopology {
	/// Validates the invariants from spec §3 and constructs the topology.
	pub fn new(cpus: BTreeMap<CpuId, CpuDetail>) -> Result<Self, TopologyError> {
		if cpus.is_empty() {
			return Err(TopologyError::Incomplete("no cpus in map".to_string()));
		}

		let num_cpus = cpus.len();
		let num_cores = cpus.values().map(|d| d.core_id).collect::<BTreeSet<_>>().len();
		let num_sockets = cpus
			.values()
			.map(|d| d.socket_id)
			.collect::<BTreeSet<_>>()
			.len();
		let num_numa_nodes = cpus
			.values()
			.map(|d| d.numa_node_id)
			.collect::<BTreeSet<_>>()
			.len();
		let num_uncore_caches = cpus
			.values()
			.map(|d| d.uncore_cache_id)
			.collect::<BTreeSet<_>>()
			.len();

		if num_cores > num_cpus {
			return Err(TopologyError::Invalid(format!(
				"num_cores ({num_cores}) > num_cpus ({num_cpus})"
			)));
		}
		if num_sockets > num_cores {
			return Err(TopologyError::Invalid(format!(
				"num_sockets ({num_sockets}) > num_cores ({num_cores})"
			)));
		}
		if num_numa_nodes == 0 {
			return Err(TopologyError::Invalid("num_numa_nodes == 0".to_string()));
		}

		Ok(Self {
			num_cpus,
			num_sockets,
			num_cores,
			num_numa_nodes,
			num_uncore_caches,
			cpus,
		})
	}

	pub fn num_cpus(&self) -> usize {
		self.num_cpus
	}

	pub fn num_sockets(&self) -> usize {
		self.num_sockets
	}

	pub fn num_cores(&self) -> usize {
		self.num_cores
	}

	pub fn num_numa_nodes(&self) -> usize {
		self.num_numa_nodes
	}

	pub fn num_uncore_caches(&self) -> usize {
		self.num_uncore_caches
	}

	pub fn all_cpus(&self) -> CpuSet {
		CpuSet::from_ids(self.cpus.keys().copied())
	}

	pub fn detail(&self, cpu: CpuId) -> Result<CpuDetail, TopologyError> {
		self.cpus.get(&cpu).copied().ok_or(TopologyError::UnknownCpu(cpu))
	}

	pub fn cpu_core_id(&self, cpu: CpuId) -> Result<CoreId, TopologyError> {
		self.detail(cpu).map(|d| d.core_id)
	}

	pub fn cpu_socket_id(&self, cpu: CpuId) -> Result<SocketId, TopologyError> {
		self.detail(cpu).map(|d| d.socket_id)
	}

	pub fn cpu_numa_id(&self, cpu: CpuId) -> Result<NumaId, TopologyError> {
		self.detail(cpu).map(|d| d.numa_node_id)
	}

	fn filter_by(&self, pred: impl Fn(&CpuDetail) -> bool) -> CpuSet {
		self.cpus
			.iter()
			.filter(|(_, d)| pred(d))
			.map(|(cpu, _)| *cpu)
			.collect()
	}

	pub fn cpus_in_socket(&self, sockets: &[SocketId]) -> CpuSet {
		self.filter_by(|d| sockets.contains(&d.socket_id))
	}

	pub fn cpus_in_numa(&self, numas: &[NumaId]) -> CpuSet {
		self.filter_by(|d| numas.contains(&d.numa_node_id))
	}

	pub fn cpus_in_uncore(&self, uncores: &[UncoreId]) -> CpuSet {
		self.filter_by(|d| uncores.contains(&d.uncore_cache_id))
	}

	pub fn cpus_in_core(&self, cores: &[CoreId]) -> CpuSet {
		self.filter_by(|d| cores.contains(&d.core_id))
	}

	pub fn sockets(&self) -> BTreeSet<SocketId> {
		self.cpus.values().map(|d| d.socket_id).collect()
	}

	pub fn numa_nodes(&self) -> BTreeSet<NumaId> {
		self.cpus.values().map(|d| d.numa_node_id).collect()
	}

	pub fn cores(&self) -> BTreeSet<CoreId> {
		self.cpus.values().map(|d| d.core_id).collect()
	}

	pub fn uncore_caches(&self) -> BTreeSet<UncoreId> {
		self.cpus.values().map(|d| d.uncore_cache_id).collect()
	}

	pub fn numa_in_sockets(&self, sockets: &[SocketId]) -> BTreeSet<NumaId> {
		self.cpus
			.values()
			.filter(|d| sockets.contains(&d.socket_id))
			.map(|d| d.numa_node_id)
			.collect()
	}

	pub fn sockets_in_numa(&self, numas: &[NumaId]) -> BTreeSet<SocketId> {
		self.cpus
			.values()
			.filter(|d| numas.contains(&d.numa_node_id))
			.map(|d| d.socket_id)
			.collect()
	}

	/// Restricts `set` to CPU ids known to this topology.
	pub fn keep_only(&self, set: &CpuSet) -> CpuSet {
		set.intersection(&self.all_cpus())
	}

	/// One-line human summary, used in `status()` output and startup logs.
	pub fn render(&self) -> String {
		format!(
			"{}cpu/{}core/{}socket/{}numa/{}uncore",
			self.num_cpus, self.num_cores, self.num_sockets, self.num_numa_nodes, self.num_uncore_caches
		)
	}
}

/// Immutable once built. See spec §3 "Memory topology".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTopology {
	total_memory_bytes: u64,
	per_numa_bytes: BTreeMap<NumaId, u64>,
}

impl MemoryTopology {
	/// `per_numa_bytes` may be empty when NUMA memory breakdown is unknown;
	/// otherwise its sum must equal `total_memory_bytes`.
	pub fn new(total_memory_bytes: u64, per_numa_bytes: BTreeMap<NumaId, u64>) -> Result<Self, TopologyError> {
		if !per_numa_bytes.is_empty() {
			let sum: u64 = per_numa_bytes.values().sum();
			if sum != total_memory_bytes {
				return Err(TopologyError::Invalid(format!(
					"numa memory sum ({sum}) != total ({total_memory_bytes})"
				)));
			}
		}

		Ok(Self {
			total_memory_bytes,
			per_numa_bytes,
		})
	}

	pub fn total_memory_bytes(&self) -> u64 {
		self.total_memory_bytes
	}

	pub fn numa_bytes(&self, node: NumaId) -> Option<u64> {
		self.per_numa_bytes.get(&node).copied()
	}

	pub fn per_numa_bytes(&self) -> &BTreeMap<NumaId, u64> {
		&self.per_numa_bytes
	}

	pub fn has_numa_breakdown(&self) -> bool {
		!self.per_numa_bytes.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flat_topology(num_cpus: u32, num_cores: u32) -> CpuTopology {
		let mut cpus = BTreeMap::new();
		for cpu in 0..num_cpus {
			cpus.insert(
				cpu,
				CpuDetail {
					core_id: cpu % num_cores,
					socket_id: 0,
					numa_node_id: 0,
					uncore_cache_id: 0,
				},
			);
		}
		CpuTopology::new(cpus).unwrap()
	}

	#[test]
	fn scenario_1_eight_cpu_four_core_single_socket() {
		// spec §8 scenario 1: cpus=8, cores=4, sockets=1.
		let topo = flat_topology(8, 4);
		assert_eq!(topo.num_numa_nodes(), 1);
		assert_eq!(topo.num_uncore_caches(), 1);
		for cpu in 0..8 {
			assert_eq!(topo.cpu_core_id(cpu).unwrap(), cpu % 4);
		}
	}

	#[test]
	fn unknown_cpu_fails() {
		let topo = flat_topology(4, 4);
		assert_eq!(topo.cpu_core_id(99), Err(TopologyError::UnknownCpu(99)));
	}

	#[test]
	fn keep_only_restricts_to_known_cpus() {
		let topo = flat_topology(4, 4);
		let requested = CpuSet::from_ids([0, 1, 2, 99]);
		assert_eq!(topo.keep_only(&requested), CpuSet::from_ids([0, 1, 2]));
	}

	#[test]
	fn memory_topology_rejects_mismatched_sum() {
		let mut per_numa = BTreeMap::new();
		per_numa.insert(0, 10);
		per_numa.insert(1, 10);
		assert!(MemoryTopology::new(30, per_numa).is_err());
	}

	#[test]
	fn memory_topology_allows_empty_breakdown() {
		let mt = MemoryTopology::new(64, BTreeMap::new()).unwrap();
		assert!(!mt.has_numa_breakdown());
		assert_eq!(mt.total_memory_bytes(), 64);
	}
}

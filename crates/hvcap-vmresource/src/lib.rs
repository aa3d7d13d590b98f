//! The VM resource descriptor (spec §3) — mutable at the resource-manager
//! boundary, produced/consumed by the VM config codec (spec §4.G).

use std::collections::BTreeMap;

use hvcap_topology::{CpuSet, NumaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumaPolicyKind {
	Bind,
	Preferred,
	Interleave,
}

impl NumaPolicyKind {
	pub fn as_wire_str(&self) -> &'static str {
		match self {
			NumaPolicyKind::Bind => "bind",
			NumaPolicyKind::Preferred => "preferred",
			NumaPolicyKind::Interleave => "interleave",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"bind" => Some(Self::Bind),
			"preferred" => Some(Self::Preferred),
			"interleave" => Some(Self::Interleave),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaAllocation {
	pub cpus: CpuSet,
	pub memory_mb: u64,
	pub policy: Option<NumaPolicyKind>,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum VmResourceError {
	#[error("numa node {0} cpu set is not a subset of the descriptor's cpu_set")]
	NumaCpusNotSubset(NumaId),

	#[error("numa memory entries sum to {sum} bytes, expected {expected}")]
	NumaMemoryMismatch { sum: u64, expected: u64 },

	#[error("cpu count {cpus} does not match pinned cpu_set size {set_len}")]
	CpuCountMismatch { cpus: u32, set_len: usize },
}

/// Mutable resource descriptor for a single VM (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResource {
	/// 0 means "not yet assigned".
	pub id: u64,
	pub cpus: u32,
	pub memory_bytes: u64,
	pub disk_gb: u32,
	pub storage_id: String,
	/// Empty means floating; non-empty means pinned to these physical CPUs.
	pub cpu_set: CpuSet,
	pub numa_nodes: BTreeMap<NumaId, NumaAllocation>,
}

impl VmResource {
	pub fn new(cpus: u32, memory_bytes: u64) -> Self {
		Self {
			cpus,
			memory_bytes,
			..Default::default()
		}
	}

	pub fn is_pinned(&self) -> bool {
		!self.cpu_set.is_empty()
	}

	/// Checks the invariants from spec §3.
	pub fn validate(&self) -> Result<(), VmResourceError> {
		if self.is_pinned() {
			for (numa_id, alloc) in &self.numa_nodes {
				if !alloc.cpus.is_subset(&self.cpu_set) {
					return Err(VmResourceError::NumaCpusNotSubset(*numa_id));
				}
			}
			if self.cpus as usize != self.cpu_set.len() {
				return Err(VmResourceError::CpuCountMismatch {
					cpus: self.cpus,
					set_len: self.cpu_set.len(),
				});
			}
		}

		if !self.numa_nodes.is_empty() {
			let sum: u64 = self.numa_nodes.values().map(|a| a.memory_mb * MIB).sum();
			if sum != self.memory_bytes {
				return Err(VmResourceError::NumaMemoryMismatch {
					sum,
					expected: self.memory_bytes,
				});
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validate_accepts_floating_request() {
		let req = VmResource::new(4, 4 * 1024 * MIB);
		assert!(req.validate().is_ok());
	}

	#[test]
	fn validate_rejects_numa_cpus_outside_pinned_set() {
		let mut req = VmResource::new(2, 2 * 1024 * MIB);
		req.cpu_set = CpuSet::from_ids([0, 1]);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: CpuSet::from_ids([0, 5]),
				memory_mb: 2048,
				policy: Some(NumaPolicyKind::Bind),
			},
		);
		assert!(matches!(
			req.validate(),
			Err(VmResourceError::NumaCpusNotSubset(0))
		));
	}

	#[test]
	fn validate_rejects_mismatched_numa_memory_sum() {
		let mut req = VmResource::new(2, 4096 * MIB);
		req.cpu_set = CpuSet::from_ids([0, 1]);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: CpuSet::from_ids([0, 1]),
				memory_mb: 2048,
				policy: None,
			},
		);
		assert!(matches!(
			req.validate(),
			Err(VmResourceError::NumaMemoryMismatch { .. })
		));
	}
}

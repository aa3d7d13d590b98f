use std::collections::BTreeMap;

use hvcap_topology::{MemoryTopology, NumaId};
use hvcap_vmresource::{VmResource, MIB};

use crate::PolicyError;

/// Shared contract from spec §4.D.
pub trait MemoryPolicy: Send + Sync {
	fn status(&self) -> String;
	fn available_memory(&self) -> u64;
	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError>;
	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError>;
	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError>;
}

fn validate_request(req: &VmResource) -> Result<(), PolicyError> {
	if req.memory_bytes == 0 {
		return Err(PolicyError::InvalidInput("request has zero memory".to_string()));
	}
	Ok(())
}

/// No NUMA awareness (spec §4.D "Simple memory").
#[derive(Debug, Clone)]
pub struct SimpleMemoryPolicy {
	max_memory: u64,
	assigned_memory: u64,
}

impl SimpleMemoryPolicy {
	pub fn new(total_memory_bytes: u64, reserved_memory_bytes: u64) -> Self {
		Self {
			max_memory: total_memory_bytes.saturating_sub(reserved_memory_bytes),
			assigned_memory: 0,
		}
	}
}

impl MemoryPolicy for SimpleMemoryPolicy {
	fn status(&self) -> String {
		format!(
			"simple memory policy: max={} assigned={} free={}",
			self.max_memory,
			self.assigned_memory,
			self.available_memory()
		)
	}

	fn available_memory(&self) -> u64 {
		self.max_memory.saturating_sub(self.assigned_memory)
	}

	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		validate_request(req)?;
		let available = self.available_memory();
		if req.memory_bytes > available {
			return Err(PolicyError::NotEnoughMemory {
				requested: req.memory_bytes,
				available,
			});
		}
		self.assigned_memory += req.memory_bytes;
		Ok(())
	}

	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		self.allocate(req)
	}

	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError> {
		if self.assigned_memory < req.memory_bytes {
			return Err(PolicyError::ReleaseUnderflow(
				"assigned_memory underflow on release".to_string(),
			));
		}
		self.assigned_memory -= req.memory_bytes;
		Ok(())
	}
}

/// Per-NUMA breakdown on top of the simple counter (spec §4.D "Static
/// memory").
#[derive(Debug, Clone)]
pub struct StaticMemoryPolicy {
	max_memory: u64,
	assigned_memory: u64,
	per_numa_available: BTreeMap<NumaId, u64>,
}

impl StaticMemoryPolicy {
	pub fn new(topology: &MemoryTopology, reserved_memory_bytes: u64) -> Self {
		let max_memory = topology.total_memory_bytes().saturating_sub(reserved_memory_bytes);
		Self {
			max_memory,
			assigned_memory: 0,
			per_numa_available: topology.per_numa_bytes().clone(),
		}
	}

	fn allocate_inner(&mut self, req: &mut VmResource, fabricate_missing: bool) -> Result<(), PolicyError> {
		validate_request(req)?;
		let available = self.available_memory();
		if req.memory_bytes > available {
			return Err(PolicyError::NotEnoughMemory {
				requested: req.memory_bytes,
				available,
			});
		}

		if req.numa_nodes.is_empty() {
			self.assigned_memory += req.memory_bytes;
			return Ok(());
		}

		let missing: Vec<NumaId> = req
			.numa_nodes
			.iter()
			.filter(|(_, a)| a.memory_mb == 0)
			.map(|(n, _)| *n)
			.collect();

		if !missing.is_empty() {
			if !fabricate_missing {
				// allocate_or_update never fabricates (spec §4.D, §9.3): fall
				// through and let the zero entries be honored as zero.
			} else {
				let per_entry_mb = (req.memory_bytes / MIB) / req.numa_nodes.len() as u64;
				for numa in &missing {
					if let Some(alloc) = req.numa_nodes.get_mut(numa) {
						alloc.memory_mb = per_entry_mb;
					}
				}
			}
		}

		let declared_sum: u64 = req
			.numa_nodes
			.values()
			.filter(|a| a.memory_mb != 0)
			.map(|a| a.memory_mb * MIB)
			.sum();
		let any_specified = req.numa_nodes.values().any(|a| a.memory_mb != 0);
		if any_specified && declared_sum != req.memory_bytes {
			return Err(PolicyError::InvalidInput(format!(
				"numa memory entries sum to {declared_sum}, expected {}",
				req.memory_bytes
			)));
		}

		// Verify per-node availability before mutating any bookkeeping, so a
		// failure midway never leaves a partial decrement behind.
		for (numa, alloc) in req.numa_nodes.iter() {
			if alloc.memory_mb == 0 {
				continue;
			}
			let bytes = alloc.memory_mb * MIB;
			let avail = self.per_numa_available.get(numa).copied().unwrap_or(0);
			if bytes > avail {
				return Err(PolicyError::NotEnoughNumaMemory {
					numa_node: *numa,
					requested: bytes,
					available: avail,
				});
			}
		}

		for (numa, alloc) in req.numa_nodes.iter() {
			if alloc.memory_mb == 0 {
				continue;
			}
			let bytes = alloc.memory_mb * MIB;
			*self.per_numa_available.entry(*numa).or_insert(0) -= bytes;
		}
		self.assigned_memory += req.memory_bytes;
		Ok(())
	}
}

impl MemoryPolicy for StaticMemoryPolicy {
	fn status(&self) -> String {
		format!(
			"static memory policy: max={} assigned={} free={} per_numa={:?}",
			self.max_memory,
			self.assigned_memory,
			self.available_memory(),
			self.per_numa_available
		)
	}

	fn available_memory(&self) -> u64 {
		self.max_memory.saturating_sub(self.assigned_memory)
	}

	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		self.allocate_inner(req, true)
	}

	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		self.allocate_inner(req, false)
	}

	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError> {
		if self.assigned_memory < req.memory_bytes {
			return Err(PolicyError::ReleaseUnderflow(
				"assigned_memory underflow on release".to_string(),
			));
		}

		for (numa, alloc) in req.numa_nodes.iter() {
			if alloc.memory_mb == 0 {
				continue;
			}
			let bytes = alloc.memory_mb * MIB;
			let entry = self.per_numa_available.entry(*numa).or_insert(0);
			*entry += bytes;
		}
		self.assigned_memory -= req.memory_bytes;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hvcap_vmresource::NumaAllocation;

	#[test]
	fn simple_policy_allocate_and_exhaust() {
		let mut policy = SimpleMemoryPolicy::new(16 * 1024 * MIB, 0);
		let mut req = VmResource::new(1, 8 * 1024 * MIB);
		policy.allocate(&mut req).unwrap();
		assert_eq!(policy.available_memory(), 8 * 1024 * MIB);

		let mut req2 = VmResource::new(1, 16 * 1024 * MIB);
		assert_eq!(
			policy.allocate(&mut req2),
			Err(PolicyError::NotEnoughMemory {
				requested: 16 * 1024 * MIB,
				available: 8 * 1024 * MIB
			})
		);
	}

	#[test]
	fn simple_policy_round_trip() {
		let mut policy = SimpleMemoryPolicy::new(16 * 1024 * MIB, 0);
		let before = policy.status();
		let mut req = VmResource::new(1, 4 * 1024 * MIB);
		policy.allocate(&mut req).unwrap();
		policy.release(&req).unwrap();
		assert_eq!(policy.status(), before);
	}

	fn dual_numa_topology() -> MemoryTopology {
		let mut per_numa = BTreeMap::new();
		per_numa.insert(0, 32 * 1024 * MIB);
		per_numa.insert(1, 32 * 1024 * MIB);
		MemoryTopology::new(64 * 1024 * MIB, per_numa).unwrap()
	}

	#[test]
	fn static_policy_fills_missing_per_numa_on_allocate() {
		let topo = dual_numa_topology();
		let mut policy = StaticMemoryPolicy::new(&topo, 0);

		let mut req = VmResource::new(4, 8 * 1024 * MIB);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 0,
				policy: None,
			},
		);
		req.numa_nodes.insert(
			1,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 0,
				policy: None,
			},
		);
		policy.allocate(&mut req).unwrap();
		assert_eq!(req.numa_nodes[&0].memory_mb, 4096);
		assert_eq!(req.numa_nodes[&1].memory_mb, 4096);
	}

	#[test]
	fn static_policy_allocate_or_update_does_not_fabricate() {
		let topo = dual_numa_topology();
		let mut policy = StaticMemoryPolicy::new(&topo, 0);

		let mut req = VmResource::new(4, 8 * 1024 * MIB);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 0,
				policy: None,
			},
		);
		// allocate_or_update never fills missing entries (spec §9.3): the
		// zero-valued entry stays zero and nothing is drawn from node 0.
		policy.allocate_or_update(&mut req).unwrap();
		assert_eq!(req.numa_nodes[&0].memory_mb, 0);
	}

	#[test]
	fn static_policy_numa_balance_invariant() {
		let topo = dual_numa_topology();
		let mut policy = StaticMemoryPolicy::new(&topo, 0);

		let mut req = VmResource::new(4, 16 * 1024 * MIB);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 8192,
				policy: None,
			},
		);
		req.numa_nodes.insert(
			1,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 8192,
				policy: None,
			},
		);
		policy.allocate(&mut req).unwrap();

		let sum_per_numa: u64 = policy.per_numa_available.values().sum();
		assert_eq!(sum_per_numa, policy.max_memory - policy.assigned_memory);

		policy.release(&req).unwrap();
		let sum_per_numa: u64 = policy.per_numa_available.values().sum();
		assert_eq!(sum_per_numa, policy.max_memory - policy.assigned_memory);
	}

	#[test]
	fn static_policy_rejects_numa_local_overallocation() {
		let topo = dual_numa_topology();
		let mut policy = StaticMemoryPolicy::new(&topo, 0);

		let mut req = VmResource::new(4, 64 * 1024 * MIB);
		req.numa_nodes.insert(
			0,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 64 * 1024,
				policy: None,
			},
		);
		req.numa_nodes.insert(
			1,
			NumaAllocation {
				cpus: Default::default(),
				memory_mb: 0,
				policy: None,
			},
		);
		let err = policy.allocate(&mut req).unwrap_err();
		assert!(matches!(err, PolicyError::NotEnoughNumaMemory { numa_node: 0, .. }));
	}
}

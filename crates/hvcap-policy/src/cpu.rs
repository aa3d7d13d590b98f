use hvcap_topology::{CpuId, CpuSet, CpuTopology};
use hvcap_vmresource::{NumaAllocation, NumaPolicyKind, VmResource};

use crate::PolicyError;

/// Bookkeeping shared by both CPU policy variants (spec §4.C).
#[derive(Debug, Clone)]
struct CpuBook {
	all_cpus: CpuSet,
	reserved_cpus: CpuSet,
	used_cpus: CpuSet,
	assigned_cpus: u32,
}

impl CpuBook {
	fn new(all_cpus: CpuSet, reserved_cpus: CpuSet) -> Self {
		let reserved_cpus = reserved_cpus.intersection(&all_cpus);
		Self {
			all_cpus,
			reserved_cpus,
			used_cpus: CpuSet::new(),
			assigned_cpus: 0,
		}
	}

	fn available_cpus(&self) -> u32 {
		let total = self.all_cpus.len() as i64;
		let reserved = self.reserved_cpus.len() as i64;
		let used = self.used_cpus.len() as i64;
		let assigned = self.assigned_cpus as i64;
		(total - reserved - used - assigned).max(0) as u32
	}

	fn status(&self, name: &str) -> String {
		format!(
			"{name}: total={} reserved={} used={} assigned={} free={}",
			self.all_cpus.len(),
			self.reserved_cpus.len(),
			self.used_cpus.len(),
			self.assigned_cpus,
			self.available_cpus()
		)
	}
}

/// Shared contract from spec §4.C.
pub trait CpuPolicy: Send + Sync {
	fn name(&self) -> &'static str;
	fn status(&self) -> String;
	fn available_cpus(&self) -> u32;
	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError>;
	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError>;
	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError>;
}

fn validate_request(req: &VmResource) -> Result<(), PolicyError> {
	if req.cpus == 0 && req.cpu_set.is_empty() {
		return Err(PolicyError::InvalidInput("request has zero cpus".to_string()));
	}
	Ok(())
}

/// No topology awareness (spec §4.C "Simple policy").
#[derive(Debug, Clone)]
pub struct SimpleCpuPolicy {
	book: CpuBook,
}

impl SimpleCpuPolicy {
	pub fn new(all_cpus: CpuSet, reserved_cpus: CpuSet) -> Self {
		Self {
			book: CpuBook::new(all_cpus, reserved_cpus),
		}
	}
}

impl CpuPolicy for SimpleCpuPolicy {
	fn name(&self) -> &'static str {
		"simple"
	}

	fn status(&self) -> String {
		self.book.status("simple cpu policy")
	}

	fn available_cpus(&self) -> u32 {
		self.book.available_cpus()
	}

	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		validate_request(req)?;
		let available = self.book.available_cpus();
		if req.cpus > available {
			return Err(PolicyError::NotEnoughCpus {
				requested: req.cpus,
				available,
			});
		}
		self.book.assigned_cpus += req.cpus;
		Ok(())
	}

	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		validate_request(req)?;
		if req.cpu_set.is_empty() {
			return self.allocate(req);
		}
		let fresh = req.cpu_set.difference(&self.book.reserved_cpus);
		self.book.used_cpus.extend(&fresh);
		Ok(())
	}

	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError> {
		if !req.cpu_set.is_empty() {
			for cpu in req.cpu_set.iter() {
				self.book.used_cpus.remove(cpu);
			}
			Ok(())
		} else {
			if self.book.assigned_cpus < req.cpus {
				return Err(PolicyError::ReleaseUnderflow(
					"assigned_cpus underflow on release".to_string(),
				));
			}
			self.book.assigned_cpus -= req.cpus;
			Ok(())
		}
	}
}

/// NUMA- and cache-aware pinning (spec §4.C "Static policy").
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCpuOptions {
	pub full_physical_only: bool,
	pub distribute_across_numa: bool,
	pub distribute_across_cores: bool,
	pub prefer_align_by_uncore: bool,
}

#[derive(Debug, Clone)]
pub struct StaticCpuPolicy {
	book: CpuBook,
	topology: CpuTopology,
	options: StaticCpuOptions,
}

impl StaticCpuPolicy {
	pub fn new(topology: CpuTopology, reserved_cpus: CpuSet, options: StaticCpuOptions) -> Self {
		let all = topology.all_cpus();
		Self {
			book: CpuBook::new(all, reserved_cpus),
			topology,
			options,
		}
	}

	fn available_in_numa(&self, numa: hvcap_topology::NumaId) -> CpuSet {
		self.topology
			.cpus_in_numa(&[numa])
			.difference(&self.book.reserved_cpus)
			.difference(&self.book.used_cpus)
	}

	/// Orders candidate CPUs within a NUMA node per the tie-break rules in
	/// spec §4.C: same uncore cache preferred when enabled, physical cores
	/// before SMT siblings unless `distribute_across_cores`, lowest CPU id
	/// last as the final tie-break.
	fn order_candidates(&self, candidates: &CpuSet) -> Vec<CpuId> {
		let num_cores = self.topology.num_cores() as u32;
		let mut cpus: Vec<CpuId> = candidates.iter().collect();
		cpus.sort_by_key(|&cpu| {
			let detail = self.topology.detail(cpu).ok();
			let uncore = if self.options.prefer_align_by_uncore {
				detail.map(|d| d.uncore_cache_id).unwrap_or(u32::MAX)
			} else {
				0
			};
			let is_sibling = if self.options.distribute_across_cores {
				0
			} else if cpu >= num_cores {
				1
			} else {
				0
			};
			(uncore, is_sibling, cpu)
		});
		cpus
	}

	/// Picks `count` CPUs from `numa`, preferring to stay within one NUMA
	/// node; splits across additional NUMA nodes only when
	/// `distribute_across_numa` is set and the first node can't satisfy the
	/// whole request.
	fn pick_cpu_set(&self, count: u32) -> Result<(CpuSet, Vec<(hvcap_topology::NumaId, CpuSet)>), PolicyError> {
		let mut numas: Vec<hvcap_topology::NumaId> = self.topology.numa_nodes().into_iter().collect();
		let mut free_by_numa: Vec<(hvcap_topology::NumaId, CpuSet)> = numas
			.drain(..)
			.map(|n| (n, self.available_in_numa(n)))
			.collect();
		// Lowest numa id first, but prefer the node with the largest free set.
		free_by_numa.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

		if let Some((numa, free)) = free_by_numa.iter().find(|(_, free)| free.len() as u32 >= count) {
			let ordered = self.order_candidates(free);
			let chosen: CpuSet = ordered.into_iter().take(count as usize).collect();
			return Ok((chosen.clone(), vec![(*numa, chosen)]));
		}

		if !self.options.distribute_across_numa {
			let available = self.available_cpus();
			return Err(PolicyError::NotEnoughCpus {
				requested: count,
				available,
			});
		}

		// Split across NUMA nodes, largest-free-first, in group-sized chunks.
		let group_size = if self.options.full_physical_only {
			let total_cpus = self.topology.num_cpus() as u32;
			let total_cores = self.topology.num_cores() as u32;
			if total_cores == 0 {
				1
			} else {
				(total_cpus / total_cores).max(1)
			}
		} else {
			1
		};

		let mut remaining = count;
		let mut picked_total = CpuSet::new();
		let mut per_numa = Vec::new();
		free_by_numa.sort_by(|a, b| a.0.cmp(&b.0));
		free_by_numa.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

		for (numa, free) in &free_by_numa {
			if remaining == 0 {
				break;
			}
			let take = remaining.min(free.len() as u32);
			let take = if group_size > 1 {
				(take / group_size) * group_size
			} else {
				take
			};
			if take == 0 {
				continue;
			}
			let ordered = self.order_candidates(free);
			let chosen: CpuSet = ordered.into_iter().take(take as usize).collect();
			picked_total.extend(&chosen);
			per_numa.push((*numa, chosen));
			remaining -= take;
		}

		if remaining > 0 {
			let available = self.available_cpus();
			return Err(PolicyError::NotEnoughCpus {
				requested: count,
				available,
			});
		}

		Ok((picked_total, per_numa))
	}
}

impl CpuPolicy for StaticCpuPolicy {
	fn name(&self) -> &'static str {
		"static"
	}

	fn status(&self) -> String {
		format!("{} ({})", self.book.status("static cpu policy"), self.topology.render())
	}

	fn available_cpus(&self) -> u32 {
		self.book.available_cpus()
	}

	fn allocate(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		validate_request(req)?;

		if !req.cpu_set.is_empty() {
			return self.allocate_or_update(req);
		}

		let (chosen, per_numa) = self.pick_cpu_set(req.cpus)?;
		self.book.used_cpus.extend(&chosen);
		req.cpu_set = chosen;
		for (numa, cpus) in per_numa {
			req.numa_nodes.insert(
				numa,
				NumaAllocation {
					cpus,
					memory_mb: 0,
					policy: Some(NumaPolicyKind::Bind),
				},
			);
		}
		Ok(())
	}

	fn allocate_or_update(&mut self, req: &mut VmResource) -> Result<(), PolicyError> {
		validate_request(req)?;
		if req.cpu_set.is_empty() {
			return self.allocate(req);
		}
		if req.cpu_set.len() > self.book.all_cpus.len() {
			return Err(PolicyError::CpuSetExceedsTotal);
		}
		let fresh = req.cpu_set.difference(&self.book.reserved_cpus);
		self.book.used_cpus.extend(&fresh);
		Ok(())
	}

	fn release(&mut self, req: &VmResource) -> Result<(), PolicyError> {
		if !req.cpu_set.is_empty() {
			let returned = req.cpu_set.difference(&self.book.reserved_cpus);
			for cpu in returned.iter() {
				self.book.used_cpus.remove(cpu);
			}
			Ok(())
		} else {
			if self.book.assigned_cpus < req.cpus {
				return Err(PolicyError::ReleaseUnderflow(
					"assigned_cpus underflow on release".to_string(),
				));
			}
			self.book.assigned_cpus -= req.cpus;
			Ok(())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hvcap_topology::{CpuDetail, CpuTopology};
	use std::collections::BTreeMap;

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
	fn scenario_3_simple_policy_allocate_and_exhaust() {
		let mut policy = SimpleCpuPolicy::new(CpuSet::from_ids(0..12), CpuSet::new());
		let mut req = VmResource::new(4, 0);
		policy.allocate(&mut req).unwrap();
		assert_eq!(policy.available_cpus(), 8);

		let mut req2 = VmResource::new(16, 0);
		let err = policy.allocate(&mut req2).unwrap_err();
		assert_eq!(
			err,
			PolicyError::NotEnoughCpus {
				requested: 16,
				available: 12
			}
		);
		assert_eq!(
			err.to_string(),
			"not enough CPUs available to satisfy request: requested=16, available=12"
		);
	}

	#[test]
	fn simple_policy_round_trip() {
		let mut policy = SimpleCpuPolicy::new(CpuSet::from_ids(0..8), CpuSet::new());
		let before = policy.status();
		let mut req = VmResource::new(3, 0);
		policy.allocate(&mut req).unwrap();
		policy.release(&req).unwrap();
		assert_eq!(policy.status(), before);
	}

	#[test]
	fn simple_policy_allocate_or_update_honors_pinned_set() {
		let mut policy = SimpleCpuPolicy::new(CpuSet::from_ids(0..8), CpuSet::from_ids([0, 1]));
		let mut req = VmResource::new(2, 0);
		req.cpu_set = CpuSet::from_ids([0, 2]);
		policy.allocate_or_update(&mut req).unwrap();
		// cpu 0 is reserved, so only cpu 2 lands in `used`.
		assert_eq!(policy.available_cpus(), 8 - 2 /* reserved */ - 1 /* used */);
	}

	#[test]
	fn scenario_4_static_policy_packs_physical_cores_first() {
		// 16 cpus, 8 cores, single socket/numa/uncore: cpus 0-7 are physical
		// cores, 8-15 their SMT siblings.
		let topo = flat_topology(16, 8);
		let mut policy = StaticCpuPolicy::new(topo, CpuSet::new(), StaticCpuOptions::default());

		let mut req = VmResource::new(4, 0);
		policy.allocate(&mut req).unwrap();

		assert_eq!(req.cpu_set, CpuSet::from_ids([0, 1, 2, 3]));
		let numa0 = req.numa_nodes.get(&0).unwrap();
		assert_eq!(numa0.cpus, CpuSet::from_ids([0, 1, 2, 3]));
		assert_eq!(numa0.policy, Some(NumaPolicyKind::Bind));

		let status_before_release = policy.status();
		policy.release(&req).unwrap();
		// After release, a second identical allocation reproduces the exact
		// same physical pinning (round-trip property, spec §8).
		let mut req2 = VmResource::new(4, 0);
		policy.allocate(&mut req2).unwrap();
		assert_eq!(req2.cpu_set, CpuSet::from_ids([0, 1, 2, 3]));
		policy.release(&req2).unwrap();
		assert_eq!(policy.status(), status_before_release);
	}

	#[test]
	fn static_policy_two_allocations_are_disjoint() {
		let topo = flat_topology(16, 8);
		let mut policy = StaticCpuPolicy::new(topo, CpuSet::new(), StaticCpuOptions::default());

		let mut req_a = VmResource::new(4, 0);
		policy.allocate(&mut req_a).unwrap();
		let mut req_b = VmResource::new(4, 0);
		policy.allocate(&mut req_b).unwrap();

		assert!(req_a.cpu_set.is_disjoint(&req_b.cpu_set));
	}

	#[test]
	fn static_policy_distribute_across_numa() {
		let mut cpus = BTreeMap::new();
		for cpu in 0..8u32 {
			cpus.insert(
				cpu,
				CpuDetail {
					core_id: cpu,
					socket_id: cpu / 4,
					numa_node_id: cpu / 4,
					uncore_cache_id: cpu / 4,
				},
			);
		}
		let topo = CpuTopology::new(cpus).unwrap();
		let options = StaticCpuOptions {
			distribute_across_numa: true,
			..Default::default()
		};
		let mut policy = StaticCpuPolicy::new(topo, CpuSet::new(), options);

		// 4 available per numa; request more than one numa alone can give.
		let mut req = VmResource::new(6, 0);
		policy.allocate(&mut req).unwrap();
		assert_eq!(req.cpu_set.len(), 6);
		assert_eq!(req.numa_nodes.len(), 2);
	}

	#[test]
	fn static_policy_allocate_or_update_rejects_oversized_set() {
		let topo = flat_topology(4, 4);
		let mut policy = StaticCpuPolicy::new(topo, CpuSet::new(), StaticCpuOptions::default());
		let mut req = VmResource::new(8, 0);
		req.cpu_set = CpuSet::from_ids(0..8);
		assert_eq!(
			policy.allocate_or_update(&mut req),
			Err(PolicyError::CpuSetExceedsTotal)
		);
	}
}

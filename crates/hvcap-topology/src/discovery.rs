//! Topology discovery (spec §4.B): operator node-settings, hypervisor
//! summary heuristics, and AMD EPYC vendor refinement, tried in that
//! priority order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CpuDetail, CpuId, CpuSet, CpuTopology, MemoryTopology, NumaId, TopologyError};

/// One NUMA entry of an operator node-settings record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumaSettingsEntry {
	/// CPU-range syntax, e.g. `"0-7,16-23"`.
	pub cpus: String,
	#[serde(default)]
	pub memsize: Option<u64>,
}

/// Per-zone (or wildcard) operator-supplied topology hint (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
	#[serde(default)]
	pub sockets: Option<u32>,
	#[serde(default)]
	pub threads: Option<u32>,
	#[serde(default)]
	pub uncorecaches: Option<u32>,
	#[serde(default)]
	pub nodes: BTreeMap<NumaId, NumaSettingsEntry>,
	#[serde(default)]
	pub reservedcpus: Vec<CpuId>,
	#[serde(default)]
	pub reservedmemory: Option<u64>,
}

/// `region -> (zone | "*") -> NodeSettings`, as loaded from the node-settings
/// file (spec §6). `"*"` is the per-region wildcard fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettingsFile(pub BTreeMap<String, BTreeMap<String, NodeSettings>>);

pub const WILDCARD_ZONE: &str = "*";

impl NodeSettingsFile {
	/// Exact `(region, zone)` match wins; `"*"` is the fallback. Missing
	/// region/zone returns `None` (empty settings), per spec §6.
	pub fn lookup(&self, region: &str, zone: &str) -> Option<&NodeSettings> {
		let zones = self.0.get(region)?;
		zones.get(zone).or_else(|| zones.get(WILDCARD_ZONE))
	}
}

/// Hypervisor-reported hardware summary (spec §4.B item 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorSummary {
	pub model: String,
	pub cpus: u32,
	pub cores: u32,
	pub sockets: u32,
	pub total_mem: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
	NodeSettings,
	HypervisorSummary,
	VendorRefined,
}

#[derive(Debug, Clone)]
pub struct Discovered {
	pub cpu: CpuTopology,
	pub memory: MemoryTopology,
	pub source: DiscoverySource,
}

/// Runs the three discovery inputs in priority order. Node-settings that are
/// merely absent fall through to the hypervisor summary; malformed
/// node-settings (bad range syntax, inconsistent memory) are a hard error.
pub fn discover(
	node_settings: Option<&NodeSettings>,
	summary: Option<&HypervisorSummary>,
) -> Result<Discovered, TopologyError> {
	if let Some(settings) = node_settings {
		if !settings.nodes.is_empty() && settings.sockets.is_some() {
			return from_node_settings(settings, summary);
		}
		debug!("node settings incomplete, falling back to hypervisor summary");
	}

	if let Some(summary) = summary {
		return from_hypervisor_summary(summary);
	}

	Err(TopologyError::Incomplete(
		"no sockets, no cores, or no NUMA entries available from any discovery input".to_string(),
	))
}

/// spec §4.B item 1. `summary.total_mem` is the fallback when every NUMA
/// entry omits `memsize` (spec §6: `memsize?` is optional) — split evenly
/// across the declared NUMA nodes, same remainder-to-last-node rule as the
/// hypervisor-summary heuristics below.
pub fn from_node_settings(
	settings: &NodeSettings,
	summary: Option<&HypervisorSummary>,
) -> Result<Discovered, TopologyError> {
	let sockets = settings
		.sockets
		.ok_or_else(|| TopologyError::Incomplete("missing sockets".to_string()))?;
	if settings.nodes.is_empty() {
		return Err(TopologyError::Incomplete("missing NUMA entries".to_string()));
	}

	let threads_per_core = settings.threads.unwrap_or(1).max(1);

	// Per-NUMA CPU sets, validated disjoint.
	let mut numa_cpus: BTreeMap<NumaId, CpuSet> = BTreeMap::new();
	let mut seen = CpuSet::new();
	let mut numa_mem: BTreeMap<NumaId, u64> = BTreeMap::new();
	for (numa_id, entry) in &settings.nodes {
		let set = CpuSet::parse(&entry.cpus)?;
		if !seen.is_disjoint(&set) {
			return Err(TopologyError::Invalid(format!(
				"numa node {numa_id} cpu range overlaps another numa node"
			)));
		}
		seen.extend(&set);
		numa_cpus.insert(*numa_id, set);
		if let Some(mem) = entry.memsize {
			numa_mem.insert(*numa_id, mem);
		}
	}

	let total_cpus = seen.len() as u32;
	if total_cpus == 0 {
		return Err(TopologyError::Incomplete("no cpus in any numa entry".to_string()));
	}
	if total_cpus % threads_per_core != 0 {
		return Err(TopologyError::Invalid(format!(
			"{total_cpus} cpus not evenly divisible by {threads_per_core} threads-per-core"
		)));
	}
	let num_cores = total_cpus / threads_per_core;
	if num_cores % sockets != 0 {
		return Err(TopologyError::Invalid(format!(
			"{num_cores} cores not evenly divisible by {sockets} sockets"
		)));
	}
	let per_socket_cores = num_cores / sockets;

	let uncore_caches = settings.uncorecaches.unwrap_or(1).max(1);
	if num_cores % uncore_caches != 0 {
		return Err(TopologyError::Invalid(format!(
			"{num_cores} cores not evenly divisible by {uncore_caches} uncore caches"
		)));
	}
	let per_cache_cores = num_cores / uncore_caches;

	// Siblings are not guaranteed to be numbered `[num_cores, 2*num_cores)` —
	// the canonical range example (`"0-7,16-23"`) puts them at 16-23 while
	// `num_cores` (local, within a `threads=2` entry) is 8. Sort each NUMA
	// entry's CPUs, split it into `threads_per_core` equal-size groups in
	// that sorted order, and assign each sibling the core id of whichever
	// physical CPU shares its position within the group — the first group is
	// the physical cores, later groups are its SMT siblings.
	let mut cpus = BTreeMap::new();
	let mut next_core_id: u32 = 0;
	for (numa_id, set) in &numa_cpus {
		let sorted: Vec<CpuId> = set.iter().collect();
		let entry_len = sorted.len() as u32;
		if entry_len % threads_per_core != 0 {
			return Err(TopologyError::Invalid(format!(
				"numa node {numa_id} has {entry_len} cpus, not evenly divisible by {threads_per_core} threads-per-core"
			)));
		}
		let physical_count = entry_len / threads_per_core;
		for (idx, cpu) in sorted.into_iter().enumerate() {
			let core_id = next_core_id + (idx as u32 % physical_count);
			let socket_id = core_id / per_socket_cores;
			let uncore_cache_id = core_id / per_cache_cores;
			cpus.insert(
				cpu,
				CpuDetail {
					core_id,
					socket_id,
					numa_node_id: *numa_id,
					uncore_cache_id,
				},
			);
		}
		next_core_id += physical_count;
	}

	let cpu_topology = CpuTopology::new(cpus)?;

	let total_mem = if numa_mem.is_empty() {
		summary.map(|s| s.total_mem).unwrap_or(0)
	} else {
		numa_mem.values().sum()
	};
	let numa_mem = if numa_mem.is_empty() {
		if let Some(summary) = summary {
			let share = summary.total_mem / numa_cpus.len().max(1) as u64;
			let mut per_numa = BTreeMap::new();
			let mut remaining = summary.total_mem;
			let last = *numa_cpus.keys().next_back().unwrap();
			for numa_id in numa_cpus.keys() {
				let amount = if *numa_id == last { remaining } else { share };
				per_numa.insert(*numa_id, amount);
				remaining = remaining.saturating_sub(amount);
			}
			per_numa
		} else {
			numa_mem
		}
	} else {
		numa_mem
	};
	let memory = MemoryTopology::new(total_mem, numa_mem)?;

	Ok(Discovered {
		cpu: cpu_topology,
		memory,
		source: DiscoverySource::NodeSettings,
	})
}

/// spec §4.B items 2 and 3 (vendor refinement is attempted first; falls
/// back to the generic heuristic when the model string doesn't match AMD
/// EPYC's `\dddd<letters>` pattern).
pub fn from_hypervisor_summary(summary: &HypervisorSummary) -> Result<Discovered, TopologyError> {
	if summary.cores == 0 || summary.sockets == 0 || summary.cpus == 0 {
		return Err(TopologyError::Incomplete(
			"hypervisor summary missing cores/sockets/cpus".to_string(),
		));
	}

	if let Some(epyc) = epyc_model_digits(&summary.model) {
		return from_epyc_summary(summary, epyc);
	}

	from_generic_summary(summary)
}

fn from_generic_summary(summary: &HypervisorSummary) -> Result<Discovered, TopologyError> {
	let sockets = summary.sockets.max(1);
	let per_socket_cores = summary.cores / sockets;

	let (num_numa_nodes, cpus_per_numa_cores) = if per_socket_cores > 16 {
		let divisor = [12u32, 10, 8, 6, 4]
			.into_iter()
			.find(|d| per_socket_cores % d == 0)
			.unwrap_or(per_socket_cores);
		(
			(summary.cores / divisor).max(1),
			divisor,
		)
	} else {
		(sockets, per_socket_cores.max(1))
	};
	let _ = cpus_per_numa_cores;

	let cores_per_numa = if num_numa_nodes > 0 {
		(summary.cores / num_numa_nodes).max(1)
	} else {
		summary.cores
	};

	let is_intel = summary.model.contains("Intel");

	let mut cpus = BTreeMap::new();
	for cpu in 0..summary.cpus {
		let core_id = cpu % summary.cores;
		let numa_node_id = core_id / cores_per_numa;
		let socket_id = core_id / per_socket_cores.max(1);
		let uncore_cache_id = if is_intel { 0 } else { core_id / 4 };
		cpus.insert(
			cpu,
			CpuDetail {
				core_id,
				socket_id,
				numa_node_id,
				uncore_cache_id,
			},
		);
	}

	let cpu_topology = CpuTopology::new(cpus)?;

	let mem_per_numa = summary.total_mem / num_numa_nodes as u64;
	let mut per_numa = BTreeMap::new();
	let mut remaining = summary.total_mem;
	for n in 0..num_numa_nodes {
		let share = if n + 1 == num_numa_nodes { remaining } else { mem_per_numa };
		per_numa.insert(n, share);
		remaining = remaining.saturating_sub(share);
	}
	let memory = MemoryTopology::new(summary.total_mem, per_numa)?;

	Ok(Discovered {
		cpu: cpu_topology,
		memory,
		source: DiscoverySource::HypervisorSummary,
	})
}

struct EpycDigits {
	family_digit: u32,
	sku_digit: u32,
}

/// Matches `AMD EPYC \dddd<letters>`. The "family digit" is the second of
/// the four digits, the "SKU digit" the third — this is how the 7xx2/7xx3/
/// 9xx4 generation+tier naming scheme lays the digits out.
fn epyc_model_digits(model: &str) -> Option<EpycDigits> {
	let idx = model.find("AMD EPYC")?;
	let rest = model[idx + "AMD EPYC".len()..].trim_start();
	let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
	if digits.len() != 4 {
		return None;
	}
	let has_trailing_letters = rest[digits.len()..]
		.chars()
		.next()
		.map(|c| c.is_ascii_alphabetic())
		.unwrap_or(false)
		|| rest.len() == digits.len();
	if !has_trailing_letters && !rest[digits.len()..].is_empty() && !rest.trim_start().is_empty() {
		// Followed by something other than a letter or nothing (e.g. more digits): not a match.
		if rest.as_bytes().get(digits.len()).map(|b| b.is_ascii_digit()).unwrap_or(false) {
			return None;
		}
	}

	let chars: Vec<u32> = digits.chars().map(|c| c.to_digit(10).unwrap()).collect();
	Some(EpycDigits {
		family_digit: chars[1],
		sku_digit: chars[2],
	})
}

fn from_epyc_summary(summary: &HypervisorSummary, epyc: EpycDigits) -> Result<Discovered, TopologyError> {
	let cores_per_ccx = match epyc.family_digit {
		2 | 3 => 4,
		4 => 6,
		5 | 6 | 7 | 8 => 8,
		_ => 4,
	};
	let numa_per_socket = match epyc.sku_digit {
		1 | 2 | 4 | 5 => 4,
		_ => 1,
	};

	let sockets = summary.sockets.max(1);
	let num_numa_nodes = sockets * numa_per_socket;
	if summary.cores % num_numa_nodes != 0 {
		return Err(TopologyError::Invalid(format!(
			"{} cores not evenly divisible by {num_numa_nodes} numa nodes",
			summary.cores
		)));
	}
	let cores_per_numa = summary.cores / num_numa_nodes;
	let ccx_per_numa = (cores_per_numa / cores_per_ccx).max(1);

	let mut cpus = BTreeMap::new();
	for cpu in 0..summary.cpus {
		let core_id = if cpu < summary.cores { cpu } else { cpu - summary.cores };
		let numa_node_id = core_id / cores_per_numa;
		let socket_id = numa_node_id / numa_per_socket;
		let local_core = core_id % cores_per_numa;
		let uncore_cache_id = numa_node_id * ccx_per_numa + local_core / cores_per_ccx;
		cpus.insert(
			cpu,
			CpuDetail {
				core_id,
				socket_id,
				numa_node_id,
				uncore_cache_id,
			},
		);
	}

	let cpu_topology = CpuTopology::new(cpus)?;

	let mem_per_numa = summary.total_mem / num_numa_nodes as u64;
	let mut per_numa = BTreeMap::new();
	let mut remaining = summary.total_mem;
	for n in 0..num_numa_nodes {
		let share = if n + 1 == num_numa_nodes { remaining } else { mem_per_numa };
		per_numa.insert(n, share);
		remaining = remaining.saturating_sub(share);
	}
	let memory = MemoryTopology::new(summary.total_mem, per_numa)?;

	Ok(Discovered {
		cpu: cpu_topology,
		memory,
		source: DiscoverySource::VendorRefined,
	})
}

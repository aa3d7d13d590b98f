//! VM resource codec (spec §4.G): parses a hypervisor VM config into a
//! [`VmResource`] and renders a `VmResource` back into hypervisor options.
//!
//! The NUMA token wire syntax (spec §6) is
//! `cpus=<range>,hostnodes=<range>,memory=<MiB>[,policy=bind|preferred|interleave]`,
//! where `cpus=` indexes the guest's own vCPU numbering (position within the
//! sorted `affinity` set), not physical CPU ids.

use std::collections::BTreeMap;

use hvcap_topology::{CpuId, CpuSet, NumaId};
use hvcap_vmresource::{NumaAllocation, NumaPolicyKind, VmResource, VmResourceError, MIB};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
	#[error("invalid numa token {0:?}: {1}")]
	InvalidNumaToken(String, String),

	#[error("numa entry declares an empty hostnode set")]
	EmptyHostnodes,

	#[error("numa cpu block of {cpus} guest cpus cannot be split evenly across {hostnodes} hostnodes")]
	UnevenSplit { cpus: usize, hostnodes: usize },

	#[error("guest cpu index {0} has no corresponding physical cpu in affinity")]
	AffinityIndexOutOfRange(u32),

	#[error("numa node {0} has an empty cpu set and cannot be encoded")]
	EmptyNumaCpuSet(NumaId),

	#[error("descriptor: {0}")]
	Resource(#[from] VmResourceError),

	#[error("topology: {0}")]
	Topology(#[from] hvcap_topology::TopologyError),
}

/// Raw hypervisor VM config, as read from the hypervisor's API (spec §4.G
/// decode input). NUMA entries are keyed by index (`numa0`, `numa1`, ...).
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
	pub cpus: u32,
	pub max_mem_bytes: u64,
	pub affinity: Option<String>,
	pub numa: Option<u32>,
	pub numa_entries: BTreeMap<u32, String>,
}

/// Hypervisor options rendered from a [`VmResource`] (spec §4.G encode
/// output). Memory is expressed in MiB on this side of the codec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmOptions {
	pub cores: u32,
	pub memory_mib: u64,
	pub affinity: Option<String>,
	pub numa: Option<u32>,
	pub numa_entries: BTreeMap<u32, String>,
}

struct NumaToken {
	cpus: CpuSet,
	hostnodes: CpuSet,
	memory_mib: u64,
	policy: Option<NumaPolicyKind>,
}

impl NumaToken {
	fn parse(raw: &str) -> Result<Self, CodecError> {
		let mut cpus = None;
		let mut hostnodes = None;
		let mut memory_mib = None;
		let mut policy = None;

		for field in raw.split(',') {
			let field = field.trim();
			if field.is_empty() {
				continue;
			}
			let (key, value) = field
				.split_once('=')
				.ok_or_else(|| CodecError::InvalidNumaToken(raw.to_string(), format!("malformed field {field:?}")))?;
			match key {
				"cpus" => {
					cpus = Some(CpuSet::parse(value).map_err(|e| CodecError::InvalidNumaToken(raw.to_string(), e.to_string()))?)
				}
				"hostnodes" => {
					hostnodes =
						Some(CpuSet::parse(value).map_err(|e| CodecError::InvalidNumaToken(raw.to_string(), e.to_string()))?)
				}
				"memory" => {
					memory_mib = Some(value.parse::<u64>().map_err(|_| {
						CodecError::InvalidNumaToken(raw.to_string(), format!("bad memory value {value:?}"))
					})?)
				}
				"policy" => {
					policy = Some(
						NumaPolicyKind::parse(value)
							.ok_or_else(|| CodecError::InvalidNumaToken(raw.to_string(), format!("bad policy {value:?}")))?,
					)
				}
				other => {
					return Err(CodecError::InvalidNumaToken(
						raw.to_string(),
						format!("unknown field {other:?}"),
					))
				}
			}
		}

		Ok(Self {
			cpus: cpus.ok_or_else(|| CodecError::InvalidNumaToken(raw.to_string(), "missing cpus=".to_string()))?,
			hostnodes: hostnodes
				.ok_or_else(|| CodecError::InvalidNumaToken(raw.to_string(), "missing hostnodes=".to_string()))?,
			memory_mib: memory_mib
				.ok_or_else(|| CodecError::InvalidNumaToken(raw.to_string(), "missing memory=".to_string()))?,
			policy,
		})
	}
}

/// Decodes a hypervisor VM config into a [`VmResource`] (spec §4.G).
pub fn decode(cfg: &VmConfig) -> Result<VmResource, CodecError> {
	let mut resource = VmResource::new(cfg.cpus, cfg.max_mem_bytes);

	let affinity = match &cfg.affinity {
		Some(s) if !s.trim().is_empty() => CpuSet::parse(s)?,
		_ => CpuSet::new(),
	};
	resource.cpu_set = affinity.clone();

	if cfg.numa == Some(1) && !cfg.numa_entries.is_empty() {
		let affinity_sorted: Vec<CpuId> = affinity.iter().collect();
		let mut numa_map: BTreeMap<NumaId, NumaAllocation> = BTreeMap::new();

		for raw in cfg.numa_entries.values() {
			let token = NumaToken::parse(raw)?;
			let hostnode_ids: Vec<NumaId> = token.hostnodes.iter().collect();
			if hostnode_ids.is_empty() {
				return Err(CodecError::EmptyHostnodes);
			}

			let guest_positions: Vec<u32> = token.cpus.iter().collect();
			let resolve = |pos: u32| -> Result<CpuId, CodecError> {
				affinity_sorted
					.get(pos as usize)
					.copied()
					.ok_or(CodecError::AffinityIndexOutOfRange(pos))
			};

			if hostnode_ids.len() > 1 {
				if guest_positions.len() % hostnode_ids.len() != 0 {
					return Err(CodecError::UnevenSplit {
						cpus: guest_positions.len(),
						hostnodes: hostnode_ids.len(),
					});
				}
				let chunk = guest_positions.len() / hostnode_ids.len();
				let mem_per = token.memory_mib / hostnode_ids.len() as u64;

				for (i, node) in hostnode_ids.iter().enumerate() {
					let mut phys = CpuSet::new();
					for &pos in &guest_positions[i * chunk..(i + 1) * chunk] {
						phys.insert(resolve(pos)?);
					}
					let entry = numa_map.entry(*node).or_insert_with(|| NumaAllocation {
						cpus: CpuSet::new(),
						memory_mb: 0,
						policy: token.policy,
					});
					entry.cpus.extend(&phys);
					entry.memory_mb += mem_per;
				}
			} else {
				let node = hostnode_ids[0];
				let mut phys = CpuSet::new();
				for &pos in &guest_positions {
					phys.insert(resolve(pos)?);
				}
				let entry = numa_map.entry(node).or_insert_with(|| NumaAllocation {
					cpus: CpuSet::new(),
					memory_mb: 0,
					policy: token.policy,
				});
				entry.cpus.extend(&phys);
				entry.memory_mb += token.memory_mib;
			}
		}

		resource.numa_nodes = numa_map;
	}

	resource.validate()?;
	Ok(resource)
}

/// Encodes a [`VmResource`] into hypervisor options (spec §4.G).
pub fn encode(resource: &VmResource) -> Result<VmOptions, CodecError> {
	let mut options = VmOptions {
		cores: resource.cpus,
		memory_mib: resource.memory_bytes / MIB,
		affinity: if resource.cpu_set.is_empty() {
			None
		} else {
			Some(resource.cpu_set.to_range_string())
		},
		..Default::default()
	};

	if !resource.numa_nodes.is_empty() {
		let mut running_index: u32 = 0;
		let mut entries = BTreeMap::new();

		for (idx, (node, alloc)) in resource.numa_nodes.iter().enumerate() {
			if alloc.cpus.is_empty() {
				return Err(CodecError::EmptyNumaCpuSet(*node));
			}
			let size = alloc.cpus.len() as u32;
			let mut token = format!(
				"cpus={}-{},hostnodes={},memory={}",
				running_index,
				running_index + size - 1,
				node,
				alloc.memory_mb
			);
			if let Some(policy) = alloc.policy {
				token.push_str(&format!(",policy={}", policy.as_wire_str()));
			}
			entries.insert(idx as u32, token);
			running_index += size;
		}

		options.numa = Some(1);
		options.numa_entries = entries;
	}

	Ok(options)
}

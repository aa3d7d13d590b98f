//! Process-wide capacity provider (spec §4.F): three independently-locked
//! snapshots (capacity, storage, network) refreshed by periodic sync, plus
//! the fit/rank/allocate surface the scheduler calls on every placement
//! decision.
//!
//! Each snapshot is an `Arc<HashMap<..>>` behind a `RwLock`; a sync cycle
//! builds a fresh map and swaps the `Arc` in a single pointer write (spec §5
//! "readers never observe a half-built zone map"). Per-zone mutation
//! (`allocate_in_zone`, `update_load`) goes through a `Mutex` owned by the
//! zone's own entry, so it never contends with a concurrent sync of a
//! different region.

pub mod network;
pub mod storage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hvcap_resmgr::{HypervisorInventory, NodePolicy, ResourceManager, ResourceManagerError};
use hvcap_topology::discovery::{HypervisorSummary, NodeSettingsFile};
use hvcap_vmresource::VmResource;
use thiserror::Error;

pub use network::{NetworkInterface, NodeNetwork};
pub use storage::{NodeStorage, StorageCapability, StorageResource};

#[derive(Debug, Error)]
pub enum CapacityError {
	#[error("no resource manager for {region}/{zone}")]
	NoResourceManager { region: String, zone: String },

	#[error(transparent)]
	ResourceManager(#[from] ResourceManagerError),

	#[error("transient io: {0}")]
	TransientIo(String),

	#[error("not found: {0}")]
	NotFound(String),
}

type ZoneKey = (String, String);

/// The named external interface a concrete hypervisor API client implements
/// (spec §1 Non-goals: the transport/credentials behind this are out of
/// scope for this workspace). One instance per region.
pub trait RegionClient: Send + Sync {
	fn region(&self) -> &str;
	fn online_zones(&self) -> Result<Vec<String>, CapacityError>;
	fn running_vms(&self, zone: &str) -> Result<Vec<VmResource>, CapacityError>;
	fn node_settings(&self) -> Option<NodeSettingsFile>;
	fn hypervisor_summary(&self, zone: &str) -> Result<HypervisorSummary, CapacityError>;
	fn cpu_load_percent(&self, zone: &str) -> Result<f32, CapacityError>;
	fn storage_resources(&self) -> Result<Vec<StorageResource>, CapacityError>;
	fn network_resources(&self, zone: &str) -> Result<NodeNetwork, CapacityError>;
}

struct VmInventorySnapshot(Vec<VmResource>);

impl HypervisorInventory for VmInventorySnapshot {
	fn running_vms(&self) -> Vec<VmResource> {
		self.0.clone()
	}
}

/// One zone's live entry (spec §3 "Node capacity record"). `cpu_load_percent`
/// and `manager` mutate independently of the enclosing snapshot swap.
pub struct NodeCapacityEntry {
	name: String,
	region: String,
	zone: String,
	cpu_load_percent: Mutex<f32>,
	manager: Mutex<ResourceManager>,
}

/// Read-only view returned by listing/lookup calls; does not expose the live
/// manager.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCapacitySnapshot {
	pub name: String,
	pub region: String,
	pub zone: String,
	pub cpu_load_percent: f32,
	pub available_cpus: u32,
	pub available_memory: u64,
}

impl NodeCapacityEntry {
	fn snapshot(&self) -> NodeCapacitySnapshot {
		let mgr = self.manager.lock().unwrap();
		NodeCapacitySnapshot {
			name: self.name.clone(),
			region: self.region.clone(),
			zone: self.zone.clone(),
			cpu_load_percent: *self.cpu_load_percent.lock().unwrap(),
			available_cpus: mgr.available_cpus(),
			available_memory: mgr.available_memory(),
		}
	}

	fn fits(&self, req: &VmResource) -> bool {
		let mgr = self.manager.lock().unwrap();
		mgr.available_cpus() >= req.cpus && mgr.available_memory() >= req.memory_bytes
	}
}

/// Applies an OR'd predicate chain to `record`: with no filters the record is
/// returned unconditionally; with filters, the first one that matches wins
/// (spec §9 open question 2 — "any", not "all", resolved explicitly in
/// SPEC_FULL.md).
fn passes_filters<T>(record: &T, filters: &[&dyn Fn(&T) -> bool]) -> bool {
	filters.is_empty() || filters.iter().any(|f| f(record))
}

/// Process-wide capacity/storage/network state (spec §4.F).
pub struct CapacityProvider {
	regions: Vec<Box<dyn RegionClient>>,
	policy: NodePolicy,
	capacity: RwLock<Arc<HashMap<ZoneKey, Arc<NodeCapacityEntry>>>>,
	storage: RwLock<Arc<HashMap<String, NodeStorage>>>,
	network: RwLock<Arc<HashMap<ZoneKey, NodeNetwork>>>,
}

impl CapacityProvider {
	pub fn new(regions: Vec<Box<dyn RegionClient>>, policy: NodePolicy) -> Self {
		Self {
			regions,
			policy,
			capacity: RwLock::new(Arc::new(HashMap::new())),
			storage: RwLock::new(Arc::new(HashMap::new())),
			network: RwLock::new(Arc::new(HashMap::new())),
		}
	}

	/// Rebuilds every region's zone set. Per spec §5, this is not atomic
	/// across regions: each region's entries are swapped in under their own
	/// brief write-lock hold, one region at a time. Failed zones (discovery
	/// or inventory errors) are logged and simply absent from the fresh
	/// entries for that region; the prior snapshot for unaffected regions is
	/// untouched.
	pub fn sync_capacity(&self) {
		for region in &self.regions {
			let zones = match region.online_zones() {
				Ok(z) => z,
				Err(err) => {
					tracing::warn!(region = region.region(), error = %err, "skipping region during capacity sync");
					continue;
				}
			};

			let mut fresh = Vec::new();
			for zone in &zones {
				let vms = match region.running_vms(zone) {
					Ok(v) => v,
					Err(err) => {
						tracing::warn!(region = region.region(), zone, error = %err, "skipping zone during capacity sync");
						continue;
					}
				};
				let settings = region.node_settings();
				let summary = region.hypervisor_summary(zone).ok();
				let inventory = VmInventorySnapshot(vms);

				let manager = match ResourceManager::new(
					region.region(),
					zone,
					settings.as_ref(),
					summary.as_ref(),
					self.policy,
					&inventory,
				) {
					Ok(m) => m,
					Err(err) => {
						tracing::warn!(region = region.region(), zone, error = %err, "skipping zone during capacity sync");
						continue;
					}
				};

				let load = region.cpu_load_percent(zone).unwrap_or(0.0);
				let entry = Arc::new(NodeCapacityEntry {
					name: format!("{}/{}", region.region(), zone),
					region: region.region().to_string(),
					zone: zone.clone(),
					cpu_load_percent: Mutex::new(load),
					manager: Mutex::new(manager),
				});
				fresh.push(((region.region().to_string(), zone.clone()), entry));
			}

			let mut guard = self.capacity.write().unwrap();
			let mut new_map = (**guard).clone();
			new_map.retain(|(r, _), _| r != region.region());
			for (key, entry) in fresh {
				new_map.insert(key, entry);
			}
			*guard = Arc::new(new_map);
		}
	}

	/// Refreshes each known zone's CPU-load percentage in place, without
	/// rebuilding any resource manager (spec §4.F `update_load`).
	pub fn update_load(&self) {
		let snapshot = self.capacity.read().unwrap().clone();
		for region in &self.regions {
			for ((r, zone), entry) in snapshot.iter() {
				if r != region.region() {
					continue;
				}
				match region.cpu_load_percent(zone) {
					Ok(load) => *entry.cpu_load_percent.lock().unwrap() = load,
					Err(err) => {
						tracing::warn!(region = r, zone, error = %err, "failed to refresh cpu load");
					}
				}
			}
		}
	}

	/// Rebuilds the storage index: only resources with status "available"
	/// and a recognized capability survive (spec §4.F `sync_storage`). Like
	/// `sync_capacity`, swapped in per region.
	pub fn sync_storage(&self) {
		for region in &self.regions {
			let resources = match region.storage_resources() {
				Ok(r) => r,
				Err(err) => {
					tracing::warn!(region = region.region(), error = %err, "skipping region during storage sync");
					continue;
				}
			};

			let mut fresh = HashMap::new();
			for resource in resources.iter().filter(|r| storage::is_syncable(r)) {
				let node_storage = NodeStorage::from_resource(region.region(), resource);
				for zone in &resource.zones {
					fresh.insert(storage::mount_key(region.region(), &resource.name, zone), node_storage.clone());
				}
				fresh.insert(storage::coalesced_key(region.region(), &resource.name), node_storage.clone());
			}

			let mut guard = self.storage.write().unwrap();
			let mut new_map = (**guard).clone();
			let prefix = format!("{}/", region.region());
			new_map.retain(|k, _| !k.starts_with(&prefix));
			new_map.extend(fresh);
			*guard = Arc::new(new_map);
		}
	}

	/// Rebuilds the per-zone network index (companion to `sync_storage`, not
	/// separately named in spec §4.F's bullet list but covered by its "state
	/// is partitioned into three independently locked maps" preamble).
	pub fn sync_network(&self) {
		for region in &self.regions {
			let zones = match region.online_zones() {
				Ok(z) => z,
				Err(err) => {
					tracing::warn!(region = region.region(), error = %err, "skipping region during network sync");
					continue;
				}
			};

			let mut fresh = Vec::new();
			for zone in &zones {
				match region.network_resources(zone) {
					Ok(net) => fresh.push(((region.region().to_string(), zone.clone()), net)),
					Err(err) => {
						tracing::warn!(region = region.region(), zone, error = %err, "skipping zone during network sync");
					}
				}
			}

			let mut guard = self.network.write().unwrap();
			let mut new_map = (**guard).clone();
			new_map.retain(|(r, _), _| r != region.region());
			for (key, net) in fresh {
				new_map.insert(key, net);
			}
			*guard = Arc::new(new_map);
		}
	}

	fn entry(&self, region: &str, zone: &str) -> Result<Arc<NodeCapacityEntry>, CapacityError> {
		self.capacity
			.read()
			.unwrap()
			.get(&(region.to_string(), zone.to_string()))
			.cloned()
			.ok_or_else(|| CapacityError::NoResourceManager {
				region: region.to_string(),
				zone: zone.to_string(),
			})
	}

	pub fn allocate_in_zone(&self, region: &str, zone: &str, req: &mut VmResource) -> Result<(), CapacityError> {
		let entry = self.entry(region, zone)?;
		entry.manager.lock().unwrap().allocate(req)?;
		Ok(())
	}

	pub fn release_in_zone(&self, region: &str, zone: &str, req: &VmResource) -> Result<(), CapacityError> {
		let entry = self.entry(region, zone)?;
		entry.manager.lock().unwrap().release(req)?;
		Ok(())
	}

	pub fn regions(&self) -> Vec<String> {
		let mut seen: Vec<String> = self.capacity.read().unwrap().keys().map(|(r, _)| r.clone()).collect();
		seen.sort();
		seen.dedup();
		seen
	}

	pub fn zones(&self, region: &str) -> Vec<String> {
		let mut zones: Vec<String> = self
			.capacity
			.read()
			.unwrap()
			.keys()
			.filter(|(r, _)| r == region)
			.map(|(_, z)| z.clone())
			.collect();
		zones.sort();
		zones
	}

	pub fn fit_in_zone(&self, region: &str, zone: &str, req: &VmResource) -> bool {
		match self.entry(region, zone) {
			Ok(entry) => entry.fits(req),
			Err(_) => false,
		}
	}

	pub fn available_zones_in_region(&self, region: &str, req: &VmResource) -> Vec<String> {
		self.capacity
			.read()
			.unwrap()
			.iter()
			.filter(|((r, _), entry)| r == region && entry.fits(req))
			.map(|((_, zone), _)| zone.clone())
			.collect()
	}

	/// Ascending stable sort by current CPU-load percent; zones not present
	/// in the region's current zone list are dropped (spec §4.F).
	pub fn sort_zones_by_cpu_load(&self, region: &str, zones: &[String]) -> Vec<String> {
		let snapshot = self.capacity.read().unwrap();
		let mut with_load: Vec<(String, f32)> = zones
			.iter()
			.filter_map(|z| {
				snapshot
					.get(&(region.to_string(), z.clone()))
					.map(|entry| (z.clone(), *entry.cpu_load_percent.lock().unwrap()))
			})
			.collect();
		with_load.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
		with_load.into_iter().map(|(z, _)| z).collect()
	}

	pub fn capacity_snapshot(&self, region: &str, zone: &str) -> Option<NodeCapacitySnapshot> {
		self.capacity
			.read()
			.unwrap()
			.get(&(region.to_string(), zone.to_string()))
			.map(|entry| entry.snapshot())
	}

	/// `filters` are OR'd: the first one that returns true for the looked-up
	/// record wins; an empty slice returns the record unconditionally (spec
	/// §9 open question 2).
	pub fn get_storage(&self, region: &str, name: &str, filters: &[&dyn Fn(&NodeStorage) -> bool]) -> Option<NodeStorage> {
		let key = storage::coalesced_key(region, name);
		let record = self.storage.read().unwrap().get(&key).cloned()?;
		passes_filters(&record, filters).then_some(record)
	}

	pub fn get_network(&self, region: &str, zone: &str, filters: &[&dyn Fn(&NodeNetwork) -> bool]) -> Option<NodeNetwork> {
		let record = self
			.network
			.read()
			.unwrap()
			.get(&(region.to_string(), zone.to_string()))
			.cloned()?;
		passes_filters(&record, filters).then_some(record)
	}
}

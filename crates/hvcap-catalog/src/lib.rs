//! Instance-type catalog (spec §4.J, §3 "Instance-type offering"). Entries
//! are loaded once from the instance-type definition file and never mutated;
//! availability is computed on every query against a weakly-held capacity
//! provider, so a dropped provider surfaces as `NotFound` rather than a
//! dangling pointer (spec §9 "Cyclic references").

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{RwLock, Weak};

use hvcap_capacity::CapacityProvider;
use hvcap_vmresource::VmResource;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("failed to read instance-type file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse instance-type file: {0}")]
	Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
	OnDemand,
	Spot,
}

impl Default for CapacityType {
	fn default() -> Self {
		Self::OnDemand
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapacity {
	pub cpu: u32,
	pub memory: u64,
	pub pods: u32,
	#[serde(rename = "ephemeral-storage")]
	pub ephemeral_storage: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverhead {
	#[serde(default)]
	pub cpu: u32,
	#[serde(default)]
	pub memory: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overhead {
	#[serde(rename = "kubeReserved", default)]
	pub kube_reserved: ResourceOverhead,
	#[serde(rename = "systemReserved", default)]
	pub system_reserved: ResourceOverhead,
	#[serde(rename = "evictionThreshold", default)]
	pub eviction_threshold: ResourceOverhead,
}

/// Deserialized instance-type file entry (spec §6).
#[derive(Debug, Clone, Deserialize)]
struct RawInstanceType {
	name: String,
	capacity: ResourceCapacity,
	#[serde(default)]
	overhead: Overhead,
	#[serde(rename = "capacityType", default)]
	capacity_type: CapacityType,
}

/// One instance-type offering (spec §3). Immutable after catalog load,
/// except for the price table, which is populated separately — the
/// instance-type file (spec §6) carries no price field, so prices are
/// threaded in at runtime via `set_price` (see DESIGN.md for this call).
#[derive(Debug)]
pub struct InstanceTypeOffering {
	pub name: String,
	pub capacity: ResourceCapacity,
	pub overhead: Overhead,
	pub capacity_type: CapacityType,
	prices: RwLock<HashMap<(String, String), f64>>,
}

impl InstanceTypeOffering {
	fn from_raw(raw: RawInstanceType) -> Self {
		Self {
			name: raw.name,
			capacity: raw.capacity,
			overhead: raw.overhead,
			capacity_type: raw.capacity_type,
			prices: RwLock::new(HashMap::new()),
		}
	}

	/// Allocatable resource after subtracting kube/system reservations, the
	/// quantity actually placed against a zone's available capacity.
	fn allocatable(&self) -> VmResource {
		let cpu = self
			.capacity
			.cpu
			.saturating_sub(self.overhead.kube_reserved.cpu)
			.saturating_sub(self.overhead.system_reserved.cpu);
		let memory = self
			.capacity
			.memory
			.saturating_sub(self.overhead.kube_reserved.memory)
			.saturating_sub(self.overhead.system_reserved.memory);
		VmResource::new(cpu, memory)
	}

	pub fn price_in(&self, region: &str, zone: &str) -> Option<f64> {
		self.prices.read().unwrap().get(&(region.to_string(), zone.to_string())).copied()
	}
}

/// Instance-type catalog (spec §4.J). Holds a [`Weak`] reference to the
/// capacity provider rather than an owning one, so the provider's lifetime
/// is never extended by catalog queries alone (spec §9 "Cyclic references").
pub struct Catalog {
	offerings: Vec<InstanceTypeOffering>,
	capacity_provider: Weak<CapacityProvider>,
}

impl Catalog {
	/// Loads the instance-type definition file (spec §6) and binds it to a
	/// weak reference of the capacity provider used for availability checks.
	pub fn load(path: &Path, capacity_provider: Weak<CapacityProvider>) -> Result<Self, CatalogError> {
		let raw = fs::read_to_string(path)?;
		let entries: Vec<RawInstanceType> = serde_json::from_str(&raw)?;
		Ok(Self {
			offerings: entries.into_iter().map(InstanceTypeOffering::from_raw).collect(),
			capacity_provider,
		})
	}

	pub fn names(&self) -> Vec<&str> {
		self.offerings.iter().map(|o| o.name.as_str()).collect()
	}

	pub fn get(&self, name: &str) -> Option<&InstanceTypeOffering> {
		self.offerings.iter().find(|o| o.name == name)
	}

	fn get_or_not_found(&self, name: &str) -> Result<&InstanceTypeOffering, CatalogError> {
		self.get(name).ok_or_else(|| CatalogError::NotFound(name.to_string()))
	}

	/// Re-resolves the weak capacity-provider reference on every call (spec
	/// §9): a provider dropped by its owner surfaces here as `NotFound`
	/// rather than a panic or stale read.
	pub fn available_in(&self, name: &str, region: &str, zone: &str) -> Result<bool, CatalogError> {
		let offering = self.get_or_not_found(name)?;
		let provider = self
			.capacity_provider
			.upgrade()
			.ok_or_else(|| CatalogError::NotFound("capacity provider".to_string()))?;
		Ok(provider.fit_in_zone(region, zone, &offering.allocatable()))
	}

	pub fn set_price(&self, name: &str, region: &str, zone: &str, price: f64) -> Result<(), CatalogError> {
		let offering = self.get_or_not_found(name)?;
		offering
			.prices
			.write()
			.unwrap()
			.insert((region.to_string(), zone.to_string()), price);
		Ok(())
	}

	pub fn price_in(&self, name: &str, region: &str, zone: &str) -> Result<Option<f64>, CatalogError> {
		Ok(self.get_or_not_found(name)?.price_in(region, zone))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hvcap_capacity::{CapacityError, NetworkInterface, NodeNetwork, RegionClient, StorageResource};
	use hvcap_resmgr::NodePolicy;
	use hvcap_topology::discovery::{HypervisorSummary, NodeSettingsFile};
	use std::io::Write;
	use std::sync::Arc;

	struct FakeRegion;
	impl RegionClient for FakeRegion {
		fn region(&self) -> &str {
			"us-east"
		}
		fn online_zones(&self) -> Result<Vec<String>, CapacityError> {
			Ok(vec!["zone-a".to_string()])
		}
		fn running_vms(&self, _zone: &str) -> Result<Vec<VmResource>, CapacityError> {
			Ok(Vec::new())
		}
		fn node_settings(&self) -> Option<NodeSettingsFile> {
			None
		}
		fn hypervisor_summary(&self, _zone: &str) -> Result<HypervisorSummary, CapacityError> {
			Ok(HypervisorSummary {
				model: "Generic CPU".to_string(),
				cpus: 8,
				cores: 4,
				sockets: 1,
				total_mem: 16 * 1024 * 1024 * 1024,
			})
		}
		fn cpu_load_percent(&self, _zone: &str) -> Result<f32, CapacityError> {
			Ok(0.0)
		}
		fn storage_resources(&self) -> Result<Vec<StorageResource>, CapacityError> {
			Ok(Vec::new())
		}
		fn network_resources(&self, _zone: &str) -> Result<NodeNetwork, CapacityError> {
			Ok(NodeNetwork::new())
		}
	}

	fn write_instance_types(contents: &str) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		write!(f, "{contents}").unwrap();
		f
	}

	const FILE: &str = r#"[
		{
			"name": "small.x1",
			"capacity": { "cpu": 4, "memory": 8589934592, "pods": 30, "ephemeral-storage": 10737418240 },
			"overhead": { "kubeReserved": { "cpu": 1, "memory": 536870912 } }
		},
		{
			"name": "huge.x1",
			"capacity": { "cpu": 64, "memory": 137438953472, "pods": 110, "ephemeral-storage": 107374182400 },
			"capacityType": "spot"
		}
	]"#;

	#[test]
	fn load_parses_defaults_and_overhead() {
		let f = write_instance_types(FILE);
		let provider = Arc::new(CapacityProvider::new(vec![Box::new(FakeRegion)], NodePolicy::Simple));
		let catalog = Catalog::load(f.path(), Arc::downgrade(&provider)).unwrap();

		assert_eq!(catalog.names().len(), 2);
		let small = catalog.get("small.x1").unwrap();
		assert_eq!(small.capacity_type, CapacityType::OnDemand);
		assert_eq!(small.overhead.kube_reserved.cpu, 1);

		let huge = catalog.get("huge.x1").unwrap();
		assert_eq!(huge.capacity_type, CapacityType::Spot);
	}

	#[test]
	fn available_in_checks_live_capacity() {
		let f = write_instance_types(FILE);
		let provider = Arc::new(CapacityProvider::new(vec![Box::new(FakeRegion)], NodePolicy::Simple));
		provider.sync_capacity();
		let catalog = Catalog::load(f.path(), Arc::downgrade(&provider)).unwrap();

		assert!(catalog.available_in("small.x1", "us-east", "zone-a").unwrap());
		assert!(!catalog.available_in("huge.x1", "us-east", "zone-a").unwrap());
	}

	#[test]
	fn available_in_reports_not_found_once_provider_is_dropped() {
		let f = write_instance_types(FILE);
		let provider = Arc::new(CapacityProvider::new(vec![Box::new(FakeRegion)], NodePolicy::Simple));
		let weak = Arc::downgrade(&provider);
		let catalog = Catalog::load(f.path(), weak).unwrap();

		drop(provider);
		assert!(matches!(
			catalog.available_in("small.x1", "us-east", "zone-a"),
			Err(CatalogError::NotFound(_))
		));
	}

	#[test]
	fn unknown_name_is_not_found() {
		let f = write_instance_types(FILE);
		let provider = Arc::new(CapacityProvider::new(vec![Box::new(FakeRegion)], NodePolicy::Simple));
		let catalog = Catalog::load(f.path(), Arc::downgrade(&provider)).unwrap();

		assert!(matches!(
			catalog.available_in("ghost.x1", "us-east", "zone-a"),
			Err(CatalogError::NotFound(_))
		));
	}

	#[test]
	fn set_price_and_price_in_round_trip() {
		let f = write_instance_types(FILE);
		let provider = Arc::new(CapacityProvider::new(vec![Box::new(FakeRegion)], NodePolicy::Simple));
		let catalog = Catalog::load(f.path(), Arc::downgrade(&provider)).unwrap();

		assert_eq!(catalog.price_in("small.x1", "us-east", "zone-a").unwrap(), None);
		catalog.set_price("small.x1", "us-east", "zone-a", 0.042).unwrap();
		assert_eq!(catalog.price_in("small.x1", "us-east", "zone-a").unwrap(), Some(0.042));
	}
}

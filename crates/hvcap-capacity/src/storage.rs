//! Storage records (spec §3 "Storage record", §4.F `sync_storage`).

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};

/// One of the capability tags a cluster resource advertises. Unknown tags
/// reported by a region client are dropped when a [`StorageResource`] is
/// deserialized from its wire payload, rather than rejected outright (spec
/// names only these three).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageCapability {
	Images,
	Iso,
	Import,
}

impl StorageCapability {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"images" => Some(Self::Images),
			"iso" => Some(Self::Iso),
			"import" => Some(Self::Import),
			_ => None,
		}
	}
}

/// Deserializes the wire `capabilities` array as raw strings and silently
/// drops any tag `StorageCapability::parse` doesn't recognize, instead of
/// failing the whole resource on one unexpected tag.
fn deserialize_capabilities<'de, D>(deserializer: D) -> Result<HashSet<StorageCapability>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = Vec::<String>::deserialize(deserializer)?;
	Ok(raw.iter().filter_map(|tag| StorageCapability::parse(tag)).collect())
}

/// Raw shape reported by a [`crate::RegionClient`] before `sync_storage`
/// filters and indexes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageResource {
	pub name: String,
	pub shared: bool,
	#[serde(rename = "type")]
	pub kind: String,
	pub status: String,
	#[serde(deserialize_with = "deserialize_capabilities")]
	pub capabilities: HashSet<StorageCapability>,
	pub zones: Vec<String>,
}

/// Indexed storage record (spec §3): one logical entry per `region/storage`
/// key, carrying the union of zones it is mounted in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStorage {
	pub name: String,
	pub region: String,
	pub shared: bool,
	#[serde(rename = "type")]
	pub kind: String,
	pub capabilities: HashSet<StorageCapability>,
	pub zones: Vec<String>,
}

impl NodeStorage {
	pub fn from_resource(region: &str, resource: &StorageResource) -> Self {
		Self {
			name: resource.name.clone(),
			region: region.to_string(),
			shared: resource.shared,
			kind: resource.kind.clone(),
			capabilities: resource.capabilities.clone(),
			zones: resource.zones.clone(),
		}
	}
}

/// `status == "available"` and the capability set intersects
/// `{images, iso, import}` (spec §4.F `sync_storage`).
pub fn is_syncable(resource: &StorageResource) -> bool {
	resource.status == "available" && !resource.capabilities.is_empty()
}

/// Per-mount key: `region/storage/zone`.
pub fn mount_key(region: &str, name: &str, zone: &str) -> String {
	format!("{region}/{name}/{zone}")
}

/// Coalesced key: `region/storage`.
pub fn coalesced_key(region: &str, name: &str) -> String {
	format!("{region}/{name}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_rejects_unknown_capability() {
		assert_eq!(StorageCapability::parse("images"), Some(StorageCapability::Images));
		assert_eq!(StorageCapability::parse("snapshots"), None);
	}

	#[test]
	fn is_syncable_requires_available_status_and_a_known_capability() {
		let mut r = StorageResource {
			name: "local-zfs".to_string(),
			shared: false,
			kind: "zfspool".to_string(),
			status: "available".to_string(),
			capabilities: [StorageCapability::Images].into_iter().collect(),
			zones: vec!["zone-a".to_string()],
		};
		assert!(is_syncable(&r));

		r.status = "disabled".to_string();
		assert!(!is_syncable(&r));

		r.status = "available".to_string();
		r.capabilities.clear();
		assert!(!is_syncable(&r));
	}

	#[test]
	fn deserialize_drops_unknown_capability_tags() {
		let json = r#"{
			"name": "local-zfs",
			"shared": false,
			"type": "zfspool",
			"status": "available",
			"capabilities": ["images", "snapshots", "iso"],
			"zones": ["zone-a"]
		}"#;
		let r: StorageResource = serde_json::from_str(json).unwrap();
		assert_eq!(
			r.capabilities,
			[StorageCapability::Images, StorageCapability::Iso].into_iter().collect()
		);
	}
}

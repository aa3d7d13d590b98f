//! Network records (spec §3 "Network record per zone").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One active bridge interface. Filtering out inactive/non-bridge interfaces
/// is the region client's job (spec §3: "Only active bridge interfaces").
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
	pub ipv4_cidr: Option<String>,
	pub ipv6_cidr: Option<String>,
	pub gw4: Option<String>,
	pub gw6: Option<String>,
	pub mtu: Option<u32>,
}

/// Interface name → [`NetworkInterface`], one per zone.
pub type NodeNetwork = BTreeMap<String, NetworkInterface>;

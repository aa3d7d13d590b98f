//! Bitset-backed IPv4 CIDR allocator (spec §4.H). Each [`IpPool`] holds one
//! CIDR and a dense occupied-bit map; the IPv6 branch is intentionally not
//! implemented (spec §9 open question 1).

mod bitset;

use std::net::Ipv4Addr;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use thiserror::Error;

use bitset::BitSet;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
	#[error("ip {0} is outside the pool's cidr")]
	NotInCidr(Ipv4Addr),

	#[error("ip {0} is the network address")]
	NetworkAddress(Ipv4Addr),

	#[error("no free address")]
	NoFreeAddress,

	#[error("invalid cidr: {0}")]
	InvalidCidr(String),

	#[error("unsupported address family: {0}")]
	Unsupported(&'static str),
}

/// One CIDR plus its occupied-bit map (spec §3 "IP pool").
pub struct IpPool {
	cidr: Ipv4Net,
	max_hosts: u64,
	used: Mutex<BitSet>,
}

impl IpPool {
	pub fn new(cidr: Ipv4Net) -> Self {
		let prefix = cidr.prefix_len() as u32;
		let max_hosts = if prefix >= 32 { 0 } else { (1u64 << (32 - prefix)) - 1 };
		Self {
			cidr,
			max_hosts,
			used: Mutex::new(BitSet::new(max_hosts as usize)),
		}
	}

	pub fn cidr(&self) -> Ipv4Net {
		self.cidr
	}

	pub fn max_hosts(&self) -> u64 {
		self.max_hosts
	}

	pub fn contains(&self, ip: Ipv4Addr) -> bool {
		self.cidr.contains(ip)
	}

	fn network_u32(&self) -> u32 {
		u32::from(self.cidr.network())
	}

	/// `ip = network + i + 1`; fails if `ip` is the network address or
	/// outside the CIDR.
	pub fn host_index(&self, ip: Ipv4Addr) -> Result<u64, IpamError> {
		if !self.contains(ip) {
			return Err(IpamError::NotInCidr(ip));
		}
		let network = self.network_u32();
		let ip_u32 = u32::from(ip);
		if ip_u32 == network {
			return Err(IpamError::NetworkAddress(ip));
		}
		Ok((ip_u32 - network - 1) as u64)
	}

	fn ip_for_index(&self, index: u64) -> Ipv4Addr {
		Ipv4Addr::from(self.network_u32() + index as u32 + 1)
	}

	/// Returns `false` if `ip` is the network address or already occupied;
	/// otherwise sets the bit and returns `true`.
	pub fn occupy(&self, ip: Ipv4Addr) -> bool {
		let index = match self.host_index(ip) {
			Ok(i) => i,
			Err(_) => return false,
		};
		let mut used = self.used.lock().unwrap();
		!used.set(index as usize)
	}

	/// Clears the bit if set; no-op on the network address or an IP outside
	/// this CIDR.
	pub fn release(&self, ip: Ipv4Addr) {
		if let Ok(index) = self.host_index(ip) {
			self.used.lock().unwrap().clear(index as usize);
		}
	}

	/// Linear-scans from `host_index(hint)` (or `0`) for the first unset
	/// bit, sets it, and returns the corresponding IP.
	pub fn next(&self, hint: Option<Ipv4Addr>) -> Result<Ipv4Addr, IpamError> {
		let start = match hint {
			Some(ip) => self.host_index(ip).unwrap_or(0),
			None => 0,
		};
		let mut used = self.used.lock().unwrap();
		let idx = used
			.first_unset_from(start as usize)
			.ok_or(IpamError::NoFreeAddress)?;
		used.set(idx);
		Ok(self.ip_for_index(idx as u64))
	}

	pub fn size(&self) -> usize {
		self.used.lock().unwrap().popcount()
	}

	pub fn equal_cidr(&self, other: &IpPool) -> bool {
		self.cidr == other.cidr
	}

	pub fn contains_cidr(&self, other: &IpPool) -> bool {
		self.cidr.contains(other.cidr)
	}
}

/// Parses a CIDR string, rejecting IPv6 (spec §9 open question 1).
pub fn parse_cidr(s: &str) -> Result<Ipv4Net, IpamError> {
	match s.parse::<IpNet>() {
		Ok(IpNet::V4(v4)) => Ok(v4),
		Ok(IpNet::V6(_)) => Err(IpamError::Unsupported("ipv6")),
		Err(e) => Err(IpamError::InvalidCidr(e.to_string())),
	}
}

/// Holds the list of pools known to the provider. Individual pools have
/// their own lock; this coarse lock only guards insert/remove (spec §4.H,
/// §5).
#[derive(Default)]
pub struct IpamProvider {
	pools: RwLock<Vec<Arc<IpPool>>>,
}

impl IpamProvider {
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates the pool for `cidr` on first observation, or returns the
	/// existing one (spec §3 IP-pool lifecycle).
	pub fn insert(&self, cidr: Ipv4Net) -> Arc<IpPool> {
		let mut pools = self.pools.write().unwrap();
		if let Some(existing) = pools.iter().find(|p| p.cidr() == cidr) {
			return existing.clone();
		}
		let pool = Arc::new(IpPool::new(cidr));
		pools.push(pool.clone());
		pool
	}

	pub fn remove(&self, cidr: Ipv4Net) -> Option<Arc<IpPool>> {
		let mut pools = self.pools.write().unwrap();
		pools
			.iter()
			.position(|p| p.cidr() == cidr)
			.map(|pos| pools.remove(pos))
	}

	pub fn get(&self, cidr: Ipv4Net) -> Option<Arc<IpPool>> {
		self.pools.read().unwrap().iter().find(|p| p.cidr() == cidr).cloned()
	}

	pub fn pool_for_ip(&self, ip: Ipv4Addr) -> Option<Arc<IpPool>> {
		self.pools.read().unwrap().iter().find(|p| p.contains(ip)).cloned()
	}

	/// Creates (or reuses) the pool for `cidr` and occupies each IP already
	/// assigned to a node, per spec §3's "populated with already-occupied
	/// node IPs via `occupy`" lifecycle note.
	pub fn sync_from_inventory(&self, cidr: Ipv4Net, assigned_ips: &[Ipv4Addr]) -> Arc<IpPool> {
		let pool = self.insert(cidr);
		for ip in assigned_ips {
			pool.occupy(*ip);
		}
		pool
	}

	pub fn release_cidr(&self, cidr: Ipv4Net) {
		self.remove(cidr);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pool() -> IpPool {
		IpPool::new("192.168.1.0/24".parse().unwrap())
	}

	#[test]
	fn scenario_6_parses_and_tracks_occupied_bits() {
		let p = pool();
		assert_eq!(p.max_hosts(), 255);

		assert!(p.occupy("192.168.1.1".parse().unwrap()));
		assert!(p.occupy("192.168.1.2".parse().unwrap()));
		assert!(p.occupy("192.168.1.7".parse().unwrap()));
		assert_eq!(p.size(), 3);

		let next = p.next(None).unwrap();
		assert_eq!(next, "192.168.1.3".parse::<Ipv4Addr>().unwrap());
	}

	#[test]
	fn occupy_rejects_network_address() {
		let p = pool();
		assert!(!p.occupy("192.168.1.0".parse().unwrap()));
	}

	#[test]
	fn occupy_rejects_already_occupied() {
		let p = pool();
		let ip = "192.168.1.5".parse().unwrap();
		assert!(p.occupy(ip));
		assert!(!p.occupy(ip));
	}

	#[test]
	fn occupy_then_release_restores_prior_state() {
		let p = pool();
		let ip: Ipv4Addr = "192.168.1.9".parse().unwrap();
		let before = p.size();
		p.occupy(ip);
		p.release(ip);
		assert_eq!(p.size(), before);
		assert!(p.occupy(ip));
	}

	#[test]
	fn release_is_noop_on_network_address() {
		let p = pool();
		p.release("192.168.1.0".parse().unwrap());
		assert_eq!(p.size(), 0);
	}

	#[test]
	fn host_index_round_trips() {
		let p = pool();
		let ip: Ipv4Addr = "192.168.1.42".parse().unwrap();
		let idx = p.host_index(ip).unwrap();
		assert_eq!(idx, 41);
		assert_eq!(p.ip_for_index(idx), ip);
	}

	#[test]
	fn host_index_rejects_ip_outside_cidr() {
		let p = pool();
		assert_eq!(
			p.host_index("10.0.0.1".parse().unwrap()),
			Err(IpamError::NotInCidr("10.0.0.1".parse().unwrap()))
		);
	}

	#[test]
	fn next_reports_exhaustion() {
		let p = IpPool::new("192.168.1.0/30".parse().unwrap());
		assert_eq!(p.max_hosts(), 3);
		for _ in 0..3 {
			p.next(None).unwrap();
		}
		assert_eq!(p.next(None), Err(IpamError::NoFreeAddress));
	}

	#[test]
	fn parse_cidr_rejects_ipv6() {
		assert_eq!(parse_cidr("2001:db8::/32"), Err(IpamError::Unsupported("ipv6")));
	}

	#[test]
	fn provider_sync_from_inventory_occupies_existing_ips() {
		let provider = IpamProvider::new();
		let cidr: Ipv4Net = "10.1.0.0/24".parse().unwrap();
		let assigned = vec!["10.1.0.5".parse().unwrap(), "10.1.0.6".parse().unwrap()];
		let pool = provider.sync_from_inventory(cidr, &assigned);
		assert_eq!(pool.size(), 2);

		let fetched = provider.get(cidr).unwrap();
		assert!(!fetched.occupy("10.1.0.5".parse().unwrap()));
	}

	#[test]
	fn provider_release_cidr_removes_pool() {
		let provider = IpamProvider::new();
		let cidr: Ipv4Net = "10.2.0.0/24".parse().unwrap();
		provider.insert(cidr);
		assert!(provider.get(cidr).is_some());
		provider.release_cidr(cidr);
		assert!(provider.get(cidr).is_none());
	}

	#[test]
	fn contains_cidr_and_equal_cidr() {
		let wide = IpPool::new("10.0.0.0/16".parse().unwrap());
		let narrow = IpPool::new("10.0.1.0/24".parse().unwrap());
		assert!(wide.contains_cidr(&narrow));
		assert!(!narrow.contains_cidr(&wide));
		assert!(wide.equal_cidr(&IpPool::new("10.0.0.0/16".parse().unwrap())));
	}
}

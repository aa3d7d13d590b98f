use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TopologyError;

pub type CpuId = u32;

/// A sorted, deduplicated set of physical CPU ids.
///
/// Serializes as the `N` / `N-M` / comma-joined range syntax used throughout
/// the hypervisor wire formats (node-settings files, NUMA config tokens).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuSet(BTreeSet<CpuId>);

impl CpuSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_ids(ids: impl IntoIterator<Item = CpuId>) -> Self {
		Self(ids.into_iter().collect())
	}

	/// Parses `"0-7,16-23"` style ranges. Ranges are inclusive; a bare `N` is
	/// a single-element range.
	pub fn parse(s: &str) -> Result<Self, TopologyError> {
		let s = s.trim();
		if s.is_empty() {
			return Ok(Self::new());
		}

		let mut set = BTreeSet::new();
		for part in s.split(',') {
			let part = part.trim();
			if part.is_empty() {
				continue;
			}

			match part.split_once('-') {
				Some((lo, hi)) => {
					let lo: CpuId = lo
						.trim()
						.parse()
						.map_err(|_| TopologyError::InvalidCpuRange(s.to_string()))?;
					let hi: CpuId = hi
						.trim()
						.parse()
						.map_err(|_| TopologyError::InvalidCpuRange(s.to_string()))?;
					if lo > hi {
						return Err(TopologyError::InvalidCpuRange(s.to_string()));
					}
					set.extend(lo..=hi);
				}
				None => {
					let v: CpuId = part
						.parse()
						.map_err(|_| TopologyError::InvalidCpuRange(s.to_string()))?;
					set.insert(v);
				}
			}
		}

		Ok(Self(set))
	}

	/// Renders back to the `N-M,N-M` range syntax, lowest id first, maximal
	/// contiguous runs coalesced.
	pub fn to_range_string(&self) -> String {
		let mut out = String::new();
		let mut iter = self.0.iter().copied().peekable();

		while let Some(start) = iter.next() {
			let mut end = start;
			while iter.peek() == Some(&(end + 1)) {
				end = iter.next().unwrap();
			}

			if !out.is_empty() {
				out.push(',');
			}
			if start == end {
				out.push_str(&start.to_string());
			} else {
				out.push_str(&format!("{start}-{end}"));
			}
		}

		out
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn contains(&self, cpu: CpuId) -> bool {
		self.0.contains(&cpu)
	}

	pub fn insert(&mut self, cpu: CpuId) -> bool {
		self.0.insert(cpu)
	}

	pub fn remove(&mut self, cpu: CpuId) -> bool {
		self.0.remove(&cpu)
	}

	pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
		self.0.iter().copied()
	}

	pub fn union(&self, other: &CpuSet) -> CpuSet {
		CpuSet(self.0.union(&other.0).copied().collect())
	}

	pub fn intersection(&self, other: &CpuSet) -> CpuSet {
		CpuSet(self.0.intersection(&other.0).copied().collect())
	}

	pub fn difference(&self, other: &CpuSet) -> CpuSet {
		CpuSet(self.0.difference(&other.0).copied().collect())
	}

	pub fn is_disjoint(&self, other: &CpuSet) -> bool {
		self.0.is_disjoint(&other.0)
	}

	pub fn is_subset(&self, other: &CpuSet) -> bool {
		self.0.is_subset(&other.0)
	}

	pub fn extend(&mut self, other: &CpuSet) {
		self.0.extend(other.0.iter().copied());
	}

	pub fn first(&self) -> Option<CpuId> {
		self.0.iter().next().copied()
	}
}

impl FromIterator<CpuId> for CpuSet {
	fn from_iter<T: IntoIterator<Item = CpuId>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl fmt::Display for CpuSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_range_string())
	}
}

impl Serialize for CpuSet {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(&self.to_range_string())
	}
}

impl<'de> Deserialize<'de> for CpuSet {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		CpuSet::parse(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_simple_range() {
		let set = CpuSet::parse("0-7,16-23").unwrap();
		assert_eq!(set.len(), 16);
		assert!(set.contains(0));
		assert!(set.contains(7));
		assert!(set.contains(16));
		assert!(set.contains(23));
		assert!(!set.contains(8));
	}

	#[test]
	fn parse_single_values() {
		let set = CpuSet::parse("1,3,5").unwrap();
		assert_eq!(set.len(), 3);
		assert!(set.contains(3));
	}

	#[test]
	fn parse_empty() {
		assert!(CpuSet::parse("").unwrap().is_empty());
	}

	#[test]
	fn parse_rejects_inverted_range() {
		assert!(CpuSet::parse("8-3").is_err());
	}

	#[test]
	fn round_trip_coalesces_runs() {
		let set = CpuSet::from_ids([0, 1, 2, 3, 8, 9]);
		assert_eq!(set.to_range_string(), "0-3,8-9");
		let reparsed = CpuSet::parse(&set.to_range_string()).unwrap();
		assert_eq!(set, reparsed);
	}

	#[test]
	fn set_algebra() {
		let a = CpuSet::from_ids([0, 1, 2, 3]);
		let b = CpuSet::from_ids([2, 3, 4, 5]);
		assert_eq!(a.intersection(&b), CpuSet::from_ids([2, 3]));
		assert_eq!(a.union(&b), CpuSet::from_ids([0, 1, 2, 3, 4, 5]));
		assert_eq!(a.difference(&b), CpuSet::from_ids([0, 1]));
	}
}

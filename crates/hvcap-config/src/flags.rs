//! `PROXMOX_FEATURE_FLAGS` (spec §6): a comma-separated list, parsed once at
//! startup and threaded through constructors rather than read from a hidden
//! global in a hot path (spec §9 "Global state").

use std::collections::HashSet;
use std::env;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags(HashSet<String>);

impl FeatureFlags {
	pub fn parse(raw: &str) -> Self {
		Self(
			raw.split(',')
				.map(str::trim)
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.collect(),
		)
	}

	/// Reads `PROXMOX_FEATURE_FLAGS`; an unset or empty env var yields no
	/// flags enabled.
	pub fn from_env() -> Self {
		match env::var("PROXMOX_FEATURE_FLAGS") {
			Ok(raw) => Self::parse(&raw),
			Err(_) => Self::default(),
		}
	}

	pub fn is_enabled(&self, flag: &str) -> bool {
		self.0.contains(flag)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_splits_and_trims_comma_list() {
		let flags = FeatureFlags::parse(" a, b ,c");
		assert!(flags.is_enabled("a"));
		assert!(flags.is_enabled("b"));
		assert!(flags.is_enabled("c"));
		assert_eq!(flags.len(), 3);
	}

	#[test]
	fn parse_ignores_empty_segments() {
		let flags = FeatureFlags::parse("a,,b,");
		assert_eq!(flags.len(), 2);
	}

	#[test]
	fn empty_string_yields_no_flags() {
		assert!(FeatureFlags::parse("").is_empty());
	}
}

//! Core types shared across the miner.

use std::fmt;

/// Identifier of one logical compute unit (one FPGA slot).
///
/// Several logical units may share a single physical transport; the unit id
/// is global across all devices and stable for the life of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(pub usize);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fpga{}", self.0)
    }
}

/// Hashrate measurement in hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashRate(pub u64);

impl HashRate {
    /// Create from megahashes per second
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    /// Derive a rate from a seconds-per-hash estimate.
    pub fn from_seconds_per_hash(hs: f64) -> Self {
        if hs <= 0.0 || !hs.is_finite() {
            return Self(0);
        }
        Self((1.0 / hs) as u64)
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.0 as f64 / 1_000_000_000.0)
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000 {
            format!("{:.2} kH/s", self.0 as f64 / 1_000.0)
        } else {
            format!("{} H/s", self.0)
        }
    }
}

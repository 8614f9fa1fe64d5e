//! Startup configuration from the environment.
//!
//! Everything is parsed once, up front, into an ordered list of per-device
//! records; workers index into it by position and nothing mutates it
//! afterwards. An invalid clock range is fatal here, before any device is
//! touched, never silently clamped.
//!
//! Variables:
//!
//! - `FPGA_MINER_DEVICES` — comma-separated `path[:class[:slots]]` entries,
//!   e.g. `/dev/ttyUSB0:single,/dev/ttyUSB1:multi:4`. Class defaults to
//!   `single`, slots to 1.
//! - `FPGA_MINER_CLOCK` — comma-separated `min[:max]` MHz ranges, applied to
//!   the multi-class devices in order, e.g. `200:220,180:200`.
//! - `FPGA_MINER_SCAN_TIME` — soft scan timeout in seconds (default 10).

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::fpga::DeviceClass;

/// Soft scan timeout when none is configured.
pub const DEFAULT_SCAN_TIME: Duration = Duration::from_secs(10);

// Devices clock in 4 MHz units; step m runs at (m + 1) * 4 MHz.
const STEP_MHZ: u32 = 4;
const MIN_CLOCK_MHZ: u32 = 50;
const MAX_CLOCK_MHZ: u32 = 250;

// Most boards carry at most a handful of FPGAs behind one transport.
const MAX_SLOTS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no devices configured; set FPGA_MINER_DEVICES")]
    NoDevices,

    #[error("invalid device entry `{0}`")]
    InvalidDevice(String),

    #[error("invalid device class `{0}`")]
    InvalidClass(String),

    #[error("invalid slot count in `{0}` (1-8)")]
    InvalidSlots(String),

    #[error("invalid clock entry `{0}`")]
    InvalidClock(String),

    #[error("clock frequency {0} MHz out of range (50-250)")]
    ClockOutOfRange(u32),

    #[error("clock maximum {max} MHz below minimum {min} MHz")]
    ClockMaxBelowMin { min: u32, max: u32 },

    #[error("invalid scan time `{0}`")]
    InvalidScanTime(String),
}

/// Clock-step range for a frequency-tunable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRange {
    pub default_step: usize,
    pub max_step: usize,
}

impl ClockRange {
    /// 200 MHz default, probing up to the 250 MHz hardware limit.
    pub const DEFAULT: ClockRange = ClockRange {
        default_step: 49,
        max_step: 61,
    };
}

/// One physical device as configured at startup.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: String,
    pub class: DeviceClass,
    /// Logical units multiplexed behind this transport.
    pub slots: usize,
    /// Clock range for multi-class devices; `None` for single-class.
    pub clock: Option<ClockRange>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    pub scan_timeout: Duration,
}

impl Config {
    /// Read and validate the whole configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let devices = env::var("FPGA_MINER_DEVICES").unwrap_or_default();
        let clocks = env::var("FPGA_MINER_CLOCK").unwrap_or_default();
        let scan_time = env::var("FPGA_MINER_SCAN_TIME").ok();
        Self::parse(&devices, &clocks, scan_time.as_deref())
    }

    /// Parse configuration strings. Split out from [`Config::from_env`] so it
    /// is testable without touching process state.
    pub fn parse(
        devices: &str,
        clocks: &str,
        scan_time: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if devices.trim().is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut clock_entries = clocks
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_clock)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();

        let mut parsed = Vec::new();
        for entry in devices.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut device = parse_device(entry)?;
            if device.class == DeviceClass::Multi {
                // Clock ranges pair up with multi-class devices in order;
                // devices past the list fall back to the default range.
                device.clock = Some(clock_entries.next().unwrap_or(ClockRange::DEFAULT));
            }
            parsed.push(device);
        }
        if parsed.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let scan_timeout = match scan_time {
            None => DEFAULT_SCAN_TIME,
            Some(raw) => {
                let secs: u64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidScanTime(raw.to_string()))?;
                if secs == 0 {
                    return Err(ConfigError::InvalidScanTime(raw.to_string()));
                }
                Duration::from_secs(secs)
            }
        };

        Ok(Config {
            devices: parsed,
            scan_timeout,
        })
    }
}

fn parse_device(entry: &str) -> Result<DeviceConfig, ConfigError> {
    let mut parts = entry.split(':');
    let path = match parts.next() {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(ConfigError::InvalidDevice(entry.to_string())),
    };

    let class = match parts.next() {
        None => DeviceClass::Single,
        Some("single") => DeviceClass::Single,
        Some("multi") => DeviceClass::Multi,
        Some(other) => return Err(ConfigError::InvalidClass(other.to_string())),
    };

    let slots = match parts.next() {
        None => 1,
        Some(raw) => raw
            .parse()
            .ok()
            .filter(|n| (1..=MAX_SLOTS).contains(n))
            .ok_or_else(|| ConfigError::InvalidSlots(entry.to_string()))?,
    };
    if class == DeviceClass::Single && slots != 1 {
        return Err(ConfigError::InvalidSlots(entry.to_string()));
    }
    if parts.next().is_some() {
        return Err(ConfigError::InvalidDevice(entry.to_string()));
    }

    Ok(DeviceConfig {
        path,
        class,
        slots,
        clock: None,
    })
}

fn parse_clock(entry: &str) -> Result<ClockRange, ConfigError> {
    let mut parts = entry.split(':');
    let min: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ConfigError::InvalidClock(entry.to_string()))?;
    let max: Option<u32> = match parts.next() {
        None => None,
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ConfigError::InvalidClock(entry.to_string()))?,
        ),
    };
    if parts.next().is_some() {
        return Err(ConfigError::InvalidClock(entry.to_string()));
    }

    let default_step = mhz_to_step(min)?;
    let max_step = match max {
        None => ClockRange::DEFAULT.max_step,
        Some(max) => {
            let step = mhz_to_step(max)?;
            if step < default_step {
                return Err(ConfigError::ClockMaxBelowMin { min, max });
            }
            step
        }
    };

    Ok(ClockRange {
        default_step,
        max_step,
    })
}

fn mhz_to_step(mhz: u32) -> Result<usize, ConfigError> {
    if !(MIN_CLOCK_MHZ..=MAX_CLOCK_MHZ).contains(&mhz) {
        return Err(ConfigError::ClockOutOfRange(mhz));
    }
    Ok((mhz / STEP_MHZ - 1) as usize)
}

//! Configuration structs
//!
//! Every protocol instance takes its configuration at construction. Values
//! given in "uus" are UWB microseconds (see [`time`]); values given in "us"
//! are real microseconds of the CPU timer.
//!
//! All structs implement `Default` with values suitable for a 6.8 Mbps link,
//! and can be (de)serialized with serde so they can be loaded from a
//! management interface.
//!
//! [`time`]: ../time/index.html

use serde::{Deserialize, Serialize};

use crate::{ccp::CcpRole, registry::DeviceId};

/// Clock calibration configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CcpConfig {
    /// Role taken when the instance is started
    pub role: CcpRole,
    /// Superframe period in uus, a multiple of 0x10000
    pub period_uus: u32,
    /// Delay between a relay receiving a blink and forwarding it, in uus
    pub tx_holdoff_dly_uus: u32,
    /// Consecutive missed blinks still extrapolated before sync is lost
    pub tolerate_missed: u16,
    /// Blinks from the same master needed before the epoch is trusted
    pub valid_threshold: u16,
    /// Relay hops a master allows
    pub max_cascade_rpts: u8,
    /// Extra listen time to cover crystal trim differences, in uus
    pub xtalt_guard_uus: u32,
    /// Receive timeout used while hunting for a lost master, in uus
    pub long_rx_timeout_uus: u32,
    /// CPU latency between a timer firing and its event running, in us
    pub os_latency_us: u32,
}

impl Default for CcpConfig {
    fn default() -> Self {
        CcpConfig {
            role: CcpRole::Slave,
            period_uus: 0x10000,
            tx_holdoff_dly_uus: 0x0300,
            tolerate_missed: 8,
            valid_threshold: 2,
            max_cascade_rpts: 0,
            xtalt_guard_uus: 100,
            long_rx_timeout_uus: 0xfffe,
            os_latency_us: 100,
        }
    }
}

/// Clock estimator configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WcsConfig {
    /// Largest accepted clock rate deviation, in parts per million
    pub max_ppm: f64,
}

impl Default for WcsConfig {
    fn default() -> Self {
        WcsConfig { max_ppm: 100.0 }
    }
}

/// Slot scheduler configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TdmaConfig {
    /// Number of slots per superframe
    pub nslots: u16,
    /// Slot timers fire this much before the slot boundary, in us
    pub os_latency_us: u32,
    /// Slots starting more than this late are dropped, in us. 0 disables.
    pub max_slot_delay_us: u32,
}

impl Default for TdmaConfig {
    fn default() -> Self {
        TdmaConfig {
            nslots: 16,
            os_latency_us: 100,
            max_slot_delay_us: 800,
        }
    }
}

/// Two-way ranging configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RngConfig {
    /// Delay between receiving a ranging frame and answering it, in uus
    pub tx_holdoff_delay_uus: u32,
    /// Margin added to the expected frame duration for receive timeouts, in uus
    pub rx_timeout_delay_uus: u32,
    /// Number of frames in the circular pool
    pub nframes: usize,
}

impl Default for RngConfig {
    fn default() -> Self {
        RngConfig {
            tx_holdoff_delay_uus: 0x0300,
            rx_timeout_delay_uus: 0x0020,
            nframes: 4,
        }
    }
}

/// Time-of-flight table configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TofDbConfig {
    /// Number of neighbours the table can hold
    pub capacity: usize,
    /// Samples folded into each mean, 0 for no limit
    pub max_updates: u32,
}

impl Default for TofDbConfig {
    fn default() -> Self {
        TofDbConfig {
            capacity: 64,
            max_updates: 0,
        }
    }
}

/// Everything a node needs
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct NodeConfig {
    /// Device this node drives
    pub device: DeviceId,
    /// Clock calibration
    pub ccp: CcpConfig,
    /// Clock estimator
    pub wcs: WcsConfig,
    /// Slot scheduler
    pub tdma: TdmaConfig,
    /// Two-way ranging
    pub rng: RngConfig,
    /// Time-of-flight table
    pub tofdb: TofDbConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = NodeConfig::default();

        assert_eq!(config.ccp.period_uus % crate::ccp::PERIOD_GRANULARITY_UUS, 0);
        assert!(config.tdma.nslots > 0);
        assert!(config.rng.nframes > 1);
    }
}

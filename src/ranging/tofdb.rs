//! Per-neighbour time-of-flight table
//!
//! Keeps a running mean of the measured time of flight to each neighbour,
//! keyed by short address. Relays and slaves use it to remove the propagation
//! delay from received clock calibration epochs.

use std::{any::Any, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    config::TofDbConfig,
    mac::{MacContext, MacInterface},
    ranging::RangeResult,
    stats_section, Error,
};

/// Largest accepted deviation from the running mean, in device time units
pub const MAX_TOF_DEVIATION: f32 = 2.0 / 0.047;

/// Supplies the time of flight to a neighbour, in device time units
///
/// Returns 0 if the neighbour is unknown.
pub trait TofCompensation: Send {
    /// Time of flight to `short_address`
    fn tof(&self, short_address: u16) -> u32;
}

/// One neighbour's entry
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TofNode {
    /// Short address, 0 marks a free entry
    pub addr: u16,
    /// CPU time of the last accepted sample
    pub last_updated: u32,
    /// Running mean
    pub tof: f32,
    /// Sum of accepted samples
    pub sum: f32,
    /// Sum of squared samples
    pub sum_sq: f32,
    /// Number of accepted samples
    pub num: u32,
}

impl TofNode {
    /// Sample standard deviation, `None` with fewer than two samples
    pub fn std_dev(&self) -> Option<f32> {
        if self.num < 2 {
            return None;
        }
        let n = self.num as f32;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        Some(variance.max(0.0).sqrt())
    }
}

stats_section! {
    /// Time-of-flight table counters
    pub struct TofDbStats: "tofdb" {
        /// New neighbours
        inserted,
        /// Samples folded into a running mean
        updated,
        /// Samples rejected as outliers or over the update limit
        rejected,
    }
}

/// Fixed-capacity time-of-flight table
#[derive(Debug)]
pub struct TofDb {
    nodes: Vec<TofNode>,
    max_updates: u32,
    stats: TofDbStats,
}

impl TofDb {
    /// Creates an empty table
    pub fn new(config: &TofDbConfig) -> Self {
        TofDb {
            nodes: vec![TofNode::default(); config.capacity],
            max_updates: config.max_updates,
            stats: TofDbStats::default(),
        }
    }

    /// Wraps the table so it can be shared with the clock calibration
    pub fn shared(self) -> SharedTofDb {
        Arc::new(Mutex::new(self))
    }

    /// Returns the time of flight to `addr`, truncated to whole ticks
    pub fn get_tof(&self, addr: u16) -> Result<u32, Error> {
        self.node(addr).map(|node| node.tof as u32)
    }

    /// Returns the full entry for `addr`
    pub fn node(&self, addr: u16) -> Result<&TofNode, Error> {
        if addr == 0 {
            return Err(Error::InvalidArgument);
        }
        self.nodes
            .iter()
            .find(|node| node.addr == addr)
            .ok_or(Error::NotFound)
    }

    /// Records a new measurement for `addr`
    ///
    /// For a known neighbour, samples further than [`MAX_TOF_DEVIATION`] from
    /// the current mean are dropped silently, as are samples past the
    /// configured update limit. Unknown neighbours take a free entry; if none
    /// is left, `NoMemory` is returned.
    ///
    /// [`MAX_TOF_DEVIATION`]: constant.MAX_TOF_DEVIATION.html
    pub fn set_tof(&mut self, addr: u16, tof: u32, now: u32) -> Result<(), Error> {
        if addr == 0 {
            return Err(Error::InvalidArgument);
        }
        let sample = tof as f32;

        if let Some(node) = self.nodes.iter_mut().find(|node| node.addr == addr) {
            if (sample - node.tof).abs() > MAX_TOF_DEVIATION {
                debug!(addr, tof, mean = node.tof, "tof outlier rejected");
                self.stats.rejected.inc();
                return Ok(());
            }
            if self.max_updates > 1 && node.num >= self.max_updates {
                self.stats.rejected.inc();
                return Ok(());
            }

            node.num += 1;
            node.sum += sample;
            node.sum_sq += sample * sample;
            node.tof = node.sum / node.num as f32;
            node.last_updated = now;
            self.stats.updated.inc();
            return Ok(());
        }

        let free = self
            .nodes
            .iter_mut()
            .find(|node| node.addr == 0)
            .ok_or(Error::NoMemory)?;

        *free = TofNode {
            addr,
            last_updated: now,
            tof: sample,
            sum: sample,
            sum_sq: sample * sample,
            num: 1,
        };
        trace!(addr, tof, "tof entry added");
        self.stats.inserted.inc();
        Ok(())
    }

    /// Forgets every neighbour
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            *node = TofNode::default();
        }
    }

    /// Iterates over the occupied entries
    pub fn iter(&self) -> impl Iterator<Item = &TofNode> {
        self.nodes.iter().filter(|node| node.addr != 0)
    }

    /// Table statistics
    pub fn stats(&self) -> &TofDbStats {
        &self.stats
    }
}

impl TofCompensation for TofDb {
    fn tof(&self, short_address: u16) -> u32 {
        self.get_tof(short_address).unwrap_or(0)
    }
}

/// A table shared between the ranging results and the clock calibration
pub type SharedTofDb = Arc<Mutex<TofDb>>;

impl TofCompensation for SharedTofDb {
    fn tof(&self, short_address: u16) -> u32 {
        self.lock().tof(short_address)
    }
}

/// Folds every finished range measurement into a shared table
pub struct TofDbUpdater {
    db: SharedTofDb,
}

impl TofDbUpdater {
    /// Creates an updater feeding `db`
    pub fn new(db: SharedTofDb) -> Self {
        TofDbUpdater { db }
    }
}

impl MacInterface for TofDbUpdater {
    fn name(&self) -> &'static str {
        "tofdb"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn complete(&mut self, ctx: &mut MacContext, result: &RangeResult) {
        if !result.tof.is_finite() || result.tof < 0.0 {
            return;
        }
        let now = ctx.timer.now();
        if let Err(error) = self.db.lock().set_tof(result.peer, result.tof as u32, now) {
            debug!(%error, peer = result.peer, "tof not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WcsConfig,
        frame::{RangeFinal, RangingCode},
        hal::mock::{MockRadio, MockTimer},
        wcs::Wcs,
    };

    fn db(capacity: usize) -> TofDb {
        TofDb::new(&TofDbConfig {
            capacity,
            max_updates: 0,
        })
    }

    #[test]
    fn outlier_is_rejected() {
        let mut db = db(4);
        db.set_tof(0x123, 200, 0).unwrap();
        db.set_tof(0x123, 250, 1).unwrap();

        assert_eq!(db.get_tof(0x123).unwrap(), 200);
        assert_eq!(db.stats().rejected.get(), 1);
    }

    #[test]
    fn close_sample_updates_mean() {
        let mut db = db(4);
        db.set_tof(0x123, 200, 0).unwrap();
        db.set_tof(0x123, 220, 5).unwrap();

        let node = db.node(0x123).unwrap();
        assert_eq!(node.tof, 210.0);
        assert_eq!(node.num, 2);
        assert_eq!(node.last_updated, 5);
        assert!((node.std_dev().unwrap() - 14.142_136).abs() < 1e-3);
    }

    #[test]
    fn full_table_reports_no_memory() {
        let mut db = db(3);
        for addr in 1..=3 {
            db.set_tof(addr, 100, 0).unwrap();
        }

        assert!(matches!(db.set_tof(4, 100, 0), Err(Error::NoMemory)));
        assert_eq!(db.iter().count(), 3);
    }

    #[test]
    fn lookups() {
        let mut db = db(4);
        db.set_tof(0x123, 666, 0).unwrap();

        assert_eq!(db.get_tof(0x123).unwrap(), 666);
        assert!(matches!(db.get_tof(0x124), Err(Error::NotFound)));
        assert!(matches!(db.get_tof(0), Err(Error::InvalidArgument)));
        assert!(matches!(db.set_tof(0, 1, 0), Err(Error::InvalidArgument)));
    }

    #[test]
    fn update_limit() {
        let mut db = TofDb::new(&TofDbConfig {
            capacity: 1,
            max_updates: 2,
        });
        db.set_tof(7, 100, 0).unwrap();
        db.set_tof(7, 110, 0).unwrap();
        db.set_tof(7, 130, 0).unwrap();

        assert_eq!(db.get_tof(7).unwrap(), 105);
    }

    #[test]
    fn shared_table_compensates() {
        let shared = db(2).shared();
        shared.lock().set_tof(9, 42, 0).unwrap();

        assert_eq!(TofCompensation::tof(&shared, 9), 42);
        assert_eq!(TofCompensation::tof(&shared, 10), 0);
    }

    #[test]
    fn updater_records_results() {
        let shared = db(4).shared();
        let mut updater = TofDbUpdater::new(shared.clone());

        let mut radio = MockRadio::new(1);
        let mut timer = MockTimer {
            now: 77,
            ..MockTimer::default()
        };
        let wcs = Wcs::new(&WcsConfig::default());
        let mut completions = Vec::new();
        let mut ctx = MacContext {
            radio: &mut radio,
            timer: &mut timer,
            wcs: &wcs,
            completions: &mut completions,
        };

        let result = RangeResult {
            code: RangingCode::SsTwrFinal,
            peer: 0x42,
            seq_num: 1,
            tof: 213.9,
            range_m: 1.0,
            skew: 0.0,
            frame: RangeFinal::default(),
        };
        updater.complete(&mut ctx, &result);
        updater.complete(&mut ctx, &RangeResult { tof: f64::NAN, ..result });

        let db = shared.lock();
        let node = db.node(0x42).unwrap();
        assert_eq!(node.tof, 213.0);
        assert_eq!(node.num, 1);
        assert_eq!(node.last_updated, 77);
    }
}

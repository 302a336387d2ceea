//! Statistics counters exposed to an external reporting layer
//!
//! Each protocol module declares its counters with [`stats_section!`]. The
//! core only increments them; how they are rendered is up to the caller.
//!
//! [`stats_section!`]: ../macro.stats_section.html

use serde::{Deserialize, Serialize};

/// A monotonically increasing event counter
///
/// Wraps on overflow instead of panicking.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Counter(u32);

impl Counter {
    /// Increments the counter by one
    pub fn inc(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Adds `n` to the counter
    pub fn add(&mut self, n: u32) {
        self.0 = self.0.wrapping_add(n);
    }

    /// Returns the current count
    pub fn get(&self) -> u32 {
        self.0
    }
}

/// Implemented by every statistics section
pub trait Stats {
    /// Name of the section, e.g. `"ccp"`
    fn section(&self) -> &'static str;

    /// All `(name, value)` pairs in declaration order
    fn counters(&self) -> Vec<(&'static str, u32)>;
}

/// A named snapshot of one statistics section
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Snapshot {
    /// Name of the section
    pub section: String,

    /// Counter values by name
    pub counters: Vec<(String, u32)>,
}

impl Snapshot {
    /// Captures the current values of a section
    pub fn of(stats: &dyn Stats) -> Self {
        Snapshot {
            section: stats.section().to_owned(),
            counters: stats
                .counters()
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value))
                .collect(),
        }
    }

    /// Returns the value of a counter in this snapshot
    pub fn get(&self, name: &str) -> Option<u32> {
        self.counters
            .iter()
            .find(|(counter, _)| counter == name)
            .map(|(_, value)| *value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats_section;

    stats_section! {
        pub struct TestStats: "test" {
            first,
            second,
        }
    }

    #[test]
    fn counters_are_listed_in_order() {
        let mut stats = TestStats::default();
        stats.second.add(3);
        stats.first.inc();

        assert_eq!(stats.counters(), vec![("first", 1), ("second", 3)]);
    }

    #[test]
    fn snapshot_keeps_values() {
        let mut stats = TestStats::default();
        stats.first.inc();

        let snapshot = Snapshot::of(&stats);
        stats.clear();

        assert_eq!(snapshot.section, "test");
        assert_eq!(snapshot.get("first"), Some(1));
        assert_eq!(stats.get("first"), Some(0));
    }

    #[test]
    fn counter_wraps() {
        let mut counter = Counter(u32::MAX);
        counter.inc();
        assert_eq!(counter.get(), 0);
    }
}

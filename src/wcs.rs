//! Wireless clock synchronization
//!
//! Estimates the master clock as seen from the local radio clock. Every
//! clock calibration epoch yields one observation: the master's transmission
//! timestamp and the local reception timestamp of the same frame. From the
//! two most recent observations the estimator derives a clock state vector
//! `(time, skew, drift)` in closed form and predicts master time for any
//! local timestamp as
//!
//! ``` text
//! master(T) = time + skew * T + drift * T^2 / 2
//! ```
//!
//! where `T` is the local time elapsed since the latest observation, in
//! device time units.
//!
//! Until two observations have been accepted, the model is invalid and all
//! conversions return `None`.

use tracing::{debug, trace, warn};

use crate::{
    ccp::{EpochKind, EpochUpdate},
    config::WcsConfig,
    hal::Radio,
    stats_section,
    time::{elapsed40, MASK40},
};

/// Clock state vector at the latest observation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockState {
    /// Lower 40 bits of master time, in master ticks
    pub time: f64,
    /// Master ticks per local tick
    pub skew: f64,
    /// Change of `skew` per local tick
    pub drift: f64,
}

impl Default for ClockState {
    fn default() -> Self {
        ClockState {
            time: 0.0,
            skew: 1.0,
            drift: 0.0,
        }
    }
}

impl ClockState {
    /// Predicts master time `t` local ticks after the observation
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_core::wcs::ClockState;
    ///
    /// let state = ClockState { time: 100.0, skew: 2.0, drift: 0.5 };
    /// assert_eq!(state.predict(4.0), 100.0 + 8.0 + 4.0);
    /// ```
    pub fn predict(&self, t: f64) -> f64 {
        self.time + self.skew * t + 0.5 * self.drift * t * t
    }

    /// Moves the state `t` local ticks forward
    fn advance(&self, t: f64) -> ClockState {
        ClockState {
            time: self.predict(t),
            skew: self.skew + self.drift * t,
            drift: self.drift,
        }
    }
}

stats_section! {
    /// Clock estimator counters
    pub struct WcsStats: "wcs" {
        /// Observations folded into the model
        update,
        /// Observations outside the accepted rate deviation
        rejected,
        /// Epochs carried forward without an observation
        extrapolated,
        /// Model resets
        reset,
    }
}

/// Out-of-range samples in a row after which the fit restarts from the latest
const MAX_REJECTIONS: u8 = 2;

#[derive(Clone, Copy, Debug)]
struct Observation {
    master: u64,
    local: u64,
}

/// Wireless clock synchronization instance
#[derive(Debug)]
pub struct Wcs {
    max_deviation: f64,
    state: ClockState,
    valid: bool,
    observations: u32,
    last: Option<Observation>,
    previous_rate: Option<(f64, f64)>,
    rejections: u8,
    master_epoch: u64,
    local_epoch: u64,
    normalized_skew: f64,
    fractional_skew: f64,
    stats: WcsStats,
}

impl Wcs {
    /// Creates an estimator without any observations
    pub fn new(config: &WcsConfig) -> Self {
        Wcs {
            max_deviation: config.max_ppm * 1e-6,
            state: ClockState::default(),
            valid: false,
            observations: 0,
            last: None,
            previous_rate: None,
            rejections: 0,
            master_epoch: 0,
            local_epoch: 0,
            normalized_skew: 1.0,
            fractional_skew: 0.0,
            stats: WcsStats::default(),
        }
    }

    /// Feeds one clock calibration epoch into the model
    ///
    /// Extrapolated epochs only carry the model forward. An epoch the
    /// calibration doesn't trust yet restarts the fit from that epoch.
    pub fn observe(&mut self, epoch: &EpochUpdate) {
        if epoch.kind == EpochKind::Extrapolated {
            self.extrapolate(epoch);
            return;
        }
        if !epoch.valid {
            self.reset();
        }
        self.update(epoch.master_epoch, epoch.local_epoch);
    }

    /// Adds the observation `(master, local)` to the model
    ///
    /// `master` is the master's full 64-bit epoch, `local` a 40-bit local
    /// timestamp of the same instant.
    pub fn update(&mut self, master: u64, local: u64) {
        let local = local & MASK40;
        let current = Observation { master, local };

        let last = match self.last.replace(current) {
            Some(last) => last,
            None => {
                self.anchor(master, local);
                self.observations = 1;
                return;
            }
        };

        let dm = elapsed40(last.master, master) as f64;
        let dl = elapsed40(last.local, local) as f64;
        if dl == 0.0 {
            self.last = Some(last);
            self.stats.rejected.inc();
            return;
        }

        let rate = dm / dl;
        let drift = match self.previous_rate {
            Some((previous, previous_dl)) => (rate - previous) / ((dl + previous_dl) / 2.0),
            None => 0.0,
        };
        let skew = rate + drift * dl / 2.0;
        if (rate - 1.0).abs() >= self.max_deviation || (skew - 1.0).abs() >= self.max_deviation {
            self.stats.rejected.inc();
            self.valid = false;
            self.set_skew(1.0);
            self.rejections = self.rejections.saturating_add(1);
            if self.rejections < MAX_REJECTIONS {
                warn!(ppm = (skew - 1.0) * 1e6, "clock rate out of range, sample dropped");
                self.last = Some(last);
                return;
            }
            warn!(ppm = (skew - 1.0) * 1e6, "clock rate out of range, restarting fit");
            self.invalidate();
            self.last = Some(current);
            self.anchor(master, local);
            self.observations = 1;
            return;
        }
        self.rejections = 0;
        self.previous_rate = Some((rate, dl));

        self.anchor(master, local);
        self.state.skew = skew;
        self.state.drift = drift;
        self.observations = self.observations.saturating_add(1);
        self.valid = self.observations >= 2;
        self.set_skew(self.state.skew);
        self.stats.update.inc();

        trace!(
            skew = self.state.skew,
            drift = self.state.drift,
            "clock model updated"
        );
    }

    /// Forgets all observations
    pub fn reset(&mut self) {
        if self.observations > 0 {
            debug!("clock model reset");
        }
        self.invalidate();
        self.state = ClockState::default();
        self.stats.reset.inc();
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.observations = 0;
        self.last = None;
        self.previous_rate = None;
        self.rejections = 0;
        self.set_skew(1.0);
    }

    fn anchor(&mut self, master: u64, local: u64) {
        self.master_epoch = master;
        self.local_epoch = local;
        self.state.time = (master & MASK40) as f64;
    }

    fn set_skew(&mut self, skew: f64) {
        self.normalized_skew = skew;
        self.fractional_skew = 1.0 - skew;
    }

    fn extrapolate(&mut self, epoch: &EpochUpdate) {
        self.stats.extrapolated.inc();
        if self.last.is_none() {
            return;
        }
        let t = elapsed40(self.local_epoch, epoch.local_epoch) as f64;
        let advanced = self.state.advance(t);

        self.local_epoch = epoch.local_epoch & MASK40;
        self.master_epoch = self
            .master_epoch
            .wrapping_add((advanced.time - self.state.time) as u64);
        self.state = ClockState {
            time: (self.master_epoch & MASK40) as f64,
            ..advanced
        };
        self.set_skew(if self.valid { self.state.skew } else { 1.0 });
    }

    /// Returns `true` once the model can convert timestamps
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The current clock state vector
    pub fn state(&self) -> ClockState {
        self.state
    }

    /// Master ticks per local tick, 1.0 while invalid
    pub fn normalized_skew(&self) -> f64 {
        self.normalized_skew
    }

    /// `1 - normalized_skew`, 0.0 while invalid
    pub fn fractional_skew(&self) -> f64 {
        self.fractional_skew
    }

    /// Scales a local duration into master ticks
    pub fn skew_compensation(&self, value: f64) -> f64 {
        value * (1.0 - self.fractional_skew)
    }

    /// Scales a local 40-bit duration into master ticks
    ///
    /// Returns `dtu` unchanged (masked to 40 bits) while the model is
    /// invalid.
    pub fn dtu_time_adjust(&self, dtu: u64) -> u64 {
        if self.valid {
            (self.normalized_skew * dtu as f64) as u64 & MASK40
        } else {
            dtu & MASK40
        }
    }

    /// Converts a local timestamp to the master timebase, keeping the
    /// master's upper 24 bits
    ///
    /// `dtu` must lie within one 40-bit wrap after the latest epoch.
    pub fn local_to_master64(&self, dtu: u64) -> Option<u64> {
        if !self.valid {
            return None;
        }
        let delta = elapsed40(self.local_epoch, dtu) as f64;
        let lo40 = self.state.predict(delta);

        Some((self.master_epoch & !MASK40).wrapping_add(lo40 as u64))
    }

    /// Converts a local 40-bit timestamp to a 40-bit master timestamp
    pub fn local_to_master(&self, dtu: u64) -> Option<u64> {
        self.local_to_master64(dtu).map(|master| master & MASK40)
    }

    /// Reads the radio's current time in the master timebase
    pub fn read_systime_master(&self, radio: &mut dyn Radio) -> Option<u64> {
        let now = radio.read_systime();
        self.local_to_master(now)
    }

    /// Estimator statistics
    pub fn stats(&self) -> &WcsStats {
        &self.stats
    }
}

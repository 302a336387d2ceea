//! Slot scheduler
//!
//! The superframe between two clock calibration epochs is split into
//! `nslots` slots of equal length. Every epoch re-anchors the schedule: the
//! timers of all assigned slots are re-armed relative to the new epoch, so
//! slot timing never accumulates local clock error across superframes.
//!
//! Slot timers only post an event. The node's worker then calls
//! [`Tdma::on_timer`], which runs the slot's handler with a [`SlotContext`].
//! Handlers use [`SlotContext::rx_slot_start`] and
//! [`SlotContext::tx_slot_start`] to place radio operations precisely within
//! their slot.
//!
//! If no epoch arrives, a superframe timer armed one slot past the expected
//! epoch fires instead. The miss is counted and the schedule carries on from
//! the last epoch, extrapolated by the local clock.
//!
//! [`Tdma::on_timer`]: struct.Tdma.html#method.on_timer
//! [`SlotContext`]: struct.SlotContext.html
//! [`SlotContext::rx_slot_start`]: struct.SlotContext.html#method.rx_slot_start
//! [`SlotContext::tx_slot_start`]: struct.SlotContext.html#method.tx_slot_start

use tracing::{debug, trace, warn};

use crate::{
    ccp::{EpochKind, EpochUpdate},
    config::TdmaConfig,
    hal::{is_past, offset_ticks, CpuTimer, Radio, TimerId},
    mac::MacChain,
    stats_section,
    time::{dwt_usecs_to_usecs, usecs_to_dwt_usecs, MASK40, UUS_SHIFT},
    wcs::Wcs,
    Error,
};

stats_section! {
    /// Slot scheduler counters
    pub struct TdmaStats: "tdma" {
        /// Slot and superframe timer expiries
        slot_timer_cnt,
        /// Superframes scheduled from a clock calibration epoch
        superframe_cnt,
        /// Superframe timer expiries without an epoch
        superframe_miss,
        /// Slots skipped because they would have started too late
        dropped_slots,
    }
}

/// Called at the start of an assigned slot
pub type SlotHandler = Box<dyn FnMut(&mut SlotContext) + Send>;

/// Timing of the current superframe, captured when it was scheduled
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlotTiming {
    /// Local 40-bit timestamp of the epoch
    pub local_epoch: u64,
    /// Superframe period, in uus
    pub period_uus: u32,
    /// Number of slots per superframe
    pub nslots: u16,
    /// Time the receiver needs to become ready, in uus
    pub rx_stable_uus: u32,
    /// Duration of preamble and SFD, in us
    pub shr_duration_us: f64,
}

impl SlotTiming {
    /// Length of one slot, in device time units
    pub fn slot_period_dtu(&self) -> u64 {
        (u64::from(self.period_uus) << UUS_SHIFT) / u64::from(self.nslots.max(1))
    }

    /// When to enable the receiver for a frame arriving at the start of slot
    /// `idx`
    ///
    /// `idx` may be fractional, e.g. `2.5` for the second half of slot 2. The
    /// offset from the epoch is scaled by the clock model's skew.
    pub fn rx_slot_start(&self, wcs: &Wcs, idx: f32) -> u64 {
        let rx_stable = (u64::from(self.rx_stable_uus) << UUS_SHIFT) as f64;
        let offset = f64::from(idx) * self.slot_period_dtu() as f64 - rx_stable;

        let adjusted = if offset >= 0.0 {
            wcs.dtu_time_adjust(offset as u64)
        } else {
            wcs.dtu_time_adjust(-offset as u64).wrapping_neg()
        };
        self.local_epoch.wrapping_add(adjusted) & MASK40
    }

    /// When to start a transmission so that its RMARKER leaves at the start
    /// of slot `idx`
    pub fn tx_slot_start(&self, wcs: &Wcs, idx: f32) -> u64 {
        let shr = usecs_to_dwt_usecs(self.shr_duration_us).ceil() as u64;
        self.rx_slot_start(wcs, idx).wrapping_add(shr << UUS_SHIFT) & MASK40
    }
}

/// What a slot handler gets to work with
pub struct SlotContext<'a> {
    /// Index of the slot that started
    pub idx: u16,
    /// Timing of the current superframe
    pub timing: SlotTiming,
    /// The device's radio
    pub radio: &'a mut dyn Radio,
    /// The device's CPU timer
    pub timer: &'a mut dyn CpuTimer,
    /// Clock model of the device
    pub wcs: &'a Wcs,
    /// Protocols attached to the radio
    pub chain: &'a mut MacChain,
}

impl SlotContext<'_> {
    /// See [`SlotTiming::rx_slot_start`](struct.SlotTiming.html#method.rx_slot_start)
    pub fn rx_slot_start(&self, idx: f32) -> u64 {
        self.timing.rx_slot_start(self.wcs, idx)
    }

    /// See [`SlotTiming::tx_slot_start`](struct.SlotTiming.html#method.tx_slot_start)
    pub fn tx_slot_start(&self, idx: f32) -> u64 {
        self.timing.tx_slot_start(self.wcs, idx)
    }
}

struct Slot {
    handler: SlotHandler,
    start: u32,
}

/// Slot scheduler of one radio
pub struct Tdma {
    config: TdmaConfig,
    slots: Vec<Option<Slot>>,
    running: bool,
    epoch: Option<EpochUpdate>,
    timing: SlotTiming,
    superframe_start: u32,
    cursor: Option<u16>,
    stats: TdmaStats,
}

impl Tdma {
    /// Creates a stopped scheduler without any assigned slot
    pub fn new(config: &TdmaConfig) -> Result<Self, Error> {
        if config.nslots == 0 {
            return Err(Error::InvalidSlotCount(config.nslots));
        }
        Ok(Tdma {
            config: config.clone(),
            slots: (0..config.nslots).map(|_| None).collect(),
            running: false,
            epoch: None,
            timing: SlotTiming {
                local_epoch: 0,
                period_uus: 0,
                nslots: config.nslots,
                rx_stable_uus: 0,
                shr_duration_us: 0.0,
            },
            superframe_start: 0,
            cursor: None,
            stats: TdmaStats::default(),
        })
    }

    /// Number of slots per superframe
    pub fn nslots(&self) -> u16 {
        self.config.nslots
    }

    /// Binds `handler` to slot `idx`, replacing any previous handler
    ///
    /// Takes effect from the next superframe on.
    pub fn assign_slot(&mut self, idx: u16, handler: SlotHandler) -> Result<(), Error> {
        let start = self.slot_mut(idx)?.as_ref().map_or(0, |slot| slot.start);
        self.slots[usize::from(idx)] = Some(Slot { handler, start });
        trace!(slot = idx, "slot assigned");
        Ok(())
    }

    /// Unbinds slot `idx` and cancels its timer
    ///
    /// Releasing a free slot does nothing.
    pub fn release_slot(&mut self, idx: u16, timer: &mut dyn CpuTimer) -> Result<(), Error> {
        if self.slot_mut(idx)?.take().is_some() {
            timer.stop(TimerId::Slot(idx));
            trace!(slot = idx, "slot released");
        }
        Ok(())
    }

    /// Returns `true` if a handler is bound to slot `idx`
    pub fn is_assigned(&self, idx: u16) -> bool {
        self.slots
            .get(usize::from(idx))
            .map_or(false, |slot| slot.is_some())
    }

    /// Starts waiting for the first superframe
    ///
    /// If no epoch arrives within `period_uus` plus one slot, the superframe
    /// timer reports a miss.
    pub fn start(&mut self, timer: &mut dyn CpuTimer, period_uus: u32) {
        self.running = true;
        self.timing.period_uus = period_uus;
        self.superframe_start = offset_ticks(timer, timer.now(), self.superframe_timeout_us());
        self.arm(timer, TimerId::Superframe, self.superframe_start);
        debug!(nslots = self.config.nslots, "tdma started");
    }

    /// Cancels every timer
    ///
    /// Slots stay assigned. No slot handler runs until the next `start`.
    pub fn stop(&mut self, timer: &mut dyn CpuTimer) {
        self.running = false;
        self.stop_timers(timer);
        debug!("tdma stopped");
    }

    /// Stops the scheduler and releases all slots
    pub fn teardown(&mut self, timer: &mut dyn CpuTimer) {
        self.stop(timer);
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Re-anchors the schedule to a new epoch
    pub fn on_superframe(&mut self, epoch: &EpochUpdate, radio: &dyn Radio, timer: &mut dyn CpuTimer) {
        if !self.running {
            return;
        }
        self.stats.superframe_cnt.inc();

        let phy = radio.phy_timing();
        self.timing.rx_stable_uus = phy.rx_stable_uus;
        self.timing.shr_duration_us = phy.shr_duration_us;
        self.schedule(epoch, timer);
    }

    /// Handles an expiry of a scheduler timer
    ///
    /// Runs the handler of an expired slot, unless the slot started more than
    /// the configured maximum delay ago. Returns `false` for timers that
    /// don't belong to the scheduler.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        radio: &mut dyn Radio,
        timer: &mut dyn CpuTimer,
        wcs: &Wcs,
        chain: &mut MacChain,
    ) -> bool {
        match id {
            TimerId::Superframe => {
                if self.running {
                    self.stats.slot_timer_cnt.inc();
                    self.missed_superframe(timer);
                }
                true
            }
            TimerId::Slot(idx) => {
                if self.running {
                    self.stats.slot_timer_cnt.inc();
                    self.run_slot(idx, radio, timer, wcs, chain);
                }
                true
            }
            TimerId::Ccp => false,
        }
    }

    /// Timing of the current superframe
    pub fn timing(&self) -> SlotTiming {
        self.timing
    }

    /// The epoch the current schedule is anchored to
    pub fn epoch(&self) -> Option<&EpochUpdate> {
        self.epoch.as_ref()
    }

    /// Index of the slot that ran last
    pub fn current_slot(&self) -> Option<u16> {
        self.cursor
    }

    /// Scheduler statistics
    pub fn stats(&self) -> &TdmaStats {
        &self.stats
    }

    /// See [`SlotTiming::rx_slot_start`](struct.SlotTiming.html#method.rx_slot_start)
    pub fn rx_slot_start(&self, wcs: &Wcs, idx: f32) -> u64 {
        self.timing.rx_slot_start(wcs, idx)
    }

    /// See [`SlotTiming::tx_slot_start`](struct.SlotTiming.html#method.tx_slot_start)
    pub fn tx_slot_start(&self, wcs: &Wcs, idx: f32) -> u64 {
        self.timing.tx_slot_start(wcs, idx)
    }

    fn slot_mut(&mut self, idx: u16) -> Result<&mut Option<Slot>, Error> {
        let nslots = self.config.nslots;
        self.slots
            .get_mut(usize::from(idx))
            .ok_or(Error::SlotOutOfRange { idx, nslots })
    }

    fn slot_period_us(&self) -> i64 {
        dwt_usecs_to_usecs(f64::from(self.timing.period_uus / u32::from(self.config.nslots))) as i64
    }

    fn superframe_timeout_us(&self) -> i64 {
        dwt_usecs_to_usecs(f64::from(self.timing.period_uus)) as i64 + self.slot_period_us()
    }

    fn schedule(&mut self, epoch: &EpochUpdate, timer: &mut dyn CpuTimer) {
        self.stop_timers(timer);
        self.epoch = Some(*epoch);
        self.timing.local_epoch = epoch.local_epoch;
        self.timing.period_uus = epoch.period_uus;

        let slot_period_us = self.slot_period_us();
        let latency = i64::from(self.config.os_latency_us);
        let max_delay = self.config.max_slot_delay_us;
        let now = timer.now();

        for idx in 0..self.config.nslots {
            let start = offset_ticks(timer, epoch.os_epoch, i64::from(idx) * slot_period_us - latency);
            let slot = match self.slots[usize::from(idx)].as_mut() {
                Some(slot) => slot,
                None => continue,
            };
            slot.start = start;

            let expiry = if is_past(now, start) {
                let delay = timer.ticks_to_usecs(now.wrapping_sub(start));
                if idx != 0 && max_delay > 0 && delay > max_delay {
                    self.stats.dropped_slots.inc();
                    debug!(slot = idx, delay, "slot dropped");
                    continue;
                }
                now
            } else {
                start
            };
            self.arm(timer, TimerId::Slot(idx), expiry);
        }

        self.superframe_start = offset_ticks(timer, epoch.os_epoch, self.superframe_timeout_us());
        self.arm(timer, TimerId::Superframe, self.superframe_start);
    }

    fn missed_superframe(&mut self, timer: &mut dyn CpuTimer) {
        self.stats.superframe_miss.inc();

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                warn!("superframe missed, no epoch yet");
                self.superframe_start =
                    offset_ticks(timer, timer.now(), self.superframe_timeout_us());
                self.arm(timer, TimerId::Superframe, self.superframe_start);
                return;
            }
        };

        let period_dtu = u64::from(epoch.period_uus) << UUS_SHIFT;
        let period_us = dwt_usecs_to_usecs(f64::from(epoch.period_uus)) as i64;
        let extrapolated = EpochUpdate {
            master_epoch: epoch.master_epoch.wrapping_add(period_dtu),
            local_epoch: epoch.local_epoch.wrapping_add(period_dtu) & MASK40,
            os_epoch: offset_ticks(timer, epoch.os_epoch, period_us),
            kind: EpochKind::Extrapolated,
            ..epoch
        };
        warn!(seq = epoch.seq_num, "superframe missed, extrapolating");
        self.schedule(&extrapolated, timer);
    }

    fn run_slot(
        &mut self,
        idx: u16,
        radio: &mut dyn Radio,
        timer: &mut dyn CpuTimer,
        wcs: &Wcs,
        chain: &mut MacChain,
    ) {
        let max_delay = self.config.max_slot_delay_us;
        let timing = self.timing;
        let slot = match self.slots.get_mut(usize::from(idx)).and_then(Option::as_mut) {
            Some(slot) => slot,
            None => return,
        };

        let now = timer.now();
        if idx != 0 && max_delay > 0 && is_past(now, slot.start) {
            let delay = timer.ticks_to_usecs(now.wrapping_sub(slot.start));
            if delay > max_delay {
                self.stats.dropped_slots.inc();
                debug!(slot = idx, delay, "slot dropped");
                return;
            }
        }

        self.cursor = Some(idx);
        let mut ctx = SlotContext {
            idx,
            timing,
            radio,
            timer,
            wcs,
            chain,
        };
        (slot.handler)(&mut ctx);
    }

    fn arm(&self, timer: &mut dyn CpuTimer, id: TimerId, expiry: u32) {
        if let Err(error) = timer.start_at(id, expiry) {
            warn!(%error, ?id, "tdma timer not armed");
        }
    }

    fn stop_timers(&self, timer: &mut dyn CpuTimer) {
        timer.stop(TimerId::Superframe);
        for idx in 0..self.config.nslots {
            timer.stop(TimerId::Slot(idx));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        config::WcsConfig,
        hal::mock::{MockRadio, MockTimer},
    };

    const OS_EPOCH: u32 = 1_000_000;
    const SLOT_PERIOD_US: u32 = 4201;
    const SUPERFRAME_TIMEOUT_US: u32 = 67216 + SLOT_PERIOD_US;

    struct Bench {
        tdma: Tdma,
        radio: MockRadio,
        timer: MockTimer,
        wcs: Wcs,
        chain: MacChain,
        ran: Arc<Mutex<Vec<(u16, u64, u64)>>>,
    }

    fn bench() -> Bench {
        Bench {
            tdma: Tdma::new(&TdmaConfig::default()).unwrap(),
            radio: MockRadio::new(1),
            timer: MockTimer {
                now: OS_EPOCH,
                ..MockTimer::default()
            },
            wcs: Wcs::new(&WcsConfig::default()),
            chain: MacChain::new(),
            ran: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn epoch() -> EpochUpdate {
        EpochUpdate {
            seq_num: 7,
            master_epoch: 0x20_0000_0000,
            local_epoch: 0x10_0000_0000,
            os_epoch: OS_EPOCH,
            period_uus: 0x10000,
            kind: EpochKind::Received,
            valid: true,
        }
    }

    impl Bench {
        fn assign(&mut self, idx: u16) {
            let ran = self.ran.clone();
            self.tdma
                .assign_slot(
                    idx,
                    Box::new(move |ctx: &mut SlotContext| {
                        ran.lock()
                            .push((ctx.idx, ctx.rx_slot_start(1.0), ctx.tx_slot_start(1.0)));
                    }),
                )
                .unwrap();
        }

        fn superframe(&mut self) {
            self.tdma.on_superframe(&epoch(), &self.radio, &mut self.timer);
        }

        fn fire(&mut self, id: TimerId) -> bool {
            self.tdma.on_timer(
                id,
                &mut self.radio,
                &mut self.timer,
                &self.wcs,
                &mut self.chain,
            )
        }
    }

    #[test]
    fn slot_count_is_validated() {
        let config = TdmaConfig {
            nslots: 0,
            ..TdmaConfig::default()
        };
        assert!(matches!(Tdma::new(&config), Err(Error::InvalidSlotCount(0))));

        let mut b = bench();
        assert!(matches!(
            b.tdma.assign_slot(16, Box::new(|_: &mut SlotContext| {})),
            Err(Error::SlotOutOfRange { idx: 16, nslots: 16 })
        ));
    }

    #[test]
    fn superframe_arms_assigned_slots() {
        let mut b = bench();
        b.assign(0);
        b.assign(2);
        b.tdma.start(&mut b.timer, 0x10000);
        b.superframe();

        assert_eq!(b.tdma.stats().superframe_cnt.get(), 1);
        // Slot 0 starts before the epoch was processed
        assert_eq!(b.timer.armed.get(&TimerId::Slot(0)), Some(&OS_EPOCH));
        assert_eq!(
            b.timer.armed.get(&TimerId::Slot(2)),
            Some(&(OS_EPOCH + 2 * SLOT_PERIOD_US - 100))
        );
        assert!(!b.timer.armed.contains_key(&TimerId::Slot(1)));
        assert_eq!(
            b.timer.armed.get(&TimerId::Superframe),
            Some(&(OS_EPOCH + SUPERFRAME_TIMEOUT_US))
        );
    }

    #[test]
    fn slot_runs_its_handler() {
        let mut b = bench();
        b.assign(2);
        b.tdma.start(&mut b.timer, 0x10000);
        b.superframe();

        b.timer.now = OS_EPOCH + 2 * SLOT_PERIOD_US - 100;
        assert!(b.fire(TimerId::Slot(2)));

        let rx = 0x10_0000_0000 + ((0x1000 - 6) << 16);
        assert_eq!(*b.ran.lock(), vec![(2, rx, rx + (64 << 16))]);
        assert_eq!(b.tdma.current_slot(), Some(2));
        assert_eq!(b.tdma.stats().slot_timer_cnt.get(), 1);
    }

    #[test]
    fn released_slot_never_fires() {
        let mut b = bench();
        b.assign(3);
        b.tdma.start(&mut b.timer, 0x10000);
        b.superframe();
        assert!(b.timer.armed.contains_key(&TimerId::Slot(3)));

        b.tdma.release_slot(3, &mut b.timer).unwrap();
        b.tdma.release_slot(3, &mut b.timer).unwrap();
        assert!(!b.timer.armed.contains_key(&TimerId::Slot(3)));

        b.fire(TimerId::Slot(3));
        assert!(b.ran.lock().is_empty());
        assert!(!b.tdma.is_assigned(3));
    }

    #[test]
    fn miss_without_epoch_schedules_nothing() {
        let mut b = bench();
        b.assign(0);
        b.assign(5);
        b.tdma.start(&mut b.timer, 0x10000);

        b.timer.now = OS_EPOCH + SUPERFRAME_TIMEOUT_US;
        assert!(b.fire(TimerId::Superframe));

        assert_eq!(b.tdma.stats().superframe_miss.get(), 1);
        assert!(!b.timer.armed.contains_key(&TimerId::Slot(0)));
        assert!(!b.timer.armed.contains_key(&TimerId::Slot(5)));
        let next = b.timer.armed[&TimerId::Superframe];
        assert!(!is_past(b.timer.now, next));
        assert!(b.ran.lock().is_empty());
    }

    #[test]
    fn miss_after_epoch_extrapolates() {
        let mut b = bench();
        b.assign(4);
        b.tdma.start(&mut b.timer, 0x10000);
        b.superframe();

        b.timer.now = OS_EPOCH + SUPERFRAME_TIMEOUT_US;
        b.fire(TimerId::Superframe);

        assert_eq!(b.tdma.stats().superframe_miss.get(), 1);
        let epoch = b.tdma.epoch().unwrap();
        assert_eq!(epoch.kind, EpochKind::Extrapolated);
        assert_eq!(epoch.local_epoch, 0x10_0000_0000 + (0x10000 << 16));
        assert_eq!(
            b.timer.armed.get(&TimerId::Slot(4)),
            Some(&(OS_EPOCH + 67216 + 4 * SLOT_PERIOD_US - 100))
        );
    }

    #[test]
    fn late_slots_are_dropped() {
        let mut b = bench();
        b.assign(1);
        b.assign(5);
        b.tdma.start(&mut b.timer, 0x10000);

        // The epoch is processed long after it happened
        b.timer.now = OS_EPOCH + 2 * SLOT_PERIOD_US;
        b.superframe();
        assert_eq!(b.tdma.stats().dropped_slots.get(), 1);
        assert!(!b.timer.armed.contains_key(&TimerId::Slot(1)));

        b.timer.now = OS_EPOCH + 5 * SLOT_PERIOD_US - 100 + 900;
        b.fire(TimerId::Slot(5));
        assert_eq!(b.tdma.stats().dropped_slots.get(), 2);
        assert!(b.ran.lock().is_empty());
    }

    #[test]
    fn stop_and_teardown() {
        let mut b = bench();
        b.assign(1);
        b.tdma.start(&mut b.timer, 0x10000);
        b.superframe();

        b.tdma.stop(&mut b.timer);
        assert!(b.timer.armed.is_empty());
        b.fire(TimerId::Slot(1));
        assert!(b.ran.lock().is_empty());
        assert!(b.tdma.is_assigned(1));

        b.tdma.teardown(&mut b.timer);
        assert!(!b.tdma.is_assigned(1));
        assert!(!b.fire(TimerId::Ccp));
    }
}

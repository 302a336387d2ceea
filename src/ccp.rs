//! Clock calibration packets
//!
//! A master broadcasts a blink every superframe period. The blink carries the
//! master's transmission timestamp, which every other node pairs with its own
//! reception timestamp to anchor the superframe epoch. Relays forward the
//! blink, correcting timestamp and interval for the time they held it, so
//! nodes out of the master's range share the same timebase.
//!
//! The state machine is driven by the node's worker: the [`Ccp`] timer fires
//! shortly before each expected epoch, and radio events are passed in as they
//! arrive. Every epoch (received, sent, or extrapolated over a missed blink)
//! is reported as an [`EpochUpdate`].
//!
//! [`Ccp`]: struct.Ccp.html
//! [`EpochUpdate`]: struct.EpochUpdate.html

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    config::CcpConfig,
    frame::{fctrl, CcpBlink, Frame},
    hal::{offset_ticks, CpuTimer, Radio, RxFrame, TimerId, DELAYED_TX_MASK},
    pool::FramePool,
    ranging::tofdb::TofCompensation,
    stats_section,
    time::{dwt_usecs_to_usecs, elapsed32, elapsed40, usecs_to_dwt_usecs, MASK40, UUS_SHIFT},
    wcs::Wcs,
    Error,
};

/// Periods must be a multiple of this many uus, one wrap of the 32-bit
/// timestamp carried in ranging frames
pub const PERIOD_GRANULARITY_UUS: u32 = 0x10000;

/// One full 32-bit timestamp wrap, in device time units
const INTERVAL_WRAP: u64 = 1 << 32;

/// Part a node plays in clock calibration
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, IntoPrimitive, PartialEq, Serialize, TryFromPrimitive,
)]
#[repr(u8)]
pub enum CcpRole {
    /// Sends the blinks
    Master = 0,
    /// Only listens
    Slave = 1,
    /// Listens and forwards
    Relay = 2,
}

/// How an epoch came about
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EpochKind {
    /// A blink was received
    Received,
    /// This node sent the blink
    Transmitted,
    /// No blink arrived; the previous epoch was carried forward one period
    Extrapolated,
}

/// A new superframe epoch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochUpdate {
    /// Sequence number of the blink
    pub seq_num: u8,
    /// Master timestamp of the epoch, 40-bit value plus wrap count
    pub master_epoch: u64,
    /// Local 40-bit timestamp of the epoch
    pub local_epoch: u64,
    /// CPU timer value of the epoch
    pub os_epoch: u32,
    /// Superframe period, in uus
    pub period_uus: u32,
    /// Origin of the epoch
    pub kind: EpochKind,
    /// The epoch comes from a master heard often enough to be trusted
    pub valid: bool,
}

/// What a clock calibration handler did with a radio event
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// Not for us, pass it on
    Ignored,
    /// Handled, nothing else needs to see it
    Consumed,
    /// Handled and produced a new epoch
    Epoch(EpochUpdate),
}

stats_section! {
    /// Clock calibration counters
    pub struct CcpStats: "ccp" {
        /// Master timer expiries
        master_cnt,
        /// Listen windows scheduled around an expected epoch
        slave_cnt,
        /// Blinks prepared
        send,
        /// Receiver activations
        listen,
        /// Blinks sent
        tx_complete,
        /// Blinks received
        rx_complete,
        /// Blinks received through a relay
        rx_relayed,
        /// Receiver activations that failed
        rx_start_error,
        /// Blinks received outside a listen window
        rx_unsolicited,
        /// Other frames received while listening
        rx_other_frame,
        /// Reception errors and undecodable blinks
        txrx_error,
        /// Missed blinks bridged by extrapolation
        err_tolerated,
        /// Blinks that could not be sent in time
        tx_start_error,
        /// Forwards that could not be sent
        tx_relay_error,
        /// Blinks forwarded
        tx_relay_ok,
        /// Listen windows that expired
        rx_timeout,
        /// Transceiver resets during a transaction
        reset,
        /// Times more blinks were missed than tolerated
        sync_lost,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pending {
    Send,
    Listen,
}

/// Clock calibration instance of one radio
pub struct Ccp {
    config: CcpConfig,
    running: bool,
    frames: FramePool<CcpBlink>,
    epochs: u32,
    seq_num: u8,
    master_euid: u64,
    master_epoch: u64,
    local_epoch: u64,
    os_epoch: u32,
    period_uus: u32,
    blink_duration_us: u32,
    rx_stable_uus: u32,
    valid: bool,
    valid_count: u16,
    missed: u16,
    sync_lost: bool,
    pending: Option<Pending>,
    tof: Option<Box<dyn TofCompensation>>,
    stats: CcpStats,
}

fn check_period(period_uus: u32) -> Result<(), Error> {
    if period_uus == 0 || period_uus % PERIOD_GRANULARITY_UUS != 0 {
        return Err(Error::InvalidPeriod {
            period_uus,
            granularity: PERIOD_GRANULARITY_UUS,
        });
    }
    Ok(())
}

fn uus_to_usecs(uus: u64) -> i64 {
    dwt_usecs_to_usecs(uus as f64) as i64
}

impl Ccp {
    /// Creates a stopped instance
    ///
    /// Fails if the configured period is not a non-zero multiple of
    /// [`PERIOD_GRANULARITY_UUS`].
    ///
    /// [`PERIOD_GRANULARITY_UUS`]: constant.PERIOD_GRANULARITY_UUS.html
    pub fn new(config: CcpConfig) -> Result<Self, Error> {
        check_period(config.period_uus)?;
        Ok(Ccp {
            period_uus: config.period_uus,
            config,
            running: false,
            frames: FramePool::new(2, CcpBlink::default),
            epochs: 0,
            seq_num: 0,
            master_euid: 0,
            master_epoch: 0,
            local_epoch: 0,
            os_epoch: 0,
            blink_duration_us: 0,
            rx_stable_uus: 0,
            valid: false,
            valid_count: 0,
            missed: 0,
            sync_lost: false,
            pending: None,
            tof: None,
            stats: CcpStats::default(),
        })
    }

    /// Installs the source of per-neighbour time of flight
    ///
    /// Received epochs are moved back by the time of flight from the
    /// transmitter.
    pub fn set_tof_compensation(&mut self, tof: Box<dyn TofCompensation>) {
        self.tof = Some(tof);
    }

    /// Changes the role taken on the next start
    pub fn set_role(&mut self, role: CcpRole) -> Result<(), Error> {
        if self.running {
            return Err(Error::InvalidRoleTransition);
        }
        self.config.role = role;
        Ok(())
    }

    /// Changes the superframe period
    ///
    /// A master uses the new period from its next blink on; listeners always
    /// follow the period announced by the master.
    pub fn set_period(&mut self, period_uus: u32) -> Result<(), Error> {
        check_period(period_uus)?;
        self.config.period_uus = period_uus;
        self.period_uus = period_uus;
        Ok(())
    }

    /// Starts sending or listening, depending on the configured role
    ///
    /// The first blink is sent, or the first listen window opened, as soon as
    /// possible.
    pub fn start(&mut self, radio: &mut dyn Radio, timer: &mut dyn CpuTimer) -> Result<(), Error> {
        if self.running {
            return Err(Error::InvalidRoleTransition);
        }
        let epoch_to_rm = radio.phy_timing().shr_duration_us as u64;

        self.epochs = 0;
        self.valid = false;
        self.valid_count = 0;
        self.master_euid = 0;
        self.missed = 0;
        self.sync_lost = false;
        self.pending = None;
        self.period_uus = self.config.period_uus;

        self.os_epoch = timer
            .now()
            .wrapping_sub(timer.usecs_to_ticks(epoch_to_rm as u32));
        let period_dtu = u64::from(self.period_uus) << UUS_SHIFT;
        let holdoff =
            u64::from(self.config.tx_holdoff_dly_uus) + 2 * u64::from(self.config.os_latency_us);
        let ts = (radio.read_systime().wrapping_sub(period_dtu) & MASK40) + (holdoff << UUS_SHIFT);

        if self.config.role == CcpRole::Master {
            self.frames.current_mut().transmission_timestamp = ts;
        }
        self.local_epoch = ts.wrapping_sub(epoch_to_rm << UUS_SHIFT) & MASK40;

        let now = timer.now();
        timer.start_at(TimerId::Ccp, now)?;
        self.running = true;

        info!(role = ?self.config.role, period = self.period_uus, "ccp started");
        Ok(())
    }

    /// Stops sending and listening
    ///
    /// No clock calibration timer fires after this returns.
    pub fn stop(&mut self, radio: &mut dyn Radio, timer: &mut dyn CpuTimer) {
        self.running = false;
        timer.stop(TimerId::Ccp);
        if self.pending.take().is_some() {
            radio.forcetrxoff();
        }
        info!("ccp stopped");
    }

    /// Handles an expiry of the clock calibration timer
    ///
    /// A master sends its next blink. Slaves and relays open a listen window
    /// around the expected epoch.
    pub fn on_timer(
        &mut self,
        radio: &mut dyn Radio,
        timer: &mut dyn CpuTimer,
        wcs: &Wcs,
    ) -> Option<EpochUpdate> {
        if !self.running {
            return None;
        }
        self.blink_duration_us = radio.frame_duration_us(CcpBlink::LEN).ceil() as u32;
        self.rx_stable_uus = radio.phy_timing().rx_stable_uus;

        match self.config.role {
            CcpRole::Master => {
                self.stats.master_cnt.inc();
                let epoch = self.send(radio, timer);
                if epoch.is_some() {
                    self.rearm(timer);
                }
                epoch
            }
            CcpRole::Slave | CcpRole::Relay => {
                self.listen_for_epoch(radio, timer, wcs);
                None
            }
        }
    }

    fn send(&mut self, radio: &mut dyn Radio, timer: &mut dyn CpuTimer) -> Option<EpochUpdate> {
        self.stats.send.inc();
        radio.forcetrxoff();

        let period_dtu = u64::from(self.period_uus) << UUS_SHIFT;
        let previous = self.frames.current().transmission_timestamp;
        let at = previous.wrapping_add(period_dtu) & !0x1ff;
        let timestamp = at.wrapping_add(radio.tx_antenna_delay());

        self.seq_num = self.seq_num.wrapping_add(1);
        let blink = CcpBlink {
            fctrl: fctrl::IEEE_BLINK_CCP_64,
            seq_num: self.seq_num,
            euid: radio.euid(),
            short_address: radio.short_address(),
            transmission_interval: period_dtu,
            transmission_timestamp: timestamp,
            rpt_count: 0,
            rpt_max: self.config.max_cascade_rpts,
            epoch_to_rm_us: radio.phy_timing().shr_duration_us as u16,
        };
        *self.frames.next_mut() = blink;

        let result = blink
            .to_bytes()
            .and_then(|bytes| radio.start_tx(&bytes, Some(at & MASK40), None));
        if let Err(error) = result {
            let late_uus = elapsed40(timestamp, radio.read_systime()) >> UUS_SHIFT;
            self.stats.tx_start_error.inc();
            warn!(seq = self.seq_num, late_uus, %error, "ccp blink not sent");

            self.frames.advance();
            let behind = uus_to_usecs(u64::from(self.period_uus)) - uus_to_usecs(late_uus)
                - i64::from(self.config.os_latency_us);
            self.os_epoch = offset_ticks(timer, self.os_epoch, behind);
            self.master_epoch = self.master_epoch.wrapping_add(period_dtu);
            self.local_epoch = self.local_epoch.wrapping_add(period_dtu) & MASK40;
            return Some(self.epoch(EpochKind::Extrapolated));
        }

        self.pending = Some(Pending::Send);
        trace!(seq = self.seq_num, at, "ccp blink scheduled");
        None
    }

    /// Listen window for the next blink and every relayed copy of it
    fn listen_timeout_uus(&self) -> u32 {
        let cascade = u32::from(self.config.max_cascade_rpts);
        let per_relay = self
            .config
            .tx_holdoff_dly_uus
            .saturating_add(self.blink_duration_us);
        self.blink_duration_us
            .saturating_add(self.config.xtalt_guard_uus)
            .saturating_add(per_relay.saturating_mul(cascade))
    }

    fn listen_for_epoch(&mut self, radio: &mut dyn Radio, timer: &mut dyn CpuTimer, wcs: &Wcs) {
        if self.sync_lost {
            if self.listen(radio, None, self.config.long_rx_timeout_uus).is_err() {
                self.miss(timer, false);
            }
            return;
        }
        self.stats.slave_cnt.inc();

        let phy = radio.phy_timing();
        let period_dtu = (u64::from(self.period_uus) << UUS_SHIFT) as f64;
        let guard = (usecs_to_dwt_usecs(phy.shr_duration_us) + f64::from(phy.rx_stable_uus)).ceil();
        let dx_time = self
            .local_epoch
            .wrapping_add((period_dtu * wcs.normalized_skew()) as u64)
            .wrapping_sub((guard as u64) << UUS_SHIFT)
            & MASK40;

        let timeout = self.listen_timeout_uus();
        if self.listen(radio, Some(dx_time), timeout).is_err()
            && self
                .listen(radio, None, self.config.long_rx_timeout_uus)
                .is_err()
        {
            self.miss(timer, false);
        }
    }

    fn listen(&mut self, radio: &mut dyn Radio, at: Option<u64>, timeout_uus: u32) -> Result<(), Error> {
        radio.forcetrxoff();
        self.stats.listen.inc();

        match radio.start_rx(at, Some(timeout_uus)) {
            Ok(()) => {
                self.pending = Some(Pending::Listen);
                Ok(())
            }
            Err(error) => {
                self.stats.rx_start_error.inc();
                debug!(?at, %error, "ccp listen not started");
                Err(error)
            }
        }
    }

    /// Handles a received frame
    pub fn rx_complete(
        &mut self,
        frame: &RxFrame,
        radio: &mut dyn Radio,
        timer: &mut dyn CpuTimer,
        wcs: &Wcs,
    ) -> Outcome {
        if self.config.role == CcpRole::Master || !self.running {
            return Outcome::Ignored;
        }

        if !CcpBlink::matches(&frame.data) {
            if self.pending != Some(Pending::Listen) {
                return Outcome::Ignored;
            }
            // Hunting for a blink; keep listening
            self.stats.rx_other_frame.inc();
            if self
                .listen(radio, None, self.config.long_rx_timeout_uus)
                .is_err()
            {
                self.miss(timer, false);
            }
            return Outcome::Consumed;
        }

        if self.pending != Some(Pending::Listen) {
            self.stats.rx_unsolicited.inc();
            return Outcome::Ignored;
        }

        let blink = match CcpBlink::decode(&frame.data) {
            Ok(blink) if !frame.lde_error => blink,
            _ => {
                self.stats.txrx_error.inc();
                return self.miss(timer, false);
            }
        };
        self.pending = None;

        *self.frames.advance() = blink;
        self.seq_num = blink.seq_num;
        self.missed = 0;
        self.os_epoch = self.irq_corrected_now(radio, timer, frame.rx_timestamp);
        self.stats.rx_complete.inc();
        if self.sync_lost {
            info!(seq = blink.seq_num, "ccp sync regained");
        }
        self.sync_lost = false;

        let threshold = self.config.valid_threshold;
        if blink.transmission_timestamp < self.master_epoch || blink.euid != self.master_euid {
            self.master_euid = blink.euid;
            self.valid = threshold == 0;
            self.valid_count = 0;
        } else {
            if self.valid_count < threshold.saturating_sub(1) {
                self.valid_count += 1;
            }
            self.valid |= self.valid_count == threshold.saturating_sub(1);
        }

        self.master_epoch = blink.transmission_timestamp;
        self.local_epoch = frame.rx_timestamp & MASK40;
        self.period_uus = (blink.interval() >> UUS_SHIFT) as u32;
        let mut reception = self.local_epoch;
        self.adjust_for_epoch_to_rm(timer, blink.epoch_to_rm_us);

        if let Some(tof) = &self.tof {
            let compensation = wcs.skew_compensation(f64::from(tof.tof(blink.short_address))) as u64;
            self.local_epoch = self.local_epoch.wrapping_sub(compensation) & MASK40;
            reception = reception.wrapping_sub(compensation) & MASK40;
        }

        if blink.rpt_count != 0 {
            self.stats.rx_relayed.inc();
            let interval = blink.interval();
            let master_interval = (interval / INTERVAL_WRAP + 1) * INTERVAL_WRAP;
            self.period_uus = (master_interval >> UUS_SHIFT) as u32;

            let repeat_delay = master_interval - interval;
            self.master_epoch = self.master_epoch.wrapping_sub(repeat_delay);
            let repeat_delay = wcs.skew_compensation(repeat_delay as f64) as u64;
            self.local_epoch = self.local_epoch.wrapping_sub(repeat_delay) & MASK40;
            reception = reception.wrapping_sub(repeat_delay) & MASK40;
            self.os_epoch = offset_ticks(
                timer,
                self.os_epoch,
                -uus_to_usecs(repeat_delay >> UUS_SHIFT),
            );
        }

        if self.config.role == CcpRole::Relay && self.valid && blink.rpt_count < blink.rpt_max {
            self.forward(blink, reception, radio, wcs);
        }

        trace!(
            seq = blink.seq_num,
            valid = self.valid,
            hops = blink.rpt_count,
            "ccp epoch received"
        );
        self.rearm(timer);
        Outcome::Epoch(self.epoch(EpochKind::Received))
    }

    fn forward(&mut self, blink: CcpBlink, reception: u64, radio: &mut dyn Radio, wcs: &Wcs) {
        let mut relayed = blink;
        relayed.short_address = radio.short_address();
        relayed.rpt_count += 1;

        let holdoff = u64::from(relayed.rpt_count) * (u64::from(self.config.tx_holdoff_dly_uus) << UUS_SHIFT);
        let stagger = u64::from(radio.slot_id() % 4) * (u64::from(self.blink_duration_us) << UUS_SHIFT);
        let at = reception.wrapping_add(holdoff).wrapping_add(stagger) & DELAYED_TX_MASK;
        let timestamp = at + radio.tx_antenna_delay();

        let tx_delay = wcs.skew_compensation(elapsed40(reception, timestamp) as f64) as u64;
        relayed.transmission_timestamp = relayed.transmission_timestamp.wrapping_add(tx_delay);
        relayed.transmission_interval = blink.interval().wrapping_sub(tx_delay);

        let result = relayed
            .to_bytes()
            .and_then(|bytes| radio.start_tx(&bytes, Some(at), None));
        match result {
            Ok(()) => {
                self.stats.tx_relay_ok.inc();
                debug!(seq = relayed.seq_num, hops = relayed.rpt_count, "ccp blink relayed");
            }
            Err(error) => {
                self.stats.tx_relay_error.inc();
                warn!(seq = relayed.seq_num, %error, "ccp relay failed");
            }
        }
    }

    /// Handles the completion of a transmission
    pub fn tx_complete(
        &mut self,
        tx_timestamp: u64,
        radio: &mut dyn Radio,
        timer: &mut dyn CpuTimer,
    ) -> Outcome {
        if self.pending != Some(Pending::Send) {
            return Outcome::Ignored;
        }
        self.pending = None;
        self.stats.tx_complete.inc();

        let blink = *self.frames.advance();
        self.epochs = self.epochs.saturating_add(1);
        self.os_epoch = self.irq_corrected_now(radio, timer, tx_timestamp);
        self.local_epoch = blink.transmission_timestamp & MASK40;
        self.master_epoch = blink.transmission_timestamp;
        self.period_uus = (blink.interval() >> UUS_SHIFT) as u32;
        self.adjust_for_epoch_to_rm(timer, blink.epoch_to_rm_us);

        self.rearm(timer);
        self.valid |= self.epochs > 1;

        Outcome::Epoch(self.epoch(EpochKind::Transmitted))
    }

    /// Handles an expired listen window
    pub fn rx_timeout(&mut self, timer: &mut dyn CpuTimer) -> Outcome {
        if self.pending != Some(Pending::Listen) {
            return Outcome::Ignored;
        }
        self.stats.rx_timeout.inc();
        self.miss(timer, true)
    }

    /// Handles a reception error
    pub fn rx_error(&mut self, timer: &mut dyn CpuTimer) -> Outcome {
        if self.pending != Some(Pending::Listen) {
            return Outcome::Ignored;
        }
        self.stats.txrx_error.inc();
        self.miss(timer, false)
    }

    /// Handles a transceiver reset
    ///
    /// Drops the pending transaction and schedules the next one.
    pub fn reset(&mut self, timer: &mut dyn CpuTimer) -> Outcome {
        if self.pending.take().is_none() {
            return Outcome::Ignored;
        }
        self.stats.reset.inc();
        if self.running {
            let now = timer.now();
            if let Err(error) = timer.start_at(TimerId::Ccp, now) {
                warn!(%error, "ccp timer not restarted after reset");
            }
        }
        Outcome::Consumed
    }

    fn miss(&mut self, timer: &mut dyn CpuTimer, timed_out: bool) -> Outcome {
        self.pending = None;
        self.missed = self.missed.saturating_add(1);
        if timed_out {
            self.sync_lost = true;
        }
        if self.missed == self.config.tolerate_missed.saturating_add(1) {
            self.stats.sync_lost.inc();
            warn!(missed = self.missed, "ccp sync lost");
        }

        let epoch = self.tolerate(timer);
        self.rearm(timer);
        epoch.map_or(Outcome::Consumed, Outcome::Epoch)
    }

    fn tolerate(&mut self, timer: &mut dyn CpuTimer) -> Option<EpochUpdate> {
        if !self.valid || self.missed > self.config.tolerate_missed {
            return None;
        }
        let period_dtu = u64::from(self.period_uus) << UUS_SHIFT;
        self.os_epoch = offset_ticks(timer, self.os_epoch, uus_to_usecs(u64::from(self.period_uus)));
        self.master_epoch = self.master_epoch.wrapping_add(period_dtu);
        self.local_epoch = self.local_epoch.wrapping_add(period_dtu) & MASK40;
        self.stats.err_tolerated.inc();

        Some(self.epoch(EpochKind::Extrapolated))
    }

    fn rearm(&mut self, timer: &mut dyn CpuTimer) {
        if !self.running {
            return;
        }
        timer.stop(TimerId::Ccp);

        let period_us = uus_to_usecs(u64::from(self.period_uus));
        let latency = i64::from(self.config.os_latency_us);
        let expiry = match self.config.role {
            CcpRole::Master => offset_ticks(timer, self.os_epoch, period_us - latency),
            CcpRole::Slave | CcpRole::Relay => {
                if self.sync_lost && self.missed > self.config.tolerate_missed {
                    timer.now()
                } else {
                    self.sync_lost = false;
                    let rx_stable = i64::from(self.rx_stable_uus);
                    offset_ticks(
                        timer,
                        self.os_epoch,
                        period_us - latency - i64::from(self.blink_duration_us) - rx_stable,
                    )
                }
            }
        };

        if let Err(error) = timer.start_at(TimerId::Ccp, expiry) {
            warn!(%error, "ccp timer not armed");
        }
    }

    fn adjust_for_epoch_to_rm(&mut self, timer: &dyn CpuTimer, epoch_to_rm_us: u16) {
        let offset = u64::from(epoch_to_rm_us) << UUS_SHIFT;
        self.master_epoch = self.master_epoch.wrapping_sub(offset);
        self.local_epoch = self.local_epoch.wrapping_sub(offset) & MASK40;
        self.os_epoch = offset_ticks(timer, self.os_epoch, -uus_to_usecs(u64::from(epoch_to_rm_us)));
    }

    /// CPU time of `timestamp`, derived from how long ago the radio saw it
    fn irq_corrected_now(&self, radio: &mut dyn Radio, timer: &dyn CpuTimer, timestamp: u64) -> u32 {
        let delta = elapsed32(timestamp as u32, radio.read_systime() as u32);
        let now = timer.now();
        offset_ticks(timer, now, -uus_to_usecs(u64::from(delta >> UUS_SHIFT)))
    }

    fn epoch(&self, kind: EpochKind) -> EpochUpdate {
        EpochUpdate {
            seq_num: self.seq_num,
            master_epoch: self.master_epoch,
            local_epoch: self.local_epoch,
            os_epoch: self.os_epoch,
            period_uus: self.period_uus,
            kind,
            valid: self.valid,
        }
    }

    /// Current role
    pub fn role(&self) -> CcpRole {
        self.config.role
    }

    /// Returns `true` between `start` and `stop`
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns `true` once the epoch can be trusted
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Superframe period in uus
    pub fn period_uus(&self) -> u32 {
        self.period_uus
    }

    /// The most recent epoch
    pub fn current_epoch(&self) -> EpochUpdate {
        self.epoch(EpochKind::Received)
    }

    /// The most recently sent or received blink
    pub fn last_frame(&self) -> &CcpBlink {
        self.frames.current()
    }

    /// Consecutive missed blinks
    pub fn missed(&self) -> u16 {
        self.missed
    }

    /// Clock calibration statistics
    pub fn stats(&self) -> &CcpStats {
        &self.stats
    }
}

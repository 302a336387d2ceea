//! Platform interfaces consumed by the timing core
//!
//! The core never touches SPI, GPIO or interrupt controllers. A platform
//! layer implements [`Radio`] on top of its transceiver driver and
//! [`CpuTimer`] on top of a free-running CPU counter with one-shot compare
//! timers. Interrupt handlers and expiring timers only post [`Event`]s to the
//! node's queue; all processing happens on the node's worker.
//!
//! [`Radio`]: trait.Radio.html
//! [`CpuTimer`]: trait.CpuTimer.html
//! [`Event`]: ../event/enum.Event.html

use crate::Error;

/// Mask applied to delayed transmission times, the radio ignores the low 9 bits
pub const DELAYED_TX_MASK: u64 = 0xff_ffff_fe00;

/// Physical layer durations the scheduling math depends on
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhyTiming {
    /// Duration of preamble and SFD, in us
    pub shr_duration_us: f64,
    /// Time the receiver needs to become ready, in uus
    pub rx_stable_uus: u32,
}

impl Default for PhyTiming {
    fn default() -> Self {
        PhyTiming {
            shr_duration_us: 65.0,
            rx_stable_uus: 6,
        }
    }
}

/// Receive window opened right after a transmission completes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseWindow {
    /// Delay between the end of the transmitted frame and enabling the receiver, in uus
    pub delay_uus: u32,
    /// Receive timeout, in uus
    pub timeout_uus: u32,
}

/// A frame handed over by the radio
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RxFrame {
    /// Frame payload without FCS
    pub data: Vec<u8>,
    /// 40-bit RMARKER reception timestamp, antenna delay removed
    pub rx_timestamp: u64,
    /// Carrier integrator value latched with the frame
    pub carrier_integrator: i32,
    /// Leading edge detection failed, the timestamp is unreliable
    pub lde_error: bool,
}

/// Something the radio reports asynchronously
#[derive(Clone, Debug, PartialEq)]
pub enum RadioEvent {
    /// A frame was received
    RxComplete(RxFrame),
    /// The receive timeout expired
    RxTimeout,
    /// A frame was received with errors
    RxError,
    /// A frame was sent; holds the 40-bit transmission timestamp
    TxComplete(u64),
    /// The transceiver was reset
    Reset,
}

/// A UWB transceiver
///
/// Delayed operations take absolute 40-bit device times. An `Err` from
/// `start_tx`/`start_rx` means the operation could not be started, usually
/// because the requested time has already passed.
pub trait Radio: Send {
    /// Reads the 40-bit system time
    fn read_systime(&mut self) -> u64;

    /// Reads the 40-bit timestamp of the last transmission
    fn read_txtime(&mut self) -> u64;

    /// Extended unique identifier of this radio
    fn euid(&self) -> u64;

    /// Short address of this radio
    fn short_address(&self) -> u16;

    /// PAN id
    fn pan_id(&self) -> u16;

    /// Position of this node within a cell, used to stagger relays
    fn slot_id(&self) -> u16;

    /// Antenna delay added to transmission timestamps, in device time units
    fn tx_antenna_delay(&self) -> u64;

    /// Current physical layer timing
    fn phy_timing(&self) -> PhyTiming;

    /// Airtime of a frame with `len` payload bytes, in us
    fn frame_duration_us(&self, len: usize) -> f64;

    /// Airtime of only the data part of a frame with `len` bytes, in us
    fn data_duration_us(&self, len: usize) -> f64;

    /// Clock offset to the transmitter, derived from the carrier integrator
    fn clock_offset_ratio(&self, _carrier_integrator: i32) -> f64 {
        0.0
    }

    /// Transmits `frame`, immediately or at device time `at`
    fn start_tx(
        &mut self,
        frame: &[u8],
        at: Option<u64>,
        response: Option<ResponseWindow>,
    ) -> Result<(), Error>;

    /// Enables the receiver, immediately or at device time `at`
    ///
    /// `timeout_uus` of `None` listens until stopped.
    fn start_rx(&mut self, at: Option<u64>, timeout_uus: Option<u32>) -> Result<(), Error>;

    /// Turns transmitter and receiver off
    fn forcetrxoff(&mut self);

    /// Returns the next pending event
    ///
    /// Returns `nb::Error::WouldBlock` if nothing happened yet.
    fn poll(&mut self) -> nb::Result<RadioEvent, Error>;
}

/// Identifies one of the hardware timers the core arms
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TimerId {
    /// Clock calibration send/listen timer
    Ccp,
    /// Fires if no superframe event arrived in time
    Superframe,
    /// Start of a TDMA slot
    Slot(u16),
}

/// A free-running 32-bit CPU counter with one-shot timers
///
/// An expiring timer must post `Event::Timer(id)` to the node's queue.
/// Stopping a timer guarantees that it doesn't post anymore.
pub trait CpuTimer: Send {
    /// Current counter value
    fn now(&self) -> u32;

    /// Converts microseconds to counter ticks
    fn usecs_to_ticks(&self, usecs: u32) -> u32;

    /// Converts counter ticks to microseconds
    fn ticks_to_usecs(&self, ticks: u32) -> u32;

    /// Arms timer `id` to fire at counter value `expiry`
    ///
    /// Re-arming a running timer moves it.
    fn start_at(&mut self, id: TimerId, expiry: u32) -> Result<(), Error>;

    /// Disarms timer `id`
    fn stop(&mut self, id: TimerId);
}

/// Adds a signed number of microseconds to a counter value
pub fn offset_ticks(timer: &dyn CpuTimer, base: u32, usecs: i64) -> u32 {
    let ticks = timer.usecs_to_ticks(usecs.unsigned_abs().min(u64::from(u32::MAX)) as u32);
    if usecs >= 0 {
        base.wrapping_add(ticks)
    } else {
        base.wrapping_sub(ticks)
    }
}

/// Returns `true` if counter value `expiry` lies before `now`
///
/// Counter values are compared within half a wrap period.
pub fn is_past(now: u32, expiry: u32) -> bool {
    (expiry.wrapping_sub(now) as i32) < 0
}


#[cfg(test)]
mod tests {
    use super::{mock::MockTimer, *};

    #[test]
    fn offsets_in_both_directions() {
        let timer = MockTimer::default();

        assert_eq!(offset_ticks(&timer, 100, 50), 150);
        assert_eq!(offset_ticks(&timer, 100, -150), u32::MAX - 49);
    }

    #[test]
    fn past_detection_wraps() {
        assert!(is_past(100, 99));
        assert!(!is_past(100, 100));
        assert!(!is_past(u32::MAX, 5));
        assert!(is_past(5, u32::MAX));
    }
}

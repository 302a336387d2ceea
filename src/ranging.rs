//! Two-way ranging
//!
//! Single-sided exchanges use three frames:
//!
//! 1. The initiator sends a request (`SsTwr`).
//! 2. The responder answers (`SsTwrT1`) with the time it received the request
//!    and the time its answer leaves the antenna.
//! 3. The initiator adds the time it sent the request and received the answer
//!    and sends everything back (`SsTwrFinal`).
//!
//! Both sides end up with all four timestamps and compute the same time of
//! flight. Double-sided exchanges add a second round trip in the opposite
//! direction (`DsTwr`, `DsTwrT1`, `DsTwrT2`, `DsTwrFinal`), which cancels the
//! clock offset between the two nodes without a skew estimate.
//!
//! Answers are sent at a fixed holdoff after the frame they answer, so the
//! transmission timestamp is known before the frame is written. While the
//! clock model is valid, all timestamps are converted to the master timebase
//! before they go on air.
//!
//! The [`TwrEngine`] is a [`MacInterface`]; finished measurements are pushed
//! to the chain as [`RangeResult`]s.
//!
//! [`TwrEngine`]: struct.TwrEngine.html
//! [`MacInterface`]: ../mac/trait.MacInterface.html
//! [`RangeResult`]: struct.RangeResult.html

pub mod math;
pub mod tofdb;

use std::any::Any;

use tracing::{debug, trace, warn};

use crate::{
    ccp::EpochUpdate,
    config::RngConfig,
    frame::{
        fctrl, Frame, FrameHeader, RangeFinal, RangeRequest, RangeResponse, RangingCode,
        TwrFamily, BROADCAST_ADDRESS,
    },
    hal::{Radio, ResponseWindow, RxFrame, DELAYED_TX_MASK},
    mac::{MacContext, MacInterface},
    pool::FramePool,
    stats_section,
    time::{usecs_to_dwt_usecs, MASK32, MASK40, UUS_SHIFT},
    wcs::Wcs,
    Error,
};

use self::math::{calc_tof_ds, calc_tof_ss, tof_to_meters};

stats_section! {
    /// Ranging counters
    pub struct RngStats: "rng" {
        /// Exchanges initiated
        rng_request,
        /// Listen windows opened
        rng_listen,
        /// Ranging frames sent
        tx_complete,
        /// Ranging frames received and handled
        rx_complete,
        /// Ranging frames received while idle
        rx_unsolicited,
        /// Frames for someone else, or with codes this engine doesn't handle
        rx_other_frame,
        /// Reception errors and malformed frames
        rx_error,
        /// Frames that could not be sent
        tx_error,
        /// Exchanges that ran into a receive timeout
        rx_timeout,
        /// Finished measurements
        complete,
        /// Exchanges aborted by a transceiver reset
        reset,
        /// Exchanges aborted by the start of a superframe
        superframe_reset,
    }
}

/// A finished range measurement
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RangeResult {
    /// Code of the last frame of the exchange
    pub code: RangingCode,
    /// Short address of the other node
    pub peer: u16,
    /// Sequence number of the last frame
    pub seq_num: u8,
    /// Time of flight in device time units, `NaN` if degenerate
    pub tof: f64,
    /// Distance in meters
    pub range_m: f64,
    /// Fractional clock skew applied to the single-sided formula
    pub skew: f64,
    /// The last frame, carrying the timestamps of the final round trip
    pub frame: RangeFinal,
}

/// Computes the time of flight of a finished exchange
///
/// `frame` is the last frame of the exchange. Double-sided exchanges also
/// need `first`, the frame holding the timestamps of the first round trip.
/// Frames with a code outside the two-way ranging families yield 0.
pub fn twr_to_tof(first: &RangeFinal, frame: &RangeFinal, skew: f64) -> f64 {
    let family = match RangingCode::from_raw(frame.header.code) {
        Ok(code) => code.family(),
        Err(_) => return 0.0,
    };

    match family {
        TwrFamily::SingleSided => calc_tof_ss(
            frame.response_timestamp,
            frame.request_timestamp,
            u64::from(frame.transmission_timestamp),
            u64::from(frame.reception_timestamp),
            skew,
        ),
        TwrFamily::DoubleSided => calc_tof_ds(
            first.response_timestamp,
            first.request_timestamp,
            u64::from(first.transmission_timestamp),
            u64::from(first.reception_timestamp),
            frame.response_timestamp,
            frame.request_timestamp,
            u64::from(frame.transmission_timestamp),
            u64::from(frame.reception_timestamp),
        ),
        TwrFamily::Other => 0.0,
    }
}

/// When to answer a received frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ResponseTiming {
    /// Delayed transmission time to program
    tx_delay: u64,
    /// Resulting transmission timestamp, antenna delay included
    timestamp: u64,
}

/// Lower 32 bits of `dtu`, in the master timebase if possible
fn stamp(wcs: &Wcs, dtu: u64) -> u32 {
    (wcs.local_to_master(dtu).unwrap_or(dtu) & MASK32) as u32
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pending {
    Exchange,
    CompleteAfterTx,
}

/// Single- and double-sided two-way ranging on one radio
pub struct TwrEngine {
    config: RngConfig,
    frames: FramePool<RangeFinal>,
    seq_num: u8,
    pending: Option<Pending>,
    stats: RngStats,
}

impl TwrEngine {
    /// Creates an idle engine
    pub fn new(config: RngConfig) -> Self {
        TwrEngine {
            frames: FramePool::new(config.nframes.max(2), RangeFinal::default),
            config,
            seq_num: 0,
            pending: None,
            stats: RngStats::default(),
        }
    }

    /// Starts an exchange with `dst`
    ///
    /// `code` must be `SsTwr` or `DsTwr`. The request goes out immediately,
    /// or at device time `at`. Fails with `Busy` if an exchange is in
    /// progress.
    pub fn request(
        &mut self,
        radio: &mut dyn Radio,
        dst: u16,
        code: RangingCode,
        at: Option<u64>,
    ) -> Result<(), Error> {
        let step = match code {
            RangingCode::SsTwr => 1,
            RangingCode::DsTwr => 2,
            _ => return Err(Error::InvalidArgument),
        };
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        self.stats.rng_request.inc();
        self.seq_num = self.seq_num.wrapping_add(step);

        let header = RangeRequest {
            fctrl: fctrl::IEEE_RANGE_16,
            seq_num: self.seq_num,
            pan_id: radio.pan_id(),
            dst_address: dst,
            src_address: radio.short_address(),
            code: code.raw(),
        };
        *self.frames.advance() = RangeFinal {
            header,
            ..RangeFinal::default()
        };

        let window = self.response_window(radio, RangeResponse::LEN);
        let bytes = header.to_bytes()?;
        if let Err(error) = radio.start_tx(&bytes, at, Some(window)) {
            self.stats.tx_error.inc();
            debug!(%error, dst, "range request not sent");
            return Err(error);
        }

        trace!(seq = self.seq_num, dst, ?code, "range request");
        self.pending = Some(Pending::Exchange);
        Ok(())
    }

    /// Opens the receiver for an incoming request
    ///
    /// Listens immediately or from device time `at`, for `timeout_uus` or
    /// until stopped.
    pub fn listen(
        &mut self,
        radio: &mut dyn Radio,
        at: Option<u64>,
        timeout_uus: Option<u32>,
    ) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }
        self.stats.rng_listen.inc();
        if let Err(error) = radio.start_rx(at, timeout_uus) {
            self.stats.rx_error.inc();
            debug!(%error, "range listen not started");
            return Err(error);
        }
        self.pending = Some(Pending::Exchange);
        Ok(())
    }

    /// Returns `true` while an exchange is in progress
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Sequence number of the latest request
    pub fn seq_num(&self) -> u8 {
        self.seq_num
    }

    /// Time of flight of the exchange ending with frame `idx`
    pub fn tof(&self, idx: u16, skew: f64) -> f64 {
        twr_to_tof(self.frames.at(self.frames.prev_idx(idx)), self.frames.at(idx), skew)
    }

    /// The frame pool
    pub fn frames(&self) -> &FramePool<RangeFinal> {
        &self.frames
    }

    /// Ranging statistics
    pub fn stats(&self) -> &RngStats {
        &self.stats
    }

    fn response_timing(&self, radio: &dyn Radio, rx_timestamp: u64, rx_len: usize) -> ResponseTiming {
        // The received frame's data part follows its RMARKER
        let shr = usecs_to_dwt_usecs(radio.phy_timing().shr_duration_us) as u64;
        let data = usecs_to_dwt_usecs(radio.data_duration_us(rx_len)) as u64;
        let holdoff = u64::from(self.config.tx_holdoff_delay_uus) + shr + data;

        let tx_delay = rx_timestamp.wrapping_add(holdoff << UUS_SHIFT) & MASK40;
        let timestamp = ((tx_delay & DELAYED_TX_MASK) + radio.tx_antenna_delay()) & MASK40;
        ResponseTiming {
            tx_delay,
            timestamp,
        }
    }

    fn response_window(&self, radio: &dyn Radio, expected_len: usize) -> ResponseWindow {
        let rx_stable = radio.phy_timing().rx_stable_uus;
        let frame = usecs_to_dwt_usecs(radio.frame_duration_us(expected_len)) as u32;
        ResponseWindow {
            delay_uus: self.config.tx_holdoff_delay_uus.saturating_sub(rx_stable),
            timeout_uus: frame + self.config.rx_timeout_delay_uus + rx_stable,
        }
    }

    fn send<F: Frame>(
        &mut self,
        ctx: &mut MacContext,
        frame: &F,
        at: Option<u64>,
        window: Option<ResponseWindow>,
    ) -> bool {
        let result = frame
            .to_bytes()
            .and_then(|bytes| ctx.radio.start_tx(&bytes, at, window));
        match result {
            Ok(()) => true,
            Err(error) => {
                self.stats.tx_error.inc();
                debug!(%error, "ranging frame not sent");
                false
            }
        }
    }

    fn abort(&mut self) -> bool {
        self.pending = None;
        self.stats.rx_error.inc();
        true
    }

    fn carrier_integrator(wcs: &Wcs, value: i32) -> i32 {
        if wcs.is_valid() {
            0
        } else {
            value
        }
    }

    /// Responder: answer a request with our reception and transmission times
    fn respond(&mut self, ctx: &mut MacContext, header: FrameHeader, rx: &RxFrame) -> bool {
        let (answer, expected_len) = match RangingCode::from_raw(header.code) {
            Ok(RangingCode::SsTwr) => (RangingCode::SsTwrT1, RangeFinal::LEN),
            _ => (RangingCode::DsTwrT1, RangeFinal::LEN),
        };
        let timing = self.response_timing(&*ctx.radio, rx.rx_timestamp, rx.data.len());
        let window = self.response_window(&*ctx.radio, expected_len);

        let frame = self.frames.advance();
        *frame = RangeFinal {
            header: FrameHeader {
                dst_address: header.src_address,
                src_address: ctx.radio.short_address(),
                code: answer.raw(),
                ..header
            },
            reception_timestamp: stamp(ctx.wcs, rx.rx_timestamp),
            transmission_timestamp: stamp(ctx.wcs, timing.timestamp),
            carrier_integrator: Self::carrier_integrator(ctx.wcs, rx.carrier_integrator.wrapping_neg()),
            ..RangeFinal::default()
        };
        let response = RangeResponse {
            header: frame.header,
            reception_timestamp: frame.reception_timestamp,
            transmission_timestamp: frame.transmission_timestamp,
        };

        if !self.send(ctx, &response, Some(timing.tx_delay), Some(window)) {
            self.pending = None;
        }
        true
    }

    /// Initiator: the responder's answer to a single-sided request arrived
    fn single_sided_final(&mut self, ctx: &mut MacContext, rx: &RxFrame) -> bool {
        let response = match RangeResponse::decode(&rx.data) {
            Ok(response) if rx.data.len() == RangeResponse::LEN && !rx.lde_error => response,
            _ => return self.abort(),
        };
        let request_ts = ctx.radio.read_txtime();

        let frame = self.frames.current_mut();
        frame.header.dst_address = response.header.src_address;
        frame.header.src_address = ctx.radio.short_address();
        frame.header.code = RangingCode::SsTwrFinal.raw();
        frame.reception_timestamp = response.reception_timestamp;
        frame.transmission_timestamp = response.transmission_timestamp;
        frame.request_timestamp = stamp(ctx.wcs, request_ts);
        frame.response_timestamp = stamp(ctx.wcs, rx.rx_timestamp);
        frame.carrier_integrator = Self::carrier_integrator(ctx.wcs, rx.carrier_integrator);
        let report = *frame;

        if self.send(ctx, &report, None, None) {
            self.pending = Some(Pending::CompleteAfterTx);
        } else {
            self.complete(ctx);
        }
        true
    }

    /// Initiator: the first double-sided round trip is done, start the second
    fn double_sided_second(&mut self, ctx: &mut MacContext, rx: &RxFrame) -> bool {
        let response = match RangeResponse::decode(&rx.data) {
            Ok(response) if rx.data.len() == RangeResponse::LEN && !rx.lde_error => response,
            _ => return self.abort(),
        };
        let request_ts = stamp(ctx.wcs, ctx.radio.read_txtime());
        let response_ts = stamp(ctx.wcs, rx.rx_timestamp);
        let carrier_integrator = Self::carrier_integrator(ctx.wcs, rx.carrier_integrator);

        let first = self.frames.current_mut();
        first.reception_timestamp = response.reception_timestamp;
        first.transmission_timestamp = response.transmission_timestamp;
        first.request_timestamp = request_ts;
        first.response_timestamp = response_ts;
        first.carrier_integrator = carrier_integrator;
        let header = first.header;

        let timing = self.response_timing(&*ctx.radio, rx.rx_timestamp, rx.data.len());
        let window = self.response_window(&*ctx.radio, RangeFinal::LEN);

        let second = self.frames.advance();
        *second = RangeFinal {
            header: FrameHeader {
                seq_num: header.seq_num.wrapping_add(1),
                dst_address: response.header.src_address,
                src_address: ctx.radio.short_address(),
                code: RangingCode::DsTwrT2.raw(),
                ..header
            },
            reception_timestamp: response_ts,
            transmission_timestamp: stamp(ctx.wcs, timing.timestamp),
            request_timestamp: request_ts,
            response_timestamp: response_ts,
            carrier_integrator,
        };
        let report = *second;

        if !self.send(ctx, &report, Some(timing.tx_delay), Some(window)) {
            self.pending = None;
        }
        true
    }

    /// Responder: the initiator's second round trip arrived, send the final
    /// report
    fn double_sided_final(&mut self, ctx: &mut MacContext, rx: &RxFrame) -> bool {
        let received = match RangeFinal::decode(&rx.data) {
            Ok(received) if rx.data.len() == RangeFinal::LEN => received,
            _ => return self.abort(),
        };
        let request_ts = stamp(ctx.wcs, ctx.radio.read_txtime());
        let timing = self.response_timing(&*ctx.radio, rx.rx_timestamp, rx.data.len());

        let first = self.frames.current_mut();
        first.request_timestamp = received.request_timestamp;
        first.response_timestamp = received.response_timestamp;

        let second = self.frames.advance();
        *second = RangeFinal {
            header: FrameHeader {
                dst_address: received.header.src_address,
                src_address: ctx.radio.short_address(),
                code: RangingCode::DsTwrFinal.raw(),
                ..received.header
            },
            request_timestamp: request_ts,
            response_timestamp: stamp(ctx.wcs, rx.rx_timestamp),
            carrier_integrator: Self::carrier_integrator(ctx.wcs, rx.carrier_integrator.wrapping_neg()),
            ..received
        };
        let report = *second;

        if self.send(ctx, &report, Some(timing.tx_delay), None) {
            self.pending = Some(Pending::CompleteAfterTx);
        } else {
            self.complete(ctx);
        }
        true
    }

    /// Either side: the final report arrived
    fn finish(&mut self, ctx: &mut MacContext, rx: &RxFrame) -> bool {
        let report = match RangeFinal::decode(&rx.data) {
            Ok(report) if rx.data.len() == RangeFinal::LEN => report,
            _ => return self.abort(),
        };
        *self.frames.current_mut() = report;
        self.complete(ctx);
        true
    }

    fn complete(&mut self, ctx: &mut MacContext) {
        self.pending = None;

        let frame = *self.frames.current();
        let skew = if ctx.wcs.is_valid() {
            0.0
        } else {
            ctx.radio.clock_offset_ratio(frame.carrier_integrator)
        };
        let tof = twr_to_tof(self.frames.previous(), &frame, skew);
        let me = ctx.radio.short_address();
        let peer = if frame.header.src_address == me {
            frame.header.dst_address
        } else {
            frame.header.src_address
        };

        let code = match RangingCode::from_raw(frame.header.code) {
            Ok(code) => code,
            Err(error) => {
                warn!(%error, "completed exchange with unknown code");
                return;
            }
        };

        self.stats.complete.inc();
        trace!(peer, seq = frame.header.seq_num, tof, "range complete");
        ctx.completions.push(RangeResult {
            code,
            peer,
            seq_num: frame.header.seq_num,
            tof,
            range_m: tof_to_meters(tof),
            skew,
            frame,
        });
    }
}

impl MacInterface for TwrEngine {
    fn name(&self) -> &'static str {
        "twr"
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn rx_complete(&mut self, ctx: &mut MacContext, rx: &RxFrame) -> bool {
        let header = match FrameHeader::peek(&rx.data) {
            Some(header) => header,
            None => return false,
        };
        if self.pending != Some(Pending::Exchange) {
            self.stats.rx_unsolicited.inc();
            return false;
        }
        let me = ctx.radio.short_address();
        if header.dst_address != me && header.dst_address != BROADCAST_ADDRESS {
            self.stats.rx_other_frame.inc();
            return false;
        }

        let code = match RangingCode::from_raw(header.code) {
            Ok(code) => code,
            Err(_) => {
                self.stats.rx_other_frame.inc();
                return false;
            }
        };
        self.stats.rx_complete.inc();

        match code {
            RangingCode::SsTwr | RangingCode::DsTwr => self.respond(ctx, header, rx),
            RangingCode::SsTwrT1 => self.single_sided_final(ctx, rx),
            RangingCode::DsTwrT1 => self.double_sided_second(ctx, rx),
            RangingCode::DsTwrT2 => self.double_sided_final(ctx, rx),
            RangingCode::SsTwrFinal | RangingCode::DsTwrFinal => self.finish(ctx, rx),
            _ => {
                self.stats.rx_other_frame.inc();
                false
            }
        }
    }

    fn tx_complete(&mut self, ctx: &mut MacContext, _tx_timestamp: u64) -> bool {
        match self.pending {
            Some(Pending::CompleteAfterTx) => {
                self.stats.tx_complete.inc();
                self.complete(ctx);
                true
            }
            Some(Pending::Exchange) => {
                self.stats.tx_complete.inc();
                true
            }
            None => false,
        }
    }

    fn rx_timeout(&mut self, _ctx: &mut MacContext) -> bool {
        if self.pending.take().is_none() {
            return false;
        }
        self.stats.rx_timeout.inc();
        true
    }

    fn rx_error(&mut self, _ctx: &mut MacContext) -> bool {
        if self.pending.take().is_none() {
            return false;
        }
        self.stats.rx_error.inc();
        true
    }

    fn reset(&mut self, _ctx: &mut MacContext) -> bool {
        if self.pending.take().is_none() {
            return false;
        }
        self.stats.reset.inc();
        true
    }

    fn superframe(&mut self, _ctx: &mut MacContext, epoch: &EpochUpdate) {
        if self.pending.take().is_some() {
            self.stats.superframe_reset.inc();
            debug!(seq = epoch.seq_num, "ranging exchange dropped at superframe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WcsConfig,
        hal::mock::{MockRadio, MockTimer},
    };

    const OFFSET: u64 = 0x3_0000_0000;
    const TOF: u64 = 2133;
    const A_TX: u64 = 0x0100_0000;

    struct Peer {
        engine: TwrEngine,
        radio: MockRadio,
        timer: MockTimer,
        wcs: Wcs,
        results: Vec<RangeResult>,
    }

    fn peer(address: u16) -> Peer {
        Peer {
            engine: TwrEngine::new(RngConfig::default()),
            radio: MockRadio::new(address),
            timer: MockTimer::default(),
            wcs: Wcs::new(&WcsConfig::default()),
            results: Vec::new(),
        }
    }

    impl Peer {
        fn with_ctx<R>(&mut self, f: impl FnOnce(&mut TwrEngine, &mut MacContext) -> R) -> R {
            let mut ctx = MacContext {
                radio: &mut self.radio,
                timer: &mut self.timer,
                wcs: &self.wcs,
                completions: &mut self.results,
            };
            f(&mut self.engine, &mut ctx)
        }

        fn receive(&mut self, data: Vec<u8>, rx_timestamp: u64) -> bool {
            let frame = RxFrame {
                data,
                rx_timestamp,
                ..RxFrame::default()
            };
            self.with_ctx(|engine, ctx| engine.rx_complete(ctx, &frame))
        }

        fn transmitted(&mut self) -> bool {
            let txtime = self.radio.txtime;
            self.with_ctx(|engine, ctx| engine.tx_complete(ctx, txtime))
        }

        fn last_sent(&self) -> Vec<u8> {
            self.radio.sent.last().unwrap().frame.clone()
        }
    }

    /// Local time of `b` for an event `a` saw at `dtu`, one flight later
    fn flight_to_b(dtu: u64) -> u64 {
        (dtu + OFFSET + TOF) & MASK40
    }

    fn flight_to_a(dtu: u64) -> u64 {
        (dtu - OFFSET + TOF) & MASK40
    }

    fn assert_tof(result: &RangeResult) {
        assert!((result.tof - TOF as f64).abs() < 1e-3, "tof {}", result.tof);
        assert!((result.range_m - tof_to_meters(TOF as f64)).abs() < 1e-6);
    }

    #[test]
    fn single_sided_exchange() {
        let mut a = peer(0x0a);
        let mut b = peer(0x0b);

        b.engine.listen(&mut b.radio, None, None).unwrap();
        a.engine
            .request(&mut a.radio, 0x0b, RangingCode::SsTwr, Some(A_TX))
            .unwrap();
        assert_eq!(a.radio.sent[0].frame.len(), RangeRequest::LEN);
        assert_eq!(a.engine.seq_num(), 1);

        // Responder answers at a fixed holdoff
        assert!(b.receive(a.last_sent(), flight_to_b(A_TX)));
        let response = RangeResponse::decode(&b.last_sent()).unwrap();
        assert_eq!(response.header.code, RangingCode::SsTwrT1.raw());
        assert_eq!(response.header.dst_address, 0x0a);
        assert_eq!(response.header.src_address, 0x0b);
        let b_tx = b.radio.txtime;
        assert_eq!(u64::from(response.transmission_timestamp), b_tx & MASK32);
        assert!(b.transmitted());

        // Initiator sends the final report and completes once it is out
        assert!(a.receive(b.last_sent(), flight_to_a(b_tx)));
        let report = RangeFinal::decode(&a.last_sent()).unwrap();
        assert_eq!(report.header.code, RangingCode::SsTwrFinal.raw());
        assert!(a.results.is_empty());
        assert!(a.transmitted());
        assert_eq!(a.results.len(), 1);
        assert_tof(&a.results[0]);
        assert_eq!(a.results[0].peer, 0x0b);
        assert!(!a.engine.is_busy());

        assert!(b.receive(a.last_sent(), 0));
        assert_eq!(b.results.len(), 1);
        assert_tof(&b.results[0]);
        assert_eq!(b.results[0].peer, 0x0a);
        assert_eq!(b.engine.stats().complete.get(), 1);
    }

    #[test]
    fn double_sided_exchange() {
        let mut a = peer(0x0a);
        let mut b = peer(0x0b);

        b.engine.listen(&mut b.radio, None, None).unwrap();
        a.engine
            .request(&mut a.radio, 0x0b, RangingCode::DsTwr, Some(A_TX))
            .unwrap();
        assert_eq!(a.engine.seq_num(), 2);

        assert!(b.receive(a.last_sent(), flight_to_b(A_TX)));
        let b_tx = b.radio.txtime;
        assert!(b.transmitted());

        assert!(a.receive(b.last_sent(), flight_to_a(b_tx)));
        let second = RangeFinal::decode(&a.last_sent()).unwrap();
        assert_eq!(second.header.code, RangingCode::DsTwrT2.raw());
        assert_eq!(second.header.seq_num, 3);
        let a_tx = a.radio.txtime;
        assert!(a.transmitted());
        assert!(a.results.is_empty());

        assert!(b.receive(a.last_sent(), flight_to_b(a_tx)));
        let report = RangeFinal::decode(&b.last_sent()).unwrap();
        assert_eq!(report.header.code, RangingCode::DsTwrFinal.raw());
        assert!(b.transmitted());
        assert_eq!(b.results.len(), 1);
        assert_tof(&b.results[0]);

        assert!(a.receive(b.last_sent(), 0));
        assert_eq!(a.results.len(), 1);
        assert_tof(&a.results[0]);
        assert_eq!(a.results[0].code, RangingCode::DsTwrFinal);
    }

    #[test]
    fn response_is_scheduled_after_holdoff() {
        let mut b = peer(0x0b);
        b.engine.listen(&mut b.radio, None, None).unwrap();

        let request = RangeRequest {
            fctrl: fctrl::IEEE_RANGE_16,
            dst_address: 0x0b,
            src_address: 0x0a,
            code: RangingCode::SsTwr.raw(),
            ..RangeRequest::default()
        };
        assert!(b.receive(request.to_bytes().unwrap(), 0x10_0000_0000));

        // 65 us preamble and 11 us of data are 63 and 10 uus
        let sent = &b.radio.sent[0];
        assert_eq!(sent.at, Some(0x10_0000_0000 + ((0x300 + 63 + 10) << 16)));
        assert_eq!(
            sent.response,
            Some(ResponseWindow {
                delay_uus: 0x300 - 6,
                timeout_uus: 93 + 0x20 + 6,
            })
        );
    }

    #[test]
    fn unsolicited_and_foreign_frames_are_passed_on() {
        let mut b = peer(0x0b);
        let request = RangeRequest {
            fctrl: fctrl::IEEE_RANGE_16,
            dst_address: 0x0c,
            code: RangingCode::SsTwr.raw(),
            ..RangeRequest::default()
        };

        assert!(!b.receive(request.to_bytes().unwrap(), 0));
        assert_eq!(b.engine.stats().rx_unsolicited.get(), 1);

        b.engine.listen(&mut b.radio, None, None).unwrap();
        assert!(!b.receive(request.to_bytes().unwrap(), 0));
        assert_eq!(b.engine.stats().rx_other_frame.get(), 1);
        assert!(!b.receive(vec![0xc5; 32], 0));
        assert!(b.radio.sent.is_empty());
    }

    #[test]
    fn failed_final_still_completes() {
        let mut a = peer(0x0a);
        let mut b = peer(0x0b);

        b.engine.listen(&mut b.radio, None, None).unwrap();
        a.engine
            .request(&mut a.radio, 0x0b, RangingCode::SsTwr, Some(A_TX))
            .unwrap();
        b.receive(a.last_sent(), flight_to_b(A_TX));

        a.radio.fail_tx = true;
        assert!(a.receive(b.last_sent(), flight_to_a(b.radio.txtime)));
        assert_eq!(a.engine.stats().tx_error.get(), 1);
        assert_eq!(a.results.len(), 1);
        assert_tof(&a.results[0]);
    }

    #[test]
    fn timeouts_and_superframes_end_exchanges() {
        let mut a = peer(0x0a);
        a.engine
            .request(&mut a.radio, 0x0b, RangingCode::SsTwr, None)
            .unwrap();
        assert!(matches!(
            a.engine.request(&mut a.radio, 0x0b, RangingCode::SsTwr, None),
            Err(Error::Busy)
        ));

        assert!(a.with_ctx(|engine, ctx| engine.rx_timeout(ctx)));
        assert!(!a.with_ctx(|engine, ctx| engine.rx_timeout(ctx)));
        assert_eq!(a.engine.stats().rx_timeout.get(), 1);

        a.engine.listen(&mut a.radio, None, Some(100)).unwrap();
        let epoch = a.wcs_epoch();
        a.with_ctx(|engine, ctx| engine.superframe(ctx, &epoch));
        assert!(!a.engine.is_busy());
        assert_eq!(a.engine.stats().superframe_reset.get(), 1);
    }

    #[test]
    fn only_requests_start_exchanges() {
        let mut a = peer(0x0a);

        assert!(matches!(
            a.engine.request(&mut a.radio, 0x0b, RangingCode::SsTwrFinal, None),
            Err(Error::InvalidArgument)
        ));
        a.radio.fail_tx = true;
        assert!(a
            .engine
            .request(&mut a.radio, 0x0b, RangingCode::SsTwr, None)
            .is_err());
        assert!(!a.engine.is_busy());
        assert_eq!(a.engine.stats().tx_error.get(), 1);
    }

    #[test]
    fn tof_dispatch_by_code() {
        let frame = RangeFinal {
            header: FrameHeader {
                code: RangingCode::SsTwrFinal.raw(),
                ..FrameHeader::default()
            },
            request_timestamp: 0,
            response_timestamp: 1000,
            reception_timestamp: 100,
            transmission_timestamp: 900,
            ..RangeFinal::default()
        };
        assert_eq!(twr_to_tof(&RangeFinal::default(), &frame, 0.0), 100.0);

        let rtdoa = RangeFinal {
            header: FrameHeader {
                code: RangingCode::RtdoaRequest.raw(),
                ..FrameHeader::default()
            },
            ..frame
        };
        assert_eq!(twr_to_tof(&frame, &rtdoa, 0.0), 0.0);
    }

    impl Peer {
        fn wcs_epoch(&self) -> EpochUpdate {
            EpochUpdate {
                seq_num: 1,
                master_epoch: 0,
                local_epoch: 0,
                os_epoch: 0,
                period_uus: 0x10000,
                kind: crate::ccp::EpochKind::Received,
                valid: false,
            }
        }
    }
}

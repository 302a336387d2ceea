//! Per-device worker
//!
//! A [`Node`] owns everything one radio needs: clock calibration, the clock
//! estimator, the slot scheduler, the protocol chain and the time-of-flight
//! table. All of it lives in a [`ControlBlock`] behind one lock. The worker
//! takes events from the node's [`EventQueue`] and is the only code path
//! that advances protocol state; management code goes through a
//! [`NodeHandle`], which takes the same lock.
//!
//! If the worker finds the control block locked, it puts the event back and
//! waits for the lock to be released before retrying, so a slow management
//! call delays events but never reorders them.
//!
//! [`Node`]: struct.Node.html
//! [`ControlBlock`]: struct.ControlBlock.html
//! [`EventQueue`]: ../event/struct.EventQueue.html
//! [`NodeHandle`]: struct.NodeHandle.html

use std::{collections::VecDeque, io, mem, sync::Arc, thread};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::{
    ccp::{Ccp, CcpRole, EpochUpdate, Outcome},
    config::NodeConfig,
    event::{Event, EventQueue, EventSender},
    hal::{CpuTimer, Radio, RadioEvent, TimerId},
    mac::{MacChain, MacContext},
    ranging::{
        tofdb::{SharedTofDb, TofDb, TofDbUpdater},
        TwrEngine,
    },
    registry::DeviceId,
    stats::Snapshot,
    tdma::{SlotHandler, Tdma},
    wcs::Wcs,
    Error,
};

/// State of one device, guarded by the node's lock
pub struct ControlBlock {
    radio: Box<dyn Radio>,
    timer: Box<dyn CpuTimer>,
    ccp: Ccp,
    wcs: Wcs,
    tdma: Tdma,
    chain: MacChain,
    tofdb: SharedTofDb,
}

impl ControlBlock {
    /// Starts clock calibration and the slot scheduler
    pub fn start(&mut self) -> Result<(), Error> {
        self.ccp.start(&mut *self.radio, &mut *self.timer)?;
        self.tdma.start(&mut *self.timer, self.ccp.period_uus());
        Ok(())
    }

    /// Stops clock calibration and the slot scheduler
    ///
    /// Assigned slots are kept.
    pub fn stop(&mut self) {
        self.ccp.stop(&mut *self.radio, &mut *self.timer);
        self.tdma.stop(&mut *self.timer);
    }

    /// Changes the clock calibration role; only allowed while stopped
    pub fn set_role(&mut self, role: CcpRole) -> Result<(), Error> {
        self.ccp.set_role(role)
    }

    /// Changes the superframe period
    pub fn set_period(&mut self, period_uus: u32) -> Result<(), Error> {
        self.ccp.set_period(period_uus)
    }

    /// Assigns `handler` to slot `idx`
    pub fn assign_slot(&mut self, idx: u16, handler: SlotHandler) -> Result<(), Error> {
        self.tdma.assign_slot(idx, handler)
    }

    /// Releases slot `idx`
    pub fn release_slot(&mut self, idx: u16) -> Result<(), Error> {
        self.tdma.release_slot(idx, &mut *self.timer)
    }

    /// Clock calibration
    pub fn ccp(&self) -> &Ccp {
        &self.ccp
    }

    /// Clock estimator
    pub fn wcs(&self) -> &Wcs {
        &self.wcs
    }

    /// Slot scheduler
    pub fn tdma(&self) -> &Tdma {
        &self.tdma
    }

    /// Protocol chain
    pub fn chain_mut(&mut self) -> &mut MacChain {
        &mut self.chain
    }

    /// Time-of-flight table
    pub fn tofdb(&self) -> &SharedTofDb {
        &self.tofdb
    }

    /// Current values of every statistics section
    pub fn snapshots(&mut self) -> Vec<Snapshot> {
        let mut snapshots = vec![
            Snapshot::of(self.ccp.stats()),
            Snapshot::of(self.wcs.stats()),
            Snapshot::of(self.tdma.stats()),
        ];
        if let Some(engine) = self.chain.find_mut::<TwrEngine>() {
            snapshots.push(Snapshot::of(engine.stats()));
        }
        snapshots.push(Snapshot::of(self.tofdb.lock().stats()));
        snapshots
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Timer(TimerId::Ccp) => {
                let epoch = self
                    .ccp
                    .on_timer(&mut *self.radio, &mut *self.timer, &self.wcs);
                if let Some(epoch) = epoch {
                    self.superframe(epoch);
                }
            }
            Event::Timer(id) => {
                self.tdma.on_timer(
                    id,
                    &mut *self.radio,
                    &mut *self.timer,
                    &self.wcs,
                    &mut self.chain,
                );
            }
            Event::Radio(event) => self.radio_event(event),
            Event::Shutdown => {}
        }
        self.poll_radio();
    }

    fn radio_event(&mut self, event: RadioEvent) {
        let radio = &mut *self.radio;
        let timer = &mut *self.timer;
        let outcome = match &event {
            RadioEvent::RxComplete(frame) => self.ccp.rx_complete(frame, radio, timer, &self.wcs),
            RadioEvent::TxComplete(ts) => self.ccp.tx_complete(*ts, radio, timer),
            RadioEvent::RxTimeout => self.ccp.rx_timeout(timer),
            RadioEvent::RxError => self.ccp.rx_error(timer),
            RadioEvent::Reset => self.ccp.reset(timer),
        };

        let claimed = match outcome {
            Outcome::Ignored => false,
            Outcome::Consumed => true,
            Outcome::Epoch(epoch) => {
                self.superframe(epoch);
                true
            }
        };
        // Every protocol has to see a reset.
        if !claimed || event == RadioEvent::Reset {
            self.dispatch(&event);
        }
    }

    fn dispatch(&mut self, event: &RadioEvent) {
        let consumed = self.with_mac(|chain, ctx| match event {
            RadioEvent::RxComplete(frame) => chain.rx_complete(ctx, frame),
            RadioEvent::TxComplete(ts) => chain.tx_complete(ctx, *ts),
            RadioEvent::RxTimeout => chain.rx_timeout(ctx),
            RadioEvent::RxError => chain.rx_error(ctx),
            RadioEvent::Reset => chain.reset(ctx),
        });
        if !consumed {
            trace!("radio event not claimed");
        }
    }

    fn superframe(&mut self, epoch: EpochUpdate) {
        self.wcs.observe(&epoch);
        self.tdma
            .on_superframe(&epoch, &*self.radio, &mut *self.timer);
        self.with_mac(|chain, ctx| chain.superframe(ctx, &epoch));
    }

    /// Runs `f` on the chain, then hands every range result it produced to
    /// the whole chain
    fn with_mac<R>(&mut self, f: impl FnOnce(&mut MacChain, &mut MacContext) -> R) -> R {
        let mut completions = Vec::new();
        let result = f(
            &mut self.chain,
            &mut MacContext {
                radio: &mut *self.radio,
                timer: &mut *self.timer,
                wcs: &self.wcs,
                completions: &mut completions,
            },
        );

        while !completions.is_empty() {
            let finished = mem::take(&mut completions);
            let mut ctx = MacContext {
                radio: &mut *self.radio,
                timer: &mut *self.timer,
                wcs: &self.wcs,
                completions: &mut completions,
            };
            for range in &finished {
                self.chain.complete(&mut ctx, range);
            }
        }
        result
    }

    fn poll_radio(&mut self) {
        loop {
            match self.radio.poll() {
                Ok(event) => self.radio_event(event),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(error)) => {
                    warn!(%error, "radio poll failed");
                    break;
                }
            }
        }
    }
}

/// Controls a node from outside its worker
///
/// Cheap to clone. Every method takes the node's lock for its duration.
#[derive(Clone)]
pub struct NodeHandle {
    id: DeviceId,
    block: Arc<Mutex<ControlBlock>>,
    sender: EventSender,
}

impl NodeHandle {
    /// Device driven by the node
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Returns a sender for the node's event queue
    ///
    /// Radio interrupt handlers and timers post through this.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Locks the control block
    pub fn lock(&self) -> MutexGuard<'_, ControlBlock> {
        self.block.lock()
    }

    /// See [`ControlBlock::start`](struct.ControlBlock.html#method.start)
    pub fn start(&self) -> Result<(), Error> {
        self.lock().start()
    }

    /// See [`ControlBlock::stop`](struct.ControlBlock.html#method.stop)
    pub fn stop(&self) {
        self.lock().stop()
    }

    /// See [`ControlBlock::set_role`](struct.ControlBlock.html#method.set_role)
    pub fn set_role(&self, role: CcpRole) -> Result<(), Error> {
        self.lock().set_role(role)
    }

    /// See [`ControlBlock::set_period`](struct.ControlBlock.html#method.set_period)
    pub fn set_period(&self, period_uus: u32) -> Result<(), Error> {
        self.lock().set_period(period_uus)
    }

    /// See [`ControlBlock::assign_slot`](struct.ControlBlock.html#method.assign_slot)
    pub fn assign_slot(&self, idx: u16, handler: SlotHandler) -> Result<(), Error> {
        self.lock().assign_slot(idx, handler)
    }

    /// See [`ControlBlock::release_slot`](struct.ControlBlock.html#method.release_slot)
    pub fn release_slot(&self, idx: u16) -> Result<(), Error> {
        self.lock().release_slot(idx)
    }

    /// See [`ControlBlock::snapshots`](struct.ControlBlock.html#method.snapshots)
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.lock().snapshots()
    }

    /// Asks the worker to return once it reaches this request
    pub fn shutdown(&self) {
        self.sender.post(Event::Shutdown);
    }
}

/// The worker of one device
pub struct Node {
    id: DeviceId,
    block: Arc<Mutex<ControlBlock>>,
    queue: EventQueue,
    deferred: VecDeque<Event>,
}

impl Node {
    /// Creates a stopped node
    ///
    /// `timer` must post its expiries to `queue`. The protocol chain starts
    /// out with the ranging engine followed by the time-of-flight updater;
    /// clock calibration uses the same time-of-flight table to compensate
    /// relayed blinks.
    pub fn new(
        config: &NodeConfig,
        radio: Box<dyn Radio>,
        timer: Box<dyn CpuTimer>,
        queue: EventQueue,
    ) -> Result<Self, Error> {
        let tofdb = TofDb::new(&config.tofdb).shared();

        let mut ccp = Ccp::new(config.ccp.clone())?;
        ccp.set_tof_compensation(Box::new(tofdb.clone()));

        let mut chain = MacChain::new();
        chain.append(Box::new(TwrEngine::new(config.rng.clone())))?;
        chain.append(Box::new(TofDbUpdater::new(tofdb.clone())))?;

        let block = ControlBlock {
            radio,
            timer,
            ccp,
            wcs: Wcs::new(&config.wcs),
            tdma: Tdma::new(&config.tdma)?,
            chain,
            tofdb,
        };

        debug!(device = config.device.0, "node created");
        Ok(Node {
            id: config.device,
            block: Arc::new(Mutex::new(block)),
            queue,
            deferred: VecDeque::new(),
        })
    }

    /// Returns a handle for controlling this node
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            id: self.id,
            block: self.block.clone(),
            sender: self.queue.sender(),
        }
    }

    /// Processes one event
    ///
    /// Returns `false` if the event asked the worker to shut down.
    pub fn process(&mut self, event: Event) -> bool {
        if event == Event::Shutdown {
            return false;
        }
        match self.block.try_lock() {
            Some(mut block) => block.handle(event),
            None => {
                trace!("control block busy, deferring event");
                self.deferred.push_front(event);
            }
        }
        true
    }

    /// Processes queued events without blocking
    ///
    /// Returns once the queue is empty, an event found the control block
    /// locked, or a shutdown request was reached. Returns `false` in the
    /// last case.
    pub fn run_pending(&mut self) -> bool {
        while let Some(event) = self.next_pending() {
            if !self.process(event) {
                return false;
            }
            if !self.deferred.is_empty() {
                break;
            }
        }
        true
    }

    /// Number of events put back because the control block was locked
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Processes events until a shutdown request arrives
    pub fn run(mut self) {
        info!(device = self.id.0, "node running");
        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => self.queue.next(),
            };
            if !self.process(event) {
                break;
            }
            if !self.deferred.is_empty() {
                // Sleep until the management call releases the block.
                drop(self.block.lock());
            }
        }
        info!(device = self.id.0, "node shut down");
    }

    /// Runs the worker on its own thread
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("uwb{}", self.id.0))
            .spawn(move || self.run())
    }

    fn next_pending(&mut self) -> Option<Event> {
        self.deferred
            .pop_front()
            .or_else(|| self.queue.try_next().ok())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        config::CcpConfig,
        tdma::SlotContext,
        frame::{fctrl, Frame, RangeRequest, RangingCode},
        hal::{
            mock::{MockRadio, MockTimer},
            RxFrame,
        },
    };

    const NOW: u32 = 1_000_000;

    fn node(role: CcpRole) -> (Node, NodeHandle) {
        let config = NodeConfig {
            device: DeviceId(7),
            ccp: CcpConfig {
                role,
                ..CcpConfig::default()
            },
            ..NodeConfig::default()
        };
        let timer = MockTimer {
            now: NOW,
            ..MockTimer::default()
        };
        let node = Node::new(
            &config,
            Box::new(MockRadio::new(0x1234)),
            Box::new(timer),
            EventQueue::new(),
        )
        .unwrap();
        let handle = node.handle();
        (node, handle)
    }

    fn counter(handle: &NodeHandle, section: &str, name: &str) -> u32 {
        handle
            .snapshots()
            .into_iter()
            .find(|snapshot| snapshot.section == section)
            .and_then(|snapshot| snapshot.get(name))
            .unwrap()
    }

    #[test]
    fn chain_is_set_up() {
        let (_node, handle) = node(CcpRole::Slave);

        assert_eq!(handle.lock().chain_mut().names(), vec!["twr", "tofdb"]);
        let sections = handle
            .snapshots()
            .into_iter()
            .map(|snapshot| snapshot.section)
            .collect::<Vec<_>>();
        assert_eq!(sections, vec!["ccp", "wcs", "tdma", "rng", "tofdb"]);
    }

    #[test]
    fn master_epoch_drives_slots() {
        let (mut node, handle) = node(CcpRole::Master);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let log = ran.clone();
        handle
            .assign_slot(
                2,
                Box::new(move |ctx: &mut SlotContext| {
                    let at = ctx.tx_slot_start(f32::from(ctx.idx));
                    let result = match ctx.chain.find_mut::<TwrEngine>() {
                        Some(twr) => twr.request(ctx.radio, 0x0b, RangingCode::SsTwr, Some(at)),
                        None => Err(Error::NotFound),
                    };
                    log.lock().push((ctx.idx, result.is_ok()));
                }),
            )
            .unwrap();
        handle.start().unwrap();

        let sender = handle.sender();
        sender.post(Event::Timer(TimerId::Ccp));
        assert!(node.run_pending());
        assert_eq!(counter(&handle, "ccp", "send"), 1);

        sender.post(Event::Radio(RadioEvent::TxComplete(0)));
        assert!(node.run_pending());
        assert_eq!(counter(&handle, "ccp", "tx_complete"), 1);
        assert_eq!(counter(&handle, "tdma", "superframe_cnt"), 1);
        assert!(handle.lock().tdma().epoch().is_some());

        sender.post(Event::Timer(TimerId::Slot(2)));
        assert!(node.run_pending());
        assert_eq!(*ran.lock(), vec![(2, true)]);
        assert_eq!(counter(&handle, "rng", "rng_request"), 1);
        assert_eq!(handle.lock().tdma().current_slot(), Some(2));
    }

    #[test]
    fn unclaimed_events_reach_the_chain() {
        let (mut node, handle) = node(CcpRole::Slave);
        let request = RangeRequest {
            fctrl: fctrl::IEEE_RANGE_16,
            dst_address: 0x1234,
            src_address: 0x0a,
            code: RangingCode::SsTwr.raw(),
            ..RangeRequest::default()
        };
        let frame = RxFrame {
            data: request.to_bytes().unwrap(),
            ..RxFrame::default()
        };

        // Clock calibration isn't running and the ranging engine isn't
        // listening, so the frame ends up unsolicited.
        handle
            .sender()
            .post(Event::Radio(RadioEvent::RxComplete(frame)));
        assert!(node.run_pending());

        assert_eq!(counter(&handle, "ccp", "rx_unsolicited"), 0);
        assert_eq!(counter(&handle, "rng", "rx_unsolicited"), 1);
    }

    #[test]
    fn locked_control_block_defers_events() {
        let (mut node, handle) = node(CcpRole::Master);
        handle.start().unwrap();
        handle.sender().post(Event::Timer(TimerId::Ccp));

        {
            let _guard = handle.lock();
            assert!(node.run_pending());
            assert_eq!(node.deferred(), 1);
        }
        assert_eq!(counter(&handle, "ccp", "send"), 0);

        assert!(node.run_pending());
        assert_eq!(node.deferred(), 0);
        assert_eq!(counter(&handle, "ccp", "send"), 1);
    }

    #[test]
    fn worker_waits_for_management_call() {
        let (node, handle) = node(CcpRole::Master);
        handle.start().unwrap();

        let guard = handle.lock();
        handle.sender().post(Event::Timer(TimerId::Ccp));
        let worker = node.spawn().unwrap();
        thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);

        handle.shutdown();
        worker.join().unwrap();
        assert_eq!(counter(&handle, "ccp", "send"), 1);
    }

    #[test]
    fn shutdown_stops_the_worker() {
        let (mut node, handle) = node(CcpRole::Slave);
        handle.shutdown();
        handle.sender().post(Event::Timer(TimerId::Ccp));

        assert!(!node.run_pending());

        let (node, handle) = self::node(CcpRole::Slave);
        let worker = node.spawn().unwrap();
        handle.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn stopped_node_ignores_timers() {
        let (mut node, handle) = node(CcpRole::Master);
        handle.start().unwrap();
        handle.stop();
        handle.sender().post(Event::Timer(TimerId::Ccp));
        handle.sender().post(Event::Timer(TimerId::Slot(0)));

        assert!(node.run_pending());
        assert_eq!(counter(&handle, "ccp", "send"), 0);
        assert_eq!(counter(&handle, "tdma", "slot_timer_cnt"), 0);
    }
}

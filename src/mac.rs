//! Protocol chain of a radio
//!
//! Every protocol that wants to see radio events implements [`MacInterface`]
//! and is appended to the device's [`MacChain`]. Events are offered to the
//! interfaces in insertion order until one of them claims the event, so a
//! protocol appended later can rely on the side effects of an earlier one.
//!
//! [`MacInterface`]: trait.MacInterface.html
//! [`MacChain`]: struct.MacChain.html

use std::any::Any;

use tracing::{debug, trace};

use crate::{
    ccp::EpochUpdate,
    hal::{CpuTimer, Radio, RxFrame},
    ranging::RangeResult,
    wcs::Wcs,
    Error,
};

/// What an interface gets to work with while handling an event
pub struct MacContext<'a> {
    /// The device's radio
    pub radio: &'a mut dyn Radio,
    /// The device's CPU timer
    pub timer: &'a mut dyn CpuTimer,
    /// Clock model of the device
    pub wcs: &'a Wcs,
    /// Range results produced while handling the event
    ///
    /// The node hands them to [`MacChain::complete`] once the event has been
    /// dispatched.
    ///
    /// [`MacChain::complete`]: struct.MacChain.html#method.complete
    pub completions: &'a mut Vec<RangeResult>,
}

/// A protocol attached to a radio
///
/// All event handlers return `true` if they consumed the event, which stops
/// it from being offered to interfaces further down the chain. The default
/// implementations ignore everything.
pub trait MacInterface: Send {
    /// Name the interface is registered under, unique within a chain
    fn name(&self) -> &'static str;

    /// Returns `self`, so the chain can hand out the concrete type
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// A frame was received
    fn rx_complete(&mut self, _ctx: &mut MacContext, _frame: &RxFrame) -> bool {
        false
    }

    /// A frame was sent at `_tx_timestamp`
    fn tx_complete(&mut self, _ctx: &mut MacContext, _tx_timestamp: u64) -> bool {
        false
    }

    /// A receive timeout expired
    fn rx_timeout(&mut self, _ctx: &mut MacContext) -> bool {
        false
    }

    /// A frame was received with errors
    fn rx_error(&mut self, _ctx: &mut MacContext) -> bool {
        false
    }

    /// The transceiver was reset
    fn reset(&mut self, _ctx: &mut MacContext) -> bool {
        false
    }

    /// A new superframe started
    ///
    /// Offered to every interface.
    fn superframe(&mut self, _ctx: &mut MacContext, _epoch: &EpochUpdate) {}

    /// A range measurement finished
    ///
    /// Offered to every interface.
    fn complete(&mut self, _ctx: &mut MacContext, _result: &RangeResult) {}
}

/// Insertion-ordered list of the interfaces attached to a radio
#[derive(Default)]
pub struct MacChain {
    interfaces: Vec<Box<dyn MacInterface>>,
}

impl MacChain {
    /// Creates an empty chain
    pub fn new() -> Self {
        MacChain::default()
    }

    /// Appends `interface` to the end of the chain
    ///
    /// Fails with `InvalidArgument` if an interface with the same name is
    /// already attached.
    pub fn append(&mut self, interface: Box<dyn MacInterface>) -> Result<(), Error> {
        let name = interface.name();
        if self.interfaces.iter().any(|attached| attached.name() == name) {
            return Err(Error::InvalidArgument);
        }
        debug!(name, "mac interface appended");
        self.interfaces.push(interface);
        Ok(())
    }

    /// Detaches the interface called `name`
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn MacInterface>, Error> {
        let idx = self
            .interfaces
            .iter()
            .position(|attached| attached.name() == name)
            .ok_or(Error::NotFound)?;
        debug!(name, "mac interface removed");
        Ok(self.interfaces.remove(idx))
    }

    /// Names of the attached interfaces, in dispatch order
    pub fn names(&self) -> Vec<&'static str> {
        self.interfaces.iter().map(|attached| attached.name()).collect()
    }

    /// Number of attached interfaces
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Returns `true` if nothing is attached
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Returns the first attached interface of type `T`
    pub fn find_mut<T: MacInterface + 'static>(&mut self) -> Option<&mut T> {
        self.interfaces
            .iter_mut()
            .find_map(|attached| attached.as_any_mut().downcast_mut::<T>())
    }

    /// Offers an event to the interfaces until one consumes it
    ///
    /// Returns `true` if an interface consumed the event.
    pub fn dispatch(
        &mut self,
        ctx: &mut MacContext,
        mut handler: impl FnMut(&mut dyn MacInterface, &mut MacContext) -> bool,
    ) -> bool {
        for attached in &mut self.interfaces {
            if handler(attached.as_mut(), ctx) {
                trace!(name = attached.name(), "event consumed");
                return true;
            }
        }
        false
    }

    /// Offers a received frame to the chain
    pub fn rx_complete(&mut self, ctx: &mut MacContext, frame: &RxFrame) -> bool {
        self.dispatch(ctx, |attached, ctx| attached.rx_complete(ctx, frame))
    }

    /// Offers a transmission completion to the chain
    pub fn tx_complete(&mut self, ctx: &mut MacContext, tx_timestamp: u64) -> bool {
        self.dispatch(ctx, |attached, ctx| attached.tx_complete(ctx, tx_timestamp))
    }

    /// Offers a receive timeout to the chain
    pub fn rx_timeout(&mut self, ctx: &mut MacContext) -> bool {
        self.dispatch(ctx, |attached, ctx| attached.rx_timeout(ctx))
    }

    /// Offers a reception error to the chain
    pub fn rx_error(&mut self, ctx: &mut MacContext) -> bool {
        self.dispatch(ctx, |attached, ctx| attached.rx_error(ctx))
    }

    /// Offers a transceiver reset to the chain
    pub fn reset(&mut self, ctx: &mut MacContext) -> bool {
        self.dispatch(ctx, |attached, ctx| attached.reset(ctx))
    }

    /// Tells every interface about a new superframe
    pub fn superframe(&mut self, ctx: &mut MacContext, epoch: &EpochUpdate) {
        for attached in &mut self.interfaces {
            attached.superframe(ctx, epoch);
        }
    }

    /// Tells every interface about a finished range measurement
    pub fn complete(&mut self, ctx: &mut MacContext, result: &RangeResult) {
        for attached in &mut self.interfaces {
            attached.complete(ctx, result);
        }
    }
}

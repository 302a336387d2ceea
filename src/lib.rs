//! Timing and ranging core for UWB positioning
//!
//! The crate turns the raw timestamps of a UWB transceiver into a shared
//! network timebase and time-of-flight measurements:
//!
//! - [`ccp`] sends or tracks the periodic clock calibration blinks that mark
//!   superframe epochs.
//! - [`wcs`] estimates the offset and rate of the local clock against the
//!   master clock from those epochs.
//! - [`tdma`] splits each superframe into slots and runs a handler at the
//!   start of every assigned slot.
//! - [`ranging`] implements single- and double-sided two-way ranging.
//! - [`node`] ties all of the above to one radio and processes its events on
//!   a single worker.
//!
//! Hardware access goes through the [`Radio`] and [`CpuTimer`] traits; the
//! crate doesn't talk to a transceiver itself.
//!
//! [`ccp`]: ccp/index.html
//! [`wcs`]: wcs/index.html
//! [`tdma`]: tdma/index.html
//! [`ranging`]: ranging/index.html
//! [`node`]: node/index.html
//! [`Radio`]: hal/trait.Radio.html
//! [`CpuTimer`]: hal/trait.CpuTimer.html


#![deny(missing_docs)]


#[macro_use]
mod macros;

pub mod ccp;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod hal;
pub mod mac;
pub mod node;
pub mod pool;
pub mod ranging;
pub mod registry;
pub mod slots;
pub mod stats;
pub mod tdma;
pub mod time;
pub mod wcs;


pub use crate::{
    error::Error,
    node::{Node, NodeHandle},
    time::{Duration, Instant, TIME_MAX},
};

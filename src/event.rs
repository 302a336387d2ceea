//! Single-consumer event queue
//!
//! Interrupt handlers and expiring timers never touch protocol state. They
//! post an [`Event`] through an [`EventSender`]; the node's worker is the only
//! consumer and the only writer of clock calibration, estimator and scheduler
//! state.
//!
//! [`Event`]: enum.Event.html
//! [`EventSender`]: struct.EventSender.html

use std::{collections::VecDeque, convert::Infallible, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::hal::{RadioEvent, TimerId};

/// Something the worker has to process
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A one-shot timer expired
    Timer(TimerId),
    /// The radio reported something
    Radio(RadioEvent),
    /// The worker should return
    Shutdown,
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<VecDeque<Event>>,
    posted: Condvar,
}

/// Posts events to a queue
///
/// Cheap to clone; hand one to every interrupt handler and timer.
#[derive(Clone, Debug)]
pub struct EventSender(Arc<Shared>);

impl EventSender {
    /// Appends `event` and wakes the consumer
    pub fn post(&self, event: Event) {
        self.0.events.lock().push_back(event);
        self.0.posted.notify_one();
    }
}

/// The consuming end of the queue
#[derive(Debug, Default)]
pub struct EventQueue(Arc<Shared>);

impl EventQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Returns a handle for posting to this queue
    pub fn sender(&self) -> EventSender {
        EventSender(self.0.clone())
    }

    /// Takes the next event without blocking
    ///
    /// Returns `nb::Error::WouldBlock` if the queue is empty.
    pub fn try_next(&self) -> nb::Result<Event, Infallible> {
        self.0.events.lock().pop_front().ok_or(nb::Error::WouldBlock)
    }

    /// Waits for the next event
    pub fn next(&self) -> Event {
        let mut events = self.0.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return event;
            }
            self.0.posted.wait(&mut events);
        }
    }

    /// Waits up to `timeout` for the next event
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut events = self.0.events.lock();
        if events.is_empty() {
            self.0.posted.wait_for(&mut events, timeout);
        }
        events.pop_front()
    }

    /// Number of events waiting
    pub fn len(&self) -> usize {
        self.0.events.lock().len()
    }

    /// Returns `true` if no event is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn events_come_out_in_order() {
        let queue = EventQueue::new();
        let sender = queue.sender();

        sender.post(Event::Timer(TimerId::Slot(3)));
        sender.post(Event::Radio(RadioEvent::RxTimeout));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_next(), Ok(Event::Timer(TimerId::Slot(3))));
        assert_eq!(queue.try_next(), Ok(Event::Radio(RadioEvent::RxTimeout)));
        assert_eq!(queue.try_next(), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn wakes_blocked_consumer() {
        let queue = EventQueue::new();
        let sender = queue.sender();

        let poster = thread::spawn(move || sender.post(Event::Shutdown));

        assert_eq!(queue.next(), Event::Shutdown);
        poster.join().unwrap();
    }

    #[test]
    fn timeout_on_empty_queue() {
        let queue = EventQueue::new();

        assert_eq!(queue.next_timeout(Duration::from_millis(1)), None);
    }
}

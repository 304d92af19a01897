//! Quiescence barrier for in-flight requests.
//!
//! Every dispatched request holds a `Ticket` for as long as it runs. Once the pump stops reading
//! it waits on the barrier, which returns only after every ticket has been dropped. Tickets are
//! released on drop, so a panicking callback cannot wedge the drain.

use crossbeam::sync::WaitGroup;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;


/// Counters shared between a pump and whoever observes it.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    dispatched: AtomicU64,
    in_flight: AtomicUsize,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> PumpStats {
        PumpStats {
            dispatched: self.dispatched.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of a pump's activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PumpStats {
    /// Requests handed to a unit of work since the pump started.
    pub dispatched: u64,
    /// Units of work that have not finished yet.
    pub in_flight: usize,
}


#[derive(Debug)]
pub(crate) struct DrainBarrier {
    group: WaitGroup,
    counters: Arc<Counters>,
}

impl DrainBarrier {
    pub(crate) fn new(counters: Arc<Counters>) -> Self {
        Self { group: WaitGroup::new(), counters }
    }

    /// Register a new unit of work.
    pub(crate) fn enter(&self) -> Ticket {
        self.counters.dispatched.fetch_add(1, Ordering::AcqRel);
        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        Ticket { _group: self.group.clone(), counters: Arc::clone(&self.counters) }
    }

    /// Block until every ticket handed out has been dropped.
    ///
    /// Consuming the barrier guarantees no ticket is issued after the wait began.
    pub(crate) fn wait(self) {
        self.group.wait();
    }
}


/// Proof of an outstanding unit of work, released on drop.
#[derive(Debug)]
pub(crate) struct Ticket {
    _group: WaitGroup,
    counters: Arc<Counters>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        // Runs before `_group` is dropped, so waiters observe a settled count
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

//! Timed-event scheduler and clock.
//!
//! Events are values of a closed sum type rather than callbacks; the
//! daemon dispatches on the variant when an event comes due. A handler
//! returns the delay until it should run again (0 = done), and handles
//! stay stable across reschedules so other structures can keep them.

use crate::face::DelayClass;
use crate::faces::FaceId;
use crate::pit::PitRef;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EventHandle = u64;

/// Everything the daemon ever schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedEvent {
    /// Expire idle datagram faces, expired PIT entries, and retired
    /// prefix entries.
    Reap,
    /// Age forwarding-entry lifetimes.
    AgeForwarding,
    /// Cache cleaning; `resume` is the accession to continue from when a
    /// pass ran out of budget.
    CleanStore { resume: u64 },
    /// Propagation tick for one pending interest. `fast_usec` is the
    /// predicted-response delay captured when the entry was created.
    Propagate { pit: PitRef, fast_usec: u64 },
    /// Drain one face's outbound queue for one delay class.
    SendQueue { face: FaceId, class: DelayClass },
    /// Freshness expiry for one stored object.
    FreshnessExpire { accession: u64 },
}

/// Microsecond clock. The wall variant is `gettimeofday`-based and
/// clamped so it never observes time running backwards.
#[derive(Debug)]
pub enum Clock {
    Wall { last: u64 },
    Manual { now: u64 },
}

impl Clock {
    pub fn wall() -> Self {
        Clock::Wall { last: 0 }
    }

    pub fn manual() -> Self {
        Clock::Manual { now: 0 }
    }

    pub fn now(&mut self) -> u64 {
        match self {
            Clock::Wall { last } => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0);
                if now > *last {
                    *last = now;
                }
                *last
            }
            Clock::Manual { now } => *now,
        }
    }

    /// Moves a manual clock forward. A wall clock moves on its own.
    pub fn advance(&mut self, usec: u64) {
        if let Clock::Manual { now } = self {
            *now += usec;
        }
    }
}

struct Entry {
    order: u64,
    event: TimedEvent,
}

/// Binary-heap event queue. Ties on the deadline break FIFO by insertion
/// order. Stale heap items (cancelled or rescheduled) are skipped lazily.
pub struct Scheduler {
    heap: BinaryHeap<Reverse<(u64, u64, EventHandle)>>,
    entries: HashMap<EventHandle, Entry>,
    next_handle: EventHandle,
    next_order: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_handle: 1,
            next_order: 1,
        }
    }

    pub fn schedule(&mut self, due: u64, event: TimedEvent) -> EventHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.push(handle, due, event);
        handle
    }

    /// Requeues an event under its existing handle.
    pub fn reschedule(&mut self, handle: EventHandle, due: u64, event: TimedEvent) {
        self.push(handle, due, event);
    }

    fn push(&mut self, handle: EventHandle, due: u64, event: TimedEvent) {
        let order = self.next_order;
        self.next_order += 1;
        self.entries.insert(handle, Entry { order, event });
        self.heap.push(Reverse((due, order, handle)));
    }

    /// Removes a pending event. The caller delivers the final cancel
    /// invocation with the returned value.
    pub fn cancel(&mut self, handle: EventHandle) -> Option<TimedEvent> {
        self.entries.remove(&handle).map(|e| e.event)
    }

    /// Pops the next event due at or before `now`, removing it.
    pub fn pop_due(&mut self, now: u64) -> Option<(EventHandle, TimedEvent)> {
        while let Some(&Reverse((due, order, handle))) = self.heap.peek() {
            match self.entries.get(&handle) {
                Some(e) if e.order == order => {
                    if due > now {
                        return None;
                    }
                    self.heap.pop();
                    let e = self.entries.remove(&handle).unwrap();
                    return Some((handle, e.event));
                }
                _ => {
                    // stale heap residue
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Deadline of the next live event, if any.
    pub fn next_due(&mut self) -> Option<u64> {
        while let Some(&Reverse((due, order, handle))) = self.heap.peek() {
            match self.entries.get(&handle) {
                Some(e) if e.order == order => return Some(due),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Drains every pending event for shutdown-time cancel delivery.
    pub fn take_all(&mut self) -> Vec<(EventHandle, TimedEvent)> {
        self.heap.clear();
        self.entries
            .drain()
            .map(|(h, e)| (h, e.event))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_on_equal_deadlines() {
        let mut s = Scheduler::new();
        s.schedule(100, TimedEvent::Reap);
        s.schedule(100, TimedEvent::AgeForwarding);
        s.schedule(50, TimedEvent::CleanStore { resume: 0 });
        assert!(matches!(
            s.pop_due(100),
            Some((_, TimedEvent::CleanStore { .. }))
        ));
        assert!(matches!(s.pop_due(100), Some((_, TimedEvent::Reap))));
        assert!(matches!(s.pop_due(100), Some((_, TimedEvent::AgeForwarding))));
        assert!(s.pop_due(100).is_none());
    }

    #[test]
    fn cancel_removes() {
        let mut s = Scheduler::new();
        let h = s.schedule(10, TimedEvent::Reap);
        assert_eq!(s.cancel(h), Some(TimedEvent::Reap));
        assert!(s.pop_due(1000).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn reschedule_keeps_handle() {
        let mut s = Scheduler::new();
        let h = s.schedule(10, TimedEvent::Reap);
        let (h2, ev) = s.pop_due(10).unwrap();
        assert_eq!(h, h2);
        s.reschedule(h, 20, ev);
        assert!(s.pop_due(15).is_none());
        let (h3, _) = s.pop_due(20).unwrap();
        assert_eq!(h3, h);
    }

    #[test]
    fn not_due_stays() {
        let mut s = Scheduler::new();
        s.schedule(100, TimedEvent::Reap);
        assert!(s.pop_due(99).is_none());
        assert_eq!(s.next_due(), Some(100));
    }

    #[test]
    fn manual_clock() {
        let mut c = Clock::manual();
        assert_eq!(c.now(), 0);
        c.advance(250);
        assert_eq!(c.now(), 250);
    }
}

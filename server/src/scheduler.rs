//! Wall-clock scheduler for one-shot delayed events.
//!
//! There is no cancellation. Events carry a stamp of the state they act on
//! and re-check it when they fire, so an event whose stamp no longer matches
//! is a no-op. Time is always passed in explicitly, which keeps the scheduler
//! deterministic and lets the owner drive it from a single tick context.

use log::warn;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::time::{Duration, Instant};

/// Identifies a scheduled event: when it is due and its position in schedule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle {
    pub due: Instant,
    pub sequence: u64,
}

struct Entry<E> {
    due: Instant,
    sequence: u64,
    event: E,
}

impl<E> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl<E> Eq for Entry<E> {}

impl<E> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then(self.sequence.cmp(&other.sequence))
    }
}

pub struct Scheduler<E> {
    queue: BinaryHeap<Reverse<Entry<E>>>,
    next_sequence: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, event: E) -> EventHandle {
        self.schedule_at(now + delay, event)
    }

    pub fn schedule_at(&mut self, due: Instant, event: E) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.queue.push(Reverse(Entry {
            due,
            sequence,
            event,
        }));

        EventHandle { due, sequence }
    }

    /// Removes and returns the earliest event due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<E> {
        if self.queue.peek()?.0.due > now {
            return None;
        }
        self.queue.pop().map(|Reverse(entry)| entry.event)
    }

    /// Invokes every event due at or before `now` in due order.
    ///
    /// A failing action is logged and does not stop the remaining events.
    /// Returns the number of events invoked.
    pub fn pump<F, Err>(&mut self, now: Instant, mut action: F) -> usize
    where
        F: FnMut(E) -> Result<(), Err>,
        Err: Display,
    {
        let mut fired = 0;
        while let Some(event) = self.pop_due(now) {
            fired += 1;
            if let Err(e) = action(event) {
                warn!("Delayed event failed: {}", e);
            }
        }
        fired
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(entry)| entry.due)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_events_fire_in_due_order() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.schedule(t0, ms(30), "third");
        scheduler.schedule(t0, ms(10), "first");
        scheduler.schedule(t0, ms(20), "second");

        let mut fired = Vec::new();
        let count = scheduler.pump(t0 + ms(30), |event| {
            fired.push(event);
            Ok::<(), String>(())
        });

        assert_eq!(count, 3);
        assert_eq!(fired, vec!["first", "second", "third"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_equal_due_times_are_fifo() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();

        for i in 0..10 {
            scheduler.schedule_at(t0 + ms(5), i);
        }

        let mut fired = Vec::new();
        while let Some(event) = scheduler.pop_due(t0 + ms(5)) {
            fired.push(event);
        }

        assert_eq!(fired, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_events_not_due_are_kept() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.schedule(t0, ms(10), 1);
        let late = scheduler.schedule(t0, ms(50), 2);

        assert_eq!(scheduler.pop_due(t0 + ms(9)), None);
        assert_eq!(scheduler.pop_due(t0 + ms(10)), Some(1));
        assert_eq!(scheduler.pop_due(t0 + ms(49)), None);
        assert_eq!(scheduler.next_due(), Some(late.due));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.pop_due(t0 + ms(100)), Some(2));
    }

    #[test]
    fn test_failing_event_does_not_stop_pump() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.schedule(t0, ms(1), 1);
        scheduler.schedule(t0, ms(2), 2);
        scheduler.schedule(t0, ms(3), 3);

        let mut fired = Vec::new();
        let count = scheduler.pump(t0 + ms(3), |event| {
            fired.push(event);
            if event == 2 {
                Err("event two failed")
            } else {
                Ok(())
            }
        });

        assert_eq!(count, 3);
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_handles_are_ordered_by_schedule() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new();

        let a = scheduler.schedule(t0, ms(5), ());
        let b = scheduler.schedule(t0, ms(5), ());

        assert_eq!(a.due, b.due);
        assert!(a.sequence < b.sequence);
    }
}

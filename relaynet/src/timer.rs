//! Deadline timers.
//!
//! A [`TimerQueue`] is an ordered schedule of one-shot callbacks keyed by
//! their expiry time. The engine consults it once per dispatch cycle,
//! after I/O has been serviced; every entry whose deadline has passed
//! fires, oldest first, and is removed.
//!
//! Callbacks that target a socket capture a weak reference to it, so a
//! timer outliving its socket silently does nothing.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::trace;

/// Longest delay accepted by [`TimerQueue::schedule_after`], about a
/// century.
pub const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Identifies a scheduled timer.
///
/// Ordering follows the expiry time, with insertion order breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    /// The instant at which the timer fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

type Callback = Box<dyn FnOnce(Instant)>;

#[derive(Default)]
struct Schedule {
    entries: BTreeMap<TimerId, Callback>,
    next_seq: u64,
}

/// A shared, single-threaded timer schedule.
///
/// Cloning a `TimerQueue` yields another handle to the same schedule.
#[derive(Clone, Default)]
pub struct TimerQueue {
    schedule: Rc<RefCell<Schedule>>,
}

impl TimerQueue {
    /// Creates an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to fire once `deadline` has passed.
    pub fn schedule<F>(&self, deadline: Instant, callback: F) -> TimerId
    where
        F: FnOnce(Instant) + 'static,
    {
        let mut schedule = self.schedule.borrow_mut();

        let id = TimerId {
            deadline,
            seq: schedule.next_seq,
        };
        schedule.next_seq += 1;
        schedule.entries.insert(id, Box::new(callback));

        id
    }

    /// Schedules `callback` to fire after `delay`.
    ///
    /// A delay too large to represent is capped at [`MAX_DELAY`].
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(Instant) + 'static,
    {
        let now = Instant::now();
        let deadline = now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now);

        self.schedule(deadline, callback)
    }

    /// Removes a timer without firing it.
    ///
    /// Returns `false` if the timer already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        // The callback is dropped outside of the borrow: it may own
        // values whose destructors touch this queue.
        let removed = self.schedule.borrow_mut().entries.remove(&id);
        removed.is_some()
    }

    /// Returns `true` while the timer is scheduled.
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.schedule.borrow().entries.contains_key(&id)
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.schedule.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest scheduled deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.schedule
            .borrow()
            .entries
            .first_key_value()
            .map(|(id, _)| id.deadline)
    }

    /// Time left until the earliest deadline, zero if already due.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Fires every timer due at `now`, oldest first.
    ///
    /// The set of due timers is fixed before the first callback runs:
    /// a callback may cancel a later timer of the same batch, and timers
    /// scheduled from a callback wait for the next tick.
    ///
    /// Returns the number of callbacks invoked.
    pub fn tick(&self, now: Instant) -> usize {
        let due: Vec<TimerId> = self
            .schedule
            .borrow()
            .entries
            .keys()
            .take_while(|id| id.deadline <= now)
            .copied()
            .collect();

        let mut fired = 0;

        for id in due {
            let callback = self.schedule.borrow_mut().entries.remove(&id);

            if let Some(callback) = callback {
                trace!(seq = id.seq, "timer expired");
                callback(now);
                fired += 1;
            }
        }

        fired
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

use thiserror::Error;

use crate::clock::Clock;

/// Default per-advance fire cap; see [`TimerScheduler::with_fire_cap`].
pub const DEFAULT_FIRE_CAP: u32 = 100_000;

/// Identifies an armed timer. Stale ids (fired or cancelled) are harmless:
/// cancelling them again is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// A single `advance_to` call fired more callbacks than the configured
    /// cap. The practical cause is a callback that unconditionally re-arms
    /// itself with a deadline that never escapes the advance window; the
    /// session must treat this as fatal.
    #[error("fired {fired} timers in one advance (cap {cap}): runaway re-arm loop")]
    Runaway { fired: u32, cap: u32 },
}

type Callback = Box<dyn FnOnce() + 'static>;

/// Heap entry; callbacks live in the side table so cancellation is a cheap
/// map removal and stale heap entries are skipped at pop time.
#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline_ns: u64,
    seq: u64,
    id: TimerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; invert so the earliest deadline pops
        // first, with the lower sequence number (earlier registration)
        // winning ties.
        other
            .deadline_ns
            .cmp(&self.deadline_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One-shot timer scheduler over a virtual [`Clock`].
///
/// Timers fire in non-decreasing deadline order; equal deadlines fire in
/// registration order. The clock is stepped to each timer's deadline before
/// its callback runs, so callbacks always observe `now == deadline`.
///
/// For callbacks that need to schedule or cancel timers themselves, wrap the
/// scheduler in a [`SharedScheduler`], which releases its borrow while each
/// callback runs.
pub struct TimerScheduler {
    clock: Clock,
    heap: BinaryHeap<Entry>,
    armed: HashMap<TimerId, Callback>,
    next_id: u64,
    next_seq: u64,
    fire_cap: u32,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::with_fire_cap(DEFAULT_FIRE_CAP)
    }

    /// `fire_cap` bounds the number of callbacks a single `advance_to` may
    /// fire before the advance is declared runaway ([`TimerError::Runaway`]).
    pub fn with_fire_cap(fire_cap: u32) -> Self {
        Self {
            clock: Clock::new(),
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_id: 0,
            next_seq: 0,
            fire_cap,
        }
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn fire_cap(&self) -> u32 {
        self.fire_cap
    }

    /// Number of currently armed timers.
    pub fn armed_len(&self) -> usize {
        self.armed.len()
    }

    /// Registers `callback` to fire no earlier than `now + delay_ns`.
    pub fn schedule(&mut self, delay_ns: u64, callback: impl FnOnce() + 'static) -> TimerId {
        let deadline_ns = self.clock.now_ns().saturating_add(delay_ns);
        self.schedule_at(deadline_ns, callback)
    }

    /// Registers `callback` to fire at the absolute deadline `deadline_ns`.
    /// A deadline in the past is clamped to `now` and fires on the next
    /// advance that reaches it.
    pub fn schedule_at(&mut self, deadline_ns: u64, callback: impl FnOnce() + 'static) -> TimerId {
        let deadline_ns = deadline_ns.max(self.clock.now_ns());
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline_ns,
            seq,
            id,
        });
        self.armed.insert(id, Box::new(callback));
        id
    }

    /// Marks a timer inert. Returns `true` if the timer was still armed;
    /// cancelling an already-fired or already-cancelled timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Cancels every armed timer. Used on session shutdown so nothing fires
    /// afterwards.
    pub fn cancel_all(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }

    /// Earliest armed deadline, skipping entries whose timer was cancelled.
    pub fn next_deadline_ns(&mut self) -> Option<u64> {
        while let Some(top) = self.heap.peek() {
            if self.armed.contains_key(&top.id) {
                return Some(top.deadline_ns);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the next timer due at or before `to_ns`, stepping the clock to
    /// its deadline. Returns `None` once nothing further is due, leaving the
    /// clock untouched (the caller finishes the advance with
    /// [`finish_advance_to`](Self::finish_advance_to)).
    fn take_due(&mut self, to_ns: u64) -> Option<Callback> {
        while let Some(top) = self.heap.peek() {
            if !self.armed.contains_key(&top.id) {
                self.heap.pop();
                continue;
            }
            if top.deadline_ns > to_ns {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry");
            let callback = self
                .armed
                .remove(&entry.id)
                .expect("armed entry for peeked id");
            self.clock.step_to(entry.deadline_ns);
            return Some(callback);
        }
        None
    }

    #[inline]
    fn finish_advance_to(&mut self, to_ns: u64) {
        self.clock.step_to(to_ns);
    }
}

/// Cheaply cloneable shared handle to a [`TimerScheduler`].
///
/// This is the form the rest of the harness uses: peripherals keep a clone
/// and schedule against it, and callbacks may re-enter (`schedule`,
/// `cancel`) freely because [`advance_to`](Self::advance_to) drops its
/// borrow before invoking each callback.
#[derive(Clone, Default)]
pub struct SharedScheduler {
    inner: Rc<RefCell<TimerScheduler>>,
}

impl SharedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fire_cap(fire_cap: u32) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimerScheduler::with_fire_cap(fire_cap))),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.inner.borrow().now_ns()
    }

    pub fn armed_len(&self) -> usize {
        self.inner.borrow().armed_len()
    }

    pub fn schedule(&self, delay_ns: u64, callback: impl FnOnce() + 'static) -> TimerId {
        self.inner.borrow_mut().schedule(delay_ns, callback)
    }

    pub fn schedule_at(&self, deadline_ns: u64, callback: impl FnOnce() + 'static) -> TimerId {
        self.inner.borrow_mut().schedule_at(deadline_ns, callback)
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.borrow_mut().cancel(id)
    }

    pub fn cancel_all(&self) {
        self.inner.borrow_mut().cancel_all()
    }

    pub fn next_deadline_ns(&self) -> Option<u64> {
        self.inner.borrow_mut().next_deadline_ns()
    }

    /// Advances virtual time by `delta_ns`, firing due timers in order.
    /// Returns the number of callbacks fired.
    pub fn advance(&self, delta_ns: u64) -> Result<u32, TimerError> {
        let to_ns = self.now_ns().saturating_add(delta_ns);
        self.advance_to(to_ns)
    }

    /// Advances virtual time to `to_ns`, firing every armed timer with
    /// deadline ≤ `to_ns` in deadline/FIFO order. Timers scheduled by a
    /// firing callback are eligible within the same call if they fall inside
    /// the window.
    pub fn advance_to(&self, to_ns: u64) -> Result<u32, TimerError> {
        let mut fired: u32 = 0;
        loop {
            // Borrow only long enough to pop one due timer; the callback runs
            // unborrowed so it can schedule or cancel re-entrantly.
            let callback = {
                let mut scheduler = self.inner.borrow_mut();
                if fired >= scheduler.fire_cap {
                    return Err(TimerError::Runaway {
                        fired,
                        cap: scheduler.fire_cap,
                    });
                }
                scheduler.take_due(to_ns)
            };
            match callback {
                Some(callback) => {
                    callback();
                    fired += 1;
                }
                None => break,
            }
        }
        self.inner.borrow_mut().finish_advance_to(to_ns);
        Ok(fired)
    }
}

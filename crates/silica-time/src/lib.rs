//! Virtual time and timer scheduling primitives for the Silica harness.
//!
//! The harness uses **virtual time** (monotonic nanoseconds since session
//! start) as the single source of truth for every timed peripheral event.
//! In interactive sessions virtual time is derived from a monotonic host
//! clock ([`StdHostClock`]); unit tests drive the system deterministically
//! via [`FakeHostClock`] or by calling [`SharedScheduler::advance_to`]
//! directly, with no wall-clock waits.
//!
//! The scheduler stores one-shot callbacks and fires them in strict deadline
//! order with FIFO tie-break, so a given schedule of events always replays
//! identically.

#![forbid(unsafe_code)]

mod clock;
mod host;
mod scheduler;

pub use clock::Clock;
pub use host::{FakeHostClock, HostClock, StdHostClock};
pub use scheduler::{SharedScheduler, TimerError, TimerId, TimerScheduler, DEFAULT_FIRE_CAP};

/// Nanoseconds per microsecond; the harness quantum is single-digit µs.
pub const NANOS_PER_MICRO: u64 = 1_000;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

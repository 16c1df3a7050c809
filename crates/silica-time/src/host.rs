use std::cell::Cell;
use std::time::Instant;

/// Host time source used to drive virtual time in interactive sessions.
///
/// Exactly one time authority drives a session (see `silica-machine`); this
/// trait is the host-tick flavor. Tests substitute [`FakeHostClock`] so
/// scenarios replay without real-time waits.
pub trait HostClock {
    /// Monotonic host time in nanoseconds since an arbitrary fixed origin
    /// (typically construction).
    fn now_ns(&self) -> u64;
}

/// [`HostClock`] backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        // Saturate rather than wrap: a u64 of nanoseconds covers ~584 years
        // of session uptime.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Deterministic [`HostClock`] for tests; time moves only when told to.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: Cell<u64>,
}

impl FakeHostClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ns: u64) {
        self.now_ns.set(self.now_ns.get().saturating_add(ns));
    }

    pub fn set_now_ns(&self, now_ns: u64) {
        self.now_ns.set(now_ns);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }
}

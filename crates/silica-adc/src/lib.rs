//! Asynchronous analog-sampling controller.
//!
//! Models a sample-and-hold analog front end shared by several channels. The
//! execution engine signals "begin sampling channel C"; the controller never
//! answers synchronously — real conversions take time — but arms a one-shot
//! timer for the conversion delay and, when it fires, reads the channel's
//! value from the shared table **at that moment** and delivers it back into
//! the engine through [`SampleSink::complete_sample`]. A table update that
//! lands mid-conversion is therefore observable, matching hardware
//! sample-timing races.
//!
//! At most one conversion is in flight per controller. A second request
//! while one is pending is a protocol violation resolved by the configured
//! [`OverlapPolicy`]; both policies preserve exactly one completion per
//! request.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;

use silica_time::{SharedScheduler, TimerId};

/// Modeled channel count: four external inputs plus the internal temperature
/// sensor.
pub const NUM_CHANNELS: usize = 5;

/// Full-scale 12-bit sample value.
pub const SAMPLE_MAX: u16 = 0x0FFF;

/// Default conversion latency: 96 ADC clock cycles at 48 MHz.
pub const DEFAULT_CONVERSION_DELAY_NS: u64 = 2_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdcError {
    #[error("channel index {0} out of range (0..{NUM_CHANNELS})")]
    UnknownChannel(u8),
}

/// Engine-side completion inlet; the integration layer implements this for
/// the execution engine.
pub trait SampleSink {
    fn complete_sample(&mut self, value: u16, error: bool);
}

/// Shared per-channel value table.
///
/// Owned by the stimulus layer and mutated by it; the controller only reads,
/// and only at timer-fire time, copying the whole table out in one borrow so
/// a mid-update value can never be observed half-written.
#[derive(Clone, Debug, Default)]
pub struct ChannelValues {
    inner: Rc<RefCell<[u16; NUM_CHANNELS]>>,
}

impl ChannelValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: u8) -> Result<u16, AdcError> {
        self.check(channel)?;
        Ok(self.inner.borrow()[channel as usize])
    }

    pub fn set(&self, channel: u8, value: u16) -> Result<(), AdcError> {
        self.check(channel)?;
        self.inner.borrow_mut()[channel as usize] = value;
        Ok(())
    }

    /// Copies the table out in a single borrow.
    pub fn snapshot(&self) -> [u16; NUM_CHANNELS] {
        *self.inner.borrow()
    }

    fn check(&self, channel: u8) -> Result<(), AdcError> {
        if (channel as usize) < NUM_CHANNELS {
            Ok(())
        } else {
            Err(AdcError::UnknownChannel(channel))
        }
    }
}

/// Policy for a sample request arriving while a conversion is pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// The in-flight conversion is unaffected; the violating request is
    /// answered after the normal conversion delay with `error = true` and
    /// value 0.
    #[default]
    Reject,
    /// The violating request is queued and started when the in-flight
    /// conversion completes, with its own full conversion delay.
    Queue,
}

#[derive(Clone, Copy, Debug)]
pub struct AdcConfig {
    pub conversion_delay_ns: u64,
    pub overlap: OverlapPolicy,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            conversion_delay_ns: DEFAULT_CONVERSION_DELAY_NS,
            overlap: OverlapPolicy::default(),
        }
    }
}

struct Pending {
    channel: u8,
    timer: TimerId,
}

struct AdcState {
    config: AdcConfig,
    scheduler: SharedScheduler,
    values: ChannelValues,
    sink: Rc<RefCell<dyn SampleSink>>,
    pending: Option<Pending>,
    queued: VecDeque<u8>,
}

/// Cheaply cloneable handle to the sampling controller.
#[derive(Clone)]
pub struct Adc {
    inner: Rc<RefCell<AdcState>>,
}

impl Adc {
    pub fn new(
        scheduler: SharedScheduler,
        values: ChannelValues,
        sink: Rc<RefCell<dyn SampleSink>>,
        config: AdcConfig,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(AdcState {
                config,
                scheduler,
                values,
                sink,
                pending: None,
                queued: VecDeque::new(),
            })),
        }
    }

    /// Whether a conversion is currently in flight.
    pub fn is_pending(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    /// Begins sampling `channel`.
    ///
    /// Never completes synchronously; the completion arrives through the
    /// [`SampleSink`] once the conversion timer fires. A request while a
    /// conversion is pending is resolved per [`OverlapPolicy`].
    pub fn sample_requested(&self, channel: u8) -> Result<(), AdcError> {
        if channel as usize >= NUM_CHANNELS {
            return Err(AdcError::UnknownChannel(channel));
        }

        let mut state = self.inner.borrow_mut();
        if state.pending.is_some() {
            match state.config.overlap {
                OverlapPolicy::Reject => {
                    tracing::warn!(
                        channel,
                        "sample requested while a conversion is pending; rejecting"
                    );
                    let sink = state.sink.clone();
                    state
                        .scheduler
                        .schedule(state.config.conversion_delay_ns, move || {
                            sink.borrow_mut().complete_sample(0, true)
                        });
                }
                OverlapPolicy::Queue => {
                    tracing::warn!(
                        channel,
                        "sample requested while a conversion is pending; queueing"
                    );
                    state.queued.push_back(channel);
                }
            }
            return Ok(());
        }

        Self::arm(&self.inner, &mut state, channel);
        Ok(())
    }

    /// Cancels any in-flight conversion and clears the queue, restoring
    /// power-on state.
    pub fn reset(&self) {
        let mut state = self.inner.borrow_mut();
        if let Some(pending) = state.pending.take() {
            state.scheduler.cancel(pending.timer);
        }
        state.queued.clear();
    }

    fn arm(inner: &Rc<RefCell<AdcState>>, state: &mut AdcState, channel: u8) {
        let fire_handle = Rc::clone(inner);
        let timer = state
            .scheduler
            .schedule(state.config.conversion_delay_ns, move || {
                Self::fire(&fire_handle)
            });
        state.pending = Some(Pending { channel, timer });
    }

    fn fire(inner: &Rc<RefCell<AdcState>>) {
        // Snapshot the value and re-arm any queued request under the borrow,
        // then deliver the completion with the borrow released so the sink
        // may issue the next request re-entrantly.
        let (sink, value) = {
            let mut state = inner.borrow_mut();
            let Some(pending) = state.pending.take() else {
                return;
            };
            let value = state.values.snapshot()[pending.channel as usize];
            if let Some(next) = state.queued.pop_front() {
                Self::arm(inner, &mut state, next);
            }
            (state.sink.clone(), value)
        };
        sink.borrow_mut().complete_sample(value, false);
    }
}

//! Scripted stimulus driver: a declarative list of time-stamped
//! state-injection events used to exercise the harness reproducibly.
//!
//! The script is not on the critical timing path; installation just arms one
//! one-shot timer per event over the shared scheduler, so scripted runs
//! inherit the scheduler's deadline/FIFO ordering guarantees.

#![forbid(unsafe_code)]

use thiserror::Error;

use silica_adc::{AdcError, ChannelValues, NUM_CHANNELS};
use silica_gpio::{GpioError, SharedPinBank, NUM_PINS};
use silica_time::{SharedScheduler, TimerId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StimulusError {
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Adc(#[from] AdcError),
}

/// One scripted state injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StimulusAction {
    SetPin { pin: u8, value: bool },
    SetChannel { channel: u8, value: u16 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StimulusEvent {
    pub at_ns: u64,
    pub action: StimulusAction,
}

/// Ordered collection of `(deadline, action)` pairs.
#[derive(Clone, Debug, Default)]
pub struct StimulusScript {
    events: Vec<StimulusEvent>,
}

impl StimulusScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pin(mut self, at_ns: u64, pin: u8, value: bool) -> Self {
        self.events.push(StimulusEvent {
            at_ns,
            action: StimulusAction::SetPin { pin, value },
        });
        self
    }

    pub fn set_channel(mut self, at_ns: u64, channel: u8, value: u16) -> Self {
        self.events.push(StimulusEvent {
            at_ns,
            action: StimulusAction::SetChannel { channel, value },
        });
        self
    }

    pub fn events(&self) -> &[StimulusEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Validates every event, then arms each as a one-shot timer. Nothing is
    /// scheduled if any index is out of range.
    pub fn install(
        &self,
        scheduler: &SharedScheduler,
        pins: &SharedPinBank,
        values: &ChannelValues,
    ) -> Result<Vec<TimerId>, StimulusError> {
        for event in &self.events {
            match event.action {
                StimulusAction::SetPin { pin, .. } => {
                    if pin as usize >= NUM_PINS {
                        return Err(GpioError::UnknownPin(pin).into());
                    }
                }
                StimulusAction::SetChannel { channel, .. } => {
                    if channel as usize >= NUM_CHANNELS {
                        return Err(AdcError::UnknownChannel(channel).into());
                    }
                }
            }
        }

        let mut timers = Vec::with_capacity(self.events.len());
        for event in &self.events {
            let action = event.action;
            let pins = pins.clone();
            let values = values.clone();
            timers.push(scheduler.schedule_at(event.at_ns, move || match action {
                StimulusAction::SetPin { pin, value } => {
                    pins.borrow_mut()
                        .set_input_value(pin, value)
                        .expect("pin index validated at install");
                }
                StimulusAction::SetChannel { channel, value } => {
                    values
                        .set(channel, value)
                        .expect("channel index validated at install");
                }
            }));
        }
        Ok(timers)
    }
}

#[cfg(test)]
mod tests {
    use silica_gpio::PinBank;

    use super::*;

    #[test]
    fn installs_one_timer_per_event_and_fires_in_order() {
        let scheduler = SharedScheduler::new();
        let pins = PinBank::new_shared();
        let values = ChannelValues::new();

        let script = StimulusScript::new()
            .set_channel(0, 3, 3456)
            .set_pin(10_000, 3, true)
            .set_channel(12_000, 3, 1111)
            .set_pin(12_300, 3, false);

        let timers = script.install(&scheduler, &pins, &values).unwrap();
        assert_eq!(timers.len(), 4);

        scheduler.advance_to(0).unwrap();
        assert_eq!(values.get(3).unwrap(), 3456);
        assert!(!pins.borrow().input_value(3).unwrap());

        scheduler.advance_to(11_000).unwrap();
        assert!(pins.borrow().input_value(3).unwrap());
        assert_eq!(values.get(3).unwrap(), 3456);

        scheduler.advance_to(13_000).unwrap();
        assert!(!pins.borrow().input_value(3).unwrap());
        assert_eq!(values.get(3).unwrap(), 1111);
    }

    #[test]
    fn invalid_index_schedules_nothing() {
        let scheduler = SharedScheduler::new();
        let pins = PinBank::new_shared();
        let values = ChannelValues::new();

        let script = StimulusScript::new()
            .set_pin(100, 2, true)
            .set_channel(200, NUM_CHANNELS as u8, 1);

        assert_eq!(
            script.install(&scheduler, &pins, &values),
            Err(AdcError::UnknownChannel(NUM_CHANNELS as u8).into())
        );
        assert_eq!(scheduler.armed_len(), 0);
    }

    #[test]
    fn installed_timers_can_be_cancelled() {
        let scheduler = SharedScheduler::new();
        let pins = PinBank::new_shared();
        let values = ChannelValues::new();

        let script = StimulusScript::new().set_pin(500, 1, true);
        let timers = script.install(&scheduler, &pins, &values).unwrap();
        for id in timers {
            scheduler.cancel(id);
        }
        scheduler.advance_to(1_000).unwrap();
        assert!(!pins.borrow().input_value(1).unwrap());
    }
}

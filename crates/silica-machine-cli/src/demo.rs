//! Demo engine and built-in stimulus scenario.
//!
//! The demo engine is a stand-in for the external instruction-execution
//! engine: a firmware-like loop that samples the battery-voltage channel
//! every 250 ms of consumed cycles, watches the button pin, and reports what
//! it sees as serial output. It exists so the harness is drivable end to end
//! without the real emulation core.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use silica_gpio::SharedPinBank;
use silica_machine::{EngineExit, ExecutionEngine, DEFAULT_CYCLES_HZ};
use silica_stimulus::StimulusScript;
use silica_time::{NANOS_PER_MILLI, NANOS_PER_SEC};

/// Button input (active low, pull-up).
pub const BUTTON_PIN: u8 = 3;

/// Channel carrying the scripted battery voltage.
pub const VOLTAGE_CHANNEL: u8 = 3;

/// Cycles between sample requests: 250 ms at the default core frequency.
const SAMPLE_PERIOD_CYCLES: u64 = DEFAULT_CYCLES_HZ / 4;

/// The built-in scenario: scripted voltage steps plus button presses,
/// releases, and one contact bounce.
pub fn demo_script() -> StimulusScript {
    const S: u64 = NANOS_PER_SEC;
    const MS: u64 = NANOS_PER_MILLI;
    StimulusScript::new()
        .set_channel(10 * S, VOLTAGE_CHANNEL, 1111)
        .set_pin(12 * S, BUTTON_PIN, false)
        .set_channel(12 * S + 100 * MS, VOLTAGE_CHANNEL, 900)
        .set_pin(12 * S + 300 * MS, BUTTON_PIN, true)
        .set_channel(15 * S, VOLTAGE_CHANNEL, 999)
        .set_pin(18 * S, BUTTON_PIN, false)
        .set_pin(22 * S, BUTTON_PIN, true)
        .set_channel(30 * S, VOLTAGE_CHANNEL, 4000)
        .set_pin(32 * S, BUTTON_PIN, false)
        .set_pin(32 * S + 2 * MS, BUTTON_PIN, true)
        .set_pin(32 * S + 4 * MS, BUTTON_PIN, false)
        .set_pin(32 * S + 300 * MS, BUTTON_PIN, true)
        .set_pin(34 * S, BUTTON_PIN, false)
        .set_pin(36 * S, BUTTON_PIN, true)
}

pub struct DemoEngine {
    pins: SharedPinBank,
    cycles_since_sample: u64,
    sample_in_flight: bool,
    reported_initial_button: bool,
    requests: Vec<u8>,
    out: Vec<u8>,
    timelog: Option<TimeLog>,
}

struct TimeLog {
    writer: BufWriter<File>,
    last: Instant,
}

impl DemoEngine {
    pub fn new(pins: SharedPinBank, timelog: Option<BufWriter<File>>) -> Self {
        Self {
            pins,
            // Request the first sample on the first slice.
            cycles_since_sample: SAMPLE_PERIOD_CYCLES,
            sample_in_flight: false,
            reported_initial_button: false,
            requests: Vec::new(),
            out: Vec::new(),
            timelog: timelog.map(|writer| TimeLog {
                writer,
                last: Instant::now(),
            }),
        }
    }

    fn log_completion_interval(&mut self) {
        if let Some(log) = &mut self.timelog {
            let now = Instant::now();
            let took = now.duration_since(log.last).as_nanos();
            log.last = now;
            let _ = writeln!(log.writer, "{took}");
        }
    }
}

impl ExecutionEngine for DemoEngine {
    fn run_slice(&mut self, budget_cycles: u64) -> EngineExit {
        if !self.reported_initial_button {
            self.reported_initial_button = true;
            // Polling the shared bank is only safe outside listener
            // dispatch; a slice is the one place the engine observably
            // reads pins.
            let level = self
                .pins
                .borrow()
                .input_value(BUTTON_PIN)
                .unwrap_or_default();
            let _ = writeln!(self.out, "button: idle {}\r", if level { "high" } else { "low" });
        }
        self.cycles_since_sample += budget_cycles;
        if self.cycles_since_sample >= SAMPLE_PERIOD_CYCLES && !self.sample_in_flight {
            self.cycles_since_sample = 0;
            self.sample_in_flight = true;
            self.requests.push(VOLTAGE_CHANNEL);
        }
        EngineExit::Completed {
            executed: budget_cycles,
        }
    }

    fn take_sample_requests(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.requests)
    }

    fn complete_sample(&mut self, value: u16, error: bool) {
        self.sample_in_flight = false;
        self.log_completion_interval();
        if error {
            self.out.extend_from_slice(b"adc: conversion fault\r\n");
        } else {
            let _ = writeln!(self.out, "voltage: {value}\r");
        }
    }

    fn send_serial_byte(&mut self, byte: u8) {
        // Console echo, like a REPL.
        self.out.push(byte);
    }

    fn take_serial_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    fn pin_edge(&mut self, pin: u8, new: bool, _old: bool) {
        if pin != BUTTON_PIN {
            return;
        }
        // Active low: a falling edge is a press.
        if new {
            self.out.extend_from_slice(b"button: released\r\n");
        } else {
            self.out.extend_from_slice(b"button: pressed\r\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use silica_gpio::PinBank;

    use super::*;

    #[test]
    fn demo_script_matches_the_canonical_scenario() {
        let script = demo_script();
        assert_eq!(script.len(), 14);
        // Events are scripted in chronological order.
        let times: Vec<u64> = script.events().iter().map(|e| e.at_ns).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[test]
    fn engine_requests_one_sample_per_period() {
        let mut engine = DemoEngine::new(PinBank::new_shared(), None);

        engine.run_slice(1_000);
        assert_eq!(engine.take_sample_requests(), vec![VOLTAGE_CHANNEL]);

        // No further request until the outstanding one completes, however
        // many cycles elapse.
        engine.run_slice(SAMPLE_PERIOD_CYCLES * 2);
        assert!(engine.take_sample_requests().is_empty());

        engine.complete_sample(1234, false);
        engine.run_slice(SAMPLE_PERIOD_CYCLES);
        assert_eq!(engine.take_sample_requests(), vec![VOLTAGE_CHANNEL]);
        assert!(String::from_utf8(engine.take_serial_output())
            .unwrap()
            .contains("voltage: 1234"));
    }
}

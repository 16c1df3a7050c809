use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use silica_adc::{Adc, AdcConfig, AdcError, ChannelValues, SampleSink};
use silica_gpio::{GpioError, PinBank, SharedPinBank, NUM_PINS};
use silica_serial::{SendOutcome, SerialPipe};
use silica_stimulus::{StimulusError, StimulusScript};
use silica_time::{SharedScheduler, TimerError, TimerId};

use crate::cycles::{CycleScaler, DEFAULT_CYCLES_HZ};
use crate::engine::{EngineExit, ExecutionEngine};

/// The session's single virtual-time authority.
///
/// Running two independent clocks (host ticks *and* engine-cycle accounting)
/// is a correctness hazard; this enum makes the choice exclusive per
/// session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeAuthority {
    /// Virtual time advances by the engine's reported executed cycles,
    /// scaled deterministically to nanoseconds. The default: scripted runs
    /// replay identically.
    EngineCycles { cycles_hz: u64 },
    /// Virtual time advances when the host calls [`Machine::tick_to`] with a
    /// host-clock reading (interactive sessions).
    HostTick,
}

impl Default for TimeAuthority {
    fn default() -> Self {
        TimeAuthority::EngineCycles {
            cycles_hz: DEFAULT_CYCLES_HZ,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    pub adc: AdcConfig,
    pub time_authority: TimeAuthority,
    pub control_byte: u8,
}

impl MachineConfig {
    pub fn new() -> Self {
        Self {
            adc: AdcConfig::default(),
            time_authority: TimeAuthority::default(),
            control_byte: silica_serial::DEFAULT_CONTROL_BYTE,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("no execution engine attached")]
    NoEngine,
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Adc(#[from] AdcError),
    #[error(transparent)]
    Gpio(#[from] GpioError),
    #[error(transparent)]
    Stimulus(#[from] StimulusError),
    #[error("virtual time is engine-driven for this session; host ticks are not the authority")]
    NotHostDriven,
}

/// Why [`Machine::run_slice`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The slice ran to its cycle budget.
    Completed { executed: u64 },
    /// The engine halted.
    Halted { executed: u64 },
    /// The session has terminated (control byte, shutdown call, or an
    /// earlier fatal error); nothing ran and nothing will fire again.
    Terminated { executed: u64 },
}

impl RunExit {
    pub fn executed(&self) -> u64 {
        match *self {
            RunExit::Completed { executed }
            | RunExit::Halted { executed }
            | RunExit::Terminated { executed } => executed,
        }
    }
}

type SharedEngine = Rc<RefCell<Option<Box<dyn ExecutionEngine>>>>;

/// Adapts the shared engine slot to the ADC's completion inlet.
struct EngineSink {
    engine: SharedEngine,
}

impl SampleSink for EngineSink {
    fn complete_sample(&mut self, value: u16, error: bool) {
        match self.engine.borrow_mut().as_mut() {
            Some(engine) => engine.complete_sample(value, error),
            None => tracing::warn!(value, error, "sample completion with no engine attached"),
        }
    }
}

/// Composes the scheduler, sampling controller, pin bank, and serial pipe
/// around an attached execution engine into one harness session.
///
/// The engine runs in bounded slices; after each slice the machine advances
/// virtual time (when engine-driven), then drains the engine's sample
/// requests and serial output. Peripheral events therefore interleave with
/// execution at slice granularity, which is the determinism boundary this
/// harness guarantees.
pub struct Machine {
    scheduler: SharedScheduler,
    pins: SharedPinBank,
    values: ChannelValues,
    pipe: Rc<RefCell<SerialPipe>>,
    adc: Adc,
    engine: SharedEngine,
    scaler: Option<CycleScaler>,
    terminated: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let scheduler = SharedScheduler::new();
        let pins = PinBank::new_shared();
        let values = ChannelValues::new();
        let pipe = Rc::new(RefCell::new(SerialPipe::with_control_byte(
            config.control_byte,
        )));
        let engine: SharedEngine = Rc::new(RefCell::new(None));
        let adc = Adc::new(
            scheduler.clone(),
            values.clone(),
            Rc::new(RefCell::new(EngineSink {
                engine: engine.clone(),
            })),
            config.adc,
        );
        let scaler = match config.time_authority {
            TimeAuthority::EngineCycles { cycles_hz } => Some(CycleScaler::new(cycles_hz)),
            TimeAuthority::HostTick => None,
        };

        Self {
            scheduler,
            pins,
            values,
            pipe,
            adc,
            engine,
            scaler,
            terminated: false,
        }
    }

    /// Attaches the execution engine and wires the peripheral plumbing to
    /// it: host serial bytes flow straight into the engine, and every pin
    /// edge is forwarded to [`ExecutionEngine::pin_edge`].
    pub fn attach_engine(&mut self, engine: impl ExecutionEngine + 'static) {
        *self.engine.borrow_mut() = Some(Box::new(engine));

        let device_side = self.engine.clone();
        self.pipe.borrow_mut().set_device_sink(move |byte| {
            if let Some(engine) = device_side.borrow_mut().as_mut() {
                engine.send_serial_byte(byte);
            }
        });

        let mut pins = self.pins.borrow_mut();
        for pin in 0..NUM_PINS as u8 {
            let edge_side = self.engine.clone();
            pins.add_listener(pin, move |new, old| {
                if let Some(engine) = edge_side.borrow_mut().as_mut() {
                    engine.pin_edge(pin, new, old);
                }
            })
            .expect("pin index within NUM_PINS");
        }
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    pub fn pins(&self) -> &SharedPinBank {
        &self.pins
    }

    pub fn channel_values(&self) -> &ChannelValues {
        &self.values
    }

    pub fn adc(&self) -> &Adc {
        &self.adc
    }

    pub fn now_ns(&self) -> u64 {
        self.scheduler.now_ns()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Installs a stimulus script's events as one-shot timers.
    pub fn install_script(&self, script: &StimulusScript) -> Result<Vec<TimerId>, MachineError> {
        Ok(script.install(&self.scheduler, &self.pins, &self.values)?)
    }

    /// Runs one bounded slice of engine execution, advances virtual time
    /// (when engine-driven), and drains the engine's peripheral events.
    ///
    /// Fatal internal errors (runaway timers, an out-of-range channel from
    /// the engine) shut the session down cleanly — all timers cancelled, the
    /// pipe closed — before the error is returned.
    pub fn run_slice(&mut self, budget_cycles: u64) -> Result<RunExit, MachineError> {
        if self.terminated {
            return Ok(RunExit::Terminated { executed: 0 });
        }

        let exit = {
            let mut engine = self.engine.borrow_mut();
            let engine = engine.as_mut().ok_or(MachineError::NoEngine)?;
            engine.run_slice(budget_cycles)
        };
        let executed = exit.executed();

        if let Some(scaler) = &mut self.scaler {
            let delta_ns = scaler.advance_cycles(executed);
            if let Err(err) = self.scheduler.advance(delta_ns) {
                tracing::error!(%err, "timer advance failed; shutting session down");
                self.shutdown();
                return Err(err.into());
            }
        }

        self.pump()?;

        if self.pipe.borrow().is_terminated() {
            self.shutdown();
            return Ok(RunExit::Terminated { executed });
        }

        Ok(match exit {
            EngineExit::Completed { .. } => RunExit::Completed { executed },
            EngineExit::Halted { .. } => RunExit::Halted { executed },
        })
    }

    /// Advances virtual time to a host-clock reading. Only valid when the
    /// session's time authority is [`TimeAuthority::HostTick`].
    pub fn tick_to(&mut self, host_now_ns: u64) -> Result<u32, MachineError> {
        if self.scaler.is_some() {
            return Err(MachineError::NotHostDriven);
        }
        if self.terminated {
            return Ok(0);
        }
        match self.scheduler.advance_to(host_now_ns) {
            Ok(fired) => Ok(fired),
            Err(err) => {
                tracing::error!(%err, "timer advance failed; shutting session down");
                self.shutdown();
                Err(err.into())
            }
        }
    }

    /// Forwards one host byte into the session. The reserved control byte
    /// terminates the session instead of being forwarded.
    pub fn send_serial_byte(&mut self, byte: u8) -> SendOutcome {
        let outcome = self.pipe.borrow_mut().send(byte);
        if outcome == SendOutcome::Terminated {
            tracing::info!(byte, "control byte received; terminating session");
            self.shutdown();
        }
        outcome
    }

    /// Registers the host-side serial sink (device→host bytes).
    pub fn set_serial_sink(&mut self, sink: impl FnMut(&[u8]) + 'static) {
        self.pipe.borrow_mut().set_host_sink(sink);
    }

    /// Drains device→host bytes accumulated without a registered sink.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.pipe.borrow_mut().take_host_output()
    }

    /// Terminates the session: cancels every outstanding timer, closes the
    /// serial pipe, and clears in-flight ADC state. Nothing fires after
    /// shutdown; calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.scheduler.cancel_all();
        self.adc.reset();
        self.pipe.borrow_mut().close();
        tracing::info!(now_ns = self.scheduler.now_ns(), "session terminated");
    }

    /// Drains engine-side peripheral events: sample requests into the ADC,
    /// serial output into the pipe.
    fn pump(&mut self) -> Result<(), MachineError> {
        let (requests, output) = {
            let mut engine = self.engine.borrow_mut();
            let engine = engine.as_mut().ok_or(MachineError::NoEngine)?;
            (engine.take_sample_requests(), engine.take_serial_output())
        };

        for channel in requests {
            if let Err(err) = self.adc.sample_requested(channel) {
                tracing::error!(%err, "engine issued an invalid sample request; shutting session down");
                self.shutdown();
                return Err(err.into());
            }
        }

        if !output.is_empty() {
            self.pipe.borrow_mut().receive_from_device(&output);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Scripted engine: each slice consumes a fixed cycle count and replays
    /// a queued list of per-slice actions.
    #[derive(Default)]
    struct ScriptedEngine {
        cycles_per_slice: u64,
        sample_requests: Vec<u8>,
        serial_out: Vec<u8>,
        completions: Rc<RefCell<Vec<(u16, bool)>>>,
        received_serial: Rc<RefCell<Vec<u8>>>,
        edges: Rc<RefCell<Vec<(u8, bool, bool)>>>,
    }

    impl ExecutionEngine for ScriptedEngine {
        fn run_slice(&mut self, budget_cycles: u64) -> EngineExit {
            EngineExit::Completed {
                executed: self.cycles_per_slice.min(budget_cycles),
            }
        }

        fn take_sample_requests(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.sample_requests)
        }

        fn complete_sample(&mut self, value: u16, error: bool) {
            self.completions.borrow_mut().push((value, error));
        }

        fn send_serial_byte(&mut self, byte: u8) {
            self.received_serial.borrow_mut().push(byte);
        }

        fn take_serial_output(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.serial_out)
        }

        fn pin_edge(&mut self, pin: u8, new: bool, old: bool) {
            self.edges.borrow_mut().push((pin, new, old));
        }
    }

    fn machine_125mhz() -> Machine {
        Machine::new(MachineConfig::new())
    }

    #[test]
    fn run_slice_without_engine_errors() {
        let mut machine = machine_125mhz();
        assert!(matches!(
            machine.run_slice(1_000),
            Err(MachineError::NoEngine)
        ));
    }

    #[test]
    fn engine_cycles_drive_virtual_time() {
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125, // 1 µs at 125 MHz
            ..ScriptedEngine::default()
        });

        machine.run_slice(1_000).unwrap();
        assert_eq!(machine.now_ns(), 1_000);
        machine.run_slice(1_000).unwrap();
        assert_eq!(machine.now_ns(), 2_000);
    }

    #[test]
    fn sample_request_completes_after_the_conversion_delay() {
        let completions: Rc<RefCell<Vec<(u16, bool)>>> = Rc::default();
        let mut machine = machine_125mhz();
        machine.channel_values().set(3, 3456).unwrap();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            sample_requests: vec![3],
            completions: completions.clone(),
            ..ScriptedEngine::default()
        });

        // Slice 1 drains the request and arms the conversion (t = 1 µs).
        machine.run_slice(1_000).unwrap();
        assert!(completions.borrow().is_empty());

        // Conversion deadline is t = 1 µs + the 2 µs conversion delay; two
        // more 1 µs slices reach it.
        machine.run_slice(1_000).unwrap();
        machine.run_slice(1_000).unwrap();
        assert_eq!(*completions.borrow(), vec![(3456, false)]);
        assert_eq!(machine.now_ns(), 3 * 1_000);
    }

    #[test]
    fn invalid_sample_request_is_fatal_and_shuts_down_cleanly() {
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            sample_requests: vec![99],
            ..ScriptedEngine::default()
        });

        assert!(matches!(
            machine.run_slice(1_000),
            Err(MachineError::Adc(AdcError::UnknownChannel(99)))
        ));
        assert!(machine.is_terminated());
        assert_eq!(machine.scheduler().armed_len(), 0);
        assert!(matches!(
            machine.run_slice(1_000),
            Ok(RunExit::Terminated { executed: 0 })
        ));
    }

    #[test]
    fn control_byte_terminates_and_stops_forwarding() {
        let received: Rc<RefCell<Vec<u8>>> = Rc::default();
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            received_serial: received.clone(),
            ..ScriptedEngine::default()
        });

        assert_eq!(machine.send_serial_byte(b'x'), SendOutcome::Forwarded);
        assert_eq!(machine.send_serial_byte(0x18), SendOutcome::Terminated);
        assert_eq!(machine.send_serial_byte(b'y'), SendOutcome::Dropped);

        assert!(machine.is_terminated());
        assert_eq!(*received.borrow(), vec![b'x']);
        assert_eq!(machine.scheduler().armed_len(), 0);
    }

    #[test]
    fn engine_serial_output_reaches_the_host() {
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            serial_out: b"ok\n".to_vec(),
            ..ScriptedEngine::default()
        });

        machine.run_slice(1_000).unwrap();
        assert_eq!(machine.take_serial_output(), b"ok\n".to_vec());
    }

    #[test]
    fn pin_edges_are_forwarded_to_the_engine() {
        let edges: Rc<RefCell<Vec<(u8, bool, bool)>>> = Rc::default();
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            edges: edges.clone(),
            ..ScriptedEngine::default()
        });

        machine.pins().borrow_mut().set_input_value(3, true).unwrap();
        machine.pins().borrow_mut().set_input_value(3, true).unwrap();
        machine.pins().borrow_mut().set_input_value(3, false).unwrap();
        assert_eq!(*edges.borrow(), vec![(3, true, false), (3, false, true)]);
    }

    #[test]
    fn host_tick_sessions_reject_engine_time_and_vice_versa() {
        let mut host_driven = Machine::new(MachineConfig {
            time_authority: TimeAuthority::HostTick,
            ..MachineConfig::new()
        });
        host_driven.attach_engine(ScriptedEngine {
            cycles_per_slice: 125,
            ..ScriptedEngine::default()
        });

        // Engine slices execute but do not move virtual time.
        host_driven.run_slice(1_000).unwrap();
        assert_eq!(host_driven.now_ns(), 0);
        assert_eq!(host_driven.tick_to(5_000).unwrap(), 0);
        assert_eq!(host_driven.now_ns(), 5_000);

        let mut engine_driven = machine_125mhz();
        assert!(matches!(
            engine_driven.tick_to(1_000),
            Err(MachineError::NotHostDriven)
        ));
    }

    #[test]
    fn script_runs_against_virtual_time() {
        let mut machine = machine_125mhz();
        machine.attach_engine(ScriptedEngine {
            cycles_per_slice: 12_500, // 100 µs per slice
            ..ScriptedEngine::default()
        });

        let script = StimulusScript::new()
            .set_pin(50_000, 3, true)
            .set_channel(150_000, 3, 1111);
        machine.install_script(&script).unwrap();

        machine.run_slice(100_000).unwrap();
        assert!(machine.pins().borrow().input_value(3).unwrap());
        assert_eq!(machine.channel_values().get(3).unwrap(), 0);

        machine.run_slice(100_000).unwrap();
        assert_eq!(machine.channel_values().get(3).unwrap(), 1111);
    }
}

/// Boundary to the external instruction-execution engine.
///
/// The engine is the one component the harness does not control: it consumes
/// CPU cycles on its own and, as a side effect of executing emulated
/// instructions, requests analog conversions, reads pin state (through the
/// shared pin bank it was constructed with), and emits serial bytes. The
/// harness drives it in bounded slices and drains its peripheral events
/// between slices.
pub trait ExecutionEngine {
    /// Executes at most `budget_cycles` cycles. The single forward-progress
    /// mechanism; the harness never controls the engine any other way.
    fn run_slice(&mut self, budget_cycles: u64) -> EngineExit;

    /// Channels whose conversion the engine requested since the last drain,
    /// in request order.
    fn take_sample_requests(&mut self) -> Vec<u8>;

    /// Delivers a completed conversion back into the engine. `error` marks a
    /// conversion fault; the engine is responsible for surfacing it to the
    /// emulated firmware.
    fn complete_sample(&mut self, value: u16, error: bool);

    /// Forwards one host-originated serial byte into the engine's
    /// communications endpoint.
    fn send_serial_byte(&mut self, byte: u8);

    /// Bytes the engine emitted toward the host since the last drain.
    fn take_serial_output(&mut self) -> Vec<u8>;

    /// Notifies the engine of a digital input edge. Engines that only poll
    /// pin state can ignore this.
    fn pin_edge(&mut self, pin: u8, new: bool, old: bool) {
        let _ = (pin, new, old);
    }
}

/// Why a slice of engine execution returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineExit {
    /// The slice ran to its cycle budget.
    Completed { executed: u64 },
    /// The engine halted (e.g. firmware parked the core).
    Halted { executed: u64 },
}

impl EngineExit {
    pub fn executed(&self) -> u64 {
        match *self {
            EngineExit::Completed { executed } | EngineExit::Halted { executed } => executed,
        }
    }
}

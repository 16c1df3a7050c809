//! Harness integration layer: composes the scheduler, sampling controller,
//! pin bank, and serial pipe around an external execution engine.
//!
//! The engine is an external collaborator reached only through the
//! [`ExecutionEngine`] trait: the harness runs it in bounded slices, drains
//! its peripheral events between slices, and delivers timer-driven
//! completions back into it. Exactly one virtual-time authority exists per
//! session ([`TimeAuthority`]): either the engine's own cycle accounting or
//! a host-clock tick — never both.

#![forbid(unsafe_code)]

mod cycles;
mod engine;
mod machine;

pub use cycles::{CycleScaler, DEFAULT_CYCLES_HZ};
pub use engine::{EngineExit, ExecutionEngine};
pub use machine::{Machine, MachineConfig, MachineError, RunExit, TimeAuthority};

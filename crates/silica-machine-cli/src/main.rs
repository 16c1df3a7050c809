#![forbid(unsafe_code)]

//! Native runner for `silica_machine::Machine`.
//!
//! Drives a demo engine (a small stand-in firmware loop) against the harness
//! with the built-in stimulus scenario: a battery-voltage channel that steps
//! through a scripted value sequence and a button pin that is pressed,
//! released, and bounced at scripted times. Virtual time is engine-driven by
//! default so runs replay identically; `--realtime` switches the session to
//! host-clock ticks and forwards stdin bytes to the emulated serial port
//! (`Ctrl+X` terminates — raw terminal configuration is up to the caller).

mod demo;

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use silica_adc::OverlapPolicy;
use silica_machine::{Machine, MachineConfig, RunExit, TimeAuthority, DEFAULT_CYCLES_HZ};
use silica_time::{HostClock, StdHostClock, NANOS_PER_MILLI};

use crate::demo::{demo_script, DemoEngine, BUTTON_PIN, VOLTAGE_CHANNEL};

#[derive(Debug, Parser)]
#[command(
    about = "Native runner for silica_machine::Machine (demo engine + scripted stimulus)",
    group(
        ArgGroup::new("stop")
            .required(true)
            .args(["max_virtual_ms", "max_slices"])
    )
)]
struct Args {
    /// Stop once virtual time reaches N milliseconds.
    #[arg(long)]
    max_virtual_ms: Option<u64>,

    /// Stop after N engine slices.
    #[arg(long)]
    max_slices: Option<u64>,

    /// Cycle budget per engine slice.
    #[arg(long, default_value_t = 12_500)]
    slice_cycles: u64,

    /// Modeled core frequency in Hz (engine-driven time only).
    #[arg(long, default_value_t = DEFAULT_CYCLES_HZ)]
    cycles_hz: u64,

    /// Drive virtual time from the host clock instead of engine cycles, and
    /// forward stdin bytes to the emulated serial port.
    #[arg(long)]
    realtime: bool,

    /// Skip installing the built-in stimulus scenario.
    #[arg(long)]
    no_demo: bool,

    /// Policy for a sample request arriving while a conversion is pending.
    #[arg(long, value_enum, default_value = "reject")]
    overlap: OverlapArg,

    /// Where to write emulated serial output (`stdout` or a file path).
    #[arg(long, default_value = "stdout")]
    serial_out: String,

    /// Write the host-time interval between consecutive sample completions,
    /// one nanosecond delta per line.
    #[arg(long)]
    timelog: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OverlapArg {
    Reject,
    Queue,
}

impl From<OverlapArg> for OverlapPolicy {
    fn from(arg: OverlapArg) -> Self {
        match arg {
            OverlapArg::Reject => OverlapPolicy::Reject,
            OverlapArg::Queue => OverlapPolicy::Queue,
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = MachineConfig::new();
    config.adc.overlap = args.overlap.into();
    config.time_authority = if args.realtime {
        TimeAuthority::HostTick
    } else {
        TimeAuthority::EngineCycles {
            cycles_hz: args.cycles_hz,
        }
    };

    let mut machine = Machine::new(config);

    // Button idles high (pull-up); set before the engine attaches so the
    // initial level is state, not an edge.
    machine
        .pins()
        .borrow_mut()
        .set_input_value(BUTTON_PIN, true)
        .map_err(|e| anyhow!("{e}"))?;
    machine
        .channel_values()
        .set(VOLTAGE_CHANNEL, 3456)
        .map_err(|e| anyhow!("{e}"))?;

    if !args.no_demo {
        machine
            .install_script(&demo_script())
            .map_err(|e| anyhow!("{e}"))?;
    }

    let timelog = args
        .timelog
        .as_deref()
        .map(|path| {
            File::create(path).with_context(|| format!("failed to create timelog: {path}"))
        })
        .transpose()?
        .map(BufWriter::new);

    machine.attach_engine(DemoEngine::new(machine.pins().clone(), timelog));

    let mut serial_sink = open_serial_sink(&args.serial_out)?;

    if args.realtime {
        run_realtime(&mut machine, &args, serial_sink.as_mut())?;
    } else {
        run_deterministic(&mut machine, &args, serial_sink.as_mut())?;
    }

    stream_serial(&mut machine, serial_sink.as_mut())?;
    serial_sink.flush()?;
    Ok(())
}

fn run_deterministic(machine: &mut Machine, args: &Args, out: &mut dyn Write) -> Result<()> {
    let mut slices: u64 = 0;
    loop {
        if let Some(max_ms) = args.max_virtual_ms {
            if machine.now_ns() >= max_ms * NANOS_PER_MILLI {
                break;
            }
        }
        if let Some(max_slices) = args.max_slices {
            if slices >= max_slices {
                break;
            }
        }

        let exit = machine.run_slice(args.slice_cycles)?;
        slices += 1;
        stream_serial(machine, out)?;

        match exit {
            RunExit::Completed { .. } => {}
            RunExit::Halted { .. } => {
                tracing::info!(slices, "engine halted");
                break;
            }
            RunExit::Terminated { .. } => break,
        }
    }
    Ok(())
}

fn run_realtime(machine: &mut Machine, args: &Args, out: &mut dyn Write) -> Result<()> {
    let host = StdHostClock::new();
    let stdin_bytes = spawn_stdin_reader();
    let mut slices: u64 = 0;

    loop {
        if let Some(max_ms) = args.max_virtual_ms {
            if machine.now_ns() >= max_ms * NANOS_PER_MILLI {
                break;
            }
        }
        if let Some(max_slices) = args.max_slices {
            if slices >= max_slices {
                break;
            }
        }

        machine.tick_to(host.now_ns())?;
        let exit = machine.run_slice(args.slice_cycles)?;
        slices += 1;

        while let Ok(byte) = stdin_bytes.try_recv() {
            machine.send_serial_byte(byte);
        }
        stream_serial(machine, out)?;

        match exit {
            RunExit::Completed { .. } => {}
            RunExit::Halted { .. } => {
                tracing::info!(slices, "engine halted");
                break;
            }
            RunExit::Terminated { .. } => break,
        }

        // Coarse host tick; the scheduler tolerates arbitrarily late ticks.
        std::thread::sleep(Duration::from_micros(500));
    }
    Ok(())
}

fn spawn_stdin_reader() -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for byte in stdin.lock().bytes() {
            match byte {
                Ok(byte) => {
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

fn open_serial_sink(serial_out: &str) -> Result<Box<dyn Write>> {
    if serial_out == "stdout" {
        return Ok(Box::new(io::stdout()));
    }
    let f = File::create(serial_out)
        .with_context(|| format!("failed to create serial output file: {serial_out}"))?;
    Ok(Box::new(BufWriter::new(f)))
}

fn stream_serial(machine: &mut Machine, out: &mut dyn Write) -> Result<()> {
    let bytes = machine.take_serial_output();
    if !bytes.is_empty() {
        out.write_all(&bytes)?;
    }
    Ok(())
}

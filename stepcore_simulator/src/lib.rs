// stepcore_simulator: software coprocessor consuming the shared step ring

pub mod simulator;
pub mod trace;

pub use simulator::{Simulator, SimulatorHandle, SimulatorOptions};
pub use trace::{TraceError, TraceRow};

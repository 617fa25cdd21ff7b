// src/pipeline/mod.rs - hand-off primitives between planner and dispatch
pub mod pause_gate;
pub mod queue;

pub use pause_gate::PauseGate;
pub use queue::{BlockQueue, QueueError};

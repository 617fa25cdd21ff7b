// src/motion/mod.rs - kinematics and the look-ahead planner

pub mod kinematics;
pub mod planner;

pub use kinematics::{create_kinematics, Kinematics};
pub use planner::{Block, BlockBuffer, BlockKind, Planner};

use thiserror::Error;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
pub const E_AXIS: usize = 3;
pub const NUM_AXES: usize = 4;

/// Lowest step rate the coprocessor is asked to run, in steps/s.
pub const MINIMUM_STEP_RATE: u32 = 120;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("Kinematics error: {0}")]
    Kinematics(String),
    #[error("Motion request cancelled by stop")]
    Cancelled,
}

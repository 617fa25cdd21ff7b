// src/lib.rs - host-side motion planning and coprocessor hand-off
pub mod config;
pub mod coprocessor;
pub mod dispatch;
pub mod host;
pub mod motion;
pub mod pipeline;

pub use config::{Config, ConfigError, KinematicConfig, KinematicsType};
pub use coprocessor::{BackendError, CoprocessorLink, FilamentCommand, MotionBackend, RunStateError};
pub use host::{HostError, HostStatus, MotionHost, StopHandle};
pub use motion::{MotionError, Planner};
pub use stepcore_shared::{RunState, SharedRegion};

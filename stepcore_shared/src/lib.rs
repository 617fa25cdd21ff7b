// stepcore_shared: configuration and coprocessor ABI shared by host and simulator

pub mod config;
pub mod layout;
pub mod region;
pub mod run_state;

pub use config::{Config, ConfigError, KinematicsType};
pub use layout::{LayoutError, QueueRecord, RecordKind, SlotState};
pub use region::SharedRegion;
pub use run_state::RunState;

//! Shared configuration for the host, the simulator and tests.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [printer]
//! name = "bench-rig"
//! kinematics = "corexy"
//!
//! [axes]
//! steps_per_unit = [80.0, 80.0, 400.0, 95.0]
//! max_xy_jerk = 20.0
//!
//! [planner]
//! block_buffer_size = 16
//! acceleration = 1500.0
//!
//! [dispatch]
//! auto_slowdown = true
//! slowdown_threshold = 0.25
//! ```
//!
//! Every field has a default, so an empty file is a valid (cartesian) printer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Motor mapping used by the planner and the pause snapshot.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KinematicsType {
    #[default]
    Cartesian,
    #[serde(alias = "hbot")]
    CoreXY,
    Delta,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub coprocessor: CoprocessorConfig,
    #[serde(default)]
    pub homing: HomingConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kinematics: KinematicsType,
    /// Highest reachable Z in mm, bounds the lift performed on stop.
    #[serde(default = "default_z_max_travel")]
    pub z_max_travel: f64,
    #[serde(default = "default_pause_lift")]
    pub pause_lift: f64,
    #[serde(default = "default_stop_lift")]
    pub stop_lift: f64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            name: None,
            kinematics: KinematicsType::default(),
            z_max_travel: default_z_max_travel(),
            pause_lift: default_pause_lift(),
            stop_lift: default_stop_lift(),
        }
    }
}

/// Per-axis limits, always ordered X, Y, Z, E.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxesConfig {
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: [f64; 4],
    #[serde(default = "default_max_feed_rate")]
    pub max_feed_rate: [f64; 4],
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: [f64; 4],
    #[serde(default)]
    pub invert_dir: [bool; 4],
    #[serde(default = "default_max_xy_jerk")]
    pub max_xy_jerk: f64,
    #[serde(default = "default_max_z_jerk")]
    pub max_z_jerk: f64,
    #[serde(default = "default_max_e_jerk")]
    pub max_e_jerk: f64,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            steps_per_unit: default_steps_per_unit(),
            max_feed_rate: default_max_feed_rate(),
            max_acceleration: default_max_acceleration(),
            invert_dir: [false; 4],
            max_xy_jerk: default_max_xy_jerk(),
            max_z_jerk: default_max_z_jerk(),
            max_e_jerk: default_max_e_jerk(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Block ring capacity, must be a power of two.
    #[serde(default = "default_block_buffer_size")]
    pub block_buffer_size: usize,
    /// Moves with this many step events or fewer are dropped.
    #[serde(default = "default_min_segment_steps")]
    pub min_segment_steps: u32,
    #[serde(default)]
    pub minimum_feedrate: f64,
    #[serde(default)]
    pub min_travel_feedrate: f64,
    #[serde(default = "default_acceleration")]
    pub acceleration: f64,
    #[serde(default = "default_acceleration")]
    pub retract_acceleration: f64,
    #[serde(default = "default_true")]
    pub slowdown: bool,
    #[serde(default = "default_minimum_planner_speed")]
    pub minimum_planner_speed: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            block_buffer_size: default_block_buffer_size(),
            min_segment_steps: default_min_segment_steps(),
            minimum_feedrate: 0.0,
            min_travel_feedrate: 0.0,
            acceleration: default_acceleration(),
            retract_acceleration: default_acceleration(),
            slowdown: true,
            minimum_planner_speed: default_minimum_planner_speed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub auto_slowdown: bool,
    /// Blocks that must pass before auto-slowdown may kick in.
    #[serde(default = "default_warmup_blocks")]
    pub warmup_blocks: u32,
    /// Fraction of the coprocessor ring below which rates are scaled down.
    #[serde(default = "default_slowdown_threshold")]
    pub slowdown_threshold: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_slowdown: false,
            warmup_blocks: default_warmup_blocks(),
            slowdown_threshold: default_slowdown_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoprocessorConfig {
    /// Number of records in the shared ring. Part of the ABI.
    #[serde(default = "default_ring_slots")]
    pub ring_slots: usize,
    #[serde(default = "default_clock_hz")]
    pub clock_hz: u32,
    #[serde(default)]
    pub dual_motor: bool,
    #[serde(default)]
    pub endstop_invert: [bool; 4],
    #[serde(default)]
    pub board_flags: u32,
}

impl Default for CoprocessorConfig {
    fn default() -> Self {
        Self {
            ring_slots: default_ring_slots(),
            clock_hz: default_clock_hz(),
            dual_motor: false,
            endstop_invert: [false; 4],
            board_flags: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomingConfig {
    #[serde(default = "default_homing_feed")]
    pub feed_rate: f64,
    /// Per-axis X, Y, Z: home towards the minimum endstop.
    #[serde(default = "default_home_to_min")]
    pub home_to_min: [bool; 3],
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            feed_rate: default_homing_feed(),
            home_to_min: default_home_to_min(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaConfig {
    #[serde(default = "default_diagonal_rod")]
    pub diagonal_rod: f64,
    #[serde(default = "default_delta_radius")]
    pub radius: f64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            diagonal_rod: default_diagonal_rod(),
            radius: default_delta_radius(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (axis, spu) in self.axes.steps_per_unit.iter().enumerate() {
            if !spu.is_finite() || *spu <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "steps_per_unit for axis {} must be > 0, got {}",
                    axis_name(axis),
                    spu
                )));
            }
        }
        for (axis, limit) in self.axes.max_feed_rate.iter().enumerate() {
            if *limit < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "max_feed_rate for axis {} must not be negative",
                    axis_name(axis)
                )));
            }
        }
        for (axis, limit) in self.axes.max_acceleration.iter().enumerate() {
            if *limit < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "max_acceleration for axis {} must not be negative",
                    axis_name(axis)
                )));
            }
        }
        if self.axes.max_xy_jerk < 0.0 || self.axes.max_z_jerk < 0.0 || self.axes.max_e_jerk < 0.0 {
            return Err(ConfigError::Invalid("jerk limits must not be negative".to_string()));
        }
        let size = self.planner.block_buffer_size;
        if size < 4 || !size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "block_buffer_size must be a power of two >= 4, got {}",
                size
            )));
        }
        if self.planner.acceleration < 0.0 || self.planner.retract_acceleration < 0.0 {
            return Err(ConfigError::Invalid("planner acceleration must not be negative".to_string()));
        }
        if self.planner.minimum_planner_speed <= 0.0 {
            return Err(ConfigError::Invalid("minimum_planner_speed must be > 0".to_string()));
        }
        if self.coprocessor.ring_slots == 0 || self.coprocessor.ring_slots > 4096 {
            return Err(ConfigError::Invalid(format!(
                "ring_slots must be between 1 and 4096, got {}",
                self.coprocessor.ring_slots
            )));
        }
        if self.coprocessor.clock_hz == 0 {
            return Err(ConfigError::Invalid("coprocessor clock_hz must be > 0".to_string()));
        }
        if self.homing.feed_rate <= 0.0 {
            return Err(ConfigError::Invalid("homing feed_rate must be > 0".to_string()));
        }
        if self.printer.kinematics == KinematicsType::Delta
            && (self.delta.diagonal_rod <= 0.0 || self.delta.radius <= 0.0)
        {
            return Err(ConfigError::Invalid("delta geometry must be positive".to_string()));
        }
        Ok(())
    }

    /// Direction inversion flags packed one bit per axis.
    pub fn invert_dir_mask(&self) -> u8 {
        pack_bits(&self.axes.invert_dir)
    }

    pub fn endstop_invert_mask(&self) -> u32 {
        u32::from(pack_bits(&self.coprocessor.endstop_invert))
    }
}

fn pack_bits(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0u8, |mask, (bit, _)| mask | (1 << bit))
}

fn axis_name(axis: usize) -> &'static str {
    match axis {
        0 => "X",
        1 => "Y",
        2 => "Z",
        3 => "E",
        _ => "?",
    }
}

fn default_z_max_travel() -> f64 { 200.0 }
fn default_pause_lift() -> f64 { 5.0 }
fn default_stop_lift() -> f64 { 10.0 }
fn default_steps_per_unit() -> [f64; 4] { [80.0, 80.0, 400.0, 95.0] }
fn default_max_feed_rate() -> [f64; 4] { [300.0, 300.0, 5.0, 45.0] }
fn default_max_acceleration() -> [f64; 4] { [3000.0, 3000.0, 100.0, 10000.0] }
fn default_max_xy_jerk() -> f64 { 20.0 }
fn default_max_z_jerk() -> f64 { 0.4 }
fn default_max_e_jerk() -> f64 { 5.0 }
fn default_block_buffer_size() -> usize { 16 }
fn default_min_segment_steps() -> u32 { 5 }
fn default_acceleration() -> f64 { 3000.0 }
fn default_true() -> bool { true }
fn default_minimum_planner_speed() -> f64 { 0.05 }
fn default_warmup_blocks() -> u32 { 8 }
fn default_slowdown_threshold() -> f64 { 0.25 }
fn default_ring_slots() -> usize { 64 }
fn default_clock_hz() -> u32 { 200_000_000 }
fn default_homing_feed() -> f64 { 50.0 }
fn default_home_to_min() -> [bool; 3] { [true; 3] }
fn default_diagonal_rod() -> f64 { 250.0 }
fn default_delta_radius() -> f64 { 124.0 }

/// Parse and validate a configuration from TOML text.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to load config '{}': {}", path, e);
                Err(e)
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

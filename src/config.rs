// src/config.rs - runtime view of the printer configuration
pub use stepcore_shared::config::*;

/// Read-only per-axis limits used by the planner, derived once from [`Config`].
///
/// Axis order is X, Y, Z, E throughout.
#[derive(Debug, Clone)]
pub struct KinematicConfig {
    pub kinematics: KinematicsType,
    pub steps_per_unit: [f64; 4],
    pub max_feed_rate: [f64; 4],
    pub max_acceleration: [f64; 4],
    /// `max_acceleration` expressed in steps/s².
    pub axis_steps_per_sqr_second: [f64; 4],
    pub max_xy_jerk: f64,
    pub max_z_jerk: f64,
    pub max_e_jerk: f64,
    pub block_buffer_size: usize,
    pub min_segment_steps: u32,
    pub minimum_feedrate: f64,
    pub min_travel_feedrate: f64,
    pub acceleration: f64,
    pub retract_acceleration: f64,
    pub slowdown: bool,
    pub minimum_planner_speed: f64,
    pub delta_diagonal_rod: f64,
    pub delta_radius: f64,
}

impl KinematicConfig {
    pub fn from_config(config: &Config) -> Self {
        let axes = &config.axes;
        let axis_steps_per_sqr_second =
            std::array::from_fn(|axis| axes.max_acceleration[axis] * axes.steps_per_unit[axis]);
        Self {
            kinematics: config.printer.kinematics,
            steps_per_unit: axes.steps_per_unit,
            max_feed_rate: axes.max_feed_rate,
            max_acceleration: axes.max_acceleration,
            axis_steps_per_sqr_second,
            max_xy_jerk: axes.max_xy_jerk,
            max_z_jerk: axes.max_z_jerk,
            max_e_jerk: axes.max_e_jerk,
            block_buffer_size: config.planner.block_buffer_size,
            min_segment_steps: config.planner.min_segment_steps,
            minimum_feedrate: config.planner.minimum_feedrate,
            min_travel_feedrate: config.planner.min_travel_feedrate,
            acceleration: config.planner.acceleration,
            retract_acceleration: config.planner.retract_acceleration,
            slowdown: config.planner.slowdown,
            minimum_planner_speed: config.planner.minimum_planner_speed,
            delta_diagonal_rod: config.delta.diagonal_rod,
            delta_radius: config.delta.radius,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_acceleration_is_scaled_to_steps() {
        let mut config = Config::default();
        config.axes.steps_per_unit = [100.0, 80.0, 400.0, 95.0];
        config.axes.max_acceleration = [500.0, 1000.0, 50.0, 2000.0];
        let kc = KinematicConfig::from_config(&config);
        assert_eq!(kc.axis_steps_per_sqr_second, [50_000.0, 80_000.0, 20_000.0, 190_000.0]);
        assert_eq!(kc.block_buffer_size, 16);
    }
}

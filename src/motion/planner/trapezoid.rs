//! Constant-acceleration trapezoid arithmetic.

use super::block::Block;
use crate::motion::MINIMUM_STEP_RATE;

/// Distance needed to go from `initial_rate` to `target_rate` at `acceleration`.
pub fn accel_distance(initial_rate: f64, target_rate: f64, acceleration: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

/// Point at which braking must start when the nominal rate is never reached.
pub fn intersection_distance(
    initial_rate: f64,
    final_rate: f64,
    acceleration: f64,
    distance: f64,
) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

/// Highest speed from which `target_velocity` is reachable over `distance`.
///
/// `acceleration` is negative when braking.
pub fn max_allowable_speed(acceleration: f64, target_velocity: f64, distance: f64) -> f64 {
    (target_velocity * target_velocity - 2.0 * acceleration * distance)
        .max(0.0)
        .sqrt()
}

/// Recompute a block's phase boundaries for the given entry and exit speeds.
///
/// Factors are relative to the nominal speed. A busy block is left untouched.
pub fn calculate_trapezoid(block: &mut Block, entry_factor: f64, exit_factor: f64) {
    let entry_factor = clamp_factor(entry_factor);
    let exit_factor = clamp_factor(exit_factor);
    let nominal_rate = f64::from(block.nominal_rate);

    let initial_rate = ((nominal_rate * entry_factor).ceil() as u32).max(MINIMUM_STEP_RATE);
    let final_rate = ((nominal_rate * exit_factor).ceil() as u32).max(MINIMUM_STEP_RATE);

    let acceleration = block.acceleration_st;
    let step_events = i64::from(block.step_event_count);

    let mut accelerate_steps =
        accel_distance(f64::from(initial_rate), nominal_rate, acceleration).ceil() as i64;
    let decelerate_steps =
        accel_distance(nominal_rate, f64::from(final_rate), -acceleration).floor() as i64;
    accelerate_steps = accelerate_steps.max(0);
    let decelerate_steps = decelerate_steps.max(0);

    let mut plateau_steps = step_events - accelerate_steps - decelerate_steps;
    if plateau_steps < 0 {
        // Nominal rate is never reached: accelerate until the braking point.
        accelerate_steps = intersection_distance(
            f64::from(initial_rate),
            f64::from(final_rate),
            acceleration,
            step_events as f64,
        )
        .ceil() as i64;
        accelerate_steps = accelerate_steps.clamp(0, step_events);
        plateau_steps = 0;
    }

    if block.busy {
        return;
    }
    block.accelerate_until = accelerate_steps as u32;
    block.decelerate_after = (accelerate_steps + plateau_steps) as u32;
    block.initial_rate = initial_rate;
    block.final_rate = final_rate;
}

fn clamp_factor(factor: f64) -> f64 {
    if factor.is_nan() { 0.0 } else { factor.clamp(0.0, 1.0) }
}

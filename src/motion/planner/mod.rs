// src/motion/planner/mod.rs
//! Look-ahead planner.
//!
//! Each accepted move becomes a [`Block`] in the shared ring. After every
//! enqueue the buffered blocks are re-planned so that junction speeds respect
//! the jerk limits and every block can still brake to the minimum planner
//! speed by the end of the buffer.

mod block;
pub mod lookahead;
mod ring;
pub mod trapezoid;

pub use block::{Block, BlockKind};
pub use ring::{BlockBuffer, BlockRing};

use std::sync::Arc;

use crate::config::{KinematicConfig, KinematicsType};
use crate::motion::kinematics::Kinematics;
use crate::motion::{E_AXIS, MINIMUM_STEP_RATE, MotionError, NUM_AXES, X_AXIS, Y_AXIS, Z_AXIS};
use crate::pipeline::BlockQueue;
use trapezoid::{calculate_trapezoid, max_allowable_speed};

/// Planner context: stored position and junction history for one block ring.
pub struct Planner {
    config: KinematicConfig,
    kinematics: Arc<dyn Kinematics>,
    buffer: Arc<BlockBuffer>,
    release: Option<BlockQueue<usize>>,
    /// Absolute position in planner steps (tower steps on a delta).
    position: [i64; NUM_AXES],
    position_mm: [f64; NUM_AXES],
    previous_speed: [f64; NUM_AXES],
    previous_nominal_speed: f64,
}

impl Planner {
    pub fn new(
        config: KinematicConfig,
        kinematics: Arc<dyn Kinematics>,
        buffer: Arc<BlockBuffer>,
    ) -> Self {
        tracing::debug!(
            "Planner created: {:?} kinematics, {} block ring",
            kinematics.kind(),
            buffer.capacity()
        );
        Self {
            config,
            kinematics,
            buffer,
            release: None,
            position: [0; NUM_AXES],
            position_mm: [0.0; NUM_AXES],
            previous_speed: [0.0; NUM_AXES],
            previous_nominal_speed: 0.0,
        }
    }

    /// Hand each committed slot to the dispatch thread through `queue`.
    pub fn with_release(mut self, queue: BlockQueue<usize>) -> Self {
        self.release = Some(queue);
        self
    }

    pub fn buffer(&self) -> &Arc<BlockBuffer> {
        &self.buffer
    }

    /// Plan a move to an absolute target (mm) at `feed_rate` (mm/s).
    ///
    /// Returns `Ok(false)` when the move rounds to too few steps and is dropped.
    /// Blocks while the ring is full; fails with [`MotionError::Cancelled`]
    /// when the stop flag is raised meanwhile.
    pub fn enqueue_move(
        &mut self,
        target: [f64; NUM_AXES],
        feed_rate: f64,
        extruder: u8,
    ) -> Result<bool, MotionError> {
        let target_steps = self.kinematics.target_steps(&target, &self.config.steps_per_unit)?;
        let axis_delta: [i64; NUM_AXES] =
            std::array::from_fn(|axis| target_steps[axis] - self.position[axis]);
        let motor_delta = self.kinematics.step_deltas(axis_delta);

        let steps: [u32; NUM_AXES] =
            std::array::from_fn(|axis| motor_delta[axis].unsigned_abs() as u32);
        let step_event_count = steps.iter().copied().max().unwrap_or(0);
        if step_event_count <= self.config.min_segment_steps {
            tracing::trace!("Dropping {}-step move to {:?}", step_event_count, target);
            return Ok(false);
        }

        let direction_bits = motor_delta
            .iter()
            .enumerate()
            .filter(|(_, delta)| **delta < 0)
            .fold(0u8, |bits, (axis, _)| bits | (1 << axis));

        let mut ring = self.buffer.wait_for_slot()?;
        let occupancy = ring.occupancy();
        let capacity = ring.capacity();
        let previous_busy = ring.back().is_some_and(|previous| previous.busy);

        let mut feed_rate = if steps[E_AXIS] == 0 {
            feed_rate.max(self.config.min_travel_feedrate)
        } else {
            feed_rate.max(self.config.minimum_feedrate)
        };
        feed_rate = feed_rate.max(self.config.minimum_planner_speed);

        // Length comes from the head path; speed limits apply per motor.
        let head_mm = self.head_delta_mm(&axis_delta, &target);
        let delta_mm = self.motor_delta_mm(&motor_delta, &head_mm);
        let min_segment = self.config.min_segment_steps;
        let millimeters = if steps[X_AXIS] <= min_segment
            && steps[Y_AXIS] <= min_segment
            && steps[Z_AXIS] <= min_segment
        {
            head_mm[E_AXIS].abs()
        } else {
            (head_mm[X_AXIS].powi(2) + head_mm[Y_AXIS].powi(2) + head_mm[Z_AXIS].powi(2)).sqrt()
        };
        let inverse_millimeters = 1.0 / millimeters;

        // Slow down while the buffer is running low.
        let half = capacity / 2;
        if self.config.slowdown && occupancy > 1 && occupancy < half {
            feed_rate *= occupancy as f64 / half as f64;
        }

        let inverse_second = feed_rate * inverse_millimeters;
        let mut nominal_speed = millimeters * inverse_second;
        let mut nominal_rate = f64::from(step_event_count) * inverse_second;

        let mut current_speed: [f64; NUM_AXES] =
            std::array::from_fn(|axis| delta_mm[axis] * inverse_second);
        let speed_factor = current_speed
            .iter()
            .zip(self.config.max_feed_rate.iter())
            .filter(|(speed, limit)| **limit > 0.0 && speed.abs() > **limit)
            .map(|(speed, limit)| limit / speed.abs())
            .fold(1.0f64, f64::min);
        if speed_factor < 1.0 {
            for speed in current_speed.iter_mut() {
                *speed *= speed_factor;
            }
            nominal_speed *= speed_factor;
            nominal_rate *= speed_factor;
        }
        let nominal_rate = (nominal_rate.ceil() as u32).max(MINIMUM_STEP_RATE);

        let steps_per_mm = f64::from(step_event_count) / millimeters;
        let no_travel = steps[X_AXIS] == 0 && steps[Y_AXIS] == 0 && steps[Z_AXIS] == 0;
        let mut acceleration_st = if no_travel {
            (self.config.retract_acceleration * steps_per_mm).ceil()
        } else {
            (self.config.acceleration * steps_per_mm).ceil()
        };
        // No axis may see more than its own acceleration cap.
        for axis in 0..NUM_AXES {
            let cap = self.config.axis_steps_per_sqr_second[axis];
            if steps[axis] == 0 || cap <= 0.0 {
                continue;
            }
            let axis_share = f64::from(steps[axis]) / f64::from(step_event_count);
            if acceleration_st * axis_share > cap {
                acceleration_st = (cap / axis_share).floor();
            }
        }
        let acceleration = acceleration_st / steps_per_mm;

        let safe_speed = self.safe_speed(&current_speed, nominal_speed);
        let mut vmax_junction = safe_speed;
        if occupancy > 0 && !previous_busy && self.previous_nominal_speed > 0.0001 {
            vmax_junction = self.junction_speed(&current_speed, nominal_speed);
        }

        let v_allowable =
            max_allowable_speed(-acceleration, self.config.minimum_planner_speed, millimeters);
        let mut block = Block {
            kind: BlockKind::Move,
            steps,
            direction_bits,
            step_event_count,
            active_extruder: extruder,
            millimeters,
            nominal_speed,
            nominal_rate,
            entry_speed: vmax_junction.min(v_allowable),
            max_entry_speed: vmax_junction,
            acceleration,
            acceleration_st,
            nominal_length_reached: nominal_speed <= v_allowable,
            recalculate: true,
            ..Block::default()
        };
        let entry_factor = block.entry_speed / nominal_speed;
        calculate_trapezoid(&mut block, entry_factor, safe_speed / nominal_speed);

        let Some(slot) = ring.push(block) else {
            return Err(MotionError::Cancelled);
        };
        self.previous_speed = current_speed;
        self.previous_nominal_speed = nominal_speed;
        self.position = target_steps;
        self.position_mm = target;

        lookahead::recalculate(&mut ring, self.config.minimum_planner_speed);
        drop(ring);

        tracing::trace!(
            "Queued {} steps at {:.2} mm/s into slot {} ({} buffered)",
            step_event_count,
            nominal_speed,
            slot,
            occupancy + 1
        );
        self.release_slot(slot)?;
        Ok(true)
    }

    /// Queue a non-motion command in order with the moves around it.
    pub fn enqueue_command(&mut self, code: u32) -> Result<bool, MotionError> {
        let mut ring = self.buffer.wait_for_slot()?;
        let Some(slot) = ring.push(Block::command(code)) else {
            return Err(MotionError::Cancelled);
        };
        // Braking before the command is handled by the run split in look-ahead.
        lookahead::recalculate(&mut ring, self.config.minimum_planner_speed);
        drop(ring);
        self.previous_speed = [0.0; NUM_AXES];
        self.previous_nominal_speed = 0.0;
        tracing::debug!("Queued command {} into slot {}", code, slot);
        self.release_slot(slot)?;
        Ok(true)
    }

    fn release_slot(&self, slot: usize) -> Result<(), MotionError> {
        if let Some(queue) = &self.release {
            queue.send(slot).map_err(|_| MotionError::Cancelled)?;
        }
        Ok(())
    }

    /// Overwrite the stored position without moving; the next move starts from rest.
    pub fn set_position(&mut self, position: [f64; NUM_AXES]) -> Result<(), MotionError> {
        self.position = self.kinematics.target_steps(&position, &self.config.steps_per_unit)?;
        self.position_mm = position;
        self.previous_speed = [0.0; NUM_AXES];
        self.previous_nominal_speed = 0.0;
        tracing::debug!("Planner position set to {:?}", position);
        Ok(())
    }

    /// Re-run look-ahead over the buffered blocks.
    pub fn recalculate(&self) {
        let mut ring = self.buffer.lock();
        lookahead::recalculate(&mut ring, self.config.minimum_planner_speed);
    }

    pub fn position_mm(&self) -> [f64; NUM_AXES] {
        self.position_mm
    }

    pub fn position_steps(&self) -> [i64; NUM_AXES] {
        self.position
    }

    pub fn occupancy(&self) -> usize {
        self.buffer.occupancy()
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.buffer.snapshot()
    }

    fn head_delta_mm(
        &self,
        axis_delta: &[i64; NUM_AXES],
        target: &[f64; NUM_AXES],
    ) -> [f64; NUM_AXES] {
        match self.kinematics.kind() {
            // Tower steps say nothing direct about cartesian distance.
            KinematicsType::Delta => {
                std::array::from_fn(|axis| target[axis] - self.position_mm[axis])
            }
            KinematicsType::Cartesian | KinematicsType::CoreXY => std::array::from_fn(|axis| {
                axis_delta[axis] as f64 / self.config.steps_per_unit[axis]
            }),
        }
    }

    /// Per-motor travel in mm; `A = X + Y` and `B = X - Y` on CoreXY.
    fn motor_delta_mm(
        &self,
        motor_delta: &[i64; NUM_AXES],
        head_mm: &[f64; NUM_AXES],
    ) -> [f64; NUM_AXES] {
        match self.kinematics.kind() {
            KinematicsType::CoreXY => std::array::from_fn(|axis| {
                motor_delta[axis] as f64 / self.config.steps_per_unit[axis]
            }),
            KinematicsType::Cartesian | KinematicsType::Delta => *head_mm,
        }
    }

    /// Speed a block may always enter at, whatever came before it.
    fn safe_speed(&self, current_speed: &[f64; NUM_AXES], nominal_speed: f64) -> f64 {
        let mut safe = self.config.max_xy_jerk / 2.0;
        if current_speed[Z_AXIS].abs() > self.config.max_z_jerk / 2.0 {
            safe = safe.min(self.config.max_z_jerk / 2.0);
        }
        if current_speed[E_AXIS].abs() > self.config.max_e_jerk / 2.0 {
            safe = safe.min(self.config.max_e_jerk / 2.0);
        }
        safe.min(nominal_speed)
    }

    /// Junction speed against the previous block, scaled down by the worst jerk overshoot.
    fn junction_speed(&self, current_speed: &[f64; NUM_AXES], nominal_speed: f64) -> f64 {
        let previous = &self.previous_speed;
        let mut factor = 1.0f64;

        let xy_jerk = ((current_speed[X_AXIS] - previous[X_AXIS]).powi(2)
            + (current_speed[Y_AXIS] - previous[Y_AXIS]).powi(2))
        .sqrt();
        if xy_jerk > self.config.max_xy_jerk {
            factor = self.config.max_xy_jerk / xy_jerk;
        }
        let z_jerk = (current_speed[Z_AXIS] - previous[Z_AXIS]).abs();
        if z_jerk > self.config.max_z_jerk {
            factor = factor.min(self.config.max_z_jerk / z_jerk);
        }
        let e_jerk = (current_speed[E_AXIS] - previous[E_AXIS]).abs();
        if e_jerk > self.config.max_e_jerk {
            factor = factor.min(self.config.max_e_jerk / e_jerk);
        }

        (nominal_speed * factor).min(self.previous_nominal_speed)
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("kinematics", &self.kinematics.kind())
            .field("position", &self.position)
            .field("previous_nominal_speed", &self.previous_nominal_speed)
            .field("buffered", &self.buffer.occupancy())
            .finish()
    }
}

//! Host side of the run-state machine in the control region.
//!
//! ```text
//! IDLE -> HOME -> IDLE
//! IDLE/PAUSE -> PRINT -> PAUSE -> RESUME -> PRINT
//! PRINT/PAUSE -> STOP -> IDLE
//! IDLE -> TEST -> IDLE
//! any -> LOAD_FILAMENT/UNLOAD_FILAMENT -> previous state
//! ```
//!
//! The host is the only writer of requests; the coprocessor completes
//! HOME, RESUME and STOP by writing the follow-up state itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use stepcore_shared::config::{Config, KinematicsType};
use stepcore_shared::layout::LayoutError;
use stepcore_shared::region::SharedRegion;
use stepcore_shared::run_state::RunState;
use thiserror::Error;

use super::link::Backoff;
use crate::motion::kinematics::{motors_to_position_mm, Kinematics};
use crate::motion::{MotionError, NUM_AXES, Z_AXIS};

#[derive(Debug, Error, PartialEq)]
pub enum RunStateError {
    #[error("invalid run-state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
    #[error("shared region error: {0}")]
    Layout(#[from] LayoutError),
    #[error("pause snapshot failed: {0}")]
    Snapshot(#[from] MotionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilamentCommand {
    Start,
    Stop,
}

pub struct RunControl {
    region: Arc<SharedRegion>,
    kinematics: Arc<dyn Kinematics>,
    steps_per_unit: [f64; NUM_AXES],
    clock_hz: u32,
    homing_feed: f64,
    home_to_min: [bool; 3],
    pause_lift: f64,
    stop_lift: f64,
    z_max_travel: f64,
    /// State to return to after a filament operation.
    saved: Mutex<Option<RunState>>,
}

impl RunControl {
    pub fn new(config: &Config, region: Arc<SharedRegion>, kinematics: Arc<dyn Kinematics>) -> Self {
        Self {
            region,
            kinematics,
            steps_per_unit: config.axes.steps_per_unit,
            clock_hz: config.coprocessor.clock_hz,
            homing_feed: config.homing.feed_rate,
            home_to_min: config.homing.home_to_min,
            pause_lift: config.printer.pause_lift,
            stop_lift: config.printer.stop_lift,
            z_max_travel: config.printer.z_max_travel,
            saved: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Result<RunState, LayoutError> {
        self.region.run_state()
    }

    fn transition<F>(&self, allowed: &[RunState], to: RunState, prepare: F) -> Result<(), RunStateError>
    where
        F: FnOnce(&SharedRegion) -> Result<(), RunStateError>,
    {
        let _saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let from = self.region.run_state()?;
        if !allowed.contains(&from) {
            return Err(RunStateError::InvalidTransition { from, to });
        }
        prepare(&self.region)?;
        self.region.set_run_state(to);
        tracing::info!("Run state {} -> {}", from, to);
        Ok(())
    }

    /// Request homing of the axes in `axes` (bit 0 X, bit 1 Y, bit 2 Z; zero means all).
    pub fn home(&self, axes: u8) -> Result<(), RunStateError> {
        let mask = match axes & 0b111 {
            0 => 0b111,
            mask => mask,
        };
        let mut direction = 0u32;
        let mut fastest_axis_spu: f64 = 0.0;
        for axis in 0..3 {
            if mask & (1 << axis) == 0 {
                continue;
            }
            if self.home_to_min[axis] {
                direction |= 1 << axis;
            }
            fastest_axis_spu = fastest_axis_spu.max(self.steps_per_unit[axis]);
        }
        let step_rate = self.homing_feed * fastest_axis_spu;
        let step_delay = if step_rate > 0.0 {
            (f64::from(self.clock_hz) / step_rate).round() as u32
        } else {
            0
        };
        self.transition(&[RunState::Idle], RunState::Home, |region| {
            region.set_homing(u32::from(mask), direction, step_delay);
            Ok(())
        })
    }

    pub fn start(&self) -> Result<(), RunStateError> {
        self.transition(&[RunState::Idle, RunState::Pause], RunState::Print, |_| Ok(()))
    }

    /// Snapshot the current position and ask the coprocessor to park.
    pub fn pause(&self) -> Result<(), RunStateError> {
        let lift = (self.pause_lift * self.steps_per_unit[Z_AXIS]).round().max(0.0) as u32;
        self.transition(&[RunState::Print], RunState::Pause, |region| {
            let snapshot = self.pause_snapshot(&region.position())?;
            region.set_pause_position(snapshot);
            region.set_pause_lift(lift);
            Ok(())
        })
    }

    pub fn resume(&self) -> Result<(), RunStateError> {
        self.transition(&[RunState::Pause], RunState::Resume, |_| Ok(()))
    }

    /// Abort printing; the coprocessor lifts Z by a bounded amount and drops its queue.
    pub fn stop(&self) -> Result<(), RunStateError> {
        self.transition(
            &[RunState::Print, RunState::Pause, RunState::Resume],
            RunState::Stop,
            |region| {
                let lift = self.stop_lift_steps(&region.position());
                region.set_stop_lift(lift);
                Ok(())
            },
        )
    }

    pub fn test_mode(&self, enable: bool) -> Result<(), RunStateError> {
        if enable {
            self.transition(&[RunState::Idle], RunState::Test, |_| Ok(()))
        } else {
            self.transition(&[RunState::Test], RunState::Idle, |_| Ok(()))
        }
    }

    pub fn load_filament(&self, command: FilamentCommand) -> Result<(), RunStateError> {
        self.filament(RunState::LoadFilament, command)
    }

    pub fn unload_filament(&self, command: FilamentCommand) -> Result<(), RunStateError> {
        self.filament(RunState::UnloadFilament, command)
    }

    fn filament(&self, target: RunState, command: FilamentCommand) -> Result<(), RunStateError> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.region.run_state()?;
        match command {
            FilamentCommand::Start => {
                if current.is_filament() || saved.is_some() {
                    return Err(RunStateError::InvalidTransition { from: current, to: target });
                }
                *saved = Some(current);
                self.region.set_run_state(target);
                tracing::info!("Run state {} -> {} (saved)", current, target);
            }
            FilamentCommand::Stop => {
                let Some(previous) = saved.filter(|_| current == target) else {
                    return Err(RunStateError::InvalidTransition { from: current, to: target });
                };
                *saved = None;
                self.region.set_run_state(previous);
                tracing::info!("Run state {} -> {} (restored)", current, previous);
            }
        }
        Ok(())
    }

    /// Block until the coprocessor reports `target`, or `cancel` is raised.
    pub fn wait_for(&self, target: RunState, cancel: &AtomicBool) -> Result<bool, LayoutError> {
        let backoff = Backoff::default();
        let mut delay = backoff.min;
        loop {
            if self.region.run_state()? == target {
                return Ok(true);
            }
            if cancel.load(Ordering::Acquire) {
                return Ok(false);
            }
            std::thread::sleep(delay);
            delay = backoff.next(delay);
        }
    }

    /// Pause position in XYZ steps.
    ///
    /// Linear kinematics copy the motor position; a delta goes through its
    /// forward kinematics so the snapshot is cartesian.
    fn pause_snapshot(&self, position: &[i32; NUM_AXES]) -> Result<[i32; 3], MotionError> {
        match self.kinematics.kind() {
            KinematicsType::Cartesian | KinematicsType::CoreXY => {
                Ok([position[0], position[1], position[2]])
            }
            KinematicsType::Delta => {
                let cartesian =
                    motors_to_position_mm(self.kinematics.as_ref(), position, &self.steps_per_unit)?;
                Ok(std::array::from_fn(|axis| {
                    (cartesian[axis] * self.steps_per_unit[axis]).round() as i32
                }))
            }
        }
    }

    fn stop_lift_steps(&self, position: &[i32; NUM_AXES]) -> u32 {
        let lift = match motors_to_position_mm(self.kinematics.as_ref(), position, &self.steps_per_unit) {
            Ok(mm) => self.stop_lift.min(self.z_max_travel - mm[Z_AXIS]),
            Err(e) => {
                tracing::warn!("Cannot bound stop lift, using full lift: {}", e);
                self.stop_lift
            }
        };
        (lift.max(0.0) * self.steps_per_unit[Z_AXIS]).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KinematicConfig;
    use crate::motion::kinematics::create_kinematics;

    fn control(config: &Config) -> (RunControl, Arc<SharedRegion>) {
        let region = Arc::new(SharedRegion::new(4));
        let kinematics: Arc<dyn Kinematics> =
            Arc::from(create_kinematics(&KinematicConfig::from_config(config)));
        (RunControl::new(config, region.clone(), kinematics), region)
    }

    #[test]
    fn print_pause_resume_cycle() {
        let (rc, region) = control(&Config::default());
        rc.start().unwrap();
        region.set_position([800, 1600, 4000, 95]);
        rc.pause().unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::Pause);
        assert_eq!(region.pause_position(), [800, 1600, 4000]);
        assert_eq!(region.pause_lift(), 2000);
        rc.resume().unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::Resume);
    }

    #[test]
    fn invalid_transition_leaves_region_untouched() {
        let (rc, region) = control(&Config::default());
        assert_eq!(
            rc.pause(),
            Err(RunStateError::InvalidTransition { from: RunState::Idle, to: RunState::Pause })
        );
        assert_eq!(region.pause_lift(), 0);
        assert!(rc.resume().is_err());
        assert!(rc.stop().is_err());
        assert_eq!(region.run_state().unwrap(), RunState::Idle);
    }

    #[test]
    fn home_writes_mask_direction_and_delay() {
        let mut config = Config::default();
        config.homing.home_to_min = [true, false, true];
        config.homing.feed_rate = 50.0;
        let (rc, region) = control(&config);
        rc.home(0b011).unwrap();
        let (axes, direction, delay) = region.homing();
        assert_eq!(axes, 0b011);
        assert_eq!(direction, 0b001);
        // 200 MHz / (50 mm/s * 80 steps/mm)
        assert_eq!(delay, 50_000);
        assert_eq!(region.run_state().unwrap(), RunState::Home);
    }

    #[test]
    fn home_with_empty_mask_homes_everything() {
        let (rc, region) = control(&Config::default());
        rc.home(0).unwrap();
        assert_eq!(region.homing().0, 0b111);
    }

    #[test]
    fn stop_lift_is_bounded_by_travel() {
        let (rc, region) = control(&Config::default());
        rc.start().unwrap();
        // Z at 195 mm of 200: only 5 of the 10 mm lift fit.
        region.set_position([0, 0, 195 * 400, 0]);
        rc.stop().unwrap();
        assert_eq!(region.stop_lift(), 5 * 400);
        assert_eq!(region.run_state().unwrap(), RunState::Stop);
    }

    #[test]
    fn stop_lift_at_the_top_is_zero() {
        let (rc, region) = control(&Config::default());
        rc.start().unwrap();
        region.set_position([0, 0, 210 * 400, 0]);
        rc.stop().unwrap();
        assert_eq!(region.stop_lift(), 0);
    }

    #[test]
    fn test_mode_only_from_idle() {
        let (rc, region) = control(&Config::default());
        rc.test_mode(true).unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::Test);
        assert!(rc.start().is_err());
        rc.test_mode(false).unwrap();
        rc.start().unwrap();
        assert!(rc.test_mode(true).is_err());
    }

    #[test]
    fn filament_states_restore_previous_state() {
        let (rc, region) = control(&Config::default());
        rc.start().unwrap();
        rc.load_filament(FilamentCommand::Start).unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::LoadFilament);
        assert!(rc.unload_filament(FilamentCommand::Start).is_err());
        assert!(rc.unload_filament(FilamentCommand::Stop).is_err());
        rc.load_filament(FilamentCommand::Stop).unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::Print);
        assert!(rc.load_filament(FilamentCommand::Stop).is_err());
    }

    #[test]
    fn delta_snapshot_is_cartesian() {
        let mut config = Config::default();
        config.printer.kinematics = KinematicsType::Delta;
        config.axes.steps_per_unit = [100.0, 100.0, 100.0, 100.0];
        let (rc, region) = control(&config);
        let kinematics = create_kinematics(&KinematicConfig::from_config(&config));
        let carriages = kinematics.cartesian_to_motors(&[10.0, -20.0, 30.0]).unwrap();
        region.set_position([
            (carriages[0] * 100.0).round() as i32,
            (carriages[1] * 100.0).round() as i32,
            (carriages[2] * 100.0).round() as i32,
            0,
        ]);
        rc.start().unwrap();
        rc.pause().unwrap();
        let snapshot = region.pause_position();
        for (got, want) in snapshot.iter().zip([1000, -2000, 3000]) {
            assert!((got - want).abs() <= 3, "{:?}", snapshot);
        }
    }

    #[test]
    fn wait_for_returns_on_cancel() {
        let (rc, _region) = control(&Config::default());
        let cancel = AtomicBool::new(true);
        assert_eq!(rc.wait_for(RunState::Print, &cancel), Ok(false));
        assert_eq!(rc.wait_for(RunState::Idle, &cancel), Ok(true));
    }
}

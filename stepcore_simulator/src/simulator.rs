//! A software coprocessor.
//!
//! Follows the consumer half of the ring protocol: acquire-load a FILLED slot,
//! execute it, store EMPTY, advance the read cursor and raise the wake signal.
//! Run-state requests written by the host (HOME, PAUSE, RESUME, STOP) are
//! carried out against the tracked stepper positions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use stepcore_shared::config::Config;
use stepcore_shared::layout::{LayoutError, QueueRecord, RecordKind, RECORD_SIZE, SlotState};
use stepcore_shared::region::SharedRegion;
use stepcore_shared::run_state::RunState;

use crate::trace::{self, TraceError, TraceRow};

const Z_AXIS: usize = 2;

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Per-axis direction inversion applied by the host, undone here.
    pub invert_mask: u8,
    pub poll_interval: Duration,
    /// Signalled after each consumed slot.
    pub wake: Option<Sender<()>>,
}

impl SimulatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            invert_mask: config.invert_dir_mask(),
            poll_interval: Duration::from_micros(200),
            wake: None,
        }
    }

    pub fn with_wake(mut self, wake: Sender<()>) -> Self {
        self.wake = Some(wake);
        self
    }
}

pub struct Simulator {
    region: Arc<SharedRegion>,
    options: SimulatorOptions,
    cancel: Arc<AtomicBool>,
    trace: Arc<Mutex<Vec<TraceRow>>>,
    pub stepper_positions: [i32; 4],
    saved_position: Option<[i32; 4]>,
    executed: u64,
}

impl Simulator {
    pub fn new(region: Arc<SharedRegion>, options: SimulatorOptions) -> Self {
        let stepper_positions = region.position();
        tracing::info!("Simulator initialized with {} ring slots", region.slots());
        Self {
            region,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            trace: Arc::new(Mutex::new(Vec::new())),
            stepper_positions,
            saved_position: None,
            executed: 0,
        }
    }

    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Run until an EXIT record is read or the simulator is cancelled.
    pub fn run(&mut self) -> Result<(), LayoutError> {
        while !self.cancel.load(Ordering::Acquire) {
            let slot = self.read_slot();
            if self.region.slot_state(slot)? == SlotState::Exit {
                tracing::info!("Simulator received EXIT after {} records", self.executed);
                self.region.release_slot(slot)?;
                return Ok(());
            }
            let progressed = self.step()?;
            if !progressed {
                std::thread::sleep(self.options.poll_interval);
            }
        }
        tracing::info!("Simulator cancelled after {} records", self.executed);
        Ok(())
    }

    /// Perform one unit of work for the current run state.
    ///
    /// Returns `false` when there was nothing to do.
    pub fn step(&mut self) -> Result<bool, LayoutError> {
        match self.region.run_state()? {
            RunState::Print => self.consume_one(),
            RunState::Home => {
                self.home();
                Ok(true)
            }
            RunState::Pause => Ok(self.pause()),
            RunState::Resume => {
                self.resume();
                Ok(true)
            }
            RunState::Stop => {
                self.stop()?;
                Ok(true)
            }
            RunState::Idle
            | RunState::Test
            | RunState::LoadFilament
            | RunState::UnloadFilament => Ok(false),
        }
    }

    fn read_slot(&self) -> usize {
        self.region.read_cursor() as usize / RECORD_SIZE % self.region.slots().max(1)
    }

    fn advance_read_cursor(&self) {
        let ring_bytes = self.region.slots() * RECORD_SIZE;
        let next = (self.region.read_cursor() as usize + RECORD_SIZE) % ring_bytes;
        self.region.set_read_cursor(next as u32);
    }

    fn consume_one(&mut self) -> Result<bool, LayoutError> {
        let slot = self.read_slot();
        let (state, record) = self.region.read_record(slot)?;
        if state != SlotState::Filled {
            return Ok(false);
        }
        match record.kind {
            RecordKind::Move => self.apply_move(&record),
            RecordKind::Command => {
                tracing::debug!("Simulator executing command {}", record.command);
                self.region.increment_mcode_count();
            }
        }
        let row = TraceRow::new(self.executed, slot, &record, self.stepper_positions);
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
        self.executed += 1;

        self.region.release_slot(slot)?;
        self.advance_read_cursor();
        if let Some(wake) = &self.options.wake {
            let _ = wake.try_send(());
        }
        Ok(true)
    }

    fn apply_move(&mut self, record: &QueueRecord) {
        let direction = record.direction ^ self.options.invert_mask;
        for (axis, steps) in record.steps.iter().enumerate() {
            let delta = *steps as i32;
            if direction & (1 << axis) != 0 {
                self.stepper_positions[axis] -= delta;
            } else {
                self.stepper_positions[axis] += delta;
            }
        }
        tracing::trace!("Stepper position now {:?}", self.stepper_positions);
        self.region.set_position(self.stepper_positions);
    }

    fn home(&mut self) {
        let (axes, _direction, _delay) = self.region.homing();
        for axis in 0..3 {
            if axes & (1 << axis) != 0 {
                self.stepper_positions[axis] = 0;
            }
        }
        self.region.set_position(self.stepper_positions);
        tracing::info!("Simulator homed axes mask {:#05b}", axes);
        self.region.set_run_state(RunState::Idle);
    }

    fn pause(&mut self) -> bool {
        if self.saved_position.is_some() {
            return false;
        }
        self.saved_position = Some(self.stepper_positions);
        self.stepper_positions[Z_AXIS] += self.region.pause_lift() as i32;
        self.region.set_position(self.stepper_positions);
        tracing::info!("Simulator paused, lifted {} steps", self.region.pause_lift());
        true
    }

    fn resume(&mut self) {
        if let Some(saved) = self.saved_position.take() {
            self.stepper_positions = saved;
            self.region.set_position(saved);
        }
        tracing::info!("Simulator resumed at {:?}", self.stepper_positions);
        self.region.set_run_state(RunState::Print);
    }

    fn stop(&mut self) -> Result<(), LayoutError> {
        self.saved_position = None;
        self.stepper_positions[Z_AXIS] += self.region.stop_lift() as i32;
        self.region.set_position(self.stepper_positions);
        let mut discarded = 0;
        loop {
            let slot = self.read_slot();
            if self.region.slot_state(slot)? != SlotState::Filled {
                break;
            }
            self.region.release_slot(slot)?;
            self.advance_read_cursor();
            discarded += 1;
        }
        if let Some(wake) = &self.options.wake {
            let _ = wake.try_send(());
        }
        tracing::info!("Simulator stopped, discarded {} records", discarded);
        self.region.set_run_state(RunState::Idle);
        Ok(())
    }

    /// Spawn the simulator on its own thread.
    pub fn spawn(self) -> std::io::Result<SimulatorHandle> {
        let cancel = self.cancel.clone();
        let trace = self.trace.clone();
        let mut simulator = self;
        let thread = std::thread::Builder::new()
            .name("stepcore-sim".to_string())
            .spawn(move || {
                if let Err(e) = simulator.run() {
                    tracing::error!("Simulator stopped on layout error: {}", e);
                }
                simulator
            })?;
        Ok(SimulatorHandle {
            thread: Some(thread),
            cancel,
            trace,
        })
    }
}

pub struct SimulatorHandle {
    thread: Option<JoinHandle<Simulator>>,
    cancel: Arc<AtomicBool>,
    trace: Arc<Mutex<Vec<TraceRow>>>,
}

impl SimulatorHandle {
    pub fn trace(&self) -> Vec<TraceRow> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn write_trace_csv(&self, path: &std::path::Path) -> Result<(), TraceError> {
        trace::write_csv_file(path, &self.trace())
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Wait for the simulator thread to finish and hand back its final state.
    pub fn join(mut self) -> Option<Simulator> {
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel.store(true, Ordering::Release);
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SimulatorOptions {
        SimulatorOptions {
            invert_mask: 0,
            poll_interval: Duration::from_micros(10),
            wake: None,
        }
    }

    fn publish(region: &SharedRegion, slot: usize, record: &QueueRecord) {
        region.publish_slot(slot, record, SlotState::Filled).unwrap();
        region.set_write_cursor(((slot + 1) % region.slots() * RECORD_SIZE) as u32);
    }

    #[test]
    fn print_consumes_filled_slots_in_order() {
        let region = Arc::new(SharedRegion::new(4));
        let mut sim = Simulator::new(region.clone(), options());
        publish(&region, 0, &QueueRecord { steps: [100, 50, 0, 0], ..QueueRecord::default() });
        publish(&region, 1, &QueueRecord { direction: 0b0001, steps: [30, 0, 0, 0], ..QueueRecord::default() });
        region.set_run_state(RunState::Print);

        assert!(sim.step().unwrap());
        assert!(sim.step().unwrap());
        assert!(!sim.step().unwrap());
        assert_eq!(region.position(), [70, 50, 0, 0]);
        assert_eq!(region.read_cursor(), 2 * RECORD_SIZE as u32);
        assert_eq!(region.slot_state(0).unwrap(), SlotState::Empty);
    }

    #[test]
    fn idle_leaves_slots_alone() {
        let region = Arc::new(SharedRegion::new(2));
        let mut sim = Simulator::new(region.clone(), options());
        publish(&region, 0, &QueueRecord { steps: [1, 0, 0, 0], ..QueueRecord::default() });
        assert!(!sim.step().unwrap());
        assert_eq!(region.slot_state(0).unwrap(), SlotState::Filled);
    }

    #[test]
    fn inverted_axes_are_undone() {
        let region = Arc::new(SharedRegion::new(2));
        let mut sim = Simulator::new(region.clone(), SimulatorOptions { invert_mask: 0b0010, ..options() });
        // +Y move arrives with the Y bit flipped by the host.
        publish(&region, 0, &QueueRecord { direction: 0b0010, steps: [0, 40, 0, 0], ..QueueRecord::default() });
        region.set_run_state(RunState::Print);
        sim.step().unwrap();
        assert_eq!(region.position()[1], 40);
    }

    #[test]
    fn commands_bump_the_mcode_counter() {
        let region = Arc::new(SharedRegion::new(2));
        let mut sim = Simulator::new(region.clone(), options());
        publish(&region, 0, &QueueRecord::command(400));
        region.set_run_state(RunState::Print);
        sim.step().unwrap();
        assert_eq!(region.mcode_count(), 1);
        assert_eq!(region.position(), [0; 4]);
    }

    #[test]
    fn pause_lifts_and_resume_restores() {
        let region = Arc::new(SharedRegion::new(2));
        region.set_position([10, 20, 30, 40]);
        region.set_pause_lift(500);
        let mut sim = Simulator::new(region.clone(), options());
        region.set_run_state(RunState::Pause);
        assert!(sim.step().unwrap());
        assert_eq!(region.position()[2], 530);
        assert!(!sim.step().unwrap());

        region.set_run_state(RunState::Resume);
        sim.step().unwrap();
        assert_eq!(region.position(), [10, 20, 30, 40]);
        assert_eq!(region.run_state().unwrap(), RunState::Print);
    }

    #[test]
    fn home_zeroes_requested_axes() {
        let region = Arc::new(SharedRegion::new(2));
        region.set_position([10, 20, 30, 40]);
        region.set_homing(0b101, 0, 1000);
        region.set_run_state(RunState::Home);
        let mut sim = Simulator::new(region.clone(), options());
        sim.step().unwrap();
        assert_eq!(region.position(), [0, 20, 0, 40]);
        assert_eq!(region.run_state().unwrap(), RunState::Idle);
    }

    #[test]
    fn stop_discards_pending_and_goes_idle() {
        let region = Arc::new(SharedRegion::new(4));
        region.set_stop_lift(100);
        let mut sim = Simulator::new(region.clone(), options());
        publish(&region, 0, &QueueRecord { steps: [5, 0, 0, 0], ..QueueRecord::default() });
        publish(&region, 1, &QueueRecord { steps: [5, 0, 0, 0], ..QueueRecord::default() });
        region.set_run_state(RunState::Stop);
        sim.step().unwrap();
        assert_eq!(region.run_state().unwrap(), RunState::Idle);
        assert_eq!(region.slot_state(0).unwrap(), SlotState::Empty);
        assert_eq!(region.slot_state(1).unwrap(), SlotState::Empty);
        assert_eq!(region.position(), [0, 0, 100, 0]);
        assert_eq!(sim.executed(), 0);
    }

    #[test]
    fn exit_record_ends_the_thread() {
        let region = Arc::new(SharedRegion::new(2));
        let handle = Simulator::new(region.clone(), options()).spawn().unwrap();
        region.publish_slot(0, &QueueRecord::default(), SlotState::Exit).unwrap();
        let sim = handle.join().unwrap();
        assert_eq!(sim.executed(), 0);
        assert_eq!(region.slot_state(0).unwrap(), SlotState::Empty);
    }
}

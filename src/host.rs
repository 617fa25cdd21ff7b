// src/host.rs - public motion API tying planner, dispatch and coprocessor together
//! [`MotionHost`] owns the planner, the dispatch thread and the coprocessor
//! link for one shared region. Moves go in through [`MotionHost::enqueue_move`];
//! run-state requests (home, start, pause, resume, stop) are forwarded to the
//! coprocessor while the host pipeline is paused or flushed to match.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use serde::Serialize;
use stepcore_shared::layout::LayoutError;
use stepcore_shared::region::SharedRegion;
use stepcore_shared::run_state::RunState;
use thiserror::Error;

use crate::config::{Config, ConfigError, KinematicConfig};
use crate::coprocessor::{
    Backoff, BackendError, CoprocessorLink, FilamentCommand, MotionBackend, RunControl,
    RunStateError,
};
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::motion::kinematics::{create_kinematics, motors_to_position_mm, Kinematics};
use crate::motion::planner::{BlockBuffer, Planner};
use crate::motion::{MotionError, NUM_AXES};
use crate::pipeline::{BlockQueue, PauseGate, QueueError};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Run state error: {0}")]
    RunState(#[from] RunStateError),
    #[error("Shared region error: {0}")]
    Layout(#[from] LayoutError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Failed to spawn dispatch thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Point-in-time view of the host and coprocessor, printed by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub run_state: RunState,
    pub position_mm: [f64; NUM_AXES],
    pub planner_position_mm: [f64; NUM_AXES],
    pub planner_blocks: usize,
    pub coprocessor_pending: usize,
    pub dispatched: u64,
    pub mcode_count: u32,
    pub stopped: bool,
}

/// State shared between the host and every [`StopHandle`].
struct StopControl {
    stop: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    queue: BlockQueue<usize>,
    buffer: Arc<BlockBuffer>,
    run_control: Arc<RunControl>,
}

impl StopControl {
    /// Abort everything in flight: planner waits, dispatch hand-off and the coprocessor queue.
    fn stop_now(&self) -> Result<(), RunStateError> {
        self.stop.store(true, Ordering::Release);
        self.gate.on();
        self.queue.flush();
        self.buffer.notify();
        let dropped = self.buffer.clear_pending();
        match self.run_control.state()? {
            RunState::Print | RunState::Pause | RunState::Resume => self.run_control.stop()?,
            state => tracing::debug!("Stop in {} state leaves the coprocessor alone", state),
        }
        tracing::warn!("Motion stopped, {} planned blocks dropped", dropped);
        Ok(())
    }
}

/// Cloneable handle that can stop motion from another thread or a signal handler.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<StopControl>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), RunStateError> {
        self.control.stop_now()
    }
}

pub struct MotionHost {
    config: Config,
    kinematics: Arc<dyn Kinematics>,
    planner: Mutex<Planner>,
    backend: Arc<dyn MotionBackend>,
    region: Arc<SharedRegion>,
    control: Arc<StopControl>,
    shutdown: Arc<AtomicBool>,
    dispatched: Arc<AtomicU64>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MotionHost {
    /// Build the pipeline over `region` and start the dispatch thread.
    ///
    /// `wake` is raised by the coprocessor whenever it frees a slot.
    pub fn new(
        config: &Config,
        region: Arc<SharedRegion>,
        wake: Option<Receiver<()>>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        if region.slots() != config.coprocessor.ring_slots {
            return Err(ConfigError::Invalid(format!(
                "coprocessor.ring_slots is {} but the shared region has {} slots",
                config.coprocessor.ring_slots,
                region.slots()
            ))
            .into());
        }

        let kinematic_config = KinematicConfig::from_config(config);
        let kinematics: Arc<dyn Kinematics> = Arc::from(create_kinematics(&kinematic_config));
        let stop = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(BlockBuffer::new(kinematic_config.block_buffer_size, stop.clone()));
        let queue = BlockQueue::new(buffer.capacity());
        let gate = Arc::new(PauseGate::new());

        let mut link = CoprocessorLink::new(region.clone(), stop.clone());
        if let Some(wake) = wake {
            link = link.with_wake(wake);
        }
        link.initialize(config);
        let backend: Arc<dyn MotionBackend> = Arc::new(link);

        let mut planner = Planner::new(kinematic_config, kinematics.clone(), buffer.clone())
            .with_release(queue.clone());
        planner.set_position(motors_to_position_mm(
            kinematics.as_ref(),
            &region.position(),
            &config.axes.steps_per_unit,
        )?)?;

        let dispatcher = Dispatcher::new(
            buffer.clone(),
            queue.clone(),
            backend.clone(),
            gate.clone(),
            DispatchSettings::from_config(config),
            shutdown.clone(),
        );
        let dispatched = dispatcher.dispatched();
        let thread = dispatcher.spawn().map_err(HostError::ThreadSpawn)?;

        let run_control = Arc::new(RunControl::new(config, region.clone(), kinematics.clone()));
        tracing::info!(
            "Motion host ready: {:?} kinematics, {} planner blocks, {} coprocessor slots",
            config.printer.kinematics,
            buffer.capacity(),
            region.slots()
        );

        Ok(Self {
            config: config.clone(),
            kinematics,
            planner: Mutex::new(planner),
            backend,
            region,
            control: Arc::new(StopControl {
                stop,
                gate,
                queue,
                buffer,
                run_control,
            }),
            shutdown,
            dispatched,
            dispatcher: Mutex::new(Some(thread)),
        })
    }

    fn planner(&self) -> MutexGuard<'_, Planner> {
        self.planner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.control.stop.load(Ordering::Acquire)
    }

    /// Plan a move to the absolute position `(x, y, z, e)` in mm at `feed_rate` mm/s.
    ///
    /// Returns `false` when the move was dropped as too short, or when motion
    /// is stopped and not yet restarted.
    pub fn enqueue_move(
        &self,
        x: f64,
        y: f64,
        z: f64,
        e: f64,
        feed_rate: f64,
        extruder: u8,
    ) -> Result<bool, HostError> {
        if self.is_stopped() {
            tracing::debug!("Move rejected while stopped");
            return Ok(false);
        }
        match self.planner().enqueue_move([x, y, z, e], feed_rate, extruder) {
            Ok(queued) => Ok(queued),
            Err(MotionError::Cancelled) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Queue a non-motion command that executes in order with the moves.
    pub fn enqueue_command(&self, code: u32) -> Result<bool, HostError> {
        if self.is_stopped() {
            return Ok(false);
        }
        match self.planner().enqueue_command(code) {
            Err(MotionError::Cancelled) => Ok(false),
            other => Ok(other?),
        }
    }

    pub fn set_position(&self, x: f64, y: f64, z: f64, e: f64) -> Result<(), HostError> {
        Ok(self.planner().set_position([x, y, z, e])?)
    }

    /// Blocks buffered in the planner plus records pending on the coprocessor.
    pub fn queue_depth(&self) -> usize {
        self.control.buffer.occupancy() + self.backend.queue_depth()
    }

    fn is_drained(&self) -> bool {
        self.control.buffer.occupancy() == 0
            && self.control.queue.is_empty()
            && self.backend.is_drained()
    }

    /// Block until every planned move has executed, or until a stop.
    ///
    /// Returns `true` when the pipeline drained.
    pub fn sync(&self) -> bool {
        let backoff = Backoff::default();
        let mut delay = backoff.min;
        loop {
            if self.is_drained() {
                return true;
            }
            if self.is_stopped() || self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(delay);
            delay = backoff.next(delay);
        }
    }

    /// Absolute position tracked by the coprocessor, in mm.
    pub fn position(&self) -> Result<[f64; NUM_AXES], HostError> {
        Ok(motors_to_position_mm(
            self.kinematics.as_ref(),
            &self.region.position(),
            &self.config.axes.steps_per_unit,
        )?)
    }

    pub fn run_state(&self) -> Result<RunState, HostError> {
        Ok(self.control.run_control.state()?)
    }

    /// Home the masked axes and wait for the coprocessor to finish.
    pub fn home(&self, axes: u8) -> Result<(), HostError> {
        self.control.run_control.home(axes)?;
        self.control.run_control.wait_for(RunState::Idle, &self.shutdown)?;
        self.resync_planner()?;
        Ok(())
    }

    fn resync_planner(&self) -> Result<(), HostError> {
        let position = self.position()?;
        self.planner().set_position(position)?;
        Ok(())
    }

    /// Start printing from IDLE or continue from PAUSE.
    ///
    /// After a stop the pipeline is re-armed first and the planner picks up
    /// from wherever the coprocessor ended.
    pub fn start(&self) -> Result<(), HostError> {
        if self.is_stopped() {
            self.rearm()?;
        }
        self.control.run_control.start()?;
        self.control.gate.off();
        Ok(())
    }

    fn rearm(&self) -> Result<(), HostError> {
        let control = &self.control;
        if control.run_control.state()? == RunState::Stop {
            control.run_control.wait_for(RunState::Idle, &self.shutdown)?;
        }
        // The dispatch thread must be parked with no block in hand.
        let backoff = Backoff::default();
        let mut delay = backoff.min;
        loop {
            control.buffer.clear_pending();
            if control.buffer.occupancy() == 0 && control.gate.waiting() > 0 {
                break;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            std::thread::sleep(delay);
            delay = backoff.next(delay);
        }
        let stale = control.queue.drain().len();
        control.queue.clear_flush();
        self.backend.discard_pending()?;
        control.stop.store(false, Ordering::Release);
        self.resync_planner()?;
        tracing::info!("Motion re-armed after stop ({} stale slots dropped)", stale);
        Ok(())
    }

    /// Snapshot the position and park the coprocessor; dispatch is held.
    pub fn pause(&self) -> Result<(), HostError> {
        self.control.run_control.pause()?;
        self.control.gate.on();
        Ok(())
    }

    pub fn resume(&self) -> Result<(), HostError> {
        self.control.run_control.resume()?;
        self.control.gate.off();
        Ok(())
    }

    /// Stop motion.
    ///
    /// A blocking stop while printing lets the queued moves finish first.
    pub fn stop(&self, blocking: bool) -> Result<(), HostError> {
        if blocking && self.run_state()? == RunState::Print {
            self.sync();
        }
        self.control.stop_now()?;
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control.clone(),
        }
    }

    pub fn load_filament(&self, command: FilamentCommand) -> Result<(), HostError> {
        Ok(self.control.run_control.load_filament(command)?)
    }

    pub fn unload_filament(&self, command: FilamentCommand) -> Result<(), HostError> {
        Ok(self.control.run_control.unload_filament(command)?)
    }

    pub fn test_mode(&self, enable: bool) -> Result<(), HostError> {
        Ok(self.control.run_control.test_mode(enable)?)
    }

    pub fn status(&self) -> Result<HostStatus, HostError> {
        Ok(HostStatus {
            run_state: self.run_state()?,
            position_mm: self.position()?,
            planner_position_mm: self.planner().position_mm(),
            planner_blocks: self.control.buffer.occupancy(),
            coprocessor_pending: self.backend.queue_depth(),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            mcode_count: self.region.mcode_count(),
            stopped: self.is_stopped(),
        })
    }

    /// Drain (when printing), stop the dispatch thread and send EXIT.
    pub fn shutdown(&self) -> Result<(), HostError> {
        let Some(thread) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        if self.run_state()? == RunState::Print && !self.is_stopped() {
            self.sync();
        }
        if !self.is_drained() {
            self.control.stop_now()?;
        }

        self.shutdown.store(true, Ordering::Release);
        self.control.gate.off();
        self.control.queue.flush();
        self.control.buffer.notify();
        if thread.join().is_err() {
            tracing::error!("Dispatch thread panicked");
        }

        if self.run_state()? == RunState::Stop {
            let never = AtomicBool::new(false);
            self.control.run_control.wait_for(RunState::Idle, &never)?;
        }
        if !self.backend.is_drained() {
            self.backend.discard_pending()?;
        }
        self.backend.shutdown()?;
        tracing::info!("Motion host shut down");
        Ok(())
    }
}

impl std::fmt::Debug for MotionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionHost")
            .field("kinematics", &self.kinematics.kind())
            .field("planner_blocks", &self.control.buffer.occupancy())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

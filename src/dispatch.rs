// src/dispatch.rs - turns planned blocks into coprocessor queue records
//! The dispatch thread pops released slots from the [`BlockQueue`], marks the
//! block busy, translates it into a [`QueueRecord`] and hands it to the
//! [`MotionBackend`]. The block is retired once the backend accepted it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use stepcore_shared::config::Config;
use stepcore_shared::layout::{QueueRecord, RecordKind, DUAL_MOTOR_BIT, EXTRUDER_SLOTS};

use crate::coprocessor::{BackendError, MotionBackend};
use crate::motion::planner::{Block, BlockBuffer, BlockKind};
use crate::motion::{E_AXIS, MINIMUM_STEP_RATE};
use crate::pipeline::{BlockQueue, PauseGate, QueueError};

const FLUSH_IDLE: Duration = Duration::from_millis(1);

/// Extruder direction byte with the direction bit set in every extruder slot.
const ALL_EXTRUDERS_REVERSE: u8 = (1 << EXTRUDER_SLOTS) - 1;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub invert_mask: u8,
    pub clock_hz: u32,
    pub dual_motor: bool,
    pub auto_slowdown: bool,
    pub warmup_blocks: u32,
    /// Fraction of the backend capacity below which rates are scaled.
    pub slowdown_threshold: f64,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            invert_mask: config.invert_dir_mask(),
            clock_hz: config.coprocessor.clock_hz,
            dual_motor: config.coprocessor.dual_motor,
            auto_slowdown: config.dispatch.auto_slowdown,
            warmup_blocks: config.dispatch.warmup_blocks,
            slowdown_threshold: config.dispatch.slowdown_threshold,
        }
    }
}

fn step_delay(clock_hz: u32, rate: u32) -> u32 {
    clock_hz / rate.max(1)
}

fn ramp_increment(from_delay: u32, to_delay: u32, steps: u32) -> u32 {
    if steps == 0 {
        return 0;
    }
    from_delay.saturating_sub(to_delay) / steps
}

/// Translate one planned block into the coprocessor record format.
pub fn translate(block: &Block, settings: &DispatchSettings) -> QueueRecord {
    let code = match block.kind {
        BlockKind::Command(code) => return QueueRecord::command(code),
        BlockKind::Move => 0,
    };

    let accel_steps = block.accelerate_until;
    let (cruise_steps, decel_steps) = if block.final_rate == block.nominal_rate {
        (block.step_event_count - block.accelerate_until, 0)
    } else {
        (block.cruise_steps(), block.decelerate_steps())
    };

    let entry_delay = step_delay(settings.clock_hz, block.initial_rate);
    let cruise_delay = step_delay(settings.clock_hz, block.nominal_rate);
    let exit_delay = step_delay(settings.clock_hz, block.final_rate);

    let direction = block.direction_bits ^ settings.invert_mask;
    let extruder_select = if settings.dual_motor {
        DUAL_MOTOR_BIT
    } else {
        1 << (usize::from(block.active_extruder) % EXTRUDER_SLOTS)
    };
    let extruder_direction = if direction & (1 << E_AXIS) != 0 {
        ALL_EXTRUDERS_REVERSE
    } else {
        0
    };

    QueueRecord {
        kind: RecordKind::Move,
        direction,
        extruder_select,
        extruder_direction,
        steps: block.steps,
        accel_steps,
        cruise_steps,
        decel_steps,
        entry_delay,
        cruise_delay,
        exit_delay,
        accel_increment: ramp_increment(entry_delay, cruise_delay, accel_steps),
        decel_increment: ramp_increment(exit_delay, cruise_delay, decel_steps),
        command: code,
    }
}

/// Scale a block's rates down while the backend queue is running dry.
///
/// Returns the factor applied; `1.0` when nothing changed.
pub fn apply_auto_slowdown(block: &mut Block, depth: usize, capacity: usize, threshold: f64) -> f64 {
    let threshold_slots = threshold * capacity as f64;
    if threshold_slots <= 0.0 || depth as f64 >= threshold_slots {
        return 1.0;
    }
    let scale = (depth as f64 / threshold_slots).max(0.1);
    let scaled = |rate: u32| ((f64::from(rate) * scale) as u32).max(MINIMUM_STEP_RATE);
    block.initial_rate = scaled(block.initial_rate);
    block.nominal_rate = scaled(block.nominal_rate);
    block.final_rate = scaled(block.final_rate);
    scale
}

/// Dispatch context: owns everything the dispatch thread touches.
pub struct Dispatcher {
    buffer: Arc<BlockBuffer>,
    queue: BlockQueue<usize>,
    backend: Arc<dyn MotionBackend>,
    gate: Arc<PauseGate>,
    settings: DispatchSettings,
    shutdown: Arc<AtomicBool>,
    dispatched: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        buffer: Arc<BlockBuffer>,
        queue: BlockQueue<usize>,
        backend: Arc<dyn MotionBackend>,
        gate: Arc<PauseGate>,
        settings: DispatchSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            buffer,
            queue,
            backend,
            gate,
            settings,
            shutdown,
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of blocks handed to the backend.
    pub fn dispatched(&self) -> Arc<AtomicU64> {
        self.dispatched.clone()
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("stepcore-dispatch".to_string())
            .spawn(move || self.run())
    }

    /// Run until the queue is flushed with the shutdown flag raised.
    pub fn run(&self) {
        tracing::info!("Dispatch thread started");
        loop {
            self.gate.test();
            match self.queue.recv() {
                Ok(slot) => {
                    // The gate may have closed while this thread sat in recv.
                    self.gate.test();
                    self.dispatch(slot);
                }
                Err(QueueError::Flushed) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(FLUSH_IDLE);
                }
                Err(QueueError::Disconnected) => break,
            }
        }
        tracing::info!(
            "Dispatch thread exiting after {} blocks",
            self.dispatched.load(Ordering::Relaxed)
        );
    }

    fn dispatch(&self, slot: usize) {
        let Some(mut block) = self.buffer.begin(slot) else {
            tracing::debug!("Slot {} was cleared before dispatch", slot);
            return;
        };

        let dispatched = self.dispatched.load(Ordering::Relaxed);
        if self.settings.auto_slowdown
            && block.is_move()
            && dispatched >= u64::from(self.settings.warmup_blocks)
        {
            let scale = apply_auto_slowdown(
                &mut block,
                self.backend.queue_depth(),
                self.backend.capacity(),
                self.settings.slowdown_threshold,
            );
            if scale < 1.0 {
                tracing::debug!("Coprocessor queue low, rates scaled by {:.2}", scale);
            }
        }

        let record = translate(&block, &self.settings);
        match self.backend.push(&record) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dispatched slot {} ({} steps)", slot, record.total_steps());
            }
            Err(BackendError::Cancelled) => {
                tracing::debug!("Hand-off of slot {} cancelled by stop", slot);
            }
            Err(e) => {
                tracing::error!("Failed to hand slot {} to the coprocessor: {}", slot, e);
            }
        }
        self.buffer.retire(slot);
    }
}

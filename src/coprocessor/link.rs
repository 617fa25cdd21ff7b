//! Producer half of the shared ring protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use stepcore_shared::config::Config;
use stepcore_shared::layout::{QueueRecord, RECORD_SIZE, SlotState};
use stepcore_shared::region::SharedRegion;
use stepcore_shared::run_state::RunState;

use super::{BackendError, MotionBackend};

/// Bounded exponential back-off used while polling the coprocessor.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_micros(20),
            max: Duration::from_millis(1),
        }
    }
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

pub struct CoprocessorLink {
    region: Arc<SharedRegion>,
    cancel: Arc<AtomicBool>,
    /// Raised by the coprocessor after it frees a slot.
    wake: Option<Receiver<()>>,
    backoff: Backoff,
}

impl CoprocessorLink {
    pub fn new(region: Arc<SharedRegion>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            region,
            cancel,
            wake: None,
            backoff: Backoff::default(),
        }
    }

    pub fn with_wake(mut self, wake: Receiver<()>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Write the static control fields before the first record.
    pub fn initialize(&self, config: &Config) {
        self.region.set_endstop_invert(config.endstop_invert_mask());
        self.region.set_dual_motor(config.coprocessor.dual_motor);
        self.region.set_board_flags(config.coprocessor.board_flags);
        self.region.set_run_state(RunState::Idle);
        tracing::info!(
            "Coprocessor link ready: {} slots of {} bytes, region {} bytes",
            self.region.slots(),
            RECORD_SIZE,
            self.region.size()
        );
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    fn write_slot(&self) -> usize {
        self.region.write_cursor() as usize / RECORD_SIZE % self.region.slots()
    }

    /// Sleep for up to `delay`, returning early when the coprocessor signals.
    fn idle(&self, delay: Duration) {
        match &self.wake {
            Some(wake) => match wake.recv_timeout(delay) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(delay),
            },
            None => std::thread::sleep(delay),
        }
    }

    fn wait_for_empty(&self, slot: usize, cancellable: bool) -> Result<(), BackendError> {
        let mut delay = self.backoff.min;
        loop {
            if cancellable && self.cancel.load(Ordering::Acquire) {
                return Err(BackendError::Cancelled);
            }
            if self.region.slot_state(slot)? == SlotState::Empty {
                return Ok(());
            }
            self.idle(delay);
            delay = self.backoff.next(delay);
        }
    }

    fn publish(
        &self,
        record: &QueueRecord,
        state: SlotState,
        cancellable: bool,
    ) -> Result<(), BackendError> {
        let slot = self.write_slot();
        self.wait_for_empty(slot, cancellable)?;
        self.region.publish_slot(slot, record, state)?;
        let ring_bytes = self.region.slots() * RECORD_SIZE;
        let next = (slot * RECORD_SIZE + RECORD_SIZE) % ring_bytes;
        self.region.set_write_cursor(next as u32);
        tracing::trace!("Published {:?} record into slot {}", state, slot);
        Ok(())
    }
}

impl MotionBackend for CoprocessorLink {
    fn push(&self, record: &QueueRecord) -> Result<(), BackendError> {
        self.publish(record, SlotState::Filled, true)
    }

    fn queue_depth(&self) -> usize {
        let slots = self.region.slots();
        let ring_bytes = slots * RECORD_SIZE;
        let write = self.region.write_cursor() as usize % ring_bytes;
        let read = self.region.read_cursor() as usize % ring_bytes;
        let pending = (write + ring_bytes - read) % ring_bytes / RECORD_SIZE;
        if pending == 0 && self.region.slot_state(write / RECORD_SIZE) == Ok(SlotState::Filled) {
            return slots;
        }
        pending
    }

    fn capacity(&self) -> usize {
        self.region.slots()
    }

    fn discard_pending(&self) -> Result<usize, BackendError> {
        let slots = self.region.slots();
        let mut discarded = 0;
        while discarded < slots {
            let slot = self.region.read_cursor() as usize / RECORD_SIZE % slots;
            if self.region.slot_state(slot)? != SlotState::Filled {
                break;
            }
            self.region.release_slot(slot)?;
            self.region.set_read_cursor(((slot + 1) % slots * RECORD_SIZE) as u32);
            discarded += 1;
        }
        if discarded > 0 {
            tracing::info!("Discarded {} unexecuted records", discarded);
        }
        Ok(discarded)
    }

    /// The EXIT record is written even after a stop.
    fn shutdown(&self) -> Result<(), BackendError> {
        tracing::info!("Sending EXIT to coprocessor");
        self.publish(&QueueRecord::default(), SlotState::Exit, false)
    }
}

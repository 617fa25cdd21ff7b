use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Level-triggered gate: `test()` blocks while the gate is on.
#[derive(Debug, Default)]
pub struct PauseGate {
    on: Mutex<bool>,
    changed: Condvar,
    waiting: AtomicUsize,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn test(&self) {
        let mut on = self.on.lock().unwrap_or_else(PoisonError::into_inner);
        if !*on {
            return;
        }
        self.waiting.fetch_add(1, Ordering::AcqRel);
        while *on {
            on = self.changed.wait(on).unwrap_or_else(PoisonError::into_inner);
        }
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn on(&self) {
        *self.on.lock().unwrap_or_else(PoisonError::into_inner) = true;
        tracing::debug!("Pause gate closed");
    }

    /// Open the gate and wake every waiter.
    pub fn off(&self) {
        *self.on.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.changed.notify_all();
        tracing::debug!("Pause gate opened");
    }

    /// Threads currently parked in [`PauseGate::test`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

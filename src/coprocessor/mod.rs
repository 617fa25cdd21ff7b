// src/coprocessor/mod.rs - execution backend behind the dispatch thread
//! The dispatch thread hands translated records to a [`MotionBackend`]. The
//! production backend is [`CoprocessorLink`], which writes them into the ring
//! shared with the coprocessor; tests plug in recording doubles.

pub mod link;
pub mod run_control;

pub use link::{Backoff, CoprocessorLink};
pub use run_control::{FilamentCommand, RunControl, RunStateError};

use stepcore_shared::layout::{LayoutError, QueueRecord};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("hand-off cancelled by stop")]
    Cancelled,
    #[error("shared region error: {0}")]
    Layout(#[from] LayoutError),
}

pub trait MotionBackend: Send + Sync {
    /// Queue one record, blocking while the backend is full.
    fn push(&self, record: &QueueRecord) -> Result<(), BackendError>;

    /// Records handed over but not yet executed.
    fn queue_depth(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_drained(&self) -> bool {
        self.queue_depth() == 0
    }

    /// Drop records that were handed over but never executed.
    ///
    /// Only valid while the consumer is not running, e.g. after a stop.
    fn discard_pending(&self) -> Result<usize, BackendError>;

    /// Tell the consumer to exit once it reaches this point of the queue.
    fn shutdown(&self) -> Result<(), BackendError>;
}

//! Session mode, abort signalling and per-record models

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What the user asked this sync session to do with patient data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Upload copies; everything stays on the device
    Copy,
    /// Move all data off the device
    Move,
    /// Move task data off the device but keep patient records
    KeepPatientsAndMove,
}

impl SessionMode {
    /// Moving modes ask the server to preserve (finalize) uploaded records
    #[must_use]
    pub const fn is_finalizing(self) -> bool {
        !matches!(self, Self::Copy)
    }
}

/// Cross-thread abort request, set by the UI and observed by the engine.
///
/// Honored at state boundaries and between recordwise sends; an in-flight
/// request is left to complete or fail on its own.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One completed-task row as the sync subsystem sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Table this record belongs to
    pub table: String,
    /// Primary key within that table
    pub pk: i64,
    /// Owning patient, or `None` for anonymous tasks
    pub patient_pk: Option<i64>,
    /// Delete locally once the server has durably accepted it
    pub move_off_device: bool,
}

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const STOP_NONE: u8 = 0;
const STOP_SHUTDOWN: u8 = 1;
const STOP_COMPLETE: u8 = 2;
const STOP_FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    Complete,
    Failed,
}

/// Broadcast-once stop signal shared by every fetcher and the coordinator.
/// Polled at read/retry boundaries, never blocked on.
#[derive(Clone, Default)]
pub struct CancelToken {
    reason: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. The first stop reason wins; calling this after the
    /// run has already completed or failed is a no-op.
    pub fn shutdown(&self) {
        let _ = self.reason.compare_exchange(
            STOP_NONE,
            STOP_SHUTDOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn complete(&self) {
        let _ = self.reason.compare_exchange(
            STOP_NONE,
            STOP_COMPLETE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn fail(&self) {
        let _ = self.reason.compare_exchange(
            STOP_NONE,
            STOP_FAILED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn should_stop(&self) -> bool {
        self.reason.load(Ordering::SeqCst) != STOP_NONE
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            STOP_SHUTDOWN => Some(StopReason::Shutdown),
            STOP_COMPLETE => Some(StopReason::Complete),
            STOP_FAILED => Some(StopReason::Failed),
            _ => None,
        }
    }
}

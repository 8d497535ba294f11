pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod net;
pub mod plan;
pub mod progress;
pub mod store;
pub mod verify;

#[cfg(test)]
mod tests;

pub use crate::cancel::{CancelToken, StopReason};
pub use crate::config::TransferConfig;
pub use crate::coordinator::{
    ResumePolicy, ResumePrompt, TransferCoordinator, TransferOutcome, TransferReport,
    TransferRequest,
};
pub use crate::error::{CoreError, CoreResult};
pub use crate::plan::TransferTarget;
pub use crate::progress::{Phase, ProgressSink, ProgressSnapshot};
pub use crate::store::{filename_from_url, sanitize_filename, SegmentStore};

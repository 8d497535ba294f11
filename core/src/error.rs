use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("segment {index} failed after {attempts} attempts: {reason}")]
    SegmentFetch {
        index: u32,
        attempts: u32,
        reason: String,
    },
    #[error("segment file missing before merge: {0}")]
    IncompleteSegmentSet(PathBuf),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error(
        "merged size {actual} matches neither probed size {probed} nor assembled size {assembled}"
    )]
    IntegrityMismatch {
        actual: u64,
        probed: u64,
        assembled: u64,
    },
    #[error("transfer incomplete: {downloaded} of {total} bytes")]
    Incomplete { downloaded: u64, total: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

use std::path::PathBuf;

/// Hard cap on concurrent segment fetchers regardless of configuration.
pub const MAX_THREADS: u32 = 16;

/// What a single run downloads, fixed by the initial HEAD probe.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub url: String,
    pub dest_path: PathBuf,
    pub total_bytes: u64,
    pub accept_ranges: bool,
}

/// One contiguous byte range of the target resource. `end == None` marks the
/// open-ended tail segment, which streams until the connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    pub end: Option<u64>,
    pub resume_offset: u64,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: Option<u64>) -> Self {
        Self {
            index,
            start,
            end,
            resume_offset: 0,
        }
    }

    /// Planned byte count, or `None` for the open tail.
    pub fn planned_size(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Splits `[0, total_bytes)` into `threads` ranges. Bounded segments all have
/// length `total_bytes / threads`; the last segment is left open so the
/// integer-division remainder is absorbed by whatever the server sends.
///
/// Servers without range support, and resources below `small_threshold`, get
/// a single open segment.
pub fn build_plan(
    total_bytes: u64,
    accept_ranges: bool,
    threads: u32,
    small_threshold: u64,
) -> Vec<Segment> {
    let threads = threads.clamp(1, MAX_THREADS);
    if !accept_ranges || threads == 1 || total_bytes < small_threshold {
        return vec![Segment::new(0, 0, None)];
    }

    let chunk = total_bytes / threads as u64;
    if chunk == 0 {
        return vec![Segment::new(0, 0, None)];
    }

    let mut segments = Vec::with_capacity(threads as usize);
    for index in 0..threads {
        let start = index as u64 * chunk;
        let end = if index == threads - 1 {
            None
        } else {
            Some(start + chunk - 1)
        };
        segments.push(Segment::new(index, start, end));
    }
    segments
}

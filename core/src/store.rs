use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;
use url::Url;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_FILENAME: &str = "download";
const ERROR_LOG: &str = "error.log";

pub fn filename_from_url(url: &str) -> String {
    let name = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed.path_segments().and_then(|segments| {
                segments
                    .rev()
                    .find(|segment| !segment.is_empty())
                    .map(str::to_string)
            })
        })
        .unwrap_or_default();
    if name.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        name
    }
}

/// Strips the name down to alphanumerics, `-`, `_` and `.` so the temp
/// directory derived from it is the same on every run.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .collect();
    if sanitized.chars().all(|ch| ch == '.') {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// On-disk home of a single transfer's segment files: a hidden directory next
/// to the destination, one `chunk_{index}` file per segment, plus an
/// append-only error log.
pub struct SegmentStore {
    temp_dir: PathBuf,
}

impl SegmentStore {
    /// Deterministic: the same destination and filename always map to the
    /// same directory, which is what makes resume possible.
    pub fn resolve(download_dir: &Path, filename: &str) -> Self {
        let name = sanitize_filename(filename);
        Self {
            temp_dir: download_dir.join(format!(".{}.parts", name)),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.temp_dir.join(format!("chunk_{}", index))
    }

    pub fn ensure(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.temp_dir).map_err(|err| CoreError::Io(err.to_string()))
    }

    /// Resume offsets for `segment_count` segments, or `None` unless every
    /// expected file exists. A partial set is unusable: the plan that wrote
    /// it may have used a different thread count.
    pub fn inspect(&self, segment_count: u32) -> Option<Vec<u64>> {
        if !self.temp_dir.is_dir() {
            return None;
        }
        let mut offsets = Vec::with_capacity(segment_count as usize);
        for index in 0..segment_count {
            match fs::metadata(self.segment_path(index)) {
                Ok(meta) => offsets.push(meta.len()),
                Err(_) => return None,
            }
        }
        Some(offsets)
    }

    /// Deletes all segment state. Failure is not fatal (the directory may be
    /// held open elsewhere) but is logged.
    pub fn reset(&self) {
        if !self.temp_dir.exists() {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.temp_dir) {
            warn!(dir = %self.temp_dir.display(), error = %err, "failed to remove segment state");
            self.log_error(&format!("cleanup failed: {}", err));
        }
    }

    pub fn log_error(&self, message: &str) {
        let path = self.temp_dir.join(ERROR_LOG);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "[{}] {}", now_epoch(), message);
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::progress::RunProgress;
use crate::store::SegmentStore;

const COPY_BUFFER: usize = 64 * 1024;
#[cfg(target_os = "linux")]
const FAST_COPY_CHUNK: u64 = 8 * 1024 * 1024;

/// Concatenates segment files into the destination, strictly in index order.
/// Any prior destination file is removed first.
pub fn merge_segments(
    paths: &[PathBuf],
    dest: &Path,
    expected_total: u64,
    progress: &RunProgress,
    store: &SegmentStore,
) -> CoreResult<u64> {
    match merge_inner(paths, dest, expected_total, progress) {
        Ok(merged) => Ok(merged),
        Err(err) => {
            store.log_error(&format!("merge failed: {}", err));
            Err(err)
        }
    }
}

fn merge_inner(
    paths: &[PathBuf],
    dest: &Path,
    expected_total: u64,
    progress: &RunProgress,
) -> CoreResult<u64> {
    if dest.exists() {
        fs::remove_file(dest)
            .map_err(|err| CoreError::Merge(format!("cannot remove stale output: {}", err)))?;
    }
    let mut out = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(dest)
        .map_err(|err| CoreError::Merge(err.to_string()))?;

    let mut merged = 0u64;
    for path in paths {
        let mut input = File::open(path)
            .map_err(|err| CoreError::Merge(format!("{}: {}", path.display(), err)))?;
        let len = input
            .metadata()
            .map_err(|err| CoreError::Merge(err.to_string()))?
            .len();
        merged += append_segment(&mut input, &mut out, len, merged, expected_total, progress)?;
    }

    report_merge(progress, merged, expected_total);
    Ok(merged)
}

fn append_segment(
    input: &mut File,
    out: &mut File,
    len: u64,
    base: u64,
    expected_total: u64,
    progress: &RunProgress,
) -> CoreResult<u64> {
    #[cfg(target_os = "linux")]
    let mut copied = fast_copy(&*input, &*out, len, base, expected_total, progress)
        .map_err(|err| CoreError::Merge(err.to_string()))?;
    #[cfg(not(target_os = "linux"))]
    let mut copied = 0u64;

    if copied < len {
        let mut buffer = vec![0u8; COPY_BUFFER];
        loop {
            let read = input
                .read(&mut buffer)
                .map_err(|err| CoreError::Merge(err.to_string()))?;
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read])
                .map_err(|err| CoreError::Merge(err.to_string()))?;
            copied += read as u64;
            report_merge(progress, base + copied, expected_total);
        }
    }
    Ok(copied)
}

/// In-kernel concatenation via copy_file_range. Returns 0 (without consuming
/// any input) when the filesystem cannot do it, so the caller falls back to
/// the buffered path.
#[cfg(target_os = "linux")]
fn fast_copy(
    input: &File,
    out: &File,
    len: u64,
    base: u64,
    expected_total: u64,
    progress: &RunProgress,
) -> std::io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    let mut copied = 0u64;
    while copied < len {
        let want = (len - copied).min(FAST_COPY_CHUNK) as usize;
        let rc = unsafe {
            libc::copy_file_range(
                input.as_raw_fd(),
                std::ptr::null_mut(),
                out.as_raw_fd(),
                std::ptr::null_mut(),
                want,
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            let fallback = matches!(
                err.raw_os_error(),
                Some(libc::EINVAL) | Some(libc::EXDEV) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
            );
            if copied == 0 && fallback {
                debug!("copy_file_range unavailable, using buffered copy");
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            break;
        }
        copied += rc as u64;
        report_merge(progress, base + copied, expected_total);
    }
    Ok(copied)
}

fn report_merge(progress: &RunProgress, merged: u64, expected_total: u64) {
    let percent = if expected_total > 0 {
        merged as f64 / expected_total as f64 * 100.0
    } else {
        100.0
    };
    progress.set_merged_percent(percent);
}

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{DownloadRequest, NetClient, HTTP_RANGE_NOT_SATISFIABLE};
use crate::plan::Segment;
use crate::progress::RunProgress;

/// Downloads one segment to its own file, retrying transient failures up to
/// the configured cap.
#[allow(clippy::too_many_arguments)]
pub fn fetch_segment(
    net: &dyn NetClient,
    url: &str,
    auth: Option<&(String, String)>,
    segment: &Segment,
    path: &Path,
    progress: &RunProgress,
    token: &CancelToken,
    config: &TransferConfig,
) -> CoreResult<()> {
    let delay = Duration::from_secs(config.retry_delay_secs);
    let mut last_error: Option<CoreError> = None;

    for attempt in 0..=config.retry_count {
        if token.should_stop() {
            return Ok(());
        }
        match fetch_attempt(net, url, auth, segment, path, progress, token, config) {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(segment = segment.index, attempt, error = %err, "segment attempt failed");
                last_error = Some(err);
            }
        }
        if attempt < config.retry_count {
            sleep_polling(token, delay);
        }
    }

    progress.add_error();
    Err(CoreError::SegmentFetch {
        index: segment.index,
        attempts: config.retry_count + 1,
        reason: last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}

#[allow(clippy::too_many_arguments)]
fn fetch_attempt(
    net: &dyn NetClient,
    url: &str,
    auth: Option<&(String, String)>,
    segment: &Segment,
    path: &Path,
    progress: &RunProgress,
    token: &CancelToken,
    config: &TransferConfig,
) -> CoreResult<()> {
    let on_disk = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    let planned = segment.planned_size();

    if let Some(planned) = planned {
        if on_disk >= planned {
            return Ok(());
        }
    }

    let mut req = DownloadRequest::new(url).with_range(segment.start + on_disk, segment.end);
    if let Some((user, pass)) = auth {
        req = req.with_basic_auth(user.clone(), pass.clone());
    }

    let stream = net.get_stream(&req)?;

    if stream.status == HTTP_RANGE_NOT_SATISFIABLE {
        // Nothing left for this range; credit unseen planned bytes once.
        if let Some(planned) = planned {
            if on_disk < planned {
                progress.credit_bytes(planned - on_disk);
            }
        }
        return Ok(());
    }
    if !(200..300).contains(&stream.status) {
        return Err(CoreError::Network(format!(
            "segment {} request returned status {}",
            segment.index, stream.status
        )));
    }
    // A server that ignores the range and replays from byte zero would
    // corrupt the append; shifted reads must get a partial-content reply.
    if segment.start + on_disk > 0 && stream.status != 206 {
        return Err(CoreError::Network(format!(
            "segment {} expected partial content, got status {}",
            segment.index, stream.status
        )));
    }

    let mut file = if on_disk > 0 {
        OpenOptions::new().append(true).open(path)
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
    }
    .map_err(|err| CoreError::Io(err.to_string()))?;

    let mut body = stream.body;
    let mut buffer = vec![0u8; config.buffer_size];
    let mut written = on_disk;

    loop {
        if token.should_stop() {
            return Ok(());
        }
        let mut want = buffer.len();
        if let Some(planned) = planned {
            let remaining = planned - written;
            if remaining == 0 {
                break;
            }
            want = want.min(remaining as usize);
        }
        let read = body
            .read(&mut buffer[..want])
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        written += read as u64;
        progress.add_bytes(read as u64);
    }

    if let Some(planned) = planned {
        if written < planned {
            return Err(CoreError::Network(format!(
                "segment {} ended early at {} of {} bytes",
                segment.index, written, planned
            )));
        }
    }
    Ok(())
}

/// Inter-retry delay that still notices shutdown promptly.
fn sleep_polling(token: &CancelToken, delay: Duration) {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline {
        if token.should_stop() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

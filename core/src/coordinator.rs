use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cancel::{CancelToken, StopReason};
use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};
use crate::fetch::fetch_segment;
use crate::merge::merge_segments;
use crate::net::{DownloadRequest, NetClient, ReqwestNetClient};
use crate::plan::{build_plan, Segment, TransferTarget};
use crate::progress::{Phase, ProgressSink, RunProgress};
use crate::store::{filename_from_url, sanitize_filename, SegmentStore};
use crate::verify::verify_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    Ask,
    Always,
    Never,
}

/// Consulted for `ResumePolicy::Ask` when resumable state exists. The CLI
/// backs this with a stdin prompt; tests answer directly.
pub trait ResumePrompt {
    fn should_resume(&self, filename: &str, resume_bytes: u64) -> bool;
}

/// Immutable inputs for one run, supplied by the caller up front.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub download_dir: PathBuf,
    pub resume: ResumePolicy,
    pub basic_auth: Option<(String, String)>,
    pub threads: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { dest_path: PathBuf },
    Interrupted { temp_dir: PathBuf },
}

#[derive(Debug)]
pub struct TransferReport {
    pub outcome: TransferOutcome,
    /// Includes bytes carried over from resumed state.
    pub bytes_downloaded: u64,
    /// Bytes actually streamed by this run.
    pub session_bytes: u64,
    pub elapsed: Duration,
}

pub struct TransferCoordinator {
    config: TransferConfig,
    net: Arc<dyn NetClient>,
    token: CancelToken,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig, token: CancelToken) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(
            &config.user_agent,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )?;
        Ok(Self {
            config,
            net: Arc::new(net),
            token,
        })
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = net;
        self
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// HEAD request establishing size and range support. Fatal when the size
    /// cannot be determined; nothing has touched the disk at that point.
    pub fn probe(&self, request: &TransferRequest) -> CoreResult<TransferTarget> {
        let mut req = DownloadRequest::new(request.url.clone());
        if let Some((user, pass)) = &request.basic_auth {
            req = req.with_basic_auth(user.clone(), pass.clone());
        }
        let resp = self.net.probe(&req)?;
        if !(200..400).contains(&resp.status_code) {
            return Err(CoreError::Probe(format!(
                "HEAD request returned status {}",
                resp.status_code
            )));
        }
        let total_bytes = resp.total_bytes.unwrap_or(0);
        if total_bytes == 0 {
            return Err(CoreError::Probe(
                "unable to determine file size".to_string(),
            ));
        }
        let filename = sanitize_filename(&filename_from_url(&request.url));
        Ok(TransferTarget {
            url: request.url.clone(),
            dest_path: request.download_dir.join(filename),
            total_bytes,
            accept_ranges: resp.accept_ranges,
        })
    }

    pub fn run(
        &self,
        request: &TransferRequest,
        sink: Arc<dyn ProgressSink>,
        prompt: &dyn ResumePrompt,
    ) -> CoreResult<TransferReport> {
        let started = Instant::now();
        fs::create_dir_all(&request.download_dir).map_err(|err| CoreError::Io(err.to_string()))?;

        let target = self.probe(request)?;
        info!(
            url = %target.url,
            total_bytes = target.total_bytes,
            accept_ranges = target.accept_ranges,
            "probed transfer target"
        );
        if !target.accept_ranges {
            warn!("server does not support range requests; using a single connection");
        }

        let threads = request.threads.unwrap_or(self.config.max_threads);
        let mut segments = build_plan(
            target.total_bytes,
            target.accept_ranges,
            threads,
            self.config.small_file_threshold,
        );

        let filename = sanitize_filename(&filename_from_url(&request.url));
        let store = SegmentStore::resolve(&request.download_dir, &filename);
        let resume_bytes = self.settle_resume(request, prompt, &store, &mut segments, &filename);
        store.ensure()?;

        let progress = Arc::new(RunProgress::new(
            target.total_bytes,
            segments.len() as u32,
            resume_bytes,
        ));
        info!(
            segments = segments.len(),
            resumed = resume_bytes > 0,
            resume_bytes,
            "starting transfer"
        );

        let reporter_stop = Arc::new(AtomicBool::new(false));
        let reporter = spawn_reporter(
            Arc::clone(&progress),
            Arc::clone(&sink),
            Arc::clone(&reporter_stop),
            Duration::from_millis(self.config.snapshot_interval_ms),
        );

        let errors: Arc<Mutex<Vec<CoreError>>> = Arc::new(Mutex::new(Vec::new()));
        let handles = self.spawn_fetchers(
            &target,
            request.basic_auth.as_ref(),
            &segments,
            &store,
            &progress,
            &errors,
        );

        loop {
            if self.token.should_stop() {
                break;
            }
            if progress.downloaded_bytes() >= target.total_bytes {
                self.token.complete();
                break;
            }
            if handles.iter().all(|handle| handle.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        self.join_fetchers(handles);

        let result = self.settle_outcome(&target, &segments, &store, &progress, &errors);

        reporter_stop.store(true, Ordering::SeqCst);
        let _ = reporter.join();
        let last = progress.snapshot();
        sink.update(&last);

        match result {
            Ok(outcome) => Ok(TransferReport {
                outcome,
                bytes_downloaded: last.downloaded_bytes,
                session_bytes: last.session_bytes,
                elapsed: started.elapsed(),
            }),
            Err(err) => {
                warn!(
                    temp_dir = %store.temp_dir().display(),
                    "segment state preserved; rerun the same command to resume"
                );
                Err(err)
            }
        }
    }

    /// All-or-nothing offsets from disk; declined or unusable state is wiped.
    fn settle_resume(
        &self,
        request: &TransferRequest,
        prompt: &dyn ResumePrompt,
        store: &SegmentStore,
        segments: &mut [Segment],
        filename: &str,
    ) -> u64 {
        let offsets = store.inspect(segments.len() as u32);
        let resume_total: u64 = offsets
            .as_ref()
            .map(|offsets| offsets.iter().sum())
            .unwrap_or(0);

        let resume = match request.resume {
            ResumePolicy::Always => resume_total > 0,
            ResumePolicy::Never => false,
            ResumePolicy::Ask => {
                resume_total > 0 && prompt.should_resume(filename, resume_total)
            }
        };
        if !resume {
            store.reset();
            return 0;
        }
        if let Some(offsets) = offsets {
            for (segment, offset) in segments.iter_mut().zip(offsets) {
                segment.resume_offset = offset;
            }
        }
        resume_total
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_fetchers(
        &self,
        target: &TransferTarget,
        auth: Option<&(String, String)>,
        segments: &[Segment],
        store: &SegmentStore,
        progress: &Arc<RunProgress>,
        errors: &Arc<Mutex<Vec<CoreError>>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(segments.len());
        for segment in segments {
            if let Some(planned) = segment.planned_size() {
                if segment.resume_offset >= planned {
                    continue;
                }
            }
            let net = Arc::clone(&self.net);
            let url = target.url.clone();
            let auth = auth.cloned();
            let segment = segment.clone();
            let path = store.segment_path(segment.index);
            let progress = Arc::clone(progress);
            let token = self.token.clone();
            let config = self.config.clone();
            let errors = Arc::clone(errors);

            handles.push(thread::spawn(move || {
                let result = fetch_segment(
                    net.as_ref(),
                    &url,
                    auth.as_ref(),
                    &segment,
                    &path,
                    &progress,
                    &token,
                    &config,
                );
                if let Err(err) = result {
                    warn!(segment = segment.index, error = %err, "segment fetch failed");
                    if let Ok(mut errors) = errors.lock() {
                        errors.push(err);
                    }
                    token.fail();
                }
            }));
        }
        handles
    }

    /// Bounded wait after a shutdown request; stragglers are detached and
    /// their partial files stay valid for resume.
    fn join_fetchers(&self, handles: Vec<JoinHandle<()>>) {
        if self.token.stop_reason() == Some(StopReason::Shutdown) {
            let deadline =
                Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
            while Instant::now() < deadline
                && !handles.iter().all(|handle| handle.is_finished())
            {
                thread::sleep(Duration::from_millis(50));
            }
            for handle in handles {
                if handle.is_finished() {
                    let _ = handle.join();
                }
            }
        } else {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    fn settle_outcome(
        &self,
        target: &TransferTarget,
        segments: &[Segment],
        store: &SegmentStore,
        progress: &RunProgress,
        errors: &Arc<Mutex<Vec<CoreError>>>,
    ) -> CoreResult<TransferOutcome> {
        match self.token.stop_reason() {
            Some(StopReason::Shutdown) => {
                progress.set_phase(Phase::Interrupted);
                info!(
                    temp_dir = %store.temp_dir().display(),
                    "transfer interrupted; segment state preserved"
                );
                Ok(TransferOutcome::Interrupted {
                    temp_dir: store.temp_dir().to_path_buf(),
                })
            }
            Some(StopReason::Failed) => {
                progress.set_phase(Phase::Failed);
                let err = errors
                    .lock()
                    .ok()
                    .and_then(|mut errors| {
                        if errors.is_empty() {
                            None
                        } else {
                            Some(errors.remove(0))
                        }
                    })
                    .unwrap_or_else(|| CoreError::Network("segment fetch failed".to_string()));
                Err(err)
            }
            _ => {
                let downloaded = progress.downloaded_bytes();
                if downloaded < target.total_bytes {
                    progress.set_phase(Phase::Failed);
                    return Err(CoreError::Incomplete {
                        downloaded,
                        total: target.total_bytes,
                    });
                }
                match self.merge_and_verify(target, segments, store, progress) {
                    Ok(()) => Ok(TransferOutcome::Completed {
                        dest_path: target.dest_path.clone(),
                    }),
                    Err(err) => {
                        progress.set_phase(Phase::Failed);
                        Err(err)
                    }
                }
            }
        }
    }

    fn merge_and_verify(
        &self,
        target: &TransferTarget,
        segments: &[Segment],
        store: &SegmentStore,
        progress: &RunProgress,
    ) -> CoreResult<()> {
        let mut paths = Vec::with_capacity(segments.len());
        let mut assembled = 0u64;
        for segment in segments {
            let path = store.segment_path(segment.index);
            let meta =
                fs::metadata(&path).map_err(|_| CoreError::IncompleteSegmentSet(path.clone()))?;
            assembled += meta.len();
            paths.push(path);
        }

        progress.set_phase(Phase::Merging);
        info!(segments = paths.len(), "merging segments");
        merge_segments(&paths, &target.dest_path, assembled, progress, store)?;
        verify_output(
            &target.dest_path,
            target.total_bytes,
            assembled,
            &self.config,
        )?;
        store.reset();
        progress.set_phase(Phase::Done);
        info!(dest = %target.dest_path.display(), "transfer complete");
        Ok(())
    }
}

fn spawn_reporter(
    progress: Arc<RunProgress>,
    sink: Arc<dyn ProgressSink>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            sink.update(&progress.snapshot());
            thread::sleep(interval);
        }
    })
}

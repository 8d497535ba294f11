use std::fs;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cancel::CancelToken;
use crate::config::TransferConfig;
use crate::coordinator::{
    ResumePolicy, ResumePrompt, TransferCoordinator, TransferOutcome, TransferRequest,
};
use crate::error::CoreError;
use crate::fetch::fetch_segment;
use crate::net::{DownloadRequest, NetClient, ProbeResponse, SegmentStream};
use crate::plan::Segment;
use crate::progress::{ProgressSink, ProgressSnapshot, RunProgress};
use crate::store::SegmentStore;

/// Serves a byte slice over the NetClient seam, recording every requested
/// range and optionally failing the first N streaming requests.
pub struct MockNetClient {
    data: Vec<u8>,
    accept_ranges: bool,
    fail_streams: AtomicU32,
    pub requests: Mutex<Vec<(u64, Option<u64>)>>,
}

impl MockNetClient {
    pub fn new(data: Vec<u8>, accept_ranges: bool) -> Self {
        Self {
            data,
            accept_ranges,
            fail_streams: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(data: Vec<u8>, fail_streams: u32) -> Self {
        let client = Self::new(data, true);
        client.fail_streams.store(fail_streams, Ordering::SeqCst);
        client
    }

    fn recorded_requests(&self) -> Vec<(u64, Option<u64>)> {
        self.requests.lock().unwrap().clone()
    }
}

impl NetClient for MockNetClient {
    fn probe(&self, _req: &DownloadRequest) -> Result<ProbeResponse, CoreError> {
        Ok(ProbeResponse {
            status_code: 200,
            total_bytes: Some(self.data.len() as u64),
            accept_ranges: self.accept_ranges,
        })
    }

    fn get_stream(&self, req: &DownloadRequest) -> Result<SegmentStream, CoreError> {
        let (start, end) = req.range.unwrap_or((0, None));
        self.requests.lock().unwrap().push((start, end));

        if self.fail_streams.load(Ordering::SeqCst) > 0 {
            self.fail_streams.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::Network("injected connection reset".to_string()));
        }
        if start >= self.data.len() as u64 {
            return Ok(SegmentStream {
                status: 416,
                body: Box::new(io::empty()),
            });
        }
        let stop = end
            .map(|end| ((end + 1) as usize).min(self.data.len()))
            .unwrap_or(self.data.len());
        Ok(SegmentStream {
            status: 206,
            body: Box::new(Cursor::new(self.data[start as usize..stop].to_vec())),
        })
    }
}

struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _snapshot: &ProgressSnapshot) {}
}

struct FixedPrompt(bool);

impl ResumePrompt for FixedPrompt {
    fn should_resume(&self, _filename: &str, _resume_bytes: u64) -> bool {
        self.0
    }
}

fn test_config() -> TransferConfig {
    TransferConfig {
        retry_delay_secs: 0,
        snapshot_interval_ms: 10,
        shutdown_grace_secs: 1,
        small_file_threshold: 1,
        ..TransferConfig::default()
    }
}

fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn coordinator_with(
    net: Arc<MockNetClient>,
    token: CancelToken,
) -> TransferCoordinator {
    TransferCoordinator::new(test_config(), token)
        .expect("coordinator")
        .with_net_client(net)
}

fn request_for(dir: &std::path::Path, resume: ResumePolicy, threads: u32) -> TransferRequest {
    TransferRequest {
        url: "https://example.com/data.bin".to_string(),
        download_dir: dir.to_path_buf(),
        resume,
        basic_auth: None,
        threads: Some(threads),
    }
}

#[test]
fn full_transfer_downloads_and_merges() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(100_000);
    let net = Arc::new(MockNetClient::new(data.clone(), true));
    let coordinator = coordinator_with(Arc::clone(&net), CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Never, 4);

    let report = coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    let dest = dir.path().join("data.bin");
    assert_eq!(report.outcome, TransferOutcome::Completed { dest_path: dest.clone() });
    assert_eq!(report.bytes_downloaded, 100_000);
    assert_eq!(report.session_bytes, 100_000);
    assert_eq!(fs::read(&dest).unwrap(), data);
    // Segment state is cleaned up after a verified merge.
    assert!(!dir.path().join(".data.bin.parts").exists());

    let mut requests = net.recorded_requests();
    requests.sort();
    assert_eq!(
        requests,
        vec![
            (0, Some(24_999)),
            (25_000, Some(49_999)),
            (50_000, Some(74_999)),
            (75_000, None),
        ]
    );
}

#[test]
fn single_connection_when_ranges_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(10_000);
    let net = Arc::new(MockNetClient::new(data.clone(), false));
    let coordinator = coordinator_with(Arc::clone(&net), CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Never, 8);

    coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), data);
    assert_eq!(net.recorded_requests(), vec![(0, None)]);
}

#[test]
fn resumed_run_requests_shifted_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(100_000);

    // Partial state from a previous 4-thread run.
    let store = SegmentStore::resolve(dir.path(), "data.bin");
    store.ensure().unwrap();
    fs::write(store.segment_path(0), &data[0..10_000]).unwrap();
    fs::write(store.segment_path(1), &data[25_000..25_600]).unwrap();
    fs::write(store.segment_path(2), b"").unwrap();
    fs::write(store.segment_path(3), &data[75_000..75_123]).unwrap();

    let net = Arc::new(MockNetClient::new(data.clone(), true));
    let coordinator = coordinator_with(Arc::clone(&net), CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Always, 4);

    let report = coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), data);
    assert_eq!(report.bytes_downloaded, 100_000);
    // 10_000 + 600 + 0 + 123 bytes were already on disk.
    assert_eq!(report.session_bytes, 100_000 - 10_723);

    let mut requests = net.recorded_requests();
    requests.sort();
    assert_eq!(
        requests,
        vec![
            (10_000, Some(24_999)),
            (25_600, Some(49_999)),
            (50_000, Some(74_999)),
            (75_123, None),
        ]
    );
}

#[test]
fn partial_segment_set_is_discarded_as_a_whole() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(100_000);

    // Only two of the four expected files exist; resume must start over.
    let store = SegmentStore::resolve(dir.path(), "data.bin");
    store.ensure().unwrap();
    fs::write(store.segment_path(0), &data[0..10_000]).unwrap();
    fs::write(store.segment_path(1), &data[25_000..30_000]).unwrap();

    let net = Arc::new(MockNetClient::new(data.clone(), true));
    let coordinator = coordinator_with(Arc::clone(&net), CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Always, 4);

    coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), data);
    let mut requests = net.recorded_requests();
    requests.sort();
    assert_eq!(requests[0], (0, Some(24_999)));
}

#[test]
fn declined_resume_prompt_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(50_000);

    let store = SegmentStore::resolve(dir.path(), "data.bin");
    store.ensure().unwrap();
    for index in 0..4 {
        fs::write(store.segment_path(index), b"old").unwrap();
    }

    let net = Arc::new(MockNetClient::new(data.clone(), true));
    let coordinator = coordinator_with(Arc::clone(&net), CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Ask, 4);

    coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), data);
    let mut requests = net.recorded_requests();
    requests.sort();
    assert_eq!(requests[0].0, 0);
}

#[test]
fn shutdown_before_start_preserves_state_and_skips_merge() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(MockNetClient::new(test_data(100_000), true));
    let token = CancelToken::new();
    token.shutdown();
    let coordinator = coordinator_with(net, token);
    let request = request_for(dir.path(), ResumePolicy::Never, 4);

    let report = coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .expect("run");

    let temp_dir = dir.path().join(".data.bin.parts");
    assert_eq!(report.outcome, TransferOutcome::Interrupted { temp_dir: temp_dir.clone() });
    assert!(temp_dir.exists());
    assert!(!dir.path().join("data.bin").exists());
}

#[test]
fn failed_segment_fails_the_run_and_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    // Every stream request fails; retries exhaust.
    let net = Arc::new(MockNetClient::failing(test_data(100_000), u32::MAX));
    let coordinator = coordinator_with(net, CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Never, 4);

    let err = coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .unwrap_err();
    assert!(matches!(err, CoreError::SegmentFetch { .. }));
    assert!(dir.path().join(".data.bin.parts").exists());
    assert!(!dir.path().join("data.bin").exists());
}

#[test]
fn probe_without_size_fails_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let net = Arc::new(MockNetClient::new(Vec::new(), true));
    let coordinator = coordinator_with(net, CancelToken::new());
    let request = request_for(dir.path(), ResumePolicy::Never, 4);

    let err = coordinator
        .run(&request, Arc::new(NullSink), &FixedPrompt(false))
        .unwrap_err();
    assert!(matches!(err, CoreError::Probe(_)));
    assert!(!dir.path().join(".data.bin.parts").exists());
}

// Segment-level fetch behavior.

#[test]
fn fetch_writes_exactly_the_planned_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(1000);
    let net = MockNetClient::new(data.clone(), true);
    let segment = Segment::new(1, 200, Some(399));
    let path = dir.path().join("chunk_1");
    let progress = RunProgress::new(1000, 1, 0);

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &test_config(),
    )
    .expect("fetch");

    assert_eq!(fs::read(&path).unwrap(), &data[200..400]);
    assert_eq!(progress.downloaded_bytes(), 200);
    assert_eq!(net.recorded_requests(), vec![(200, Some(399))]);
}

#[test]
fn fetch_resumes_from_existing_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(1000);
    let net = MockNetClient::new(data.clone(), true);
    let segment = Segment::new(0, 100, Some(299));
    let path = dir.path().join("chunk_0");
    fs::write(&path, &data[100..150]).unwrap();
    let progress = RunProgress::new(1000, 1, 50);

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &test_config(),
    )
    .expect("fetch");

    assert_eq!(fs::read(&path).unwrap(), &data[100..300]);
    assert_eq!(net.recorded_requests(), vec![(150, Some(299))]);
    // Resume seed plus the 150 streamed bytes.
    assert_eq!(progress.downloaded_bytes(), 200);
}

#[test]
fn fetch_treats_range_not_satisfiable_as_done() {
    let dir = tempfile::tempdir().unwrap();
    let net = MockNetClient::new(test_data(100), true);
    // Range entirely beyond what the server has.
    let segment = Segment::new(2, 500, Some(599));
    let path = dir.path().join("chunk_2");
    let progress = RunProgress::new(1000, 1, 0);

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &test_config(),
    )
    .expect("fetch");

    // The planned bytes are credited once so completion accounting adds up,
    // but nothing was streamed this session.
    let snap = progress.snapshot();
    assert_eq!(snap.downloaded_bytes, 100);
    assert_eq!(snap.session_bytes, 0);
    assert_eq!(net.recorded_requests().len(), 1);
}

#[test]
fn fetch_skips_request_when_segment_already_complete() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(1000);
    let net = MockNetClient::new(data.clone(), true);
    let segment = Segment::new(0, 0, Some(99));
    let path = dir.path().join("chunk_0");
    fs::write(&path, &data[0..100]).unwrap();
    let progress = RunProgress::new(1000, 1, 100);

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &test_config(),
    )
    .expect("fetch");

    assert!(net.recorded_requests().is_empty());
    assert_eq!(progress.downloaded_bytes(), 100);
}

#[test]
fn fetch_retries_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let data = test_data(1000);
    let net = MockNetClient::failing(data.clone(), 2);
    let segment = Segment::new(0, 0, Some(499));
    let path = dir.path().join("chunk_0");
    let progress = RunProgress::new(1000, 1, 0);

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &test_config(),
    )
    .expect("fetch");

    assert_eq!(net.recorded_requests().len(), 3);
    assert_eq!(fs::read(&path).unwrap(), &data[0..500]);
}

#[test]
fn fetch_fails_after_retry_cap_and_counts_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let net = MockNetClient::failing(test_data(1000), u32::MAX);
    let segment = Segment::new(3, 0, Some(499));
    let path = dir.path().join("chunk_3");
    let progress = RunProgress::new(1000, 1, 0);
    let config = test_config();

    let err = fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &CancelToken::new(),
        &config,
    )
    .unwrap_err();

    match err {
        CoreError::SegmentFetch {
            index, attempts, ..
        } => {
            assert_eq!(index, 3);
            assert_eq!(attempts, config.retry_count + 1);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(progress.snapshot().errors, 1);
    assert_eq!(net.recorded_requests().len() as u32, config.retry_count + 1);
}

#[test]
fn fetch_stops_cleanly_when_token_fires() {
    let dir = tempfile::tempdir().unwrap();
    let net = MockNetClient::new(test_data(1000), true);
    let segment = Segment::new(0, 0, Some(999));
    let path = dir.path().join("chunk_0");
    let progress = RunProgress::new(1000, 1, 0);
    let token = CancelToken::new();
    token.shutdown();

    fetch_segment(
        &net,
        "https://example.com/data.bin",
        None,
        &segment,
        &path,
        &progress,
        &token,
        &test_config(),
    )
    .expect("fetch");

    // No request was issued; whatever is on disk stays resumable.
    assert!(net.recorded_requests().is_empty());
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_threads: u32,
    pub small_file_threshold: u64,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub buffer_size: usize,
    pub snapshot_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub strict_size_tolerance: f64,
    pub loose_size_tolerance: f64,
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            small_file_threshold: 1024 * 1024,
            retry_count: 5,
            retry_delay_secs: 5,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            buffer_size: 64 * 1024,
            snapshot_interval_ms: 500,
            shutdown_grace_secs: 5,
            strict_size_tolerance: 0.001,
            loose_size_tolerance: 0.05,
            user_agent: "tdm/0.1".to_string(),
        }
    }
}

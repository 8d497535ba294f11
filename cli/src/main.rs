use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tdm_core::{
    filename_from_url, sanitize_filename, CancelToken, Phase, ProgressSink, ProgressSnapshot,
    ResumePolicy, ResumePrompt, SegmentStore, TransferConfig, TransferCoordinator,
    TransferOutcome, TransferRequest,
};

#[derive(Parser)]
#[command(name = "tdm", version, about = "Resumable parallel-segment downloader")]
struct Args {
    /// The URL to download from (HTTP/HTTPS)
    #[arg(long)]
    link: String,
    /// The directory to save the file to
    #[arg(long, default_value = ".")]
    path: PathBuf,
    /// What to do when a partial download exists
    #[arg(long, value_enum, default_value_t = ResumeArg::Ask)]
    resume: ResumeArg,
    /// Username for basic authentication
    #[arg(long)]
    user: Option<String>,
    /// Password for basic authentication
    #[arg(long)]
    password: Option<String>,
    /// Number of download threads (capped at 16)
    #[arg(long)]
    threads: Option<u32>,
    /// Delete saved segment state for this URL and exit
    #[arg(long)]
    cleanup: bool,
    /// Emit JSON progress lines instead of the status line
    #[arg(long)]
    porcelain: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResumeArg {
    Ask,
    Yes,
    No,
}

impl From<ResumeArg> for ResumePolicy {
    fn from(value: ResumeArg) -> Self {
        match value {
            ResumeArg::Ask => ResumePolicy::Ask,
            ResumeArg::Yes => ResumePolicy::Always,
            ResumeArg::No => ResumePolicy::Never,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if args.cleanup {
        let filename = sanitize_filename(&filename_from_url(&args.link));
        let store = SegmentStore::resolve(&args.path, &filename);
        store.reset();
        println!("removed segment state in {}", store.temp_dir().display());
        return ExitCode::SUCCESS;
    }

    let token = CancelToken::new();
    {
        let token = token.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            token.shutdown();
            eprintln!("\nshutdown requested; waiting for segments to stop...");
        }) {
            tracing::warn!(error = %err, "could not install interrupt handler");
        }
    }

    let coordinator = match TransferCoordinator::new(TransferConfig::default(), token) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let basic_auth = match (args.user, args.password) {
        (Some(user), Some(password)) => Some((user, password)),
        (Some(_), None) | (None, Some(_)) => {
            eprintln!("error: --user and --password must be given together");
            return ExitCode::FAILURE;
        }
        (None, None) => None,
    };

    let request = TransferRequest {
        url: args.link,
        download_dir: args.path,
        resume: args.resume.into(),
        basic_auth,
        threads: args.threads,
    };

    let sink: Arc<dyn ProgressSink> = if args.porcelain {
        Arc::new(JsonSink)
    } else {
        Arc::new(TerminalSink)
    };

    match coordinator.run(&request, sink, &StdinPrompt) {
        Ok(report) => match report.outcome {
            TransferOutcome::Completed { dest_path } => {
                println!(
                    "\ndownloaded {} in {} -> {}",
                    format_bytes(report.session_bytes),
                    format_duration(report.elapsed.as_secs()),
                    dest_path.display()
                );
                ExitCode::SUCCESS
            }
            TransferOutcome::Interrupted { temp_dir } => {
                println!("\ndownload interrupted; segment state saved in {}", temp_dir.display());
                println!("run the same command again to resume");
                ExitCode::from(2)
            }
        },
        Err(err) => {
            eprintln!("\nerror: {}", err);
            ExitCode::FAILURE
        }
    }
}

struct StdinPrompt;

impl ResumePrompt for StdinPrompt {
    fn should_resume(&self, filename: &str, resume_bytes: u64) -> bool {
        println!(
            "found existing download for '{}' ({} already fetched)",
            filename,
            format_bytes(resume_bytes)
        );
        loop {
            print!("resume download? (y/n): ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line).is_err() {
                return false;
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return true,
                "n" | "no" => return false,
                _ => println!("please answer 'y' or 'n'"),
            }
        }
    }
}

/// Single rewritten status line on stderr.
struct TerminalSink;

impl ProgressSink for TerminalSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        let line = match snapshot.phase {
            Phase::Fetching => {
                let speed = snapshot.speed_bytes_per_sec();
                let remaining = snapshot.total_bytes.saturating_sub(snapshot.downloaded_bytes);
                let eta = if speed > 0 {
                    format_duration(remaining / speed)
                } else {
                    "--:--".to_string()
                };
                let mut extras = format!("{} threads", snapshot.threads);
                if snapshot.resumed {
                    extras.push_str(", resumed");
                }
                if snapshot.errors > 0 {
                    extras.push_str(&format!(", {} errors", snapshot.errors));
                }
                format!(
                    "{:5.1}% {}/{} ({}/s) eta {} [{}]",
                    snapshot.percent(),
                    format_bytes(snapshot.downloaded_bytes),
                    format_bytes(snapshot.total_bytes),
                    format_bytes(speed),
                    eta,
                    extras,
                )
            }
            Phase::Merging => format!("merging segments... {:5.1}%", snapshot.merged_percent),
            phase => phase.to_string(),
        };
        eprint!("\r{:<78}", line);
        let _ = io::stderr().flush();
    }
}

/// One JSON object per update, for scripts.
struct JsonSink;

impl ProgressSink for JsonSink {
    fn update(&self, snapshot: &ProgressSnapshot) {
        if let Ok(line) = serde_json::to_string(snapshot) {
            println!("{}", line);
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

fn format_duration(mut seconds: u64) -> String {
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

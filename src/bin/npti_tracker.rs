//! NPTI tracker CLI
//!
//! Commands:
//! - replay: Run a recorded event trace through the tracker and print the payloads it sends
//! - validate: Validate an event trace
//! - ingest: Feed delivery payloads to an in-memory collector and query it
//! - doctor: Diagnose configuration and environment

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use npti_tracker::collector::BehaviorCollector;
use npti_tracker::delivery::{
    BeaconTransport, DeliveryManager, DeliveryOutcome, FlushBatch, KeepaliveTransport,
};
use npti_tracker::error::{TrackerError, TransportError};
use npti_tracker::trace;
use npti_tracker::tracker::{BehaviorTracker, PageSnapshot, TrackerEvent};
use npti_tracker::types::{DeliveryPayload, ViewerSession, Viewport};
use npti_tracker::{TrackerConfig, PRODUCER_NAME, TRACKER_VERSION};

/// NPTI tracker - reading-behavior sampling for news personalization
#[derive(Parser)]
#[command(name = "npti-tracker")]
#[command(author = "NPTI Team")]
#[command(version = TRACKER_VERSION)]
#[command(about = "Replay, validate and collect reading-behavior logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay an event trace and print the delivered payloads
    Replay {
        /// Input trace path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Tracker configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Initial page snapshot JSON file (defaults to a 1000x800 viewport)
        #[arg(long)]
        page: Option<PathBuf>,

        /// Viewer identifier
        #[arg(long, default_value = "replay-user")]
        user_id: String,

        /// Article identifier
        #[arg(long, default_value = "replay-news")]
        news_id: String,

        /// Simulate the beacon refusing every payload
        #[arg(long)]
        refuse_beacon: bool,

        /// Simulate the keepalive fallback failing
        #[arg(long)]
        fail_keepalive: bool,
    },

    /// Validate an event trace
    Validate {
        /// Input trace path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Ingest delivery payloads (NDJSON) and print a viewer's stored logs
    Ingest {
        /// Input payload path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Viewer whose logs are searched
        #[arg(long)]
        user_id: String,

        /// Only logs stored at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Tracker configuration JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), NptiCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            input_format,
            output_format,
            config,
            page,
            user_id,
            news_id,
            refuse_beacon,
            fail_keepalive,
        } => {
            let options = ReplayOptions {
                config: load_config(config.as_deref())?,
                page: load_page(page.as_deref())?,
                session: ViewerSession::new(user_id, news_id),
                refuse_beacon,
                fail_keepalive,
            };
            cmd_replay(&input, &output, input_format, output_format, options)
        }
        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),
        Commands::Ingest {
            input,
            user_id,
            since,
            output_format,
        } => cmd_ingest(&input, &user_id, since.as_deref(), output_format),
        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),
    }
}

struct ReplayOptions {
    config: TrackerConfig,
    page: PageSnapshot,
    session: ViewerSession,
    refuse_beacon: bool,
    fail_keepalive: bool,
}

/// Transport that records bodies instead of sending them
struct RecordingTransport {
    refuse_beacon: bool,
    fail_keepalive: bool,
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn take_sent(&self) -> Vec<String> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(_) => Vec::new(),
        }
    }

    fn record(&self, body: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(body.to_string());
        }
    }
}

impl BeaconTransport for RecordingTransport {
    fn send_beacon(&self, _path: &str, body: &str) -> bool {
        if self.refuse_beacon {
            return false;
        }
        self.record(body);
        true
    }
}

#[async_trait]
impl KeepaliveTransport for RecordingTransport {
    async fn post_keepalive(&self, _path: &str, body: String) -> Result<(), TransportError> {
        if self.fail_keepalive {
            return Err(TransportError::Network("simulated failure".to_string()));
        }
        self.record(&body);
        Ok(())
    }
}

fn cmd_replay(
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    options: ReplayOptions,
) -> Result<(), NptiCliError> {
    let events = parse_events(&read_input(input)?, input_format)?;
    if events.is_empty() {
        return Err(NptiCliError::NoEvents);
    }
    trace::ensure_valid(&events)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let transport = RecordingTransport {
        refuse_beacon: options.refuse_beacon,
        fail_keepalive: options.fail_keepalive,
        sent: Mutex::new(Vec::new()),
    };
    let manager = DeliveryManager::new(options.session, options.config.collector_path.clone());
    let mut tracker = BehaviorTracker::new(&options.config, options.page);

    let undelivered = runtime.block_on(async {
        for event in events {
            if let Some(batch) = tracker.handle(event) {
                deliver(&manager, &mut tracker, batch, &transport).await?;
            }
        }
        // Traces without an explicit stop end like a closed page
        if let Some(batch) = tracker.stop() {
            deliver(&manager, &mut tracker, batch, &transport).await?;
        }
        Ok::<usize, NptiCliError>(tracker.buffered())
    })?;

    if undelivered > 0 {
        log::warn!("{undelivered} records could not be delivered");
    }

    let payloads = transport
        .take_sent()
        .iter()
        .map(|body| serde_json::from_str::<DeliveryPayload>(body))
        .collect::<Result<Vec<_>, _>>()?;
    write_output(output, &format_output(&payloads, &output_format)?)
}

async fn deliver(
    manager: &DeliveryManager,
    tracker: &mut BehaviorTracker,
    batch: FlushBatch,
    transport: &RecordingTransport,
) -> Result<(), NptiCliError> {
    match manager.deliver(batch, transport).await? {
        DeliveryOutcome::Delivered { .. } => {}
        DeliveryOutcome::Failed { records, .. } => tracker.requeue(records),
    }
    Ok(())
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), NptiCliError> {
    let events = parse_events(&read_input(input)?, input_format)?;
    let issues = trace::validate_events(&events);
    let invalid: std::collections::BTreeSet<usize> = issues.iter().map(|i| i.index).collect();

    let report = ValidationReport {
        total_events: events.len(),
        valid_events: events.len() - invalid.len(),
        invalid_events: invalid.len(),
        errors: issues
            .iter()
            .map(|issue| ValidationErrorDetail {
                index: issue.index,
                event_type: events.get(issue.index).map(event_type),
                error: issue.message.clone(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total events:   {}", report.total_events);
        println!("Valid events:   {}", report.valid_events);
        println!("Invalid events: {}", report.invalid_events);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - Event {} (index {}): {}",
                    err.event_type.as_deref().unwrap_or("unknown"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_events > 0 {
        Err(NptiCliError::ValidationFailed(report.invalid_events))
    } else {
        Ok(())
    }
}

fn cmd_ingest(
    input: &Path,
    user_id: &str,
    since: Option<&str>,
    output_format: OutputFormat,
) -> Result<(), NptiCliError> {
    let since = match since {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| NptiCliError::ParseError(format!("Invalid --since time: {e}")))?,
        None => DateTime::<Utc>::MIN_UTC.fixed_offset(),
    };

    let mut collector = BehaviorCollector::new();
    let mut accepted = 0;
    let mut duplicates = 0;
    for (line_num, line) in read_input(input)?.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let report = collector.ingest_json(trimmed).map_err(|e| {
            NptiCliError::ParseError(format!("Failed to ingest line {}: {}", line_num + 1, e))
        })?;
        accepted += report.accepted;
        duplicates += report.duplicates;
    }
    log::info!("ingested {accepted} records, skipped {duplicates} duplicates");

    let groups = collector.search(user_id, since);
    let summaries: Vec<ArticleSummary> = groups
        .into_iter()
        .map(|docs| {
            let news_id = docs.first().map(|d| d.news_id.clone()).unwrap_or_default();
            ArticleSummary {
                dwell_time: collector.dwell_time(user_id, &news_id).unwrap_or(0),
                news_id,
                logs: docs,
            }
        })
        .collect();

    print!("{}", format_output(&summaries, &output_format)?);
    io::stdout().flush()?;
    Ok(())
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), NptiCliError> {
    let mut checks = Vec::new();

    checks.push(DoctorCheck {
        name: "event_schema".to_string(),
        status: CheckStatus::Ok,
        message: "Tagged JSON events (pointer_move, scroll, focus, visibility, tick, ...)"
            .to_string(),
    });

    // Configuration file, then environment overrides on top of it
    let base = match config {
        Some(path) if !path.exists() => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Config file does not exist; using defaults".to_string(),
            });
            Some(TrackerConfig::default())
        }
        Some(path) => match TrackerConfig::from_file(path) {
            Ok(cfg) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Config file parsed: {}", path.display()),
                });
                Some(cfg)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot load config: {e}"),
                });
                None
            }
        },
        None => Some(TrackerConfig::default()),
    };

    if let Some(base) = base {
        match base.with_env_overrides().and_then(|cfg| cfg.validate().map(|_| cfg)) {
            Ok(cfg) => checks.push(DoctorCheck {
                name: "effective_config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "tick={}ms emit={}ms scroll_decay={}ms flush_threshold={} path={}",
                    cfg.tick_interval_ms,
                    cfg.emit_interval_ms,
                    cfg.scroll_decay_ms,
                    cfg.flush_threshold,
                    cfg.collector_path
                ),
            }),
            Err(e) => checks.push(DoctorCheck {
                name: "effective_config".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            }),
        }
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (use --input - to read traces)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: TRACKER_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("NPTI Tracker Doctor Report");
        println!("==========================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(NptiCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn read_input(input: &Path) -> Result<String, NptiCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn write_output(output: &Path, data: &str) -> Result<(), NptiCliError> {
    if output.to_string_lossy() == "-" {
        print!("{}", data);
        io::stdout().flush()?;
    } else {
        fs::write(output, data)?;
    }
    Ok(())
}

fn parse_events(data: &str, format: InputFormat) -> Result<Vec<TrackerEvent>, NptiCliError> {
    Ok(match format {
        InputFormat::Ndjson => trace::parse_ndjson(data)?,
        InputFormat::Json => trace::parse_array(data)?,
    })
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig, NptiCliError> {
    let config = match path {
        Some(path) => TrackerConfig::from_file(path)?,
        None => TrackerConfig::default(),
    };
    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_page(path: Option<&Path>) -> Result<PageSnapshot, NptiCliError> {
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Ok(PageSnapshot::new(0, Viewport::new(1000.0, 800.0))),
    }
}

fn event_type(event: &TrackerEvent) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_output<T: serde::Serialize>(
    items: &[T],
    format: &OutputFormat,
) -> Result<String, NptiCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut out = String::new();
            for item in items {
                out.push_str(&serde_json::to_string(item)?);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string(items)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(items)? + "\n"),
    }
}

// Error types

#[derive(Debug)]
enum NptiCliError {
    Io(io::Error),
    Tracker(TrackerError),
    Json(serde_json::Error),
    NoEvents,
    ValidationFailed(usize),
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for NptiCliError {
    fn from(e: io::Error) -> Self {
        NptiCliError::Io(e)
    }
}

impl From<TrackerError> for NptiCliError {
    fn from(e: TrackerError) -> Self {
        NptiCliError::Tracker(e)
    }
}

impl From<serde_json::Error> for NptiCliError {
    fn from(e: serde_json::Error) -> Self {
        NptiCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<NptiCliError> for CliError {
    fn from(e: NptiCliError) -> Self {
        match e {
            NptiCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            NptiCliError::Tracker(TrackerError::InvalidConfig(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'npti-tracker doctor' to inspect the configuration".to_string()),
            },
            NptiCliError::Tracker(e @ TrackerError::InvalidTrace(_)) => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'npti-tracker validate' for details".to_string()),
            },
            NptiCliError::Tracker(e) => CliError {
                code: "TRACKER_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure input matches the tracker event format".to_string()),
            },
            NptiCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            NptiCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No events found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            NptiCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} events failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            NptiCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            NptiCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Check input format".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_events: usize,
    valid_events: usize,
    invalid_events: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    event_type: Option<String>,
    error: String,
}

#[derive(serde::Serialize)]
struct ArticleSummary {
    news_id: String,
    dwell_time: u64,
    logs: Vec<npti_tracker::collector::CollectorDocument>,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use gifsmith_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use gifsmith_core::logging::{
    self, CrashReporter, FileSink, FilterInputs, LogFilters, DEFAULT_LOG_FILTER,
    DEFAULT_LOG_RETENTION_FILES,
};
use gifsmith_core::server::{app_router, AppState};
use gifsmith_core::types::{Background, EncodeOptions, Frame, FrameId, Quality};
use gifsmith_core::{JobController, JobOutcome};

#[derive(Parser)]
#[command(
    name = "gifsmith",
    about = "Assemble still images into an animated GIF",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode images into a GIF on this machine.
    Encode(EncodeArgs),
}

#[derive(Args, Debug, Clone)]
struct EncodeArgs {
    #[arg(
        required = true,
        value_name = "IMAGE[:DELAY_MS]",
        help = "Input images in display order, each with an optional delay"
    )]
    frames: Vec<String>,
    #[arg(short = 'o', long, default_value = "animation.gif")]
    output: PathBuf,
    #[arg(long, help = "Canvas width in pixels (default from config)")]
    width: Option<u32>,
    #[arg(long, help = "Canvas height in pixels (default from config)")]
    height: Option<u32>,
    #[arg(long, help = "Color sampling interval, 1 (best) to 30 (fastest)")]
    quality: Option<u8>,
    #[arg(long = "delay", value_name = "MS", help = "Delay for frames without an explicit one")]
    default_delay_ms: Option<u32>,
    #[arg(long, help = "Letterbox fill: 'transparent' or '#rrggbb'")]
    background: Option<Background>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        "encode"
    } else {
        "server"
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    match cli.command {
        Some(Commands::Encode(args)) => {
            let config = load_config_or_default(&config_path(&resolved_data_dir));
            run_encode(args, &config).await.map(|_| ())
        }
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn filter_inputs(verbose: u8, cli_log_filter: Option<&str>, rust_log: Option<String>) -> FilterInputs {
    FilterInputs {
        cli_filter: cli_log_filter.map(ToString::to_string),
        verbose,
        rust_log,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_reporter = logging::install_crash_reporter(data_dir);
    let filters = LogFilters::resolve(&filter_inputs(
        verbose,
        cli_log_filter,
        std::env::var("RUST_LOG").ok(),
    ));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let file_sink = FileSink::open(data_dir, DEFAULT_LOG_RETENTION_FILES);
    let (file_layer, console_only_reason) = match file_sink {
        FileSink::Rolling { appender, .. } => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        FileSink::ConsoleOnly {
            attempted_dir,
            reason,
        } => (None, Some((attempted_dir, reason))),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }

    if let Some((attempted_dir, reason)) = console_only_reason {
        warn!(
            attempted_log_dir = ?attempted_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let CrashReporter::Disabled {
        attempted_dir,
        reason,
    } = crash_reporter
    {
        warn!(
            attempted_crash_dir = ?attempted_dir,
            reason = %reason,
            "Crash reports disabled; panics will only reach stderr"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: &str, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode,
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode, pid, "Runtime startup metadata");
    }
}

fn load_config_or_default(path: &Path) -> AppConfig {
    match AppConfig::load_from_path(path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let mut config = load_config_or_default(&config_path(&data_dir));
    config.apply_env_overrides();

    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let app = app_router(AppState::new(config));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting gifsmith server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Split `path[:delay_ms]`. The suffix only counts as a delay when it is all
/// digits, so drive-letter paths are left intact.
fn parse_frame_spec(raw: &str, default_delay_ms: u32) -> Result<(PathBuf, u32)> {
    if let Some((path, delay)) = raw.rsplit_once(':') {
        if !path.is_empty() && !delay.is_empty() && delay.bytes().all(|b| b.is_ascii_digit()) {
            let delay_ms = delay
                .parse()
                .with_context(|| format!("invalid delay in '{raw}'"))?;
            return Ok((PathBuf::from(path), delay_ms));
        }
    }
    Ok((PathBuf::from(raw), default_delay_ms))
}

fn resolve_encode_options(args: &EncodeArgs, config: &AppConfig) -> Result<(EncodeOptions, Background)> {
    let defaults = config.encode.options();
    let quality = match args.quality {
        Some(raw) => Quality::new(raw)?,
        None => defaults.quality,
    };
    let options = EncodeOptions {
        width: args.width.unwrap_or(defaults.width),
        height: args.height.unwrap_or(defaults.height),
        quality,
    };
    options.validate()?;
    options.check_canvas_budget(config.encode.max_canvas_pixels)?;
    Ok((options, args.background.unwrap_or(config.encode.background)))
}

async fn run_encode(args: EncodeArgs, config: &AppConfig) -> Result<PathBuf> {
    let (options, background) = resolve_encode_options(&args, config)?;
    let default_delay_ms = args
        .default_delay_ms
        .unwrap_or(config.encode.default_delay_ms);

    let mut frames = Vec::with_capacity(args.frames.len());
    for raw in &args.frames {
        let (path, delay_ms) = parse_frame_spec(raw, default_delay_ms)?;
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read image: {}", path.display()))?;
        let id = FrameId::from(path.display().to_string());
        frames.push(Frame::with_id(id, bytes, delay_ms));
    }

    info!(
        frames = frames.len(),
        width = options.width,
        height = options.height,
        quality = options.quality.get(),
        %background,
        "Encoding animation"
    );

    let controller = JobController::new(background);
    let handle = controller.start(frames, options)?;
    let total_frames = handle.total_frames();
    let started = Instant::now();

    let wait = handle.wait_with_progress(|percent| {
        print_progress(percent, total_frames, started.elapsed().as_secs_f64())
    });
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            warn!("Interrupt received, cancelling after the current frame");
            controller.cancel()?;
            wait.await
        }
    };
    eprintln!();

    match outcome {
        JobOutcome::Completed(artifact) => {
            tokio::fs::write(&args.output, artifact.bytes())
                .await
                .with_context(|| format!("Failed to write {}", args.output.display()))?;
            info!(
                output = %args.output.display(),
                bytes = artifact.size_bytes(),
                frames = artifact.frame_count(),
                elapsed = %format_duration(started.elapsed().as_secs_f64()),
                "Animation written"
            );
            Ok(args.output)
        }
        JobOutcome::Cancelled => bail!("cancelled"),
        JobOutcome::Failed(err) => Err(err).context("Encoding failed"),
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(percent: u8, total_frames: usize, elapsed: f64) -> String {
    let fraction = (f64::from(percent) / 100.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);
    // Percent is floored per frame, so rounding up recovers the frame count.
    let frames_done = (total_frames * usize::from(percent.min(100))).div_ceil(100);

    format!(
        "[{}] {:3}% | Frame {}/{} | Elapsed: {}",
        bar,
        percent,
        frames_done,
        total_frames,
        format_duration(elapsed),
    )
}

fn print_progress(percent: u8, total_frames: usize, elapsed: f64) {
    eprint!("\r{}    ", render_progress(percent, total_frames, elapsed));
}

#[cfg(test)]
mod frame_spec_tests {
    use super::*;

    #[test]
    fn delay_suffix_is_parsed() {
        let (path, delay) = parse_frame_spec("frames/a.png:250", 100).unwrap();
        assert_eq!(path, PathBuf::from("frames/a.png"));
        assert_eq!(delay, 250);
    }

    #[test]
    fn missing_suffix_uses_default_delay() {
        let (path, delay) = parse_frame_spec("b.jpg", 100).unwrap();
        assert_eq!(path, PathBuf::from("b.jpg"));
        assert_eq!(delay, 100);
    }

    #[test]
    fn non_numeric_suffix_is_part_of_the_path() {
        let (path, delay) = parse_frame_spec(r"C:\frames\c.gif", 80).unwrap();
        assert_eq!(path, PathBuf::from(r"C:\frames\c.gif"));
        assert_eq!(delay, 80);
    }

    #[test]
    fn overflowing_delay_is_an_error() {
        assert!(parse_frame_spec("a.png:99999999999", 100).is_err());
    }
}

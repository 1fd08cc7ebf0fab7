//! Log filter selection, the rolling file sink, and crash reports.
//!
//! Crash reports carry the encode that was running on the panicking thread:
//! worker threads enter an [`EncodeContext`] and the pipeline marks each frame
//! boundary, so a report names the job, the stage and the frame index.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use uuid::Uuid;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const NOISE_FILTER: &str = "tower_http=warn,hyper=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";

const LOG_FILE_PREFIX: &str = "gifsmith";
const LOG_FILE_SUFFIX: &str = "log";
/// Per-frame pipeline events are kept at debug in the file sink.
const PIPELINE_TARGET: &str = "gifsmith_core";

static CRASH_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static ENCODE_CONTEXT: RefCell<Option<EncodeContext>> = const { RefCell::new(None) };
    static WRITING_CRASH: Cell<bool> = const { Cell::new(false) };
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterInputs {
    pub cli_filter: Option<String>,
    pub verbose: u8,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    CliFlag,
    Verbosity,
    RustLog,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub source: FilterSource,
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// Precedence: `--log-filter` > `-v`/`-vv` > `RUST_LOG` > `info`.
    ///
    /// Implicit selections (`RUST_LOG` or the default) get the HTTP noise
    /// filter, and the file sink additionally records pipeline debug events
    /// unless the selection already names the pipeline target.
    pub fn resolve(inputs: &FilterInputs) -> Self {
        let (source, selected) = match (&inputs.cli_filter, inputs.verbose, &inputs.rust_log) {
            (Some(filter), _, _) => (FilterSource::CliFlag, filter.clone()),
            (None, 0, Some(filter)) => (FilterSource::RustLog, filter.clone()),
            (None, 0, None) => (FilterSource::Default, DEFAULT_LOG_FILTER.to_string()),
            (None, 1, _) => (FilterSource::Verbosity, "debug".to_string()),
            (None, _, _) => (FilterSource::Verbosity, "trace".to_string()),
        };

        if matches!(source, FilterSource::CliFlag | FilterSource::Verbosity) {
            return Self {
                source,
                console: selected.clone(),
                file: selected,
            };
        }

        let console = format!("{NOISE_FILTER},{selected}");
        let file = if names_target(&selected, PIPELINE_TARGET) {
            console.clone()
        } else {
            format!("{console},{PIPELINE_TARGET}=debug")
        };
        Self {
            source,
            console,
            file,
        }
    }
}

fn names_target(filter: &str, target: &str) -> bool {
    filter
        .split(',')
        .filter_map(|directive| directive.split_once('=').map(|(t, _)| t.trim()))
        .any(|t| t == target || t.starts_with(&format!("{target}::")))
}

#[derive(Debug)]
pub enum FileSink {
    Rolling {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    /// Daily-rotated `gifsmith.*.log` files under `<data_dir>/logs`, keeping
    /// `retention_files` of them (0 means the default). Never fails: a sink
    /// that cannot be opened degrades to console-only.
    pub fn open(data_dir: Option<&Path>, retention_files: usize) -> Self {
        let Some(data_dir) = data_dir else {
            return Self::ConsoleOnly {
                attempted_dir: None,
                reason: "no data directory configured".to_string(),
            };
        };

        let dir = log_dir(data_dir);
        let retention = match retention_files {
            0 => DEFAULT_LOG_RETENTION_FILES,
            n => n,
        };
        match open_rolling_appender(&dir, retention) {
            Ok(appender) => Self::Rolling { dir, appender },
            Err(reason) => Self::ConsoleOnly {
                attempted_dir: Some(dir),
                reason,
            },
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Rolling { dir, .. } => Some(dir),
            Self::ConsoleOnly { attempted_dir, .. } => attempted_dir.as_deref(),
        }
    }
}

fn open_rolling_appender(dir: &Path, retention: usize) -> Result<RollingFileAppender, String> {
    fs::create_dir_all(dir).map_err(|e| format!("failed to create log directory: {e}"))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(dir)
        .map_err(|e| format!("failed to initialize rolling file sink: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStage {
    Normalize,
    Encode,
    Finalize,
}

impl EncodeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Encode => "encode",
            Self::Finalize => "finalize",
        }
    }
}

/// What the current thread is encoding. `job_id` is `None` for
/// request/response encodes, which have no controller job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeContext {
    pub job_id: Option<Uuid>,
    pub total_frames: usize,
    pub stage: Option<EncodeStage>,
    pub frame_index: Option<usize>,
}

/// Restores the previous context on drop. Bound to the thread that
/// created it.
#[must_use = "the encode context is cleared when the guard is dropped"]
pub struct EncodeContextGuard {
    previous: Option<EncodeContext>,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for EncodeContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ENCODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = previous);
    }
}

pub fn enter_encode_context(job_id: Option<Uuid>, total_frames: usize) -> EncodeContextGuard {
    let context = EncodeContext {
        job_id,
        total_frames,
        stage: None,
        frame_index: None,
    };
    let previous = ENCODE_CONTEXT.with(|ctx| ctx.borrow_mut().replace(context));
    EncodeContextGuard {
        previous,
        _thread_bound: PhantomData,
    }
}

/// Record a frame boundary. No-op on threads outside an encode.
pub fn mark_frame(stage: EncodeStage, frame_index: Option<usize>) {
    ENCODE_CONTEXT.with(|ctx| {
        if let Some(context) = ctx.borrow_mut().as_mut() {
            context.stage = Some(stage);
            context.frame_index = frame_index;
        }
    });
}

pub fn current_encode_context() -> Option<EncodeContext> {
    ENCODE_CONTEXT.with(|ctx| ctx.borrow().clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReporter {
    Enabled {
        crash_dir: PathBuf,
        newly_installed: bool,
    },
    Disabled {
        attempted_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Install a process-wide panic hook that writes one crash report per panic
/// under `<data_dir>/logs/crash`, then defers to the previous hook. Only the
/// first successful call installs anything.
pub fn install_crash_reporter(data_dir: Option<&Path>) -> CrashReporter {
    let mut installed = CRASH_DIR.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(dir) = installed.as_ref() {
        return CrashReporter::Enabled {
            crash_dir: dir.clone(),
            newly_installed: false,
        };
    }

    let Some(data_dir) = data_dir else {
        return CrashReporter::Disabled {
            attempted_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };
    let dir = crash_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&dir) {
        return CrashReporter::Disabled {
            attempted_dir: Some(dir),
            reason: format!("failed to create crash directory: {error}"),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_crash(&hook_dir, info);
        previous_hook(info);
    }));

    *installed = Some(dir.clone());
    CrashReporter::Enabled {
        crash_dir: dir,
        newly_installed: true,
    }
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic raised while this thread is already writing a report is left
    // to the previous hook.
    if WRITING_CRASH.with(|writing| writing.replace(true)) {
        return;
    }

    if let Err(error) = CrashReport::capture(info).write_to(crash_dir) {
        eprintln!(
            "Warning: could not write crash report under '{}': {error}",
            crash_dir.display()
        );
    }

    WRITING_CRASH.with(|writing| writing.set(false));
}

/// Human-readable panic payload, shared with the worker's `catch_unwind`.
pub fn describe_panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

struct CrashReport {
    timestamp: DateTime<Utc>,
    thread: String,
    location: String,
    message: String,
    context: Option<EncodeContext>,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: Utc::now(),
            thread: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: describe_panic_payload(info.payload()),
            context: current_encode_context(),
            backtrace: Backtrace::capture(),
        }
    }

    /// `crash-<utc>-<job prefix or "process">-<seq>.log`.
    fn file_name(&self, sequence: u64) -> String {
        let scope = match self.context.as_ref().and_then(|ctx| ctx.job_id) {
            Some(job_id) => {
                let mut short = job_id.simple().to_string();
                short.truncate(8);
                short
            }
            None => "process".to_string(),
        };
        format!(
            "crash-{}-{scope}-{sequence:04}.log",
            self.timestamp.format("%Y%m%dT%H%M%S%.3f")
        )
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(self.file_name(sequence));
        fs::write(&path, self.to_string())?;
        Ok(path)
    }
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(f, "thread={}", self.thread)?;
        writeln!(f, "location={}", self.location)?;
        writeln!(f, "payload={}", self.message)?;

        match &self.context {
            Some(ctx) => {
                match ctx.job_id {
                    Some(job_id) => writeln!(f, "job_id={job_id}")?,
                    None => writeln!(f, "job_id=request")?,
                }
                writeln!(f, "total_frames={}", ctx.total_frames)?;
                if let Some(stage) = ctx.stage {
                    writeln!(f, "stage={}", stage.as_str())?;
                }
                if let Some(index) = ctx.frame_index {
                    writeln!(f, "frame_index={index}")?;
                }
            }
            None => writeln!(f, "job_id=none")?,
        }

        match self.backtrace.status() {
            BacktraceStatus::Captured => {
                writeln!(f, "backtrace_policy=captured")?;
                writeln!(f, "backtrace:")?;
                writeln!(f, "{}", self.backtrace)
            }
            BacktraceStatus::Disabled => {
                writeln!(f, "backtrace_policy=disabled (set RUST_BACKTRACE=1 to enable)")
            }
            _ => writeln!(f, "backtrace_policy=unsupported"),
        }
    }
}

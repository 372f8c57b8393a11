//! Log output for the daemon.
//!
//! A deployed daemon writes JSON lines to a daily file under the log
//! directory and a plain compact stream to stdout for the journal. A
//! development run gets pretty stdout output with span timings and the
//! HTTP request spans.
//!
//! [`LogSettings`] reads the environment once, so the choice of outputs can
//! be checked without installing a global subscriber.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Daily files kept before the oldest is removed.
const KEPT_LOG_FILES: usize = 14;

/// Where and how the daemon logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// JSON files plus journal output instead of pretty stdout.
    pub production: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for the daily files.
    pub dir: PathBuf,
}

impl LogSettings {
    /// Reads `GASMASK_ENV`, `GASMASK_LOG_LEVEL` and `GASMASK_LOG_DIR`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            production: production_from(lookup("GASMASK_ENV").as_deref()),
            level: lookup("GASMASK_LOG_LEVEL")
                .filter(|level| !level.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            dir: lookup("GASMASK_LOG_DIR").map_or_else(default_log_dir, PathBuf::from),
        }
    }

    /// `RUST_LOG` when set, otherwise the configured level. Development runs
    /// also show the per-request spans.
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let filter = EnvFilter::try_new(&self.level)
            .with_context(|| format!("Invalid log level {:?}", self.level))?;
        if self.production {
            Ok(filter)
        } else {
            Ok(filter.add_directive("tower_http=debug".parse()?))
        }
    }
}

/// Keeps the background log writers running. Dropping it flushes and stops
/// them, so hold it until the daemon exits.
#[must_use = "logs stop being written once the guard is dropped"]
pub struct LogGuard {
    _writers: Vec<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the level does not parse, the log directory cannot be
/// created, or a subscriber is already installed.
pub fn init(settings: &LogSettings) -> anyhow::Result<LogGuard> {
    let filter = settings.filter()?;

    if !settings.production {
        tracing_subscriber::registry()
            .with(filter)
            .with(pretty_layer())
            .try_init()?;
        return Ok(LogGuard {
            _writers: Vec::new(),
        });
    }

    let (file, file_guard) = tracing_appender::non_blocking(daily_file(&settings.dir)?);
    let (journal, journal_guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer(file))
        .with(journal_layer(journal))
        .try_init()?;

    Ok(LogGuard {
        _writers: vec![file_guard, journal_guard],
    })
}

fn daily_file(dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("gasmask")
        .filename_suffix("log")
        .max_log_files(KEPT_LOG_FILES)
        .build(dir)
        .with_context(|| format!("Failed to open log file in {}", dir.display()))
}

fn json_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
}

/// journald adds its own timestamps and does not render colours.
fn journal_layer<S>(writer: NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(writer)
        .with_ansi(false)
        .without_time()
}

fn pretty_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .pretty()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
}

/// `GASMASK_ENV=production` or `development` wins; otherwise release builds
/// count as production.
fn production_from(env: Option<&str>) -> bool {
    match env.map(str::to_ascii_lowercase).as_deref() {
        Some("production" | "prod") => true,
        Some("development" | "dev") => false,
        _ => !cfg!(debug_assertions),
    }
}

fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        return PathBuf::from("/var/log/gasmask");
    }
    directories::ProjectDirs::from("", "", "gasmask")
        .map_or_else(|| PathBuf::from("logs"), |dirs| dirs.data_dir().join("logs"))
}

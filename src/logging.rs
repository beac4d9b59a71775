//! Logging setup for the forkfut binary and embedding programs.
//!
//! The subscriber is installed once in the parent and copied into every
//! worker by `fork`. A worker has no threads besides the one that forked,
//! so all writers here are synchronous: a background flushing thread would
//! not exist on the child side and buffered lines would be lost at `_exit`.
//!
//! Environment overrides:
//!
//! - `FORKFUT_LOG` (or `RUST_LOG`): filter directives
//! - `FORKFUT_LOG_LEVEL`: error, warn, info, debug or trace
//! - `FORKFUT_LOG_FORMAT`: pretty, compact or json
//! - `FORKFUT_LOG_FILE`: also append events to this file
//!
//! ```no_run
//! use forkfut::logging::{LogConfig, init_from_config};
//!
//! init_from_config(LogConfig::from_verbosity(1).with_env_overrides());
//! ```

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// How events are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human oriented.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Subscriber settings, filled from CLI flags and then the environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when no filter is set.
    pub level: Level,
    pub format: LogFormat,
    /// Events also go to this file when set.
    pub file_path: Option<PathBuf>,
    /// `EnvFilter` directives; wins over `level`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    /// WARN by default, -v for INFO, -vv for DEBUG, -vvv and up for TRACE.
    pub fn from_verbosity(verbose: u8) -> Self {
        let level = match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self::default().with_level(level)
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Fill unset fields from `FORKFUT_LOG*` and `RUST_LOG`.
    ///
    /// A filter already set by the caller is kept, and `FORKFUT_LOG_LEVEL`
    /// only applies while no filter is set. Format and file always follow
    /// the environment when present.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var("FORKFUT_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("FORKFUT_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("FORKFUT_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Ok(path) = std::env::var("FORKFUT_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.as_str().to_ascii_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    }
}

/// Open `path` for appending, creating its directory if needed.
///
/// The parent and every worker hold the same append-mode descriptor, so
/// their lines interleave whole instead of overwriting each other.
fn open_log_file(path: &Path) -> io::Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"))?;
    std::fs::create_dir_all(dir)?;

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .map_err(io::Error::other)
}

/// Install the global subscriber. Later calls are ignored.
///
/// Events always go to stderr. When `config.file_path` is set they are
/// appended to that file as well; if it cannot be opened a warning is
/// printed and logging continues on stderr only.
pub fn init_from_config(config: LogConfig) {
    let mut layers = vec![fmt_layer(
        config.format,
        io::stderr,
        io::stderr().is_terminal(),
    )];

    if let Some(path) = &config.file_path {
        match open_log_file(path) {
            Ok(file) => layers.push(fmt_layer(config.format, file, false)),
            Err(e) => eprintln!(
                "Warning: Failed to open log file '{}': {}. Logging to stderr only.",
                path.display(),
                e
            ),
        }
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

//! Structured logging for jsbridge
//!
//! The library itself only emits `tracing` events; host applications that
//! have no subscriber of their own can install one with [`init_logging`].
//!
//! ```ignore
//! use jsbridge_core::logging::{init_logging, LogConfig, LogFormat};
//!
//! let mut config = LogConfig::default();
//! config.format = LogFormat::Json;
//! // Task-level dispatcher events without tracing everything else.
//! config.components.insert("dispatcher".into(), "trace".into());
//! init_logging(&config)?;
//! ```
//!
//! # Fields
//!
//! - `thread`: dispatcher thread name
//! - `task`: dispatcher task id
//! - `backend`, `engine`: backend kind and engine name
//! - `generation`: embedding generation on registry create/evict
//! - `category`, `error_type`: translated script errors
//!
//! Script source text and host values are never logged.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tracing_fmt};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Modules that accept a per-component level in [`LogConfig::components`].
pub const COMPONENTS: &[&str] = &[
    "backend",
    "codec",
    "dispatcher",
    "engine",
    "error",
    "member",
    "memory",
    "registry",
];

const CRATE_TARGET: &str = "jsbridge_core";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// The `[logging]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base level for every target; `RUST_LOG` takes precedence over the
    /// whole filter.
    pub level: String,
    pub format: LogFormat,
    /// Optional log file, appended to alongside stderr.
    pub file: Option<PathBuf>,
    /// Level overrides for individual jsbridge modules, keyed by a name
    /// from [`COMPONENTS`].
    pub components: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            components: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directives for this configuration, base level first.
    pub fn filter_directives(&self) -> Result<String, LogError> {
        parse_level(&self.level)?;
        let mut directives = vec![self.level.to_lowercase()];
        for (component, level) in &self.components {
            if !COMPONENTS.contains(&component.as_str()) {
                return Err(LogError::UnknownComponent(component.clone()));
            }
            parse_level(level)?;
            directives.push(format!(
                "{CRATE_TARGET}::{component}={}",
                level.to_lowercase()
            ));
        }
        Ok(directives.join(","))
    }
}

fn parse_level(level: &str) -> Result<Level, LogError> {
    level
        .parse::<Level>()
        .map_err(|_| LogError::InvalidLevel(level.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level '{0}', expected trace, debug, info, warn or error")]
    InvalidLevel(String),

    #[error("unknown logging component '{0}'")]
    UnknownComponent(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

type FilteredRegistry = Layered<EnvFilter, Registry>;
type OutputLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> OutputLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true);
    match format {
        LogFormat::Pretty => layer.with_ansi(ansi).boxed(),
        LogFormat::Json => layer
            .json()
            .with_timer(SystemTime)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Install the global subscriber. Subsequent calls return
/// [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    let directives = config.filter_directives()?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        layers.push(output_layer(config.format, open_log_file(path)?, false));
    }
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(env_filter).with(layers),
    )?;

    let _ = LOGGING_INITIALIZED.set(true);
    tracing::info!(
        filter = %directives,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

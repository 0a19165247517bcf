//! # Postfix Queue Exporter
//!
//! A Prometheus exporter that watches a Postfix installation from the outside:
//! the on-disk spool queues, the liveness of the `master` process, and the
//! stream of `smtp`/`smtpd` log lines forwarded by syslog over a local
//! datagram socket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         POSTFIX QUEUE EXPORTER                           │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  SIZE + LIVENESS SAMPLER (5s) ─┐                                         │
//! │  AGE SAMPLER (60s) ────────────┼──► METRICS REGISTRY ◄── HTTP /metrics   │
//! │  SYSLOG DATAGRAM CLASSIFIER ───┘                                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The workers never talk to each other. Each one owns a disjoint set of
//! series in the shared [`MetricsRegistry`] and loops until shutdown. A worker
//! that stops on its own is treated as fatal so a supervisor can restart the
//! process.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::ParseIntError;
use std::os::unix::fs::MetadataExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::{TcpListener, UnixDatagram};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::{self, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use futures::future::try_join_all;
use futures::FutureExt;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// HTTP Exposition
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::CompressionLayer;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::{Captures, Regex};

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::Collector as PrometheusCollector;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "postfix-exporter";
pub const EXPORTER_FULL_NAME: &str = "Postfix Queue Exporter";

// ----------------------------------------------------------------------------
// Filesystem Layout
// ----------------------------------------------------------------------------

/// Default Postfix spool root (`queue_directory` in main.cf)
pub const DEFAULT_SPOOL_DIR: &str = "/var/spool/postfix";

/// Default location of the master daemon PID file
pub const DEFAULT_PID_FILE: &str = "/var/spool/postfix/pid/master.pid";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Queue size and liveness sampling period (seconds)
pub const DEFAULT_SIZE_INTERVAL_SECS: u64 = 5;

/// Queue age sampling period (seconds)
pub const DEFAULT_AGE_INTERVAL_SECS: u64 = 60;

/// Pause after a failed datagram receive (milliseconds)
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 1000;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default HTTP port for the metrics endpoint
pub const DEFAULT_HTTP_PORT: u16 = 9154;

/// Default metrics path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Only compress response bodies larger than this (bytes)
pub const DEFAULT_COMPRESSION_THRESHOLD: u16 = 512;

/// Listen backlog for the metrics sockets
pub const HTTP_LISTEN_BACKLOG: i32 = 1024;

/// Largest syslog datagram we accept in a single receive
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Body returned for any path other than the metrics path
pub const NOT_FOUND_BODY: &str = "Not Found\n";

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "POSTFIX_EXPORTER_";

// ----------------------------------------------------------------------------
// Classification
// ----------------------------------------------------------------------------

/// DSN recorded for messages accepted into the incoming queue
pub const QUEUED_DSN: &str = "2.0.0";

/// Delivery delay histogram buckets (seconds), 100ms up to one week
pub const DELIVERY_DELAY_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14_400.0, 86_400.0,
    259_200.0, 604_800.0,
];

// ----------------------------------------------------------------------------
// Log Targets
// ----------------------------------------------------------------------------

const TARGET_ENGINE: &str = "postfix_exporter::engine";
const TARGET_SIZE: &str = "postfix_exporter::sampler::size";
const TARGET_AGE: &str = "postfix_exporter::sampler::age";
const TARGET_LIVENESS: &str = "postfix_exporter::liveness";
const TARGET_CLASSIFIER: &str = "postfix_exporter::classifier";
const TARGET_HTTP: &str = "postfix_exporter::http";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Build from a `(seconds, nanoseconds)` pair as found in `struct stat`.
    #[inline]
    pub fn from_secs_nanos(secs: i64, nanos: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000).saturating_add(nanos))
    }

    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Seconds as a float, the unit Prometheus expects for timestamps.
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Queues
// ----------------------------------------------------------------------------

/// The Postfix queues that are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Incoming,
    Active,
    Corrupt,
    Hold,
    Deferred,
}

/// How queue files are laid out below the queue directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLayout {
    /// Files sit directly inside the queue directory
    Flat,
    /// Files sit one subdirectory below the queue directory (`deferred/A/ABC123`)
    Sharded,
}

impl Queue {
    pub const ALL: [Queue; 5] = [
        Queue::Incoming,
        Queue::Active,
        Queue::Corrupt,
        Queue::Hold,
        Queue::Deferred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Incoming => "incoming",
            Queue::Active => "active",
            Queue::Corrupt => "corrupt",
            Queue::Hold => "hold",
            Queue::Deferred => "deferred",
        }
    }

    pub fn layout(&self) -> QueueLayout {
        match self {
            Queue::Deferred => QueueLayout::Sharded,
            _ => QueueLayout::Flat,
        }
    }

    pub fn directory(&self, spool_dir: &Path) -> PathBuf {
        spool_dir.join(self.as_str())
    }
}

impl Display for Queue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Error Phases & Liveness
// ----------------------------------------------------------------------------

/// Which sampling step produced a queue processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scan,
    Stat,
    Up,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scan => "scan",
            Phase::Stat => "stat",
            Phase::Up => "up",
        }
    }
}

/// Liveness of the Postfix master process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Up,
    Down,
}

impl Liveness {
    pub fn as_gauge(&self) -> i64 {
        match self {
            Liveness::Up => 1,
            Liveness::Down => 0,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Log Events
// ----------------------------------------------------------------------------

/// Outcome of classifying one log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// Delivery agent report carrying `delay=`, `dsn=` and `status=`
    Delay { delay: f64, dsn: String, status: String },
    /// smtpd accepted a TCP connection
    Connect,
    /// smtpd closed a TCP connection
    Disconnect,
    /// smtpd assigned a queue id to a client submission
    Queued { queue_id: String },
    /// smtpd rejected a recipient before queueing
    Rejected { dsn: String },
    /// Nothing matched
    Ignored,
}

impl LogEvent {
    /// Value of the `type` label on `log_messages_total`.
    pub fn message_type(&self) -> &'static str {
        match self {
            LogEvent::Delay { .. } => "delay",
            LogEvent::Connect => "connect",
            LogEvent::Disconnect => "disconnect",
            LogEvent::Queued { .. } => "queued",
            LogEvent::Rejected { .. } => "noqueue",
            LogEvent::Ignored => "ignored",
        }
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING SYSTEM
// ============================================================================
// Errors that end up in a metric expose `class()`, a stable short name used as
// the `class` label so series cardinality stays bounded.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Exporter Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Socket error on {}: {source}", .path.display())]
    Socket { path: PathBuf, source: io::Error },

    #[error("Cannot listen on {addr}: {source}")]
    Listener { addr: SocketAddr, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker '{worker}' exited before shutdown")]
    WorkerExited { worker: &'static str },

    #[error("Worker '{worker}' failed: {source}")]
    WorkerFailed {
        worker: &'static str,
        source: Box<ExporterError>,
    },

    #[error("Worker '{worker}' panicked: {message}")]
    WorkerPanicked { worker: &'static str, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Pattern(_) => "pattern",
            ExporterError::Socket { .. } => "socket",
            ExporterError::Listener { .. } => "listener",
            ExporterError::Io(_) => "io",
            ExporterError::WorkerExited { .. } => "worker_exited",
            ExporterError::WorkerFailed { .. } => "worker_failed",
            ExporterError::WorkerPanicked { .. } => "worker_panicked",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Failed to serialize configuration: {message}")]
    SerializeError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Queue Scan Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("cannot read queue directory {}: {source}", .path.display())]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("cannot stat {}: {source}", .path.display())]
    Stat { path: PathBuf, source: io::Error },

    #[error("invalid glob pattern for {}: {source}", .path.display())]
    Pattern {
        path: PathBuf,
        source: glob::PatternError,
    },

    #[error("queue traversal failed: {0}")]
    Glob(#[from] glob::GlobError),
}

impl ScanError {
    pub fn class(&self) -> &'static str {
        match self {
            ScanError::ReadDir { source, .. } | ScanError::Stat { source, .. } => {
                io_error_class(source.kind())
            }
            ScanError::Pattern { .. } => "PatternError",
            ScanError::Glob(e) => io_error_class(e.error().kind()),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Liveness Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("PID file {} does not hold a process id: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: ParseIntError,
    },
}

impl LivenessError {
    pub fn class(&self) -> &'static str {
        match self {
            LivenessError::Parse { .. } => "ParseIntError",
        }
    }
}

/// Stable label value for an IO error kind.
pub fn io_error_class(kind: io::ErrorKind) -> &'static str {
    match kind {
        io::ErrorKind::NotFound => "NotFound",
        io::ErrorKind::PermissionDenied => "PermissionDenied",
        io::ErrorKind::ConnectionRefused => "ConnectionRefused",
        io::ErrorKind::ConnectionReset => "ConnectionReset",
        io::ErrorKind::AddrInUse => "AddrInUse",
        io::ErrorKind::AddrNotAvailable => "AddrNotAvailable",
        io::ErrorKind::AlreadyExists => "AlreadyExists",
        io::ErrorKind::WouldBlock => "WouldBlock",
        io::ErrorKind::InvalidInput => "InvalidInput",
        io::ErrorKind::InvalidData => "InvalidData",
        io::ErrorKind::TimedOut => "TimedOut",
        io::ErrorKind::Interrupted => "Interrupted",
        io::ErrorKind::UnexpectedEof => "UnexpectedEof",
        io::ErrorKind::OutOfMemory => "OutOfMemory",
        _ => "Other",
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type ExporterResult<T> = Result<T, ExporterError>;

pub type ScanResult<T> = Result<T, ScanError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Defaults, then an optional TOML file, then `POSTFIX_EXPORTER_*` environment
// variables (`__` separates sections).
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// What to sample and where it lives
    #[serde(default)]
    pub exporter: CollectionConfig,

    /// Metrics endpoint
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment
    pub fn parse_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let exporter = &self.exporter;

        if !exporter.spool_dir.is_absolute() {
            return Err(ConfigError::invalid_value(
                "exporter.spool_dir",
                "spool directory must be an absolute path",
            ));
        }
        if exporter.size_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.size_interval_secs",
                "interval must be at least 1 second",
            ));
        }
        if exporter.age_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "exporter.age_interval_secs",
                "interval must be at least 1 second",
            ));
        }
        if self.http.port == 0 {
            return Err(ConfigError::invalid_value("http.port", "port must not be 0"));
        }
        if !self.http.path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "http.path",
                format!("'{}' must start with '/'", self.http.path),
            ));
        }

        Ok(())
    }

    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::SerializeError {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 5.2 Collection Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Postfix spool root holding the queue directories
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    /// PID file written by the master daemon
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Datagram socket syslog forwards mail logs to. Log classification is
    /// disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_socket: Option<PathBuf>,

    #[serde(default = "default_size_interval")]
    pub size_interval_secs: u64,

    #[serde(default = "default_age_interval")]
    pub age_interval_secs: u64,

    /// Pause after a failed receive on the syslog socket
    #[serde(default = "default_error_backoff")]
    pub error_backoff_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            pid_file: default_pid_file(),
            syslog_socket: None,
            size_interval_secs: default_size_interval(),
            age_interval_secs: default_age_interval(),
            error_backoff_ms: default_error_backoff(),
        }
    }
}

impl CollectionConfig {
    pub fn size_interval(&self) -> Duration {
        Duration::from_secs(self.size_interval_secs)
    }

    pub fn age_interval(&self) -> Duration {
        Duration::from_secs(self.age_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SPOOL_DIR)
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}

fn default_size_interval() -> u64 {
    DEFAULT_SIZE_INTERVAL_SECS
}

fn default_age_interval() -> u64 {
    DEFAULT_AGE_INTERVAL_SECS
}

fn default_error_backoff() -> u64 {
    DEFAULT_ERROR_BACKOFF_MS
}

// ----------------------------------------------------------------------------
// 5.3 HTTP Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port bound on both `0.0.0.0` and `[::]`
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Bodies at or below this size are sent uncompressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            path: default_metrics_path(),
            compression_threshold_bytes: default_compression_threshold(),
        }
    }
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

fn default_compression_threshold() -> u16 {
    DEFAULT_COMPRESSION_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: TARGET_ENGINE,
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: METRICS REGISTRY
// ============================================================================
// A thin layer over a private `prometheus::Registry`. Every handle it returns
// is internally synchronized, so samplers and the classifier can write from
// their own tasks while the HTTP layer gathers concurrently.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metric Kinds & Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Serialized registry contents, ready to be sent to a scraper.
#[derive(Debug, Clone)]
pub struct Exposition {
    pub content_type: String,
    pub body: String,
}

#[derive(Default)]
pub struct MetricsRegistry {
    inner: PrometheusRegistry,
    declared: Mutex<Vec<(String, MetricKind)>>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("declared", &*self.declared.lock())
            .finish()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register<C>(&self, name: &str, kind: MetricKind, collector: C) -> ExporterResult<C>
    where
        C: PrometheusCollector + Clone + 'static,
    {
        self.inner.register(Box::new(collector.clone()))?;
        self.declared.lock().push((name.to_string(), kind));
        Ok(collector)
    }

    pub fn counter(&self, name: &str, help: &str) -> ExporterResult<IntCounter> {
        self.register(name, MetricKind::Counter, IntCounter::new(name, help)?)
    }

    pub fn counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> ExporterResult<IntCounterVec> {
        let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
        self.register(name, MetricKind::Counter, counter)
    }

    pub fn gauge(&self, name: &str, help: &str) -> ExporterResult<Gauge> {
        self.register(name, MetricKind::Gauge, Gauge::new(name, help)?)
    }

    pub fn int_gauge(&self, name: &str, help: &str) -> ExporterResult<IntGauge> {
        self.register(name, MetricKind::Gauge, IntGauge::new(name, help)?)
    }

    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> ExporterResult<GaugeVec> {
        let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
        self.register(name, MetricKind::Gauge, gauge)
    }

    pub fn int_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> ExporterResult<IntGaugeVec> {
        let gauge = IntGaugeVec::new(Opts::new(name, help), labels)?;
        self.register(name, MetricKind::Gauge, gauge)
    }

    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: &[f64],
    ) -> ExporterResult<HistogramVec> {
        let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
        self.register(name, MetricKind::Histogram, HistogramVec::new(opts, labels)?)
    }

    /// Names and kinds in declaration order.
    pub fn declared(&self) -> Vec<(String, MetricKind)> {
        self.declared.lock().clone()
    }

    /// Encode every series in the Prometheus text exposition format.
    pub fn snapshot(&self) -> ExporterResult<Exposition> {
        let encoder = TextEncoder::new();
        let families = self.inner.gather();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(&families, &mut buffer)?;
        let body = String::from_utf8(buffer)
            .map_err(|e| ExporterError::Internal(format!("exposition is not UTF-8: {}", e)))?;
        Ok(Exposition {
            content_type: encoder.format_type().to_string(),
            body,
        })
    }
}

// ----------------------------------------------------------------------------
// 7.2 Clamped Gauge
// ----------------------------------------------------------------------------

/// Integer gauge that never drops below zero.
///
/// The exporter can start while sessions are already open, so it may see a
/// disconnect without the matching connect. The lock makes the
/// read-clamp-write sequence atomic across concurrent callers.
pub struct ClampedGauge {
    gauge: IntGauge,
    lock: Mutex<()>,
}

impl fmt::Debug for ClampedGauge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClampedGauge")
            .field("value", &self.gauge.get())
            .finish()
    }
}

impl ClampedGauge {
    pub fn new(gauge: IntGauge) -> Self {
        Self {
            gauge,
            lock: Mutex::new(()),
        }
    }

    /// Apply `delta`, flooring the result at zero. Returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        let _guard = self.lock.lock();
        let next = self.gauge.get().saturating_add(delta).max(0);
        self.gauge.set(next);
        next
    }

    pub fn get(&self) -> i64 {
        self.gauge.get()
    }
}

// ----------------------------------------------------------------------------
// 7.3 Queue Metrics
// ----------------------------------------------------------------------------

/// Series written by the queue samplers and the liveness probe.
pub struct QueueMetrics {
    pub start_time: Gauge,
    pub oldest_message: GaugeVec,
    pub queue_size: IntGaugeVec,
    pub processing_errors: IntCounterVec,
    pub up: IntGauge,
}

impl fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMetrics")
            .field("up", &self.up.get())
            .finish_non_exhaustive()
    }
}

impl QueueMetrics {
    pub fn register(registry: &MetricsRegistry) -> ExporterResult<Self> {
        let start_time = registry.gauge(
            "exporter_start_time_seconds",
            "Unix time at which the exporter started",
        )?;
        start_time.set(Timestamp::now().as_secs_f64());

        Ok(Self {
            start_time,
            oldest_message: registry.gauge_vec(
                "oldest_message_timestamp_seconds",
                "Change time of the oldest file in the queue, or now when the queue is empty",
                &["queue"],
            )?,
            queue_size: registry.int_gauge_vec(
                "queue_size",
                "Number of messages in the queue",
                &["queue"],
            )?,
            processing_errors: registry.counter_vec(
                "queue_processing_error_total",
                "Errors while sampling queues or the master process",
                &["class", "phase"],
            )?,
            up: registry.int_gauge("up", "Whether the Postfix master process is running")?,
        })
    }

    pub fn record_error(&self, class: &str, phase: Phase) {
        self.processing_errors
            .with_label_values(&[class, phase.as_str()])
            .inc();
    }
}

// ----------------------------------------------------------------------------
// 7.4 Log Metrics
// ----------------------------------------------------------------------------

/// Series written by the log classifier.
pub struct LogMetrics {
    pub delivery_delays: HistogramVec,
    pub smtpd_connections: IntCounter,
    pub smtpd_active_connections: ClampedGauge,
    pub delivery_attempts: IntCounterVec,
    pub messages: IntCounterVec,
    pub processing_errors: IntCounterVec,
}

impl fmt::Debug for LogMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMetrics")
            .field("smtpd_connections", &self.smtpd_connections.get())
            .field("smtpd_active_connections", &self.smtpd_active_connections)
            .finish_non_exhaustive()
    }
}

impl LogMetrics {
    pub fn register(registry: &MetricsRegistry) -> ExporterResult<Self> {
        Ok(Self {
            delivery_delays: registry.histogram_vec(
                "delivery_delays",
                "Total delivery delay in seconds of sent and bounced messages",
                &["dsn", "status"],
                DELIVERY_DELAY_BUCKETS,
            )?,
            smtpd_connections: registry.counter(
                "smtpd_connections_total",
                "Connections accepted by smtpd",
            )?,
            smtpd_active_connections: ClampedGauge::new(registry.int_gauge(
                "smtpd_active_connections",
                "Connections currently open to smtpd",
            )?),
            delivery_attempts: registry.counter_vec(
                "incoming_delivery_attempts_total",
                "Incoming submissions by outcome",
                &["dsn", "status"],
            )?,
            messages: registry.counter_vec(
                "log_messages_total",
                "Log lines received, by classification",
                &["type"],
            )?,
            processing_errors: registry.counter_vec(
                "log_processing_error_total",
                "Errors while receiving or processing log lines",
                &["class"],
            )?,
        })
    }

    /// Fold one classified line into the series it affects.
    pub fn record(&self, event: &LogEvent) {
        match event {
            LogEvent::Delay { delay, dsn, status } => {
                // Terminal outcomes only.
                if status == "sent" || status == "bounced" {
                    self.delivery_delays
                        .with_label_values(&[dsn.as_str(), status.as_str()])
                        .observe(*delay);
                }
            }
            LogEvent::Connect => {
                self.smtpd_connections.inc();
                self.smtpd_active_connections.add(1);
            }
            LogEvent::Disconnect => {
                self.smtpd_active_connections.add(-1);
            }
            LogEvent::Queued { .. } => {
                self.delivery_attempts
                    .with_label_values(&[QUEUED_DSN, "queued"])
                    .inc();
            }
            LogEvent::Rejected { dsn } => {
                self.delivery_attempts
                    .with_label_values(&[dsn.as_str(), "rejected"])
                    .inc();
            }
            LogEvent::Ignored => {}
        }

        self.messages
            .with_label_values(&[event.message_type()])
            .inc();
    }
}

// ============================================================================
// SECTION 8: QUEUE SCANNING
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Queue Entries
// ----------------------------------------------------------------------------

/// Iterator over the files of one queue.
pub enum QueueEntries {
    Flat { dir: PathBuf, entries: fs::ReadDir },
    Sharded(glob::Paths),
}

impl fmt::Debug for QueueEntries {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            QueueEntries::Flat { dir, .. } => f.debug_struct("Flat").field("dir", dir).finish(),
            QueueEntries::Sharded(_) => f.write_str("Sharded"),
        }
    }
}

impl Iterator for QueueEntries {
    type Item = ScanResult<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            QueueEntries::Flat { dir, entries } => entries.next().map(|entry| {
                entry
                    .map(|e| e.path())
                    .map_err(|source| ScanError::ReadDir {
                        path: dir.clone(),
                        source,
                    })
            }),
            QueueEntries::Sharded(paths) => paths.next().map(|p| p.map_err(ScanError::from)),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Queue Scanner
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueScanner {
    spool_dir: PathBuf,
}

impl QueueScanner {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub fn entries(&self, queue: Queue) -> ScanResult<QueueEntries> {
        let dir = queue.directory(&self.spool_dir);

        match queue.layout() {
            QueueLayout::Flat => {
                let entries = fs::read_dir(&dir).map_err(|source| ScanError::ReadDir {
                    path: dir.clone(),
                    source,
                })?;
                Ok(QueueEntries::Flat { dir, entries })
            }
            QueueLayout::Sharded => {
                // glob yields nothing for a missing root, so check it explicitly.
                fs::metadata(&dir).map_err(|source| ScanError::ReadDir {
                    path: dir.clone(),
                    source,
                })?;
                let pattern = format!("{}/*/*", glob::Pattern::escape(&dir.to_string_lossy()));
                let paths = glob::glob(&pattern)
                    .map_err(|source| ScanError::Pattern { path: dir, source })?;
                Ok(QueueEntries::Sharded(paths))
            }
        }
    }

    pub fn count(&self, queue: Queue) -> ScanResult<u64> {
        self.entries(queue)?
            .try_fold(0u64, |count, entry| entry.map(|_| count + 1))
    }

    /// Change time of the oldest entry. An empty queue reports `now`.
    pub fn oldest(&self, queue: Queue, now: Timestamp) -> ScanResult<Timestamp> {
        let mut oldest = now;
        for entry in self.entries(queue)? {
            let path = entry?;
            oldest = oldest.min(entry_timestamp(&path, now)?);
        }
        Ok(oldest)
    }
}

/// Change time of a queue file. A file that vanished after being listed was
/// delivered or moved in the meantime and counts as `now`.
pub fn entry_timestamp(path: &Path, now: Timestamp) -> ScanResult<Timestamp> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(Timestamp::from_secs_nanos(
            metadata.ctime(),
            metadata.ctime_nsec(),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(now),
        Err(source) => Err(ScanError::Stat {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ============================================================================
// SECTION 9: WORKER FRAMEWORK
// ============================================================================

/// A long-running unit of work supervised by [`Exporter`].
///
/// `run` must only return once `shutdown` is cancelled. Returning earlier,
/// with or without an error, brings the whole exporter down.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, shutdown: CancellationToken) -> ExporterResult<()>;
}

// ============================================================================
// SECTION 10: LIVENESS PROBE
// ============================================================================

#[derive(Debug, Clone)]
pub struct LivenessProbe {
    pid_file: PathBuf,
}

impl LivenessProbe {
    pub fn new(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
        }
    }

    /// Read the PID file and test whether that process exists.
    ///
    /// An unreadable PID file means the master is not running. Content that
    /// is not a number is reported as an error so it gets counted.
    pub fn probe(&self) -> Result<Liveness, LivenessError> {
        let contents = match fs::read_to_string(&self.pid_file) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(target: TARGET_LIVENESS,
                    path = %self.pid_file.display(), error = %e,
                    "PID file unreadable");
                return Ok(Liveness::Down);
            }
        };

        let pid: i32 = contents
            .trim()
            .parse()
            .map_err(|source| LivenessError::Parse {
                path: self.pid_file.clone(),
                source,
            })?;

        if pid <= 1 {
            return Ok(Liveness::Down);
        }

        Ok(liveness_from_signal(kill(Pid::from_raw(pid), None)))
    }

    /// Probe and publish. On error the `up` gauge keeps its last value.
    pub fn update(&self, metrics: &QueueMetrics) {
        match self.probe() {
            Ok(liveness) => metrics.up.set(liveness.as_gauge()),
            Err(e) => {
                error!(target: TARGET_LIVENESS,
                    class = e.class(), phase = Phase::Up.as_str(), error = %e,
                    "Liveness check failed");
                metrics.record_error(e.class(), Phase::Up);
            }
        }
    }
}

/// Interpret the result of sending signal 0.
///
/// `EPERM` means the process exists but belongs to someone else, which is
/// exactly the case for a root-owned master seen from an unprivileged exporter.
pub fn liveness_from_signal(result: nix::Result<()>) -> Liveness {
    match result {
        Ok(()) | Err(Errno::EPERM) => Liveness::Up,
        Err(_) => Liveness::Down,
    }
}

// ============================================================================
// SECTION 11: QUEUE SAMPLERS
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Size & Liveness Sampler
// ----------------------------------------------------------------------------

/// Counts queue entries, then checks the master process.
#[derive(Debug, Clone)]
pub struct QueueSizeSampler {
    scanner: QueueScanner,
    liveness: LivenessProbe,
    metrics: Arc<QueueMetrics>,
    interval: Duration,
}

impl QueueSizeSampler {
    pub fn new(
        scanner: QueueScanner,
        liveness: LivenessProbe,
        metrics: Arc<QueueMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            scanner,
            liveness,
            metrics,
            interval,
        }
    }

    /// One full cycle. A failing queue is skipped; the others still update.
    pub fn sample(&self) {
        for queue in Queue::ALL {
            match self.scanner.count(queue) {
                Ok(count) => {
                    self.metrics
                        .queue_size
                        .with_label_values(&[queue.as_str()])
                        .set(count as i64);
                }
                Err(e) => {
                    error!(target: TARGET_SIZE,
                        queue = %queue, class = e.class(), phase = Phase::Scan.as_str(),
                        error = %e, "Queue scan failed");
                    self.metrics.record_error(e.class(), Phase::Scan);
                }
            }
        }

        self.liveness.update(&self.metrics);
    }
}

#[async_trait]
impl Worker for QueueSizeSampler {
    fn name(&self) -> &'static str {
        "queue-size"
    }

    async fn run(&self, shutdown: CancellationToken) -> ExporterResult<()> {
        info!(target: TARGET_SIZE,
            spool = %self.scanner.spool_dir().display(),
            interval_secs = self.interval.as_secs(),
            "Queue size sampler started");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let sampler = self.clone();
                    task::spawn_blocking(move || sampler.sample())
                        .await
                        .map_err(|e| ExporterError::Internal(format!("queue size cycle aborted: {}", e)))?;
                }
            }
        }

        info!(target: TARGET_SIZE, "Queue size sampler stopped");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.2 Age Sampler
// ----------------------------------------------------------------------------

/// Publishes the change time of the oldest file in each queue.
#[derive(Debug, Clone)]
pub struct QueueAgeSampler {
    scanner: QueueScanner,
    metrics: Arc<QueueMetrics>,
    interval: Duration,
}

impl QueueAgeSampler {
    pub fn new(scanner: QueueScanner, metrics: Arc<QueueMetrics>, interval: Duration) -> Self {
        Self {
            scanner,
            metrics,
            interval,
        }
    }

    pub fn sample(&self) {
        let now = Timestamp::now();

        for queue in Queue::ALL {
            match self.scanner.oldest(queue, now) {
                Ok(oldest) => {
                    trace!(target: TARGET_AGE,
                        queue = %queue, oldest = %oldest,
                        age_secs = now.duration_since(oldest).as_secs(),
                        "Queue age sampled");
                    self.metrics
                        .oldest_message
                        .with_label_values(&[queue.as_str()])
                        .set(oldest.as_secs_f64());
                }
                Err(e) => {
                    error!(target: TARGET_AGE,
                        queue = %queue, class = e.class(), phase = Phase::Stat.as_str(),
                        error = %e, "Queue age scan failed");
                    self.metrics.record_error(e.class(), Phase::Stat);
                }
            }
        }
    }
}

#[async_trait]
impl Worker for QueueAgeSampler {
    fn name(&self) -> &'static str {
        "queue-age"
    }

    async fn run(&self, shutdown: CancellationToken) -> ExporterResult<()> {
        info!(target: TARGET_AGE,
            interval_secs = self.interval.as_secs(), "Queue age sampler started");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let sampler = self.clone();
                    task::spawn_blocking(move || sampler.sample())
                        .await
                        .map_err(|e| ExporterError::Internal(format!("queue age cycle aborted: {}", e)))?;
                }
            }
        }

        info!(target: TARGET_AGE, "Queue age sampler stopped");
        Ok(())
    }
}

// ============================================================================
// SECTION 12: LOG CLASSIFICATION
// ============================================================================
// An ordered table of patterns; the first one that matches and extracts an
// event wins. New line formats are added by appending a row.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Pattern Table
// ----------------------------------------------------------------------------

type Extractor = fn(&Captures<'_>) -> Option<LogEvent>;

struct LogPattern {
    name: &'static str,
    regex: Regex,
    extract: Extractor,
}

const DELAY_PATTERN: &str =
    r"\bdelay=(?P<delay>\d+(?:\.\d+)?),.*\bdsn=(?P<dsn>\d\.\d{1,3}\.\d{1,3}),\s*status=(?P<status>[a-z]+)";
const CONNECT_PATTERN: &str = r"smtpd\[\d+\]: connect from ";
const DISCONNECT_PATTERN: &str = r"smtpd\[\d+\]: disconnect from ";
const QUEUED_PATTERN: &str = r"smtpd\[\d+\]: (?P<queue_id>[0-9A-Za-z]+): client=";
const NOQUEUE_PATTERN: &str =
    r"smtpd\[\d+\]: NOQUEUE: reject: .*?: \d{3} (?P<dsn>\d\.\d{1,3}\.\d{1,3})\b";

fn extract_delay(caps: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Delay {
        delay: caps.name("delay")?.as_str().parse().ok()?,
        dsn: caps.name("dsn")?.as_str().to_string(),
        status: caps.name("status")?.as_str().to_string(),
    })
}

fn extract_connect(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Connect)
}

fn extract_disconnect(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Disconnect)
}

fn extract_queued(caps: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Queued {
        queue_id: caps.name("queue_id")?.as_str().to_string(),
    })
}

fn extract_rejected(caps: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Rejected {
        dsn: caps.name("dsn")?.as_str().to_string(),
    })
}

// ----------------------------------------------------------------------------
// 12.2 Classifier
// ----------------------------------------------------------------------------

pub struct LogClassifier {
    patterns: Vec<LogPattern>,
}

impl fmt::Debug for LogClassifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogClassifier")
            .field("patterns", &self.pattern_names())
            .finish()
    }
}

impl LogClassifier {
    pub fn new() -> ExporterResult<Self> {
        let table: [(&'static str, &str, Extractor); 5] = [
            ("delay", DELAY_PATTERN, extract_delay),
            ("connect", CONNECT_PATTERN, extract_connect),
            ("disconnect", DISCONNECT_PATTERN, extract_disconnect),
            ("queued", QUEUED_PATTERN, extract_queued),
            ("noqueue", NOQUEUE_PATTERN, extract_rejected),
        ];

        let patterns = table
            .into_iter()
            .map(|(name, pattern, extract)| -> ExporterResult<LogPattern> {
                Ok(LogPattern {
                    name,
                    regex: Regex::new(pattern)?,
                    extract,
                })
            })
            .collect::<ExporterResult<Vec<_>>>()?;

        Ok(Self { patterns })
    }

    pub fn pattern_names(&self) -> Vec<&'static str> {
        self.patterns.iter().map(|p| p.name).collect()
    }

    pub fn classify(&self, line: &str) -> LogEvent {
        self.patterns
            .iter()
            .find_map(|pattern| {
                pattern
                    .regex
                    .captures(line)
                    .and_then(|caps| (pattern.extract)(&caps))
            })
            .unwrap_or(LogEvent::Ignored)
    }
}

// ============================================================================
// SECTION 13: SYSLOG INGESTION
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Socket Binding
// ----------------------------------------------------------------------------

/// Bind a datagram socket at `path`, replacing a stale socket file left by a
/// previous run.
pub fn bind_datagram(path: &Path) -> ExporterResult<UnixDatagram> {
    loop {
        match UnixDatagram::bind(path) {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(target: TARGET_CLASSIFIER,
                    path = %path.display(), "Removing stale syslog socket");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ExporterError::Socket {
                            path: path.to_path_buf(),
                            source,
                        })
                    }
                }
            }
            Err(source) => {
                return Err(ExporterError::Socket {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Datagram Source
// ----------------------------------------------------------------------------

/// Anything that yields one log line per receive.
#[async_trait]
pub trait DatagramSource: Send + Sync {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSource for UnixDatagram {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }
}

// ----------------------------------------------------------------------------
// 13.3 Ingestion Worker
// ----------------------------------------------------------------------------

/// Receives one log line per datagram and classifies it.
#[derive(Debug)]
pub struct LogIngestor {
    socket_path: PathBuf,
    classifier: LogClassifier,
    metrics: Arc<LogMetrics>,
    error_backoff: Duration,
}

impl LogIngestor {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        classifier: LogClassifier,
        metrics: Arc<LogMetrics>,
        error_backoff: Duration,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            classifier,
            metrics,
            error_backoff,
        }
    }

    /// Log and count a failed receive. Returns the `class` label used.
    pub fn record_receive_error(&self, e: &io::Error) -> &'static str {
        let class = io_error_class(e.kind());
        error!(target: TARGET_CLASSIFIER, class, error = %e, "Failed to receive log line");
        self.metrics.processing_errors.with_label_values(&[class]).inc();
        class
    }

    /// Receive and classify until `shutdown` fires. A failed receive is
    /// counted and followed by the error backoff; the loop then resumes.
    pub async fn receive_loop(&self, source: &dyn DatagramSource, shutdown: &CancellationToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = source.recv_datagram(&mut buffer) => match received {
                    Ok(len) => {
                        self.handle_message(&buffer[..len]);
                    }
                    Err(e) => {
                        self.record_receive_error(&e);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = sleep(self.error_backoff) => {}
                        }
                    }
                }
            }
        }
    }

    /// Classify and record one datagram payload.
    pub fn handle_message(&self, payload: &[u8]) -> LogEvent {
        let text = String::from_utf8_lossy(payload);
        let line = text.trim_end_matches(['\n', '\r', '\0']);
        let event = self.classifier.classify(line);
        trace!(target: TARGET_CLASSIFIER, kind = event.message_type(), "Log line classified");
        self.metrics.record(&event);
        event
    }
}

#[async_trait]
impl Worker for LogIngestor {
    fn name(&self) -> &'static str {
        "log-classifier"
    }

    async fn run(&self, shutdown: CancellationToken) -> ExporterResult<()> {
        let socket = bind_datagram(&self.socket_path)?;
        info!(target: TARGET_CLASSIFIER,
            path = %self.socket_path.display(),
            patterns = ?self.classifier.pattern_names(),
            "Listening for syslog datagrams");

        self.receive_loop(&socket, &shutdown).await;

        drop(socket);
        if let Err(e) = fs::remove_file(&self.socket_path) {
            debug!(target: TARGET_CLASSIFIER, error = %e, "Could not remove syslog socket");
        }
        info!(target: TARGET_CLASSIFIER, "Log classifier stopped");
        Ok(())
    }
}

// ============================================================================
// SECTION 14: HTTP EXPOSITION
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Router
// ----------------------------------------------------------------------------

pub fn metrics_router(registry: Arc<MetricsRegistry>, path: &str, compression_threshold: u16) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .fallback(not_found_handler)
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(compression_threshold)))
        .with_state(registry)
}

/// Always answers 200. A failed encode is logged and served as an empty
/// exposition, which the scraper sees as a scrape without samples.
async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    let exposition = registry.snapshot().unwrap_or_else(|e| {
        error!(target: TARGET_HTTP, error = %e, "Failed to encode metrics");
        Exposition {
            content_type: TextEncoder::new().format_type().to_string(),
            body: String::new(),
        }
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, exposition.content_type)],
        exposition.body,
    )
        .into_response()
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        NOT_FOUND_BODY,
    )
}

// ----------------------------------------------------------------------------
// 14.2 Dual-Stack Listeners
// ----------------------------------------------------------------------------

/// Bind a TCP listener; IPv6 sockets are restricted to IPv6 so the IPv4
/// socket on the same port never collides with a mapped address.
pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(HTTP_LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// One listener per address family. Hosts without IPv6 fall back to IPv4 only.
pub fn bind_listeners(port: u16) -> ExporterResult<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(2);

    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    match bind_tcp(v6) {
        Ok(listener) => listeners.push(listener),
        Err(e) => warn!(target: TARGET_HTTP, addr = %v6, error = %e, "IPv6 listener unavailable"),
    }

    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = bind_tcp(v4).map_err(|source| ExporterError::Listener { addr: v4, source })?;
    listeners.push(listener);

    Ok(listeners)
}

// ----------------------------------------------------------------------------
// 14.3 HTTP Worker
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpExposition {
    registry: Arc<MetricsRegistry>,
    config: HttpConfig,
}

impl HttpExposition {
    pub fn new(registry: Arc<MetricsRegistry>, config: HttpConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl Worker for HttpExposition {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(&self, shutdown: CancellationToken) -> ExporterResult<()> {
        let app = metrics_router(
            self.registry.clone(),
            &self.config.path,
            self.config.compression_threshold_bytes,
        );
        let listeners = bind_listeners(self.config.port)?;

        let servers = listeners.into_iter().map(|listener| {
            let app = app.clone();
            let shutdown = shutdown.clone();
            async move {
                if let Ok(addr) = listener.local_addr() {
                    info!(target: TARGET_HTTP, %addr, "Serving metrics");
                }
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }
        });

        try_join_all(servers).await?;
        info!(target: TARGET_HTTP, "HTTP exposition stopped");
        Ok(())
    }
}

// ============================================================================
// SECTION 15: EXPORTER ENGINE
// ============================================================================

pub struct Exporter {
    config: ExporterConfig,
    registry: Arc<MetricsRegistry>,
    queue_metrics: Arc<QueueMetrics>,
    log_metrics: Option<Arc<LogMetrics>>,
    shutdown: CancellationToken,
    start_time: Timestamp,
}

impl Exporter {
    /// Declare every metric. Log metrics exist only with a syslog socket.
    pub fn new(config: ExporterConfig) -> ExporterResult<Self> {
        let registry = Arc::new(MetricsRegistry::new());
        let queue_metrics = Arc::new(QueueMetrics::register(&registry)?);
        let log_metrics = match config.exporter.syslog_socket {
            Some(_) => Some(Arc::new(LogMetrics::register(&registry)?)),
            None => None,
        };

        Ok(Self {
            config,
            registry,
            queue_metrics,
            log_metrics,
            shutdown: CancellationToken::new(),
            start_time: Timestamp::now(),
        })
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        self.registry.clone()
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    pub fn shutdown(&self) {
        info!(target: TARGET_ENGINE, "Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn workers(&self) -> ExporterResult<Vec<Arc<dyn Worker>>> {
        let settings = &self.config.exporter;
        let scanner = QueueScanner::new(&settings.spool_dir);

        let mut workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(QueueSizeSampler::new(
                scanner.clone(),
                LivenessProbe::new(&settings.pid_file),
                self.queue_metrics.clone(),
                settings.size_interval(),
            )),
            Arc::new(QueueAgeSampler::new(
                scanner,
                self.queue_metrics.clone(),
                settings.age_interval(),
            )),
        ];

        match (&settings.syslog_socket, &self.log_metrics) {
            (Some(path), Some(metrics)) => workers.push(Arc::new(LogIngestor::new(
                path,
                LogClassifier::new()?,
                metrics.clone(),
                settings.error_backoff(),
            ))),
            _ => info!(target: TARGET_ENGINE, "No syslog socket configured, log classification disabled"),
        }

        workers.push(Arc::new(HttpExposition::new(
            self.registry.clone(),
            self.config.http.clone(),
        )));

        Ok(workers)
    }

    pub async fn run(&self) -> ExporterResult<()> {
        info!(target: TARGET_ENGINE,
            version = EXPORTER_VERSION,
            spool = %self.config.exporter.spool_dir.display(),
            port = self.config.http.port,
            "Starting {}", EXPORTER_FULL_NAME);

        let workers = self.workers()?;
        self.supervise(workers).await?;

        info!(target: TARGET_ENGINE,
            uptime_secs = self.uptime().as_secs(), "Exporter shutdown complete");
        Ok(())
    }

    /// Run `workers` until a termination signal or until one of them stops.
    ///
    /// A worker that stops before shutdown was requested is fatal: the others
    /// are cancelled and the cause is returned.
    pub async fn supervise(&self, workers: Vec<Arc<dyn Worker>>) -> ExporterResult<()> {
        let mut tasks = JoinSet::new();
        for worker in workers {
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let name = worker.name();
                let outcome = AssertUnwindSafe(worker.run(shutdown)).catch_unwind().await;
                (name, outcome)
            });
        }

        let signal = shutdown_signal();
        tokio::pin!(signal);
        let mut signal_handled = false;

        loop {
            tokio::select! {
                received = &mut signal, if !signal_handled => {
                    signal_handled = true;
                    let name = received?;
                    info!(target: TARGET_ENGINE, signal = name, "Termination signal received");
                    self.shutdown.cancel();
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    if let Err(e) = self.on_worker_finished(joined) {
                        self.shutdown.cancel();
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    fn on_worker_finished(
        &self,
        joined: Result<(&'static str, Result<ExporterResult<()>, Box<dyn Any + Send>>), task::JoinError>,
    ) -> ExporterResult<()> {
        match joined {
            Ok((worker, Ok(Ok(())))) if self.shutdown.is_cancelled() => {
                debug!(target: TARGET_ENGINE, worker, "Worker stopped");
                Ok(())
            }
            Ok((worker, Ok(Ok(())))) => {
                error!(target: TARGET_ENGINE, worker, "Worker exited before shutdown");
                Err(ExporterError::WorkerExited { worker })
            }
            Ok((worker, Ok(Err(e)))) => {
                error!(target: TARGET_ENGINE, worker, category = e.category(), error = %e,
                    "Worker failed");
                Err(ExporterError::WorkerFailed {
                    worker,
                    source: Box::new(e),
                })
            }
            Ok((worker, Err(payload))) => {
                let message = panic_message(payload.as_ref());
                error!(target: TARGET_ENGINE, worker, panic = %message, "Worker panicked");
                Err(ExporterError::WorkerPanicked { worker, message })
            }
            Err(e) => {
                error!(target: TARGET_ENGINE, error = %e, "Worker task aborted");
                Err(ExporterError::Internal(format!("worker task aborted: {}", e)))
            }
        }
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("config", &self.config)
            .field("log_classification", &self.log_metrics.is_some())
            .field("start_time", &self.start_time)
            .finish()
    }
}

async fn shutdown_signal() -> ExporterResult<&'static str> {
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// SECTION 16: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "postfix-exporter",
    author = "AIOps Team",
    version,
    about = "Prometheus exporter for Postfix queues, liveness and smtpd log events"
)]
pub struct Cli {
    /// Configuration file path (defaults and environment are used without one)
    #[arg(short, long, env = "POSTFIX_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "POSTFIX_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the exporter (default)
    Run,

    /// Validate configuration
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

pub fn handle_validate(config_path: Option<&Path>, verbose: bool) -> ExporterResult<()> {
    match config_path {
        Some(path) => println!("Validating configuration file: {}", path.display()),
        None => println!("Validating built-in defaults and environment overrides"),
    }

    let config = match ExporterConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            return Err(ExporterError::Config(e));
        }
    };

    println!("Configuration is valid");

    if verbose {
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("\n{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    let exporter = Exporter::new(config.clone())?;
    println!("\nSummary:");
    println!("  spool directory: {}", config.exporter.spool_dir.display());
    println!("  PID file: {}", config.exporter.pid_file.display());
    match &config.exporter.syslog_socket {
        Some(path) => println!("  syslog socket: {}", path.display()),
        None => println!("  syslog socket: (disabled)"),
    }
    println!("  listen port: {} ({})", config.http.port, config.http.path);
    println!("  metrics:");
    for (name, kind) in exporter.registry().declared() {
        println!("    - {} ({})", name, kind);
    }

    Ok(())
}

pub fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

pub fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

// ============================================================================
// SECTION 17: MAIN ENTRY POINT
// ============================================================================

#[allow(dead_code)]
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(cli.config.as_deref(), *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = ExporterConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    init_logging(&logging_config)?;

    let exporter = Exporter::new(config).context("Failed to declare metrics")?;
    exporter.run().await?;

    Ok(())
}

// ============================================================================
// SECTION 18: TESTS
// ============================================================================


#[cfg(test)]
mod registry_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_declared_in_order() {
        let registry = MetricsRegistry::new();
        QueueMetrics::register(&registry).unwrap();

        let names: Vec<String> = registry.declared().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "exporter_start_time_seconds",
                "oldest_message_timestamp_seconds",
                "queue_size",
                "queue_processing_error_total",
                "up",
            ]
        );
        assert_eq!(registry.declared()[3].1, MetricKind::Counter);
    }

    #[test]
    fn test_duplicate_declaration_fails() {
        let registry = MetricsRegistry::new();
        registry.int_gauge("up", "first").unwrap();
        let result = registry.int_gauge("up", "second");
        assert!(matches!(result, Err(ExporterError::Metrics(_))));
        assert_eq!(registry.declared().len(), 1);
    }

    #[test]
    fn test_snapshot_text_format() {
        let registry = MetricsRegistry::new();
        let metrics = QueueMetrics::register(&registry).unwrap();
        metrics.queue_size.with_label_values(&["deferred"]).set(42);
        metrics.up.set(1);
        metrics.record_error("NotFound", Phase::Scan);

        let exposition = registry.snapshot().unwrap();
        assert!(exposition.content_type.starts_with("text/plain"));
        assert!(exposition.body.contains("# TYPE queue_size gauge"));
        assert!(exposition.body.contains("queue_size{queue=\"deferred\"} 42"));
        assert!(exposition.body.contains("up 1"));
        assert!(exposition
            .body
            .contains("queue_processing_error_total{class=\"NotFound\",phase=\"scan\"} 1"));
        assert!(exposition.body.contains("exporter_start_time_seconds"));
    }

    fn matching_lines(body: &str, expected: &str) -> usize {
        body.lines().filter(|line| *line == expected).count()
    }

    #[test]
    fn test_every_declared_metric_exported_once_with_last_value() {
        let registry = MetricsRegistry::new();
        let queue = QueueMetrics::register(&registry).unwrap();
        let log = LogMetrics::register(&registry).unwrap();

        queue.start_time.set(1_700_000_000.0);
        queue.oldest_message.with_label_values(&["hold"]).set(1_700_000_100.0);
        queue.queue_size.with_label_values(&["hold"]).set(3);
        queue.queue_size.with_label_values(&["hold"]).set(5);
        queue.record_error("NotFound", Phase::Scan);
        queue.up.set(0);
        queue.up.set(1);

        log.record(&LogEvent::Delay {
            delay: 2.0,
            dsn: "2.0.0".into(),
            status: "sent".into(),
        });
        log.record(&LogEvent::Connect);
        log.record(&LogEvent::Connect);
        log.record(&LogEvent::Disconnect);
        log.record(&LogEvent::Queued { queue_id: "4ABCDEF123".into() });
        log.record(&LogEvent::Rejected { dsn: "5.7.1".into() });
        log.processing_errors.with_label_values(&["Other"]).inc();

        let body = registry.snapshot().unwrap().body;

        let declared = registry.declared();
        assert_eq!(declared.len(), 11);
        for (name, kind) in &declared {
            let type_line = format!("# TYPE {} {}", name, kind);
            assert_eq!(matching_lines(&body, &type_line), 1, "{}", type_line);
        }

        for expected in [
            "exporter_start_time_seconds 1700000000",
            "oldest_message_timestamp_seconds{queue=\"hold\"} 1700000100",
            "queue_size{queue=\"hold\"} 5",
            "queue_processing_error_total{class=\"NotFound\",phase=\"scan\"} 1",
            "up 1",
            "delivery_delays_sum{dsn=\"2.0.0\",status=\"sent\"} 2",
            "delivery_delays_count{dsn=\"2.0.0\",status=\"sent\"} 1",
            "smtpd_connections_total 2",
            "smtpd_active_connections 1",
            "incoming_delivery_attempts_total{dsn=\"2.0.0\",status=\"queued\"} 1",
            "incoming_delivery_attempts_total{dsn=\"5.7.1\",status=\"rejected\"} 1",
            "log_messages_total{type=\"connect\"} 2",
            "log_messages_total{type=\"delay\"} 1",
            "log_processing_error_total{class=\"Other\"} 1",
        ] {
            assert_eq!(matching_lines(&body, expected), 1, "{}", expected);
        }
    }

    #[test]
    fn test_start_time_is_set() {
        let before = Timestamp::now().as_secs_f64();
        let registry = MetricsRegistry::new();
        let metrics = QueueMetrics::register(&registry).unwrap();
        let start = metrics.start_time.get();
        assert!(start >= before - 1.0);
        assert!(start <= Timestamp::now().as_secs_f64() + 1.0);
    }

    #[test]
    fn test_log_metrics_delay_buckets() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();
        metrics.record(&LogEvent::Delay {
            delay: 3600.0,
            dsn: "2.0.0".into(),
            status: "sent".into(),
        });

        let body = registry.snapshot().unwrap().body;
        assert!(body.contains("delivery_delays_bucket{dsn=\"2.0.0\",status=\"sent\",le=\"604800\"} 1"));
        assert!(body.contains("delivery_delays_bucket{dsn=\"2.0.0\",status=\"sent\",le=\"900\"} 0"));
    }

    #[test]
    fn test_clamped_gauge_floor() {
        let gauge = ClampedGauge::new(IntGauge::new("active", "active").unwrap());
        assert_eq!(gauge.add(-1), 0);
        assert_eq!(gauge.add(1), 1);
        assert_eq!(gauge.add(1), 2);
        assert_eq!(gauge.add(-5), 0);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_clamped_gauge_concurrent_updates() {
        let gauge = Arc::new(ClampedGauge::new(IntGauge::new("active", "active").unwrap()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gauge = gauge.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        gauge.add(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(gauge.get(), 8000);
    }

    proptest! {
        #[test]
        fn prop_clamped_gauge_matches_running_clamp(steps in proptest::collection::vec(any::<bool>(), 0..200)) {
            let gauge = ClampedGauge::new(IntGauge::new("active", "active").unwrap());
            let mut expected: i64 = 0;
            for connect in steps {
                expected = if connect { expected + 1 } else { (expected - 1).max(0) };
                let value = gauge.add(if connect { 1 } else { -1 });
                prop_assert!(value >= 0);
                prop_assert_eq!(value, expected);
            }
        }
    }
}


#[cfg(test)]
mod liveness_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn probe_with(contents: &str) -> (TempDir, LivenessProbe) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.pid");
        fs::write(&path, contents).unwrap();
        (dir, LivenessProbe::new(path))
    }

    #[test]
    fn test_running_process_is_up() {
        let (_dir, probe) = probe_with(&format!("{:>10}\n", std::process::id()));
        assert_eq!(probe.probe().unwrap(), Liveness::Up);
    }

    #[test]
    fn test_reaped_process_is_down() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let (_dir, probe) = probe_with(&pid.to_string());
        assert_eq!(probe.probe().unwrap(), Liveness::Down);
    }

    #[test]
    fn test_missing_pid_file_is_down() {
        let probe = LivenessProbe::new("/nonexistent/master.pid");
        assert_eq!(probe.probe().unwrap(), Liveness::Down);
    }

    #[test]
    fn test_init_pid_is_down() {
        let (_dir, probe) = probe_with("1\n");
        assert_eq!(probe.probe().unwrap(), Liveness::Down);
        let (_dir, probe) = probe_with("0");
        assert_eq!(probe.probe().unwrap(), Liveness::Down);
    }

    #[test]
    fn test_signal_results() {
        assert_eq!(liveness_from_signal(Ok(())), Liveness::Up);
        assert_eq!(liveness_from_signal(Err(Errno::EPERM)), Liveness::Up);
        assert_eq!(liveness_from_signal(Err(Errno::ESRCH)), Liveness::Down);
    }

    #[test]
    fn test_garbage_pid_file_counts_error() {
        let (_dir, probe) = probe_with("master\n");
        assert!(matches!(probe.probe(), Err(LivenessError::Parse { .. })));

        let registry = MetricsRegistry::new();
        let metrics = QueueMetrics::register(&registry).unwrap();
        metrics.up.set(1);
        probe.update(&metrics);

        assert_eq!(metrics.up.get(), 1);
        assert_eq!(
            metrics
                .processing_errors
                .with_label_values(&["ParseIntError", "up"])
                .get(),
            1
        );
    }
}

#[cfg(test)]
mod classifier_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    fn delay(delay: f64, dsn: &str, status: &str) -> LogEvent {
        LogEvent::Delay {
            delay,
            dsn: dsn.into(),
            status: status.into(),
        }
    }

    #[test_case(
        "Oct 17 10:00:00 mx postfix/smtp[1234]: 3F2A1B: to=<a@example.com>, relay=mx.example.com[192.0.2.4]:25, delay=1.5, delays=0.1/0/0.4/1, dsn=2.0.0, status=sent (250 2.0.0 OK)",
        delay(1.5, "2.0.0", "sent");
        "sent"
    )]
    #[test_case(
        "Oct 17 10:00:00 mx postfix/smtp[1234]: 3F2A1B: to=<b@example.net>, relay=none, delay=14400, delays=14399/0.1/1/0, dsn=4.4.1, status=deferred (connect to example.net[192.0.2.8]:25: Connection timed out)",
        delay(14400.0, "4.4.1", "deferred");
        "deferred"
    )]
    #[test_case(
        "Oct 17 10:00:00 mx postfix/smtpd[999]: connect from unknown[198.51.100.7]",
        LogEvent::Connect;
        "connect"
    )]
    #[test_case(
        "Oct 17 10:00:01 mx postfix/smtpd[999]: disconnect from unknown[198.51.100.7] ehlo=1 quit=1 commands=2",
        LogEvent::Disconnect;
        "disconnect"
    )]
    #[test_case(
        "Oct 17 10:00:01 mx postfix/smtpd[999]: 4ABCDEF123: client=mail.example.org[192.0.2.1]",
        LogEvent::Queued { queue_id: "4ABCDEF123".into() };
        "queued"
    )]
    #[test_case(
        "Oct 17 10:00:01 mx postfix/smtpd[999]: NOQUEUE: reject: RCPT from unknown[192.0.2.9]: 554 5.7.1 <spam@example.com>: Relay access denied; from=<x@example.org> to=<spam@example.com> proto=ESMTP helo=<x>",
        LogEvent::Rejected { dsn: "5.7.1".into() };
        "noqueue"
    )]
    #[test_case(
        "Oct 17 10:00:02 mx postfix/qmgr[321]: 3F2A1B: removed",
        LogEvent::Ignored;
        "ignored"
    )]
    fn test_classify(line: &str, expected: LogEvent) {
        let classifier = LogClassifier::new().unwrap();
        assert_eq!(classifier.classify(line), expected);
    }

    #[test]
    fn test_pattern_order() {
        let classifier = LogClassifier::new().unwrap();
        assert_eq!(
            classifier.pattern_names(),
            vec!["delay", "connect", "disconnect", "queued", "noqueue"]
        );
    }

    #[test]
    fn test_record_sent_and_bounced() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();

        metrics.record(&delay(2.0, "2.0.0", "sent"));
        metrics.record(&delay(30.0, "5.1.1", "bounced"));

        let sent = metrics.delivery_delays.with_label_values(&["2.0.0", "sent"]);
        assert_eq!(sent.get_sample_count(), 1);
        assert!((sent.get_sample_sum() - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            metrics
                .delivery_delays
                .with_label_values(&["5.1.1", "bounced"])
                .get_sample_count(),
            1
        );
        assert_eq!(metrics.messages.with_label_values(&["delay"]).get(), 2);
    }

    #[test]
    fn test_record_deferred_only_counts_type() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();

        metrics.record(&delay(60.0, "4.4.1", "deferred"));

        assert_eq!(metrics.messages.with_label_values(&["delay"]).get(), 1);
        assert!(!registry.snapshot().unwrap().body.contains("status=\"deferred\""));
    }

    #[test]
    fn test_record_smtpd_sessions() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();

        metrics.record(&LogEvent::Disconnect);
        metrics.record(&LogEvent::Connect);
        metrics.record(&LogEvent::Connect);
        metrics.record(&LogEvent::Disconnect);

        assert_eq!(metrics.smtpd_connections.get(), 2);
        assert_eq!(metrics.smtpd_active_connections.get(), 1);
        assert_eq!(metrics.messages.with_label_values(&["connect"]).get(), 2);
        assert_eq!(metrics.messages.with_label_values(&["disconnect"]).get(), 2);
    }

    #[test]
    fn test_record_incoming_attempts() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();

        metrics.record(&LogEvent::Queued { queue_id: "4ABCDEF123".into() });
        metrics.record(&LogEvent::Rejected { dsn: "5.7.1".into() });
        metrics.record(&LogEvent::Rejected { dsn: "5.7.1".into() });

        assert_eq!(
            metrics
                .delivery_attempts
                .with_label_values(&["2.0.0", "queued"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .delivery_attempts
                .with_label_values(&["5.7.1", "rejected"])
                .get(),
            2
        );
        assert_eq!(metrics.messages.with_label_values(&["queued"]).get(), 1);
        assert_eq!(metrics.messages.with_label_values(&["noqueue"]).get(), 2);
    }

    #[test]
    fn test_ignored_line_touches_only_type_counter() {
        let registry = MetricsRegistry::new();
        let metrics = LogMetrics::register(&registry).unwrap();

        metrics.record(&LogEvent::Ignored);

        assert_eq!(metrics.messages.with_label_values(&["ignored"]).get(), 1);
        assert_eq!(metrics.smtpd_connections.get(), 0);
        assert_eq!(metrics.smtpd_active_connections.get(), 0);
    }

    proptest! {
        #[test]
        fn prop_plain_text_is_ignored(line in "[a-zA-Z0-9 :.,]{0,120}") {
            let classifier = LogClassifier::new().unwrap();
            prop_assert_eq!(classifier.classify(&line), LogEvent::Ignored);
        }

        #[test]
        fn prop_classify_never_panics(line in ".{0,300}") {
            let classifier = LogClassifier::new().unwrap();
            let _ = classifier.classify(&line);
        }
    }
}


#[cfg(test)]
mod http_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn populated_registry() -> Arc<MetricsRegistry> {
        let registry = Arc::new(MetricsRegistry::new());
        let metrics = QueueMetrics::register(&registry).unwrap();
        for queue in Queue::ALL {
            metrics.queue_size.with_label_values(&[queue.as_str()]).set(7);
            metrics
                .oldest_message
                .with_label_values(&[queue.as_str()])
                .set(Timestamp::now().as_secs_f64());
        }
        registry
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = metrics_router(populated_registry(), "/metrics", 512);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain; version=0.0.4"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("queue_size{queue=\"hold\"} 7"));
    }

    #[tokio::test]
    async fn test_custom_metrics_path() {
        let app = metrics_router(populated_registry(), "/postfix", 512);

        let response = app.clone().oneshot(get("/postfix")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = metrics_router(populated_registry(), "/metrics", 512);

        for uri in ["/", "/metrics/extra", "/favicon.ico"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(
                response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
                "text/plain; charset=utf-8"
            );
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], NOT_FOUND_BODY.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_large_body_is_gzipped() {
        let app = metrics_router(populated_registry(), "/metrics", 64);
        let request = Request::builder()
            .uri("/metrics")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_ENCODING].to_str().unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_small_body_is_not_compressed() {
        let app = metrics_router(populated_registry(), "/metrics", u16::MAX);
        let request = Request::builder()
            .uri("/metrics")
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_bind_ipv4_listener() {
        let listener = bind_tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());
    }
}

//! # KeyVis Engine - Key-Range Load Heatmaps
//!
//! Ingests periodic snapshots of per-key-range load statistics (read/written
//! bytes and keys for contiguous key intervals) and answers arbitrary
//! time/key-range queries with a fixed-resolution matrix ready for heatmap
//! rendering.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            KEYVIS HEATMAP ENGINE                             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  REGION SOURCE → AXIS BUILDER → TIER 0 → TIER 1 → … → TIER N (unbounded)    │
//! │                       │                                                      │
//! │                       └──→ ORDERED KV (8-byte BE unix second → JSON axis)    │
//! │                                                                              │
//! │  QUERY → TIER RANGE → KEY CLIP → PLANE PIXEL (time squash + key compress)   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Building Blocks
//!
//! - **StatValue**: mergeable/splittable aggregates ([`RegionUnit`], [`SingleUnit`])
//! - **DiscreteAxis**: one instant's load distribution across key space
//! - **DiscretePlane**: a time-ordered run of axes, downsampled by `pixel`
//! - **TieredStore**: cascading ring buffers trading resolution for retention
//! - **KeyVisualStore**: ingestion, persistence and queries behind one lock

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_FULL_NAME: &str = "KeyVis Heatmap Engine";

// ----------------------------------------------------------------------------
// Key Space
// ----------------------------------------------------------------------------

/// Largest key in the ingested key space. A trailing sample with an empty
/// end key is stretched up to here.
pub const MAX_KEY: &str = "~";

/// Segments whose significance falls below this are folded together on ingest.
pub const INGEST_DENOISE_THRESHOLD: u64 = 1;

// ----------------------------------------------------------------------------
// Query Resolution
// ----------------------------------------------------------------------------

/// Default number of time rows in a rendered matrix
pub const DEFAULT_TIME_ROWS: usize = 50;

/// Default number of key columns in a rendered matrix
pub const DEFAULT_KEY_COLUMNS: usize = 80;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default interval between two region scans (seconds)
pub const DEFAULT_INGEST_INTERVAL_SECS: u64 = 60;

/// Minimum allowed interval between two region scans (seconds)
pub const MIN_INGEST_INTERVAL_SECS: u64 = 1;

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

/// Default location of the axis log when the file backend is selected
pub const DEFAULT_STORAGE_PATH: &str = "data/keyvis.log";

/// Frame header: payload length (u32 LE) followed by CRC32 (u32 LE)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single persisted frame. Anything larger is corruption.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Width of a persisted axis key (big-endian unix seconds)
pub const RECORD_KEY_SIZE: usize = 8;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    const NANOS_PER_SEC: i64 = 1_000_000_000;

    /// Create a new timestamp from seconds since Unix epoch. Values outside
    /// the representable range saturate.
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(Self::NANOS_PER_SEC))
    }

    /// Like [`Timestamp::from_secs`], but `None` when `secs` falls outside
    /// the representable range (roughly 1677 to 2262).
    #[inline]
    pub const fn checked_from_secs(secs: i64) -> Option<Self> {
        match secs.checked_mul(Self::NANOS_PER_SEC) {
            Some(nanos) => Some(Self(nanos)),
            None => None,
        }
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / Self::NANOS_PER_SEC
    }

    /// Subtract duration from timestamp
    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(Self::NANOS_PER_SEC);
        let nanos = self.0.rem_euclid(Self::NANOS_PER_SEC) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    /// Persistence key for an axis ending at this instant: unix seconds,
    /// big-endian, so byte order matches chronological order.
    #[inline]
    pub fn to_record_key(&self) -> [u8; RECORD_KEY_SIZE] {
        (self.as_secs().max(0) as u64).to_be_bytes()
    }

    /// Inverse of [`Timestamp::to_record_key`] (second precision). `None`
    /// for keys of the wrong width or seconds outside the representable range.
    pub fn from_record_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; RECORD_KEY_SIZE] = key.try_into().ok()?;
        let secs = i64::try_from(u64::from_be_bytes(bytes)).ok()?;
        Self::checked_from_secs(secs)
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the engine, with recovery hints used by
// the ingest loop to decide whether to keep going.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum KeyVisError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Storage Errors ----
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // ---- Ingestion Errors ----
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeyVisError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            KeyVisError::Config(_) => false,
            KeyVisError::Storage(e) => e.is_recoverable(),
            KeyVisError::Ingest(_) => true,
            KeyVisError::Io(_) => true,
            KeyVisError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            KeyVisError::Config(_) => "config",
            KeyVisError::Storage(_) => "storage",
            KeyVisError::Ingest(_) => "ingest",
            KeyVisError::Io(_) => "io",
            KeyVisError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

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
// 4.3 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Deserialization failed: {message}")]
    DeserializationFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Data corruption detected: {message}")]
    DataCorruption { message: String },

    #[error("Invalid record key of {len} bytes (expected 8 bytes of in-range unix seconds)")]
    InvalidRecordKey { len: usize },
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::DataCorruption { .. } => false,
            StorageError::DeserializationFailed { .. } => false,
            StorageError::InvalidRecordKey { .. } => false,
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Ingestion Errors
// ----------------------------------------------------------------------------

/// Errors raised while pulling region samples from a source
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Region source '{name}' failed: {message}")]
    SourceFailed { name: String, message: String },

    #[error("Malformed sample batch at line {line}: {message}")]
    MalformedBatch { line: usize, message: String },
}

/// Result type alias for engine operations
pub type KeyVisResult<T> = Result<T, KeyVisError>;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing, KEYVIS_ environment overrides, validation and defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Retention tier layout
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Query resolution
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("KEYVIS_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.ingest_interval_secs < MIN_INGEST_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "engine.ingest_interval_secs",
                format!(
                    "Ingest interval must be at least {}s",
                    MIN_INGEST_INTERVAL_SECS
                ),
            ));
        }

        if self.query.time_rows == 0 {
            return Err(ConfigError::invalid_value(
                "query.time_rows",
                "A rendered matrix needs at least one time row",
            ));
        }

        if self.query.key_columns == 0 {
            return Err(ConfigError::invalid_value(
                "query.key_columns",
                "A rendered matrix needs at least one key column",
            ));
        }

        self.retention.validate()?;

        if self.storage.backend == StorageBackend::File
            && self.storage.path.as_os_str().is_empty()
        {
            return Err(ConfigError::invalid_value(
                "storage.path",
                "The file backend needs a path",
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Interval between two region scans
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.engine.ingest_interval_secs)
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Seconds between two region scans
    #[serde(default = "default_ingest_interval")]
    pub ingest_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            ingest_interval_secs: default_ingest_interval(),
        }
    }
}

fn default_instance_name() -> String {
    "keyvis-default".to_string()
}

fn default_ingest_interval() -> u64 {
    DEFAULT_INGEST_INTERVAL_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Retention Configuration
// ----------------------------------------------------------------------------

/// One resolution tier: a ring of `capacity` axes that hands its oldest
/// `compact_ratio` axes, compacted into one, to the next tier when full.
/// `capacity == 0` marks the unbounded last tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub capacity: usize,
    #[serde(default)]
    pub compact_ratio: usize,
}

impl TierConfig {
    pub const fn bounded(capacity: usize, compact_ratio: usize) -> Self {
        Self {
            capacity,
            compact_ratio,
        }
    }

    pub const fn unbounded() -> Self {
        Self {
            capacity: 0,
            compact_ratio: 0,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }
}

/// Tier layout of the retention store, finest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(last) = self.tiers.last() else {
            return Err(ConfigError::invalid_value(
                "retention.tiers",
                "At least one tier is required",
            ));
        };

        if last.is_bounded() {
            return Err(ConfigError::invalid_value(
                "retention.tiers",
                "The last tier must be unbounded (capacity = 0)",
            ));
        }

        for (level, tier) in self.tiers[..self.tiers.len() - 1].iter().enumerate() {
            if !tier.is_bounded() {
                return Err(ConfigError::invalid_value(
                    format!("retention.tiers[{}].capacity", level),
                    "Only the last tier may be unbounded",
                ));
            }
            if tier.compact_ratio == 0 || tier.compact_ratio >= tier.capacity {
                return Err(ConfigError::invalid_value(
                    format!("retention.tiers[{}].compact_ratio", level),
                    format!(
                        "Compact ratio must be in 1..{} (got {})",
                        tier.capacity, tier.compact_ratio
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// A day of one-minute axes, four weeks of quarter-hours, then hourly forever.
fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::bounded(1440, 15),
        TierConfig::bounded(2688, 4),
        TierConfig::unbounded(),
    ]
}

// ----------------------------------------------------------------------------
// 5.4 Storage Configuration
// ----------------------------------------------------------------------------

/// Which ordered KV backs the persisted axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// Axis log location (file backend only)
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// fsync after every persisted axis
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// Open the configured backend
    pub fn open_kv(&self) -> KeyVisResult<Arc<dyn OrderedKv>> {
        match self.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryKv::new())),
            StorageBackend::File => Ok(Arc::new(FileKv::open(&self.path, self.sync_writes)?)),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.5 Query Configuration
// ----------------------------------------------------------------------------

/// Target resolution handed to `DiscretePlane::pixel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_time_rows")]
    pub time_rows: usize,

    #[serde(default = "default_key_columns")]
    pub key_columns: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            time_rows: default_time_rows(),
            key_columns: default_key_columns(),
        }
    }
}

fn default_time_rows() -> usize {
    DEFAULT_TIME_ROWS
}

fn default_key_columns() -> usize {
    DEFAULT_KEY_COLUMNS
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> KeyVisResult<()> {
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
                .map_err(|e| KeyVisError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| KeyVisError::Internal(format!("Failed to set logger: {}", e)))?;
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
                .map_err(|e| KeyVisError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "keyvis::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: STAT VALUES
// ============================================================================
// The aggregate carried by every key segment. Values are merged when segments
// or axes are folded together and split when one coarse segment is spread
// across several finer ones.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 StatValue Trait
// ----------------------------------------------------------------------------

/// A mergeable, splittable aggregate with a scalar significance.
///
/// `merge` must never decrease `significance`. Max-like fields take the larger
/// side, sum-like fields accumulate; `split(n)` divides only the sum-like
/// fields. Callers never split by zero.
pub trait StatValue: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// Fold `other` into `self`.
    fn merge(&mut self, other: &Self);

    /// The share of `self` owed to each of `count` finer segments.
    fn split(&self, count: usize) -> Self;

    /// Scalar used for squash thresholds and denoising.
    fn significance(&self) -> u64;

    /// Whether this value carries less than `threshold` worth of load.
    fn is_negligible(&self, threshold: u64) -> bool {
        self.significance() < threshold
    }

    /// Reset to the zero value in place.
    fn reset(&mut self);

    /// A fresh zero value of the same shape as `self`.
    fn zero(&self) -> Self;

    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

// ----------------------------------------------------------------------------
// 7.2 Region Load Metrics
// ----------------------------------------------------------------------------

/// The four load counters reported for a key range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionLoad {
    pub written_bytes: u64,
    pub read_bytes: u64,
    pub written_keys: u64,
    pub read_keys: u64,
}

impl RegionLoad {
    fn max_with(&mut self, other: &RegionLoad) {
        self.written_bytes = self.written_bytes.max(other.written_bytes);
        self.read_bytes = self.read_bytes.max(other.read_bytes);
        self.written_keys = self.written_keys.max(other.written_keys);
        self.read_keys = self.read_keys.max(other.read_keys);
    }

    fn add(&mut self, other: &RegionLoad) {
        self.written_bytes = self.written_bytes.saturating_add(other.written_bytes);
        self.read_bytes = self.read_bytes.saturating_add(other.read_bytes);
        self.written_keys = self.written_keys.saturating_add(other.written_keys);
        self.read_keys = self.read_keys.saturating_add(other.read_keys);
    }

    fn div(&self, count: u64) -> RegionLoad {
        RegionLoad {
            written_bytes: self.written_bytes / count,
            read_bytes: self.read_bytes / count,
            written_keys: self.written_keys / count,
            read_keys: self.read_keys / count,
        }
    }
}

/// Multi-metric aggregate tracking both the peak and the accumulated load
/// of every counter. This is what gets stored and persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionUnit {
    pub max: RegionLoad,
    pub average: RegionLoad,
}

impl RegionUnit {
    /// A freshly observed load: peak and accumulator both start at the raw value.
    pub fn from_load(load: RegionLoad) -> Self {
        Self {
            max: load,
            average: load,
        }
    }
}

impl StatValue for RegionUnit {
    fn merge(&mut self, other: &Self) {
        self.max.max_with(&other.max);
        self.average.add(&other.average);
    }

    fn split(&self, count: usize) -> Self {
        debug_assert!(count > 0, "split count must be positive");
        Self {
            max: self.max,
            average: self.average.div(count.max(1) as u64),
        }
    }

    fn significance(&self) -> u64 {
        self.max.read_bytes.max(self.max.written_bytes)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn zero(&self) -> Self {
        Self::default()
    }
}

// ----------------------------------------------------------------------------
// 7.3 Single-Metric Values
// ----------------------------------------------------------------------------

/// How a single extracted metric folds across segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatMode {
    /// Keep the peak
    #[default]
    Max,
    /// Accumulate, divide on split
    Average,
}

impl FromStr for StatMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "max" => Ok(StatMode::Max),
            "average" | "avg" => Ok(StatMode::Average),
            other => Err(ConfigError::invalid_value(
                "mode",
                format!("unknown stat mode '{}'", other),
            )),
        }
    }
}

impl Display for StatMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StatMode::Max => write!(f, "max"),
            StatMode::Average => write!(f, "average"),
        }
    }
}

/// One metric projected out of a [`RegionUnit`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SingleUnit {
    pub value: u64,
    pub mode: StatMode,
}

impl SingleUnit {
    pub fn new(value: u64, mode: StatMode) -> Self {
        Self { value, mode }
    }
}

impl StatValue for SingleUnit {
    fn merge(&mut self, other: &Self) {
        match self.mode {
            StatMode::Max => self.value = self.value.max(other.value),
            StatMode::Average => self.value = self.value.saturating_add(other.value),
        }
    }

    fn split(&self, count: usize) -> Self {
        debug_assert!(count > 0, "split count must be positive");
        match self.mode {
            StatMode::Max => *self,
            StatMode::Average => Self {
                value: self.value / count.max(1) as u64,
                mode: self.mode,
            },
        }
    }

    fn significance(&self) -> u64 {
        self.value
    }

    fn reset(&mut self) {
        self.value = 0;
    }

    fn zero(&self) -> Self {
        Self {
            value: 0,
            mode: self.mode,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.4 Heatmap Tags
// ----------------------------------------------------------------------------

/// Which metric a heatmap renders. Every tag reads the peak counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapTag {
    ReadBytes,
    WrittenBytes,
    ReadKeys,
    WrittenKeys,
    ReadAndWrittenBytes,
    ReadAndWrittenKeys,
}

impl HeatmapTag {
    pub const ALL: [HeatmapTag; 6] = [
        HeatmapTag::ReadBytes,
        HeatmapTag::WrittenBytes,
        HeatmapTag::ReadKeys,
        HeatmapTag::WrittenKeys,
        HeatmapTag::ReadAndWrittenBytes,
        HeatmapTag::ReadAndWrittenKeys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HeatmapTag::ReadBytes => "read_bytes",
            HeatmapTag::WrittenBytes => "written_bytes",
            HeatmapTag::ReadKeys => "read_keys",
            HeatmapTag::WrittenKeys => "written_keys",
            HeatmapTag::ReadAndWrittenBytes => "read_and_written_bytes",
            HeatmapTag::ReadAndWrittenKeys => "read_and_written_keys",
        }
    }

    /// Extract this tag's metric from a stored unit
    pub fn extract(&self, unit: &RegionUnit) -> u64 {
        let max = &unit.max;
        match self {
            HeatmapTag::ReadBytes => max.read_bytes,
            HeatmapTag::WrittenBytes => max.written_bytes,
            HeatmapTag::ReadKeys => max.read_keys,
            HeatmapTag::WrittenKeys => max.written_keys,
            HeatmapTag::ReadAndWrittenBytes => max.read_bytes.saturating_add(max.written_bytes),
            HeatmapTag::ReadAndWrittenKeys => max.read_keys.saturating_add(max.written_keys),
        }
    }

    pub fn project(&self, unit: &RegionUnit, mode: StatMode) -> SingleUnit {
        SingleUnit::new(self.extract(unit), mode)
    }
}

impl FromStr for HeatmapTag {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HeatmapTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| ConfigError::invalid_value("tag", format!("unknown heatmap tag '{}'", s)))
    }
}

impl Display for HeatmapTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod stat_value_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn load(written_bytes: u64, read_bytes: u64, written_keys: u64, read_keys: u64) -> RegionLoad {
        RegionLoad {
            written_bytes,
            read_bytes,
            written_keys,
            read_keys,
        }
    }

    fn unit(max: RegionLoad, average: RegionLoad) -> RegionUnit {
        RegionUnit { max, average }
    }

    #[test]
    fn test_region_unit_split_divides_only_average() {
        let src = unit(load(10, 20, 30, 40), load(100, 200, 300, 400));

        assert_eq!(src.split(2), unit(load(10, 20, 30, 40), load(50, 100, 150, 200)));
        assert_eq!(src.split(5), unit(load(10, 20, 30, 40), load(20, 40, 60, 80)));
    }

    #[test]
    fn test_region_unit_merge() {
        let mut dst = unit(load(10, 20, 30, 40), load(100, 200, 300, 400));
        let src = unit(load(5, 25, 35, 10), load(20, 40, 60, 80));
        dst.merge(&src);

        assert_eq!(dst, unit(load(10, 25, 35, 40), load(120, 240, 360, 480)));
    }

    #[test]
    fn test_region_unit_negligible_and_significance() {
        let small = unit(load(10, 20, 30, 40), RegionLoad::default());
        let big = unit(load(70, 80, 90, 100), RegionLoad::default());
        assert!(small.is_negligible(30));
        assert!(!big.is_negligible(30));

        let mixed = unit(load(50, 45, 40, 70), RegionLoad::default());
        assert_eq!(mixed.significance(), 50);
    }

    #[test]
    fn test_region_unit_reset_and_zero() {
        let mut value = unit(load(1, 2, 3, 4), load(5, 6, 7, 8));
        assert_eq!(value.zero(), RegionUnit::default());
        assert!(value.clone().equals(&value));

        value.reset();
        assert_eq!(value, RegionUnit::default());
    }

    #[test]
    fn test_single_unit_split_by_mode() {
        assert_eq!(SingleUnit::new(3, StatMode::Average).split(2).value, 1);
        assert_eq!(SingleUnit::new(3, StatMode::Max).split(2).value, 3);
    }

    #[test]
    fn test_single_unit_merge_by_mode() {
        let mut max = SingleUnit::new(3, StatMode::Max);
        max.merge(&SingleUnit::new(4, StatMode::Max));
        assert_eq!(max.value, 4);

        let mut avg = SingleUnit::new(3, StatMode::Average);
        avg.merge(&SingleUnit::new(4, StatMode::Average));
        assert_eq!(avg.value, 7);
    }

    #[test]
    fn test_single_unit_negligible() {
        let value = SingleUnit::new(3, StatMode::Max);
        assert!(value.is_negligible(4));
        assert!(!value.is_negligible(3));
    }

    #[test]
    fn test_single_unit_reset_keeps_mode() {
        let mut value = SingleUnit::new(9, StatMode::Average);
        assert_eq!(value.zero(), SingleUnit::new(0, StatMode::Average));

        value.reset();
        assert_eq!(value, SingleUnit::new(0, StatMode::Average));
    }

    #[test]
    fn test_heatmap_tag_extracts_peak_counters() {
        let value = unit(load(3, 1, 4, 2), load(30, 10, 40, 20));

        assert_eq!(HeatmapTag::ReadBytes.extract(&value), 1);
        assert_eq!(HeatmapTag::WrittenBytes.extract(&value), 3);
        assert_eq!(HeatmapTag::ReadKeys.extract(&value), 2);
        assert_eq!(HeatmapTag::WrittenKeys.extract(&value), 4);
        assert_eq!(HeatmapTag::ReadAndWrittenBytes.extract(&value), 4);
        assert_eq!(HeatmapTag::ReadAndWrittenKeys.extract(&value), 6);
    }

    #[test]
    fn test_heatmap_tag_and_mode_parsing() {
        for tag in HeatmapTag::ALL {
            assert_eq!(tag.as_str().parse::<HeatmapTag>().ok(), Some(tag));
        }
        assert!("bogus".parse::<HeatmapTag>().is_err());

        assert_eq!("average".parse::<StatMode>().ok(), Some(StatMode::Average));
        assert_eq!("MAX".parse::<StatMode>().ok(), Some(StatMode::Max));
        assert!("median".parse::<StatMode>().is_err());
    }
}

// ============================================================================
// SECTION 8: DISCRETE AXIS
// ============================================================================
// One instant's load distribution across key space: an ordered run of
// segments `(previous end key, end key]`, the first one opening at the axis
// start key. End keys strictly increase.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Segment & Axis Types
// ----------------------------------------------------------------------------

/// A key-bounded slice of an axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line<V> {
    pub end_key: String,
    pub value: V,
}

impl<V> Line<V> {
    pub fn new(end_key: impl Into<String>, value: V) -> Self {
        Self {
            end_key: end_key.into(),
            value,
        }
    }
}

/// The load distribution over key space as of `end_time`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscreteAxis<V> {
    pub start_key: String,
    pub lines: Vec<Line<V>>,
    pub end_time: Timestamp,
}

/// True when a window of significances spans no more than `threshold`.
/// Fewer than two values always merge.
pub fn can_merge(values: &[u64], threshold: u64) -> bool {
    if values.len() < 2 {
        return true;
    }
    let (min, max) = values
        .iter()
        .fold((u64::MAX, u64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    max - min <= threshold
}

impl<V> DiscreteAxis<V> {
    /// An axis with no segments
    pub fn empty(start_key: impl Into<String>, end_time: Timestamp) -> Self {
        Self {
            start_key: start_key.into(),
            lines: Vec::new(),
            end_time,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `[start_key, end_key of every segment]`
    pub fn discrete_keys(&self) -> Vec<String> {
        std::iter::once(self.start_key.clone())
            .chain(self.lines.iter().map(|line| line.end_key.clone()))
            .collect()
    }

    /// Same key grid, values converted by `f`
    pub fn map_values<U>(&self, mut f: impl FnMut(&V) -> U) -> DiscreteAxis<U> {
        DiscreteAxis {
            start_key: self.start_key.clone(),
            lines: self
                .lines
                .iter()
                .map(|line| Line::new(line.end_key.clone(), f(&line.value)))
                .collect(),
            end_time: self.end_time,
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 Squash & Binary Compression
// ----------------------------------------------------------------------------

impl<V: StatValue> DiscreteAxis<V> {
    /// Distinct segment significances, ascending
    pub fn generate_thresholds(&self) -> Vec<u64> {
        self.lines
            .iter()
            .map(|line| line.value.significance())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Window sizes a squash at `(step, threshold)` would fold into each
    /// output segment. A mergeable window covers up to `step` segments and
    /// advances by `step`; otherwise the window slides by one.
    fn squash_windows(&self, step: usize, threshold: u64) -> Vec<usize> {
        let total = self.lines.len();
        let mut windows = Vec::new();
        let mut values = Vec::with_capacity(step);
        let mut i = 0;
        while i < total {
            let end = (i + step).min(total);
            values.clear();
            values.extend(self.lines[i..end].iter().map(|line| line.value.significance()));
            if can_merge(&values, threshold) {
                windows.push(end - i);
                i += step;
            } else {
                windows.push(1);
                i += 1;
            }
        }
        windows
    }

    /// Segment count a `squash(step, threshold)` would leave, without mutating
    pub fn effect(&self, step: usize, threshold: u64) -> usize {
        if step <= 1 {
            return self.lines.len();
        }
        self.squash_windows(step, threshold).len()
    }

    /// Fold every mergeable window of `step` segments into its first segment
    pub fn squash(&mut self, step: usize, threshold: u64) {
        if step <= 1 {
            return;
        }
        let windows = self.squash_windows(step, threshold);
        let mut lines = std::mem::take(&mut self.lines).into_iter();
        let mut squashed = Vec::with_capacity(windows.len());
        for width in windows {
            let Some(mut head) = lines.next() else { break };
            for line in lines.by_ref().take(width - 1) {
                head.value.merge(&line.value);
                head.end_key = line.end_key;
            }
            squashed.push(head);
        }
        self.lines = squashed;
    }

    /// Squash until the segment count is as close to `target` as the two
    /// best candidate thresholds allow. A zero target is a no-op.
    pub fn binary_compress(&mut self, target: usize) {
        if target == 0 || self.lines.len() <= target {
            return;
        }
        let thresholds = self.generate_thresholds();
        let step = (self.lines.len() + target - 1) / target;

        // smallest threshold whose squash fits into `target`
        let index = thresholds
            .partition_point(|&t| self.effect(step, t) > target)
            .min(thresholds.len() - 1);
        let threshold1 = thresholds[index];
        let num1 = self.effect(step, threshold1);

        let chosen = if index > 0 && num1 != target {
            let threshold2 = thresholds[index - 1];
            let num2 = self.effect(step, threshold2);
            if (num2 as i64 - target as i64) < (target as i64 - num1 as i64) {
                threshold2
            } else {
                threshold1
            }
        } else {
            threshold1
        };

        trace!(
            target: "keyvis::axis",
            lines = self.lines.len(),
            target,
            step,
            threshold = chosen,
            "Binary compress"
        );
        self.squash(step, chosen);
    }

    // ------------------------------------------------------------------------
    // 8.3 Denoise
    // ------------------------------------------------------------------------

    /// Collapse runs of negligible segments, and consecutive segments whose
    /// value equals the preceding source segment.
    pub fn denoise(&mut self, threshold: u64) {
        let lines = std::mem::take(&mut self.lines);
        let mut denoised: Vec<Line<V>> = Vec::with_capacity(lines.len());
        let mut last_negligible = false;
        let mut previous: Option<V> = None;

        for line in lines {
            let current = line.value.clone();
            let fold_into_last = if line.value.is_negligible(threshold) {
                let fold = last_negligible;
                last_negligible = true;
                fold
            } else {
                last_negligible = false;
                previous.as_ref().map_or(false, |prev| prev.equals(&line.value))
            };

            match denoised.last_mut() {
                Some(last) if fold_into_last => {
                    last.value.merge(&line.value);
                    last.end_key = line.end_key;
                }
                _ => denoised.push(line),
            }
            previous = Some(current);
        }
        self.lines = denoised;
    }

    // ------------------------------------------------------------------------
    // 8.4 Resample & Deprojection
    // ------------------------------------------------------------------------

    /// Spread this axis onto the finer (or equal) grid of `dst`: each source
    /// segment covering `k` destination segments is split by `k` and merged
    /// into each of them.
    pub fn resample(&self, dst: &mut DiscreteAxis<V>) {
        let src_keys = self.discrete_keys();
        let dst_keys = dst.discrete_keys();
        let mut start_index = 0;
        let mut end_index = 0;

        for i in 1..src_keys.len() {
            for (j, key) in dst_keys.iter().enumerate().skip(end_index) {
                if *key == src_keys[i - 1] {
                    start_index = j;
                }
                if *key == src_keys[i] {
                    end_index = j;
                    break;
                }
            }
            let count = end_index.saturating_sub(start_index);
            if count == 0 {
                continue;
            }
            let share = self.lines[i - 1].value.split(count);
            for line in &mut dst.lines[start_index..end_index] {
                line.value.merge(&share);
            }
        }
    }

    /// Project this axis onto the coarser grid of `dst` (pre-zeroed): every
    /// source value is merged into each destination segment it overlaps.
    pub fn deprojection(&self, dst: &mut DiscreteAxis<V>) {
        let src_len = self.lines.len();
        let dst_len = dst.lines.len();

        let (mut dst_i, mut src_i) = if self.start_key < dst.start_key {
            let src_i = self
                .lines
                .partition_point(|line| line.end_key <= dst.start_key);
            (0, src_i)
        } else {
            let dst_i = dst
                .lines
                .partition_point(|line| line.end_key <= self.start_key);
            (dst_i, 0)
        };

        let mut start_index = dst_i;
        while dst_i < dst_len && src_i < src_len {
            let src = &self.lines[src_i];
            if src.end_key <= dst.lines[dst_i].end_key {
                for line in &mut dst.lines[start_index..=dst_i] {
                    line.value.merge(&src.value);
                }
                if src.end_key == dst.lines[dst_i].end_key {
                    dst_i += 1;
                    // duplicated end keys downstream share the same source
                    while dst_i < dst_len && dst.lines[dst_i].end_key == src.end_key {
                        dst.lines[dst_i].value.merge(&src.value);
                        dst_i += 1;
                    }
                }
                start_index = dst_i;
                src_i += 1;
            } else {
                dst_i += 1;
            }
        }
    }

    // ------------------------------------------------------------------------
    // 8.5 Key Range
    // ------------------------------------------------------------------------

    /// The sub-axis covering `(start_key, end_key]`: every segment that ends
    /// after `start_key`, up to and including the first one reaching
    /// `end_key`. An axis entirely outside the range comes back empty with an
    /// empty start key.
    pub fn range(&self, start_key: &str, end_key: &str) -> DiscreteAxis<V> {
        let mut ranged = DiscreteAxis::empty("", self.end_time);
        if end_key <= self.start_key.as_str() {
            return ranged;
        }

        let size = self.lines.len();
        let start_index = self
            .lines
            .partition_point(|line| line.end_key.as_str() <= start_key);
        if start_index == size {
            return ranged;
        }

        let mut end_index = self
            .lines
            .partition_point(|line| line.end_key.as_str() < end_key);
        if end_index != size {
            end_index += 1;
        }
        let end_index = end_index.max(start_index);

        ranged.start_key = if start_index == 0 {
            self.start_key.clone()
        } else {
            self.lines[start_index - 1].end_key.clone()
        };
        ranged.lines = self.lines[start_index..end_index].to_vec();
        ranged
    }
}

// ----------------------------------------------------------------------------
// 8.6 Test Fixtures
// ----------------------------------------------------------------------------

/// Peak-only value used to exercise the geometry in isolation: merge keeps
/// the larger side and split hands every part the full value.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PeakValue(pub u64);

#[cfg(test)]
impl StatValue for PeakValue {
    fn merge(&mut self, other: &Self) {
        self.0 = self.0.max(other.0);
    }

    fn split(&self, _count: usize) -> Self {
        *self
    }

    fn significance(&self) -> u64 {
        self.0
    }

    fn reset(&mut self) {
        self.0 = 0;
    }

    fn zero(&self) -> Self {
        PeakValue(0)
    }
}

/// Additive value: merge sums, split divides exactly (tests pick divisible inputs).
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SumValue(pub u64);

#[cfg(test)]
impl StatValue for SumValue {
    fn merge(&mut self, other: &Self) {
        self.0 += other.0;
    }

    fn split(&self, count: usize) -> Self {
        SumValue(self.0 / count as u64)
    }

    fn significance(&self) -> u64 {
        self.0
    }

    fn reset(&mut self) {
        self.0 = 0;
    }

    fn zero(&self) -> Self {
        SumValue(0)
    }
}

#[cfg(test)]
pub(crate) fn build_axis(
    start_key: &str,
    keys: &[&str],
    values: &[u64],
    end_time: Timestamp,
) -> DiscreteAxis<PeakValue> {
    DiscreteAxis {
        start_key: start_key.to_string(),
        lines: keys
            .iter()
            .zip(values)
            .map(|(key, value)| Line::new(*key, PeakValue(*value)))
            .collect(),
        end_time,
    }
}

#[cfg(test)]
mod axis_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at() -> Timestamp {
        Timestamp::from_secs(1_700_000_000)
    }

    fn squash_fixture() -> DiscreteAxis<PeakValue> {
        build_axis(
            "",
            &["a", "b", "d", "e", "h", "i", "k", "l", "t", "w", "z"],
            &[4, 0, 10, 2, 3, 3, 0, 7, 11, 5, 1],
            at(),
        )
    }

    #[test]
    fn test_clone_is_independent() {
        let axis = build_axis(
            "",
            &["a", "b", "d", "e", "h", "i", "k", "l", "t", "z"],
            &[0, 0, 10, 2, 4, 3, 0, 7, 11, 2],
            at(),
        );
        let mut copy = axis.clone();
        assert_eq!(copy, axis);

        copy.lines[2].value.merge(&PeakValue(99));
        copy.lines[0].end_key.push('x');
        assert_eq!(axis.lines[2].value, PeakValue(10));
        assert_eq!(axis.lines[0].end_key, "a");
    }

    #[test]
    fn test_generate_thresholds() {
        let axis = build_axis(
            "",
            &["a", "b", "d", "e", "h", "i", "k", "l", "t", "z"],
            &[0, 0, 10, 2, 3, 3, 0, 7, 11, 2],
            at(),
        );
        assert_eq!(axis.generate_thresholds(), vec![0, 2, 3, 7, 10, 11]);
    }

    #[test]
    fn test_can_merge() {
        let values = [4, 2, 8, 5];
        assert!(!can_merge(&values, 5));
        assert!(can_merge(&values, 6));
        assert!(can_merge(&[7], 0));
        assert!(can_merge(&[], 0));
    }

    #[test]
    fn test_effect() {
        let axis = build_axis(
            "",
            &["a", "b", "d", "e", "h", "i", "k", "l", "t", "z"],
            &[0, 0, 10, 2, 3, 3, 0, 7, 11, 2],
            at(),
        );
        let counts: Vec<usize> = axis
            .generate_thresholds()
            .into_iter()
            .map(|t| axis.effect(3, t))
            .collect();
        assert_eq!(counts, vec![10, 8, 8, 8, 4, 4]);
        assert_eq!(axis.effect(1, 0), 10);
    }

    #[test]
    fn test_squash() {
        let mut axis = squash_fixture();
        axis.squash(3, 3);
        assert_eq!(
            axis,
            build_axis(
                "",
                &["a", "b", "d", "i", "k", "l", "t", "w", "z"],
                &[4, 0, 10, 3, 0, 7, 11, 5, 1],
                at(),
            )
        );

        let mut axis = squash_fixture();
        axis.squash(3, 6);
        assert_eq!(
            axis,
            build_axis(
                "",
                &["a", "b", "d", "i", "k", "w", "z"],
                &[4, 0, 10, 3, 0, 11, 1],
                at(),
            )
        );
    }

    #[test]
    fn test_squash_small_step_is_noop() {
        let mut axis = squash_fixture();
        axis.squash(1, 100);
        assert_eq!(axis, squash_fixture());
    }

    #[test]
    fn test_binary_compress() {
        let mut axis = squash_fixture();
        axis.binary_compress(5);
        assert_eq!(
            axis,
            build_axis("", &["d", "i", "k", "w", "z"], &[10, 3, 0, 11, 1], at())
        );
    }

    #[test]
    fn test_binary_compress_keeps_fitting_threshold_on_tie() {
        // step 2, effect per threshold [0, 4, 7, 8] is [5, 3, 3, 3]: the
        // fitting count 3 and the next lower count 5 sit equally far from 4
        let mut axis = build_axis("", &["b", "d", "f", "h", "j"], &[7, 4, 0, 4, 8], at());
        assert_eq!(axis.effect(2, 0), 5);
        assert_eq!(axis.effect(2, 4), 3);

        axis.binary_compress(4);
        assert_eq!(axis, build_axis("", &["d", "h", "j"], &[7, 4, 8], at()));
    }

    #[test]
    fn test_binary_compress_prefers_closer_count_above_target() {
        // step 2, effect per threshold [1, 4, 5, 6, 7] is [7, 4, 4, 4, 4]:
        // 7 misses the target of 6 by one, 4 by two, so threshold 1 wins
        let keys = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let mut axis = build_axis("", &keys, &[6, 4, 7, 7, 5, 7, 1, 4], at());
        assert_eq!(axis.effect(2, 1), 7);
        assert_eq!(axis.effect(2, 4), 4);

        axis.binary_compress(6);
        assert_eq!(axis.len(), 7);
        assert_eq!(
            axis,
            build_axis(
                "",
                &["a", "b", "d", "e", "f", "g", "h"],
                &[6, 4, 7, 5, 7, 1, 4],
                at()
            )
        );
    }

    #[test]
    fn test_binary_compress_zero_target_is_noop() {
        let mut axis = squash_fixture();
        axis.binary_compress(0);
        assert_eq!(axis, squash_fixture());

        axis.binary_compress(20);
        assert_eq!(axis, squash_fixture());
    }

    #[test]
    fn test_resample() {
        let src = build_axis(
            "\n",
            &["a", "c", "d", "h", "i", "m", "q", "t", "x", "z"],
            &[0, 0, 10, 2, 4, 3, 0, 7, 11, 2],
            at(),
        );
        let dst_keys = [
            "a", "b", "c", "d", "f", "h", "i", "l", "m", "o", "p", "q", "t", "x", "z", "zz",
        ];
        let mut dst = build_axis(
            "",
            &dst_keys,
            &[2, 1, 0, 10, 3, 1, 5, 9, 3, 0, 2, 0, 3, 7, 2, 0],
            at(),
        );
        src.resample(&mut dst);
        assert_eq!(
            dst,
            build_axis(
                "",
                &dst_keys,
                &[2, 1, 0, 10, 3, 2, 5, 9, 3, 0, 2, 0, 7, 11, 2, 0],
                at(),
            )
        );

        let expected = dst.clone();
        let empty = build_axis("\n2", &[], &[], at());
        empty.resample(&mut dst);
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_deprojection() {
        let src = build_axis(
            "\n",
            &["b", "c", "d", "h", "i", "m", "q", "t", "x", "z"],
            &[0, 0, 10, 2, 4, 3, 0, 7, 11, 2],
            at(),
        );
        let dst_keys = ["a", "c", "d", "d", "f", "g", "m", "z"];
        let mut dst = build_axis("", &dst_keys, &[0; 8], at());
        src.deprojection(&mut dst);
        assert_eq!(
            dst,
            build_axis("", &dst_keys, &[0, 0, 10, 10, 2, 2, 4, 11], at())
        );
    }

    #[test]
    fn test_discrete_keys() {
        let mut axis = build_axis(
            "",
            &["a", "c", "d", "h", "i", "m", "q", "t", "x", "z"],
            &[0, 0, 10, 2, 4, 3, 0, 7, 11, 2],
            at(),
        );
        assert_eq!(
            axis.discrete_keys(),
            vec!["", "a", "c", "d", "h", "i", "m", "q", "t", "x", "z"]
        );

        axis.lines.clear();
        assert_eq!(axis.discrete_keys(), vec![""]);
    }

    #[test]
    fn test_range() {
        let axis = build_axis(
            "",
            &["a", "c", "d", "h", "i", "m", "q", "t", "x", "y"],
            &[0, 0, 10, 2, 4, 3, 0, 7, 11, 2],
            at(),
        );

        assert_eq!(axis.range("", "z"), axis);

        let head = axis.range("", "\n");
        assert_eq!(head.start_key, "");
        assert_eq!(head.lines, axis.lines[..1].to_vec());

        let middle = axis.range("b", "o");
        assert_eq!(middle.start_key, "a");
        assert_eq!(middle.lines, axis.lines[1..7].to_vec());
        assert_eq!(middle.end_time, axis.end_time);

        let prefix = axis.range("\n", "o");
        assert_eq!(prefix.start_key, "");
        assert_eq!(prefix.lines, axis.lines[0..7].to_vec());
    }

    #[test]
    fn test_range_outside_axis_is_empty() {
        let axis = build_axis("b", &["c", "d"], &[1, 2], at());

        let before = axis.range("", "a");
        assert!(before.is_empty());
        assert_eq!(before.start_key, "");

        let after = axis.range("~", "~");
        assert!(after.is_empty());
    }

    #[test]
    fn test_denoise_merges_negligible_runs() {
        let mut axis = DiscreteAxis {
            start_key: String::new(),
            lines: vec![
                Line::new("a", SingleUnit::new(2, StatMode::Max)),
                Line::new("b", SingleUnit::new(2, StatMode::Max)),
                Line::new("c", SingleUnit::new(20, StatMode::Max)),
            ],
            end_time: at(),
        };
        axis.denoise(10);
        let ends: Vec<&str> = axis.lines.iter().map(|l| l.end_key.as_str()).collect();
        assert_eq!(ends, vec!["b", "c"]);
    }

    #[test]
    fn test_denoise_merges_equal_neighbours() {
        let mut axis = build_axis("", &["a", "b", "c", "d", "e"], &[5, 5, 5, 0, 7], at());
        axis.denoise(1);
        assert_eq!(axis, build_axis("", &["c", "d", "e"], &[5, 0, 7], at()));
    }
}


// ============================================================================
// SECTION 9: DISCRETE PLANE & MATRIX
// ============================================================================
// A time-ordered run of axes. Axis `i` covers `(end_time[i-1], end_time[i]]`,
// the first one opening at the plane start time.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Plane Type
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscretePlane<V> {
    pub start_time: Timestamp,
    pub axes: Vec<DiscreteAxis<V>>,
}

/// Dense heatmap grid: `data[i][j]` covers time `(times[i], times[i+1]]`
/// and key range `(keys[j], keys[j+1]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<V> {
    pub data: Vec<Vec<V>>,
    pub keys: Vec<String>,
    pub times: Vec<Timestamp>,
}

impl<V> Matrix<V> {
    pub fn rows(&self) -> usize {
        self.data.len()
    }

    pub fn columns(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    /// A matrix with no cells carries nothing worth rendering
    pub fn is_blank(&self) -> bool {
        self.rows() == 0 || self.columns() == 0
    }

    pub fn map_values<U>(self, mut f: impl FnMut(V) -> U) -> Matrix<U> {
        Matrix {
            data: self
                .data
                .into_iter()
                .map(|row| row.into_iter().map(&mut f).collect())
                .collect(),
            keys: self.keys,
            times: self.times,
        }
    }
}

impl<V> DiscretePlane<V> {
    pub fn new(start_time: Timestamp) -> Self {
        Self {
            start_time,
            axes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// `[start_time, end_time of every axis]`
    pub fn discrete_times(&self) -> Vec<Timestamp> {
        std::iter::once(self.start_time)
            .chain(self.axes.iter().map(|axis| axis.end_time))
            .collect()
    }

    /// End time of the newest axis, or the start time when empty
    pub fn end_time(&self) -> Timestamp {
        self.axes.last().map_or(self.start_time, |axis| axis.end_time)
    }

    pub fn map_values<U>(&self, mut f: impl FnMut(&V) -> U) -> DiscretePlane<U> {
        DiscretePlane {
            start_time: self.start_time,
            axes: self.axes.iter().map(|axis| axis.map_values(&mut f)).collect(),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Compaction & Pixelation
// ----------------------------------------------------------------------------

impl<V: StatValue> DiscretePlane<V> {
    /// Fold every axis into one spanning the whole plane: the target grid is
    /// the sorted union of all boundaries of non-empty axes, zero-filled, and
    /// every axis is resampled onto it. Degrades to an empty axis when there
    /// is nothing to fold.
    pub fn compact(&self) -> DiscreteAxis<V> {
        let mut compacted = DiscreteAxis::empty("", self.end_time());

        let mut keys: BTreeSet<&str> = BTreeSet::new();
        for axis in self.axes.iter().filter(|axis| !axis.is_empty()) {
            keys.insert(axis.start_key.as_str());
            keys.extend(axis.lines.iter().map(|line| line.end_key.as_str()));
        }

        let Some(zero) = self
            .axes
            .iter()
            .find_map(|axis| axis.lines.first())
            .map(|line| line.value.zero())
        else {
            return compacted;
        };

        let mut keys = keys.into_iter();
        if let Some(first) = keys.next() {
            compacted.start_key = first.to_string();
        }
        compacted.lines = keys.map(|key| Line::new(key, zero.clone())).collect();

        for axis in &self.axes {
            axis.resample(&mut compacted);
        }
        compacted
    }

    /// Reduce the plane to `n` axes by compacting consecutive groups: the
    /// first `len % n` groups take one axis more than the rest. A plane with
    /// at most `n` axes comes back unchanged.
    pub fn time_squash(&self, n: usize) -> DiscretePlane<V> {
        let total = self.axes.len();
        if n == 0 || total <= n {
            return self.clone();
        }

        let small_step = total / n;
        let large_step = small_step + 1;
        let large_groups = total % n;

        let mut squashed = DiscretePlane::new(self.start_time);
        squashed.axes.reserve(n);
        for group in 0..n {
            let (index, step) = if group < large_groups {
                (group * large_step, large_step)
            } else {
                (
                    large_groups * large_step + (group - large_groups) * small_step,
                    small_step,
                )
            };
            let start_time = if group == 0 {
                self.start_time
            } else {
                self.axes[index - 1].end_time
            };
            let window = DiscretePlane {
                start_time,
                axes: self.axes[index..index + step].to_vec(),
            };
            squashed.axes.push(window.compact());
        }
        squashed
    }

    /// Downsample to roughly `n` time rows by `m` key columns.
    ///
    /// Rows come from [`DiscretePlane::time_squash`]. Columns come from one
    /// reference axis: the compaction of the squashed plane, binary-compressed
    /// to `m` segments and zeroed. Every squashed axis is then deprojected
    /// onto its own copy of the reference.
    pub fn pixel(&self, n: usize, m: usize) -> Option<Matrix<V>> {
        if n == 0 || m == 0 || self.axes.is_empty() {
            return None;
        }

        let squashed = self.time_squash(n);

        let mut reference = squashed.compact();
        reference.binary_compress(m);
        for line in &mut reference.lines {
            line.value.reset();
        }

        let times = squashed.discrete_times();
        let keys = reference.discrete_keys();
        let data = squashed
            .axes
            .iter()
            .map(|axis| {
                let mut projected = reference.clone();
                axis.deprojection(&mut projected);
                projected.lines.into_iter().map(|line| line.value).collect()
            })
            .collect();

        debug!(
            target: "keyvis::plane",
            axes = self.axes.len(),
            rows = squashed.axes.len(),
            columns = reference.lines.len(),
            "Plane pixelated"
        );

        Some(Matrix { data, keys, times })
    }
}


// ============================================================================
// SECTION 10: TIERED RETENTION STORE
// ============================================================================
// Cascading ring buffers of axes:
// - Tier 0 holds the freshest axes at ingest resolution
// - A full bounded tier compacts its oldest axes into one and hands it down
// - The last tier is unbounded and never discards
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Tier - One Resolution Level
// ----------------------------------------------------------------------------

/// A ring of axes in chronological order starting at `head`.
///
/// Bounded tiers keep a fixed arena of `capacity` slots; the unbounded tier
/// simply grows. `start_time` opens the interval covered by the oldest
/// resident axis and moves forward whenever axes are compacted away.
#[derive(Debug, Clone)]
pub struct Tier<V> {
    slots: Vec<Option<DiscreteAxis<V>>>,
    capacity: usize,
    compact_ratio: usize,
    head: usize,
    tail: usize,
    empty: bool,
    start_time: Timestamp,
}

impl<V> Tier<V> {
    pub fn new(config: TierConfig, start_time: Timestamp) -> Self {
        let slots = if config.is_bounded() {
            (0..config.capacity).map(|_| None).collect()
        } else {
            Vec::new()
        };
        Self {
            slots,
            capacity: config.capacity,
            compact_ratio: config.compact_ratio,
            head: 0,
            tail: 0,
            empty: true,
            start_time,
        }
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.is_bounded() && !self.empty && self.head == self.tail
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Number of resident axes
    pub fn len(&self) -> usize {
        if self.empty {
            0
        } else if !self.is_bounded() {
            self.slots.len()
        } else if self.head == self.tail {
            self.capacity
        } else {
            (self.tail + self.capacity - self.head) % self.capacity
        }
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        if self.is_bounded() {
            (self.head + logical) % self.capacity
        } else {
            logical
        }
    }

    /// Axis at chronological position `logical` (0 = oldest)
    pub fn get(&self, logical: usize) -> Option<&DiscreteAxis<V>> {
        if logical >= self.len() {
            return None;
        }
        self.slots.get(self.physical(logical)).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscreteAxis<V>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    fn end_time_at(&self, logical: usize) -> Timestamp {
        self.get(logical).map_or(self.start_time, |axis| axis.end_time)
    }

    /// Position of the first axis whose end time is at or after `t`.
    ///
    /// `Err(Some(last))` when `t` lies beyond every resident axis,
    /// `Err(None)` when the tier holds nothing.
    pub fn search(&self, t: Timestamp) -> Result<usize, Option<usize>> {
        let len = self.len();
        if len == 0 {
            return Err(None);
        }

        let (mut lo, mut hi) = (0, len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.end_time_at(mid) < t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo == len {
            Err(Some(len - 1))
        } else {
            Ok(lo)
        }
    }
}

impl<V: StatValue> Tier<V> {
    /// Store `axis` as the newest entry. A full bounded tier first compacts
    /// its oldest `compact_ratio` axes and returns the result for the next
    /// tier down.
    pub fn append(&mut self, axis: DiscreteAxis<V>) -> Option<DiscreteAxis<V>> {
        if !self.is_bounded() {
            self.slots.push(Some(axis));
            self.tail = self.slots.len();
            self.empty = false;
            return None;
        }

        let cascaded = if self.is_full() {
            let mut window = DiscretePlane::new(self.start_time);
            for offset in 0..self.compact_ratio {
                let slot = (self.head + offset) % self.capacity;
                if let Some(oldest) = self.slots[slot].take() {
                    window.axes.push(oldest);
                }
            }
            let compacted = window.compact();
            self.start_time = compacted.end_time;
            self.head = (self.head + self.compact_ratio) % self.capacity;
            Some(compacted)
        } else {
            None
        };

        self.slots[self.tail] = Some(axis);
        self.tail = (self.tail + 1) % self.capacity;
        self.empty = false;

        cascaded
    }
}

// ----------------------------------------------------------------------------
// 10.2 TieredStore - The Tier Chain
// ----------------------------------------------------------------------------

/// Tiers ordered finest first
#[derive(Debug, Clone)]
pub struct TieredStore<V> {
    tiers: Vec<Tier<V>>,
}

impl<V> TieredStore<V> {
    pub fn new(config: &RetentionConfig, start_time: Timestamp) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tiers: config
                .tiers
                .iter()
                .map(|tier| Tier::new(*tier, start_time))
                .collect(),
        })
    }

    pub fn depth(&self) -> usize {
        self.tiers.len()
    }

    pub fn tier(&self, level: usize) -> Option<&Tier<V>> {
        self.tiers.get(level)
    }

    /// Resident axes across every tier
    pub fn len(&self) -> usize {
        self.tiers.iter().map(Tier::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(Tier::is_empty)
    }

    /// Opening boundary of the finest tier
    pub fn start_time(&self) -> Timestamp {
        self.tiers.first().map_or(Timestamp::EPOCH, Tier::start_time)
    }

    /// End time of the newest resident axis, `None` before the first append
    pub fn latest_end_time(&self) -> Option<Timestamp> {
        self.tiers
            .iter()
            .find(|tier| !tier.is_empty())
            .and_then(|tier| tier.get(tier.len() - 1))
            .map(|axis| axis.end_time)
    }

    /// Move the opening boundary of a chain that holds no axes yet
    pub fn rebase(&mut self, start_time: Timestamp) {
        if self.is_empty() {
            for tier in &mut self.tiers {
                tier.start_time = start_time;
            }
        }
    }
}

impl<V: StatValue> TieredStore<V> {
    /// Feed `axis` into tier 0 and follow the cascade down. Returns how many
    /// compacted axes moved between tiers.
    pub fn append(&mut self, axis: DiscreteAxis<V>) -> usize {
        let mut pending = Some(axis);
        let mut cascades = 0;

        for (level, tier) in self.tiers.iter_mut().enumerate() {
            let Some(axis) = pending.take() else {
                break;
            };
            pending = tier.append(axis);
            if let Some(compacted) = &pending {
                cascades += 1;
                debug!(
                    target: "keyvis::tiers",
                    from_level = level,
                    end_time = %compacted.end_time,
                    lines = compacted.len(),
                    "Compacted axes cascaded to next tier"
                );
            }
        }

        cascades
    }

    /// Every axis covering `[start, end]`, coarsest first.
    ///
    /// A window that has aged out of a tier is served by the next one; a
    /// window reaching past a tier's oldest axis is extended with what the
    /// coarser tiers still hold for it.
    pub fn range(&self, start: Timestamp, end: Timestamp) -> DiscretePlane<V> {
        self.range_from(0, start, end)
    }

    fn range_from(&self, level: usize, start: Timestamp, end: Timestamp) -> DiscretePlane<V> {
        let Some(tier) = self.tiers.get(level) else {
            return DiscretePlane::new(start);
        };

        let Ok(first) = tier.search(start) else {
            return self.range_from(level + 1, start, end);
        };
        let last = match tier.search(end) {
            Ok(index) => index + 1,
            Err(_) => tier.len(),
        };

        let start_time = if first == 0 {
            tier.start_time
        } else {
            tier.end_time_at(first - 1)
        };
        let axes: Vec<DiscreteAxis<V>> = (first..last)
            .filter_map(|i| tier.get(i).cloned())
            .collect();

        let coarser = self.range_from(level + 1, start, end);
        if coarser.is_empty() {
            return DiscretePlane { start_time, axes };
        }

        let mut merged = coarser;
        merged.axes.extend(axes);
        merged
    }
}


// ============================================================================
// SECTION 11: PERSISTENCE LAYER
// ============================================================================
// Ordered key/value storage for serialized axes:
// - MemoryKv: BTreeMap behind a lock, for tests and throwaway runs
// - FileKv: append-only log of length + CRC32 framed records with an
//   in-memory ordered index rebuilt on open
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 OrderedKv Trait
// ----------------------------------------------------------------------------

/// Byte-ordered key/value storage.
///
/// Keys compare lexicographically, so 8-byte big-endian timestamps scan in
/// chronological order.
pub trait OrderedKv: Send + Sync + Debug {
    /// Insert or overwrite `key`
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Every pair with `lo <= key <= hi`, in key order
    fn range_scan(&self, lo: &[u8], hi: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Every value, in key order
    fn scan_all(&self) -> StorageResult<Vec<Vec<u8>>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn scan_index(
    index: &BTreeMap<Vec<u8>, Vec<u8>>,
    lo: &[u8],
    hi: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    if lo > hi {
        return Vec::new();
    }
    index
        .range::<[u8], _>((std::ops::Bound::Included(lo), std::ops::Bound::Included(hi)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ----------------------------------------------------------------------------
// 11.2 In-Memory Backend
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryKv {
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedKv for MemoryKv {
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.index.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.index.read().get(key).cloned())
    }

    fn range_scan(&self, lo: &[u8], hi: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_index(&self.index.read(), lo, hi))
    }

    fn scan_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.index.read().values().cloned().collect())
    }

    fn len(&self) -> usize {
        self.index.read().len()
    }
}

// ----------------------------------------------------------------------------
// 11.3 File Backend
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct KvRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Append-only record log.
///
/// Frame layout: `[len: u32 LE][crc32: u32 LE][bincode KvRecord]`. A later
/// frame for the same key shadows earlier ones.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Mutex<BufWriter<File>>,
    sync_writes: bool,
}

impl FileKv {
    /// Open (or create) the log at `path` and rebuild the index from it.
    pub fn open<P: AsRef<Path>>(path: P, sync_writes: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::WriteFailed {
                message: format!("create {}: {}", parent.display(), e),
            })?;
        }

        let index = if path.exists() {
            Self::replay(&path)?
        } else {
            BTreeMap::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::WriteFailed {
                message: format!("open {}: {}", path.display(), e),
            })?;

        info!(
            target: "keyvis::storage",
            path = %path.display(),
            records = index.len(),
            "Axis log opened"
        );

        Ok(Self {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(BufWriter::new(file)),
            sync_writes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> StorageResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut buf = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut buf))
            .map_err(|e| StorageError::ReadFailed {
                message: format!("read {}: {}", path.display(), e),
            })?;

        let mut index = BTreeMap::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (record, next) = decode_frame(&buf, offset)?;
            index.insert(record.key, record.value);
            offset = next;
        }
        Ok(index)
    }

    fn append_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(frame)?;
        writer.flush()?;
        if self.sync_writes {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

fn encode_frame(record: &KvRecord) -> StorageResult<Vec<u8>> {
    let payload = bincode::serialize(record).map_err(|e| StorageError::SerializationFailed {
        message: e.to_string(),
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(StorageError::WriteFailed {
            message: format!(
                "record of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_SIZE
            ),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the frame at `offset`; returns the record and the next offset.
fn decode_frame(buf: &[u8], offset: usize) -> StorageResult<(KvRecord, usize)> {
    let remaining = buf.len() - offset;
    if remaining < FRAME_HEADER_SIZE {
        return Err(StorageError::DataCorruption {
            message: format!("truncated frame header at offset {}", offset),
        });
    }

    let len = read_u32_le(buf, offset) as usize;
    let expected_crc = read_u32_le(buf, offset + 4);
    if len > MAX_FRAME_SIZE {
        return Err(StorageError::DataCorruption {
            message: format!("frame at offset {} claims {} bytes", offset, len),
        });
    }

    let start = offset + FRAME_HEADER_SIZE;
    if buf.len() - start < len {
        return Err(StorageError::DataCorruption {
            message: format!(
                "truncated frame at offset {}: {} of {} bytes present",
                offset,
                buf.len() - start,
                len
            ),
        });
    }

    let payload = &buf[start..start + len];
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(StorageError::DataCorruption {
            message: format!(
                "checksum mismatch at offset {}: expected {:08x}, got {:08x}",
                offset, expected_crc, actual_crc
            ),
        });
    }

    let record: KvRecord =
        bincode::deserialize(payload).map_err(|e| StorageError::DeserializationFailed {
            message: format!("frame at offset {}: {}", offset, e),
        })?;
    Ok((record, start + len))
}

impl OrderedKv for FileKv {
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let record = KvRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let frame = encode_frame(&record)?;

        self.append_frame(&frame)
            .map_err(|e| StorageError::WriteFailed {
                message: format!("append to {}: {}", self.path.display(), e),
            })?;

        trace!(
            target: "keyvis::storage",
            bytes = frame.len(),
            "Record appended"
        );

        self.index.write().insert(record.key, record.value);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.index.read().get(key).cloned())
    }

    fn range_scan(&self, lo: &[u8], hi: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_index(&self.index.read(), lo, hi))
    }

    fn scan_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.index.read().values().cloned().collect())
    }

    fn len(&self) -> usize {
        self.index.read().len()
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn key(secs: u64) -> Vec<u8> {
        secs.to_be_bytes().to_vec()
    }

    fn exercise(kv: &dyn OrderedKv) {
        assert!(kv.is_empty());
        kv.put(&key(30), b"thirty").expect("put");
        kv.put(&key(10), b"ten").expect("put");
        kv.put(&key(20), b"twenty").expect("put");
        kv.put(&key(20), b"twenty again").expect("overwrite");

        assert_eq!(kv.len(), 3);
        assert_eq!(kv.get(&key(10)).expect("get"), Some(b"ten".to_vec()));
        assert_eq!(kv.get(&key(15)).expect("get"), None);

        let scanned = kv.range_scan(&key(10), &key(20)).expect("scan");
        assert_eq!(
            scanned,
            vec![
                (key(10), b"ten".to_vec()),
                (key(20), b"twenty again".to_vec()),
            ]
        );
        assert!(kv.range_scan(&key(20), &key(10)).expect("scan").is_empty());

        assert_eq!(
            kv.scan_all().expect("scan all"),
            vec![b"ten".to_vec(), b"twenty again".to_vec(), b"thirty".to_vec()]
        );
    }

    #[test]
    fn test_memory_kv() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn test_file_kv() {
        let dir = TempDir::new().expect("tempdir");
        let kv = FileKv::open(dir.path().join("axes.log"), false).expect("open");
        exercise(&kv);
    }

    #[test]
    fn test_file_kv_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("axes.log");

        {
            let kv = FileKv::open(&path, true).expect("open");
            kv.put(&key(1), b"one").expect("put");
            kv.put(&key(2), b"two").expect("put");
            kv.put(&key(1), b"uno").expect("overwrite");
        }

        let reopened = FileKv::open(&path, true).expect("reopen");
        assert_eq!(reopened.path(), path.as_path());
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&key(1)).expect("get"), Some(b"uno".to_vec()));
        assert_eq!(
            reopened.scan_all().expect("scan all"),
            vec![b"uno".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn test_file_kv_detects_checksum_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("axes.log");
        {
            let kv = FileKv::open(&path, false).expect("open");
            kv.put(&key(1), b"payload").expect("put");
        }

        let mut bytes = fs::read(&path).expect("read log");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).expect("write log");

        let err = FileKv::open(&path, false).expect_err("corruption must be reported");
        assert!(matches!(err, StorageError::DataCorruption { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_file_kv_detects_truncation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("axes.log");
        {
            let kv = FileKv::open(&path, false).expect("open");
            kv.put(&key(1), b"first").expect("put");
            kv.put(&key(2), b"second").expect("put");
        }

        let bytes = fs::read(&path).expect("read log");
        fs::write(&path, &bytes[..bytes.len() - 3]).expect("truncate log");

        let err = FileKv::open(&path, false).expect_err("truncation must be reported");
        assert!(matches!(err, StorageError::DataCorruption { .. }));

        fs::write(&path, &bytes[..5]).expect("truncate header");
        let err = FileKv::open(&path, false).expect_err("short header must be reported");
        assert!(matches!(err, StorageError::DataCorruption { .. }));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        let err = decode_frame(&frame, 0).expect_err("oversized frame");
        assert!(matches!(err, StorageError::DataCorruption { .. }));
    }
}

// ============================================================================
// SECTION 12: KEY VISUAL STORE
// ============================================================================
// Ingestion, persistence and queries behind one coarse lock:
// - Sample batches become denoised axes
// - Every axis is persisted, then fed into tier 0
// - Queries range the tiers, clip keys and pixelate
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Region Samples
// ----------------------------------------------------------------------------

/// Load reported for one contiguous key range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSample {
    pub start_key: String,
    pub end_key: String,
    #[serde(default)]
    pub written_bytes: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub written_keys: u64,
    #[serde(default)]
    pub read_keys: u64,
}

impl RegionSample {
    pub fn new(start_key: impl Into<String>, end_key: impl Into<String>, load: RegionLoad) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
            written_bytes: load.written_bytes,
            read_bytes: load.read_bytes,
            written_keys: load.written_keys,
            read_keys: load.read_keys,
        }
    }

    pub fn load(&self) -> RegionLoad {
        RegionLoad {
            written_bytes: self.written_bytes,
            read_bytes: self.read_bytes,
            written_keys: self.written_keys,
            read_keys: self.read_keys,
        }
    }
}

/// Turn one sorted, key-contiguous batch into a denoised axis.
///
/// Missing samples are skipped. An empty end key on the last sample stretches
/// it to [`MAX_KEY`]. Returns `None` when the batch carries no sample at all.
pub fn axis_from_samples(
    samples: &[Option<RegionSample>],
    end_time: Timestamp,
) -> Option<DiscreteAxis<RegionUnit>> {
    let first = samples.iter().flatten().next()?;
    let last_index = samples.iter().rposition(Option::is_some)?;

    let mut axis = DiscreteAxis::empty(first.start_key.clone(), end_time);
    axis.lines = samples
        .iter()
        .enumerate()
        .filter_map(|(i, sample)| sample.as_ref().map(|sample| (i, sample)))
        .map(|(i, sample)| {
            let end_key = if i == last_index && sample.end_key.is_empty() {
                MAX_KEY
            } else {
                sample.end_key.as_str()
            };
            Line::new(end_key, RegionUnit::from_load(sample.load()))
        })
        .collect();

    axis.denoise(INGEST_DENOISE_THRESHOLD);
    Some(axis)
}

// ----------------------------------------------------------------------------
// 12.2 Heatmap Types
// ----------------------------------------------------------------------------

/// Parameters of a heatmap request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapQuery {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    #[serde(default)]
    pub start_key: String,
    /// Empty means the end of key space
    #[serde(default)]
    pub end_key: String,
    /// `None` keeps the full multi-metric value
    #[serde(default)]
    pub tag: Option<HeatmapTag>,
    #[serde(default)]
    pub mode: StatMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeatmapData {
    Single(Vec<Vec<u64>>),
    Multi(Vec<Vec<RegionUnit>>),
}

/// A rendered heatmap: `data[i][j]` covers time `(times[i], times[i+1]]`
/// and keys `(keys[j], keys[j+1]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heatmap {
    pub data: HeatmapData,
    pub keys: Vec<String>,
    pub times: Vec<Timestamp>,
}

// ----------------------------------------------------------------------------
// 12.3 Store Statistics
// ----------------------------------------------------------------------------

/// Store activity counters
#[derive(Debug, Default)]
pub struct StoreStats {
    appends: AtomicU64,
    skipped_batches: AtomicU64,
    out_of_order_batches: AtomicU64,
    cascades: AtomicU64,
    queries: AtomicU64,
    persisted_bytes: AtomicU64,
    replayed_axes: AtomicU64,
    scan_failures: AtomicU64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            appends: self.appends.load(AtomicOrdering::Relaxed),
            skipped_batches: self.skipped_batches.load(AtomicOrdering::Relaxed),
            out_of_order_batches: self.out_of_order_batches.load(AtomicOrdering::Relaxed),
            cascades: self.cascades.load(AtomicOrdering::Relaxed),
            queries: self.queries.load(AtomicOrdering::Relaxed),
            persisted_bytes: self.persisted_bytes.load(AtomicOrdering::Relaxed),
            replayed_axes: self.replayed_axes.load(AtomicOrdering::Relaxed),
            scan_failures: self.scan_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub appends: u64,
    pub skipped_batches: u64,
    pub out_of_order_batches: u64,
    pub cascades: u64,
    pub queries: u64,
    pub persisted_bytes: u64,
    pub replayed_axes: u64,
    pub scan_failures: u64,
}

// ----------------------------------------------------------------------------
// 12.4 KeyVisualStore
// ----------------------------------------------------------------------------

/// Owns the tier chain and the KV handle.
///
/// Appends hold the write lock across persistence and the tier cascade;
/// queries copy a plane out under the read lock and pixelate outside it.
#[derive(Debug)]
pub struct KeyVisualStore {
    tiers: RwLock<TieredStore<RegionUnit>>,
    kv: Arc<dyn OrderedKv>,
    query: QueryConfig,
    /// Span given to the first axis of an empty store
    first_span: Duration,
    stats: StoreStats,
}

fn decode_axis(bytes: &[u8]) -> StorageResult<DiscreteAxis<RegionUnit>> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::DeserializationFailed {
        message: format!("persisted axis: {}", e),
    })
}

fn clip_plane<V: StatValue>(
    mut plane: DiscretePlane<V>,
    start_key: &str,
    end_key: &str,
) -> DiscretePlane<V> {
    let end_key = if end_key.is_empty() { MAX_KEY } else { end_key };
    for axis in &mut plane.axes {
        *axis = axis.range(start_key, end_key);
    }
    plane
}

impl KeyVisualStore {
    /// Create an empty store whose first axis will open at `start_time`
    pub fn new(
        retention: &RetentionConfig,
        query: QueryConfig,
        kv: Arc<dyn OrderedKv>,
        start_time: Timestamp,
    ) -> KeyVisResult<Self> {
        Ok(Self {
            tiers: RwLock::new(TieredStore::new(retention, start_time)?),
            kv,
            query,
            first_span: Duration::from_secs(DEFAULT_INGEST_INTERVAL_SECS),
            stats: StoreStats::default(),
        })
    }

    /// Rebuild the tier chain from every axis persisted in `kv`.
    ///
    /// The oldest axis is assumed to cover one ingest interval. Any record
    /// that fails to decode aborts the open.
    pub fn open(config: &EngineConfig, kv: Arc<dyn OrderedKv>) -> KeyVisResult<Self> {
        let axes = kv
            .scan_all()?
            .iter()
            .map(|record| decode_axis(record))
            .collect::<StorageResult<Vec<_>>>()?;

        let start_time = axes.first().map_or_else(Timestamp::now, |axis| {
            axis.end_time.sub_duration(config.ingest_interval())
        });

        let store = Self {
            first_span: config.ingest_interval(),
            ..Self::new(&config.retention, config.query, kv, start_time)?
        };
        let replayed = axes.len() as u64;
        let cascades = {
            let mut tiers = store.tiers.write();
            axes.into_iter().map(|axis| tiers.append(axis)).sum::<usize>()
        };

        store
            .stats
            .replayed_axes
            .fetch_add(replayed, AtomicOrdering::Relaxed);
        store
            .stats
            .cascades
            .fetch_add(cascades as u64, AtomicOrdering::Relaxed);

        info!(
            target: "keyvis::store",
            replayed,
            cascades,
            start_time = %start_time,
            "Store opened"
        );

        Ok(store)
    }

    /// Ingest a batch stamped with the current time
    pub fn append(&self, samples: &[Option<RegionSample>]) -> KeyVisResult<bool> {
        self.append_at(samples, Timestamp::now())
    }

    /// Ingest a batch stamped with `at`. Returns `false` when the batch held
    /// nothing to store or `at` is not later than the newest axis.
    pub fn append_at(&self, samples: &[Option<RegionSample>], at: Timestamp) -> KeyVisResult<bool> {
        let Some(axis) = axis_from_samples(samples, at) else {
            self.stats.skipped_batches.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(target: "keyvis::store", samples = samples.len(), "Empty batch skipped");
            return Ok(false);
        };

        let payload = serde_json::to_vec(&axis).map_err(|e| StorageError::SerializationFailed {
            message: e.to_string(),
        })?;
        let lines = axis.len();

        let cascades = {
            let mut tiers = self.tiers.write();
            match tiers.latest_end_time() {
                Some(latest) if at <= latest => {
                    self.stats.out_of_order_batches.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(
                        target: "keyvis::store",
                        at = %at,
                        latest = %latest,
                        "Batch not newer than the latest axis, dropped"
                    );
                    return Ok(false);
                }
                Some(_) => {}
                None if at <= tiers.start_time() => {
                    tiers.rebase(at.sub_duration(self.first_span));
                }
                None => {}
            }
            self.kv.put(&at.to_record_key(), &payload)?;
            tiers.append(axis)
        };

        self.stats.appends.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats
            .cascades
            .fetch_add(cascades as u64, AtomicOrdering::Relaxed);
        self.stats
            .persisted_bytes
            .fetch_add(payload.len() as u64, AtomicOrdering::Relaxed);

        debug!(
            target: "keyvis::store",
            samples = samples.len(),
            lines,
            cascades,
            at = %at,
            "Axis appended"
        );

        Ok(true)
    }

    /// Copy of every stored axis covering `[start, end]`
    pub fn range_plane(&self, start: Timestamp, end: Timestamp) -> DiscretePlane<RegionUnit> {
        self.tiers.read().range(start, end)
    }

    /// Multi-metric matrix for a time window and key range, `None` when the
    /// window holds no data
    pub fn query_matrix(
        &self,
        start_time: Timestamp,
        end_time: Timestamp,
        start_key: &str,
        end_key: &str,
    ) -> Option<Matrix<RegionUnit>> {
        self.stats.queries.fetch_add(1, AtomicOrdering::Relaxed);
        let plane = clip_plane(self.range_plane(start_time, end_time), start_key, end_key);
        self.pixelate(&plane)
    }

    /// Render a heatmap, projecting every unit onto `query.tag` first
    pub fn heatmap(&self, query: &HeatmapQuery) -> Option<Heatmap> {
        self.stats.queries.fetch_add(1, AtomicOrdering::Relaxed);
        let plane = clip_plane(
            self.range_plane(query.start_time, query.end_time),
            &query.start_key,
            &query.end_key,
        );

        let heatmap = match query.tag {
            None => {
                let matrix = self.pixelate(&plane)?;
                Heatmap {
                    data: HeatmapData::Multi(matrix.data),
                    keys: matrix.keys,
                    times: matrix.times,
                }
            }
            Some(tag) => {
                let projected = plane.map_values(|unit| tag.project(unit, query.mode));
                let matrix = self.pixelate(&projected)?.map_values(|unit| unit.value);
                Heatmap {
                    data: HeatmapData::Single(matrix.data),
                    keys: matrix.keys,
                    times: matrix.times,
                }
            }
        };

        debug!(
            target: "keyvis::store",
            tag = query.tag.map_or("multi", |tag| tag.as_str()),
            mode = %query.mode,
            keys = heatmap.keys.len(),
            times = heatmap.times.len(),
            "Heatmap rendered"
        );

        Some(heatmap)
    }

    fn pixelate<V: StatValue>(&self, plane: &DiscretePlane<V>) -> Option<Matrix<V>> {
        plane
            .pixel(self.query.time_rows, self.query.key_columns)
            .filter(|matrix| !matrix.is_blank())
    }

    /// Read persisted axes for `[start, end]` straight from the KV store,
    /// bypassing the tiers
    pub fn load_persisted_range(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> KeyVisResult<DiscretePlane<RegionUnit>> {
        let records = self
            .kv
            .range_scan(&start.to_record_key(), &end.to_record_key())?;
        let axes = records
            .iter()
            .map(|(key, value)| {
                Timestamp::from_record_key(key)
                    .ok_or(StorageError::InvalidRecordKey { len: key.len() })?;
                decode_axis(value)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(DiscretePlane {
            start_time: start,
            axes,
        })
    }

    pub(crate) fn record_scan_failure(&self) {
        self.stats.scan_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn query_config(&self) -> QueryConfig {
        self.query
    }

    /// Resident axes across every tier
    pub fn resident_axes(&self) -> usize {
        self.tiers.read().len()
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE_SECS: i64 = 1_700_000_000;

    fn at(secs: i64) -> Timestamp {
        Timestamp::from_secs(BASE_SECS + secs)
    }

    fn sample(start: &str, end: &str, rb: u64, rk: u64, wb: u64, wk: u64) -> Option<RegionSample> {
        Some(RegionSample {
            start_key: start.to_string(),
            end_key: end.to_string(),
            read_bytes: rb,
            read_keys: rk,
            written_bytes: wb,
            written_keys: wk,
        })
    }

    fn memory_store(kv: Arc<dyn OrderedKv>) -> KeyVisualStore {
        KeyVisualStore::new(&RetentionConfig::default(), QueryConfig::default(), kv, at(0))
            .expect("default layout is valid")
    }

    /// Two batches over `[a, b)` and `[b, d)`, one minute apart
    fn seeded_store() -> KeyVisualStore {
        let store = memory_store(Arc::new(MemoryKv::new()));
        let first = vec![sample("a", "b", 1, 2, 3, 4), sample("b", "d", 2, 3, 4, 5)];
        let second = vec![sample("a", "b", 3, 4, 5, 6), sample("b", "d", 4, 5, 6, 7)];
        assert!(store.append_at(&first, at(60)).expect("append"));
        assert!(store.append_at(&second, at(120)).expect("append"));
        store
    }

    fn query(tag: Option<HeatmapTag>, mode: StatMode) -> HeatmapQuery {
        HeatmapQuery {
            start_time: at(0),
            end_time: at(120),
            start_key: String::new(),
            end_key: MAX_KEY.to_string(),
            tag,
            mode,
        }
    }

    fn single(heatmap: &Heatmap) -> &Vec<Vec<u64>> {
        match &heatmap.data {
            HeatmapData::Single(data) => data,
            HeatmapData::Multi(_) => panic!("expected single-metric data"),
        }
    }

    #[test]
    fn test_axis_from_samples() {
        let samples = vec![
            None,
            sample("a", "b", 1, 0, 0, 0),
            None,
            sample("b", "", 2, 0, 0, 0),
        ];
        let axis = axis_from_samples(&samples, at(5)).expect("present samples");
        assert_eq!(axis.start_key, "a");
        assert_eq!(axis.discrete_keys(), vec!["a", "b", MAX_KEY]);
        assert_eq!(axis.end_time, at(5));
        assert_eq!(axis.lines[1].value.max.read_bytes, 2);
        assert_eq!(axis.lines[1].value.average.read_bytes, 2);

        assert!(axis_from_samples(&[None, None], at(5)).is_none());
        assert!(axis_from_samples(&[], at(5)).is_none());
    }

    #[test]
    fn test_axis_from_samples_collapses_idle_ranges() {
        let samples = vec![
            sample("a", "b", 0, 0, 0, 0),
            sample("b", "c", 0, 0, 0, 0),
            sample("c", "d", 5, 0, 0, 0),
        ];
        let axis = axis_from_samples(&samples, at(5)).expect("present samples");
        assert_eq!(axis.discrete_keys(), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_single_tag_heatmaps() {
        let store = seeded_store();
        let cases: [(HeatmapTag, Vec<Vec<u64>>); 6] = [
            (HeatmapTag::ReadBytes, vec![vec![1, 2], vec![3, 4]]),
            (HeatmapTag::ReadKeys, vec![vec![2, 3], vec![4, 5]]),
            (HeatmapTag::WrittenBytes, vec![vec![3, 4], vec![5, 6]]),
            (HeatmapTag::WrittenKeys, vec![vec![4, 5], vec![6, 7]]),
            (HeatmapTag::ReadAndWrittenBytes, vec![vec![4, 6], vec![8, 10]]),
            (HeatmapTag::ReadAndWrittenKeys, vec![vec![6, 8], vec![10, 12]]),
        ];

        for (tag, expected) in cases {
            for mode in [StatMode::Max, StatMode::Average] {
                let heatmap = store
                    .heatmap(&query(Some(tag), mode))
                    .unwrap_or_else(|| panic!("{} / {} should render", tag, mode));
                assert_eq!(single(&heatmap), &expected, "{} / {}", tag, mode);
                assert_eq!(heatmap.keys, vec!["a", "b", "d"]);
                assert_eq!(heatmap.times, vec![at(0), at(60), at(120)]);
            }
        }
    }

    #[test]
    fn test_multi_value_heatmap() {
        let store = seeded_store();
        let heatmap = store.heatmap(&query(None, StatMode::Max)).expect("renders");
        let HeatmapData::Multi(data) = &heatmap.data else {
            panic!("expected multi-metric data");
        };
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].len(), 2);
        assert_eq!(data[1][1].max.written_keys, 7);
        assert_eq!(heatmap.keys, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_empty_results() {
        let store = seeded_store();
        let mut out_of_keys = query(Some(HeatmapTag::ReadAndWrittenKeys), StatMode::Max);
        out_of_keys.start_key = MAX_KEY.to_string();
        assert!(store.heatmap(&out_of_keys).is_none());

        let empty = memory_store(Arc::new(MemoryKv::new()));
        assert!(empty
            .heatmap(&query(Some(HeatmapTag::ReadBytes), StatMode::Average))
            .is_none());
        assert!(empty.query_matrix(at(0), at(600), "", "").is_none());
    }

    #[test]
    fn test_query_matrix() {
        let store = seeded_store();
        let matrix = store.query_matrix(at(0), at(120), "", "").expect("data in range");
        assert_eq!(matrix.keys, vec!["a", "b", "d"]);
        assert_eq!(matrix.rows(), 2);
        assert_eq!(matrix.data[0][0], RegionUnit::from_load(RegionLoad {
            written_bytes: 3,
            read_bytes: 1,
            written_keys: 4,
            read_keys: 2,
        }));

        let clipped = store.query_matrix(at(0), at(120), "b", "").expect("data in range");
        assert_eq!(clipped.keys, vec!["b", "d"]);
        assert_eq!(clipped.columns(), 1);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
        let store = memory_store(kv.clone());
        assert!(!store.append_at(&[], at(60)).expect("no-op"));
        assert!(!store.append_at(&[None], at(60)).expect("no-op"));

        assert!(kv.is_empty());
        assert_eq!(store.resident_axes(), 0);
        let stats = store.stats();
        assert_eq!(stats.appends, 0);
        assert_eq!(stats.skipped_batches, 2);
    }

    #[test]
    fn test_append_persists_under_record_key() {
        let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
        let store = memory_store(kv.clone());
        store
            .append_at(&[sample("a", "", 9, 0, 0, 0)], at(60))
            .expect("append");

        let raw = kv
            .get(&at(60).to_record_key())
            .expect("get")
            .expect("persisted record");
        let axis = decode_axis(&raw).expect("valid json");
        assert_eq!(axis.discrete_keys(), vec!["a", MAX_KEY]);
        assert_eq!(axis.end_time, at(60));
        assert_eq!(Timestamp::from_record_key(&at(60).to_record_key()), Some(at(60)));
        assert_eq!(Timestamp::from_record_key(b"short"), None);

        let stats = store.stats();
        assert_eq!(stats.appends, 1);
        assert_eq!(stats.persisted_bytes, raw.len() as u64);
    }

    #[test]
    fn test_open_replays_persisted_axes() {
        let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
        {
            let store = memory_store(kv.clone());
            store
                .append_at(&[sample("a", "b", 1, 0, 0, 0)], at(60))
                .expect("append");
            store
                .append_at(&[sample("a", "b", 2, 0, 0, 0)], at(120))
                .expect("append");
        }

        let mut config = EngineConfig::default();
        config.storage.backend = StorageBackend::Memory;
        let reopened = KeyVisualStore::open(&config, kv).expect("replay");

        assert_eq!(reopened.stats().replayed_axes, 2);
        let plane = reopened.range_plane(at(0), at(120));
        assert_eq!(plane.discrete_times(), vec![at(0), at(60), at(120)]);
        assert_eq!(plane.axes[1].lines[0].value.max.read_bytes, 2);
    }

    #[test]
    fn test_corrupt_records_are_fatal() {
        let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
        let store = memory_store(kv.clone());
        store
            .append_at(&[sample("a", "b", 1, 0, 0, 0)], at(60))
            .expect("append");
        kv.put(&at(90).to_record_key(), b"{not json").expect("put");

        let err = store
            .load_persisted_range(at(0), at(120))
            .expect_err("corrupt record");
        assert!(matches!(
            err,
            KeyVisError::Storage(StorageError::DeserializationFailed { .. })
        ));
        assert!(!err.is_recoverable());

        assert!(KeyVisualStore::open(&EngineConfig::default(), kv).is_err());
    }

    #[test]
    fn test_out_of_order_append_is_dropped() {
        let kv: Arc<dyn OrderedKv> = Arc::new(MemoryKv::new());
        let store = memory_store(kv.clone());
        assert!(store
            .append_at(&[sample("a", "b", 1, 0, 0, 0)], at(120))
            .expect("append"));
        assert!(!store
            .append_at(&[sample("a", "b", 2, 0, 0, 0)], at(60))
            .expect("older batch"));
        assert!(!store
            .append_at(&[sample("a", "b", 3, 0, 0, 0)], at(120))
            .expect("same instant"));

        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get(&at(60).to_record_key()).expect("get"), None);
        assert_eq!(store.resident_axes(), 1);
        let stats = store.stats();
        assert_eq!(stats.appends, 1);
        assert_eq!(stats.out_of_order_batches, 2);

        let plane = store.range_plane(at(0), at(200));
        assert_eq!(plane.discrete_times(), vec![at(0), at(120)]);
        let matrix = store.query_matrix(at(0), at(200), "", "").expect("data");
        assert!(matrix.times.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_first_append_before_start_rebases() {
        let store = memory_store(Arc::new(MemoryKv::new()));
        assert!(store
            .append_at(&[sample("a", "b", 1, 0, 0, 0)], at(-30))
            .expect("append"));

        let plane = store.range_plane(at(-90), at(-30));
        assert_eq!(plane.discrete_times(), vec![at(-90), at(-30)]);
    }

    #[test]
    fn test_load_persisted_range() {
        let store = seeded_store();
        let plane = store
            .load_persisted_range(at(60), at(60))
            .expect("valid records");
        assert_eq!(plane.start_time, at(60));
        assert_eq!(plane.axes.len(), 1);
        assert_eq!(plane.axes[0].end_time, at(60));

        let all = store.load_persisted_range(at(0), at(600)).expect("valid records");
        assert_eq!(all.axes.len(), 2);
        assert!(store
            .load_persisted_range(at(600), at(900))
            .expect("valid records")
            .is_empty());
    }
}

// ============================================================================
// SECTION 13: INGESTION LOOP
// ============================================================================
// Periodic region scans feeding the store:
// - RegionSource is the async seam to whatever reports range statistics
// - FileRegionSource replays JSON-lines batches from disk
// - run_ingest_loop ticks until the shutdown notification fires
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 RegionSource Trait
// ----------------------------------------------------------------------------

/// Produces one sorted, key-contiguous batch per call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn scan(&self) -> KeyVisResult<Vec<Option<RegionSample>>>;
}

// ----------------------------------------------------------------------------
// 13.2 Sample Batch Files
// ----------------------------------------------------------------------------

/// One line of a sample file: `{"time": <unix secs>?, "regions": [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    #[serde(default)]
    pub time: Option<i64>,
    pub regions: Vec<Option<RegionSample>>,
}

impl SampleBatch {
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.time.map(Timestamp::from_secs)
    }
}

/// Parse a JSON-lines sample file. Blank lines are ignored.
pub fn read_sample_batches<P: AsRef<Path>>(path: P) -> KeyVisResult<Vec<SampleBatch>> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_sample_batches(&content)
}

fn parse_sample_batches(content: &str) -> KeyVisResult<Vec<SampleBatch>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let malformed = |message: String| {
                KeyVisError::from(IngestError::MalformedBatch {
                    line: i + 1,
                    message,
                })
            };
            let batch: SampleBatch =
                serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
            match batch.time {
                Some(secs) if Timestamp::checked_from_secs(secs).is_none() => {
                    Err(malformed(format!("time {} is out of range", secs)))
                }
                _ => Ok(batch),
            }
        })
        .collect()
}

/// Append every batch in order, stamping unstamped ones with the current
/// time. Returns how many batches produced an axis.
pub fn ingest_batches(store: &KeyVisualStore, batches: &[SampleBatch]) -> KeyVisResult<usize> {
    let mut stored = 0;
    for batch in batches {
        let at = batch.timestamp().unwrap_or_else(Timestamp::now);
        if store.append_at(&batch.regions, at)? {
            stored += 1;
        }
    }
    Ok(stored)
}

/// Hands out the batches of a sample file one scan at a time, then reports
/// empty batches
#[derive(Debug)]
pub struct FileRegionSource {
    batches: Mutex<VecDeque<Vec<Option<RegionSample>>>>,
}

impl FileRegionSource {
    pub fn open<P: AsRef<Path>>(path: P) -> KeyVisResult<Self> {
        let path = path.as_ref();
        let batches = read_sample_batches(path)?;
        info!(
            target: "keyvis::ingest",
            path = %path.display(),
            batches = batches.len(),
            "Sample file loaded"
        );
        Ok(Self::from_batches(batches))
    }

    pub fn from_batches(batches: Vec<SampleBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into_iter().map(|batch| batch.regions).collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl RegionSource for FileRegionSource {
    async fn scan(&self) -> KeyVisResult<Vec<Option<RegionSample>>> {
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// 13.3 The Loop
// ----------------------------------------------------------------------------

/// Scan `source` every `period` and append the result until `shutdown` is
/// notified.
///
/// Failed scans are counted and skipped. Append errors end the loop only when
/// they are not recoverable.
pub async fn run_ingest_loop(
    store: Arc<KeyVisualStore>,
    source: Arc<dyn RegionSource>,
    period: Duration,
    shutdown: Arc<Notify>,
) -> KeyVisResult<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "keyvis::ingest",
        interval_ms = period.as_millis() as u64,
        "Ingest loop started"
    );

    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ticks += 1;
                trace!(target: "keyvis::ingest", tick = ticks, "Scan tick");

                let batch = match source.scan().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        store.record_scan_failure();
                        warn!(
                            target: "keyvis::ingest",
                            error = %e,
                            category = e.category(),
                            "Region scan failed, skipping tick"
                        );
                        continue;
                    }
                };

                if let Err(e) = store.append(&batch) {
                    if !e.is_recoverable() {
                        error!(
                            target: "keyvis::ingest",
                            error = %e,
                            category = e.category(),
                            "Unrecoverable append failure"
                        );
                        return Err(e);
                    }
                    warn!(target: "keyvis::ingest", error = %e, "Append failed");
                }
            }
            _ = shutdown.notified() => {
                info!(target: "keyvis::ingest", ticks, "Ingest loop stopping");
                break;
            }
        }
    }

    Ok(())
}

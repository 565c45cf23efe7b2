//! # Dynamowatch - DynamoDB Metrics Collector
//!
//! Periodically queries CloudWatch for a fixed catalog of DynamoDB table and
//! per-operation statistics, flattens the answers into keyed samples and hands
//! them to a bounded delivery queue.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              DYNAMOWATCH                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CATALOG → WINDOW → FETCHER → ITEM BUILDER → QUEUE SINK → DELIVERY QUEUE     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Static Catalog**: entity-level and per-operation metrics declared once
//! - **Uniform Exclusions**: one predicate over fully-qualified metric paths
//! - **Fail-Fast**: provider errors and timeouts abort the run, no partial output
//! - **Non-Blocking Hand-off**: queue-full is surfaced immediately and counted
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![allow(unused_variables)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{interval, timeout, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Configuration & CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

// ----------------------------------------------------------------------------
// Provider Constants
// ----------------------------------------------------------------------------

/// CloudWatch namespace DynamoDB publishes into
pub const PROVIDER_NAMESPACE: &str = "AWS/DynamoDB";

/// Prefix of every synthesized sample key
pub const KEY_PREFIX: &str = "cloudwatch.dynamodb";

/// Constant key emitted once per successful run
pub const LIVENESS_KEY: &str = "blackbird.dynamodb.ping";

/// Value carried by the liveness sample
pub const LIVENESS_VALUE: f64 = 1.0;

/// Dimension naming the monitored table
pub const TABLE_DIMENSION: &str = "TableName";

/// Dimension naming the request operation
pub const OPERATION_DIMENSION: &str = "Operation";

/// Metric-name prefix of provisioned capacity metrics
pub const PROVISIONED_CAPACITY_PREFIX: &str = "Provisioned";

// ----------------------------------------------------------------------------
// Defaults & Limits
// ----------------------------------------------------------------------------

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default polling interval in seconds
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Smallest period ever requested from the provider
pub const MIN_PERIOD_SECS: u64 = 60;

/// Lookback used when the interval sits at or below the floor
pub const MIN_LOOKBACK_SECS: u64 = 120;

/// Longest wait between two scheduled runs (one year)
pub const MAX_SCHEDULE_TICK_SECS: u64 = 365 * 86_400;

/// Default per-call timeout for provider requests
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default bounded queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "DYNAMOWATCH_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// Aggregation
// ----------------------------------------------------------------------------

/// Statistic requested from the provider for one metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregation {
    Sum,
    Average,
    Maximum,
    Minimum,
    SampleCount,
}

impl Aggregation {
    pub const ALL: [Aggregation; 5] = [
        Aggregation::Sum,
        Aggregation::Average,
        Aggregation::Maximum,
        Aggregation::Minimum,
        Aggregation::SampleCount,
    ];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "Sum",
            Aggregation::Average => "Average",
            Aggregation::Maximum => "Maximum",
            Aggregation::Minimum => "Minimum",
            Aggregation::SampleCount => "SampleCount",
        }
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregation::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CatalogError::InvalidName {
                name: s.to_string(),
                reason: "unknown aggregation".to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Catalog Definitions
// ----------------------------------------------------------------------------

/// A `(metric_name, aggregation)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: CompactString,
    pub aggregation: Aggregation,
}

impl MetricDefinition {
    pub fn new(name: impl Into<CompactString>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            aggregation,
        }
    }
}

/// Metrics queried with an extra operation dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub operation: CompactString,
    pub metrics: Vec<MetricDefinition>,
}

impl OperationMetrics {
    pub fn new(operation: impl Into<CompactString>, metrics: Vec<MetricDefinition>) -> Self {
        Self {
            operation: operation.into(),
            metrics,
        }
    }
}

/// One ordered catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEntry {
    Entity(MetricDefinition),
    Operation(OperationMetrics),
}

/// Fully-qualified location of a metric inside the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetricPath<'a> {
    pub operation: Option<&'a str>,
    pub metric: &'a str,
}

impl<'a> MetricPath<'a> {
    pub fn entity(metric: &'a str) -> Self {
        Self {
            operation: None,
            metric,
        }
    }

    pub fn operation(operation: &'a str, metric: &'a str) -> Self {
        Self {
            operation: Some(operation),
            metric,
        }
    }

    /// `metric` for entity paths, `operation.metric` otherwise
    pub fn qualified(&self) -> String {
        match self.operation {
            Some(op) => format!("{}.{}", op, self.metric),
            None => self.metric.to_string(),
        }
    }
}

impl Display for MetricPath<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.operation {
            Some(op) => write!(f, "{}.{}", op, self.metric),
            None => f.write_str(self.metric),
        }
    }
}

// ----------------------------------------------------------------------------
// Sample Key
// ----------------------------------------------------------------------------

/// Dot-delimited identifier of one fetched statistic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleKey(String);

impl SampleKey {
    /// `<prefix>.<metric>.<aggregation>`
    pub fn entity(prefix: &str, def: &MetricDefinition) -> Self {
        Self(format!("{}.{}.{}", prefix, def.name, def.aggregation))
    }

    /// `<prefix>.<operation>.<metric>.<aggregation>`
    pub fn operation(prefix: &str, operation: &str, def: &MetricDefinition) -> Self {
        Self(format!(
            "{}.{}.{}.{}",
            prefix, operation, def.name, def.aggregation
        ))
    }

    pub fn liveness(key: &str) -> Self {
        Self(key.to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segment just before the aggregation
    pub fn metric_segment(&self) -> Option<&str> {
        metric_segment(&self.0)
    }

    pub fn is_provisioned_capacity(&self) -> bool {
        is_provisioned_capacity_key(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for SampleKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SampleKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn metric_segment(key: &str) -> Option<&str> {
    let mut segments = key.rsplit('.');
    segments.next()?;
    segments.next()
}

/// True when the metric segment of `key` names a provisioned capacity metric.
///
/// Keys are `<prefix>[.<operation>].<metric>.<aggregation>`, so the metric is
/// always the second segment from the right.
pub fn is_provisioned_capacity_key(key: &str) -> bool {
    metric_segment(key)
        .map(|m| m.starts_with(PROVISIONED_CAPACITY_PREFIX))
        .unwrap_or(false)
}

// ----------------------------------------------------------------------------
// Sample Values
// ----------------------------------------------------------------------------

/// A fetched measurement, or nothing when the window had no datapoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Present(f64),
    Absent,
}

impl SampleValue {
    #[inline]
    pub fn as_option(&self) -> Option<f64> {
        match self {
            SampleValue::Present(v) => Some(*v),
            SampleValue::Absent => None,
        }
    }

    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, SampleValue::Absent)
    }
}

impl From<Option<f64>> for SampleValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) => SampleValue::Present(v),
            None => SampleValue::Absent,
        }
    }
}

/// One entry of the flat fetch result
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub key: SampleKey,
    pub value: SampleValue,
}

/// Flat mapping of sample key to value, kept in catalog order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedMetrics {
    samples: Vec<RawSample>,
}

impl FetchedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawSample> {
        self.samples.iter()
    }

    pub fn get(&self, key: &str) -> Option<SampleValue> {
        self.samples
            .iter()
            .find(|s| s.key.as_str() == key)
            .map(|s| s.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.samples.iter().any(|s| s.key.as_str() == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.key.as_str())
    }

    /// Appends a sample, rejecting a key that is already present
    pub fn insert(&mut self, key: SampleKey, value: SampleValue) -> Result<(), CatalogError> {
        if self.contains_key(key.as_str()) {
            return Err(CatalogError::DuplicateKey {
                key: key.into_string(),
            });
        }
        self.samples.push(RawSample { key, value });
        Ok(())
    }

    /// Merges another mapping, rejecting any colliding key
    pub fn extend(&mut self, other: FetchedMetrics) -> Result<(), CatalogError> {
        for sample in other.samples {
            self.insert(sample.key, sample.value)?;
        }
        Ok(())
    }

    /// JSON object of key to number, or null for absent values
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .samples
            .iter()
            .map(|s| {
                let value = match s.value {
                    SampleValue::Present(v) => serde_json::Number::from_f64(v)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                    SampleValue::Absent => serde_json::Value::Null,
                };
                (s.key.as_str().to_string(), value)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl<'a> IntoIterator for &'a FetchedMetrics {
    type Item = &'a RawSample;
    type IntoIter = std::slice::Iter<'a, RawSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

// ----------------------------------------------------------------------------
// Sample Record
// ----------------------------------------------------------------------------

/// The unit handed to the delivery queue. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    key: String,
    value: f64,
    host: Option<CompactString>,
    clock: i64,
}

impl SampleRecord {
    /// Builds a record stamped with the current unix time
    pub fn new(key: impl Into<String>, value: f64, host: Option<CompactString>) -> Self {
        Self {
            key: key.into(),
            value,
            host,
            clock: Utc::now().timestamp(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Creation time, unix seconds
    #[inline]
    pub fn clock(&self) -> i64 {
        self.clock
    }
}

// ----------------------------------------------------------------------------
// Collection Window
// ----------------------------------------------------------------------------

/// Period and absolute time range shared by every query of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionWindow {
    pub period_secs: u64,
    pub lookback_secs: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CollectionWindow {
    /// Derives the window ending at `now`.
    ///
    /// Intervals at or below [`MIN_PERIOD_SECS`] use a 60s period with a 120s
    /// lookback; larger intervals use the interval as period and twice that as
    /// lookback. A missing interval means [`DEFAULT_INTERVAL_SECS`].
    ///
    /// Lookbacks that overflow the calendar saturate: `lookback_secs` at
    /// `u64::MAX` and `start` at the earliest representable instant.
    pub fn compute(interval: Option<u64>, now: DateTime<Utc>) -> Self {
        let requested = interval.unwrap_or(DEFAULT_INTERVAL_SECS);

        let (period_secs, lookback_secs) = if requested <= MIN_PERIOD_SECS {
            (MIN_PERIOD_SECS, MIN_LOOKBACK_SECS)
        } else {
            (requested, requested.saturating_mul(2))
        };

        let start = i64::try_from(lookback_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|lookback| now.checked_sub_signed(lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            period_secs,
            lookback_secs,
            start,
            end: now,
        }
    }

    /// Window ending at the current wall-clock time
    pub fn now(interval: Option<u64>) -> Self {
        Self::compute(interval, Utc::now())
    }
}

// ----------------------------------------------------------------------------
// Run Summary
// ----------------------------------------------------------------------------

/// Outcome of one successful collection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Raw entries returned by the fetcher, liveness included
    pub fetched: usize,
    /// Records accepted by the queue
    pub enqueued: usize,
    /// Absent provisioned capacity samples dropped
    pub skipped: usize,
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

/// Top-level error of a collection job
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Whether a later run may succeed without operator action
    pub fn is_recoverable(&self) -> bool {
        match self {
            JobError::Provider(e) => e.is_recoverable(),
            JobError::Queue(QueueError::Full { .. }) => true,
            JobError::Queue(QueueError::Disconnected { .. }) => false,
            JobError::Io(_) => true,
            JobError::Config(_) | JobError::Catalog(_) | JobError::Internal(_) => false,
        }
    }

    /// Short label used in logs and failure counters
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Config(_) => "config",
            JobError::Catalog(_) => "catalog",
            JobError::Provider(_) => "provider",
            JobError::Queue(_) => "queue",
            JobError::Io(_) => "io",
            JobError::Internal(_) => "internal",
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Catalog construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Invalid catalog name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Duplicate sample key: {key}")]
    DuplicateKey { key: String },

    #[error("Catalog has no entries")]
    Empty,
}

/// Remote provider errors. All of them abort the current run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Failed to connect to provider in {region}: {message}")]
    ConnectionFailed { region: String, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Request for {metric} failed: {message}")]
    RequestFailed { metric: String, message: String },

    #[error("Request for {metric} timed out after {timeout_ms}ms")]
    Timeout { metric: String, timeout_ms: u64 },

    #[error("Invalid response for {metric}: {message}")]
    InvalidResponse { metric: String, message: String },
}

impl ProviderError {
    pub fn request_failed(metric: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::RequestFailed {
            metric: metric.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(metric: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            metric: metric.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProviderError::AuthenticationFailed { .. })
    }
}

/// Delivery queue rejections. The record is dropped in both cases.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Queue full, rejected {key}")]
    Full { key: String },

    #[error("Queue disconnected, rejected {key}")]
    Disconnected { key: String },
}

impl QueueError {
    pub fn key(&self) -> &str {
        match self {
            QueueError::Full { key } | QueueError::Disconnected { key } => key,
        }
    }
}

/// Result type alias for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Result type alias for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Collection job options
    pub dynamodb: JobOptions,

    /// Delivery queue settings
    pub queue: QueueConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file, with `DYNAMOWATCH_` environment
    /// overrides layered on top
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dynamodb.validate()?;
        self.queue.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Renders the default configuration as TOML
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.dynamodb.table_name = Some("YOUR_TABLE_NAME".to_string());
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Job Options
// ----------------------------------------------------------------------------

/// Options recognized by the collection job
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "default_region")]
    pub region_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,

    /// Monitored table, required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,

    /// Tag applied to every record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default)]
    pub ignore_metrics: Vec<String>,

    #[serde(default)]
    pub ignore_operations: Vec<String>,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}
fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}
fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            region_name: default_region(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
            table_name: None,
            hostname: None,
            interval: default_interval(),
            ignore_metrics: Vec::new(),
            ignore_operations: Vec::new(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Debug for JobOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("region_name", &self.region_name)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &self.aws_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("table_name", &self.table_name)
            .field("hostname", &self.hostname)
            .field("interval", &self.interval)
            .field("ignore_metrics", &self.ignore_metrics)
            .field("ignore_operations", &self.ignore_operations)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .finish()
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_name().is_none() {
            return Err(ConfigError::missing_field("dynamodb.table_name"));
        }

        if self.region_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "dynamodb.region_name",
                "must not be empty",
            ));
        }

        if self.call_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "dynamodb.call_timeout_secs",
                "must be greater than 0",
            ));
        }

        if self.aws_access_key_id.is_some() != self.aws_secret_access_key.is_some() {
            return Err(ConfigError::invalid_value(
                "dynamodb.aws_access_key_id",
                "access key id and secret access key must be set together",
            ));
        }

        Ok(())
    }

    /// Trimmed table name, `None` when unset or blank
    pub fn table_name(&self) -> Option<&str> {
        self.table_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn credentials(&self) -> ProviderCredentials {
        ProviderCredentials {
            region: self.region_name.clone(),
            access_key_id: self.aws_access_key_id.clone(),
            secret_access_key: self.aws_secret_access_key.clone(),
        }
    }

    pub fn exclusion_filter(&self) -> ExclusionFilter {
        ExclusionFilter::new(&self.ignore_metrics, &self.ignore_operations)
    }

    #[inline]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn host(&self) -> Option<CompactString> {
        self.hostname.as_deref().map(CompactString::from)
    }
}

// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded capacity of the delivery queue
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid_value(
                "queue.capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log lines
    #[serde(default)]
    pub source_location: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: default_true(),
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "pretty" | "compact" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}'", other),
            )),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Installs the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> JobResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
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
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| JobError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| JobError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| JobError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 7: METRIC CATALOG
// ============================================================================
// The catalog is declared once per process and shared read-only. Entries are
// kept in declaration order so that fetch results and emitted records follow
// the same order on every run.
// ============================================================================

/// Ordered declaration of the statistics to collect for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCatalog {
    /// Provider namespace queried
    pub provider_namespace: CompactString,

    /// Prefix of every synthesized key
    pub key_prefix: CompactString,

    /// Dimension carrying the entity identifier
    pub entity_dimension: CompactString,

    /// Dimension carrying the operation name
    pub operation_dimension: CompactString,

    /// Constant key added after a successful fetch
    pub liveness_key: CompactString,

    pub entries: Vec<CatalogEntry>,
}

impl MetricCatalog {
    pub fn new(
        provider_namespace: impl Into<CompactString>,
        key_prefix: impl Into<CompactString>,
    ) -> Self {
        Self {
            provider_namespace: provider_namespace.into(),
            key_prefix: key_prefix.into(),
            entity_dimension: CompactString::from(TABLE_DIMENSION),
            operation_dimension: CompactString::from(OPERATION_DIMENSION),
            liveness_key: CompactString::from(LIVENESS_KEY),
            entries: Vec::new(),
        }
    }

    pub fn with_dimensions(
        mut self,
        entity: impl Into<CompactString>,
        operation: impl Into<CompactString>,
    ) -> Self {
        self.entity_dimension = entity.into();
        self.operation_dimension = operation.into();
        self
    }

    pub fn with_liveness_key(mut self, key: impl Into<CompactString>) -> Self {
        self.liveness_key = key.into();
        self
    }

    /// Appends an entity-level metric
    pub fn with_metric(mut self, name: impl Into<CompactString>, aggregation: Aggregation) -> Self {
        self.entries
            .push(CatalogEntry::Entity(MetricDefinition::new(name, aggregation)));
        self
    }

    /// Appends an operation with its nested metrics
    pub fn with_operation<N>(
        mut self,
        operation: impl Into<CompactString>,
        metrics: impl IntoIterator<Item = (N, Aggregation)>,
    ) -> Self
    where
        N: Into<CompactString>,
    {
        let metrics = metrics
            .into_iter()
            .map(|(name, agg)| MetricDefinition::new(name, agg))
            .collect();
        self.entries
            .push(CatalogEntry::Operation(OperationMetrics::new(operation, metrics)));
        self
    }

    pub fn entity_metrics(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.entries.iter().filter_map(|e| match e {
            CatalogEntry::Entity(def) => Some(def),
            CatalogEntry::Operation(_) => None,
        })
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationMetrics> {
        self.entries.iter().filter_map(|e| match e {
            CatalogEntry::Operation(op) => Some(op),
            CatalogEntry::Entity(_) => None,
        })
    }

    /// Every key a full run with no exclusions produces, liveness last
    pub fn sample_keys(&self) -> Vec<SampleKey> {
        let mut keys: Vec<SampleKey> = self
            .entity_metrics()
            .map(|def| SampleKey::entity(&self.key_prefix, def))
            .collect();

        for op in self.operations() {
            keys.extend(
                op.metrics
                    .iter()
                    .map(|def| SampleKey::operation(&self.key_prefix, &op.operation, def)),
            );
        }

        keys.push(SampleKey::liveness(&self.liveness_key));
        keys
    }

    /// Rejects empty or dotted names and colliding keys
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        check_name(&self.provider_namespace, "namespace must not be empty", false)?;
        check_name(&self.key_prefix, "key prefix must not be empty", false)?;
        check_name(&self.liveness_key, "liveness key must not be empty", false)?;

        for entry in &self.entries {
            match entry {
                CatalogEntry::Entity(def) => check_name(&def.name, "metric name", true)?,
                CatalogEntry::Operation(op) => {
                    check_name(&op.operation, "operation name", true)?;
                    for def in &op.metrics {
                        check_name(&def.name, "metric name", true)?;
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for key in self.sample_keys() {
            if !seen.insert(key.as_str().to_string()) {
                return Err(CatalogError::DuplicateKey {
                    key: key.into_string(),
                });
            }
        }

        Ok(())
    }
}

fn check_name(name: &str, what: &str, reject_dots: bool) -> Result<(), CatalogError> {
    if name.trim().is_empty() {
        return Err(CatalogError::InvalidName {
            name: name.to_string(),
            reason: format!("{} is empty", what),
        });
    }
    if reject_dots && name.contains('.') {
        return Err(CatalogError::InvalidName {
            name: name.to_string(),
            reason: format!("{} must not contain '.'", what),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Reference DynamoDB Catalog
// ----------------------------------------------------------------------------

static DYNAMODB_CATALOG: Lazy<Arc<MetricCatalog>> = Lazy::new(|| {
    use Aggregation::{Average, Maximum, Sum};

    let latency = [
        ("SuccessfulRequestLatency", Maximum),
        ("SuccessfulRequestLatency", Average),
    ];
    let latency_and_items = [
        ("SuccessfulRequestLatency", Maximum),
        ("SuccessfulRequestLatency", Average),
        ("ReturnedItemCount", Maximum),
        ("ReturnedItemCount", Average),
    ];

    let catalog = MetricCatalog::new(PROVIDER_NAMESPACE, KEY_PREFIX)
        .with_metric("UserErrors", Sum)
        .with_metric("SystemErrors", Sum)
        .with_metric("ThrottledRequests", Sum)
        .with_metric("ReadThrottleEvents", Sum)
        .with_metric("WriteThrottleEvents", Sum)
        .with_metric("ProvisionedReadCapacityUnits", Maximum)
        .with_metric("ProvisionedWriteCapacityUnits", Maximum)
        .with_metric("ConsumedReadCapacityUnits", Maximum)
        .with_metric("ConsumedReadCapacityUnits", Average)
        .with_metric("ConsumedWriteCapacityUnits", Maximum)
        .with_metric("ConsumedWriteCapacityUnits", Average)
        .with_operation("PutItem", latency)
        .with_operation("DeleteItem", latency)
        .with_operation("UpdateItem", latency)
        .with_operation("GetItem", latency)
        .with_operation("BatchGetItem", latency)
        .with_operation("BatchWriteItem", latency)
        .with_operation("Scan", latency_and_items)
        .with_operation("Query", latency_and_items);

    Arc::new(catalog)
});

/// The DynamoDB table and operation catalog
pub fn dynamodb() -> Arc<MetricCatalog> {
    Arc::clone(&DYNAMODB_CATALOG)
}

// ----------------------------------------------------------------------------
// Exclusion Filter
// ----------------------------------------------------------------------------

/// Single predicate deciding whether a catalog path is skipped.
///
/// A path is excluded when its operation is ignored, when its metric name is
/// ignored, or when its qualified `operation.metric` form is ignored. The same
/// rule applies to entity-level and per-operation paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionFilter {
    metrics: HashSet<String>,
    operations: HashSet<String>,
}

impl ExclusionFilter {
    pub fn new<M, O>(ignore_metrics: M, ignore_operations: O) -> Self
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        Self {
            metrics: ignore_metrics
                .into_iter()
                .map(|m| m.as_ref().to_string())
                .collect(),
            operations: ignore_operations
                .into_iter()
                .map(|o| o.as_ref().to_string())
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn excludes(&self, path: &MetricPath<'_>) -> bool {
        if self.metrics.contains(path.metric) {
            return true;
        }
        match path.operation {
            Some(op) => self.operations.contains(op) || self.metrics.contains(&path.qualified()),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.operations.is_empty()
    }
}

// ============================================================================
// SECTION 8: PROVIDER ABSTRACTION
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Query Types
// ----------------------------------------------------------------------------

/// Key/value tag narrowing a provider query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: CompactString,
    pub value: CompactString,
}

impl Dimension {
    pub fn new(name: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Entity queries carry one dimension, operation queries two
pub type Dimensions = SmallVec<[Dimension; 2]>;

/// One point-statistics request
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsQuery<'a> {
    pub namespace: &'a str,
    pub metric_name: &'a str,
    pub aggregation: Aggregation,
    pub period_secs: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub dimensions: &'a [Dimension],
}

/// One datapoint as returned by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: Option<DateTime<Utc>>,
    pub sum: Option<f64>,
    pub average: Option<f64>,
    pub maximum: Option<f64>,
    pub minimum: Option<f64>,
    pub sample_count: Option<f64>,
}

impl Datapoint {
    pub fn value(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Sum => self.sum,
            Aggregation::Average => self.average,
            Aggregation::Maximum => self.maximum,
            Aggregation::Minimum => self.minimum,
            Aggregation::SampleCount => self.sample_count,
        }
    }

    pub fn with_value(mut self, aggregation: Aggregation, value: f64) -> Self {
        let slot = match aggregation {
            Aggregation::Sum => &mut self.sum,
            Aggregation::Average => &mut self.average,
            Aggregation::Maximum => &mut self.maximum,
            Aggregation::Minimum => &mut self.minimum,
            Aggregation::SampleCount => &mut self.sample_count,
        };
        *slot = Some(value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

// ----------------------------------------------------------------------------
// 8.2 Provider & Connection Traits
// ----------------------------------------------------------------------------

/// An open session against a time-series metrics provider
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Returns zero or more datapoints for the query window.
    async fn get_metric_statistics(
        &self,
        query: &StatisticsQuery<'_>,
    ) -> ProviderResult<Vec<Datapoint>>;
}

#[async_trait]
impl<P: MetricsProvider + ?Sized> MetricsProvider for Arc<P> {
    async fn get_metric_statistics(
        &self,
        query: &StatisticsQuery<'_>,
    ) -> ProviderResult<Vec<Datapoint>> {
        (**self).get_metric_statistics(query).await
    }
}

/// Region and optional static keys used to open a provider session
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl ProviderCredentials {
    /// Both keys, when configured together
    pub fn static_keys(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

impl Debug for ProviderCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Produces authenticated provider sessions
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Provider: MetricsProvider;

    async fn connect(&self, credentials: &ProviderCredentials) -> ProviderResult<Self::Provider>;
}

// ============================================================================
// SECTION 9: CLOUDWATCH PROVIDER
// ============================================================================

#[cfg(feature = "cloudwatch")]
pub use cloudwatch_provider::{CloudWatchConnector, CloudWatchProvider};

#[cfg(feature = "cloudwatch")]
mod cloudwatch_provider {
    use super::*;

    use aws_sdk_cloudwatch::config::{Credentials, Region};
    use aws_sdk_cloudwatch::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
    use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
    use aws_sdk_cloudwatch::types::{Dimension as AwsDimension, Statistic};
    use aws_sdk_cloudwatch::Client;

    /// Error codes CloudWatch returns for bad or unauthorized credentials
    const AUTH_ERROR_CODES: &[&str] = &[
        "InvalidClientTokenId",
        "SignatureDoesNotMatch",
        "AccessDenied",
        "AccessDeniedException",
        "UnrecognizedClientException",
        "ExpiredToken",
    ];

    /// Opens CloudWatch sessions for a region
    #[derive(Debug, Clone, Default)]
    pub struct CloudWatchConnector;

    impl CloudWatchConnector {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ConnectionFactory for CloudWatchConnector {
        type Provider = CloudWatchProvider;

        async fn connect(&self, credentials: &ProviderCredentials) -> ProviderResult<Self::Provider> {
            if credentials.region.trim().is_empty() {
                return Err(ProviderError::ConnectionFailed {
                    region: credentials.region.clone(),
                    message: "region is empty".to_string(),
                });
            }

            let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(credentials.region.clone()))
                .load()
                .await;

            let mut builder = aws_sdk_cloudwatch::config::Builder::from(&sdk_config);
            if let Some((id, secret)) = credentials.static_keys() {
                builder = builder.credentials_provider(Credentials::new(
                    id,
                    secret,
                    None,
                    None,
                    "dynamowatch",
                ));
            }

            debug!(
                target: "dynamowatch::fetcher",
                region = %credentials.region,
                static_keys = credentials.static_keys().is_some(),
                "CloudWatch client configured"
            );

            Ok(CloudWatchProvider {
                client: Client::from_conf(builder.build()),
                region: credentials.region.clone(),
            })
        }
    }

    /// CloudWatch-backed metrics provider
    #[derive(Debug, Clone)]
    pub struct CloudWatchProvider {
        client: Client,
        region: String,
    }

    fn statistic(aggregation: Aggregation) -> Statistic {
        match aggregation {
            Aggregation::Sum => Statistic::Sum,
            Aggregation::Average => Statistic::Average,
            Aggregation::Maximum => Statistic::Maximum,
            Aggregation::Minimum => Statistic::Minimum,
            Aggregation::SampleCount => Statistic::SampleCount,
        }
    }

    fn to_aws_time(ts: DateTime<Utc>) -> AwsDateTime {
        AwsDateTime::from_secs(ts.timestamp())
    }

    fn from_aws_time(ts: &AwsDateTime) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(ts.secs(), ts.subsec_nanos()).single()
    }

    #[async_trait]
    impl MetricsProvider for CloudWatchProvider {
        async fn get_metric_statistics(
            &self,
            query: &StatisticsQuery<'_>,
        ) -> ProviderResult<Vec<Datapoint>> {
            let mut request = self
                .client
                .get_metric_statistics()
                .namespace(query.namespace)
                .metric_name(query.metric_name)
                .statistics(statistic(query.aggregation))
                .period(i32::try_from(query.period_secs).unwrap_or(i32::MAX))
                .start_time(to_aws_time(query.start_time))
                .end_time(to_aws_time(query.end_time));

            for dim in query.dimensions {
                let dimension = AwsDimension::builder()
                    .name(dim.name.as_str())
                    .value(dim.value.as_str())
                    .build()
                    .map_err(|e| ProviderError::request_failed(query.metric_name, e.to_string()))?;
                request = request.dimensions(dimension);
            }

            let output = request.send().await.map_err(|err| {
                let message = DisplayErrorContext(&err).to_string();
                match &err {
                    SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
                        ProviderError::ConnectionFailed {
                            region: self.region.clone(),
                            message,
                        }
                    }
                    _ if err.code().map_or(false, |c| AUTH_ERROR_CODES.contains(&c)) => {
                        ProviderError::AuthenticationFailed { message }
                    }
                    _ => ProviderError::request_failed(query.metric_name, message),
                }
            })?;

            Ok(output
                .datapoints()
                .iter()
                .map(|dp| Datapoint {
                    timestamp: dp.timestamp().and_then(from_aws_time),
                    sum: dp.sum(),
                    average: dp.average(),
                    maximum: dp.maximum(),
                    minimum: dp.minimum(),
                    sample_count: dp.sample_count(),
                })
                .collect())
        }
    }
}

// ============================================================================
// SECTION 10: METRICS FETCHER
// ============================================================================
// One collection run issues its queries strictly in catalog order, one at a
// time. Every query shares the same window. Any provider error, including a
// per-call timeout, aborts the run and nothing fetched so far is returned.
// ============================================================================

/// Produces the flat key/value mapping for one run
pub struct MetricsFetcher<'a, P: ?Sized> {
    provider: &'a P,
    catalog: &'a MetricCatalog,
    filter: &'a ExclusionFilter,
    entity_id: &'a str,
    call_timeout: Duration,
}

impl<P: ?Sized> Debug for MetricsFetcher<'_, P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsFetcher")
            .field("namespace", &self.catalog.provider_namespace)
            .field("entity_id", &self.entity_id)
            .field("filter", &self.filter)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<'a, P: MetricsProvider + ?Sized> MetricsFetcher<'a, P> {
    pub fn new(
        provider: &'a P,
        catalog: &'a MetricCatalog,
        filter: &'a ExclusionFilter,
        entity_id: &'a str,
    ) -> Self {
        Self {
            provider,
            catalog,
            filter,
            entity_id,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Queries every non-excluded catalog metric, then appends the liveness key
    #[instrument(
        target = "dynamowatch::fetcher",
        skip(self, window),
        fields(entity = %self.entity_id, period = window.period_secs)
    )]
    pub async fn fetch(&self, window: &CollectionWindow) -> JobResult<FetchedMetrics> {
        let catalog = self.catalog;
        let mut fetched = FetchedMetrics::with_capacity(catalog.entries.len() * 2 + 1);

        let entity_dims: Dimensions = smallvec::smallvec![Dimension::new(
            catalog.entity_dimension.clone(),
            self.entity_id
        )];

        for def in catalog.entity_metrics() {
            let path = MetricPath::entity(&def.name);
            if self.filter.excludes(&path) {
                trace!(target: "dynamowatch::fetcher", metric = %path, "Excluded");
                continue;
            }
            let key = SampleKey::entity(&catalog.key_prefix, def);
            let value = self.query(window, def, &entity_dims, &key).await?;
            fetched.insert(key, value)?;
        }

        for op in catalog.operations() {
            let op_dims: Dimensions = smallvec::smallvec![
                Dimension::new(catalog.entity_dimension.clone(), self.entity_id),
                Dimension::new(catalog.operation_dimension.clone(), op.operation.clone()),
            ];

            for def in &op.metrics {
                let path = MetricPath::operation(&op.operation, &def.name);
                if self.filter.excludes(&path) {
                    trace!(target: "dynamowatch::fetcher", metric = %path, "Excluded");
                    continue;
                }
                let key = SampleKey::operation(&catalog.key_prefix, &op.operation, def);
                let value = self.query(window, def, &op_dims, &key).await?;
                fetched.insert(key, value)?;
            }
        }

        fetched.insert(
            SampleKey::liveness(&catalog.liveness_key),
            SampleValue::Present(LIVENESS_VALUE),
        )?;

        debug!(
            target: "dynamowatch::fetcher",
            samples = fetched.len(),
            "Fetch complete"
        );

        Ok(fetched)
    }

    async fn query(
        &self,
        window: &CollectionWindow,
        def: &MetricDefinition,
        dimensions: &[Dimension],
        key: &SampleKey,
    ) -> ProviderResult<SampleValue> {
        let query = StatisticsQuery {
            namespace: &self.catalog.provider_namespace,
            metric_name: &def.name,
            aggregation: def.aggregation,
            period_secs: window.period_secs,
            start_time: window.start,
            end_time: window.end,
            dimensions,
        };

        let datapoints = timeout(self.call_timeout, self.provider.get_metric_statistics(&query))
            .await
            .map_err(|_| ProviderError::Timeout {
                metric: key.to_string(),
                timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        // first point only, ordering is whatever the provider returned
        match datapoints.first() {
            None => {
                trace!(target: "dynamowatch::fetcher", key = %key, "No datapoints");
                Ok(SampleValue::Absent)
            }
            Some(point) => point
                .value(def.aggregation)
                .map(SampleValue::Present)
                .ok_or_else(|| {
                    ProviderError::invalid_response(
                        key.as_str(),
                        format!("first datapoint carries no {} value", def.aggregation),
                    )
                }),
        }
    }
}

// ============================================================================
// SECTION 11: DELIVERY QUEUE & BACKPRESSURE
// ============================================================================

/// Downstream hand-off. `put` never blocks: a full queue fails at once.
pub trait DeliveryQueue: Send + Sync {
    fn put(&self, record: SampleRecord) -> Result<(), QueueError>;
}

impl<Q: DeliveryQueue + ?Sized> DeliveryQueue for Arc<Q> {
    fn put(&self, record: SampleRecord) -> Result<(), QueueError> {
        (**self).put(record)
    }
}

impl<Q: DeliveryQueue + ?Sized> DeliveryQueue for &Q {
    fn put(&self, record: SampleRecord) -> Result<(), QueueError> {
        (**self).put(record)
    }
}

// ----------------------------------------------------------------------------
// 11.1 Queue Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct QueueStats {
    /// Records accepted
    pub sent: AtomicU64,
    /// Records taken off the queue
    pub received: AtomicU64,
    /// Records rejected because the queue was full
    pub rejected_full: AtomicU64,
    /// Records rejected because every receiver was gone
    pub rejected_disconnected: AtomicU64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.received.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_full(&self) {
        self.rejected_full.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        self.rejected_disconnected.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            sent: self.sent.load(AtomicOrdering::Relaxed),
            received: self.received.load(AtomicOrdering::Relaxed),
            rejected_full: self.rejected_full.load(AtomicOrdering::Relaxed),
            rejected_disconnected: self.rejected_disconnected.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub rejected_full: u64,
    pub rejected_disconnected: u64,
}

// ----------------------------------------------------------------------------
// 11.2 Bounded Sample Queue
// ----------------------------------------------------------------------------

/// Creates a bounded queue of sample records
pub fn sample_queue(capacity: usize) -> (SampleSender, SampleReceiver) {
    let capacity = capacity.max(1);
    let (sender, receiver) = flume::bounded(capacity);
    let stats = Arc::new(QueueStats::new());

    (
        SampleSender {
            sender,
            stats: Arc::clone(&stats),
            capacity,
        },
        SampleReceiver { receiver, stats },
    )
}

/// Producer half. Clone it for additional producers.
#[derive(Debug, Clone)]
pub struct SampleSender {
    sender: flume::Sender<SampleRecord>,
    stats: Arc<QueueStats>,
    capacity: usize,
}

impl SampleSender {
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

impl DeliveryQueue for SampleSender {
    fn put(&self, record: SampleRecord) -> Result<(), QueueError> {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.stats.record_send();
                Ok(())
            }
            Err(flume::TrySendError::Full(r)) => {
                self.stats.record_full();
                Err(QueueError::Full {
                    key: r.key().to_string(),
                })
            }
            Err(flume::TrySendError::Disconnected(r)) => {
                self.stats.record_disconnected();
                Err(QueueError::Disconnected {
                    key: r.key().to_string(),
                })
            }
        }
    }
}

/// Consumer half
#[derive(Debug, Clone)]
pub struct SampleReceiver {
    receiver: flume::Receiver<SampleRecord>,
    stats: Arc<QueueStats>,
}

impl SampleReceiver {
    pub fn try_recv(&self) -> Option<SampleRecord> {
        match self.receiver.try_recv() {
            Ok(record) => {
                self.stats.record_receive();
                Some(record)
            }
            Err(_) => None,
        }
    }

    /// Waits for the next record, `None` once every sender is dropped
    pub async fn recv_async(&self) -> Option<SampleRecord> {
        match self.receiver.recv_async().await {
            Ok(record) => {
                self.stats.record_receive();
                Some(record)
            }
            Err(_) => None,
        }
    }

    /// Takes everything currently queued
    pub fn drain(&self) -> Vec<SampleRecord> {
        let records: Vec<SampleRecord> = self.receiver.drain().collect();
        for _ in &records {
            self.stats.record_receive();
        }
        records
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}

// ----------------------------------------------------------------------------
// 11.3 Queue Sink
// ----------------------------------------------------------------------------

/// Hands records to a delivery queue and traces each accepted one
#[derive(Debug)]
pub struct QueueSink<'a, Q: ?Sized> {
    queue: &'a Q,
}

impl<'a, Q: DeliveryQueue + ?Sized> QueueSink<'a, Q> {
    pub fn new(queue: &'a Q) -> Self {
        Self { queue }
    }

    pub fn enqueue(&self, record: SampleRecord) -> Result<(), QueueError> {
        let key = record.key().to_string();
        let value = record.value();

        self.queue.put(record)?;

        debug!(
            target: "dynamowatch::queue",
            "Inserted {}:{} to sending queue.",
            key,
            value
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 12: ITEM BUILDER
// ============================================================================

/// Turns fetched samples into host-tagged records.
///
/// Absent provisioned capacity samples are dropped. Any other absent sample
/// becomes 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemBuilder {
    host: Option<CompactString>,
}

impl ItemBuilder {
    pub fn new(host: Option<CompactString>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// `None` when the sample is dropped by the absent-value policy
    pub fn build(&self, sample: &RawSample) -> Option<SampleRecord> {
        let value = match sample.value {
            SampleValue::Present(v) => v,
            SampleValue::Absent if sample.key.is_provisioned_capacity() => return None,
            SampleValue::Absent => 0.0,
        };
        Some(SampleRecord::new(
            sample.key.as_str(),
            value,
            self.host.clone(),
        ))
    }

    pub fn build_items(&self, fetched: &FetchedMetrics) -> Vec<SampleRecord> {
        fetched.iter().filter_map(|s| self.build(s)).collect()
    }

    /// Builds and enqueues every record. Stops at the first rejection.
    pub fn enqueue_all<Q>(
        &self,
        fetched: &FetchedMetrics,
        sink: &QueueSink<'_, Q>,
    ) -> Result<RunSummary, QueueError>
    where
        Q: DeliveryQueue + ?Sized,
    {
        info!(
            target: "dynamowatch::job",
            "The number of metrics is {}",
            fetched.len()
        );

        let mut summary = RunSummary {
            fetched: fetched.len(),
            ..RunSummary::default()
        };

        for sample in fetched {
            match self.build(sample) {
                Some(record) => {
                    sink.enqueue(record)?;
                    summary.enqueued += 1;
                }
                None => {
                    trace!(
                        target: "dynamowatch::job",
                        key = %sample.key,
                        "Skipped absent provisioned capacity sample"
                    );
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }
}

// ============================================================================
// SECTION 13: COLLECTION JOB
// ============================================================================

/// One configured DynamoDB collection: window, connect, fetch, build, enqueue
pub struct CollectionJob<F, Q> {
    options: JobOptions,
    table_name: String,
    filter: ExclusionFilter,
    catalog: Arc<MetricCatalog>,
    items: ItemBuilder,
    factory: F,
    queue: Q,
}

impl<F, Q> Debug for CollectionJob<F, Q> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionJob")
            .field("table_name", &self.table_name)
            .field("namespace", &self.catalog.provider_namespace)
            .field("options", &self.options)
            .finish()
    }
}

impl<F: ConnectionFactory, Q: DeliveryQueue> CollectionJob<F, Q> {
    /// Fails before any provider call when the options are invalid
    pub fn new(options: JobOptions, factory: F, queue: Q) -> JobResult<Self> {
        options.validate()?;

        let table_name = options
            .table_name()
            .ok_or_else(|| ConfigError::missing_field("dynamodb.table_name"))?
            .to_string();

        let catalog = dynamodb();
        catalog.validate()?;

        Ok(Self {
            filter: options.exclusion_filter(),
            items: ItemBuilder::new(options.host()),
            table_name,
            catalog,
            options,
            factory,
            queue,
        })
    }

    /// Replaces the catalog after validating it
    pub fn with_catalog(mut self, catalog: Arc<MetricCatalog>) -> JobResult<Self> {
        catalog.validate()?;
        self.catalog = catalog;
        Ok(self)
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Window for a run starting now
    pub fn window(&self) -> CollectionWindow {
        CollectionWindow::now(Some(self.options.interval))
    }

    /// Raw fetch result without touching the queue
    pub async fn fetch_metrics(&self) -> JobResult<FetchedMetrics> {
        let window = self.window();
        self.fetch_window(&window).await
    }

    async fn fetch_window(&self, window: &CollectionWindow) -> JobResult<FetchedMetrics> {
        let provider = self.factory.connect(&self.options.credentials()).await?;

        MetricsFetcher::new(&provider, &self.catalog, &self.filter, &self.table_name)
            .with_call_timeout(self.options.call_timeout())
            .fetch(window)
            .await
    }

    /// Runs one full collection cycle
    pub async fn run_once(&self) -> JobResult<RunSummary> {
        let started = Instant::now();
        let window = self.window();

        debug!(
            target: "dynamowatch::job",
            table = %self.table_name,
            period = window.period_secs,
            start = %window.start,
            end = %window.end,
            "Starting collection run"
        );

        let fetched = self.fetch_window(&window).await?;

        let sink = QueueSink::new(&self.queue);
        let summary = self.items.enqueue_all(&fetched, &sink)?;

        info!(
            target: "dynamowatch::job",
            table = %self.table_name,
            fetched = summary.fetched,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "Collection run complete"
        );

        Ok(summary)
    }
}

// ============================================================================
// SECTION 14: SCHEDULER ENGINE
// ============================================================================

/// Runs a collection job every `interval` seconds until shut down
pub struct Engine<F, Q> {
    job: CollectionJob<F, Q>,
    interval: Duration,
    shutdown: Arc<Notify>,
    running: AtomicBool,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    records_enqueued: AtomicU64,
    last_summary: RwLock<Option<RunSummary>>,
    last_error: RwLock<Option<String>>,
}

impl<F, Q> Debug for Engine<F, Q> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("job", &self.job)
            .field("interval", &self.interval)
            .field("running", &self.running.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

/// Point-in-time view of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub records_enqueued: u64,
    pub last_summary: Option<RunSummary>,
    pub last_error: Option<String>,
}

impl<F: ConnectionFactory, Q: DeliveryQueue> Engine<F, Q> {
    pub fn new(job: CollectionJob<F, Q>) -> Self {
        let interval = Duration::from_secs(job.options().interval.clamp(1, MAX_SCHEDULE_TICK_SECS));
        Self {
            job,
            interval,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            records_enqueued: AtomicU64::new(0),
            last_summary: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn job(&self) -> &CollectionJob<F, Q> {
        &self.job
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    /// Handle that stops the loop when notified
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        info!(target: "dynamowatch::engine", "Shutdown requested");
        self.shutdown.notify_one();
    }

    /// Runs until shut down. The first run starts immediately.
    pub async fn run(&self) -> JobResult<()> {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return Err(JobError::Internal("engine is already running".to_string()));
        }

        info!(
            target: "dynamowatch::engine",
            table = %self.job.table_name(),
            interval_secs = self.interval.as_secs(),
            "Engine started"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        self.running.store(false, AtomicOrdering::SeqCst);
        info!(target: "dynamowatch::engine", "Engine stopped");
        Ok(())
    }

    /// One scheduled run. Failures are logged and counted, never retried early.
    pub async fn run_cycle(&self) -> Option<RunSummary> {
        match self.job.run_once().await {
            Ok(summary) => {
                self.runs_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
                self.records_enqueued
                    .fetch_add(summary.enqueued as u64, AtomicOrdering::Relaxed);
                *self.last_summary.write() = Some(summary);
                Some(summary)
            }
            Err(e) => {
                self.runs_failed.fetch_add(1, AtomicOrdering::Relaxed);
                error!(
                    target: "dynamowatch::engine",
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Collection run failed"
                );
                *self.last_error.write() = Some(e.to_string());
                None
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            runs_succeeded: self.runs_succeeded.load(AtomicOrdering::Relaxed),
            runs_failed: self.runs_failed.load(AtomicOrdering::Relaxed),
            records_enqueued: self.records_enqueued.load(AtomicOrdering::Relaxed),
            last_summary: *self.last_summary.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(target: "dynamowatch::engine", "Received SIGINT");
                    }
                    _ = term.recv() => {
                        info!(target: "dynamowatch::engine", "Received SIGTERM");
                    }
                }
            }
            Err(e) => {
                warn!(target: "dynamowatch::engine", error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ============================================================================
// SECTION 15: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Dynamowatch CLI
#[derive(Parser, Debug)]
#[command(
    name = "dynamowatch",
    author = "AIOps Team",
    version,
    about = "Periodic CloudWatch collector for DynamoDB metrics",
    long_about = "Dynamowatch polls CloudWatch for DynamoDB table and per-operation \
                  statistics and emits them as keyed samples, one JSON line each."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dynamowatch.toml", env = "DYNAMOWATCH_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "DYNAMOWATCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Collect every interval until interrupted
    Run,

    /// Run a single collection cycle and print the records
    Once,

    /// Fetch and print the raw metric mapping as JSON
    Fetch,

    /// Validate configuration file
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
// 15.2 Command Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> JobResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = AppConfig::load(config_path)?;
    println!("Configuration is valid");

    if verbose {
        println!();
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    let filter = config.dynamodb.exclusion_filter();
    let catalog = dynamodb();
    let active = catalog
        .entity_metrics()
        .filter(|def| !filter.excludes(&MetricPath::entity(&def.name)))
        .count()
        + catalog
            .operations()
            .flat_map(|op| {
                op.metrics
                    .iter()
                    .map(move |def| MetricPath::operation(&op.operation, &def.name))
            })
            .filter(|path| !filter.excludes(path))
            .count();

    println!();
    println!("Summary:");
    println!("  - Table: {}", config.dynamodb.table_name().unwrap_or("-"));
    println!("  - Region: {}", config.dynamodb.region_name);
    println!("  - Interval: {}s", config.dynamodb.interval);
    println!("  - Queries per run: {}", active);
    println!("  - Queue capacity: {}", config.queue.capacity);

    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> JobResult<()> {
    let config_str = AppConfig::generate_default_config();

    match output {
        Some(path) => {
            std::fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", NAME, VERSION);
    println!();
    println!("Build Information:");
    println!("  - Target: {}", std::env::consts::ARCH);
    println!("  - OS: {}", std::env::consts::OS);
    println!(
        "  - CloudWatch support: {}",
        if cfg!(feature = "cloudwatch") { "enabled" } else { "disabled" }
    );
}

fn print_json_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize record"),
    }
}

#[cfg(feature = "cloudwatch")]
async fn run_collection(command: Option<Commands>, config: AppConfig) -> AnyhowResult<()> {
    let (sender, receiver) = sample_queue(config.queue.capacity);
    let job = CollectionJob::new(config.dynamodb.clone(), CloudWatchConnector::new(), sender)
        .context("Failed to create collection job")?;

    match command {
        Some(Commands::Fetch) => {
            let fetched = job.fetch_metrics().await?;
            println!("{}", serde_json::to_string_pretty(&fetched.to_json())?);
        }
        Some(Commands::Once) => {
            let summary = job.run_once().await?;
            for record in receiver.drain() {
                print_json_line(&record);
            }
            info!(
                enqueued = summary.enqueued,
                skipped = summary.skipped,
                "Single run complete"
            );
        }
        _ => {
            let forwarder = tokio::spawn(async move {
                while let Some(record) = receiver.recv_async().await {
                    print_json_line(&record);
                }
            });

            let engine = Engine::new(job);
            let shutdown = engine.shutdown_handle();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                shutdown.notify_one();
            });

            engine.run().await?;

            let stats = engine.stats();
            info!(
                runs_succeeded = stats.runs_succeeded,
                runs_failed = stats.runs_failed,
                records_enqueued = stats.records_enqueued,
                "Final engine stats"
            );

            // dropping the engine drops the last sender and ends the forwarder
            drop(engine);
            let _ = forwarder.await;
        }
    }

    Ok(())
}

#[cfg(not(feature = "cloudwatch"))]
async fn run_collection(command: Option<Commands>, config: AppConfig) -> AnyhowResult<()> {
    anyhow::bail!("built without CloudWatch support, rebuild with `--features cloudwatch`")
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
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
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        AppConfig::from_env().with_context(|| {
            format!(
                "Config file not found at {} and environment is incomplete",
                cli.config.display()
            )
        })?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config)?;

    info!("{} v{}", NAME, VERSION);

    run_collection(cli.command, config).await
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================




#[cfg(test)]
mod job_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn job_with(
        provider: ScriptedProvider,
        catalog: Arc<MetricCatalog>,
        capacity: usize,
    ) -> (CollectionJob<ScriptedFactory, SampleSender>, SampleReceiver) {
        let (sender, receiver) = sample_queue(capacity);
        let job = CollectionJob::new(options("orders"), ScriptedFactory::new(provider), sender)
            .unwrap()
            .with_catalog(catalog)
            .unwrap();
        (job, receiver)
    }

    fn keys_and_values(records: &[SampleRecord]) -> Vec<(String, f64)> {
        records
            .iter()
            .map(|r| (r.key().to_string(), r.value()))
            .collect()
    }

    #[tokio::test]
    async fn test_single_metric_with_value() {
        let provider = ScriptedProvider::new().respond(
            None,
            "Foo",
            Aggregation::Sum,
            vec![point(Aggregation::Sum, 42.0)],
        );
        let (job, receiver) = job_with(provider, single_metric_catalog("Foo", Aggregation::Sum), 16);

        let summary = job.run_once().await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                fetched: 2,
                enqueued: 2,
                skipped: 0
            }
        );
        let records = receiver.drain();
        assert_eq!(
            keys_and_values(&records),
            vec![
                ("cloudwatch.dynamodb.Foo.Sum".to_string(), 42.0),
                (LIVENESS_KEY.to_string(), 1.0),
            ]
        );
        assert!(records.iter().all(|r| r.host() == Some("db-host")));
    }

    #[tokio::test]
    async fn test_single_metric_without_datapoints() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("Foo", Aggregation::Sum),
            16,
        );

        job.run_once().await.unwrap();

        assert_eq!(
            keys_and_values(&receiver.drain()),
            vec![
                ("cloudwatch.dynamodb.Foo.Sum".to_string(), 0.0),
                (LIVENESS_KEY.to_string(), 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_provisioned_metric_without_datapoints_is_skipped() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("ProvisionedReadCapacityUnits", Aggregation::Maximum),
            16,
        );

        let summary = job.run_once().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(
            keys_and_values(&receiver.drain()),
            vec![(LIVENESS_KEY.to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn test_full_queue_surfaces_error() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("Foo", Aggregation::Sum),
            1,
        );

        let err = job.run_once().await.unwrap_err();

        match err {
            JobError::Queue(QueueError::Full { key }) => assert_eq!(key, LIVENESS_KEY),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(receiver.len(), 1);
        assert_eq!(job.queue().stats().rejected_full, 1);
    }

    #[tokio::test]
    async fn test_reference_catalog_run() {
        let provider = ScriptedProvider::new().respond(
            Some("GetItem"),
            "SuccessfulRequestLatency",
            Aggregation::Average,
            vec![point(Aggregation::Average, 3.25)],
        );
        let (job, receiver) = job_with(provider, dynamodb(), 64);

        let summary = job.run_once().await.unwrap();

        // both provisioned capacity metrics are absent and dropped
        assert_eq!(
            summary,
            RunSummary {
                fetched: 32,
                enqueued: 30,
                skipped: 2
            }
        );

        let records = receiver.drain();
        assert!(records
            .iter()
            .all(|r| !r.key().contains("ProvisionedReadCapacityUnits")));
        let latency = records
            .iter()
            .find(|r| r.key() == "cloudwatch.dynamodb.GetItem.SuccessfulRequestLatency.Average")
            .unwrap();
        assert_eq!(latency.value(), 3.25);
    }

    #[tokio::test]
    async fn test_provider_failure_emits_nothing() {
        let provider = ScriptedProvider::new().fail_on(
            "SuccessfulRequestLatency",
            ProviderError::request_failed("SuccessfulRequestLatency", "throttled"),
        );
        let (job, receiver) = job_with(provider, dynamodb(), 64);

        let err = job.run_once().await.unwrap_err();

        assert_eq!(err.category(), "provider");
        assert!(receiver.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (sender, receiver) = sample_queue(8);
        let factory = ScriptedFactory::failing(ProviderError::AuthenticationFailed {
            message: "bad keys".into(),
        });
        let job = CollectionJob::new(options("orders"), factory, sender).unwrap();

        let err = job.run_once().await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Provider(ProviderError::AuthenticationFailed { .. })
        ));
        assert!(receiver.is_empty());
    }

    #[tokio::test]
    async fn test_job_passes_credentials() {
        let (sender, _receiver) = sample_queue(64);
        let opts = JobOptions {
            region_name: "ap-southeast-2".into(),
            aws_access_key_id: Some("AKIA".into()),
            aws_secret_access_key: Some("secret".into()),
            ..options("orders")
        };
        let job = CollectionJob::new(opts, ScriptedFactory::new(ScriptedProvider::new()), sender)
            .unwrap()
            .with_catalog(single_metric_catalog("Foo", Aggregation::Sum))
            .unwrap();

        job.fetch_metrics().await.unwrap();

        let factory = &job.factory;
        assert_eq!(factory.connects.load(AtomicOrdering::SeqCst), 1);
        let creds = factory.last_credentials.lock().clone().unwrap();
        assert_eq!(creds.region, "ap-southeast-2");
        assert_eq!(creds.static_keys(), Some(("AKIA", "secret")));
    }

    #[tokio::test]
    async fn test_fetch_metrics_does_not_enqueue() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("Foo", Aggregation::Sum),
            16,
        );

        let fetched = job.fetch_metrics().await.unwrap();

        assert_eq!(fetched.get("cloudwatch.dynamodb.Foo.Sum"), Some(SampleValue::Absent));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_job_requires_table_name() {
        let (sender, _receiver) = sample_queue(8);
        let err = CollectionJob::new(
            JobOptions::default(),
            ScriptedFactory::new(ScriptedProvider::new()),
            sender,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            JobError::Config(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_job_rejects_invalid_catalog() {
        let (sender, _receiver) = sample_queue(8);
        let job = CollectionJob::new(
            options("orders"),
            ScriptedFactory::new(ScriptedProvider::new()),
            sender,
        )
        .unwrap();

        let err = job
            .with_catalog(Arc::new(MetricCatalog::new("NS", "p")))
            .unwrap_err();
        assert!(matches!(err, JobError::Catalog(CatalogError::Empty)));
    }

    // ------------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_engine_counts_runs() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("Foo", Aggregation::Sum),
            2,
        );
        let engine = Engine::new(job);

        assert!(engine.run_cycle().await.is_some());
        // queue now holds two records, the next run overflows
        assert!(engine.run_cycle().await.is_none());

        let stats = engine.stats();
        assert_eq!(stats.runs_succeeded, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.records_enqueued, 2);
        assert_eq!(stats.last_summary.map(|s| s.enqueued), Some(2));
        assert!(stats.last_error.unwrap().contains("Queue full"));
        drop(receiver);
    }

    #[test]
    fn test_engine_tick_follows_interval() {
        let (sender, _receiver) = sample_queue(8);
        let opts = JobOptions {
            interval: 600,
            ..options("orders")
        };
        let job = CollectionJob::new(opts, ScriptedFactory::new(ScriptedProvider::new()), sender)
            .unwrap();
        assert_eq!(Engine::new(job).interval, Duration::from_secs(600));

        let (sender, _receiver) = sample_queue(8);
        let opts = JobOptions {
            interval: u64::MAX,
            ..options("orders")
        };
        let job = CollectionJob::new(opts, ScriptedFactory::new(ScriptedProvider::new()), sender)
            .unwrap();
        assert_eq!(
            Engine::new(job).interval,
            Duration::from_secs(MAX_SCHEDULE_TICK_SECS)
        );
    }

    #[tokio::test]
    async fn test_engine_runs_until_shutdown() {
        let (job, receiver) = job_with(
            ScriptedProvider::new(),
            single_metric_catalog("Foo", Aggregation::Sum),
            16,
        );
        let engine = Engine::new(job).with_interval(Duration::from_secs(3600));

        let (result, _) = tokio::join!(engine.run(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.shutdown();
        });

        result.unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.stats().runs_succeeded, 1);
        assert_eq!(receiver.len(), 2);
    }
}

//! Environment-driven harness configuration.
//!
//! Every role reads `SWARMLOG_E2E_*` variables at startup, before any
//! storage or network I/O. The creator tolerates missing size settings by
//! falling back to defaults; the seeder and downloader require them as
//! out-of-band sanity checks and refuse to start otherwise.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;

use swarmlog_api::{MetricsConfig, PublicKey, SecretKey};

use crate::error::ConfigError;

/// Log public key (seeder/downloader).
pub const ENV_KEY: &str = "SWARMLOG_E2E_KEY";
/// Target / expected entry count.
pub const ENV_LENGTH: &str = "SWARMLOG_E2E_LENGTH";
/// Block size in bytes.
pub const ENV_BLOCK_SIZE: &str = "SWARMLOG_E2E_BLOCK_SIZE_BYTES";
/// Storage location for roles with durable storage.
pub const ENV_STORE_LOC: &str = "SWARMLOG_E2E_STORE_LOC";
/// Tracing filter level.
pub const ENV_LOG_LEVEL: &str = "SWARMLOG_E2E_LOG_LEVEL";
/// Optional absolute process deadline, in seconds.
pub const ENV_TIMEOUT_SEC: &str = "SWARMLOG_E2E_TIMEOUT_SEC";
/// Optional metrics secret; enables monitoring when set.
pub const ENV_METRICS_SECRET: &str = "SWARMLOG_E2E_METRICS_SECRET";
/// Scraper public key, required whenever the secret is set.
pub const ENV_METRICS_SCRAPER_KEY: &str = "SWARMLOG_E2E_METRICS_SCRAPER_KEY";
/// Optional metrics alias override.
pub const ENV_METRICS_ALIAS: &str = "SWARMLOG_E2E_METRICS_ALIAS";
/// Debug console exposure flag.
pub const ENV_CONSOLE: &str = "SWARMLOG_E2E_CONSOLE";

/// Service name reported to the metrics scraper.
pub const METRICS_SERVICE_NAME: &str = "swarmlog-e2e-tests";

const DEFAULT_CREATE_LENGTH: u64 = 15_250;
const DEFAULT_BLOCK_SIZE: u64 = 65_536;
const DEFAULT_CREATE_STORE_LOC: &str = "e2e-tests-creator-store";
const DEFAULT_SEED_STORE_LOC: &str = "e2e-tests-seeder-store";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Size the log is expected to reach, supplied out of band.
///
/// The harness never trusts the network to self-report a size; it derives
/// `byte_length` itself and compares against what the log actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedShape {
    /// Expected entry count.
    pub length: u64,
    /// Size of every block in bytes.
    pub block_size_bytes: u64,
    /// `length * block_size_bytes`, checked at construction.
    pub byte_length: u64,
}

impl ExpectedShape {
    /// Build a shape, validating the byte-length derivation.
    pub fn new(length: u64, block_size_bytes: u64) -> Result<Self, ConfigError> {
        if block_size_bytes == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let byte_length = length
            .checked_mul(block_size_bytes)
            .ok_or(ConfigError::ByteLengthOverflow { length, block_size_bytes })?;
        Ok(Self { length, block_size_bytes, byte_length })
    }
}

/// Creator role configuration.
#[derive(Debug, Clone)]
pub struct CreatorConfig {
    /// Target shape to grow the log to.
    pub shape: ExpectedShape,
    /// Storage location.
    pub store_loc: PathBuf,
    /// Tracing filter level.
    pub log_level: String,
    /// Optional absolute process deadline.
    pub timeout: Option<Duration>,
    /// Debug console exposure flag.
    pub console: bool,
    /// Monitoring credentials, when configured.
    pub metrics: Option<MetricsConfig>,
}

impl CreatorConfig {
    /// Load from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let length = opt_u64(ENV_LENGTH)?.unwrap_or(DEFAULT_CREATE_LENGTH);
        let block_size = opt_u64(ENV_BLOCK_SIZE)?.unwrap_or(DEFAULT_BLOCK_SIZE);
        let shape = ExpectedShape::new(length, block_size)?;
        Ok(Self {
            store_loc: var(ENV_STORE_LOC)
                .unwrap_or_else(|| DEFAULT_CREATE_STORE_LOC.to_string())
                .into(),
            log_level: log_level(),
            timeout: timeout()?,
            console: console_flag(),
            metrics: metrics_from_env("create", &shape)?,
            shape,
        })
    }

    /// Local name the creator's log is derived from.
    pub fn log_name(&self) -> String {
        format!("e2e-log-{}-{}", self.shape.length, self.shape.block_size_bytes)
    }
}

/// Seeder role configuration.
#[derive(Debug, Clone)]
pub struct SeederConfig {
    /// Key of the log to mirror.
    pub key: PublicKey,
    /// Expected shape, required as a sanity check.
    pub shape: ExpectedShape,
    /// Storage location.
    pub store_loc: PathBuf,
    /// Tracing filter level.
    pub log_level: String,
    /// Optional absolute process deadline.
    pub timeout: Option<Duration>,
    /// Monitoring credentials, when configured.
    pub metrics: Option<MetricsConfig>,
}

impl SeederConfig {
    /// Load from the environment. Missing key or sanity values are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let key = required_key()?;
        let shape = required_shape()?;
        Ok(Self {
            key,
            store_loc: var(ENV_STORE_LOC)
                .unwrap_or_else(|| DEFAULT_SEED_STORE_LOC.to_string())
                .into(),
            log_level: log_level(),
            timeout: timeout()?,
            metrics: metrics_from_env("seed", &shape)?,
            shape,
        })
    }
}

/// Downloader role configuration. Storage is always ephemeral, so there is
/// no location setting.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Key of the log to fetch.
    pub key: PublicKey,
    /// Expected shape, required as a sanity check.
    pub shape: ExpectedShape,
    /// Tracing filter level.
    pub log_level: String,
    /// Optional absolute process deadline.
    pub timeout: Option<Duration>,
    /// Debug console exposure flag.
    pub console: bool,
    /// Monitoring credentials, when configured.
    pub metrics: Option<MetricsConfig>,
}

impl DownloaderConfig {
    /// Load from the environment. Missing key or sanity values are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let key = required_key()?;
        let shape = required_shape()?;
        Ok(Self {
            key,
            log_level: log_level(),
            timeout: timeout()?,
            console: console_flag(),
            metrics: metrics_from_env("download", &shape)?,
            shape,
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn opt_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    var(name)
        .map(|value| {
            value
                .parse()
                .map_err(|source| ConfigError::InvalidNumber { var: name, source })
        })
        .transpose()
}

fn required_u64(name: &'static str) -> Result<u64, ConfigError> {
    opt_u64(name)?.ok_or(ConfigError::MissingSanityValue(name))
}

fn required_key() -> Result<PublicKey, ConfigError> {
    let raw = var(ENV_KEY).ok_or(ConfigError::MissingKey)?;
    PublicKey::parse(&raw).map_err(|source| ConfigError::InvalidKey { var: ENV_KEY, source })
}

fn required_shape() -> Result<ExpectedShape, ConfigError> {
    let length = required_u64(ENV_LENGTH)?;
    let block_size = required_u64(ENV_BLOCK_SIZE)?;
    ExpectedShape::new(length, block_size)
}

fn log_level() -> String {
    var(ENV_LOG_LEVEL).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn timeout() -> Result<Option<Duration>, ConfigError> {
    Ok(opt_u64(ENV_TIMEOUT_SEC)?.map(Duration::from_secs))
}

fn console_flag() -> bool {
    var(ENV_CONSOLE).map(|value| value == "true").unwrap_or(false)
}

fn metrics_from_env(role: &str, shape: &ExpectedShape) -> Result<Option<MetricsConfig>, ConfigError> {
    let Some(secret) = var(ENV_METRICS_SECRET) else {
        return Ok(None);
    };
    let secret = SecretKey::parse(&secret)
        .map_err(|source| ConfigError::InvalidKey { var: ENV_METRICS_SECRET, source })?;
    let scraper = var(ENV_METRICS_SCRAPER_KEY).ok_or(ConfigError::MissingScraperKey)?;
    let scraper = PublicKey::parse(&scraper)
        .map_err(|source| ConfigError::InvalidKey { var: ENV_METRICS_SCRAPER_KEY, source })?;
    let alias = var(ENV_METRICS_ALIAS).unwrap_or_else(|| default_alias(role, shape.byte_length));
    Ok(Some(MetricsConfig {
        service_name: METRICS_SERVICE_NAME.to_string(),
        alias,
        secret,
        scraper,
    }))
}

fn default_alias(role: &str, byte_length: u64) -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string());
    format!("swarmlog-e2e-{role}-{}-{host}", ByteSize(byte_length)).replace(' ', "-")
}

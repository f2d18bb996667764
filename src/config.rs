//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the streaming pipeline.
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with DETSTREAM_, nested keys split on `__`)
//!
//! Every component receives its section explicitly at construction; there is no
//! process-wide configuration state.
//!
//! # Example
//! ```no_run
//! use detstream::config::StreamConfig;
//!
//! let config = StreamConfig::load_from("config/detstream.toml")?;
//! println!("Endpoint: {}", config.transport.endpoint);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};
use crate::frame::PixelType;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Subscriber socket settings
    #[serde(default)]
    pub transport: TransportConfig,
    /// Frame geometry and pixel type
    #[serde(default)]
    pub frame: FrameConfig,
    /// HDF5 store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Stream persister settings
    #[serde(default)]
    pub persister: PersisterConfig,
    /// Frame accumulator settings
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Wire protocol spoken by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Two-part messages: 8-byte frame id + raw pixels.
    Legacy,
    /// CBOR documents with typed-array tags.
    #[default]
    Cbor,
}

/// Subscriber socket configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Publisher endpoint, e.g. `tcp://detector:5501`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Wire protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Bound on a single receive
    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// Receive high-water mark (messages)
    #[serde(default = "default_receive_hwm")]
    pub receive_hwm: i32,
    /// Consecutive transport errors before the socket is recreated
    #[serde(default = "default_reconnect_after_errors")]
    pub reconnect_after_errors: u32,
}

/// Frame geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Pixel type of frames on the wire (legacy) and in the store
    #[serde(default = "default_dtype")]
    pub dtype: PixelType,
    /// Rows per frame
    #[serde(default = "default_rows")]
    pub rows: usize,
    /// Columns per frame
    #[serde(default = "default_cols")]
    pub cols: usize,
}

/// HDF5 store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Output file
    #[serde(default = "default_store_output")]
    pub output: PathBuf,
    /// Pixel pitch along x in metres
    #[serde(default = "default_pixel_size")]
    pub x_pixel_size: f64,
    /// Pixel pitch along y in metres
    #[serde(default = "default_pixel_size")]
    pub y_pixel_size: f64,
}

/// Stream persister configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PersisterConfig {
    /// Give up after this long without a frame (None = run until stopped)
    #[serde(default, with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

/// Frame accumulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// Number of frames to sum
    #[serde(default = "default_count")]
    pub count: usize,
    /// Stop early with a partial sum after this long without a frame
    #[serde(default = "default_stall_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Pixel type handed to the save callback
    #[serde(default = "default_save_dtype")]
    pub save_dtype: PixelType,
    /// Output file for the summed image
    #[serde(default = "default_accumulator_output")]
    pub output: PathBuf,
}

// Default value functions
fn default_name() -> String {
    "detstream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_endpoint() -> String {
    "tcp://localhost:5501".to_string()
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_receive_hwm() -> i32 {
    2
}

fn default_reconnect_after_errors() -> u32 {
    50
}

fn default_dtype() -> PixelType {
    PixelType::U16
}

fn default_rows() -> usize {
    512
}

fn default_cols() -> usize {
    1024
}

fn default_store_output() -> PathBuf {
    PathBuf::from("frames.h5")
}

fn default_pixel_size() -> f64 {
    75e-6
}

fn default_count() -> usize {
    10
}

fn default_stall_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_save_dtype() -> PixelType {
    PixelType::I32
}

fn default_accumulator_output() -> PathBuf {
    PathBuf::from("summed.h5")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            protocol: Protocol::default(),
            receive_timeout: default_receive_timeout(),
            receive_hwm: default_receive_hwm(),
            reconnect_after_errors: default_reconnect_after_errors(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            dtype: default_dtype(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output: default_store_output(),
            x_pixel_size: default_pixel_size(),
            y_pixel_size: default_pixel_size(),
        }
    }
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            count: default_count(),
            idle_timeout: default_stall_timeout(),
            save_dtype: default_save_dtype(),
            output: default_accumulator_output(),
        }
    }
}

impl FrameConfig {
    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Bytes in one raw frame.
    pub fn frame_bytes(&self) -> usize {
        self.rows * self.cols * self.dtype.itemsize()
    }
}

impl StreamConfig {
    /// Load configuration from a TOML file and `DETSTREAM_` environment variables.
    ///
    /// Example override: `DETSTREAM_TRANSPORT__ENDPOINT=tcp://10.0.0.5:5501`
    pub fn load_from<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        let config: StreamConfig = Figment::from(Serialized::defaults(StreamConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DETSTREAM_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml_str: &str) -> StreamResult<Self> {
        let config: StreamConfig = Figment::from(Serialized::defaults(StreamConfig::default()))
            .merge(Toml::string(toml_str))
            .extract()?;
        Ok(config)
    }

    /// Serialize to TOML (used to hand configuration to worker processes).
    pub fn to_toml_string(&self) -> StreamResult<String> {
        toml::to_string(self).map_err(|e| StreamError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Receive buffer size bounding memory under overload: HWM x frame bytes.
    pub fn receive_buffer_bytes(&self) -> usize {
        self.transport.receive_hwm.max(1) as usize * self.frame.frame_bytes()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> StreamResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(StreamError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(StreamError::Config(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.transport.endpoint.trim().is_empty() {
            return Err(StreamError::Config("Transport endpoint must not be empty".into()));
        }

        if self.transport.receive_hwm <= 0 {
            return Err(StreamError::Config(format!(
                "Invalid receive_hwm {}. Must be positive",
                self.transport.receive_hwm
            )));
        }

        if self.frame.rows == 0 || self.frame.cols == 0 {
            return Err(StreamError::Config(format!(
                "Invalid frame shape {}x{}. Both dimensions must be positive",
                self.frame.rows, self.frame.cols
            )));
        }

        if self.accumulator.count == 0 {
            return Err(StreamError::Config("Accumulation count must be at least 1".into()));
        }

        Ok(())
    }
}

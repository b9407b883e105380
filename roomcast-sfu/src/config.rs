//! SFU Configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Down track count above which broadcasts are split across workers (0 = never)
    pub load_balance_threshold: usize,
    /// Track per-layer cadence to drive simulcast layer availability
    pub use_stream_trackers: bool,
    /// Minimum time between keyframe requests, per resolution
    pub pli_throttle: PliThrottleConfig,
    /// Active speaker detection parameters
    pub audio: AudioConfig,
    /// Layer availability detection parameters
    pub stream_tracker: StreamTrackerConfig,
    /// Interval between connection quality computations (ms)
    pub connection_quality_interval_ms: u64,
    /// Capacity of each subscriber's outbound permission update queue
    pub subscriber_queue_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            load_balance_threshold: 20,
            use_stream_trackers: true,
            pli_throttle: PliThrottleConfig::default(),
            audio: AudioConfig::default(),
            stream_tracker: StreamTrackerConfig::default(),
            connection_quality_interval_ms: 5000,
            subscriber_queue_capacity: 64,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PliThrottleConfig {
    pub low_quality_ms: u64,
    pub mid_quality_ms: u64,
    pub high_quality_ms: u64,
}

impl Default for PliThrottleConfig {
    fn default() -> Self {
        Self {
            low_quality_ms: 1000,
            mid_quality_ms: 500,
            high_quality_ms: 300,
        }
    }
}

impl PliThrottleConfig {
    /// Throttle window for a simulcast RID. Unknown RIDs use the mid window.
    #[must_use]
    pub fn for_rid(&self, rid: &str) -> Duration {
        let ms = match rid {
            crate::types::FULL_RESOLUTION => self.high_quality_ms,
            crate::types::QUARTER_RESOLUTION => self.low_quality_ms,
            _ => self.mid_quality_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Audio level (dBov, 0-127) at or below which a participant counts as speaking
    pub active_level: u8,
    /// Percentile of observed packets that must be active
    pub min_percentile: u8,
    pub update_interval_ms: u32,
    pub smooth_intervals: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            active_level: 35,
            min_percentile: 40,
            update_interval_ms: 400,
            smooth_intervals: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerConfig {
    /// Packets a layer must deliver within one cycle to be considered live
    pub samples_required: u32,
    /// Consecutive silent cycles before a layer is considered stopped
    pub cycles_required: u32,
    pub cycle_duration_ms: u64,
    pub bitrate_report_interval_ms: u64,
}

impl Default for StreamTrackerConfig {
    fn default() -> Self {
        Self {
            samples_required: 5,
            cycles_required: 4,
            cycle_duration_ms: 500,
            bitrate_report_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl SfuConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST__LOAD_BALANCE_THRESHOLD, ROOMCAST__PLI_THROTTLE__LOW_QUALITY_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for settings that cannot work at runtime
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.load_balance_threshold != 0 && self.load_balance_threshold < 2 {
            errors.push("load_balance_threshold must be 0 (disabled) or at least 2".to_string());
        }
        if self.connection_quality_interval_ms == 0 {
            errors.push("connection_quality_interval_ms must be positive".to_string());
        }
        if self.stream_tracker.cycle_duration_ms == 0 {
            errors.push("stream_tracker.cycle_duration_ms must be positive".to_string());
        }
        if self.stream_tracker.bitrate_report_interval_ms == 0 {
            errors.push("stream_tracker.bitrate_report_interval_ms must be positive".to_string());
        }
        if self.stream_tracker.cycles_required == 0 {
            errors.push("stream_tracker.cycles_required must be positive".to_string());
        }
        if self.subscriber_queue_capacity == 0 {
            errors.push("subscriber_queue_capacity must be positive".to_string());
        }
        if self.audio.active_level > 127 {
            errors.push("audio.active_level must be within 0..=127".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn connection_quality_interval(&self) -> Duration {
        Duration::from_millis(self.connection_quality_interval_ms)
    }
}

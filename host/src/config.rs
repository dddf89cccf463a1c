//! Configuration for one traced kernel launch

use anyhow::{Context, Result};
use gpu_patch_shared::{AccessFlags, RecordType, TraceBufferBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `GPU_PATCH_BUFFER_RECORDS=65536`
pub const ENV_PREFIX: &str = "GPU_PATCH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Trace buffer capacity in records
    pub buffer_records: u32,

    /// Record encoding producers write
    pub record_type: RecordType,

    /// Comma-separated access kinds to capture ("read,write"); empty = all
    pub flags: String,

    /// Sample blocks where `block % frequency == offset`
    pub block_sampling_offset: u32,

    /// 0 or 1 samples every block
    pub block_sampling_frequency: u32,

    /// Initial drain poll interval
    pub poll_interval_ms: u64,

    /// Idle polls back off up to this interval
    pub max_poll_interval_ms: u64,

    /// Give up when live producers make no progress for this long
    pub stall_timeout_ms: u64,

    /// Polls a producer spends on a full buffer before dropping a record
    /// (None = wait for the host indefinitely)
    pub producer_spin_limit: Option<u64>,

    /// Attempts per batch delivered to a sink
    pub sink_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_records: 4096,
            record_type: RecordType::Full,
            flags: String::new(),
            block_sampling_offset: 0,
            block_sampling_frequency: 0,
            poll_interval_ms: 1,
            max_poll_interval_ms: 50,
            stall_timeout_ms: 30_000,
            producer_spin_limit: None,
            sink_attempts: 3,
        }
    }
}

impl SessionConfig {
    /// Defaults, overlaid by an optional config file, overlaid by
    /// `GPU_PATCH_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&SessionConfig::default())
                .context("Failed to seed configuration defaults")?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration values")
    }

    /// Parsed capture mask
    pub fn capture_flags(&self) -> Result<AccessFlags> {
        self.flags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .try_fold(AccessFlags::empty(), |acc, name| Ok(acc | name.parse::<AccessFlags>()?))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer_records == 0 {
            anyhow::bail!("Buffer must hold at least one record");
        }

        if self.block_sampling_frequency > 1
            && self.block_sampling_offset >= self.block_sampling_frequency
        {
            anyhow::bail!(
                "Block sampling offset {} must be below frequency {}",
                self.block_sampling_offset,
                self.block_sampling_frequency
            );
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be greater than 0");
        }

        if self.max_poll_interval_ms < self.poll_interval_ms {
            anyhow::bail!("Max poll interval must not be below the poll interval");
        }

        if self.stall_timeout_ms == 0 {
            anyhow::bail!("Stall timeout must be greater than 0");
        }

        if self.sink_attempts == 0 {
            anyhow::bail!("Sink attempts must be greater than 0");
        }

        self.capture_flags()?;
        Ok(())
    }

    /// Buffer allocation matching this configuration
    pub fn buffer_builder(&self, num_threads: u32) -> Result<TraceBufferBuilder> {
        Ok(TraceBufferBuilder::new(self.buffer_records)
            .record_type(self.record_type)
            .flags(self.capture_flags()?)
            .block_sampling(self.block_sampling_offset, self.block_sampling_frequency)
            .num_threads(num_threads)
            .producer_spin_limit(self.producer_spin_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_capture_flags_parse() {
        let config = SessionConfig {
            flags: "read, write,shared".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.capture_flags().unwrap(),
            AccessFlags::READ | AccessFlags::WRITE | AccessFlags::SHARED
        );
        assert!(SessionConfig::default().capture_flags().unwrap().is_empty());

        let bad = SessionConfig {
            flags: "read,teleport".to_string(),
            ..SessionConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validation_sampling() {
        let config = SessionConfig {
            block_sampling_offset: 4,
            block_sampling_frequency: 4,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            block_sampling_offset: 3,
            block_sampling_frequency: 4,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_intervals() {
        let config = SessionConfig {
            poll_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            poll_interval_ms: 10,
            max_poll_interval_ms: 5,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            buffer_records: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "buffer_records = 128").unwrap();
        writeln!(file, "record_type = \"address\"").unwrap();
        writeln!(file, "flags = \"write\"").unwrap();
        writeln!(file, "producer_spin_limit = 1000").unwrap();

        let config = SessionConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.buffer_records, 128);
        assert_eq!(config.record_type, RecordType::Address);
        assert_eq!(config.capture_flags().unwrap(), AccessFlags::WRITE);
        assert_eq!(config.producer_spin_limit, Some(1000));
        assert_eq!(config.stall_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_buffer_builder() {
        let config = SessionConfig {
            buffer_records: 32,
            record_type: RecordType::AddressAnalysis,
            ..SessionConfig::default()
        };
        let buffer = config.buffer_builder(4).unwrap().build().unwrap();
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(buffer.live_threads(), 4);
        assert!(buffer.is_analysis());
    }
}

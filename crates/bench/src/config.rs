//! Benchmark configuration management

use anyhow::{Context, Result, anyhow};
use common::LOG_LEVELS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use streamer::config::{DEFAULT_QUEUE_DEPTH, DEFAULT_REQUEST_SIZE};
use streamer::usb::DeviceFilter;
use streamer::{RunMode, validate_endpoint};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device under test as VID:PID (e.g. "0x04b4:0x00f1")
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Endpoint address, direction bit included
    #[serde(default)]
    pub endpoint: Option<u8>,
    /// Packets (or bursts) per request
    #[serde(default = "StreamSettings::default_request_size")]
    pub request_size: usize,
    /// Requests kept in flight
    #[serde(default = "StreamSettings::default_queue_depth")]
    pub queue_depth: usize,
    /// Test duration in seconds (None = until Ctrl+C)
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Override of the packet size derived from the endpoint descriptor
    #[serde(default)]
    pub packet_size: Option<usize>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_size: Self::default_request_size(),
            queue_depth: Self::default_queue_depth(),
            duration_secs: None,
            packet_size: None,
        }
    }
}

impl StreamSettings {
    fn default_request_size() -> usize {
        DEFAULT_REQUEST_SIZE
    }

    fn default_queue_depth() -> usize {
        DEFAULT_QUEUE_DEPTH
    }

    pub fn run_mode(&self) -> RunMode {
        match self.duration_secs {
            Some(secs) => RunMode::For(Duration::from_secs(secs)),
            None => RunMode::UntilStopped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl BenchConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BenchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-perf").join("bench.toml")
        } else {
            PathBuf::from(".config/usb-perf/bench.toml")
        }
    }

    /// Validate configuration values
    ///
    /// The device filter and endpoint may be missing here; they are
    /// required only once command-line overrides have been applied.
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        if let Some(filter) = &self.device.filter {
            filter
                .parse::<DeviceFilter>()
                .with_context(|| format!("Invalid device filter '{}'", filter))?;
        }

        if let Some(endpoint) = self.stream.endpoint {
            validate_endpoint(endpoint)?;
        }

        if self.stream.request_size == 0 {
            return Err(anyhow!("request_size must be at least 1"));
        }
        if self.stream.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be at least 1"));
        }
        if self.stream.duration_secs == Some(0) {
            return Err(anyhow!("duration_secs must be greater than 0"));
        }
        if self.stream.packet_size == Some(0) {
            return Err(anyhow!("packet_size must be greater than 0"));
        }

        Ok(())
    }

    /// Device filter, parsed
    pub fn device_filter(&self) -> Result<DeviceFilter> {
        let filter = self
            .device
            .filter
            .as_deref()
            .ok_or_else(|| anyhow!("No device given, use --device VID:PID or [device] filter"))?;
        Ok(filter.parse()?)
    }

    pub fn endpoint(&self) -> Result<u8> {
        self.stream
            .endpoint
            .ok_or_else(|| anyhow!("No endpoint given, use --endpoint or [stream] endpoint"))
    }
}

/// Parse an endpoint address given in hex ("0x81") or decimal ("129")
pub fn parse_endpoint(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|_| format!("invalid endpoint address '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BenchConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.stream.request_size, 16);
        assert_eq!(config.stream.queue_depth, 16);
        assert_eq!(config.stream.run_mode(), RunMode::UntilStopped);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BenchConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_stream_settings() {
        let mut config = BenchConfig::default();
        config.stream.endpoint = Some(0x80);
        assert!(config.validate().is_err());

        config.stream.endpoint = Some(0x81);
        assert!(config.validate().is_ok());

        config.stream.queue_depth = 0;
        assert!(config.validate().is_err());
        config.stream.queue_depth = 4;

        config.stream.duration_secs = Some(0);
        assert!(config.validate().is_err());
        config.stream.duration_secs = Some(10);
        assert_eq!(
            config.stream.run_mode(),
            RunMode::For(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_validate_filter() {
        let mut config = BenchConfig::default();
        config.device.filter = Some("04b4:00f1".to_string());
        assert!(config.validate().is_err());

        config.device.filter = Some("0x04b4:0x00f1".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.device_filter().unwrap(),
            DeviceFilter::new(0x04b4, 0x00f1)
        );
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let config: BenchConfig = toml::from_str(
            r#"
[device]
filter = "0x04b4:0x00f1"

[stream]
endpoint = 0x81
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint().unwrap(), 0x81);
        assert_eq!(config.stream.request_size, DEFAULT_REQUEST_SIZE);
        assert_eq!(config.stream.queue_depth, DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.stream.duration_secs, None);
        assert_eq!(config.stream.packet_size, None);
        assert_eq!(config.logging.level, "info");

        let empty: BenchConfig = toml::from_str("").unwrap();
        assert!(empty.validate().is_ok());
        assert!(empty.device.filter.is_none());
        assert_eq!(empty.stream.run_mode(), RunMode::UntilStopped);
    }

    #[test]
    fn test_unknown_level_in_file_rejected() {
        let config: BenchConfig = toml::from_str("[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_device_and_endpoint() {
        let config = BenchConfig::default();
        assert!(config.device_filter().is_err());
        assert!(config.endpoint().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("bench.toml");

        let mut config = BenchConfig::default();
        config.device.filter = Some("0x04b4:0x00f1".to_string());
        config.stream.endpoint = Some(0x81);
        config.stream.duration_secs = Some(30);
        config.save(&path).unwrap();

        let loaded = BenchConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.filter.as_deref(), Some("0x04b4:0x00f1"));
        assert_eq!(loaded.stream.endpoint, Some(0x81));
        assert_eq!(loaded.stream.duration_secs, Some(30));
        assert_eq!(loaded.stream.packet_size, None);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(&path, "[stream]\nqueue_depth = 0\n").unwrap();
        assert!(BenchConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("0x81"), Ok(0x81));
        assert_eq!(parse_endpoint("0X02"), Ok(0x02));
        assert_eq!(parse_endpoint("129"), Ok(0x81));
        assert!(parse_endpoint("0x181").is_err());
        assert!(parse_endpoint("ep1").is_err());
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::error::ConfigError;

/// Rig defaults: the DAQ firmware talks at 230400 baud and the live view keeps
/// the last 10k samples per channel.
pub const DEFAULT_BAUD_RATE: u32 = 230_400;
pub const DEFAULT_RING_CAPACITY: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Serial device, e.g. `COM4` or `/dev/ttyACM0`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Samples retained per channel for the live view.
    pub ring_buffer_capacity: usize,
    /// Upper bound on how long a stop request can wait for the reader.
    pub read_timeout_ms: u64,
    pub export_dir: Option<PathBuf>,
    pub export_queue_capacity: usize,
    pub export_flush_interval_ms: u64,
    /// Poll cadence of whatever renders the live data.
    pub refresh_interval_ms: u64,
    pub max_line_bytes: usize,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            ring_buffer_capacity: DEFAULT_RING_CAPACITY,
            read_timeout_ms: 1000,
            export_dir: None,
            export_queue_capacity: 65_536,
            export_flush_interval_ms: 500,
            refresh_interval_ms: 1000,
            max_line_bytes: 1024,
        }
    }
}

impl DaqConfig {
    /// Reads a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DaqConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.baud_rate == 0, "baud_rate must be greater than zero"),
            (
                self.ring_buffer_capacity == 0,
                "ring_buffer_capacity must be greater than zero",
            ),
            (self.read_timeout_ms == 0, "read_timeout_ms must be greater than zero"),
            (
                self.export_queue_capacity == 0,
                "export_queue_capacity must be greater than zero",
            ),
            (
                self.export_flush_interval_ms == 0,
                "export_flush_interval_ms must be greater than zero",
            ),
            (
                self.refresh_interval_ms == 0,
                "refresh_interval_ms must be greater than zero",
            ),
            (self.max_line_bytes < 64, "max_line_bytes must be at least 64"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn export_flush_interval(&self) -> Duration {
        Duration::from_millis(self.export_flush_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = DaqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.baud_rate, 230_400);
        assert_eq!(config.read_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": "COM4", "ring_buffer_capacity": 500}}"#).unwrap();
        let config = DaqConfig::load(file.path()).unwrap();
        assert_eq!(config.port.as_deref(), Some("COM4"));
        assert_eq!(config.ring_buffer_capacity, 500);
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn rejects_zero_timeout_and_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"read_timeout_ms": 0}}"#).unwrap();
        assert!(matches!(
            DaqConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            DaqConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));

        assert!(matches!(
            DaqConfig::load(Path::new("/definitely/not/here.json")),
            Err(ConfigError::Read { .. })
        ));
    }
}

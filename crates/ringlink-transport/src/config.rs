use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::channel::ChannelConfig;
use crate::error::{Result, TransportError};
use crate::fabric::FabricConfig;
use crate::retry::RetryConfig;
use crate::ring::validate_capacity;

/// Settings of the socket-backed transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Disable Nagle's algorithm on TCP connections.
    pub nodelay: bool,
    /// Size of the buffer `read_zc` reads into.
    pub scratch_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            scratch_size: 64 * 1024,
        }
    }
}

/// Settings of the shared-memory transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Bytes per direction; a power of two.
    pub capacity: usize,
    /// Upper bound on a single busy-wait; `None` waits forever.
    pub spin_timeout_ms: Option<u64>,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            capacity: 4 * 1024 * 1024,
            spin_timeout_ms: None,
        }
    }
}

/// Configuration shared by every backend; each one reads the sections it needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub fabric: FabricConfig,
    pub channel: ChannelConfig,
    pub bootstrap: RetryConfig,
    pub stream: StreamConfig,
    pub shm: ShmConfig,
}

impl TransportConfig {
    /// Loads a `.toml` or `.json` file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| TransportError::config(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| TransportError::config(format!("{}: {e}", path.display())))?,
            _ => {
                return Err(TransportError::config(format!(
                    "unsupported config file extension: {ext:?}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        validate_capacity(self.shm.capacity, 2)?;
        if self.stream.scratch_size == 0 {
            return Err(TransportError::config("stream scratch size must be non-zero"));
        }
        if self.bootstrap.max_attempts == 0 {
            return Err(TransportError::config("bootstrap needs at least one attempt"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = TransportConfig::default();
        assert_eq!(config.channel.capacity, 16 * 1024 * 1024);
        assert!(config.channel.wait_for_completion);
        assert_eq!(config.channel.publish_threshold, 0);
        assert_eq!(config.bootstrap.max_attempts, 11);
        assert_eq!(config.bootstrap.backoff_ms, 500);
        assert!(config.stream.nodelay);
        assert_eq!(config.fabric.device, "soft");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut config = TransportConfig::default();
        config.channel.capacity = 1 << 20;
        config.channel.spin_timeout_ms = Some(250);
        config.shm.capacity = 1 << 16;

        let json = serde_json::to_string(&config).unwrap();
        let decoded: TransportConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "channel": {{ "capacity": 65536, "publish_threshold": 4096 }},
                "bootstrap": {{ "max_attempts": 3 }}
            }}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.channel.capacity, 65536);
        assert_eq!(config.channel.publish_threshold, 4096);
        assert_eq!(config.channel.max_inline, 256);
        assert_eq!(config.bootstrap.max_attempts, 3);
        assert_eq!(config.bootstrap.backoff_ms, 500);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[channel]
capacity = 1048576
wait_for_completion = false
spin_timeout_ms = 1000

[stream]
nodelay = false

[shm]
capacity = 262144
            "#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.channel.capacity, 1 << 20);
        assert!(!config.channel.wait_for_completion);
        assert_eq!(config.channel.spin_timeout_ms, Some(1000));
        assert!(!config.stream.nodelay);
        assert_eq!(config.shm.capacity, 1 << 18);
    }

    #[test]
    fn test_from_file_rejects_bad_capacity() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[channel]\ncapacity = 1000").unwrap();
        assert!(matches!(
            TransportConfig::from_file(file.path()),
            Err(TransportError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(TransportConfig::from_file(file.path()).is_err());
    }
}

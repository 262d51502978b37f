//! Node configuration: TOML file, then environment overrides.

use crate::error::{Result, StreamError};
use crate::streaming::protocol::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_shard_count() -> usize {
    num_cpus::get()
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_command_queue() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of shards, one thread each.
    pub shard_count: usize,
    /// Bytes read from storage per chunk frame.
    pub chunk_size: usize,
    /// Compress chunk payloads with lz4.
    pub compress: bool,
    /// Depth of each shard's command queue.
    pub command_queue: usize,
    /// Per-plan event buffer; slow subscribers lose older events.
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            chunk_size: default_chunk_size(),
            compress: false,
            command_queue: default_command_queue(),
            event_capacity: default_event_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl StreamingConfig {
    /// Parse a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
            .map_err(|e| StreamError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| StreamError::Config(e.to_string()))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Supported variables:
    /// - `SHARD_STREAM_SHARDS`
    /// - `SHARD_STREAM_CHUNK_SIZE`
    /// - `SHARD_STREAM_COMPRESS`
    /// - `SHARD_STREAM_LOG`
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(shards) = std::env::var("SHARD_STREAM_SHARDS") {
            if let Ok(shards) = shards.parse() {
                self.shard_count = shards;
            }
        }

        if let Ok(size) = std::env::var("SHARD_STREAM_CHUNK_SIZE") {
            if let Ok(size) = size.parse() {
                self.chunk_size = size;
            }
        }

        if let Ok(compress) = std::env::var("SHARD_STREAM_COMPRESS") {
            if let Ok(compress) = compress.parse() {
                self.compress = compress;
            }
        }

        if let Ok(level) = std::env::var("SHARD_STREAM_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(StreamError::Config("shard_count must be non-zero".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(StreamError::Config("chunk_size must be non-zero".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(StreamError::Config(format!(
                "chunk_size {} exceeds the largest chunk a frame can carry ({})",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.command_queue == 0 {
            return Err(StreamError::Config(
                "command_queue must be non-zero".to_string(),
            ));
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
    fn test_defaults_are_valid() {
        let config = StreamingConfig::default();
        assert!(config.shard_count >= 1);
        assert_eq!(config.chunk_size, 256 * 1024);
        assert!(!config.compress);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StreamingConfig::from_toml("shard_count = 4\ncompress = true\n").unwrap();
        assert_eq!(config.shard_count, 4);
        assert!(config.compress);
        assert_eq!(config.command_queue, 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = 4096").unwrap();
        writeln!(file, "log_level = \"debug\"").unwrap();
        let config = StreamingConfig::load(file.path()).unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(StreamingConfig::from_toml("shard_count = \"many\"").is_err());
        let config = StreamingConfig {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));
        assert!(StreamingConfig::load("/nonexistent/stream.toml").is_err());
    }

    #[test]
    fn test_chunk_size_bounded_by_frame_size() {
        let too_big = StreamingConfig {
            chunk_size: 80 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(too_big.validate(), Err(StreamError::Config(_))));

        let largest = StreamingConfig {
            chunk_size: MAX_CHUNK_SIZE,
            compress: true,
            ..Default::default()
        };
        largest.validate().unwrap();
    }
}

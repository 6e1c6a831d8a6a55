//! Module configuration.

use crate::backend::HISTORY_FILE_EXTENSION;
use crate::error::Result;
use crate::provider::DEFAULT_QUEUE_SIZE;
use crate::types::BackendType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of one state system module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Analysis id. Also the default history file name.
    pub id: String,

    /// Storage strategy.
    /// Default: Full
    pub backend: BackendType,

    /// Directory holding history files.
    pub directory: PathBuf,

    /// History file name (None = `<id>.ht`).
    pub file_name: Option<String>,

    /// Capacity of the event queue between the source and the provider.
    /// Default: 10000
    pub queue_size: usize,

    /// Time between two checkpoints of a partial history.
    /// Default: 50000
    pub partial_granularity: i64,

    /// Buffered notifications per subscriber before it is dropped.
    /// Default: 64
    pub listener_buffer: usize,

    /// Decoded intervals kept in the history file read cache.
    /// Default: 4096
    pub read_cache_size: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            backend: BackendType::Full,
            directory: PathBuf::from("./"),
            file_name: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            partial_granularity: 50_000,
            listener_buffer: 64,
            read_cache_size: 4096,
        }
    }
}

impl ModuleConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from JSON. Missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_partial_granularity(mut self, granularity: i64) -> Self {
        self.partial_granularity = granularity;
        self
    }

    pub fn with_listener_buffer(mut self, buffer: usize) -> Self {
        self.listener_buffer = buffer;
        self
    }

    /// Full path of the history file.
    pub fn history_path(&self) -> PathBuf {
        let name = self
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.id, HISTORY_FILE_EXTENSION));
        self.directory.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModuleConfig::new("kernel");
        assert_eq!(config.backend, BackendType::Full);
        assert_eq!(config.queue_size, 10_000);
        assert_eq!(config.history_path(), PathBuf::from("./kernel.ht"));
    }

    #[test]
    fn test_from_json() {
        let config = ModuleConfig::from_json(
            r#"{"id": "cpu", "backend": "partial", "directory": "/tmp/traces", "partial_granularity": 1000}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Partial);
        assert_eq!(config.partial_granularity, 1000);
        assert_eq!(config.listener_buffer, 64);
        assert_eq!(config.history_path(), PathBuf::from("/tmp/traces/cpu.ht"));

        assert!(ModuleConfig::from_json("{\"backend\": \"floppy\"}").is_err());
    }

    #[test]
    fn test_file_name_override() {
        let config = ModuleConfig::new("cpu")
            .with_directory("/data")
            .with_file_name("custom.ht");
        assert_eq!(config.history_path(), PathBuf::from("/data/custom.ht"));
    }
}

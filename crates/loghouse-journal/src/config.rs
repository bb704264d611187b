//! Journal Storage Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Controls how journals lay out chunks on disk and how many file handles
/// the shared reader pool may keep open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Directory holding one subdirectory per journal.
    pub data_dir: PathBuf,

    /// Roll to a new chunk once the active one reaches this size
    /// (default: 64MB).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Maximum simultaneously open file readers across all journals
    /// (default: 1024).
    #[serde(default = "default_fd_pool_size")]
    pub fd_pool_size: usize,

    /// Read buffer per pooled file reader (default: 64KB).
    #[serde(default = "default_reader_buf_size")]
    pub reader_buf_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/journals"),
            max_chunk_size: default_max_chunk_size(),
            fd_pool_size: default_fd_pool_size(),
            reader_buf_size: default_reader_buf_size(),
        }
    }
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_fd_pool_size() -> usize {
    1024
}

fn default_reader_buf_size() -> usize {
    64 * 1024 // 64KB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JournalConfig::default();
        assert_eq!(config.max_chunk_size, 64 * 1024 * 1024);
        assert_eq!(config.fd_pool_size, 1024);
        assert_eq!(config.reader_buf_size, 64 * 1024);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: JournalConfig =
            serde_json::from_str(r#"{"data_dir": "/var/lib/loghouse"}"#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/loghouse"));
        assert_eq!(config.fd_pool_size, 1024);
    }
}

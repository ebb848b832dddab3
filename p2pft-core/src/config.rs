//! Transfer configuration shared by the send path, the receive path and the reassembler.

use std::path::PathBuf;

use serde::Deserialize;

/// Default chunk size in bytes. Header (63) + chunk fits a 512-byte read.
pub const DEFAULT_CHUNK_SIZE: usize = 449;

/// Largest chunk size whose length still fits the 5-character header field.
pub const MAX_CHUNK_SIZE: usize = 99_999;

/// Default working directory for fragments and finished downloads.
pub const DEFAULT_DATA_DIR: &str = "P2PSharedFile";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Directory holding `{id}.pt.{n}.of.{total}.p2pft` fragments.
    #[serde(default = "default_data_dir")]
    pub fragment_dir: PathBuf,
    /// Directory receiving reassembled files.
    #[serde(default = "default_data_dir")]
    pub download_dir: PathBuf,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            fragment_dir: default_data_dir(),
            download_dir: default_data_dir(),
        }
    }
}

impl TransferConfig {
    /// Config rooted in a single directory (fragments and downloads side by side).
    pub fn in_dir(dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        let dir = dir.into();
        Self {
            chunk_size,
            fragment_dir: dir.clone(),
            download_dir: dir,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size {0} outside 1..=99999")]
    ChunkSize(usize),
}

// rust/reshard-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::tensor::DType;

/// Geometry and layout violations found while validating a sharded layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardingError {
    #[error("tensor '{key}' is not covered on dim {dim}: gap at [{start}, {end})")]
    Gap {
        key: String,
        dim: usize,
        start: u64,
        end: u64,
    },

    #[error("tensor '{key}' has overlapping shards on dim {dim}: [{start}, {end}) is covered twice")]
    Overlap {
        key: String,
        dim: usize,
        start: u64,
        end: u64,
    },

    #[error("tensor '{key}' has inconsistent global shapes: {expected:?} vs {found:?}")]
    InconsistentShape {
        key: String,
        expected: Vec<u64>,
        found: Vec<u64>,
    },

    #[error("tensor '{key}' has inconsistent dtypes: {expected} vs {found}")]
    InconsistentDtype {
        key: String,
        expected: DType,
        found: DType,
    },

    #[error(
        "shard of '{key}' is out of bounds on dim {dim}: offset {offset} + length {length} \
         does not fit global size {global}"
    )]
    OutOfBounds {
        key: String,
        dim: usize,
        offset: u64,
        length: u64,
        global: u64,
    },

    #[error("shard of '{key}' has mismatched ranks (local {local}, global {global}, offset {offset})")]
    RankMismatch {
        key: String,
        local: usize,
        global: usize,
        offset: usize,
    },

    #[error("tensor '{key}' contains flattened shards, which cannot be resharded directly")]
    FlattenedShard { key: String },

    #[error("destination tensors missing from source: {keys:?}")]
    MissingSource { keys: Vec<String> },

    #[error("tensor '{key}' has no shards")]
    NoShards { key: String },
}

/// Failures while building or executing a transfer plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("no communication group contains ranks {ranks:?} needed by '{tensor}'")]
    NoGroupFound { tensor: String, ranks: Vec<u32> },

    #[error("no rank loaded the file holding '{tensor}' at offset {offset:?}")]
    MissingLoadInfo { tensor: String, offset: Vec<u64> },

    #[error("storage index '{tensor}' at offset {offset:?} was claimed by more than one rank")]
    DuplicateLoadInfo { tensor: String, offset: Vec<u64> },

    #[error("file '{file}' is needed but no rank can read it")]
    UnreachableFile { file: String },

    #[error("checkpoint is incomplete, missing files: {missing:?}")]
    IncompleteCheckpoint { missing: Vec<String> },

    #[error("schedule is in stage {found}, expected {expected}")]
    InvalidStage {
        expected: &'static str,
        found: &'static str,
    },

    #[error("read item for '{tensor}' already targets {count} ranks before splitting")]
    UnsplitItem { tensor: String, count: usize },

    #[error("ranks disagree on checkpoint id: {ids:?}")]
    UniqueIdMismatch { ids: Vec<u64> },
}

#[derive(Error, Debug)]
pub enum ReshardError {
    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Communication error on rank {rank}: {message}")]
    Communication { rank: u32, message: String },

    #[error("Tensor error: {message}")]
    Tensor { message: String },

    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error(transparent)]
    Planning(#[from] PlanningError),
}

pub type Result<T> = std::result::Result<T, ReshardError>;

// Convenience constructors
impl ReshardError {
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn communication(rank: u32, message: impl Into<String>) -> Self {
        Self::Communication {
            rank,
            message: message.into(),
        }
    }

    pub fn tensor(message: impl Into<String>) -> Self {
        Self::Tensor {
            message: message.into(),
        }
    }
}

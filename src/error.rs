use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input volume: {0}")]
    InvalidInputVolume(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dimension mismatch: expected {expected} voxels, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("A supervoxel computation is already running for this stack")]
    AlreadyRunning,

    #[error("Failed to access blob {name}")]
    Storage { name: String, source: io::Error },

    #[error("Corrupt supervoxel data: {0}")]
    Corrupt(String),

    #[error("Failed to encode supervoxel data")]
    Encoding(#[from] bincode::error::EncodeError),

    #[error("Failed to start the supervoxel computation thread")]
    Spawn(#[source] io::Error),

    #[error("Supervoxel computation thread panicked")]
    WorkerPanicked,
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Corrupt(err.to_string())
    }
}

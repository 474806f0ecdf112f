//! Crate-level error type.
//!
//! Everything in this crate fails at graph-construction time (or, for the
//! reference runtime, at step time). Nothing is retried: an error here means
//! the configuration or the caller's graph is wrong.

use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Inconsistent or unsupported configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The all-reduce spec string could not be parsed.
    #[error("all_reduce_spec ({spec}) is invalid: {reason}")]
    InvalidAllReduceSpec { spec: String, reason: String },

    /// `gradients_for` was asked for a device the strategy never returned.
    #[error("device_num {index} exceeds length of device_grads ({len})")]
    DeviceIndexOutOfRange { index: usize, len: usize },

    /// A variable that cannot be mapped into a checkpoint was found.
    #[error("Invalid variable for checkpoint: {0}")]
    CheckpointMismatch(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable {0} already exists")]
    DuplicateVariable(String),

    /// Malformed graph construction request (bad node id, shape mismatch, ...).
    #[error("Graph error: {0}")]
    Graph(String),

    /// Failure while executing a graph in the reference runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Invalid device specification: {0}")]
    Device(String),

    /// The checkpoint file is not a readable safetensors file.
    #[error("Checkpoint format error: {0}")]
    CheckpointFormat(String),

    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, Error>;

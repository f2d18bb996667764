//! Custom error types for the streaming pipeline.
//!
//! This module defines the primary error type, `StreamError`, shared by the transport,
//! the frame store and the two worker loops. Using the `thiserror` crate, it provides a
//! centralized way to tell per-message failures apart from failures that end a worker.
//!
//! ## Error Hierarchy
//!
//! - **`Decode`**: A single wire message could not be decoded (malformed tag payload,
//!   wrong buffer length). The loop drops that message and continues.
//! - **`Shape`**: A decoded image does not have the configured frame shape. Treated
//!   exactly like a decode failure.
//! - **`Store`**: HDF5 failure. Fatal to the persister, which still finalizes the store.
//! - **`EndOfStore`**: Sequential read reached the frame count.
//! - **`Config`**: Semantic configuration errors (bad mode string, zero dimensions).
//! - **`Transport`**: Socket-level failure from the pub/sub layer.
//! - **`Io`** / **`Status`**: Filesystem and shared status block failures.
//! - **`Worker`**: A worker process reported a failure through its status block.
//! - **`FeatureNotEnabled`**: Functionality compiled out via feature flags.
//!
//! A receive timeout is not an error: transports report it as `Ok(None)`.

use crate::codec::DecodeError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Shape error: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[cfg(feature = "storage_hdf5")]
    #[error("Store error: {0}")]
    Store(#[from] hdf5::Error),

    #[error("Store error: {0}")]
    StoreLayout(String),

    #[error("End of store reached")]
    EndOfStore,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Transport error: {0}")]
    Transport(#[from] zmq::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status block error: {0}")]
    Status(String),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl StreamError {
    /// Whether the error only concerns the current message.
    ///
    /// Recoverable errors are logged and swallowed by the worker loops; everything
    /// else ends the worker (after finalizing the store).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Decode(_) | StreamError::Shape { .. })
    }
}

impl From<figment::Error> for StreamError {
    fn from(err: figment::Error) -> Self {
        StreamError::ConfigLoad(Box::new(err))
    }
}

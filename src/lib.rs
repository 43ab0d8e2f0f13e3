//! # Lapse
//!
//! A field-deployed time-lapse capture agent with an offline-tolerant upload
//! queue, plus the ingest receiver it delivers to.
//!
//! The agent captures a frame every interval, picks between the camera's own
//! auto-exposure and a manually tuned long exposure depending on ambient
//! light, spools every frame to a local `SQLite` queue before anything touches
//! the network, and drains that queue to the receiver strictly in capture
//! order with capped exponential backoff.
//!
//! ## Features
//!
//! - Hysteresis-based switch between driven-auto and manual long exposure
//! - Feedback-controlled exposure duration, clamped to configured bounds
//! - Durable FIFO spool that survives power loss and crash mid-upload
//! - Explicit upload state machine (idle, attempting, backoff, offline)
//! - Idempotent ingest receiver keyed by filename
//!
//! ## Example
//!
//! ```rust,ignore
//! use lapse::{Agent, AgentConfig, Shutdown, SimulatedCamera};
//!
//! let config = AgentConfig::load_default()?;
//! let shutdown = Shutdown::new();
//! let agent = Agent::new(config, Box::new(SimulatedCamera::dusk()))?;
//! agent.run_until_shutdown(&shutdown)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod agent;
pub mod camera;
pub mod clock;
pub mod config;
pub mod exposure;
pub mod models;
pub mod observability;
pub mod receiver;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use agent::Agent;
pub use camera::{LightMeter, RpicamCamera, SimulatedCamera};
pub use clock::ClockGuard;
pub use config::{AgentConfig, ExposureConfig, ReceiverConfig, UploadConfig};
pub use exposure::{ExposureSelector, ExposureState, Shot};
pub use models::{DeliveryState, ExposureMode, Photo, QueueEntry};
pub use services::{CaptureScheduler, UploadClient, UploadState};
pub use shutdown::Shutdown;
pub use storage::{QueueStats, SpoolQueue};
pub use transport::{DeliveryOutcome, HttpTransport, PhotoTransport};

/// Error type for lapse operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Bad configuration values, malformed filenames, unusable endpoints |
/// | `OperationFailed` | I/O errors, `SQLite` failures, server startup failures |
/// | `Capture` | The camera or light meter failed during a cycle |
/// | `StorageExhausted` | The spool cannot persist a frame because the disk is full |
/// | `Transport` | The upload client could not be constructed or used |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The camera or light meter failed.
    ///
    /// Retryable at the cycle level: the scheduler skips the cycle and
    /// carries on.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Local storage is full; the frame being written is lost.
    #[error("local storage exhausted: {0}")]
    StorageExhausted(String),

    /// The upload transport could not be set up.
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: &str, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for lapse operations.
pub type Result<T> = std::result::Result<T, Error>;

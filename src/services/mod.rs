//! Agent services.
//!
//! The two long-running loops of the agent and the retry policy they share.
//!
//! - [`CaptureScheduler`]: one exposure cycle per interval, frames into the spool
//! - [`UploadClient`]: spool to receiver, in order, with capped backoff

mod backoff;
mod scheduler;
mod uploader;

pub use backoff::Backoff;
pub use scheduler::CaptureScheduler;
pub use uploader::{Step, UploadClient, UploadState};

use std::any::Any;

/// Best-effort text of a panic payload.
pub(crate) fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

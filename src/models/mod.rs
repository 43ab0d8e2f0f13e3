//! Data models for lapse.

mod photo;
mod queue;

pub use photo::{
    ExposureMode, Photo, SANE_PREFIX, TIMESTAMP_FORMAT, UNSYNCED_PREFIX, filename_stem,
    filename_with_counter,
};
pub use queue::{DeliveryState, QueueEntry};

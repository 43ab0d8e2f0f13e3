//! Local durable storage.
//!
//! A single `SQLite` database (`{data_dir}/spool.db`) holds every captured
//! frame until the receiver acknowledges it.

// Guards are held for the duration of each statement on purpose.
#![allow(clippy::significant_drop_tightening)]

mod connection;
mod queue;

pub use connection::{acquire_lock, configure_connection};
pub use queue::{QueueStats, SpoolQueue};

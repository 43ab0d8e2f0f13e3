//! Photo delivery to the receiver.
//!
//! The upload client only sees [`PhotoTransport`]; the HTTP implementation
//! and test doubles sit behind it.

mod http;

pub use http::{DEVICE_ID_HEADER, FILENAME_HEADER, HttpTransport, UPLOAD_PATH, classify_status};

use crate::models::Photo;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The receiver acknowledged the photo with a 2xx.
    Delivered {
        /// HTTP status code.
        status: u16,
    },
    /// The attempt failed in a way worth retrying.
    ///
    /// Network errors, timeouts, 408, 429 and 5xx responses.
    Transient(String),
    /// The receiver rejected the photo; retrying will not help.
    Permanent {
        /// HTTP status code.
        status: u16,
        /// Rejection reason, from the response body when present.
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Label used for the `status` metric dimension.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Transient(_) => "transient",
            Self::Permanent { .. } => "permanent",
        }
    }
}

/// Sends one photo to the receiver.
pub trait PhotoTransport: Send + Sync {
    /// Performs exactly one delivery attempt, bounded by the transport timeout.
    ///
    /// Failures are reported through the outcome, never by panicking.
    fn send(&self, photo: &Photo) -> DeliveryOutcome;
}

impl<T: PhotoTransport + ?Sized> PhotoTransport for std::sync::Arc<T> {
    fn send(&self, photo: &Photo) -> DeliveryOutcome {
        (**self).send(photo)
    }
}

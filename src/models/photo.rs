//! Captured frames and their filenames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Filename prefix for frames taken with a trustworthy clock.
pub const SANE_PREFIX: &str = "pic";

/// Filename prefix for frames taken while the real-time clock looked unset.
pub const UNSYNCED_PREFIX: &str = "unsynced";

/// `strftime` layout of the timestamp embedded in filenames (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// How the shutter timing of a frame was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureMode {
    /// The camera's built-in auto-exposure picked the shutter time.
    Auto,
    /// The agent set an explicit long exposure.
    Manual,
}

impl ExposureMode {
    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ExposureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExposureMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown exposure mode: {other}"
            ))),
        }
    }
}

/// A captured frame.
///
/// Immutable once built: the scheduler creates it, the spool persists it, and
/// the upload client only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    captured_at: DateTime<Utc>,
    mode: ExposureMode,
    exposure: Option<Duration>,
    clock_sane: bool,
    filename: String,
    data: Vec<u8>,
}

impl Photo {
    /// Creates a photo.
    ///
    /// `exposure` is only kept for [`ExposureMode::Manual`] frames.
    #[must_use]
    pub fn new(
        captured_at: DateTime<Utc>,
        mode: ExposureMode,
        exposure: Option<Duration>,
        clock_sane: bool,
        filename: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let exposure = match mode {
            ExposureMode::Manual => exposure,
            ExposureMode::Auto => None,
        };
        Self {
            captured_at,
            mode,
            exposure,
            clock_sane,
            filename: filename.into(),
            data,
        }
    }

    /// Wall-clock time at shutter trigger.
    #[must_use]
    pub const fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Exposure strategy used for this frame.
    #[must_use]
    pub const fn mode(&self) -> ExposureMode {
        self.mode
    }

    /// Exposure duration applied (manual frames only).
    #[must_use]
    pub const fn exposure(&self) -> Option<Duration> {
        self.exposure
    }

    /// Whether the clock looked trustworthy at capture time.
    #[must_use]
    pub const fn clock_sane(&self) -> bool {
        self.clock_sane
    }

    /// Derived, run-unique filename.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Raw JPEG bytes.
    ///
    /// Empty for spool entries whose payload was evicted after delivery.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Builds the collision-free part of a filename, without extension.
///
/// `pic_01_2025-06-01_21-04-05` for a sane clock. An unset clock restarts
/// near the epoch on every boot, so unsynced names carry the spool run
/// number: `unsynced_01_r000007_1970-01-01_00-00-12`.
#[must_use]
pub fn filename_stem(
    device_id: &str,
    captured_at: DateTime<Utc>,
    clock_sane: bool,
    run: u64,
) -> String {
    let timestamp = captured_at.format(TIMESTAMP_FORMAT);
    if clock_sane {
        format!("{SANE_PREFIX}_{device_id}_{timestamp}")
    } else {
        format!("{UNSYNCED_PREFIX}_{device_id}_r{run:06}_{timestamp}")
    }
}

/// Appends the collision counter and extension to a stem.
///
/// Counter `0` is the plain name; later frames within the same second get
/// `_01`, `_02`, and so on. `_` sorts after `.`, so a byte-wise sort of the
/// names keeps capture order for up to 99 frames per second.
#[must_use]
pub fn filename_with_counter(stem: &str, counter: u32) -> String {
    if counter == 0 {
        format!("{stem}.jpg")
    } else {
        format!("{stem}_{counter:02}.jpg")
    }
}

//! Capture scheduler.
//!
//! Fires one exposure cycle per interval (start-to-start), names the frame
//! and commits it to the spool. Capture and storage failures are logged and
//! the loop carries on. A panicking cycle is caught and skipped the same way;
//! only the shutdown signal ends the loop.

use super::panic_reason;
use crate::camera::LightMeter;
use crate::clock::ClockGuard;
use crate::config::AgentConfig;
use crate::exposure::{ExposureSelector, ExposureState};
use crate::models::{Photo, QueueEntry, filename_stem, filename_with_counter};
use crate::shutdown::Shutdown;
use crate::storage::SpoolQueue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Periodic capture loop.
pub struct CaptureScheduler<M: LightMeter> {
    meter: M,
    selector: ExposureSelector,
    clock: ClockGuard,
    queue: Arc<SpoolQueue>,
    device_id: String,
    interval: Duration,
    state: ExposureState,
    last_stem: Option<String>,
    collisions: u32,
    clock_was_sane: Option<bool>,
}

impl<M: LightMeter> CaptureScheduler<M> {
    /// Creates a scheduler writing into `queue`.
    pub fn new(config: &AgentConfig, meter: M, queue: Arc<SpoolQueue>) -> Self {
        Self {
            meter,
            selector: ExposureSelector::new(config.exposure),
            clock: ClockGuard::new(config.clock_sanity_epoch),
            queue,
            device_id: config.device_id.clone(),
            interval: config.capture.interval,
            state: ExposureState::default(),
            last_stem: None,
            collisions: 0,
            clock_was_sane: None,
        }
    }

    /// Current exposure memory.
    #[must_use]
    pub const fn exposure_state(&self) -> ExposureState {
        self.state
    }

    /// The light meter, for inspection.
    pub const fn meter(&self) -> &M {
        &self.meter
    }

    /// Runs cycles until `shutdown` fires.
    pub fn run(&mut self, shutdown: &Shutdown) {
        tracing::info!(
            device_id = %self.device_id,
            interval_ms = self.interval.as_millis(),
            "Capture loop started"
        );

        while !shutdown.is_triggered() {
            let started = Instant::now();

            // Exposure state only advances after a complete cycle, so a
            // panic midway leaves the scheduler usable.
            let cycle = panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle()));
            match cycle {
                Err(payload) => {
                    metrics::counter!("lapse_capture_failures_total").increment(1);
                    tracing::error!(
                        reason = %panic_reason(payload.as_ref()),
                        "Capture cycle panicked, skipping cycle"
                    );
                },
                Ok(Ok(entry)) => {
                    let photo = entry.photo();
                    tracing::info!(
                        filename = %photo.filename(),
                        seq = entry.seq(),
                        mode = %photo.mode(),
                        exposure_ms = photo.exposure().map(|d| d.as_millis()),
                        "Captured frame"
                    );
                },
                Ok(Err(Error::Capture(reason))) => {
                    metrics::counter!("lapse_capture_failures_total").increment(1);
                    tracing::warn!(reason = %reason, "Capture failed, skipping cycle");
                },
                Ok(Err(e)) => {
                    // The frame is lost; the next cycle may still succeed.
                    tracing::error!(error = %e, "Cannot store captured frame");
                },
            }

            match self.interval.checked_sub(started.elapsed()) {
                Some(remaining) if !remaining.is_zero() => {
                    if shutdown.wait_timeout(remaining) {
                        break;
                    }
                },
                _ => tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis(),
                    "Cycle overran the interval, starting next immediately"
                ),
            }
        }

        tracing::info!("Capture loop stopped");
    }

    /// Runs a single capture cycle and spools its frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] when no frame was taken (exposure state is
    /// left unchanged), or a storage error when the frame could not be
    /// persisted.
    #[instrument(skip(self), fields(operation = "capture.cycle"))]
    pub fn run_cycle(&mut self) -> Result<QueueEntry> {
        let start = Instant::now();
        let (shot, next_state) = self.selector.select_and_capture(&mut self.meter, self.state)?;
        self.state = next_state;

        let clock_sane = self.clock.is_clock_sane(shot.triggered_at);
        self.note_clock(clock_sane, shot.triggered_at);

        let filename = self.next_filename(shot.triggered_at, clock_sane);
        let mode = shot.mode;
        let photo = Photo::new(
            shot.triggered_at,
            shot.mode,
            shot.duration,
            clock_sane,
            filename,
            shot.data,
        );
        let entry = self.queue.enqueue(photo)?;

        metrics::counter!("lapse_frames_captured_total", "mode" => mode.as_str()).increment(1);
        metrics::histogram!("lapse_capture_duration_ms", "mode" => mode.as_str())
            .record(start.elapsed().as_secs_f64() * 1000.0);
        Ok(entry)
    }

    /// Derives the filename, adding a counter when the stem repeats.
    fn next_filename(&mut self, captured_at: DateTime<Utc>, clock_sane: bool) -> String {
        let stem = filename_stem(
            &self.device_id,
            captured_at,
            clock_sane,
            self.queue.run_id(),
        );
        if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.collisions += 1;
        } else {
            self.collisions = 0;
        }
        let filename = filename_with_counter(&stem, self.collisions);
        self.last_stem = Some(stem);
        filename
    }

    fn note_clock(&mut self, sane: bool, now: DateTime<Utc>) {
        if self.clock_was_sane == Some(sane) {
            return;
        }
        match (self.clock_was_sane, sane) {
            (_, false) => tracing::warn!(
                now = %now,
                epoch = %self.clock.epoch(),
                "Clock predates sanity epoch, tagging frames as unsynced"
            ),
            (Some(false), true) => tracing::info!(now = %now, "Clock looks sane again"),
            _ => {},
        }
        self.clock_was_sane = Some(sane);
    }
}

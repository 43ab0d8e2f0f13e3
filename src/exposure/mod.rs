//! Exposure strategy selection.
//!
//! Bright scenes are left to the camera's own auto-exposure. Below a
//! brightness threshold auto-exposure runs out of range, so the selector
//! takes over with a manual long exposure and steers its duration with a
//! bounded proportional feedback loop on the metered brightness of each
//! frame. Two thresholds form a hysteresis band so the mode does not flap
//! when the scene hovers near the boundary.

use crate::camera::LightMeter;
use crate::config::ExposureConfig;
use crate::models::ExposureMode;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Floor applied to metered brightness before dividing by it.
const MIN_MEASURABLE: f64 = 1.0 / 255.0;

/// Running memory of the selector.
///
/// Passed into [`ExposureSelector::select_and_capture`] and returned updated,
/// once per cycle; nothing else holds exposure state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExposureState {
    /// Mode used for the previous frame (`None` before the first frame).
    pub mode: Option<ExposureMode>,
    /// Scene brightness sampled in the previous cycle.
    pub last_brightness: Option<f64>,
    /// Duration the next manual frame will use.
    pub last_duration: Option<Duration>,
}

/// A frame fresh off the sensor, before it is named and spooled.
#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    /// Wall-clock time right before the shutter fired.
    pub triggered_at: DateTime<Utc>,
    /// Mode used.
    pub mode: ExposureMode,
    /// Exposure duration applied (manual only).
    pub duration: Option<Duration>,
    /// JPEG bytes.
    pub data: Vec<u8>,
}

/// Chooses the exposure strategy and tunes manual durations.
#[derive(Debug, Clone, Copy)]
pub struct ExposureSelector {
    config: ExposureConfig,
}

impl ExposureSelector {
    /// Creates a selector.
    #[must_use]
    pub const fn new(config: ExposureConfig) -> Self {
        Self { config }
    }

    /// The tuning parameters in use.
    #[must_use]
    pub const fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Picks the mode for this cycle.
    ///
    /// From auto the switch happens below `manual_below`; from manual the
    /// return happens at or above `auto_above`.
    #[must_use]
    pub fn decide_mode(&self, previous: Option<ExposureMode>, brightness: f64) -> ExposureMode {
        let stay_auto = match previous {
            None | Some(ExposureMode::Auto) => brightness >= self.config.manual_below,
            Some(ExposureMode::Manual) => brightness >= self.config.auto_above,
        };
        if stay_auto {
            ExposureMode::Auto
        } else {
            ExposureMode::Manual
        }
    }

    /// Clamps a duration into the configured bounds.
    #[must_use]
    pub fn clamp_duration(&self, duration: Duration) -> Duration {
        duration.clamp(self.config.min_duration, self.config.max_duration)
    }

    /// Computes the next manual duration from the metered brightness of a
    /// frame taken with `current`.
    #[must_use]
    pub fn next_duration(&self, current: Duration, measured: f64) -> Duration {
        let current = self.clamp_duration(current);
        let error = measured - self.config.target;
        if error.abs() < self.config.deadband {
            return current;
        }

        let current_secs = current.as_secs_f64();
        let desired = current_secs * self.config.target / measured.max(MIN_MEASURABLE);
        let delta = desired - current_secs;
        let delta = if delta > 0.0 {
            delta.min(current_secs * self.config.step_up)
        } else {
            delta.max(-current_secs * self.config.step_down)
        };

        let next = Duration::try_from_secs_f64(current_secs + delta).unwrap_or(current);
        self.clamp_duration(next)
    }

    /// Runs one exposure cycle: sample, decide, fire the shutter once.
    ///
    /// On failure no frame is produced and the caller keeps its previous
    /// state; the returned state is only valid alongside a shot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] if sampling or the capture fails.
    pub fn select_and_capture<M: LightMeter + ?Sized>(
        &self,
        meter: &mut M,
        state: ExposureState,
    ) -> Result<(Shot, ExposureState)> {
        let brightness = meter.sample_brightness()?;
        if !brightness.is_finite() {
            return Err(Error::Capture(format!(
                "light meter returned {brightness}"
            )));
        }
        let mode = self.decide_mode(state.mode, brightness);

        let mut next = ExposureState {
            mode: Some(mode),
            last_brightness: Some(brightness),
            ..state
        };

        let shot = match mode {
            ExposureMode::Auto => {
                let triggered_at = Utc::now();
                let data = meter.capture_auto()?;
                Shot {
                    triggered_at,
                    mode,
                    duration: None,
                    data,
                }
            },
            ExposureMode::Manual => {
                let duration =
                    self.clamp_duration(state.last_duration.unwrap_or(self.config.default_duration));
                let triggered_at = Utc::now();
                let data = meter.capture_manual(duration)?;

                match meter.measure_frame(&data) {
                    Ok(measured) => {
                        let following = self.next_duration(duration, measured);
                        tracing::debug!(
                            exposure_ms = duration.as_millis(),
                            next_exposure_ms = following.as_millis(),
                            measured,
                            "Adjusted manual exposure"
                        );
                        next.last_duration = Some(following);
                    },
                    Err(e) => {
                        // The frame itself is fine; keep it and hold the duration.
                        tracing::warn!(error = %e, "Cannot meter manual frame, holding exposure");
                        next.last_duration = Some(duration);
                    },
                }

                Shot {
                    triggered_at,
                    mode,
                    duration: Some(duration),
                    data,
                }
            },
        };

        if let Some(previous) = state.mode.filter(|previous| *previous != mode) {
            tracing::info!(from = %previous, to = %mode, brightness, "Switched exposure mode");
        }

        Ok((shot, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Meter with scripted samples and scripted frame readings.
    struct ScriptedMeter {
        samples: VecDeque<Result<f64>>,
        frame_readings: VecDeque<f64>,
        manual_durations: Vec<Duration>,
        auto_captures: usize,
    }

    impl ScriptedMeter {
        fn new(samples: Vec<f64>, frame_readings: Vec<f64>) -> Self {
            Self {
                samples: samples.into_iter().map(Ok).collect(),
                frame_readings: frame_readings.into(),
                manual_durations: Vec::new(),
                auto_captures: 0,
            }
        }

        fn shutter_releases(&self) -> usize {
            self.auto_captures + self.manual_durations.len()
        }
    }

    impl LightMeter for ScriptedMeter {
        fn sample_brightness(&mut self) -> Result<f64> {
            self.samples
                .pop_front()
                .unwrap_or_else(|| Err(Error::Capture("script exhausted".to_string())))
        }

        fn capture_auto(&mut self) -> Result<Vec<u8>> {
            self.auto_captures += 1;
            Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
        }

        fn capture_manual(&mut self, duration: Duration) -> Result<Vec<u8>> {
            self.manual_durations.push(duration);
            Ok(vec![0xFF, 0xD8, 0xFF, 0xE0])
        }

        fn measure_frame(&self, _frame: &[u8]) -> Result<f64> {
            Ok(self.frame_readings.front().copied().unwrap_or(0.25))
        }
    }

    impl ScriptedMeter {
        fn advance_reading(&mut self) {
            self.frame_readings.pop_front();
        }
    }

    fn single_threshold() -> ExposureConfig {
        ExposureConfig {
            manual_below: 0.3,
            auto_above: 0.3,
            target: 0.25,
            deadband: 0.05,
            step_up: 0.5,
            step_down: 0.3,
            default_duration: Duration::from_secs(2),
            min_duration: Duration::from_millis(250),
            max_duration: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_bright_scene_uses_auto_and_keeps_duration() {
        let selector = ExposureSelector::new(single_threshold());
        let mut meter = ScriptedMeter::new(vec![0.9], vec![]);
        let state = ExposureState {
            last_duration: Some(Duration::from_secs(7)),
            ..ExposureState::default()
        };

        let (shot, next) = selector.select_and_capture(&mut meter, state).unwrap();

        assert_eq!(shot.mode, ExposureMode::Auto);
        assert!(shot.duration.is_none());
        assert_eq!(next.last_duration, Some(Duration::from_secs(7)));
        assert_eq!(next.mode, Some(ExposureMode::Auto));
        assert_eq!(meter.auto_captures, 1);
    }

    #[test]
    fn test_dark_scene_starts_manual_at_default_and_grows() {
        let selector = ExposureSelector::new(single_threshold());
        // Frame at 2s meters far under target: growth is capped at +50%.
        let mut meter = ScriptedMeter::new(vec![0.05], vec![0.02]);

        let (shot, next) = selector
            .select_and_capture(&mut meter, ExposureState::default())
            .unwrap();

        assert_eq!(shot.mode, ExposureMode::Manual);
        assert_eq!(shot.duration, Some(Duration::from_secs(2)));
        assert_eq!(next.last_duration, Some(Duration::from_secs(3)));
        assert_eq!(meter.manual_durations, vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_manual_uses_last_duration() {
        let selector = ExposureSelector::new(single_threshold());
        let mut meter = ScriptedMeter::new(vec![0.05], vec![0.25]);
        let state = ExposureState {
            mode: Some(ExposureMode::Manual),
            last_duration: Some(Duration::from_secs(5)),
            ..ExposureState::default()
        };

        let (shot, next) = selector.select_and_capture(&mut meter, state).unwrap();
        assert_eq!(shot.duration, Some(Duration::from_secs(5)));
        // On target: unchanged.
        assert_eq!(next.last_duration, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_growth_clamped_to_max() {
        let selector = ExposureSelector::new(single_threshold());
        let next = selector.next_duration(Duration::from_secs(25), 0.01);
        assert_eq!(next, Duration::from_secs(30));
    }

    #[test]
    fn test_overexposed_frame_shrinks_by_at_most_step_down() {
        let selector = ExposureSelector::new(single_threshold());
        let next = selector.next_duration(Duration::from_secs(10), 1.0);
        assert!((next.as_secs_f64() - 7.0).abs() < 1e-6, "got {next:?}");
    }

    #[test]
    fn test_shrink_clamped_to_min() {
        let selector = ExposureSelector::new(single_threshold());
        let next = selector.next_duration(Duration::from_millis(300), 1.0);
        assert_eq!(next, Duration::from_millis(250));
    }

    #[test]
    fn test_proportional_step_within_limits() {
        let selector = ExposureSelector::new(single_threshold());
        // 0.18 is outside the deadband and the ratio stays under the +50% cap.
        let next = selector.next_duration(Duration::from_secs(4), 0.18);
        let expected = 4.0 * 0.25 / 0.18;
        assert!((next.as_secs_f64() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_mode_switches_exactly_at_crossings() {
        let selector = ExposureSelector::new(single_threshold());
        let script = [0.9, 0.5, 0.31, 0.3, 0.29, 0.1, 0.29, 0.3, 0.8];
        let expected = [
            ExposureMode::Auto,
            ExposureMode::Auto,
            ExposureMode::Auto,
            ExposureMode::Auto,
            ExposureMode::Manual,
            ExposureMode::Manual,
            ExposureMode::Manual,
            ExposureMode::Auto,
            ExposureMode::Auto,
        ];

        let mut meter = ScriptedMeter::new(script.to_vec(), vec![]);
        let mut state = ExposureState::default();
        for want in expected {
            let (shot, next) = selector.select_and_capture(&mut meter, state).unwrap();
            assert_eq!(shot.mode, want);
            state = next;
        }
    }

    #[test]
    fn test_hysteresis_band_holds_mode() {
        let config = ExposureConfig {
            manual_below: 0.2,
            auto_above: 0.6,
            ..single_threshold()
        };
        let selector = ExposureSelector::new(config);

        assert_eq!(
            selector.decide_mode(Some(ExposureMode::Auto), 0.4),
            ExposureMode::Auto
        );
        assert_eq!(
            selector.decide_mode(Some(ExposureMode::Manual), 0.4),
            ExposureMode::Manual
        );
        assert_eq!(
            selector.decide_mode(Some(ExposureMode::Manual), 0.6),
            ExposureMode::Auto
        );
        assert_eq!(
            selector.decide_mode(Some(ExposureMode::Auto), 0.19),
            ExposureMode::Manual
        );
    }

    #[test]
    fn test_sample_failure_fires_no_shutter() {
        let selector = ExposureSelector::new(single_threshold());
        let mut meter = ScriptedMeter::new(vec![], vec![]);

        let result = selector.select_and_capture(&mut meter, ExposureState::default());

        assert!(matches!(result, Err(Error::Capture(_))));
        assert_eq!(meter.shutter_releases(), 0);
    }

    #[test]
    fn test_failed_shutter_keeps_previous_mode() {
        struct JammedShutter;

        impl LightMeter for JammedShutter {
            fn sample_brightness(&mut self) -> Result<f64> {
                Ok(0.05)
            }

            fn capture_auto(&mut self) -> Result<Vec<u8>> {
                Err(Error::Capture("jammed".to_string()))
            }

            fn capture_manual(&mut self, _duration: Duration) -> Result<Vec<u8>> {
                Err(Error::Capture("jammed".to_string()))
            }
        }

        let selector = ExposureSelector::new(single_threshold());
        let state = ExposureState {
            mode: Some(ExposureMode::Auto),
            ..ExposureState::default()
        };

        let result = selector.select_and_capture(&mut JammedShutter, state);

        assert!(matches!(result, Err(Error::Capture(_))));
        // The caller's state is what the next cycle starts from.
        assert_eq!(state.mode, Some(ExposureMode::Auto));
    }

    #[test]
    fn test_converges_towards_target() {
        let selector = ExposureSelector::new(single_threshold());
        // Scene needs 8s to hit target; frame brightness = 0.25 * d / 8.
        let mut duration = Duration::from_secs(2);
        for _ in 0..10 {
            let measured = 0.25 * duration.as_secs_f64() / 8.0;
            duration = selector.next_duration(duration, measured);
        }
        let measured = 0.25 * duration.as_secs_f64() / 8.0;
        assert!((measured - 0.25).abs() < 0.05, "ended at {duration:?}");
    }

    #[test]
    fn test_readings_drive_successive_cycles() {
        let selector = ExposureSelector::new(single_threshold());
        let mut meter = ScriptedMeter::new(vec![0.05, 0.05], vec![0.02, 0.02]);

        let (_, state) = selector
            .select_and_capture(&mut meter, ExposureState::default())
            .unwrap();
        meter.advance_reading();
        let (shot, state) = selector.select_and_capture(&mut meter, state).unwrap();

        assert_eq!(shot.duration, Some(Duration::from_secs(3)));
        assert_eq!(
            state.last_duration,
            Some(Duration::from_secs_f64(4.5))
        );
    }
}

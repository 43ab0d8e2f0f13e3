//! Scripted light source for tests and bench runs without a camera.

use super::{LightMeter, render_grey_frame};
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::time::Duration;

const FRAME_SIZE: u32 = 32;
const FRAME_QUALITY: u8 = 90;

/// A camera whose scene brightness follows a script.
///
/// Each [`LightMeter::sample_brightness`] call advances the script by one
/// step (holding the last value, or wrapping when looping). Manual frames
/// come out as `scene × sensitivity × seconds`, so longer exposures brighten
/// the frame the way a real sensor would. Frames are real grey JPEGs, so the
/// default metering and the receiver's validation both apply to them.
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    script: Vec<f64>,
    cursor: usize,
    looping: bool,
    scene: f64,
    sensitivity: f64,
    shutter_count: u64,
    failing_shutters: BTreeSet<u64>,
}

impl SimulatedCamera {
    /// Creates a camera that walks through `script` once, then holds the last value.
    #[must_use]
    pub fn new(script: Vec<f64>) -> Self {
        let scene = script.first().copied().unwrap_or(0.5);
        Self {
            script,
            cursor: 0,
            looping: false,
            scene,
            sensitivity: 1.0,
            shutter_count: 0,
            failing_shutters: BTreeSet::new(),
        }
    }

    /// A looping day → dusk → night → dawn cycle, for `lapse run --simulate`.
    #[must_use]
    pub fn dusk() -> Self {
        let mut script = Vec::new();
        for step in 0..40_i32 {
            script.push(0.05f64.mul_add(-f64::from(step), 0.9).max(0.01));
        }
        script.extend(std::iter::repeat_n(0.01, 20));
        for step in 0..40_i32 {
            script.push(0.05f64.mul_add(f64::from(step), 0.01).min(0.9));
        }
        let mut camera = Self::new(script);
        camera.looping = true;
        camera
    }

    /// Sets the frame brightness produced per unit of scene brightness per second.
    #[must_use]
    pub const fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    /// Makes the `n`-th shutter release (1-based) fail.
    #[must_use]
    pub fn fail_shutter(mut self, n: u64) -> Self {
        self.failing_shutters.insert(n);
        self
    }

    /// Number of shutter releases so far, failed ones included.
    #[must_use]
    pub const fn shutter_count(&self) -> u64 {
        self.shutter_count
    }

    /// Brightness of the current scene.
    #[must_use]
    pub const fn scene(&self) -> f64 {
        self.scene
    }

    fn release_shutter(&mut self) -> Result<()> {
        self.shutter_count += 1;
        if self.failing_shutters.contains(&self.shutter_count) {
            return Err(Error::Capture(format!(
                "simulated shutter failure on release {}",
                self.shutter_count
            )));
        }
        Ok(())
    }
}

impl LightMeter for SimulatedCamera {
    fn sample_brightness(&mut self) -> Result<f64> {
        if self.script.is_empty() {
            return Ok(self.scene);
        }
        let index = if self.looping {
            self.cursor % self.script.len()
        } else {
            self.cursor.min(self.script.len() - 1)
        };
        self.scene = self.script[index];
        self.cursor += 1;
        Ok(self.scene)
    }

    fn capture_auto(&mut self) -> Result<Vec<u8>> {
        self.release_shutter()?;
        render_grey_frame(self.scene.clamp(0.02, 0.98), FRAME_SIZE, FRAME_QUALITY)
    }

    fn capture_manual(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.release_shutter()?;
        let luma = self.scene * self.sensitivity * duration.as_secs_f64();
        render_grey_frame(luma, FRAME_SIZE, FRAME_QUALITY)
    }
}

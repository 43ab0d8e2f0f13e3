//! Camera and light-meter capability.
//!
//! The selector never talks to a driver directly; it sees a [`LightMeter`]
//! that can sample scene brightness, fire the shutter in either exposure
//! mode, and meter a captured frame. Real hardware and the simulated light
//! source both sit behind this trait.

mod rpicam;
mod simulated;

pub use rpicam::RpicamCamera;
pub use simulated::SimulatedCamera;

use crate::{Error, Result};
use image::ImageFormat;
use image::imageops::FilterType;
use std::time::Duration;

/// Side length of the thumbnail used for frame metering.
const METER_SIZE: u32 = 100;

/// Camera capability used by the exposure selector.
pub trait LightMeter: Send {
    /// Returns current scene brightness, normalized to `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] if the camera cannot be read.
    fn sample_brightness(&mut self) -> Result<f64>;

    /// Fires the shutter using the camera's built-in auto-exposure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] if no frame was produced.
    fn capture_auto(&mut self) -> Result<Vec<u8>>;

    /// Fires the shutter with an explicit exposure duration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] if no frame was produced.
    fn capture_manual(&mut self, duration: Duration) -> Result<Vec<u8>>;

    /// Meters a captured frame, normalized to `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capture`] if the frame cannot be decoded.
    fn measure_frame(&self, frame: &[u8]) -> Result<f64> {
        frame_brightness(frame)
    }
}

impl<T: LightMeter + ?Sized> LightMeter for Box<T> {
    fn sample_brightness(&mut self) -> Result<f64> {
        (**self).sample_brightness()
    }

    fn capture_auto(&mut self) -> Result<Vec<u8>> {
        (**self).capture_auto()
    }

    fn capture_manual(&mut self, duration: Duration) -> Result<Vec<u8>> {
        (**self).capture_manual(duration)
    }

    fn measure_frame(&self, frame: &[u8]) -> Result<f64> {
        (**self).measure_frame(frame)
    }
}

/// Mean luma of a JPEG frame, normalized to `0.0..=1.0`.
///
/// The frame is downscaled to a 100×100 grayscale thumbnail first, which is
/// plenty for exposure control and keeps metering cheap on small boards.
///
/// # Errors
///
/// Returns [`Error::Capture`] if the bytes are not a decodable JPEG.
pub fn frame_brightness(frame: &[u8]) -> Result<f64> {
    let image = image::load_from_memory_with_format(frame, ImageFormat::Jpeg)
        .map_err(|e| Error::Capture(format!("cannot decode frame for metering: {e}")))?;
    let thumb = image
        .resize_exact(METER_SIZE, METER_SIZE, FilterType::Triangle)
        .to_luma8();

    let pixels = thumb.as_raw();
    if pixels.is_empty() {
        return Err(Error::Capture("frame has no pixels".to_string()));
    }
    let sum: u64 = pixels.iter().map(|&p| u64::from(p)).sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = sum as f64 / pixels.len() as f64;
    Ok(mean / 255.0)
}

/// Encodes a flat grey JPEG at the given normalized brightness.
pub(crate) fn render_grey_frame(luma: f64, size: u32, quality: u8) -> Result<Vec<u8>> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = (luma.clamp(0.0, 1.0) * 255.0).round() as u8;
    let frame = image::GrayImage::from_pixel(size, size, image::Luma([value]));

    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&frame)
        .map_err(|e| Error::Capture(format!("cannot encode frame: {e}")))?;
    Ok(out)
}

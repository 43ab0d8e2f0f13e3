//! Raspberry Pi camera driver backed by `rpicam-still`.
//!
//! Each call spawns one `rpicam-still` process that writes a JPEG to
//! stdout. Scene brightness is sampled from a small auto-exposed frame, which
//! saturates dark when auto-exposure runs out of range; that is exactly the
//! condition the selector reacts to.

use super::LightMeter;
use crate::config::CameraConfig;
use crate::{Error, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Resolution of the metering frame.
const SAMPLE_WIDTH: u32 = 320;
const SAMPLE_HEIGHT: u32 = 240;

/// Poll interval while waiting for the capture process.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// What a single `rpicam-still` invocation should produce.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Still {
    /// Low-resolution auto-exposed frame for metering.
    Sample,
    /// Full-resolution auto-exposed frame.
    Auto,
    /// Full-resolution frame with a fixed shutter time.
    Manual(Duration),
}

/// Camera driven through the `rpicam-still` command-line tool.
#[derive(Debug, Clone)]
pub struct RpicamCamera {
    config: CameraConfig,
}

impl RpicamCamera {
    /// Creates a driver for the given camera settings.
    #[must_use]
    pub const fn new(config: CameraConfig) -> Self {
        Self { config }
    }

    /// Builds the argument list for one still.
    fn still_args(&self, still: Still) -> Vec<String> {
        let mut args = vec![
            "--nopreview".to_string(),
            "--immediate".to_string(),
            "--encoding".to_string(),
            "jpg".to_string(),
            "--output".to_string(),
            "-".to_string(),
        ];

        let (width, height) = match still {
            Still::Sample => (SAMPLE_WIDTH, SAMPLE_HEIGHT),
            Still::Auto | Still::Manual(_) => (self.config.width, self.config.height),
        };
        args.extend([
            "--width".to_string(),
            width.to_string(),
            "--height".to_string(),
            height.to_string(),
            "--quality".to_string(),
            self.config.quality.to_string(),
        ]);

        if self.config.rotation == 180 {
            args.extend(["--rotation".to_string(), "180".to_string()]);
        }

        match still {
            Still::Sample => {},
            Still::Auto => {
                if self.config.autofocus {
                    args.push("--autofocus-on-capture".to_string());
                }
            },
            Still::Manual(duration) => {
                args.extend([
                    "--shutter".to_string(),
                    duration.as_micros().to_string(),
                    "--gain".to_string(),
                    format!("{}", self.config.manual_gain),
                    "--autofocus-mode".to_string(),
                    "manual".to_string(),
                ]);
            },
        }

        args
    }

    /// How long one still may take before it is abandoned.
    fn deadline_for(&self, still: Still) -> Duration {
        let exposure = match still {
            Still::Manual(duration) => duration,
            Still::Sample | Still::Auto => Duration::ZERO,
        };
        exposure + self.config.capture_slack
    }

    /// Runs `rpicam-still` and returns the JPEG it wrote to stdout.
    fn run_still(&self, still: Still) -> Result<Vec<u8>> {
        let args = self.still_args(still);
        tracing::debug!(command = %self.config.command, ?args, "Running still capture");

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Capture(format!("cannot start {}: {e}", self.config.command)))?;

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let status = wait_with_deadline(&mut child, self.deadline_for(still))?;
        let frame = stdout
            .join()
            .map_err(|_| Error::Capture("stdout reader panicked".to_string()))?;
        let diagnostics = stderr.join().unwrap_or_default();

        if !status.success() {
            let tail = String::from_utf8_lossy(&diagnostics);
            let tail = tail.lines().last().unwrap_or("no diagnostics");
            return Err(Error::Capture(format!(
                "{} exited with {status}: {tail}",
                self.config.command
            )));
        }
        if frame.is_empty() {
            return Err(Error::Capture(format!(
                "{} produced an empty frame",
                self.config.command
            )));
        }
        Ok(frame)
    }
}

impl LightMeter for RpicamCamera {
    fn sample_brightness(&mut self) -> Result<f64> {
        let frame = self.run_still(Still::Sample)?;
        self.measure_frame(&frame)
    }

    fn capture_auto(&mut self) -> Result<Vec<u8>> {
        self.run_still(Still::Auto)
    }

    fn capture_manual(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.run_still(Still::Manual(duration))
    }
}

/// Reads a child pipe to completion on a helper thread.
///
/// Both pipes must be drained while waiting, otherwise a full pipe buffer
/// blocks the child and the deadline fires for no reason.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Waits for the child, killing it once `deadline` has passed.
fn wait_with_deadline(child: &mut Child, deadline: Duration) -> Result<std::process::ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if start.elapsed() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Capture(format!(
                    "capture did not finish within {deadline:?}"
                )));
            },
            Ok(None) => thread::sleep(WAIT_POLL),
            Err(e) => return Err(Error::Capture(format!("cannot wait for capture: {e}"))),
        }
    }
}

//! Configuration management.
//!
//! The agent reads one TOML file at startup, overlays a handful of
//! environment variables, validates the result and never touches it again.
//! Every key is optional; missing keys take the defaults below.

mod receiver;

pub use receiver::{DeviceConfig, ReceiverConfig};

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default sanity epoch: frames stamped earlier than this came from an
/// unset real-time clock.
pub const DEFAULT_CLOCK_SANITY_EPOCH_SECS: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

/// Main configuration for the capture agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Device identifier embedded in filenames and upload headers.
    pub device_id: String,
    /// Directory holding the spool database.
    pub data_dir: PathBuf,
    /// Timestamps before this instant are treated as an unset clock.
    pub clock_sanity_epoch: DateTime<Utc>,
    /// Capture cadence.
    pub capture: CaptureConfig,
    /// Exposure selection and feedback tuning.
    pub exposure: ExposureConfig,
    /// Upload endpoint and retry policy.
    pub upload: UploadConfig,
    /// Camera driver settings.
    pub camera: CameraConfig,
    /// Logging output.
    pub logging: LoggingSettings,
    /// Prometheus exporter.
    pub metrics: MetricsSettings,
    /// Receiver (`lapse serve`) settings.
    pub receiver: ReceiverConfig,
}

/// Capture cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Start-to-start interval between captures.
    pub interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Exposure selection and feedback tuning.
///
/// Brightness values are normalized mean luma in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureConfig {
    /// In auto mode, drop to manual when the scene is darker than this.
    pub manual_below: f64,
    /// In manual mode, return to auto once the scene is at least this bright.
    pub auto_above: f64,
    /// Brightness the manual feedback loop steers frames towards.
    pub target: f64,
    /// No adjustment while a frame is within `target ± deadband`.
    pub deadband: f64,
    /// Largest increase per cycle, as a fraction of the current duration.
    pub step_up: f64,
    /// Largest decrease per cycle, as a fraction of the current duration.
    pub step_down: f64,
    /// First manual duration when no previous one is known.
    pub default_duration: Duration,
    /// Lower bound for manual durations.
    pub min_duration: Duration,
    /// Upper bound for manual durations.
    pub max_duration: Duration,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            manual_below: 48.0 / 255.0,
            auto_above: 155.0 / 255.0,
            target: 64.0 / 255.0,
            deadband: 24.0 / 255.0,
            step_up: 0.9,
            step_down: 0.3,
            default_duration: Duration::from_secs(2),
            min_duration: Duration::from_millis(250),
            max_duration: Duration::from_secs(112),
        }
    }
}

impl ExposureConfig {
    /// Checks threshold ordering and duration bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.manual_below) || !unit.contains(&self.auto_above) {
            return Err(Error::InvalidInput(
                "exposure thresholds must lie within 0.0..=1.0".to_string(),
            ));
        }
        if self.auto_above < self.manual_below {
            return Err(Error::InvalidInput(format!(
                "exposure.auto_above ({}) must not be below exposure.manual_below ({})",
                self.auto_above, self.manual_below
            )));
        }
        if !(self.target > 0.0 && self.target < 1.0) {
            return Err(Error::InvalidInput(
                "exposure.target must lie strictly between 0.0 and 1.0".to_string(),
            ));
        }
        if !(self.deadband >= 0.0 && self.deadband.is_finite()) {
            return Err(Error::InvalidInput(
                "exposure.deadband must be non-negative".to_string(),
            ));
        }
        if !(self.step_up > 0.0 && self.step_up.is_finite()) {
            return Err(Error::InvalidInput(
                "exposure.step_up must be positive".to_string(),
            ));
        }
        if !(self.step_down > 0.0 && self.step_down < 1.0) {
            return Err(Error::InvalidInput(
                "exposure.step_down must lie strictly between 0.0 and 1.0".to_string(),
            ));
        }
        if self.min_duration.is_zero() || self.min_duration > self.max_duration {
            return Err(Error::InvalidInput(
                "exposure durations need 0 < min_duration <= max_duration".to_string(),
            ));
        }
        if self.default_duration < self.min_duration || self.default_duration > self.max_duration
        {
            return Err(Error::InvalidInput(
                "exposure.default_duration must lie within [min_duration, max_duration]"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Upload endpoint and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Base URL of the receiver; frames are posted to `{endpoint}/upload`.
    pub endpoint: String,
    /// Per-request timeout. Mandatory so a stalled connection cannot wedge the loop.
    pub timeout: Duration,
    /// First backoff delay after a transient failure.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive backoff delays.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// How long the idle client waits for new frames before re-checking.
    pub idle_poll: Duration,
    /// Permits plain `http://` endpoints (tests, lab setups behind a tunnel).
    pub allow_insecure_http: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost:8443".to_string(),
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            idle_poll: Duration::from_secs(1),
            allow_insecure_http: false,
        }
    }
}

impl UploadConfig {
    /// Checks the endpoint scheme and the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unparsable or insecure endpoints and
    /// for a backoff policy that does not grow.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.endpoint).map_err(|e| {
            Error::InvalidInput(format!("upload.endpoint '{}': {e}", self.endpoint))
        })?;
        match url.scheme() {
            "https" => {},
            "http" if self.allow_insecure_http => {},
            "http" => {
                return Err(Error::InvalidInput(format!(
                    "upload.endpoint '{}' is not https; set upload.allow_insecure_http to permit it",
                    self.endpoint
                )));
            },
            other => {
                return Err(Error::InvalidInput(format!(
                    "upload.endpoint scheme '{other}' is not supported"
                )));
            },
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput(
                "upload.timeout_secs must be positive".to_string(),
            ));
        }
        if !(self.backoff_multiplier > 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(Error::InvalidInput(
                "upload.backoff_multiplier must be greater than 1.0".to_string(),
            ));
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff {
            return Err(Error::InvalidInput(
                "upload backoff needs 0 < initial_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which camera implementation drives the light meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraDriver {
    /// `rpicam-still` from the Raspberry Pi camera stack.
    #[default]
    Rpicam,
    /// Scripted dusk-to-night light source.
    Simulated,
}

impl CameraDriver {
    /// Parses a driver name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rpicam" | "libcamera" => Ok(Self::Rpicam),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(Error::InvalidInput(format!(
                "unknown camera driver: {other}"
            ))),
        }
    }
}

/// Camera driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    /// Driver selection.
    pub driver: CameraDriver,
    /// Capture command for the `rpicam` driver.
    pub command: String,
    /// Still width in pixels.
    pub width: u32,
    /// Still height in pixels.
    pub height: u32,
    /// JPEG quality (1-100).
    pub quality: u8,
    /// Sensor rotation; `rpicam-still` accepts 0 or 180.
    pub rotation: u16,
    /// Analogue gain applied in manual mode.
    pub manual_gain: f64,
    /// Run an autofocus cycle before each auto-exposed frame.
    pub autofocus: bool,
    /// Extra time allowed on top of the exposure before a capture is abandoned.
    pub capture_slack: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            driver: CameraDriver::Rpicam,
            command: "rpicam-still".to_string(),
            width: 4608,
            height: 2592,
            quality: 95,
            rotation: 180,
            manual_gain: 16.0,
            autofocus: true,
            capture_slack: Duration::from_secs(20),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Output format.
    pub format: LogFormat,
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Optional append-mode log file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSettings {
    /// Whether to install the exporter.
    pub enabled: bool,
    /// Listen port of the scrape endpoint.
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9464,
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Device identifier.
    pub device_id: Option<String>,
    /// Data directory.
    pub data_dir: Option<String>,
    /// RFC 3339 sanity epoch.
    pub clock_sanity_epoch: Option<String>,
    /// Capture section.
    pub capture: Option<ConfigFileCapture>,
    /// Exposure section.
    pub exposure: Option<ConfigFileExposure>,
    /// Upload section.
    pub upload: Option<ConfigFileUpload>,
    /// Camera section.
    pub camera: Option<ConfigFileCamera>,
    /// Logging section.
    pub logging: Option<ConfigFileLogging>,
    /// Metrics section.
    pub metrics: Option<ConfigFileMetrics>,
    /// Receiver section.
    pub receiver: Option<receiver::ConfigFileReceiver>,
}

/// Capture section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileCapture {
    /// Interval in seconds.
    pub interval_secs: Option<f64>,
}

/// Exposure section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileExposure {
    /// Enter-manual threshold.
    pub manual_below: Option<f64>,
    /// Return-to-auto threshold.
    pub auto_above: Option<f64>,
    /// Target brightness.
    pub target: Option<f64>,
    /// Deadband around the target.
    pub deadband: Option<f64>,
    /// Max growth fraction.
    pub step_up: Option<f64>,
    /// Max shrink fraction.
    pub step_down: Option<f64>,
    /// Default manual duration (seconds).
    pub default_duration_secs: Option<f64>,
    /// Minimum manual duration (seconds).
    pub min_duration_secs: Option<f64>,
    /// Maximum manual duration (seconds).
    pub max_duration_secs: Option<f64>,
}

/// Upload section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileUpload {
    /// Receiver base URL.
    pub endpoint: Option<String>,
    /// Request timeout (seconds).
    pub timeout_secs: Option<u64>,
    /// First backoff delay (milliseconds).
    pub initial_backoff_ms: Option<u64>,
    /// Backoff growth factor.
    pub backoff_multiplier: Option<f64>,
    /// Backoff ceiling (milliseconds).
    pub max_backoff_ms: Option<u64>,
    /// Idle poll interval (milliseconds).
    pub idle_poll_ms: Option<u64>,
    /// Permit `http://` endpoints.
    pub allow_insecure_http: Option<bool>,
}

/// Camera section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileCamera {
    /// Driver name.
    pub driver: Option<String>,
    /// Capture command.
    pub command: Option<String>,
    /// Width in pixels.
    pub width: Option<u32>,
    /// Height in pixels.
    pub height: Option<u32>,
    /// JPEG quality.
    pub quality: Option<u8>,
    /// Rotation in degrees.
    pub rotation: Option<u16>,
    /// Manual analogue gain.
    pub manual_gain: Option<f64>,
    /// Autofocus before auto frames.
    pub autofocus: Option<bool>,
    /// Capture slack (seconds).
    pub capture_slack_secs: Option<u64>,
}

/// Logging section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileLogging {
    /// `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive.
    pub level: Option<String>,
    /// Log file path.
    pub file: Option<String>,
}

/// Metrics section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileMetrics {
    /// Install the exporter.
    pub enabled: Option<bool>,
    /// Scrape port.
    pub port: Option<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "01".to_string(),
            data_dir: PathBuf::from(".lapse"),
            clock_sanity_epoch: Utc
                .timestamp_opt(DEFAULT_CLOCK_SANITY_EPOCH_SECS, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            capture: CaptureConfig::default(),
            exposure: ExposureConfig::default(),
            upload: UploadConfig::default(),
            camera: CameraConfig::default(),
            logging: LoggingSettings::default(),
            metrics: MetricsSettings::default(),
            receiver: ReceiverConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::operation("read_config_file", format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from TOML text, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or validated.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| Error::operation("parse_config_file", e))?;
        let mut config = Self::from_config_file(file)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks `LAPSE_CONFIG_PATH`, then `<config_dir>/lapse/config.toml`.
    /// Returns defaults (plus environment overrides) when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but is invalid.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var("LAPSE_CONFIG_PATH") {
            if !path.trim().is_empty() {
                return Self::load_from_file(Path::new(&path));
            }
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "lapse") {
            let path = dirs.config_dir().join("config.toml");
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlays `LAPSE_*` variables read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LAPSE_DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = lookup("LAPSE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LAPSE_ENDPOINT") {
            self.upload.endpoint = v;
        }
        if let Some(interval) = lookup("LAPSE_INTERVAL_SECS")
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        {
            self.capture.interval = interval;
        }
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_device_id(&self.device_id) {
            return Err(Error::InvalidInput(format!(
                "device_id '{}' must be 1-32 characters of [A-Za-z0-9-]",
                self.device_id
            )));
        }
        if self.capture.interval.is_zero() {
            return Err(Error::InvalidInput(
                "capture.interval_secs must be positive".to_string(),
            ));
        }
        if !matches!(self.camera.rotation, 0 | 180) {
            return Err(Error::InvalidInput(format!(
                "camera.rotation {} is not supported (use 0 or 180)",
                self.camera.rotation
            )));
        }
        if !(1..=100).contains(&self.camera.quality) {
            return Err(Error::InvalidInput(
                "camera.quality must lie within 1..=100".to_string(),
            ));
        }
        self.exposure.validate()?;
        self.upload.validate()?;
        self.receiver.validate()
    }

    /// Path of the spool database.
    #[must_use]
    pub fn spool_path(&self) -> PathBuf {
        self.data_dir.join("spool.db")
    }

    /// Converts a `ConfigFile` to `AgentConfig`.
    fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = Self::default();

        if let Some(device_id) = file.device_id {
            config.device_id = device_id;
        }
        if let Some(data_dir) = file.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(epoch) = file.clock_sanity_epoch {
            config.clock_sanity_epoch = DateTime::parse_from_rfc3339(&epoch)
                .map_err(|e| Error::InvalidInput(format!("clock_sanity_epoch '{epoch}': {e}")))?
                .with_timezone(&Utc);
        }
        if let Some(capture) = file.capture {
            if let Some(secs) = capture.interval_secs {
                config.capture.interval = secs_to_duration("capture.interval_secs", secs)?;
            }
        }
        if let Some(exposure) = file.exposure {
            apply_exposure(&mut config.exposure, exposure)?;
        }
        if let Some(upload) = file.upload {
            apply_upload(&mut config.upload, upload);
        }
        if let Some(camera) = file.camera {
            apply_camera(&mut config.camera, camera)?;
        }
        if let Some(logging) = file.logging {
            if let Some(format) = logging.format {
                config.logging.format = match format.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" | "text" => LogFormat::Pretty,
                    other => {
                        return Err(Error::InvalidInput(format!("unknown log format: {other}")));
                    },
                };
            }
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            config.logging.file = logging.file.map(PathBuf::from);
        }
        if let Some(metrics) = file.metrics {
            if let Some(enabled) = metrics.enabled {
                config.metrics.enabled = enabled;
            }
            if let Some(port) = metrics.port {
                config.metrics.port = port;
            }
        }
        if let Some(receiver) = file.receiver {
            config.receiver = ReceiverConfig::from_config_file(receiver)?;
        }

        Ok(config)
    }
}

fn apply_exposure(exposure: &mut ExposureConfig, file: ConfigFileExposure) -> Result<()> {
    if let Some(v) = file.manual_below {
        exposure.manual_below = v;
    }
    if let Some(v) = file.auto_above {
        exposure.auto_above = v;
    }
    if let Some(v) = file.target {
        exposure.target = v;
    }
    if let Some(v) = file.deadband {
        exposure.deadband = v;
    }
    if let Some(v) = file.step_up {
        exposure.step_up = v;
    }
    if let Some(v) = file.step_down {
        exposure.step_down = v;
    }
    if let Some(v) = file.default_duration_secs {
        exposure.default_duration = secs_to_duration("exposure.default_duration_secs", v)?;
    }
    if let Some(v) = file.min_duration_secs {
        exposure.min_duration = secs_to_duration("exposure.min_duration_secs", v)?;
    }
    if let Some(v) = file.max_duration_secs {
        exposure.max_duration = secs_to_duration("exposure.max_duration_secs", v)?;
    }
    Ok(())
}

fn apply_upload(upload: &mut UploadConfig, file: ConfigFileUpload) {
    if let Some(v) = file.endpoint {
        upload.endpoint = v;
    }
    if let Some(v) = file.timeout_secs {
        upload.timeout = Duration::from_secs(v);
    }
    if let Some(v) = file.initial_backoff_ms {
        upload.initial_backoff = Duration::from_millis(v);
    }
    if let Some(v) = file.backoff_multiplier {
        upload.backoff_multiplier = v;
    }
    if let Some(v) = file.max_backoff_ms {
        upload.max_backoff = Duration::from_millis(v);
    }
    if let Some(v) = file.idle_poll_ms {
        upload.idle_poll = Duration::from_millis(v);
    }
    if let Some(v) = file.allow_insecure_http {
        upload.allow_insecure_http = v;
    }
}

fn apply_camera(camera: &mut CameraConfig, file: ConfigFileCamera) -> Result<()> {
    if let Some(v) = file.driver {
        camera.driver = CameraDriver::parse(&v)?;
    }
    if let Some(v) = file.command {
        camera.command = v;
    }
    if let Some(v) = file.width {
        camera.width = v;
    }
    if let Some(v) = file.height {
        camera.height = v;
    }
    if let Some(v) = file.quality {
        camera.quality = v;
    }
    if let Some(v) = file.rotation {
        camera.rotation = v;
    }
    if let Some(v) = file.manual_gain {
        camera.manual_gain = v;
    }
    if let Some(v) = file.autofocus {
        camera.autofocus = v;
    }
    if let Some(v) = file.capture_slack_secs {
        camera.capture_slack = Duration::from_secs(v);
    }
    Ok(())
}

fn secs_to_duration(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::InvalidInput(format!("{key} = {secs}: {e}")))
}

/// Device ids end up in filenames and directory names on the receiver.
#[must_use]
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

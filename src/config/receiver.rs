//! Receiver (`lapse serve`) configuration.

use super::is_valid_device_id;
use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_MAX_FILE_SIZE_MB: f64 = 16.0;

/// One device the receiver accepts frames from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device identifier sent in `X-Device-Id`.
    pub device_id: String,
    /// Largest accepted frame.
    pub max_file_size_bytes: usize,
}

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Listen address.
    pub listen: SocketAddr,
    /// Root directory; frames land in `{root}/{device_id}/{filename}`.
    pub root: PathBuf,
    /// Known devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            root: PathBuf::from("uploads"),
            devices: vec![DeviceConfig {
                device_id: "01".to_string(),
                max_file_size_bytes: mb_to_bytes(DEFAULT_MAX_FILE_SIZE_MB),
            }],
        }
    }
}

impl ReceiverConfig {
    /// Looks up a device by id.
    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Checks device ids and size limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for malformed or duplicate devices.
    pub fn validate(&self) -> Result<()> {
        for (i, device) in self.devices.iter().enumerate() {
            if !is_valid_device_id(&device.device_id) {
                return Err(Error::InvalidInput(format!(
                    "receiver device_id '{}' must be 1-32 characters of [A-Za-z0-9-]",
                    device.device_id
                )));
            }
            if device.max_file_size_bytes == 0 {
                return Err(Error::InvalidInput(format!(
                    "receiver device '{}' needs a positive max_file_size_mb",
                    device.device_id
                )));
            }
            if self.devices[..i]
                .iter()
                .any(|d| d.device_id == device.device_id)
            {
                return Err(Error::InvalidInput(format!(
                    "receiver device '{}' is listed twice",
                    device.device_id
                )));
            }
        }
        Ok(())
    }

    pub(super) fn from_config_file(file: ConfigFileReceiver) -> Result<Self> {
        let mut config = Self::default();
        if let Some(listen) = file.listen {
            config.listen = listen
                .parse()
                .map_err(|e| Error::InvalidInput(format!("receiver.listen '{listen}': {e}")))?;
        }
        if let Some(root) = file.root {
            config.root = PathBuf::from(root);
        }
        if let Some(devices) = file.devices {
            config.devices = devices
                .into_iter()
                .map(|d| DeviceConfig {
                    device_id: d.device_id,
                    max_file_size_bytes: mb_to_bytes(
                        d.max_file_size_mb.unwrap_or(DEFAULT_MAX_FILE_SIZE_MB),
                    ),
                })
                .collect();
        }
        Ok(config)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mb_to_bytes(mb: f64) -> usize {
    (mb.max(0.0) * 1024.0 * 1024.0) as usize
}

/// Receiver section in config file.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileReceiver {
    /// Listen address.
    pub listen: Option<String>,
    /// Storage root.
    pub root: Option<String>,
    /// Known devices.
    pub devices: Option<Vec<ConfigFileDevice>>,
}

/// Device entry in config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileDevice {
    /// Device identifier.
    pub device_id: String,
    /// Size limit in MiB.
    pub max_file_size_mb: Option<f64>,
}

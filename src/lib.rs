pub mod capture;
pub mod device;
pub mod error;
pub mod image;
pub mod parallel;
pub mod pipeline;
pub mod property;
pub mod transform;
pub mod usb;

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub usb: UsbConfig,
    pub stream: StreamConfig,
    pub parallel: ParallelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Upper bound of one event loop wait, bounds stop latency
    pub event_timeout_ms: u64,
    /// Bulk transfer timeout, 0 waits forever
    pub transfer_timeout_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub buffer_count: usize,
    /// Bulk transfers kept in flight (AFU420)
    pub transfer_count: usize,
    /// Bytes per bulk transfer (AFU420)
    pub transfer_size: usize,
    /// Largest accepted JPEG frame (AFU050)
    pub jpeg_buffer_size: usize,
    /// Consecutive failed transfers before the device counts as lost
    pub lost_countdown: u32,
    pub drop_incomplete_frames: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Strips per split transform, 0 uses the logical CPU count
    pub max_concurrency: usize,
    pub pin_workers: bool,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: usb::VENDOR_ID,
            product_id: usb::PRODUCT_ID_AFU420,
            event_timeout_ms: 1000,
            transfer_timeout_ms: 0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_count: 10,
            transfer_count: 12,
            transfer_size: 1024 * 1024,
            jpeg_buffer_size: capture::jpeg::JPEGBUF_SIZE,
            lost_countdown: 20,
            drop_incomplete_frames: true,
        }
    }
}

/// Reads `path` (optional) and `TCAM_*` environment overrides on top of the
/// defaults, e.g. `TCAM_STREAM__BUFFER_COUNT=4`
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?);
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    let config = builder
        .add_source(
            config::Environment::with_prefix("TCAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    Ok(config)
}

/// Publishes `config` as the active configuration
pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/tcam-usb.toml"))).unwrap();
        assert_eq!(config.stream.buffer_count, 10);
        assert_eq!(config.stream.lost_countdown, 20);
        assert_eq!(config.usb.vendor_id, 0x199e);
        assert_eq!(config.usb.event_timeout_ms, 1000);
    }
}

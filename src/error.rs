//! Error types shared by the device and configuration layers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// libusb returned a negative status code outside of rusb's wrappers
    #[error("libusb transfer call failed with code {0}")]
    Transfer(i32),

    #[error("stream is already running")]
    StreamRunning,

    #[error("stream is not running")]
    StreamNotRunning,

    #[error("unsupported video format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported bit depth: {0}")]
    InvalidBitDepth(u32),

    #[error("no matching device found (vendor {vendor_id:04x}, product {product_id:04x})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("device lost")]
    DeviceLost,

    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("property '{0}' is read only")]
    ReadOnly(String),

    #[error("value out of range for property '{0}'")]
    OutOfRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

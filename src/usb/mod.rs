//! libusb glue: context with its event thread, device handles, async bulk transfers

pub mod device;
pub mod session;
pub mod transfer;

pub use device::UsbDevice;
pub use session::UsbSession;
pub use transfer::BulkStream;

/// The Imaging Source vendor id
pub const VENDOR_ID: u16 = 0x199e;
pub const PRODUCT_ID_AFU050: u16 = 0x8209;
pub const PRODUCT_ID_AFU420: u16 = 0x0804;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusb::{request_type, Context, Device, DeviceHandle, Direction, Recipient, RequestType, Speed};
use tracing::{debug, warn};

use super::session::UsbSession;
use crate::error::{Error, Result};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// UVC `SET_CUR`
const UVC_SET_CUR: u8 = 0x01;

/// An opened USB device and the interfaces claimed on it
pub struct UsbDevice {
    handle: Mutex<DeviceHandle<Context>>,
    device: Device<Context>,
    claimed: Mutex<Vec<u8>>,
    // Declared last so the handle is closed before the event thread stops
    session: Arc<UsbSession>,
}

impl UsbDevice {
    pub fn open(session: &Arc<UsbSession>, vendor_id: u16, product_id: u16) -> Result<Self> {
        let (device, handle) = session.open_device(vendor_id, product_id)?;
        Ok(Self {
            handle: Mutex::new(handle),
            device,
            claimed: Mutex::new(Vec::new()),
            session: session.clone(),
        })
    }

    fn handle(&self) -> MutexGuard<'_, DeviceHandle<Context>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &Arc<UsbSession> {
        &self.session
    }

    /// Detaches a kernel driver if one is bound and claims `interface`
    pub fn open_interface(&self, interface: u8) -> Result<()> {
        if let Ok(true) = self.handle().kernel_driver_active(interface) {
            debug!("Detaching kernel driver from interface {}", interface);
            self.handle().detach_kernel_driver(interface)?;
        }
        self.handle().claim_interface(interface)?;
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interface);
        Ok(())
    }

    pub fn is_superspeed(&self) -> bool {
        matches!(self.device.speed(), Speed::Super | Speed::SuperPlus)
    }

    /// Max packet size of `endpoint` in the active configuration
    pub fn max_packet_size(&self, endpoint: u8) -> Result<u16> {
        let config = self.device.active_config_descriptor()?;
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                for ep in desc.endpoint_descriptors() {
                    if ep.address() == endpoint {
                        return Ok(ep.max_packet_size());
                    }
                }
            }
        }
        Err(Error::Usb(rusb::Error::NotFound))
    }

    /// Host to device vendor request
    pub fn vendor_write(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        let rt = request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        Ok(self
            .handle()
            .write_control(rt, request, value, index, data, CONTROL_TIMEOUT)?)
    }

    /// Device to host vendor request
    pub fn vendor_read(&self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let rt = request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        Ok(self
            .handle()
            .read_control(rt, request, value, index, buf, CONTROL_TIMEOUT)?)
    }

    /// UVC class `SET_CUR` of control `selector` on `interface`
    pub fn class_set_cur(&self, interface: u8, selector: u8, data: &[u8]) -> Result<usize> {
        let rt = request_type(Direction::Out, RequestType::Class, Recipient::Interface);
        let value = u16::from(selector) << 8;
        Ok(self.handle().write_control(
            rt,
            UVC_SET_CUR,
            value,
            u16::from(interface),
            data,
            CONTROL_TIMEOUT,
        )?)
    }

    /// Clears a halt/stall condition on `endpoint`
    pub fn halt_endpoint(&self, endpoint: u8) -> Result<()> {
        self.handle().clear_halt(endpoint)?;
        Ok(())
    }

    pub(crate) fn raw_handle(&self) -> *mut rusb::ffi::libusb_device_handle {
        self.handle().as_raw()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        let claimed = std::mem::take(&mut *self.claimed.lock().unwrap_or_else(PoisonError::into_inner));
        for interface in claimed {
            if let Err(e) = self.handle().release_interface(interface) {
                warn!("Releasing interface {} failed: {}", interface, e);
            }
        }
    }
}

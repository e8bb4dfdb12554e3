use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A libusb context plus the thread that dispatches its transfer callbacks.
///
/// Every completion callback of every stream opened through this session runs
/// on the event thread. The thread wakes up at least every `event_timeout` to
/// observe shutdown.
pub struct UsbSession {
    context: Context,
    running: Arc<AtomicBool>,
    event_thread: Option<JoinHandle<()>>,
}

impl UsbSession {
    pub fn new(event_timeout: Duration) -> Result<Self> {
        let context = Context::new()?;
        let running = Arc::new(AtomicBool::new(true));

        let event_thread = {
            let context = context.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("tcam-usb-events".into())
                .spawn(move || {
                    debug!("USB event thread started");
                    while running.load(Ordering::Acquire) {
                        match context.handle_events(Some(event_timeout)) {
                            Ok(()) | Err(rusb::Error::Interrupted) => {}
                            Err(e) => warn!("Handling USB events failed: {}", e),
                        }
                    }
                    debug!("USB event thread finished");
                })?
        };

        info!("USB session ready");
        Ok(Self {
            context,
            running,
            event_thread: Some(event_thread),
        })
    }

    /// Session with the event timeout from the global configuration
    pub fn from_config() -> Result<Self> {
        let timeout = crate::CONFIG.load().usb.event_timeout_ms;
        Self::new(Duration::from_millis(timeout))
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Opens the first device matching `vendor_id`/`product_id`
    pub fn open_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<(rusb::Device<Context>, DeviceHandle<Context>)> {
        for device in self.context.devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
                let handle = device.open()?;
                debug!(
                    "Opened {:04x}:{:04x} on bus {} address {}",
                    vendor_id,
                    product_id,
                    device.bus_number(),
                    device.address()
                );
                return Ok((device, handle));
            }
        }
        Err(Error::DeviceNotFound {
            vendor_id,
            product_id,
        })
    }
}

impl Drop for UsbSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                warn!("USB event thread panicked");
            }
        }
    }
}

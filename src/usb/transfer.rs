//! Asynchronous bulk transfers kept in flight for the lifetime of a stream
//!
//! Each transfer carries a pointer to the stream's [`StreamShared`] as user
//! data. The shared state is only released once every transfer has been
//! retired, which happens from the completion callback on the USB event
//! thread.

use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use libc::{c_int, c_uint, c_void};
use rusb::ffi::{self, constants::*};
use tracing::{debug, error, warn};

use super::device::UsbDevice;
use crate::capture::{CompletionHandler, TransferAction, TransferCompletion, TransferStatus};
use crate::error::{Error, Result};

impl TransferStatus {
    pub(crate) fn from_raw(status: c_int) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

struct StreamShared {
    handler: Mutex<Box<dyn CompletionHandler>>,
    outstanding: Mutex<usize>,
    retired: Condvar,
}

impl StreamShared {
    fn handler(&self) -> MutexGuard<'_, Box<dyn CompletionHandler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self) {
        let mut outstanding = self.outstanding();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.retired.notify_all();
        }
    }
}

struct TransferItem {
    transfer: NonNull<ffi::libusb_transfer>,
    // Target of `transfer.buffer`, must not be touched while submitted
    _buffer: Box<[u8]>,
}

impl TransferItem {
    fn new(
        device: &UsbDevice,
        endpoint: u8,
        size: usize,
        timeout_ms: u32,
        shared: &Arc<StreamShared>,
    ) -> Result<Self> {
        let length = c_int::try_from(size).map_err(|_| Error::Transfer(LIBUSB_ERROR_INVALID_PARAM))?;
        let mut buffer = vec![0u8; size].into_boxed_slice();

        // SAFETY: plain allocation, checked for null below
        let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
        let transfer = NonNull::new(transfer).ok_or(Error::Transfer(LIBUSB_ERROR_NO_MEM))?;

        // SAFETY: freshly allocated transfer owned by this item; buffer and
        // shared state outlive every submission, see `BulkStream::stop`
        unsafe {
            let t = &mut *transfer.as_ptr();
            t.dev_handle = device.raw_handle();
            t.endpoint = endpoint;
            t.transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            t.timeout = timeout_ms as c_uint;
            t.buffer = buffer.as_mut_ptr();
            t.length = length;
            t.user_data = Arc::as_ptr(shared) as *mut c_void;
            t.callback = bulk_callback;
        }

        Ok(Self {
            transfer,
            _buffer: buffer,
        })
    }

    fn submit(&self) -> c_int {
        // SAFETY: the transfer is fully initialized and not in flight
        unsafe { ffi::libusb_submit_transfer(self.transfer.as_ptr()) }
    }

    fn cancel(&self) {
        // SAFETY: cancelling an idle transfer only returns NOT_FOUND
        unsafe {
            ffi::libusb_cancel_transfer(self.transfer.as_ptr());
        }
    }
}

impl Drop for TransferItem {
    fn drop(&mut self) {
        // SAFETY: items are only dropped once no transfer is outstanding
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) }
    }
}

extern "system" fn bulk_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back a transfer set up by `TransferItem::new`,
    // whose user data points at a live `StreamShared`
    let (shared, status, data) = unsafe {
        let t = &*transfer;
        let shared = &*(t.user_data as *const StreamShared);
        let len = usize::try_from(t.actual_length).unwrap_or(0);
        let data: &[u8] = if len == 0 || t.buffer.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(t.buffer, len)
        };
        (shared, TransferStatus::from_raw(t.status), data)
    };

    let mut handler = shared.handler();
    let action = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.on_transfer(TransferCompletion { status, data })
    }))
    .unwrap_or_else(|_| {
        error!("Transfer handler panicked, retiring transfer");
        TransferAction::Release
    });

    if action == TransferAction::Resubmit {
        // SAFETY: the transfer just completed and is no longer in flight
        let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
        if rc >= 0 {
            return;
        }
        handler.on_submit_error(rc == LIBUSB_ERROR_NO_DEVICE);
    }
    drop(handler);
    shared.retire();
}

/// A set of bulk IN transfers continuously resubmitted to one endpoint
pub struct BulkStream {
    shared: Arc<StreamShared>,
    items: Vec<TransferItem>,
    running: Arc<AtomicBool>,
    device: Arc<UsbDevice>,
    endpoint: u8,
    stopped: bool,
}

// SAFETY: the raw transfers are only touched by this owner and the event
// thread, which synchronize through `StreamShared`
unsafe impl Send for BulkStream {}

impl BulkStream {
    /// Allocates `count` transfers of `size` bytes and submits all of them.
    ///
    /// `running` is the flag consulted by `handler`; it is cleared on stop.
    pub fn start(
        device: Arc<UsbDevice>,
        endpoint: u8,
        count: usize,
        size: usize,
        running: Arc<AtomicBool>,
        handler: Box<dyn CompletionHandler>,
    ) -> Result<Self> {
        let timeout_ms = crate::CONFIG.load().usb.transfer_timeout_ms;
        let shared = Arc::new(StreamShared {
            handler: Mutex::new(handler),
            outstanding: Mutex::new(0),
            retired: Condvar::new(),
        });

        let items = (0..count)
            .map(|_| TransferItem::new(&device, endpoint, size, timeout_ms, &shared))
            .collect::<Result<Vec<_>>>()?;

        let mut stream = Self {
            shared,
            items,
            running,
            device,
            endpoint,
            stopped: false,
        };

        stream.running.store(true, Ordering::Release);
        let mut failed = None;
        for item in &stream.items {
            *stream.shared.outstanding() += 1;
            let rc = item.submit();
            if rc < 0 {
                stream.shared.retire();
                failed = Some(rc);
                break;
            }
        }
        if let Some(rc) = failed {
            error!("Submitting transfer to endpoint {:#04x} failed: {}", endpoint, rc);
            stream.stop(Duration::from_secs(2));
            return Err(Error::Transfer(rc));
        }

        debug!(
            "Submitted {} transfers of {} bytes to endpoint {:#04x}",
            count, size, endpoint
        );
        Ok(stream)
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }

    /// False once stopped or after the device was lost
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding()
    }

    /// Stops resubmission, cancels in-flight transfers and waits up to
    /// `timeout` for all of them to retire.
    pub fn stop(&mut self, timeout: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        {
            // A callback holding the handler lock has already resubmitted
            // and will be caught by the cancellation below
            let _handler = self.shared.handler();
            self.running.store(false, Ordering::Release);
        }

        for item in &self.items {
            item.cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut outstanding = self.shared.outstanding();
        while *outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            outstanding = self
                .shared
                .retired
                .wait_timeout(outstanding, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let remaining = *outstanding;
        drop(outstanding);

        if remaining > 0 {
            // The USB stack still owns these; freeing them would be unsound
            warn!("{} transfers did not retire, leaking them", remaining);
            std::mem::forget(std::mem::take(&mut self.items));
            std::mem::forget(self.shared.clone());
        }

        self.shared.handler().finish();
        debug!("Bulk stream on endpoint {:#04x} stopped", self.endpoint);
    }
}

impl Drop for BulkStream {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(2));
    }
}

//! Per-transfer completion handling shared by all bulk streaming devices

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, warn};

use super::assembler::FrameAssembler;
use crate::pipeline::StreamCounters;

/// Outcome of one bulk transfer as reported by the USB stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// A finished transfer: its status and the bytes actually received
#[derive(Debug, Clone, Copy)]
pub struct TransferCompletion<'a> {
    pub status: TransferStatus,
    pub data: &'a [u8],
}

impl<'a> TransferCompletion<'a> {
    pub fn completed(data: &'a [u8]) -> Self {
        Self {
            status: TransferStatus::Completed,
            data,
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        Self { status, data: &[] }
    }
}

/// What to do with a transfer after its completion was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    /// Submit the same transfer again
    Resubmit,
    /// Retire the transfer, the stream is stopping or gone
    Release,
}

/// Consumer of transfer completions, invoked on the USB event thread
pub trait CompletionHandler: Send {
    fn on_transfer(&mut self, completion: TransferCompletion<'_>) -> TransferAction;

    /// A resubmission was rejected by the USB stack
    fn on_submit_error(&mut self, no_device: bool);

    /// Called once after every transfer of the stream has been retired
    fn finish(&mut self);
}

type LostCallback = Box<dyn Fn() + Send + Sync>;

/// Fires the device lost notification at most once per stream
#[derive(Default)]
pub struct DeviceLostSignal {
    lost: AtomicBool,
    callback: Mutex<Option<LostCallback>>,
}

impl DeviceLostSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Marks the device as lost. Returns whether this call did the transition.
    pub fn notify(&self) -> bool {
        if self.lost.swap(true, Ordering::AcqRel) {
            return false;
        }
        error!("Device lost");
        if let Some(callback) = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            callback();
        }
        true
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Rearms the signal for a new stream
    pub fn rearm(&self) {
        self.lost.store(false, Ordering::Release);
    }
}

/// Drives a [`FrameAssembler`] from transfer completions.
///
/// A successful transfer rearms the lost countdown; `lost_threshold`
/// consecutive failures declare the device lost.
pub struct StreamEngine<A: FrameAssembler> {
    assembler: A,
    running: Arc<AtomicBool>,
    lost: Arc<DeviceLostSignal>,
    lost_threshold: u32,
    lost_countdown: u32,
    counters: Arc<StreamCounters>,
}

impl<A: FrameAssembler> StreamEngine<A> {
    pub fn new(
        assembler: A,
        running: Arc<AtomicBool>,
        lost: Arc<DeviceLostSignal>,
        lost_threshold: u32,
        counters: Arc<StreamCounters>,
    ) -> Self {
        let lost_threshold = lost_threshold.max(1);
        Self {
            assembler,
            running,
            lost,
            lost_threshold,
            lost_countdown: lost_threshold,
            counters,
        }
    }

    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn device_lost(&mut self) {
        self.running.store(false, Ordering::Release);
        self.assembler.reset();
        self.lost.notify();
    }
}

impl<A: FrameAssembler> CompletionHandler for StreamEngine<A> {
    fn on_transfer(&mut self, completion: TransferCompletion<'_>) -> TransferAction {
        if !self.is_running() {
            return TransferAction::Release;
        }

        match completion.status {
            TransferStatus::Completed => {
                self.lost_countdown = self.lost_threshold;
                self.assembler.on_data(completion.data);
                if self.is_running() {
                    TransferAction::Resubmit
                } else {
                    TransferAction::Release
                }
            }
            TransferStatus::Cancelled => TransferAction::Release,
            TransferStatus::NoDevice => {
                self.device_lost();
                TransferAction::Release
            }
            status => {
                warn!("transfer status {:?}", status);
                self.counters.transfer_error();
                self.lost_countdown = self.lost_countdown.saturating_sub(1);
                if self.lost_countdown == 0 {
                    self.device_lost();
                    TransferAction::Release
                } else {
                    TransferAction::Resubmit
                }
            }
        }
    }

    fn on_submit_error(&mut self, no_device: bool) {
        error!("error re-submitting URB");
        self.counters.transfer_error();
        if no_device && self.is_running() {
            self.device_lost();
        }
    }

    fn finish(&mut self) {
        self.assembler.finish();
    }
}

//! Stream counters shared between the USB event thread and observers

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Delivery counters for one stream
#[derive(Debug, Default)]
pub struct StreamCounters {
    frames_delivered: CachePadded<AtomicU64>,
    frames_dropped: CachePadded<AtomicU64>,
    transfer_errors: CachePadded<AtomicU64>,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.frames_delivered.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.transfer_errors.store(0, Ordering::Relaxed);
    }

    pub fn frame_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tcam_frames_delivered").increment(1);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tcam_frames_dropped").increment(1);
    }

    pub fn transfer_error(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tcam_transfer_errors").increment(1);
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn transfer_errors(&self) -> u64 {
        self.transfer_errors.load(Ordering::Relaxed)
    }
}

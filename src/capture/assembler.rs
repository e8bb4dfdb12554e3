//! Shared plumbing of the frame reassembly state machines

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, trace};

use super::sink::Delivery;
use crate::image::{ImageBuffer, StreamStatistics};
use crate::pipeline::{BufferPool, StreamCounters};

/// Turns the payload of successful bulk transfers into frames.
///
/// Called on the USB event thread, must never block on a consumer.
pub trait FrameAssembler: Send {
    /// Consumes the bytes of one completed transfer
    fn on_data(&mut self, data: &[u8]);

    /// Abandons the frame in progress and returns its buffer to the pool
    fn reset(&mut self);

    /// Called once after the last transfer was retired
    fn finish(&mut self) {
        self.reset();
    }
}

/// Buffer source and frame sink of an assembler
pub struct FrameOutput {
    pool: Arc<BufferPool>,
    delivery: Delivery,
    counters: Arc<StreamCounters>,
}

impl FrameOutput {
    pub fn new(pool: Arc<BufferPool>, delivery: Delivery, counters: Arc<StreamCounters>) -> Self {
        Self {
            pool,
            delivery,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<StreamCounters> {
        &self.counters
    }

    /// Free buffer for a new frame. Starvation drops the frame.
    pub fn acquire(&self) -> Option<ImageBuffer> {
        let buffer = self.pool.get_next_buffer();
        if buffer.is_none() {
            error!("No buffer to work with. Dropping image");
            self.counters.frame_dropped();
        }
        buffer
    }

    /// Counts a frame as dropped and returns its buffer, if any, to the pool
    pub fn drop_frame(&self, buffer: Option<ImageBuffer>) {
        self.counters.frame_dropped();
        if let Some(buffer) = buffer {
            self.pool.requeue_buffer(buffer);
        }
    }

    /// Delivers a finished frame.
    ///
    /// With `expected_len` set, frames whose valid length differs are
    /// dropped instead of delivered.
    pub fn flush(&self, mut buffer: ImageBuffer, expected_len: Option<usize>) {
        if let Some(expected) = expected_len {
            if buffer.valid_data_length() != expected {
                trace!(
                    "Image buffer holds {} of {} bytes. Dropping frame...",
                    buffer.valid_data_length(),
                    expected
                );
                self.drop_frame(Some(buffer));
                return;
            }
        }

        let capture_time_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        buffer.set_statistics(StreamStatistics {
            frame_count: self.counters.frames_delivered(),
            frames_dropped: self.counters.frames_dropped(),
            capture_time_ns,
        });

        match self.delivery.deliver(buffer) {
            Ok(()) if matches!(self.delivery, Delivery::Direct(_)) => self.counters.frame_delivered(),
            // Queued frames are counted by the deliver thread
            Ok(()) => {}
            Err(buffer) => self.drop_frame(Some(buffer)),
        }
    }

    pub fn stop(&mut self) {
        self.delivery.stop();
    }
}

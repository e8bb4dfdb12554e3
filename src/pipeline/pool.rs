//! Pool of preallocated image buffers shared by acquisition and consumers

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::image::{ImageBuffer, VideoFormat};

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<ImageBuffer>,
    /// Buffers handed out by this generation that were not returned yet
    in_flight: usize,
    generation: u64,
}

/// Tracks which buffers are free and which are in flight.
///
/// A free buffer lives in the pool; an in flight buffer is owned by exactly
/// one party (the acquisition engine or a consumer) until it is requeued.
#[derive(Debug, Default)]
pub struct BufferPool {
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffers(format: VideoFormat, count: usize, size: usize) -> Self {
        let pool = Self::new();
        pool.allocate(format, count, size);
        pool
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the pool contents with `count` fresh buffers of `size` bytes
    pub fn allocate(&self, format: VideoFormat, count: usize, size: usize) {
        let buffers = (0..count).map(|_| ImageBuffer::new(format, size)).collect();
        self.adopt(buffers);
        debug!("Allocated {} buffers of {} bytes for {}", count, size, format);
    }

    /// Replaces the pool contents with externally allocated buffers
    pub fn adopt(&self, buffers: Vec<ImageBuffer>) {
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;

        state.free = buffers
            .into_iter()
            .map(|mut b| {
                b.generation = generation;
                b.set_valid_data_length(0);
                b
            })
            .collect();
        state.in_flight = 0;
    }

    /// Takes a free buffer without blocking
    pub fn get_next_buffer(&self) -> Option<ImageBuffer> {
        let mut state = self.state();
        let buffer = state.free.pop()?;
        state.in_flight += 1;
        Some(buffer)
    }

    /// Returns a buffer to the free list. Buffers from before the last
    /// `clear` or `allocate` are dropped instead.
    pub fn requeue_buffer(&self, mut buffer: ImageBuffer) {
        buffer.set_valid_data_length(0);

        let mut state = self.state();
        if buffer.generation != state.generation {
            trace!("Dropping buffer from retired pool generation");
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        state.free.push(buffer);
    }

    /// Frees every buffer; buffers still in flight are dropped on return
    pub fn clear(&self) {
        let mut state = self.state();
        state.free.clear();
        state.in_flight = 0;
        state.generation += 1;
    }

    pub fn free_count(&self) -> usize {
        self.state().free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::format::Y800;

    fn format() -> VideoFormat {
        VideoFormat::new(Y800, 8, 8, 30.0)
    }

    #[test]
    fn buffers_are_either_free_or_in_flight() {
        let pool = BufferPool::with_buffers(format(), 2, 64);
        let a = pool.get_next_buffer().unwrap();
        let b = pool.get_next_buffer().unwrap();
        assert!(pool.get_next_buffer().is_none());
        assert_eq!(pool.in_flight_count(), 2);

        pool.requeue_buffer(a);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.in_flight_count(), 1);

        pool.requeue_buffer(b);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.in_flight_count(), 0);
    }

    #[test]
    fn requeue_resets_valid_length() {
        let pool = BufferPool::with_buffers(format(), 1, 64);
        let mut buf = pool.get_next_buffer().unwrap();
        buf.set_valid_data_length(10);
        pool.requeue_buffer(buf);
        assert_eq!(pool.get_next_buffer().unwrap().valid_data_length(), 0);
    }

    #[test]
    fn buffers_returned_after_clear_are_dropped() {
        let pool = BufferPool::with_buffers(format(), 2, 64);
        let buf = pool.get_next_buffer().unwrap();
        pool.clear();
        pool.requeue_buffer(buf);
        assert_eq!(pool.free_count(), 0);
    }
}

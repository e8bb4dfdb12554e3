use serde::{Deserialize, Serialize};

use super::format::VideoFormat;

/// Per frame statistics stamped into a buffer right before delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatistics {
    pub frame_count: u64,
    pub frames_dropped: u64,
    /// Nanoseconds since the UNIX epoch
    pub capture_time_ns: u64,
}

/// Owned image memory handed between the buffer pool, the acquisition
/// engine and the sink.
///
/// Only one party owns a buffer at any time; returning it to the pool is
/// done by moving it back through `BufferPool::requeue_buffer`.
#[derive(Debug)]
pub struct ImageBuffer {
    format: VideoFormat,
    data: Box<[u8]>,
    valid_len: usize,
    statistics: StreamStatistics,
    pub(crate) generation: u64,
}

impl ImageBuffer {
    pub fn new(format: VideoFormat, size: usize) -> Self {
        Self {
            format,
            data: vec![0u8; size].into_boxed_slice(),
            valid_len: 0,
            statistics: StreamStatistics::default(),
            generation: 0,
        }
    }

    pub fn format(&self) -> &VideoFormat {
        &self.format
    }

    pub fn set_format(&mut self, format: VideoFormat) {
        self.format = format;
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes written by the producer
    pub fn valid_data(&self) -> &[u8] {
        &self.data[..self.valid_len]
    }

    pub fn valid_data_length(&self) -> usize {
        self.valid_len
    }

    pub fn set_valid_data_length(&mut self, len: usize) {
        self.valid_len = len.min(self.data.len());
    }

    /// Copies `block` to `offset`, truncated to the buffer capacity.
    /// Returns the number of bytes copied.
    pub fn copy_block(&mut self, block: &[u8], offset: usize) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let len = block.len().min(self.data.len() - offset);
        self.data[offset..offset + len].copy_from_slice(&block[..len]);
        len
    }

    pub fn statistics(&self) -> &StreamStatistics {
        &self.statistics
    }

    pub fn set_statistics(&mut self, statistics: StreamStatistics) {
        self.statistics = statistics;
    }
}

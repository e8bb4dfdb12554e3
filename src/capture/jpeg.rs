//! Reassembly of JPEG frames delimited by SOI/EOI markers (AFU050)

use bytes::BytesMut;
use tracing::{error, trace};

use super::assembler::{FrameAssembler, FrameOutput};

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Largest accepted JPEG frame
pub const JPEGBUF_SIZE: usize = 5 * 1024 * 1024;

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Accumulates bytes from SOI through EOI in a scratch buffer and copies the
/// finished frame into a pool buffer.
///
/// The scratch buffer is allocated once per stream and reused for every
/// frame. Markers split across two transfers are recognized.
pub struct JpegAssembler {
    output: FrameOutput,
    scratch: BytesMut,
    max_size: usize,
    in_frame: bool,
    /// Last byte of the previous transfer was 0xFF while idle
    pending_ff: bool,
}

impl JpegAssembler {
    pub fn new(output: FrameOutput, max_size: usize) -> Self {
        Self {
            output,
            scratch: BytesMut::with_capacity(max_size),
            max_size,
            in_frame: false,
            pending_ff: false,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.in_frame
    }

    fn begin_frame(&mut self) {
        self.scratch.clear();
        self.scratch.extend_from_slice(&SOI);
        self.in_frame = true;
    }

    fn abandon_frame(&mut self) {
        self.scratch.clear();
        self.in_frame = false;
        self.output.drop_frame(None);
    }

    fn complete_frame(&mut self) {
        let len = self.scratch.len();
        self.in_frame = false;

        if let Some(mut buffer) = self.output.acquire() {
            if buffer.capacity() < len {
                error!(
                    "JPEG frame of {} bytes does not fit buffer of {} bytes",
                    len,
                    buffer.capacity()
                );
                self.output.drop_frame(Some(buffer));
            } else {
                buffer.copy_block(&self.scratch, 0);
                buffer.set_valid_data_length(len);
                trace!("JPEG frame complete, {} bytes", len);
                self.output.flush(buffer, None);
            }
        }
        self.scratch.clear();
    }
}

impl FrameAssembler for JpegAssembler {
    fn on_data(&mut self, data: &[u8]) {
        let mut rest = data;

        while !rest.is_empty() {
            if !self.in_frame {
                // Only valid against the first byte of this transfer
                let pending_ff = std::mem::take(&mut self.pending_ff);
                if pending_ff && rest[0] == SOI[1] {
                    self.begin_frame();
                    rest = &rest[1..];
                    continue;
                }
                match find_marker(rest, SOI) {
                    Some(pos) => {
                        self.begin_frame();
                        rest = &rest[pos + 2..];
                    }
                    None => {
                        self.pending_ff = rest.last() == Some(&0xFF);
                        return;
                    }
                }
                continue;
            }

            if self.scratch.last() == Some(&0xFF) && rest[0] == SOI[1] {
                trace!("Start of image inside unfinished frame. Dropping...");
                self.abandon_frame();
                self.begin_frame();
                rest = &rest[1..];
                continue;
            }

            // End of the EOI marker within `rest`, if present
            let eoi_end = if self.scratch.last() == Some(&0xFF) && rest[0] == EOI[1] {
                Some(1)
            } else {
                find_marker(rest, EOI).map(|pos| pos + 2)
            };

            // A new SOI before the end marker means the current frame is cut short
            if let Some(soi) = find_marker(rest, SOI) {
                if eoi_end.map_or(true, |end| soi + 2 < end) {
                    trace!("Start of image inside unfinished frame. Dropping...");
                    self.abandon_frame();
                    rest = &rest[soi..];
                    continue;
                }
            }

            let take = eoi_end.unwrap_or(rest.len());
            if self.scratch.len() + take > self.max_size {
                error!("Image is too big. Dropping...");
                self.abandon_frame();
                rest = &rest[take..];
                continue;
            }

            self.scratch.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if eoi_end.is_some() {
                self.complete_frame();
            }
        }
        self.pending_ff = false;
    }

    fn reset(&mut self) {
        self.scratch.clear();
        self.in_frame = false;
        self.pending_ff = false;
    }

    fn finish(&mut self) {
        self.reset();
        self.output.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::capture::sink::{Delivery, ImageSink};
    use crate::image::format::MJPG;
    use crate::image::{ImageBuffer, VideoFormat};
    use crate::pipeline::{BufferPool, StreamCounters};

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<u8>>>);

    impl ImageSink for Collect {
        fn push_image(&self, buffer: ImageBuffer) {
            self.0.lock().unwrap().push(buffer.valid_data().to_vec());
        }
    }

    fn assembler(max_size: usize) -> (JpegAssembler, Arc<Collect>, Arc<StreamCounters>) {
        let collect = Arc::new(Collect::default());
        let sink: Arc<dyn ImageSink> = collect.clone();
        let pool = Arc::new(BufferPool::with_buffers(
            VideoFormat::new(MJPG, 1920, 1080, 30.0),
            4,
            max_size,
        ));
        let counters = Arc::new(StreamCounters::new());
        let output = FrameOutput::new(pool, Delivery::direct(&sink), counters.clone());
        (JpegAssembler::new(output, max_size), collect, counters)
    }

    #[test]
    fn markers_split_across_transfers() {
        let (mut asm, collect, _) = assembler(1024);
        asm.on_data(&[0x00, 0xFF]);
        asm.on_data(&[0xD8, 0x01, 0x02, 0xFF]);
        assert!(asm.is_accumulating());
        asm.on_data(&[0xD9, 0x77]);

        let frames = collect.0.lock().unwrap();
        assert_eq!(frames.as_slice(), &[vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]]);
    }

    #[test]
    fn trailing_ff_only_pairs_with_the_next_transfer_start() {
        let (mut asm, collect, counters) = assembler(1024);
        asm.on_data(&[0x00, 0xFF]);
        asm.on_data(&[0x00, 0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xD8, 0x02, 0xFF, 0xD9]);

        let frames = collect.0.lock().unwrap();
        assert_eq!(frames.as_slice(), &[vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]]);
        assert_eq!(counters.frames_dropped(), 0);
        assert!(!asm.is_accumulating());
    }

    #[test]
    fn oversized_frame_is_dropped() {
        let (mut asm, collect, counters) = assembler(8);
        asm.on_data(&[0xFF, 0xD8, 1, 2, 3, 4, 5, 6, 7, 0xFF, 0xD9]);
        assert!(collect.0.lock().unwrap().is_empty());
        assert_eq!(counters.frames_dropped(), 1);
        assert!(!asm.is_accumulating());

        asm.on_data(&[0xFF, 0xD8, 1, 0xFF, 0xD9]);
        assert_eq!(collect.0.lock().unwrap().len(), 1);
    }
}

//! Reassembly of frames introduced by an in-band image header (AFU420)

use tracing::{error, trace};

use super::assembler::{FrameAssembler, FrameOutput};
use crate::image::ImageBuffer;

/// Header magic for 8 and 10 bit streams
pub const HEADER_MAGIC_8BIT: [u8; 4] = [0x0a, 0xaa, 0x00, 0xa5];
/// Header magic for 12 bit streams
pub const HEADER_MAGIC_12BIT: [u8; 4] = [0x0a, 0xaa, 0x55, 0x00];

const FIELD_FRAME_ID: usize = 0x10;
const FIELD_WIDTH_HI: usize = 0x4C;
const FIELD_WIDTH_LO: usize = 0x4E;
const FIELD_HEIGHT_HI: usize = 0x5C;
const FIELD_HEIGHT_LO: usize = 0x5E;

/// Geometry of the embedded header for the active stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

impl HeaderLayout {
    pub fn new(width: u32, height: u32, bit_depth: u32) -> Self {
        Self {
            width,
            height,
            bit_depth,
        }
    }

    /// The header spans four image lines
    pub fn header_size(&self) -> usize {
        4 * self.width as usize * self.bit_depth as usize / 8
    }

    /// Byte count of one frame's payload
    pub fn image_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bit_depth as usize / 8
    }

    pub fn magic(&self) -> [u8; 4] {
        if self.bit_depth == 12 {
            HEADER_MAGIC_12BIT
        } else {
            HEADER_MAGIC_8BIT
        }
    }

    /// Header fields are strided by the pixel bit depth
    /// `None` when the field lies past the end of `data`
    fn field(&self, data: &[u8], offset: usize) -> Option<u8> {
        data.get(offset * self.bit_depth as usize / 8).copied()
    }
}

/// Validated image header at the start of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader<'a> {
    pub frame_id: u8,
    pub payload: &'a [u8],
}

/// Recognizes an image header at the start of `data`.
///
/// Returns the frame id and the bytes following the header when the magic
/// matches and the embedded dimensions equal the configured ones.
pub fn check_and_eat_img_header<'a>(layout: &HeaderLayout, data: &'a [u8]) -> Option<ImageHeader<'a>> {
    let header_size = layout.header_size();
    if data.len() < header_size || data.len() < 4 {
        return None;
    }
    if data[..4] != layout.magic() {
        return None;
    }

    let width = u16::from_le_bytes([
        layout.field(data, FIELD_WIDTH_LO)?,
        layout.field(data, FIELD_WIDTH_HI)?,
    ]);
    let height = u16::from_le_bytes([
        layout.field(data, FIELD_HEIGHT_LO)?,
        layout.field(data, FIELD_HEIGHT_HI)?,
    ]);

    if u32::from(width) != layout.width || u32::from(height) != layout.height {
        error!(
            "Dimensions do not fit. Header reports {}x{}, stream is {}x{}",
            width, height, layout.width, layout.height
        );
        return None;
    }

    Some(ImageHeader {
        frame_id: layout.field(data, FIELD_FRAME_ID)?,
        payload: &data[header_size..],
    })
}

/// Copies chunk payloads into a pool buffer from one header to the next.
///
/// A chunk that is neither a header nor a full `chunk_size` transfer ends
/// the current frame.
pub struct Afu420Assembler {
    output: FrameOutput,
    layout: HeaderLayout,
    chunk_size: usize,
    image_size: usize,
    drop_incomplete: bool,
    current: Option<ImageBuffer>,
    offset: usize,
    last_frame_id: Option<u8>,
}

impl Afu420Assembler {
    pub fn new(output: FrameOutput, layout: HeaderLayout, chunk_size: usize, drop_incomplete: bool) -> Self {
        Self {
            output,
            layout,
            chunk_size,
            image_size: layout.image_size(),
            drop_incomplete,
            current: None,
            offset: 0,
            last_frame_id: None,
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn last_frame_id(&self) -> Option<u8> {
        self.last_frame_id
    }

    fn push_current(&mut self) {
        self.offset = 0;
        if let Some(buffer) = self.current.take() {
            let expected = self.drop_incomplete.then_some(self.image_size);
            self.output.flush(buffer, expected);
        }
    }
}

impl FrameAssembler for Afu420Assembler {
    fn on_data(&mut self, data: &[u8]) {
        let header = check_and_eat_img_header(&self.layout, data);
        let payload = header.map_or(data, |h| h.payload);
        let is_trailer = header.is_none() && data.len() < self.chunk_size;

        if let Some(header) = header {
            if self.current.is_some() {
                self.push_current();
            }
            trace!("Image header for frame {}", header.frame_id);
            self.last_frame_id = Some(header.frame_id);
            self.offset = 0;

            match self.output.acquire() {
                Some(buffer) => self.current = Some(buffer),
                None => return,
            }
        }

        // Without a header in progress data is skipped until the next one
        let Some(buffer) = self.current.as_mut() else {
            return;
        };

        let available = self.image_size.saturating_sub(self.offset);
        let count = available.min(payload.len());
        let copied = buffer.copy_block(&payload[..count], self.offset);
        self.offset += copied;
        buffer.set_valid_data_length(self.offset);

        if self.offset >= self.image_size || is_trailer {
            self.push_current();
        }
    }

    fn reset(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.output.drop_frame(Some(buffer));
        }
        self.offset = 0;
    }

    fn finish(&mut self) {
        self.reset();
        self.output.stop();
    }
}

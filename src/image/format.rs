use std::fmt;

use serde::{Deserialize, Serialize};

/// Four character code identifying a pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCC(pub [u8; 4]);

/// Motion JPEG, variable size per frame
pub const MJPG: FourCC = FourCC(*b"MJPG");
/// 8 bit monochrome
pub const Y800: FourCC = FourCC(*b"Y800");
/// 16 bit monochrome
pub const Y16: FourCC = FourCC(*b"Y16 ");
/// 8 bit bayer RGGB
pub const RGGB8: FourCC = FourCC(*b"RGGB");
/// 10 bit bayer RGGB, four pixels packed in five bytes
pub const RGGB10_PACKED: FourCC = FourCC(*b"RG1A");
/// 12 bit bayer RGGB, two pixels packed in three bytes
pub const RGGB12_PACKED: FourCC = FourCC(*b"RG1C");
/// 16 bit bayer RGGB
pub const RGGB16: FourCC = FourCC(*b"RG16");
/// 8 bit bayer GBRG
pub const GBRG8: FourCC = FourCC(*b"GBRG");
/// 12 bit bayer GBRG, MIPI packing of two pixels in three bytes
pub const GBRG12_PACKED: FourCC = FourCC(*b"GB1C");
/// 16 bit bayer GBRG
pub const GBRG16: FourCC = FourCC(*b"GB16");

impl FourCC {
    /// Bits per pixel for uncompressed formats, 0 for compressed or unknown ones
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Y800 | RGGB8 | GBRG8 => 8,
            RGGB10_PACKED => 10,
            RGGB12_PACKED | GBRG12_PACKED => 12,
            Y16 | RGGB16 | GBRG16 => 16,
            _ => 0,
        }
    }

    pub fn is_compressed(self) -> bool {
        self == MJPG
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Negotiated stream format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
}

impl VideoFormat {
    pub fn new(fourcc: FourCC, width: u32, height: u32, framerate: f64) -> Self {
        Self {
            fourcc,
            width,
            height,
            framerate,
        }
    }

    /// Length of one image line in bytes
    pub fn pitch(&self) -> usize {
        get_pitch_length(self.width, self.fourcc)
    }

    /// Exact byte count of one uncompressed frame, `None` for compressed formats
    pub fn required_buffer_size(&self) -> Option<usize> {
        if self.fourcc.is_compressed() || self.fourcc.bits_per_pixel() == 0 {
            return None;
        }
        Some(self.pitch() * self.height as usize)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {:.2}",
            self.fourcc, self.width, self.height, self.framerate
        )
    }
}

pub fn get_pitch_length(width: u32, fourcc: FourCC) -> usize {
    (width as usize * fourcc.bits_per_pixel() as usize) / 8
}

//! Bit depth conversions run through the split engine

use crate::error::{Error, Result};
use crate::image::format::{
    FourCC, GBRG12_PACKED, GBRG16, GBRG8, RGGB12_PACKED, RGGB16, RGGB8, Y16, Y800,
};
use crate::image::{ImageView, ImageViewMut};
use crate::parallel::{ParallelState, Transform};

/// 8 bit to 16 bit little endian, value in the high byte
#[derive(Debug, Clone, Copy, Default)]
pub struct Fcc8ToFcc16;

/// 16 bit little endian to 8 bit, keeps the high byte
#[derive(Debug, Clone, Copy, Default)]
pub struct Fcc16ToFcc8;

/// Two 12 bit pixels in three bytes to 16 bit little endian
///
/// `p0 = b0 << 8 | (b1 & 0x0F) << 4`, `p1 = b2 << 8 | (b1 & 0xF0)`
#[derive(Debug, Clone, Copy, Default)]
pub struct Fcc12PackedToFcc16;

impl Transform for Fcc8ToFcc16 {
    fn call(&self, mut dst: ImageViewMut<'_>, src: ImageView<'_>) {
        let width = src.width as usize;
        for y in 0..src.height {
            let src_line = &src.line(y)[..width];
            let dst_line = &mut dst.line_mut(y)[..width * 2];
            for (out, &v) in dst_line.chunks_exact_mut(2).zip(src_line) {
                out.copy_from_slice(&(u16::from(v) << 8).to_le_bytes());
            }
        }
    }
}

impl Transform for Fcc16ToFcc8 {
    fn call(&self, mut dst: ImageViewMut<'_>, src: ImageView<'_>) {
        let width = src.width as usize;
        for y in 0..src.height {
            let src_line = &src.line(y)[..width * 2];
            let dst_line = &mut dst.line_mut(y)[..width];
            for (out, px) in dst_line.iter_mut().zip(src_line.chunks_exact(2)) {
                *out = px[1];
            }
        }
    }
}

impl Transform for Fcc12PackedToFcc16 {
    fn call(&self, mut dst: ImageViewMut<'_>, src: ImageView<'_>) {
        let pairs = src.width as usize / 2;
        for y in 0..src.height {
            let src_line = &src.line(y)[..pairs * 3];
            let dst_line = &mut dst.line_mut(y)[..pairs * 4];
            for (out, packed) in dst_line.chunks_exact_mut(4).zip(src_line.chunks_exact(3)) {
                let p0 = u16::from(packed[0]) << 8 | u16::from(packed[1] & 0x0F) << 4;
                let p1 = u16::from(packed[2]) << 8 | u16::from(packed[1] & 0xF0);
                out[..2].copy_from_slice(&p0.to_le_bytes());
                out[2..].copy_from_slice(&p1.to_le_bytes());
            }
        }
    }
}

fn is_8bit(fcc: FourCC) -> bool {
    matches!(fcc, Y800 | RGGB8 | GBRG8)
}

fn is_16bit(fcc: FourCC) -> bool {
    matches!(fcc, Y16 | RGGB16 | GBRG16)
}

/// Converts `src` into `dst` picking the transform from their fourccs
pub fn convert(
    state: &mut ParallelState,
    dst: ImageViewMut<'_>,
    src: ImageView<'_>,
    max_conc: usize,
) -> Result<()> {
    if dst.width != src.width || dst.height != src.height {
        return Err(Error::UnsupportedFormat(format!(
            "dimension mismatch {}x{} -> {}x{}",
            src.width, src.height, dst.width, dst.height
        )));
    }

    match (src.fourcc, dst.fourcc) {
        (s, d) if is_8bit(s) && is_16bit(d) => state.queue_and_wait(&Fcc8ToFcc16, dst, src, max_conc),
        (s, d) if is_16bit(s) && is_8bit(d) => state.queue_and_wait(&Fcc16ToFcc8, dst, src, max_conc),
        (RGGB12_PACKED | GBRG12_PACKED, d) if is_16bit(d) => {
            if src.width % 2 != 0 {
                return Err(Error::UnsupportedFormat(format!(
                    "12 bit packed needs an even width, got {}",
                    src.width
                )));
            }
            state.queue_and_wait(&Fcc12PackedToFcc16, dst, src, max_conc)
        }
        (s, d) => {
            return Err(Error::UnsupportedFormat(format!(
                "no transform from {s} to {d}"
            )))
        }
    }
    Ok(())
}

//! Borrowed image views used to hand row strips to transforms
//!
//! A view is a byte slice plus the geometry needed to address lines in it.
//! The slice length is validated once on construction; all line and strip
//! accessors rely on that check.

use super::format::{FourCC, VideoFormat};

#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [u8],
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
}

#[derive(Debug)]
pub struct ImageViewMut<'a> {
    data: &'a mut [u8],
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
}

fn covers(len: usize, pitch: usize, height: u32) -> bool {
    pitch
        .checked_mul(height as usize)
        .is_some_and(|required| required <= len)
}

impl<'a> ImageView<'a> {
    /// Returns `None` when `data` is too short for `format`
    pub fn new(data: &'a [u8], format: &VideoFormat) -> Option<Self> {
        Self::with_pitch(data, format.fourcc, format.width, format.height, format.pitch())
    }

    pub fn with_pitch(
        data: &'a [u8],
        fourcc: FourCC,
        width: u32,
        height: u32,
        pitch: usize,
    ) -> Option<Self> {
        if !covers(data.len(), pitch, height) {
            return None;
        }
        Some(Self {
            data,
            fourcc,
            width,
            height,
            pitch,
        })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn line(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.pitch;
        &self.data[start..start + self.pitch]
    }

    /// Sub view starting `index * split_height` lines into this one.
    ///
    /// The last split receives all remaining lines, so iterating
    /// `index in 0..count` covers every line exactly once.
    pub fn split(&self, index: usize, split_height: u32, is_last: bool) -> ImageView<'a> {
        let first_line = index as u32 * split_height;
        let height = if is_last {
            self.height - first_line
        } else {
            split_height
        };
        let start = first_line as usize * self.pitch;
        let data = if is_last {
            &self.data[start..]
        } else {
            &self.data[start..start + height as usize * self.pitch]
        };

        ImageView {
            data,
            fourcc: self.fourcc,
            width: self.width,
            height,
            pitch: self.pitch,
        }
    }
}

impl<'a> ImageViewMut<'a> {
    pub fn new(data: &'a mut [u8], format: &VideoFormat) -> Option<Self> {
        Self::with_pitch(data, format.fourcc, format.width, format.height, format.pitch())
    }

    pub fn with_pitch(
        data: &'a mut [u8],
        fourcc: FourCC,
        width: u32,
        height: u32,
        pitch: usize,
    ) -> Option<Self> {
        if !covers(data.len(), pitch, height) {
            return None;
        }
        Some(Self {
            data,
            fourcc,
            width,
            height,
            pitch,
        })
    }

    pub fn as_view(&self) -> ImageView<'_> {
        ImageView {
            data: self.data,
            fourcc: self.fourcc,
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }

    pub fn line_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.pitch;
        &mut self.data[start..start + self.pitch]
    }

    /// Cuts the view into `count` disjoint strips of `split_height` lines.
    /// The last strip takes the remaining lines.
    pub fn into_strips(self, split_height: u32, count: usize) -> Vec<ImageViewMut<'a>> {
        let mut strips = Vec::with_capacity(count);
        let mut rest = self.data;

        for index in 0..count {
            let is_last = index + 1 == count;
            let height = if is_last {
                self.height - index as u32 * split_height
            } else {
                split_height
            };

            let data = if is_last {
                std::mem::take(&mut rest)
            } else {
                let (head, tail) =
                    std::mem::take(&mut rest).split_at_mut(height as usize * self.pitch);
                rest = tail;
                head
            };

            strips.push(ImageViewMut {
                data,
                fourcc: self.fourcc,
                width: self.width,
                height,
                pitch: self.pitch,
            });
        }
        strips
    }
}

pub mod buffer;
pub mod format;
pub mod view;

pub use buffer::{ImageBuffer, StreamStatistics};
pub use format::{get_pitch_length, FourCC, VideoFormat};
pub use view::{ImageView, ImageViewMut};

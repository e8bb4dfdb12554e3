//! Bulk streaming camera backends

pub mod afu050;
pub mod afu420;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::ImageSink;
use crate::error::{Error, Result};
use crate::image::{ImageBuffer, VideoFormat};
use crate::pipeline::{BufferPool, StreamCounters};
use crate::property::{Property, PropertyValue};
use crate::usb::{UsbSession, PRODUCT_ID_AFU050, PRODUCT_ID_AFU420};

pub use afu050::Afu050Device;
pub use afu420::Afu420Device;

/// Inclusive frame rate limits of a format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRateRange {
    pub fps_min: f64,
    pub fps_max: f64,
}

impl FrameRateRange {
    pub fn new(fps_min: f64, fps_max: f64) -> Result<Self> {
        if !(fps_min > 0.0 && fps_min <= fps_max) {
            return Err(Error::OutOfRange(format!("frame rate {fps_min}..{fps_max}")));
        }
        Ok(Self { fps_min, fps_max })
    }

    pub fn contains(&self, fps: f64) -> bool {
        fps >= self.fps_min && fps <= self.fps_max
    }
}

/// Common surface of the USB bulk cameras
pub trait CaptureDevice: Send {
    fn name(&self) -> &'static str;

    fn available_video_formats(&self) -> Vec<VideoFormat>;

    /// Only possible while the stream is stopped
    fn set_video_format(&mut self, format: &VideoFormat) -> Result<()>;

    fn active_video_format(&self) -> Option<VideoFormat>;

    fn set_framerate(&mut self, framerate: f64) -> Result<()>;

    /// Starts delivering frames to `sink`, which is held weakly
    fn start_stream(&mut self, sink: &Arc<dyn ImageSink>) -> Result<()>;

    fn stop_stream(&mut self) -> Result<()>;

    fn is_streaming(&self) -> bool;

    fn buffer_pool(&self) -> &Arc<BufferPool>;

    /// Hands a delivered buffer back for reuse
    fn requeue_buffer(&self, buffer: ImageBuffer) {
        self.buffer_pool().requeue_buffer(buffer);
    }

    fn counters(&self) -> &Arc<StreamCounters>;

    /// `callback` runs on the USB event thread, at most once per stream
    fn set_device_lost_callback(&self, callback: Box<dyn Fn() + Send + Sync>);

    fn properties(&self) -> Vec<Property>;

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<()>;
}

/// Opens the supported camera with `product_id`
pub fn open_device(session: &Arc<UsbSession>, product_id: u16) -> Result<Box<dyn CaptureDevice>> {
    match product_id {
        PRODUCT_ID_AFU050 => Ok(Box::new(Afu050Device::open(session)?)),
        PRODUCT_ID_AFU420 => Ok(Box::new(Afu420Device::open(session)?)),
        _ => Err(Error::DeviceNotFound {
            vendor_id: crate::CONFIG.load().usb.vendor_id,
            product_id,
        }),
    }
}

/// Fresh buffers for one stream of `format`
pub(crate) fn prepare_buffers(pool: &BufferPool, format: VideoFormat, size: usize) {
    let count = crate::CONFIG.load().stream.buffer_count;
    pool.allocate(format, count, size);
}

//! AFU420: raw bayer camera with an in-band frame header on its bulk endpoint

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::{prepare_buffers, CaptureDevice, FrameRateRange};
use crate::capture::{
    Afu420Assembler, DeliverThread, Delivery, DeviceLostSignal, FrameOutput, HeaderLayout, ImageSink,
    StreamEngine,
};
use crate::error::{Error, Result};
use crate::image::format::{FourCC, GBRG12_PACKED, GBRG8};
use crate::image::VideoFormat;
use crate::pipeline::{BufferPool, StreamCounters};
use crate::property::{find_property, Property, PropertyValue};
use crate::usb::{BulkStream, UsbDevice, UsbSession, PRODUCT_ID_AFU420};

const ENDPOINT_IN: u8 = 0x83;
const INTERFACE: u8 = 0;

const REQ_SET_FPS: u8 = 0x0A;
const REQ_START_STREAM: u8 = 0x21;
const REQ_SET_RESOLUTION: u8 = 0x74;
const REQ_SET_BIT_DEPTH: u8 = 0xC6;

const USB2_STACKUP_SIZE: usize = 512;
const USB3_STACKUP_SIZE: usize = 32;

const SENSOR_DIM_MIN: (u32, u32) = (264, 256);
const SENSOR_DIM_MAX: (u32, u32) = (7716, 5360);
const SENSOR_DIM_MAX_12BIT: (u32, u32) = (5424, 5360);
const SENSOR_STEP: (u32, u32) = (12, 4);

/// Last addressable sensor pixel, including the 4 pixel start offset
const PIXEL_MAX: (u32, u32) = (7728 - 12 + 3, 5368 - 4 + 3);
const PIXEL_MIN: (u32, u32) = (0x100, 0x98);

/// Sizes offered besides the sensor maximum
const STANDARD_RESOLUTIONS: [(u32, u32); 6] = [
    (640, 480),
    (1024, 768),
    (1920, 1080),
    (2448, 2048),
    (3840, 2160),
    (4800, 3600),
];

/// A stream format the sensor can produce
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormatDesc {
    pub fourcc: FourCC,
    pub src_bpp: u32,
    pub dim_min: (u32, u32),
    pub dim_max: (u32, u32),
    pub framerates: FrameRateRange,
}

impl StreamFormatDesc {
    fn fits(&self, width: u32, height: u32) -> bool {
        (self.dim_min.0..=self.dim_max.0).contains(&width)
            && (self.dim_min.1..=self.dim_max.1).contains(&height)
    }
}

fn stream_formats() -> [StreamFormatDesc; 2] {
    let framerates = FrameRateRange {
        fps_min: 2.0,
        fps_max: 30.0,
    };
    [
        StreamFormatDesc {
            fourcc: GBRG8,
            src_bpp: 8,
            dim_min: SENSOR_DIM_MIN,
            dim_max: SENSOR_DIM_MAX,
            framerates,
        },
        StreamFormatDesc {
            fourcc: GBRG12_PACKED,
            src_bpp: 12,
            dim_min: SENSOR_DIM_MIN,
            dim_max: SENSOR_DIM_MAX_12BIT,
            framerates,
        },
    ]
}

fn find_stream_format(format: &VideoFormat) -> Option<StreamFormatDesc> {
    stream_formats()
        .into_iter()
        .find(|desc| desc.fourcc == format.fourcc && desc.fits(format.width, format.height))
}

/// Bytes per bulk chunk; shorter chunks end a frame
pub fn bulk_chunk_size(superspeed: bool, max_packet_size: u16) -> usize {
    if superspeed {
        usize::from(max_packet_size) * USB3_STACKUP_SIZE
    } else {
        15 * 1024 * USB2_STACKUP_SIZE
    }
}

/// Frame rate as sent to the device, 7.7 fps is 770
pub fn framerate_request_value(framerate: f64) -> u16 {
    (framerate * 100.0).round() as u16
}

/// Sensor window and readout size, sent with vendor request 0x74
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionConf {
    pub x_addr_start: u16,
    pub y_addr_start: u16,
    pub x_addr_end: u16,
    pub y_addr_end: u16,
    pub x_output_size: u16,
    pub y_output_size: u16,
    pub digital_crop_x_offset: u16,
    pub digital_crop_y_offset: u16,
    pub digital_crop_image_width: u16,
    pub digital_crop_image_height: u16,
    /// 0 means no binning
    pub hor_binning: u8,
    pub ver_binning: u8,
    pub default_framerate: u16,
}

impl ResolutionConf {
    pub const SERIALIZED_LEN: usize = 24;

    /// Unbinned window of `dim` pixels placed `offset` pixels from the
    /// sensor origin. `None` when the window leaves the sensor or breaks
    /// the 12x4 pixel grid.
    pub fn for_window(offset: (u32, u32), dim: (u32, u32)) -> Option<Self> {
        // The device counts the window from the far sensor corner
        let roi_x = SENSOR_DIM_MAX.0.checked_sub(offset.0)?.checked_sub(dim.0)?;
        let roi_y = SENSOR_DIM_MAX.1.checked_sub(offset.1)?.checked_sub(dim.1)?;

        if roi_x > PIXEL_MAX.0 - PIXEL_MIN.0 || roi_y > PIXEL_MAX.1 - PIXEL_MIN.1 {
            error!("Invalid roi start. {}x{}", roi_x, roi_y);
            return None;
        }
        if roi_x % 4 != 0 || roi_y % 4 != 0 {
            error!("Invalid roi start. {} {}", roi_x, roi_y);
            return None;
        }
        if dim.0 > PIXEL_MAX.0 || dim.1 > PIXEL_MAX.1 {
            error!("Invalid dimensions (too large) for videoformat.");
            return None;
        }
        if dim.0 == 0 || dim.1 == 0 || dim.0 % SENSOR_STEP.0 != 0 || dim.1 % SENSOR_STEP.1 != 0 {
            error!("Invalid dimensions (step) for videoformat.");
            return None;
        }

        let x_addr_start = 4 + roi_x;
        let y_addr_start = 4 + roi_y;
        let x_addr_end = x_addr_start + dim.0 - 1;
        let y_addr_end = y_addr_start + dim.1 - 1;
        if x_addr_end > PIXEL_MAX.0 || y_addr_end > PIXEL_MAX.1 {
            error!(
                "End pixel address does not make sense. {} > {}   {} > {}",
                x_addr_end, PIXEL_MAX.0, y_addr_end, PIXEL_MAX.1
            );
            return None;
        }

        // Every value is bounded by PIXEL_MAX and fits 16 bits
        Some(Self {
            x_addr_start: x_addr_start as u16,
            y_addr_start: y_addr_start as u16,
            x_addr_end: x_addr_end as u16,
            y_addr_end: y_addr_end as u16,
            x_output_size: dim.0 as u16,
            y_output_size: dim.1 as u16,
            digital_crop_image_width: dim.0 as u16,
            digital_crop_image_height: dim.1 as u16,
            ..Self::default()
        })
    }

    /// Big endian wire layout
    pub fn serialize(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut buf = [0u8; Self::SERIALIZED_LEN];
        let words = [
            self.x_addr_start,
            self.y_addr_start,
            self.x_addr_end,
            self.y_addr_end,
            self.x_output_size,
            self.y_output_size,
            self.digital_crop_x_offset,
            self.digital_crop_y_offset,
            self.digital_crop_image_width,
            self.digital_crop_image_height,
        ];
        for (out, word) in buf.chunks_exact_mut(2).zip(words) {
            out.copy_from_slice(&word.to_be_bytes());
        }
        buf[20] = self.hor_binning;
        buf[21] = self.ver_binning;
        buf[22..].copy_from_slice(&self.default_framerate.to_be_bytes());
        buf
    }
}

/// Offset centering `dim` on the usable sensor area of `desc`, on the 12x4 grid
pub fn auto_center_offset(desc: &StreamFormatDesc, dim: (u32, u32)) -> (u32, u32) {
    let max = desc.dim_max;
    if dim == max || dim == SENSOR_DIM_MAX || dim.0 > max.0 || dim.1 > max.1 {
        return (0, 0);
    }
    let x = max.0 / 2 - dim.0 / 2;
    let y = max.1 / 2 - dim.1 / 2;
    (x - x % SENSOR_STEP.0, y - y % SENSOR_STEP.1)
}

pub struct Afu420Device {
    usb: Arc<UsbDevice>,
    active_format: Option<VideoFormat>,
    bit_depth: u32,
    pool: Arc<BufferPool>,
    counters: Arc<StreamCounters>,
    lost: Arc<DeviceLostSignal>,
    stream: Option<BulkStream>,
    properties: Vec<Property>,
}

impl Afu420Device {
    #[instrument(skip_all)]
    pub fn open(session: &Arc<UsbSession>) -> Result<Self> {
        let vendor_id = crate::CONFIG.load().usb.vendor_id;
        let usb = UsbDevice::open(session, vendor_id, PRODUCT_ID_AFU420)?;
        usb.open_interface(INTERFACE)?;
        info!("Opened AFU420, superspeed: {}", usb.is_superspeed());

        let (max_w, max_h) = SENSOR_DIM_MAX;
        Ok(Self {
            usb: Arc::new(usb),
            active_format: None,
            bit_depth: 8,
            pool: Arc::new(BufferPool::new()),
            counters: Arc::new(StreamCounters::new()),
            lost: Arc::new(DeviceLostSignal::new()),
            stream: None,
            properties: vec![
                Property::float("FrameRate", 30.0, 2.0, 30.0),
                Property::integer("SensorWidth", max_w.into(), max_w.into(), max_w.into(), 1).read_only(),
                Property::integer("SensorHeight", max_h.into(), max_h.into(), max_h.into(), 1).read_only(),
            ],
        })
    }

    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    fn setup_bit_depth(&mut self, bpp: u32) -> Result<()> {
        if !matches!(bpp, 8 | 10 | 12) {
            return Err(Error::InvalidBitDepth(bpp));
        }
        // The device only takes the request value, no data stage
        self.usb
            .vendor_write(REQ_SET_BIT_DEPTH, bpp as u16, 0, &[])
            .map_err(|e| {
                error!("Failed to set a bit depth. This is most likely a too old firmware. {}", e);
                e
            })?;
        self.bit_depth = bpp;
        debug!("Set bit depth to {}", bpp);
        Ok(())
    }

    fn framerate_range(&self) -> FrameRateRange {
        self.active_format
            .as_ref()
            .and_then(find_stream_format)
            .map_or(stream_formats()[0].framerates, |desc| desc.framerates)
    }

    fn write_framerate(&self, framerate: f64) -> Result<()> {
        let value = framerate_request_value(framerate);
        debug!("Attempting to set framerate value {}", value);
        self.usb
            .vendor_write(REQ_SET_FPS, value, 1, &[])
            .map_err(|e| {
                error!("Could not set framerate. {}", e);
                e
            })?;
        Ok(())
    }

    fn write_resolution(&self, desc: &StreamFormatDesc, format: &VideoFormat) -> Result<()> {
        let dim = (format.width, format.height);
        let offset = auto_center_offset(desc, dim);
        let conf = ResolutionConf::for_window(offset, dim)
            .ok_or_else(|| Error::UnsupportedFormat(format!("no sensor window for {format}")))?;

        debug!("Resolution config {:?}", conf);
        self.usb
            .vendor_write(REQ_SET_RESOLUTION, 0, 0, &conf.serialize())
            .map_err(|e| {
                error!("Could not set resolution config. {}", e);
                e
            })?;
        Ok(())
    }

    fn stop_transfers(&mut self) -> Result<()> {
        let mut stream = self.stream.take().ok_or(Error::StreamNotRunning)?;
        stream.stop(Duration::from_secs(2));
        if let Err(e) = self.usb.halt_endpoint(ENDPOINT_IN) {
            warn!("Clearing halt on endpoint {:#04x} failed: {}", ENDPOINT_IN, e);
        }
        self.pool.clear();
        Ok(())
    }
}

impl CaptureDevice for Afu420Device {
    fn name(&self) -> &'static str {
        "AFU420"
    }

    fn available_video_formats(&self) -> Vec<VideoFormat> {
        let mut formats = Vec::new();
        for desc in stream_formats() {
            let (max_w, max_h) = desc.dim_max;
            formats.push(VideoFormat::new(desc.fourcc, max_w, max_h, desc.framerates.fps_max));
            formats.extend(
                STANDARD_RESOLUTIONS
                    .iter()
                    .filter(|(w, h)| desc.fits(*w, *h) && w % 12 == 0 && h % 4 == 0)
                    .map(|(w, h)| VideoFormat::new(desc.fourcc, *w, *h, desc.framerates.fps_max)),
            );
        }
        formats
    }

    #[instrument(skip_all, fields(format = %format))]
    fn set_video_format(&mut self, format: &VideoFormat) -> Result<()> {
        if self.stream.is_some() {
            error!("Unable to set format. Stream is running.");
            return Err(Error::StreamRunning);
        }
        info!("Attempting to set format to: '{}'", format);

        let desc = find_stream_format(format)
            .ok_or_else(|| Error::UnsupportedFormat(format.to_string()))?;
        if !desc.framerates.contains(format.framerate) {
            return Err(Error::OutOfRange(format!("frame rate {}", format.framerate)));
        }

        self.setup_bit_depth(desc.src_bpp)?;
        self.write_resolution(&desc, format)?;
        self.write_framerate(format.framerate)?;

        self.active_format = Some(*format);
        find_property(&mut self.properties, "FrameRate")?.set(PropertyValue::Float(format.framerate))?;
        info!("Set format to: {}", format);
        Ok(())
    }

    fn active_video_format(&self) -> Option<VideoFormat> {
        self.active_format
    }

    fn set_framerate(&mut self, framerate: f64) -> Result<()> {
        let range = self.framerate_range();
        if !range.contains(framerate) {
            return Err(Error::OutOfRange(format!("frame rate {framerate}")));
        }
        self.write_framerate(framerate)?;

        if let Some(format) = self.active_format.as_mut() {
            format.framerate = framerate;
        }
        find_property(&mut self.properties, "FrameRate")?.set(PropertyValue::Float(framerate))
    }

    #[instrument(skip_all)]
    fn start_stream(&mut self, sink: &Arc<dyn ImageSink>) -> Result<()> {
        if self.stream.is_some() {
            error!("Unable to start stream. Stream is already running.");
            return Err(Error::StreamRunning);
        }
        let format = self
            .active_format
            .ok_or_else(|| Error::UnsupportedFormat("no video format set".into()))?;
        let image_size = format
            .required_buffer_size()
            .ok_or_else(|| Error::UnsupportedFormat(format.to_string()))?;

        let superspeed = self.usb.is_superspeed();
        let max_packet_size = if superspeed {
            self.usb.max_packet_size(ENDPOINT_IN)?
        } else {
            0
        };
        let chunk_size = bulk_chunk_size(superspeed, max_packet_size);

        let config = crate::CONFIG.load();
        prepare_buffers(&self.pool, format, image_size);
        self.counters.reset();
        self.lost.rearm();

        let drop_incomplete =
            config.stream.drop_incomplete_frames && sink.should_incomplete_frames_be_dropped();
        let deliver = DeliverThread::start(
            Arc::downgrade(sink),
            self.pool.clone(),
            self.counters.clone(),
            config.stream.buffer_count,
        )?;
        let output = FrameOutput::new(self.pool.clone(), Delivery::Thread(deliver), self.counters.clone());
        let layout = HeaderLayout::new(format.width, format.height, self.bit_depth);
        let running = Arc::new(AtomicBool::new(false));
        let engine = StreamEngine::new(
            Afu420Assembler::new(output, layout, chunk_size, drop_incomplete),
            running.clone(),
            self.lost.clone(),
            config.stream.lost_countdown,
            self.counters.clone(),
        );

        debug!(
            "chunk size {}, image size {}, drop incomplete frames {}",
            chunk_size, image_size, drop_incomplete
        );
        self.stream = Some(BulkStream::start(
            self.usb.clone(),
            ENDPOINT_IN,
            config.stream.transfer_count,
            config.stream.transfer_size,
            running,
            Box::new(engine),
        )?);

        if let Err(e) = self.usb.vendor_write(REQ_START_STREAM, 0, 0, &[0]) {
            error!("Stream could not be started. Aborting");
            let _ = self.stop_transfers();
            return Err(e);
        }

        info!("Stream started");
        Ok(())
    }

    #[instrument(skip_all)]
    fn stop_stream(&mut self) -> Result<()> {
        debug!("stop_stream called");
        self.stop_transfers()?;
        info!(
            "Stream stopped, {} frames delivered, {} dropped",
            self.counters.frames_delivered(),
            self.counters.frames_dropped()
        );
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(BulkStream::is_running)
    }

    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn counters(&self) -> &Arc<StreamCounters> {
        &self.counters
    }

    fn set_device_lost_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.lost.set_callback(callback);
    }

    fn properties(&self) -> Vec<Property> {
        self.properties.clone()
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<()> {
        match (name, &value) {
            ("FrameRate", PropertyValue::Float(fps)) => self.set_framerate(*fps),
            _ => find_property(&mut self.properties, name)?.set(value),
        }
    }
}

impl Drop for Afu420Device {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let _ = self.stop_transfers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_depends_on_link_speed() {
        assert_eq!(bulk_chunk_size(true, 1024), 32 * 1024);
        assert_eq!(bulk_chunk_size(false, 512), 15 * 1024 * 512);
    }

    #[test]
    fn framerate_is_sent_in_hundredths() {
        assert_eq!(framerate_request_value(7.7), 770);
        assert_eq!(framerate_request_value(30.0), 3000);
    }

    #[test]
    fn full_sensor_window_starts_at_the_far_corner() {
        let conf = ResolutionConf::for_window((0, 0), SENSOR_DIM_MAX).unwrap();
        assert_eq!((conf.x_addr_start, conf.y_addr_start), (4, 4));
        assert_eq!((conf.x_addr_end, conf.y_addr_end), (7719, 5363));
        assert_eq!((conf.x_output_size, conf.y_output_size), (7716, 5360));
        assert_eq!((conf.hor_binning, conf.ver_binning), (0, 0));
    }

    #[test]
    fn centered_1080p_window() {
        let desc = stream_formats()[0];
        let offset = auto_center_offset(&desc, (1920, 1080));
        assert_eq!(offset, (2892, 2140));

        let conf = ResolutionConf::for_window(offset, (1920, 1080)).unwrap();
        assert_eq!(conf.x_addr_start, 4 + 7716 - 2892 - 1920);
        assert_eq!(conf.y_addr_start, 4 + 5360 - 2140 - 1080);
        assert_eq!(conf.digital_crop_image_width, 1920);
        assert_eq!(conf.digital_crop_image_height, 1080);
    }

    #[test]
    fn every_listed_size_has_a_sensor_window() {
        for desc in stream_formats() {
            let sizes = STANDARD_RESOLUTIONS
                .iter()
                .copied()
                .filter(|(w, h)| desc.fits(*w, *h))
                .chain([desc.dim_max]);
            for dim in sizes {
                let offset = auto_center_offset(&desc, dim);
                assert!(ResolutionConf::for_window(offset, dim).is_some(), "{:?}", dim);
            }
        }
    }

    #[test]
    fn windows_off_the_grid_are_rejected() {
        assert!(ResolutionConf::for_window((0, 0), (1000, 1080)).is_none());
        assert!(ResolutionConf::for_window((0, 0), (1920, 1082)).is_none());
        assert!(ResolutionConf::for_window((7000, 0), (1920, 1080)).is_none());
    }

    #[test]
    fn resolution_config_is_big_endian() {
        let conf = ResolutionConf {
            x_addr_start: 0x0102,
            default_framerate: 0x0A0B,
            hor_binning: 2,
            ..ResolutionConf::default()
        };
        let buf = conf.serialize();
        assert_eq!(&buf[..2], &[0x01, 0x02]);
        assert_eq!(buf[20], 2);
        assert_eq!(&buf[22..], &[0x0A, 0x0B]);
    }

    #[test]
    fn twelve_bit_formats_have_a_narrower_sensor() {
        let wide = VideoFormat::new(GBRG12_PACKED, 7716, 5360, 10.0);
        assert!(find_stream_format(&wide).is_none());

        let fits = VideoFormat::new(GBRG12_PACKED, 5424, 5360, 10.0);
        assert_eq!(find_stream_format(&fits).map(|d| d.src_bpp), Some(12));
    }
}

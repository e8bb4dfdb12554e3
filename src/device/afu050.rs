//! AFU050: UVC-like camera streaming motion JPEG over a bulk endpoint

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument};

use super::{prepare_buffers, CaptureDevice};
use crate::capture::{DeviceLostSignal, Delivery, FrameOutput, ImageSink, JpegAssembler, StreamEngine};
use crate::error::{Error, Result};
use crate::image::format::MJPG;
use crate::image::VideoFormat;
use crate::pipeline::{BufferPool, StreamCounters};
use crate::property::{find_property, Property, PropertyValue};
use crate::usb::{BulkStream, UsbDevice, UsbSession, PRODUCT_ID_AFU050};

const ENDPOINT_IN: u8 = 0x82;
const TRANSFER_COUNT: usize = 32;
const TRANSFER_SIZE: usize = 32 * 1024;

const CONTROL_INTERFACE: u8 = 0;
const STREAMING_INTERFACE: u8 = 1;
const VS_COMMIT_CONTROL: u8 = 0x02;

const SENSOR_WIDTH: u32 = 2592;
const SENSOR_HEIGHT: u32 = 1944;

/// Fixed formats and the frame index the device knows them by
const FORMATS: [(u32, u32, f64, u8); 3] = [
    (2592, 1944, 15.0, 1),
    (1920, 1080, 30.0, 2),
    (1280, 960, 60.0, 3),
];

pub fn frame_index(format: &VideoFormat) -> Option<u8> {
    if format.fourcc != MJPG {
        return None;
    }
    FORMATS
        .iter()
        .find(|(w, h, fps, _)| format.width == *w && format.height == *h && format.framerate == *fps)
        .map(|(.., index)| *index)
}

/// Probe/commit control payload selecting `frame_index`
pub fn commit_payload(format_index: u8, frame_index: u8, frame_interval: u32) -> [u8; 34] {
    let mut buf = [0u8; 34];
    buf[2] = format_index;
    buf[3] = frame_index;
    buf[4..8].copy_from_slice(&frame_interval.to_le_bytes());
    buf
}

pub struct Afu050Device {
    usb: Arc<UsbDevice>,
    active_format: Option<VideoFormat>,
    pool: Arc<BufferPool>,
    counters: Arc<StreamCounters>,
    lost: Arc<DeviceLostSignal>,
    stream: Option<BulkStream>,
    properties: Vec<Property>,
}

impl Afu050Device {
    #[instrument(skip_all)]
    pub fn open(session: &Arc<UsbSession>) -> Result<Self> {
        let vendor_id = crate::CONFIG.load().usb.vendor_id;
        let usb = UsbDevice::open(session, vendor_id, PRODUCT_ID_AFU050)?;
        usb.open_interface(CONTROL_INTERFACE)?;
        usb.open_interface(STREAMING_INTERFACE)?;
        info!("Opened AFU050");

        Ok(Self {
            usb: Arc::new(usb),
            active_format: None,
            pool: Arc::new(BufferPool::new()),
            counters: Arc::new(StreamCounters::new()),
            lost: Arc::new(DeviceLostSignal::new()),
            stream: None,
            properties: vec![
                Property::integer("SensorWidth", SENSOR_WIDTH.into(), SENSOR_WIDTH.into(), SENSOR_WIDTH.into(), 1)
                    .read_only(),
                Property::integer("SensorHeight", SENSOR_HEIGHT.into(), SENSOR_HEIGHT.into(), SENSOR_HEIGHT.into(), 1)
                    .read_only(),
            ],
        })
    }
}

impl CaptureDevice for Afu050Device {
    fn name(&self) -> &'static str {
        "AFU050"
    }

    fn available_video_formats(&self) -> Vec<VideoFormat> {
        FORMATS
            .iter()
            .map(|(w, h, fps, _)| VideoFormat::new(MJPG, *w, *h, *fps))
            .collect()
    }

    #[instrument(skip_all, fields(format = %format))]
    fn set_video_format(&mut self, format: &VideoFormat) -> Result<()> {
        if self.stream.is_some() {
            error!("Unable to set format. Stream is running.");
            return Err(Error::StreamRunning);
        }
        let Some(index) = frame_index(format) else {
            error!("Format is not supported. {}", format);
            return Err(Error::UnsupportedFormat(format.to_string()));
        };

        let payload = commit_payload(0, index, 0);
        let written = self
            .usb
            .class_set_cur(STREAMING_INTERFACE, VS_COMMIT_CONTROL, &payload)?;
        debug!("set_video_format transfer ended with {}", written);

        self.active_format = Some(*format);
        Ok(())
    }

    fn active_video_format(&self) -> Option<VideoFormat> {
        self.active_format
    }

    fn set_framerate(&mut self, framerate: f64) -> Result<()> {
        Err(Error::UnsupportedFormat(format!(
            "AFU050 frame rate is fixed per format, cannot set {framerate}"
        )))
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

        let config = crate::CONFIG.load();
        let jpeg_size = config.stream.jpeg_buffer_size;
        prepare_buffers(&self.pool, format, jpeg_size);
        self.counters.reset();
        self.lost.rearm();

        let output = FrameOutput::new(self.pool.clone(), Delivery::direct(sink), self.counters.clone());
        let running = Arc::new(AtomicBool::new(false));
        let engine = StreamEngine::new(
            JpegAssembler::new(output, jpeg_size),
            running.clone(),
            self.lost.clone(),
            config.stream.lost_countdown,
            self.counters.clone(),
        );

        info!("Starting stream...");
        let stream = BulkStream::start(
            self.usb.clone(),
            ENDPOINT_IN,
            TRANSFER_COUNT,
            TRANSFER_SIZE,
            running,
            Box::new(engine),
        )?;
        self.stream = Some(stream);
        Ok(())
    }

    #[instrument(skip_all)]
    fn stop_stream(&mut self) -> Result<()> {
        let mut stream = self.stream.take().ok_or(Error::StreamNotRunning)?;
        stream.stop(Duration::from_secs(2));
        self.pool.clear();
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
        find_property(&mut self.properties, name)?.set(value)
    }
}

impl Drop for Afu050Device {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let _ = self.stop_stream();
        }
    }
}

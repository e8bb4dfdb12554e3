use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tcam_usb::capture::afu420::HEADER_MAGIC_8BIT;
use tcam_usb::capture::{
    Afu420Assembler, CompletionHandler, DeliverThread, Delivery, DeviceLostSignal, FrameOutput,
    HeaderLayout, ImageSink, JpegAssembler, StreamEngine, TransferAction, TransferCompletion,
    TransferStatus,
};
use tcam_usb::image::format::{GBRG8, MJPG};
use tcam_usb::image::{ImageBuffer, VideoFormat};
use tcam_usb::pipeline::{BufferPool, StreamCounters};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 8;
const CHUNK: usize = 128;

/// Copies every frame and gives the buffer straight back
struct Collect {
    pool: Arc<BufferPool>,
    frames: Mutex<Vec<Vec<u8>>>,
}

impl ImageSink for Collect {
    fn push_image(&self, buffer: ImageBuffer) {
        self.frames.lock().unwrap().push(buffer.valid_data().to_vec());
        self.pool.requeue_buffer(buffer);
    }
}

/// Keeps every buffer it receives
#[derive(Default)]
struct Hold(Mutex<Vec<ImageBuffer>>);

impl ImageSink for Hold {
    fn push_image(&self, buffer: ImageBuffer) {
        self.0.lock().unwrap().push(buffer);
    }
}

struct Rig {
    pool: Arc<BufferPool>,
    counters: Arc<StreamCounters>,
    lost: Arc<DeviceLostSignal>,
    notified: Arc<AtomicUsize>,
}

impl Rig {
    fn new(format: VideoFormat, buffers: usize, size: usize) -> Self {
        let lost = Arc::new(DeviceLostSignal::new());
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        lost.set_callback(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });
        Self {
            pool: Arc::new(BufferPool::with_buffers(format, buffers, size)),
            counters: Arc::new(StreamCounters::new()),
            lost,
            notified,
        }
    }

    fn collector(&self) -> Arc<Collect> {
        Arc::new(Collect {
            pool: self.pool.clone(),
            frames: Mutex::new(Vec::new()),
        })
    }

    fn output(&self, delivery: Delivery) -> FrameOutput {
        FrameOutput::new(self.pool.clone(), delivery, self.counters.clone())
    }

    fn engine<A: tcam_usb::capture::FrameAssembler>(&self, assembler: A) -> StreamEngine<A> {
        StreamEngine::new(
            assembler,
            Arc::new(AtomicBool::new(true)),
            self.lost.clone(),
            20,
            self.counters.clone(),
        )
    }
}

fn afu420_rig(buffers: usize) -> Rig {
    Rig::new(VideoFormat::new(GBRG8, WIDTH, HEIGHT, 30.0), buffers, layout().image_size())
}

fn layout() -> HeaderLayout {
    HeaderLayout::new(WIDTH, HEIGHT, 8)
}

/// Header transfer followed by the first `payload` bytes of the frame
fn header_chunk(frame_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; layout().header_size()];
    data[..4].copy_from_slice(&HEADER_MAGIC_8BIT);
    data[0x10] = frame_id;
    data[0x4E] = WIDTH as u8;
    data[0x4C] = (WIDTH >> 8) as u8;
    data[0x5E] = HEIGHT as u8;
    data[0x5C] = (HEIGHT >> 8) as u8;
    data.extend_from_slice(payload);
    data
}

fn frame_bytes(seed: u8) -> Vec<u8> {
    (0..layout().image_size())
        .map(|i| (i as u8).wrapping_add(seed))
        .collect()
}

/// Feeds one full frame: header plus first chunk, then the rest in chunks
fn feed_frame<H: CompletionHandler>(engine: &mut H, frame_id: u8, image: &[u8]) {
    let first = header_chunk(frame_id, &image[..CHUNK]);
    assert_eq!(
        engine.on_transfer(TransferCompletion::completed(&first)),
        TransferAction::Resubmit
    );
    for chunk in image[CHUNK..].chunks(CHUNK) {
        assert_eq!(
            engine.on_transfer(TransferCompletion::completed(chunk)),
            TransferAction::Resubmit
        );
    }
}

#[test]
fn jpeg_frame_split_over_transfers_is_delivered_whole() {
    let rig = Rig::new(VideoFormat::new(MJPG, 640, 480, 30.0), 4, 4096);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let mut engine = rig.engine(JpegAssembler::new(rig.output(Delivery::direct(&dyn_sink)), 4096));

    let body: Vec<u8> = (0..100).map(|i| (i % 251) as u8).collect();
    let mut stream = vec![0x00, 0x11, 0xFF, 0xD8];
    stream.extend_from_slice(&body);
    stream.extend_from_slice(&[0xFF, 0xD9, 0x22]);

    for range in [0..3, 3..50, 50..105, 105..stream.len()] {
        let action = engine.on_transfer(TransferCompletion::completed(&stream[range]));
        assert_eq!(action, TransferAction::Resubmit);
    }

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], stream[2..106]);
    assert_eq!(rig.counters.frames_delivered(), 1);
    assert_eq!(rig.counters.frames_dropped(), 0);
    assert_eq!(rig.pool.free_count(), 4);
}

#[test]
fn start_marker_inside_frame_drops_it_and_rebuilds_the_next() {
    let stream = [0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD8, 0x03, 0x04, 0xFF, 0xD9];

    // Whole, and with the second SOI split across transfers
    for cut in [stream.len(), 5] {
        let rig = Rig::new(VideoFormat::new(MJPG, 640, 480, 30.0), 4, 4096);
        let sink = rig.collector();
        let dyn_sink: Arc<dyn ImageSink> = sink.clone();
        let mut engine = rig.engine(JpegAssembler::new(rig.output(Delivery::direct(&dyn_sink)), 4096));

        engine.on_transfer(TransferCompletion::completed(&stream[..cut]));
        engine.on_transfer(TransferCompletion::completed(&stream[cut..]));

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.as_slice(), &[stream[4..].to_vec()], "cut at {cut}");
        assert_eq!(rig.counters.frames_dropped(), 1);
        assert_eq!(rig.counters.frames_delivered(), 1);
        assert_eq!(rig.pool.free_count(), 4);
    }
}

#[test]
fn jpeg_starvation_at_end_marker_drops_the_frame() {
    let rig = Rig::new(VideoFormat::new(MJPG, 640, 480, 30.0), 1, 4096);
    let hold = Arc::new(Hold::default());
    let dyn_sink: Arc<dyn ImageSink> = hold.clone();
    let mut engine = rig.engine(JpegAssembler::new(rig.output(Delivery::direct(&dyn_sink)), 4096));

    let frame = [0xFF, 0xD8, 0x10, 0x20, 0x30, 0xFF, 0xD9];
    engine.on_transfer(TransferCompletion::completed(&frame));
    assert_eq!(rig.pool.free_count(), 0);

    engine.on_transfer(TransferCompletion::completed(&frame));
    assert_eq!(rig.counters.frames_dropped(), 1);
    assert_eq!(hold.0.lock().unwrap().len(), 1);
    assert!(!engine.assembler().is_accumulating());

    let returned = hold.0.lock().unwrap().pop().unwrap();
    rig.pool.requeue_buffer(returned);

    engine.on_transfer(TransferCompletion::completed(&frame));
    let held = hold.0.lock().unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].valid_data(), frame.as_slice());
    assert_eq!(rig.counters.frames_delivered(), 2);
    assert_eq!(rig.counters.frames_dropped(), 1);
}

#[test]
fn ff_ending_a_transfer_does_not_restart_a_frame_later_on() {
    let rig = Rig::new(VideoFormat::new(MJPG, 640, 480, 30.0), 4, 4096);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let mut engine = rig.engine(JpegAssembler::new(rig.output(Delivery::direct(&dyn_sink)), 4096));

    engine.on_transfer(TransferCompletion::completed(&[0x00, 0xFF]));
    engine.on_transfer(TransferCompletion::completed(&[
        0x00, 0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xD8, 0x02, 0xFF, 0xD9,
    ]));

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]]);
    assert_eq!(rig.counters.frames_delivered(), 1);
    assert_eq!(rig.counters.frames_dropped(), 0);
}

#[test]
fn header_stream_delivers_complete_frames() {
    let rig = afu420_rig(2);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let assembler = Afu420Assembler::new(rig.output(Delivery::direct(&dyn_sink)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);

    let first = frame_bytes(0);
    let second = frame_bytes(100);
    feed_frame(&mut engine, 1, &first);
    feed_frame(&mut engine, 2, &second);

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[first, second]);
    assert_eq!(engine.assembler().last_frame_id(), Some(2));
    assert_eq!(rig.counters.frames_dropped(), 0);
}

#[test]
fn short_frame_is_dropped_when_next_header_arrives() {
    let rig = afu420_rig(2);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let assembler = Afu420Assembler::new(rig.output(Delivery::direct(&dyn_sink)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);

    let image = frame_bytes(7);
    let head = header_chunk(1, &image[..CHUNK]);
    engine.on_transfer(TransferCompletion::completed(&head));
    engine.on_transfer(TransferCompletion::completed(&image[CHUNK..2 * CHUNK]));

    // Half the frame is missing
    let next = header_chunk(2, &image[..CHUNK]);
    engine.on_transfer(TransferCompletion::completed(&next));
    assert!(sink.frames.lock().unwrap().is_empty());
    assert_eq!(rig.counters.frames_dropped(), 1);

    for chunk in image[CHUNK..].chunks(CHUNK) {
        engine.on_transfer(TransferCompletion::completed(chunk));
    }
    assert_eq!(sink.frames.lock().unwrap().as_slice(), &[image]);
    assert_eq!(rig.pool.in_flight_count(), 0);
}

#[test]
fn trailer_ends_frame_when_incomplete_frames_are_kept() {
    let rig = afu420_rig(2);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let assembler = Afu420Assembler::new(rig.output(Delivery::direct(&dyn_sink)), layout(), CHUNK, false);
    let mut engine = rig.engine(assembler);

    let image = frame_bytes(3);
    let head = header_chunk(9, &image[..CHUNK]);
    engine.on_transfer(TransferCompletion::completed(&head));
    engine.on_transfer(TransferCompletion::completed(&image[CHUNK..2 * CHUNK]));
    // Short transfer, the device ended the frame early
    engine.on_transfer(TransferCompletion::completed(&image[2 * CHUNK..2 * CHUNK + 50]));

    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], image[..2 * CHUNK + 50]);
    assert_eq!(rig.counters.frames_dropped(), 0);
}

#[test]
fn buffer_starvation_drops_frames_until_one_is_returned() {
    let rig = afu420_rig(1);
    let hold = Arc::new(Hold::default());
    let dyn_sink: Arc<dyn ImageSink> = hold.clone();
    let assembler = Afu420Assembler::new(rig.output(Delivery::direct(&dyn_sink)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);

    let image = frame_bytes(11);
    feed_frame(&mut engine, 1, &image);
    assert_eq!(rig.pool.free_count(), 0);

    // No buffer: the frame is dropped and its data skipped
    feed_frame(&mut engine, 2, &image);
    assert_eq!(rig.counters.frames_dropped(), 1);
    assert_eq!(hold.0.lock().unwrap().len(), 1);

    let returned = hold.0.lock().unwrap().pop().unwrap();
    rig.pool.requeue_buffer(returned);

    feed_frame(&mut engine, 3, &image);
    let held = hold.0.lock().unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].valid_data(), image.as_slice());
    assert_eq!(rig.counters.frames_delivered(), 2);
}

#[test]
fn deliver_thread_hands_frames_over_before_finish_returns() {
    let rig = afu420_rig(4);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let thread = DeliverThread::start(
        Arc::downgrade(&dyn_sink),
        rig.pool.clone(),
        rig.counters.clone(),
        4,
    )
    .unwrap();
    let assembler = Afu420Assembler::new(rig.output(Delivery::Thread(thread)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);

    let images: Vec<_> = (0..3).map(|seed| frame_bytes(seed * 13)).collect();
    for (id, image) in images.iter().enumerate() {
        feed_frame(&mut engine, id as u8, image);
    }

    // Joins the deliver thread after draining its queue
    engine.finish();

    assert_eq!(sink.frames.lock().unwrap().as_slice(), images.as_slice());
    assert_eq!(rig.pool.in_flight_count(), 0);
    assert_eq!(rig.counters.frames_delivered(), 3);
    assert_eq!(rig.counters.frames_dropped(), 0);
}

#[test]
fn deliver_thread_counts_frames_for_an_expired_sink_as_dropped_only() {
    let rig = afu420_rig(2);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let thread = DeliverThread::start(
        Arc::downgrade(&dyn_sink),
        rig.pool.clone(),
        rig.counters.clone(),
        4,
    )
    .unwrap();
    let assembler = Afu420Assembler::new(rig.output(Delivery::Thread(thread)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);
    drop(dyn_sink);
    drop(sink);

    feed_frame(&mut engine, 1, &frame_bytes(5));
    engine.finish();

    assert_eq!(rig.counters.frames_delivered(), 0);
    assert_eq!(rig.counters.frames_dropped(), 1);
    assert_eq!(rig.pool.in_flight_count(), 0);
}

#[test]
fn device_loss_is_reported_once() {
    let rig = afu420_rig(2);
    let sink = rig.collector();
    let dyn_sink: Arc<dyn ImageSink> = sink.clone();
    let assembler = Afu420Assembler::new(rig.output(Delivery::direct(&dyn_sink)), layout(), CHUNK, true);
    let mut engine = rig.engine(assembler);

    let image = frame_bytes(0);
    let head = header_chunk(1, &image[..CHUNK]);
    engine.on_transfer(TransferCompletion::completed(&head));

    let gone = TransferCompletion::failed(TransferStatus::NoDevice);
    assert_eq!(engine.on_transfer(gone), TransferAction::Release);
    assert_eq!(engine.on_transfer(gone), TransferAction::Release);
    assert_eq!(
        engine.on_transfer(TransferCompletion::completed(&image[CHUNK..2 * CHUNK])),
        TransferAction::Release
    );

    assert_eq!(rig.notified.load(Ordering::SeqCst), 1);
    assert!(rig.lost.is_lost());
    assert!(!engine.is_running());
    // The partial frame went back to the pool
    assert_eq!(rig.pool.in_flight_count(), 0);
    assert!(sink.frames.lock().unwrap().is_empty());
}

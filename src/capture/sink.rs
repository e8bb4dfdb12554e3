//! Frame consumers and the hand-off paths into them

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use flume::{Sender, TrySendError};
use tracing::{debug, error, trace};

use crate::image::ImageBuffer;
use crate::pipeline::{BufferPool, StreamCounters};
use crate::Result;

/// Receiver of completed frames.
///
/// Streams only keep a weak reference; once the sink is dropped frames are
/// returned to the pool and counted as dropped.
pub trait ImageSink: Send + Sync {
    /// Called exactly once per completed frame. The buffer goes back to the
    /// pool through `BufferPool::requeue_buffer` when the consumer is done.
    fn push_image(&self, buffer: ImageBuffer);

    /// Whether frames with missing data should be discarded by transports
    /// able to detect them
    fn should_incomplete_frames_be_dropped(&self) -> bool {
        true
    }
}

/// How a finished frame reaches the sink
pub enum Delivery {
    /// `push_image` runs on the USB event thread
    Direct(Weak<dyn ImageSink>),
    /// `push_image` runs on a dedicated thread, which also counts the
    /// frame as delivered or dropped
    Thread(DeliverThread),
}

impl Delivery {
    pub fn direct(sink: &Arc<dyn ImageSink>) -> Self {
        Delivery::Direct(Arc::downgrade(sink))
    }

    /// Hands `buffer` over, giving it back when the sink cannot take it
    pub fn deliver(&self, buffer: ImageBuffer) -> std::result::Result<(), ImageBuffer> {
        match self {
            Delivery::Direct(sink) => match sink.upgrade() {
                Some(sink) => {
                    sink.push_image(buffer);
                    Ok(())
                }
                None => {
                    error!("ImageSink expired. Unable to deliver images.");
                    Err(buffer)
                }
            },
            Delivery::Thread(thread) => thread.push(buffer),
        }
    }

    pub fn stop(&mut self) {
        if let Delivery::Thread(thread) = self {
            thread.stop();
        }
    }
}

/// Forwards frames to a sink from its own thread so slow consumers do not
/// stall USB event handling
pub struct DeliverThread {
    tx: Option<Sender<ImageBuffer>>,
    handle: Option<JoinHandle<()>>,
}

impl DeliverThread {
    pub fn start(
        sink: Weak<dyn ImageSink>,
        pool: Arc<BufferPool>,
        counters: Arc<StreamCounters>,
        capacity: usize,
    ) -> Result<Self> {
        let (tx, rx) = flume::bounded::<ImageBuffer>(capacity.max(1));

        let handle = thread::Builder::new()
            .name("tcam-deliver".into())
            .spawn(move || {
                for buffer in rx.iter() {
                    match sink.upgrade() {
                        Some(sink) => {
                            sink.push_image(buffer);
                            counters.frame_delivered();
                        }
                        None => {
                            error!("ImageSink expired. Unable to deliver images.");
                            counters.frame_dropped();
                            pool.requeue_buffer(buffer);
                        }
                    }
                }
                debug!("Deliver thread finished");
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn push(&self, buffer: ImageBuffer) -> std::result::Result<(), ImageBuffer> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(buffer);
        };
        tx.try_send(buffer).map_err(|e| {
            if let TrySendError::Full(_) = e {
                trace!("Deliver queue full");
            }
            e.into_inner()
        })
    }

    /// Drains queued frames into the sink and joins the thread
    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Deliver thread panicked");
            }
        }
    }
}

impl Drop for DeliverThread {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Streams a USB bulk camera into a counting sink until Ctrl-C

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tcam_usb::capture::ImageSink;
use tcam_usb::device;
use tcam_usb::image::ImageBuffer;
use tcam_usb::pipeline::BufferPool;
use tcam_usb::usb::UsbSession;

/// Counts frames and hands every buffer straight back to the pool
struct CountingSink {
    pool: Arc<BufferPool>,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl ImageSink for CountingSink {
    fn push_image(&self, buffer: ImageBuffer) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(buffer.valid_data_length() as u64, Ordering::Relaxed);
        self.pool.requeue_buffer(buffer);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcam_usb=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("tcam-usb launching...");

    // Load configuration
    let path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("tcam-usb.toml"), PathBuf::from);
    let config = tcam_usb::load_config(Some(path.as_path()))?;
    tcam_usb::set_config(config.clone());

    let session = Arc::new(UsbSession::from_config()?);
    let mut camera = device::open_device(&session, config.usb.product_id)?;

    let format = camera
        .available_video_formats()
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("{} offers no video formats", camera.name()))?;
    camera.set_video_format(&format)?;
    info!("Using {} with {}", camera.name(), format);

    let lost = Arc::new(Notify::new());
    {
        let lost = lost.clone();
        camera.set_device_lost_callback(Box::new(move || lost.notify_one()));
    }

    let counting = Arc::new(CountingSink {
        pool: camera.buffer_pool().clone(),
        frames: AtomicU64::new(0),
        bytes: AtomicU64::new(0),
    });
    let sink: Arc<dyn ImageSink> = counting.clone();
    camera.start_stream(&sink)?;

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = lost.notified() => {
                error!("{} was lost, stopping", camera.name());
                break;
            }
            _ = report.tick() => {
                let counters = camera.counters();
                info!(
                    "frames {} ({} bytes), delivered {}, dropped {}, transfer errors {}",
                    counting.frames.load(Ordering::Relaxed),
                    counting.bytes.load(Ordering::Relaxed),
                    counters.frames_delivered(),
                    counters.frames_dropped(),
                    counters.transfer_errors()
                );
            }
        }
    }

    // Stopping joins the deliver thread and waits for transfers to retire
    let result = tokio::task::spawn_blocking(move || {
        let result = camera.stop_stream();
        drop(camera);
        result
    })
    .await?;
    if let Err(e) = result {
        warn!("Stopping stream: {}", e);
    }

    info!("tcam-usb shutting down");
    Ok(())
}

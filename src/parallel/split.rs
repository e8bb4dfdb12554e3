//! Splits image transforms into horizontal strips run on the work pool

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::trace;

use super::latch::Latch;
use super::work_pool::{acquire_default_work_pool, get_logical_cpu_count, WorkItem, WorkPoolHandle};
use crate::image::{ImageView, ImageViewMut};
use crate::Result;

/// Upper bound of strips per transform call
pub const MAX_WORK_ITEM_COUNT: usize = 32;

/// Images with fewer lines always run on the calling thread
const MIN_SPLIT_IMAGE_HEIGHT: u32 = 128;
const MIN_STRIP_HEIGHT: u32 = 64;

/// A transform from a source image to a destination image of the same height.
///
/// `call` runs concurrently on disjoint strips of the same image pair, so
/// implementations may only hold shared state. A call must not panic.
pub trait Transform: Sync {
    fn call(&self, dst: ImageViewMut<'_>, src: ImageView<'_>);
}

impl<F> Transform for F
where
    F: Fn(ImageViewMut<'_>, ImageView<'_>) + Sync,
{
    fn call(&self, dst: ImageViewMut<'_>, src: ImageView<'_>) {
        self(dst, src)
    }
}

/// Result of [`calc_split_height`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    /// Lines per strip, 0 when the image should not be split
    pub split_height: u32,
    /// Number of strips; the last one absorbs the remainder
    pub split_count: usize,
}

impl SplitPlan {
    const NONE: SplitPlan = SplitPlan {
        split_height: 0,
        split_count: 1,
    };

    pub fn is_split(&self) -> bool {
        self.split_height != 0
    }
}

/// Picks a strip height for `image_height` lines and at most
/// `suggested_split_count` strips.
///
/// A non zero height is a multiple of 4 and at least 64 lines.
pub fn calc_split_height(image_height: u32, suggested_split_count: usize) -> SplitPlan {
    if suggested_split_count <= 1 || image_height < MIN_SPLIT_IMAGE_HEIGHT {
        return SplitPlan::NONE;
    }

    let mut split_count = suggested_split_count as u32;
    if image_height / split_count < MIN_STRIP_HEIGHT {
        split_count = image_height / MIN_STRIP_HEIGHT + 1;
    }

    while split_count > 1 {
        let single_height = image_height / split_count;
        let single_height = single_height - single_height % 4;

        if single_height >= MIN_STRIP_HEIGHT {
            return SplitPlan {
                split_height: single_height,
                split_count: split_count as usize,
            };
        }
        split_count -= 1;
    }
    SplitPlan::NONE
}

/// Strip `index` of `image`, see [`ImageView::split`]
pub fn split_image_buffer<'a>(
    image: &ImageView<'a>,
    index: usize,
    split_height: u32,
    is_last_item: bool,
) -> ImageView<'a> {
    image.split(index, split_height, is_last_item)
}

struct SplitImageContext<'a, F: ?Sized> {
    func: &'a F,
    split_dst: Mutex<Option<ImageViewMut<'a>>>,
    split_src: ImageView<'a>,
}

impl<F: Transform + ?Sized> WorkItem for SplitImageContext<'_, F> {
    fn do_one(&self) {
        let dst = self
            .split_dst
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dst) = dst {
            self.func.call(dst, self.split_src);
        }
    }
}

/// Per user state for running split transforms; holds a reference on the
/// default work pool for its lifetime.
pub struct ParallelState {
    pool: WorkPoolHandle,
    img_ready_latch: Arc<Latch>,
    default_concurrency: usize,
}

impl ParallelState {
    pub fn new() -> Result<Self> {
        let configured = crate::CONFIG.load().parallel.max_concurrency;
        Ok(Self {
            pool: acquire_default_work_pool()?,
            img_ready_latch: Arc::new(Latch::default()),
            default_concurrency: if configured == 0 {
                get_logical_cpu_count()
            } else {
                configured
            },
        })
    }

    pub fn default_concurrency(&self) -> usize {
        self.default_concurrency
    }

    /// Runs `func` over `dst`/`src`, split into strips when the image is
    /// large enough. `max_conc == 0` uses the default concurrency.
    pub fn queue_and_wait<F: Transform + ?Sized>(
        &mut self,
        func: &F,
        dst: ImageViewMut<'_>,
        src: ImageView<'_>,
        max_conc: usize,
    ) {
        let max_conc = if max_conc == 0 {
            self.default_concurrency
        } else {
            max_conc
        };
        let split_count = MAX_WORK_ITEM_COUNT.min(max_conc);

        let plan = calc_split_height(src.height, split_count);
        if !plan.is_split() {
            func.call(dst, src);
            return;
        }

        let start = Instant::now();
        let items = construct_from_split(func, dst, src, plan);
        self.pool
            .queue_items_and_wait(&self.img_ready_latch, &items);

        let elapsed = start.elapsed();
        metrics::histogram!("tcam_split_time_us").record(elapsed.as_micros() as f64);
        trace!(
            "Split transform over {} strips of {} lines took {:?}",
            plan.split_count,
            plan.split_height,
            elapsed
        );
    }
}

fn construct_from_split<'a, F: Transform + ?Sized>(
    func: &'a F,
    dst: ImageViewMut<'a>,
    src: ImageView<'a>,
    plan: SplitPlan,
) -> Vec<SplitImageContext<'a, F>> {
    dst.into_strips(plan.split_height, plan.split_count)
        .into_iter()
        .enumerate()
        .map(|(index, split_dst)| {
            let is_last_item = index + 1 == plan.split_count;
            SplitImageContext {
                func,
                split_dst: Mutex::new(Some(split_dst)),
                split_src: split_image_buffer(&src, index, plan.split_height, is_last_item),
            }
        })
        .collect()
}

//! Thread coordination and row-split parallelism for image transforms

pub mod latch;
pub mod semaphore;
pub mod split;
pub mod work_pool;

pub use latch::Latch;
pub use semaphore::Semaphore;
pub use split::{
    calc_split_height, split_image_buffer, ParallelState, SplitPlan, Transform, MAX_WORK_ITEM_COUNT,
};
pub use work_pool::{
    acquire_default_work_pool, default_work_pool_refs, get_logical_cpu_count, release_default_work_pool, WorkItem,
    WorkPool, WorkPoolHandle,
};

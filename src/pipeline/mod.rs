pub mod pool;
pub mod stats;

pub use pool::BufferPool;
pub use stats::StreamCounters;

pub mod pool;

pub use pool::{PoolSettings, WorkerEvent, WorkerPool};

// Re-export crossbeam_channel for pool consumers
pub use crossbeam_channel;

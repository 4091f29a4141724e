pub mod worker_pool;

pub use worker_pool::{PoolStats, WorkerPool};

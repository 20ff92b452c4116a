pub mod pool;

pub use pool::{JobOutcome, WorkerPool};

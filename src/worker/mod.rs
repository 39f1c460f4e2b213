//! Worker system: bounded slots that execute claimed tasks.
//!
//! - `pool`: `WorkerPool` slot loops and outcome persistence
//! - `cancel`: `CancelRegistry` mapping running tasks to cancellation tokens

pub mod cancel;
pub mod pool;

pub use cancel::CancelRegistry;
pub use pool::{WorkerDeps, WorkerPool};

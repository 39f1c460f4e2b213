//! Work Engine: durable, dependency-aware task execution.

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;

pub use config::EngineConfig;
pub use engine::WorkEngine;
pub use error::{Error, Result};
pub use events::{EngineEvent, EventType};
pub use task::{NewTask, Priority, Task, TaskFilter, TaskStatus};

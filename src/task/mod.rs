//! Task records and their state machine.

pub mod model;
pub mod state;

pub use model::{LogLevel, NewTask, Priority, Task, TaskFilter, TaskLogEntry};
pub use state::TaskStatus;

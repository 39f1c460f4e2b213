//! Persistence layer: libSQL-backed storage for tasks, dependency edges and logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use traits::{TaskMutation, TaskStore};

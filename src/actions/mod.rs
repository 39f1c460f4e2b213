//! Action layer: the handler interface, the command denylist, the dispatcher
//! and the built-in handlers.

pub mod builtin;
pub mod dispatcher;
pub mod handler;
pub mod safety;

pub use dispatcher::ActionDispatcher;
pub use handler::{ActionContext, ActionHandler, ActionOutput, ProgressReporter};
pub use safety::CommandFilter;

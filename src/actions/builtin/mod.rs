//! Built-in action handlers.

pub mod analysis;
pub mod file;
pub mod http;
pub mod process;
pub mod script;
pub mod shell;

pub use analysis::{AnalysisCallback, AnalysisCallbackHandler, AnalysisInput};
pub use file::FileOperationHandler;
pub use http::HttpRequestHandler;
pub use script::ScriptExecutionHandler;
pub use shell::ShellCommandHandler;

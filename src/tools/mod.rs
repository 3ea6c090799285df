//! 工具层：Tool trait 与注册表、带超时与重试的分发器、演示用 echo 工具

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolDispatcher;
pub use registry::{Tool, ToolError, ToolRegistry};

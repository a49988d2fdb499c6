//! 工具箱：处理器注册表与执行器

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{ToolHandler, ToolRegistry};

//! Tool system: the `Tool` trait, the registry and the invoker.

pub mod invoker;
pub mod registry;
pub mod traits;

pub use invoker::{ToolInvoker, ToolOutcome};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolExecutionContext, ToolResult};

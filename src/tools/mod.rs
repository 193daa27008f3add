pub mod builtin;
pub mod handler;
pub mod registry;
pub mod schema;

pub use builtin::memory_tools;
pub use handler::{
    OutputSize, Permission, PermissionScope, RiskLevel, Tool, ToolContext, ToolDefinition,
};
pub use registry::ToolRegistry;

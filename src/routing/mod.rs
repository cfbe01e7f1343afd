//! Routing module for directing capability calls to providers

pub mod router;
pub mod types;

pub use router::ToolRouter;
pub use types::ToolOutput;

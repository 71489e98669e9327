//! Remote tool sources: MCP over JSON-RPC 2.0 on child-process stdio.
//!
//! This module handles:
//! - Spawning source processes and the initialize handshake
//! - Line-delimited JSON-RPC request/response exchange
//! - Tool discovery (`tools/list`) and invocation (`tools/call`)
//!
//! The agent manager wraps discovered tools into namespaced tool
//! definitions; dispatch never special-cases remote tools.

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{RemoteToolSources, ToolSource};
pub use errors::McpError;
pub use types::{McpToolDefinition, ServerConfig};

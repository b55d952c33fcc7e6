//! MCP tool subsystem: the per-session tool registry and router, the
//! device-side MCP client (JSON-RPC multiplexed over the control
//! channel), in-process tool handlers, and external stdio-spawned tool
//! servers.

pub mod action;
pub mod client;
pub mod device;
pub mod local;
pub mod registry;
pub mod router;
pub mod stdio;

pub use action::ActionResponse;
pub use client::McpClient;
pub use device::DeviceMcpClient;
pub use local::LocalToolClient;
pub use registry::{sanitize_name, ToolRegistry};
pub use router::ToolRouter;
pub use stdio::StdioMcpServer;

use std::sync::Arc;

/// The MCP member of a session's provider set: one device client plus
/// a router over every tool source available to the session.
///
/// The device client holds only an outbound message sender — never the
/// session that owns it — so resetting clears the transport handle and
/// the bundle is reusable across sessions when returned to the pool.
pub struct SessionMcp {
    pub device: Arc<DeviceMcpClient>,
    pub router: ToolRouter,
}

impl SessionMcp {
    /// Assemble the per-session bundle. `shared` are the process-wide
    /// clients (local handlers, stdio servers) reused by every session;
    /// routing order is shared clients first, then the device.
    pub fn new(shared: Vec<Arc<dyn McpClient>>) -> Self {
        let device = Arc::new(DeviceMcpClient::new());
        let mut clients = shared;
        clients.push(device.clone() as Arc<dyn McpClient>);
        Self {
            device,
            router: ToolRouter::new(clients),
        }
    }

    /// All tool definitions visible to this session's LLM.
    pub fn tool_definitions(&self) -> Vec<vx_domain::message::ToolDefinition> {
        self.router.tool_definitions()
    }

    /// Clear session-scoped state so the bundle can be pooled.
    pub fn reset(&self) {
        self.device.reset();
        self.router.clear_cache();
    }
}

use serde_json::Value;

use vx_domain::error::Result;
use vx_domain::message::ToolDefinition;

use crate::action::ActionResponse;

/// A source of tools the router can dispatch to: the in-process
/// handler set, the device-side MCP client, or an external stdio
/// server. Clients are consulted in registration order; the first one
/// that claims a tool owns the call.
#[async_trait::async_trait]
pub trait McpClient: Send + Sync {
    /// Stable identifier for logs.
    fn client_id(&self) -> &str;

    /// Whether this client currently serves `name` (sanitized or
    /// original form).
    fn has_tool(&self, name: &str) -> bool;

    /// The tools this client exposes to the LLM.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a tool. Implementations resolve sanitized names back to
    /// their wire form where needed.
    async fn call_tool(&self, name: &str, args: &Value) -> Result<ActionResponse>;
}

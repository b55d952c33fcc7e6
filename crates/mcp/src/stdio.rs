//! External stdio-spawned MCP tool servers.
//!
//! Each configured server is a child process speaking newline-delimited
//! JSON-RPC on stdin/stdout. Servers are spawned once at startup and
//! shared by every session.
//!
//! Correlation works the same way as the device-side client: a
//! background pump task owns the child's stdout, parses each line, and
//! settles the matching waiter in a pending map keyed by request id.
//! Requests from concurrent sessions can therefore be in flight at
//! once; nothing lock-steps on the child. When the pump sees EOF or an
//! unreadable stream it marks the server dead and fails every waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::oneshot;

use vx_domain::config::McpServerConfig;
use vx_domain::error::{Error, Result};
use vx_domain::message::ToolDefinition;
use vx_protocol::rpc::{
    self, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolsListResult,
};

use crate::action::ActionResponse;
use crate::client::McpClient;
use crate::registry::ToolRegistry;

/// How long one JSON-RPC round-trip may take. External servers are
/// local processes; anything slower than this is stuck.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period between closing stdin and killing the child.
const EXIT_GRACE: Duration = Duration::from_secs(3);

type WaiterMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// One spawned MCP server process with its discovered tools.
pub struct StdioMcpServer {
    id: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    waiters: WaiterMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    pump: tokio::task::JoinHandle<()>,
    registry: ToolRegistry,
}

/// Route stdout lines to their waiters until the child goes away.
/// Anything that does not parse as a response (server logging,
/// notifications) is skipped; an unmatched id is a stale reply whose
/// waiter already timed out.
async fn pump_stdout(
    server_id: String,
    stdout: ChildStdout,
    waiters: WaiterMap,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let resp = match serde_json::from_str::<JsonRpcResponse>(line.trim()) {
                    Ok(resp) => resp,
                    Err(_) => {
                        tracing::debug!(server_id = %server_id, "skipping non-response stdout line");
                        continue;
                    }
                };
                match waiters.lock().remove(&resp.id) {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        tracing::debug!(server_id = %server_id, id = resp.id, "stale reply, no waiter");
                    }
                }
            }
            Ok(None) => {
                tracing::info!(server_id = %server_id, "MCP server closed its stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %e, "MCP server stdout unreadable");
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    // Dropping the senders fails every outstanding request.
    waiters.lock().clear();
}

impl StdioMcpServer {
    /// Spawn the process, run the MCP handshake, and discover tools.
    pub async fn initialize(config: &McpServerConfig) -> Result<Self> {
        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // A failed handshake drops the handle; the child must not
            // outlive it.
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Tool(format!("{}: child stdin unavailable", config.id)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tool(format!("{}: child stdout unavailable", config.id)))?;

        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_stdout(
            config.id.clone(),
            stdout,
            waiters.clone(),
            alive.clone(),
        ));

        let server = Self {
            id: config.id.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            waiters,
            next_id: AtomicU64::new(1),
            alive,
            pump,
            registry: ToolRegistry::new(),
        };

        server.handshake().await?;
        Ok(server)
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn handshake(&self) -> Result<()> {
        let params = serde_json::to_value(rpc::initialize_params(None))?;
        let init = self.request("initialize", Some(params)).await?;
        if let Err(e) = init.into_result() {
            return Err(Error::Tool(format!("{}: initialize rejected: {e}", self.id)));
        }

        self.notify("notifications/initialized").await?;

        match self.request("tools/list", None).await?.into_result() {
            Ok(listing) => match serde_json::from_value::<ToolsListResult>(listing) {
                Ok(page) => {
                    let defs: Vec<ToolDefinition> = page
                        .tools
                        .iter()
                        .map(|t| ToolDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        })
                        .collect();
                    self.registry.register(defs)?;
                }
                Err(e) => {
                    tracing::warn!(server_id = %self.id, error = %e, "tools/list payload did not parse");
                }
            },
            Err(e) => {
                tracing::warn!(server_id = %self.id, error = %e, "tools/list rejected; no tools offered");
            }
        }

        tracing::info!(server_id = %self.id, tools = self.registry.len(), "MCP server ready");
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn write_json(&self, json: String) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            self.alive.store(false, Ordering::Release);
            return Err(Error::Tool(format!("{}: write failed: {e}", self.id)));
        }
        Ok(())
    }

    /// One id-correlated round-trip through the pending map.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.is_alive() {
            return Err(Error::Tool(format!("{}: server is down", self.id)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        tracing::debug!(server_id = %self.id, id, method, "rpc request");
        if let Err(e) = self.write_json(serde_json::to_string(&request)?).await {
            self.waiters.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::Tool(format!("{}: server exited mid-call", self.id))),
            Err(_) => {
                self.waiters.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "{}: {method} took over {}s",
                    self.id,
                    RPC_TIMEOUT.as_secs()
                )))
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let notification = JsonRpcNotification::new(method);
        self.write_json(serde_json::to_string(&notification)?).await
    }

    /// Stop the pump, close stdin, and give the child a short grace
    /// period before killing it.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.pump.abort();
        self.waiters.lock().clear();

        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
            tracing::warn!(server_id = %self.id, "MCP server ignored stdin close, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(server_id = %self.id, error = %e, "kill failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl McpClient for StdioMcpServer {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn has_tool(&self, name: &str) -> bool {
        self.is_alive() && self.registry.is_mcp_tool(name)
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        if !self.is_alive() {
            return Vec::new();
        }
        self.registry.list()
    }

    async fn call_tool(&self, name: &str, args: &Value) -> Result<ActionResponse> {
        let wire_name = self
            .registry
            .original_name(name)
            .unwrap_or_else(|| name.to_string());

        let resp = self
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": wire_name, "arguments": args })),
            )
            .await?;

        let result = match resp.into_result() {
            Ok(v) => v,
            Err(e) => return Ok(ActionResponse::Error(e.message)),
        };

        let parsed: ToolCallResult = match serde_json::from_value(result.clone()) {
            Ok(p) => p,
            Err(_) => return Ok(ActionResponse::Response(result.to_string())),
        };

        let first_text = parsed
            .content
            .first()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.clone());

        if parsed.is_error {
            return Ok(ActionResponse::Error(
                first_text.unwrap_or_else(|| format!("{wire_name} failed")),
            ));
        }
        Ok(match first_text {
            Some(text) => ActionResponse::ReqLlm(text),
            None => ActionResponse::Response(result.to_string()),
        })
    }
}

//! Device-side MCP client.
//!
//! Devices can host tools of their own (camera, speaker volume, local
//! state). This client speaks JSON-RPC 2.0 to the device over the same
//! control channel as everything else, wrapped in `{type:"mcp"}`
//! envelopes.
//!
//! Handshake: on bind send `initialize` (id 1); its response triggers
//! `tools/list` (id 2, reused across paginated continuations); when the
//! final page arrives (absent or empty `nextCursor`) the client becomes
//! ready. Tool calls allocate ids from 3 upwards and correlate the
//! response through a pending map with a 30 second timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use vx_domain::error::{Error, Result};
use vx_domain::message::ToolDefinition;
use vx_protocol::rpc::{
    self, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolCallResult, ToolsListResult,
    VisionCapability, FIRST_CALL_ID, INITIALIZE_ID, TOOLS_LIST_ID,
};
use vx_protocol::ServerMessage;

use crate::action::{handlers, ActionResponse};
use crate::client::McpClient;
use crate::registry::ToolRegistry;

/// How long a `tools/call` waits for the device.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    New,
    AwaitingInit,
    ListingTools,
    Ready,
    Closed,
}

type PendingSender = oneshot::Sender<std::result::Result<Value, JsonRpcError>>;

/// JSON-RPC-over-control-channel client for device-hosted tools.
///
/// Holds only an outbound message sender — never the session that owns
/// it — so it is reusable across sessions once reset.
pub struct DeviceMcpClient {
    state: Mutex<DeviceState>,
    outbound: Mutex<Option<mpsc::Sender<ServerMessage>>>,
    session_id: Mutex<String>,
    vision: Mutex<Option<VisionCapability>>,
    registry: ToolRegistry,
    pending: Mutex<HashMap<u64, PendingSender>>,
    next_call_id: AtomicU64,
    ready_tx: watch::Sender<bool>,
}

impl Default for DeviceMcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMcpClient {
    pub fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(DeviceState::New),
            outbound: Mutex::new(None),
            session_id: Mutex::new(String::new()),
            vision: Mutex::new(None),
            registry: ToolRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(FIRST_CALL_ID),
            ready_tx,
        }
    }

    /// Attach to a session's outbound channel and start the handshake.
    pub async fn bind(
        &self,
        outbound: mpsc::Sender<ServerMessage>,
        session_id: &str,
        vision: Option<VisionCapability>,
    ) -> Result<()> {
        {
            *self.outbound.lock() = Some(outbound);
            *self.session_id.lock() = session_id.to_string();
            *self.vision.lock() = vision.clone();
            *self.state.lock() = DeviceState::AwaitingInit;
        }

        let params = rpc::initialize_params(vision);
        let req = JsonRpcRequest::new(
            INITIALIZE_ID,
            "initialize",
            Some(serde_json::to_value(&params)?),
        );
        self.send_rpc(serde_json::to_value(&req)?).await
    }

    async fn send_rpc(&self, payload: Value) -> Result<()> {
        let (sender, session_id) = {
            let outbound = self.outbound.lock();
            let sender = outbound
                .as_ref()
                .cloned()
                .ok_or_else(|| Error::Tool("device MCP client is not bound".into()))?;
            (sender, self.session_id.lock().clone())
        };

        sender
            .send(ServerMessage::Mcp {
                session_id,
                payload,
            })
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Wait until tool discovery completes (or the timeout fires).
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == DeviceState::Ready
    }

    // ── Inbound dispatch ───────────────────────────────────────────

    /// Handle one JSON-RPC payload arriving from the device.
    pub async fn handle_payload(&self, payload: Value) {
        // Device-initiated requests/notifications carry a `method`;
        // only responses are expected here.
        if payload.get("method").is_some() {
            tracing::debug!("ignoring device-initiated MCP request");
            return;
        }

        let resp: JsonRpcResponse = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(_) => {
                tracing::debug!(
                    payload = %payload,
                    "ignoring non-response MCP payload from device"
                );
                return;
            }
        };

        if let Some(err) = resp.error {
            self.handle_error_response(resp.id, err);
            return;
        }
        let result = resp.result.unwrap_or(Value::Null);

        match resp.id {
            INITIALIZE_ID => self.on_initialized().await,
            TOOLS_LIST_ID => self.on_tools_page(result).await,
            id => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(result));
                    }
                    None => {
                        tracing::warn!(id, "MCP response for unknown request id");
                    }
                }
            }
        }
    }

    fn handle_error_response(&self, id: u64, err: JsonRpcError) {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                tracing::warn!(id, code = err.code, message = %err.message, "device MCP error");
            }
        }
    }

    async fn on_initialized(&self) {
        {
            let mut state = self.state.lock();
            if *state != DeviceState::AwaitingInit {
                tracing::debug!(state = ?*state, "unexpected initialize response");
                return;
            }
            *state = DeviceState::ListingTools;
        }
        if let Err(e) = self.request_tools_page(None).await {
            tracing::warn!(error = %e, "failed to request tools/list");
        }
    }

    async fn request_tools_page(&self, cursor: Option<String>) -> Result<()> {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        let req = JsonRpcRequest::new(TOOLS_LIST_ID, "tools/list", params);
        self.send_rpc(serde_json::to_value(&req)?).await
    }

    async fn on_tools_page(&self, result: Value) {
        let page: ToolsListResult = match serde_json::from_value(result) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse tools/list result");
                return;
            }
        };

        let defs: Vec<ToolDefinition> = page
            .tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect();
        if let Err(e) = self.registry.register(defs) {
            tracing::warn!(error = %e, "rejected device tool registration");
        }

        if page.has_more() {
            let cursor = page.next_cursor.unwrap_or_default();
            if let Err(e) = self.request_tools_page(Some(cursor)).await {
                tracing::warn!(error = %e, "failed to request next tools/list page");
            }
            return;
        }

        *self.state.lock() = DeviceState::Ready;
        let _ = self.ready_tx.send(true);
        tracing::info!(tools = self.registry.len(), "device MCP ready");
    }

    // ── Outbound calls ─────────────────────────────────────────────

    async fn call_device_tool(&self, name: &str, args: &Value) -> Result<ActionResponse> {
        if !self.is_ready() {
            return Err(Error::Tool("device MCP client is not ready".into()));
        }

        // Route under the wire name the device advertised.
        let wire_name = self
            .registry
            .original_name(name)
            .unwrap_or_else(|| name.to_string());

        let id = self.next_call_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = JsonRpcRequest::new(
            id,
            "tools/call",
            Some(serde_json::json!({ "name": wire_name, "arguments": args })),
        );
        if let Err(e) = self.send_rpc(serde_json::to_value(&req)?).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(interpret_result(&wire_name, result)),
            Ok(Ok(Err(rpc_err))) => Ok(ActionResponse::Error(rpc_err.message)),
            Ok(Err(_)) => Err(Error::Tool("device MCP client was reset".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!(
                    "tools/call {wire_name} timed out after {}s",
                    CALL_TIMEOUT.as_secs()
                )))
            }
        }
    }

    // ── Reset ──────────────────────────────────────────────────────

    /// Drop all session state so the client can be pooled: pending
    /// waiters fail, the registry and transport handle are cleared,
    /// and the ready flag is re-armed.
    pub fn reset(&self) {
        *self.state.lock() = DeviceState::New;
        *self.outbound.lock() = None;
        self.session_id.lock().clear();
        *self.vision.lock() = None;
        self.registry.clear();
        self.pending.lock().clear();
        self.next_call_id.store(FIRST_CALL_ID, Ordering::Release);
        let _ = self.ready_tx.send(false);
    }

    /// Mark the client closed (no further binds expected).
    pub fn close(&self) {
        *self.state.lock() = DeviceState::Closed;
        self.pending.lock().clear();
    }
}

/// Interpret a `tools/call` result per tool semantics: camera captures
/// route to the photo handler, plain text feeds back into the LLM, and
/// anything else is spoken as a structured response.
fn interpret_result(wire_name: &str, result: Value) -> ActionResponse {
    let parsed: ToolCallResult = match serde_json::from_value(result.clone()) {
        Ok(p) => p,
        Err(_) => return ActionResponse::Response(result.to_string()),
    };

    let first_text = parsed
        .content
        .first()
        .filter(|c| c.content_type == "text")
        .map(|c| c.text.clone());

    if parsed.is_error {
        return ActionResponse::Error(
            first_text.unwrap_or_else(|| "device tool failed".into()),
        );
    }

    if is_camera_tool(wire_name) {
        return ActionResponse::CallHandler {
            handler: handlers::TAKE_PHOTO.into(),
            args: serde_json::json!({ "text": first_text.unwrap_or_default() }),
        };
    }

    match first_text {
        Some(text) => ActionResponse::ReqLlm(text),
        None => ActionResponse::Response(result.to_string()),
    }
}

fn is_camera_tool(name: &str) -> bool {
    name.contains("take_photo") || name.contains("camera")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpClient impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl McpClient for DeviceMcpClient {
    fn client_id(&self) -> &str {
        "device"
    }

    fn has_tool(&self, name: &str) -> bool {
        self.registry.is_mcp_tool(name)
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.registry.list()
    }

    async fn call_tool(&self, name: &str, args: &Value) -> Result<ActionResponse> {
        self.call_device_tool(name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bind a client to a test channel and return the outbound receiver.
    async fn bound_client() -> (DeviceMcpClient, mpsc::Receiver<ServerMessage>) {
        let client = DeviceMcpClient::new();
        let (tx, rx) = mpsc::channel(16);
        client.bind(tx, "s1", None).await.unwrap();
        (client, rx)
    }

    fn payload_of(msg: ServerMessage) -> Value {
        match msg {
            ServerMessage::Mcp { payload, .. } => payload,
            other => panic!("expected mcp message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bind_sends_initialize_with_id_one() {
        let (_client, mut rx) = bound_client().await;
        let payload = payload_of(rx.recv().await.unwrap());
        assert_eq!(payload["id"], 1);
        assert_eq!(payload["method"], "initialize");
        assert_eq!(
            payload["params"]["protocolVersion"],
            rpc::PROTOCOL_VERSION
        );
    }

    #[tokio::test]
    async fn initialize_response_triggers_tools_list() {
        let (client, mut rx) = bound_client().await;
        let _init = rx.recv().await.unwrap();

        client
            .handle_payload(serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}))
            .await;

        let payload = payload_of(rx.recv().await.unwrap());
        assert_eq!(payload["id"], 2);
        assert_eq!(payload["method"], "tools/list");
        assert!(payload.get("params").is_none());
    }

    #[tokio::test]
    async fn paginated_tools_list_follows_cursor_then_ready() {
        let (client, mut rx) = bound_client().await;
        let _init = rx.recv().await.unwrap();
        client
            .handle_payload(serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}))
            .await;
        let _list1 = rx.recv().await.unwrap();

        // Page 1 with a continuation cursor.
        client
            .handle_payload(serde_json::json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {
                    "tools": [{"name": "self.audio.set_volume"}],
                    "nextCursor": "p2"
                }
            }))
            .await;
        let page2_req = payload_of(rx.recv().await.unwrap());
        assert_eq!(page2_req["method"], "tools/list");
        assert_eq!(page2_req["params"]["cursor"], "p2");
        assert!(!client.is_ready());

        // Final page: empty cursor means done.
        client
            .handle_payload(serde_json::json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {
                    "tools": [{"name": "self.camera.take_photo"}],
                    "nextCursor": ""
                }
            }))
            .await;
        assert!(client.is_ready());
        assert!(client.has_tool("self_audio_set_volume"));
        assert!(client.has_tool("self.camera.take_photo"));
        assert!(client.wait_ready(Duration::from_millis(10)).await);
    }

    async fn ready_client() -> (DeviceMcpClient, mpsc::Receiver<ServerMessage>) {
        let (client, mut rx) = bound_client().await;
        let _init = rx.recv().await.unwrap();
        client
            .handle_payload(serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}))
            .await;
        let _list = rx.recv().await.unwrap();
        client
            .handle_payload(serde_json::json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {"tools": [
                    {"name": "self.audio.set_volume"},
                    {"name": "self.camera.take_photo"}
                ]}
            }))
            .await;
        assert!(client.is_ready());
        (client, rx)
    }

    #[tokio::test]
    async fn call_correlates_by_id_and_feeds_llm() {
        let (client, mut rx) = ready_client().await;
        let client = std::sync::Arc::new(client);

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .call_device_tool("self_audio_set_volume", &serde_json::json!({"volume": 50}))
                .await
        });

        let req = payload_of(rx.recv().await.unwrap());
        assert_eq!(req["id"], 3);
        assert_eq!(req["method"], "tools/call");
        // The device sees its original dotted name.
        assert_eq!(req["params"]["name"], "self.audio.set_volume");

        let id = req["id"].as_u64().unwrap();
        client
            .handle_payload(serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "result": {"content": [{"type": "text", "text": "volume set"}]}
            }))
            .await;

        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp, ActionResponse::ReqLlm("volume set".into()));
    }

    #[tokio::test]
    async fn error_response_fails_the_waiting_caller() {
        let (client, mut rx) = ready_client().await;
        let client = std::sync::Arc::new(client);

        let caller = client.clone();
        let call =
            tokio::spawn(
                async move { caller.call_device_tool("self_audio_set_volume", &serde_json::json!({})).await },
            );

        let req = payload_of(rx.recv().await.unwrap());
        let id = req["id"].as_u64().unwrap();
        client
            .handle_payload(serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": -32000, "message": "volume locked"}
            }))
            .await;

        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp, ActionResponse::Error("volume locked".into()));
    }

    #[tokio::test]
    async fn camera_results_route_to_photo_handler() {
        let resp = interpret_result(
            "self.camera.take_photo",
            serde_json::json!({"content": [{"type": "text", "text": "captured"}]}),
        );
        match resp {
            ActionResponse::CallHandler { handler, args } => {
                assert_eq!(handler, handlers::TAKE_PHOTO);
                assert_eq!(args["text"], "captured");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_results_become_req_llm() {
        let resp = interpret_result(
            "self.audio.get_volume",
            serde_json::json!({"content": [{"type": "text", "text": "volume is 30"}]}),
        );
        assert_eq!(resp, ActionResponse::ReqLlm("volume is 30".into()));
    }

    #[tokio::test]
    async fn structured_results_pass_through() {
        let resp = interpret_result("self.state.dump", serde_json::json!({"battery": 80}));
        match resp {
            ActionResponse::Response(s) => assert!(s.contains("battery")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_fails_pending_and_rearms() {
        let (client, mut rx) = ready_client().await;
        let client = std::sync::Arc::new(client);

        let caller = client.clone();
        let call =
            tokio::spawn(
                async move { caller.call_device_tool("self_audio_set_volume", &serde_json::json!({})).await },
            );
        let _req = rx.recv().await.unwrap();

        client.reset();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
        assert!(!client.is_ready());
        assert!(!client.has_tool("self_audio_set_volume"));
        assert!(!client.wait_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn unknown_response_id_is_ignored() {
        let (client, _rx) = ready_client().await;
        // Must not panic or disturb state.
        client
            .handle_payload(serde_json::json!({"jsonrpc":"2.0","id":99,"result":{}}))
            .await;
        assert!(client.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_and_clears_pending() {
        let (client, mut rx) = ready_client().await;
        let client = std::sync::Arc::new(client);

        let caller = client.clone();
        let call =
            tokio::spawn(
                async move { caller.call_device_tool("self_audio_set_volume", &serde_json::json!({})).await },
            );
        let req = payload_of(rx.recv().await.unwrap());
        let id = req["id"].as_u64().unwrap();

        // No response arrives; virtual time runs past the deadline.
        tokio::time::advance(Duration::from_secs(31)).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // The id is gone: a late response is treated as unknown.
        client
            .handle_payload(serde_json::json!({"jsonrpc":"2.0","id":id,"result":{}}))
            .await;
    }

    #[tokio::test]
    async fn unbound_client_cannot_call() {
        let client = DeviceMcpClient::new();
        let err = client
            .call_device_tool("anything", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }
}

//! WebSocket acceptor for device connections.
//!
//! Flow:
//! 1. Device connects to `/ws` with identifying headers
//!    (`device-id`, `client-id`, optional `session-id`).
//! 2. The acceptor leases a provider set (bounded wait; failure closes
//!    the connection), builds the session, and binds the device MCP
//!    client to the outbound channel.
//! 3. Reader loop feeds the session queues (text + binary audio);
//!    a writer task drains the outbound channel to the socket.
//! 4. When the session ends, the provider set is released exactly once.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use vx_protocol::rpc::VisionCapability;
use vx_protocol::ServerMessage;

use crate::session::{Outbound, Session, SessionProviders};
use crate::state::AppState;

/// GET /ws — upgrade to WebSocket.
pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let device_id = header("device-id");
    let client_id = header("client-id");
    let session_id = header("session-id");

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, device_id, client_id, session_id)
    })
}

/// Session id: explicit header, else derived from the device id, else
/// a fresh UUID.
fn synthesize_session_id(explicit: Option<String>, device_id: Option<&str>) -> String {
    if let Some(sid) = explicit {
        if !sid.is_empty() {
            return sid;
        }
    }
    match device_id {
        Some(d) if !d.is_empty() => format!("device-{}", d.replace(':', "_")),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    device_id: Option<String>,
    client_id: Option<String>,
    session_id: Option<String>,
) {
    let session_id = synthesize_session_id(session_id, device_id.as_deref());

    // ── Lease a provider set (bounded wait) ────────────────────────
    let acquire_timeout = Duration::from_millis(state.config.pool.acquire_timeout_ms);
    let mut set = match tokio::time::timeout(acquire_timeout, state.pools.acquire()).await {
        Ok(Ok(set)) => set,
        Ok(Err(e)) => {
            tracing::warn!(session_id = %session_id, error = %e, "provider acquisition failed, closing");
            return;
        }
        Err(_) => {
            tracing::warn!(session_id = %session_id, "provider acquisition timed out, closing");
            return;
        }
    };

    tracing::info!(
        session_id = %session_id,
        device_id = device_id.as_deref().unwrap_or(""),
        client_id = client_id.as_deref().unwrap_or(""),
        "device connected"
    );

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);

    // The set is populated on successful acquire; treat anything else
    // as a server bug and close.
    let providers = match (
        set.asr.clone(),
        set.llm.clone(),
        set.tts.clone(),
        set.mcp.clone(),
    ) {
        (Some(asr), Some(llm), Some(tts), Some(mcp)) => SessionProviders {
            asr,
            llm,
            tts,
            vllm: set.vllm.clone(),
            mcp,
        },
        _ => {
            tracing::error!(session_id = %session_id, "acquired provider set is incomplete");
            let _ = state.pools.release(&mut set).await;
            return;
        }
    };

    let session = Session::new(
        session_id.clone(),
        device_id.clone(),
        state.config.clone(),
        providers,
        outbound_tx.clone(),
        state.bus.clone(),
    );
    let ctx = session.ctx.clone();

    // ── Bind the device MCP client ─────────────────────────────────
    // It speaks ServerMessage; a forwarder folds that into the
    // session's outbound channel.
    {
        let (mcp_tx, mut mcp_rx) = mpsc::channel::<ServerMessage>(16);
        let outbound = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = mcp_rx.recv().await {
                if outbound.send(Outbound::Text(msg)).await.is_err() {
                    break;
                }
            }
        });

        let vision = vision_capability(&state, &session_id);
        if let Err(e) = ctx.mcp.device.bind(mcp_tx, &session_id, vision).await {
            tracing::warn!(session_id = %session_id, error = %e, "device MCP bind failed");
        }
    }

    // ── Writer task ────────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(out) = outbound_rx.recv().await {
            let msg = match out {
                Outbound::Text(m) => match serde_json::to_string(&m) {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound message");
                        continue;
                    }
                },
                Outbound::Frame(frame) => Message::Binary(frame),
            };
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // ── Session workers ────────────────────────────────────────────
    let run_handle = tokio::spawn(async move { session.run().await });

    // ── Reader loop ────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            incoming = ws_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    ctx.client_text.push(text);
                }
                Some(Ok(Message::Binary(frame))) => {
                    ctx.client_audio.push(frame);
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(session_id = %ctx.session_id, "device disconnected");
                    break;
                }
                Some(Ok(_)) => {
                    // WS-level ping/pong is handled by axum.
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %ctx.session_id, error = %e, "transport error");
                    break;
                }
            }
        }
    }

    // ── Teardown ───────────────────────────────────────────────────
    ctx.close();
    if run_handle.await.is_err() {
        tracing::error!(session_id = %session_id, "session task panicked");
    }
    writer.abort();

    if let Err(e) = state.pools.release(&mut set).await {
        tracing::warn!(session_id = %session_id, error = %e, "provider release reported an error");
    }
    tracing::info!(session_id = %session_id, "session closed, providers released");
}

/// Camera tools upload captures through the gateway when a vision
/// model is configured.
fn vision_capability(state: &AppState, session_id: &str) -> Option<VisionCapability> {
    state.config.selected.vllm.as_ref()?;
    Some(VisionCapability {
        url: format!(
            "http://{}:{}/api/vision",
            state.config.server.host, state.config.server.port
        ),
        token: session_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_prefers_explicit_header() {
        assert_eq!(
            synthesize_session_id(Some("s-42".into()), Some("aa:bb")),
            "s-42"
        );
    }

    #[test]
    fn session_id_derives_from_device_id() {
        assert_eq!(
            synthesize_session_id(None, Some("aa:bb:cc")),
            "device-aa_bb_cc"
        );
    }

    #[test]
    fn session_id_falls_back_to_uuid() {
        let sid = synthesize_session_id(None, None);
        assert_eq!(sid.len(), 36);
        assert!(uuid::Uuid::parse_str(&sid).is_ok());
    }

    #[test]
    fn empty_headers_are_ignored() {
        let sid = synthesize_session_id(Some(String::new()), Some(""));
        assert!(uuid::Uuid::parse_str(&sid).is_ok());
    }
}

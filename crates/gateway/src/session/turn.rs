//! Turn execution: stream the LLM, segment text for TTS, dispatch tool
//! calls, and re-enter the model with tool results.
//!
//! Tool calls arrive two ways and feed one dispatcher: structured
//! deltas (OpenAI `tool_calls`) or in-band `<tool_call>{...}</tool_call>`
//! markup, which is only parsed once the stream completes because the
//! closing tag may arrive late.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;

use vx_domain::message::{Message, ToolCall};
use vx_domain::stream::StreamEvent;
use vx_mcp::ActionResponse;
use vx_protocol::{ServerMessage, TtsState};
use vx_providers::{ChatRequest, LlmProvider};

use super::segment::SentenceSplitter;
use super::speak::TtsTask;
use super::{control, SessionContext, SERVICE_UNAVAILABLE_UTTERANCE};
use crate::bus;

/// LLM re-entries allowed per turn before we force-stop.
const MAX_TOOL_LOOPS: usize = 8;

const TOOL_CALL_TAG: &str = "<tool_call>";
const TOOL_CALL_END_TAG: &str = "</tool_call>";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one dialogue turn for a recognized (or typed) utterance.
pub async fn run_turn(ctx: &Arc<SessionContext>, user_text: &str) {
    let round = enter_thinking(ctx, user_text).await;
    ctx.dialogue.lock().put(Message::user(user_text));
    run_llm_loop(ctx, round, ctx.llm.clone()).await;
}

/// Run a multimodal turn against the vision model.
pub async fn run_vision_turn(ctx: &Arc<SessionContext>, user_text: &str, image_url: &str) {
    let round = enter_thinking(ctx, user_text).await;

    let vllm = match &ctx.vllm {
        Some(v) => v.clone(),
        None => {
            tracing::warn!(session_id = %ctx.session_id, "vision turn without a vision model");
            let mut counter = 0;
            enqueue_segment(
                ctx,
                round,
                &mut counter,
                "I cannot look at images right now.".into(),
            );
            return;
        }
    };

    ctx.dialogue
        .lock()
        .put(Message::user_with_image(user_text, image_url));
    run_llm_loop(ctx, round, vllm).await;
}

/// Thinking entry: bump the round, reset indices, announce the state.
async fn enter_thinking(ctx: &Arc<SessionContext>, user_text: &str) -> u32 {
    let round = ctx.start_round();

    let _ = ctx
        .send_text(ServerMessage::stt(&ctx.session_id, user_text))
        .await;
    let _ = ctx
        .send_text(ServerMessage::tts_state(&ctx.session_id, TtsState::Start))
        .await;
    let _ = ctx
        .send_text(ServerMessage::emotion(&ctx.session_id, "thinking"))
        .await;

    tracing::info!(
        session_id = %ctx.session_id,
        round,
        text = %user_text,
        "turn started"
    );
    round
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Segment plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enqueue one TTS segment, advancing the round's text index.
pub(super) fn enqueue_segment(
    ctx: &SessionContext,
    round: u32,
    counter: &mut u32,
    text: String,
) {
    *counter += 1;
    let text_index = *counter;
    ctx.tts_last_text_index
        .store(text_index as i64, Ordering::Release);
    ctx.tts_tasks.push(TtsTask {
        text,
        round,
        text_index,
        prebuilt_file: None,
        is_music: false,
    });
}

/// Close out a turn that queued no audio at all: nothing will reach
/// the frame sender, so the stop transition happens here.
async fn finish_silent_turn(ctx: &SessionContext) {
    let _ = ctx
        .send_text(ServerMessage::tts_state(&ctx.session_id, TtsState::Stop))
        .await;
    ctx.clear_speak_status().await;
    if ctx.close_after_chat.load(Ordering::Acquire) {
        ctx.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The LLM loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_llm_loop(ctx: &Arc<SessionContext>, round: u32, provider: Arc<dyn LlmProvider>) {
    let mut segment_counter: u32 = 0;

    'outer: for loop_idx in 0..MAX_TOOL_LOOPS {
        if ctx.stop.is_cancelled() || round != ctx.current_round() {
            return;
        }

        let req = ChatRequest {
            messages: ctx.dialogue.lock().get_llm_dialogue(),
            tools: ctx.mcp.tool_definitions(),
            temperature: None,
            max_tokens: None,
        };

        let mut stream = match provider.chat_stream(&req).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "LLM call failed");
                ctx.bus.publish(
                    bus::topics::LLM_ERROR,
                    serde_json::json!({"session_id": ctx.session_id, "error": e.to_string()}),
                );
                enqueue_segment(
                    ctx,
                    round,
                    &mut segment_counter,
                    SERVICE_UNAVAILABLE_UTTERANCE.into(),
                );
                break;
            }
        };

        let mut splitter = SentenceSplitter::new();
        let mut content = String::new();
        let mut tool_call_flag = false;
        let mut in_band = false;
        // True until the leading content proves it is not in-band
        // tool-call markup.
        let mut holding = true;
        // call_id → (name, accumulated argument json)
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        let mut failed = false;

        while let Some(event) = stream.next().await {
            if ctx.stop.is_cancelled()
                || round != ctx.current_round()
                || ctx.server_voice_stop.load(Ordering::Acquire)
            {
                return;
            }

            match event {
                Ok(StreamEvent::Token { text }) => {
                    content.push_str(&text);
                    if tool_call_flag {
                        continue;
                    }

                    let trimmed = content.trim_start();
                    if holding {
                        if TOOL_CALL_TAG.starts_with(trimmed) {
                            // Still an ambiguous prefix of the tag.
                            continue;
                        }
                        if trimmed.starts_with(TOOL_CALL_TAG) {
                            tool_call_flag = true;
                            in_band = true;
                            continue;
                        }
                        // Plain text after all: feed what accumulated.
                        holding = false;
                        let accumulated = content.clone();
                        if let Some(seg) = splitter.push(&accumulated) {
                            enqueue_segment(ctx, round, &mut segment_counter, seg);
                        }
                    } else if let Some(seg) = splitter.push(&text) {
                        enqueue_segment(ctx, round, &mut segment_counter, seg);
                    }
                }
                Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                    tool_call_flag = true;
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    tc_bufs.remove(&call_id);
                    pending.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                Ok(StreamEvent::Done { .. }) => break,
                Ok(StreamEvent::Error { message }) => {
                    tracing::warn!(session_id = %ctx.session_id, error = %message, "LLM stream error");
                    failed = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = %ctx.session_id, error = %e, "LLM stream failed");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            ctx.bus.publish(
                bus::topics::LLM_ERROR,
                serde_json::json!({"session_id": ctx.session_id}),
            );
            splitter.discard();
            enqueue_segment(
                ctx,
                round,
                &mut segment_counter,
                SERVICE_UNAVAILABLE_UTTERANCE.into(),
            );
            break;
        }

        // Providers that never emit ToolCallFinished leave assembled
        // buffers behind; drain them in arrival order.
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = parse_tool_arguments(&args_str);
            pending.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        // In-band markup is parsed only now; the closing tag may have
        // arrived in the last delta.
        if in_band {
            match parse_inband_tool_call(&content) {
                Some(call) => pending.push(call),
                None => {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        "unparseable in-band tool call, dropping"
                    );
                }
            }
        }

        if pending.is_empty() {
            // Plain completion: flush the tail and record the reply.
            if let Some(tail) = splitter.finish() {
                enqueue_segment(ctx, round, &mut segment_counter, tail);
            }
            if !content.trim().is_empty() {
                ctx.dialogue.lock().put(Message::assistant(content.trim()));
            }
            ctx.bus.publish(
                bus::topics::LLM_RESPONSE,
                serde_json::json!({
                    "session_id": ctx.session_id,
                    "round": round,
                    "chars": content.chars().count(),
                }),
            );
            break;
        }

        // Tool calls never speak their markup.
        splitter.discard();
        tracing::debug!(
            session_id = %ctx.session_id,
            loop_idx,
            count = pending.len(),
            "dispatching tool calls"
        );

        let mut reentered = false;
        for call in &pending {
            if ctx.stop.is_cancelled() || round != ctx.current_round() {
                return;
            }

            let result = ctx
                .mcp
                .router
                .execute_tool(&call.tool_name, &call.arguments)
                .await;

            match result {
                Err(e) => {
                    // Surfaced to the log only; the turn goes on.
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        tool = %call.tool_name,
                        error = %e,
                        "tool call failed"
                    );
                }
                Ok(ActionResponse::Error(msg)) => {
                    tracing::warn!(session_id = %ctx.session_id, tool = %call.tool_name, error = %msg, "tool returned error");
                }
                Ok(ActionResponse::NotFound(msg)) => {
                    tracing::warn!(session_id = %ctx.session_id, tool = %call.tool_name, %msg, "tool not found");
                }
                Ok(ActionResponse::None) => {}
                Ok(ActionResponse::Response(text)) => {
                    enqueue_segment(ctx, round, &mut segment_counter, text);
                }
                Ok(ActionResponse::CallHandler { handler, args }) => {
                    control::dispatch_handler(ctx, round, &mut segment_counter, &handler, &args)
                        .await;
                }
                Ok(ActionResponse::ReqLlm(text)) => {
                    let mut dialogue = ctx.dialogue.lock();
                    dialogue.put(Message::assistant_tool_calls(
                        strip_inband_markup(&content),
                        std::slice::from_ref(call),
                    ));
                    dialogue.put(Message::tool_result(&call.call_id, &text));
                    reentered = true;
                }
            }
        }

        if reentered {
            continue 'outer;
        }
        break;
    }

    if segment_counter == 0 {
        finish_silent_turn(ctx).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "tool call arguments are not valid JSON, defaulting to empty object");
            Value::Object(Default::default())
        }
    }
}

/// Extract `{name, arguments}` from `<tool_call>…</tool_call>` markup.
fn parse_inband_tool_call(content: &str) -> Option<ToolCall> {
    let start = content.find(TOOL_CALL_TAG)? + TOOL_CALL_TAG.len();
    let rest = &content[start..];
    let end = rest.find(TOOL_CALL_END_TAG).unwrap_or(rest.len());
    let body = rest[..end].trim();

    let v: Value = serde_json::from_str(body).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    let arguments = v
        .get("arguments")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    Some(ToolCall {
        call_id: format!("call_{}", uuid::Uuid::new_v4().simple()),
        tool_name: name,
        arguments,
    })
}

/// Leading assistant text for the tool-call record: in-band markup is
/// never replayed into the dialogue.
fn strip_inband_markup(content: &str) -> &str {
    match content.find(TOOL_CALL_TAG) {
        Some(pos) => content[..pos].trim(),
        None => content.trim(),
    }
}

//! Client control-message dispatch and the in-process tool handlers.
//!
//! Everything arriving on the text channel lands in
//! [`handle_control`]; finalized utterances (ASR output or typed chat)
//! land in [`handle_asr_text`], which owns the wake-word fast path and
//! quit-intent check before starting a full turn.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use serde_json::Value;

use vx_audio::OpusStreamDecoder;
use vx_domain::audio::{AudioFormat, AudioParams};
use vx_domain::message::Message;
use vx_mcp::action::handlers;
use vx_protocol::{ClientMessage, ListenState, ServerMessage, TtsState};

use super::speak::TtsTask;
use super::turn;
use super::SessionContext;
use crate::bus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn handle_control(ctx: &Arc<SessionContext>, msg: ClientMessage) {
    match msg {
        ClientMessage::Hello { audio_params, .. } => {
            handle_hello(ctx, audio_params).await;
        }
        ClientMessage::Abort { reason } => {
            tracing::info!(
                session_id = %ctx.session_id,
                reason = reason.as_deref().unwrap_or(""),
                "barge-in"
            );
            ctx.barge_in().await;
        }
        ClientMessage::Listen { state, mode, text } => {
            handle_listen(ctx, state, mode, text).await;
        }
        ClientMessage::Chat { text } => {
            // A typed message behaves exactly like a final ASR result.
            ctx.asr_results.push(text);
        }
        ClientMessage::Image { url, text } => {
            // Off the text worker so a concurrent abort still lands
            // promptly; stale rounds self-abort if turns overlap.
            let prompt = text.unwrap_or_else(|| "What do you see in this image?".into());
            let ctx = ctx.clone();
            tokio::spawn(async move {
                turn::run_vision_turn(&ctx, &prompt, &url).await;
            });
        }
        ClientMessage::Iot {
            descriptors,
            states,
        } => {
            handle_iot(ctx, descriptors, states);
        }
        ClientMessage::Mcp { payload, .. } => {
            ctx.mcp.device.handle_payload(payload).await;
        }
    }
}

async fn handle_hello(ctx: &Arc<SessionContext>, audio_params: Option<Value>) {
    let params = match &audio_params {
        Some(v) => match AudioParams::from_wire(v) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "bad audio_params, using defaults");
                AudioParams::client_default()
            }
        },
        None => AudioParams::client_default(),
    };

    *ctx.client_params.lock() = params;

    // A fresh decoder for the negotiated uplink format.
    if params.format == AudioFormat::Opus {
        match OpusStreamDecoder::new(params.sample_rate, params.channels) {
            Ok(decoder) => {
                *ctx.decoder.lock() = Some(decoder);
            }
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "failed to create opus decoder, treating uplink as PCM");
                *ctx.decoder.lock() = None;
            }
        }
    } else {
        *ctx.decoder.lock() = None;
    }

    tracing::info!(
        session_id = %ctx.session_id,
        format = ?params.format,
        sample_rate = params.sample_rate,
        "hello negotiated"
    );

    let _ = ctx
        .send_text(ServerMessage::hello(&ctx.session_id, ctx.server_params))
        .await;
}

async fn handle_listen(
    ctx: &Arc<SessionContext>,
    state: ListenState,
    mode: Option<vx_protocol::ListenMode>,
    text: Option<String>,
) {
    if let Some(mode) = mode {
        *ctx.listen_mode.lock() = mode;
    }

    match state {
        ListenState::Start => {
            ctx.asr_buffer.lock().clear();
        }
        ListenState::Stop => {
            finalize_utterance(ctx).await;
        }
        ListenState::Detect => {
            // Semantics in the source were unresolved; a detect with
            // text runs through the same path as a final ASR result.
            ctx.asr_buffer.lock().clear();
            if let Some(text) = text {
                if !text.trim().is_empty() {
                    ctx.asr_results.push(text);
                }
            }
        }
    }
}

/// Hand the buffered utterance to ASR and queue the transcript as a
/// turn. Recognition runs off the text worker so control dispatch
/// stays responsive.
async fn finalize_utterance(ctx: &Arc<SessionContext>) {
    let pcm: Vec<i16> = std::mem::take(&mut *ctx.asr_buffer.lock());
    if pcm.is_empty() {
        return;
    }
    let sample_rate = ctx.client_params.lock().sample_rate;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        match ctx.asr.transcribe(&pcm, sample_rate).await {
            Ok(text) if !text.trim().is_empty() => {
                ctx.bus.publish(
                    bus::topics::ASR_RESULT,
                    serde_json::json!({"session_id": ctx.session_id, "text": text}),
                );
                ctx.asr_results.push(text);
            }
            Ok(_) => {
                tracing::debug!(session_id = %ctx.session_id, "empty transcript, ignoring");
            }
            Err(e) => {
                tracing::warn!(session_id = %ctx.session_id, error = %e, "transcription failed");
                ctx.bus.publish(
                    bus::topics::ASR_ERROR,
                    serde_json::json!({"session_id": ctx.session_id, "error": e.to_string()}),
                );
            }
        }
    });
}

fn handle_iot(ctx: &Arc<SessionContext>, descriptors: Option<Value>, states: Option<Value>) {
    // Device reports become model-visible context.
    let mut parts = Vec::new();
    if let Some(d) = descriptors {
        parts.push(format!("Device capabilities: {d}"));
    }
    if let Some(s) = states {
        parts.push(format!("Device state: {s}"));
    }
    if parts.is_empty() {
        return;
    }
    let note = parts.join("\n");
    tracing::debug!(session_id = %ctx.session_id, "recorded iot report");
    ctx.dialogue.lock().put(Message::system(note));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalized utterances
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn handle_asr_text(ctx: &Arc<SessionContext>, text: &str) {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return;
    }

    // Quit intent: an exact exit command ends the session.
    if ctx.config.exit_commands.iter().any(|c| c == cleaned) {
        tracing::info!(session_id = %ctx.session_id, "exit command received");
        let _ = ctx
            .send_text(ServerMessage::tts_state(&ctx.session_id, TtsState::Stop))
            .await;
        ctx.close();
        return;
    }

    // Wake-word fast path: skip the LLM for a bare wake phrase, at
    // most once per throttle window.
    if ctx.config.wake.words.iter().any(|w| w == cleaned) {
        if wake_throttle_passed(ctx) {
            wake_fast_path(ctx, cleaned).await;
        } else {
            tracing::debug!(session_id = %ctx.session_id, "wake word throttled");
        }
        return;
    }

    turn::run_turn(ctx, cleaned).await;
}

fn wake_throttle_passed(ctx: &SessionContext) -> bool {
    let throttle = std::time::Duration::from_secs(ctx.config.wake.throttle_secs);
    let mut last = ctx.last_wake.lock();
    match *last {
        Some(at) if at.elapsed() < throttle => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}

async fn wake_fast_path(ctx: &Arc<SessionContext>, wake_text: &str) {
    let reply = {
        let mut rng = rand::thread_rng();
        ctx.config
            .wake
            .quick_replies
            .choose(&mut rng)
            .cloned()
    };
    let reply = match reply {
        Some(r) => r,
        None => return,
    };

    let round = ctx.start_round();
    let _ = ctx
        .send_text(ServerMessage::stt(&ctx.session_id, wake_text))
        .await;
    let _ = ctx
        .send_text(ServerMessage::tts_state(&ctx.session_id, TtsState::Start))
        .await;
    let _ = ctx
        .send_text(ServerMessage::emotion(&ctx.session_id, "happy"))
        .await;

    {
        let mut dialogue = ctx.dialogue.lock();
        dialogue.put(Message::user(wake_text));
        dialogue.put(Message::assistant(&reply));
    }

    let mut counter = 0;
    turn::enqueue_segment(ctx, round, &mut counter, reply);
    tracing::info!(session_id = %ctx.session_id, round, "wake fast path replied");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CallHandler dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a named in-process handler from a tool-call envelope. Handlers
/// mutate session state and usually queue a short confirmation
/// utterance in the current round.
pub async fn dispatch_handler(
    ctx: &Arc<SessionContext>,
    round: u32,
    counter: &mut u32,
    handler: &str,
    args: &Value,
) {
    tracing::debug!(session_id = %ctx.session_id, handler, "dispatching handler");
    match handler {
        handlers::EXIT => {
            ctx.close_after_chat.store(true, Ordering::Release);
            turn::enqueue_segment(ctx, round, counter, "Goodbye!".into());
        }
        handlers::PLAY_MUSIC => {
            let song = args.get("song").and_then(|v| v.as_str()).unwrap_or("");
            match find_music_file(&ctx.config.audio.music_dir, song) {
                Some(file) => {
                    let title = file
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "music".into());
                    *counter += 1;
                    let text_index = *counter;
                    ctx.tts_last_text_index
                        .store(text_index as i64, Ordering::Release);
                    ctx.tts_tasks.push(TtsTask {
                        text: title,
                        round,
                        text_index,
                        prebuilt_file: Some(file),
                        is_music: true,
                    });
                }
                None => {
                    turn::enqueue_segment(
                        ctx,
                        round,
                        counter,
                        "I could not find that song.".into(),
                    );
                }
            }
        }
        handlers::CHANGE_VOICE => {
            if let Some(voice) = args.get("voice").and_then(|v| v.as_str()) {
                ctx.tts.set_voice(voice);
                turn::enqueue_segment(ctx, round, counter, "Voice switched.".into());
            }
        }
        handlers::CHANGE_ROLE => {
            if let Some(role) = args.get("role").and_then(|v| v.as_str()) {
                ctx.dialogue.lock().set_system_prompt(role);
                turn::enqueue_segment(ctx, round, counter, "Role updated.".into());
            }
        }
        handlers::SWITCH_AGENT => {
            if let Some(agent) = args.get("agent").and_then(|v| v.as_str()) {
                let prompt = format!(
                    "You are now the agent '{agent}'. Continue the conversation in that capacity."
                );
                ctx.dialogue.lock().set_system_prompt(&prompt);
                turn::enqueue_segment(
                    ctx,
                    round,
                    counter,
                    format!("Switched to {agent}."),
                );
            }
        }
        handlers::TAKE_PHOTO => {
            // The device answers a capture with text (a description or
            // an upload acknowledgement); speak it.
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if !text.is_empty() {
                turn::enqueue_segment(ctx, round, counter, text.to_string());
            }
        }
        other => {
            tracing::warn!(session_id = %ctx.session_id, handler = other, "unknown handler");
        }
    }
}

/// Look up a song by (partial, case-insensitive) name; an empty name
/// picks at random.
fn find_music_file(dir: &std::path::Path, song: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "mp3" | "wav"))
        })
        .collect();
    if files.is_empty() {
        return None;
    }

    if song.is_empty() {
        let mut rng = rand::thread_rng();
        return files.choose(&mut rng).cloned();
    }

    let needle = song.to_lowercase();
    files
        .iter()
        .find(|p| {
            p.file_stem()
                .map(|s| s.to_string_lossy().to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
        .cloned()
}

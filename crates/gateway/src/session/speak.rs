//! Speech output pipeline: segment synthesis and paced frame sending.
//!
//! Stage A (TTS worker) turns queued text segments into audio files.
//! Stage B (frame sender) converts each file to wire frames and sends
//! them paced against the wall clock, so the device's jitter buffer is
//! never flooded and barge-in takes effect within one 10 ms tick.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vx_protocol::{ServerMessage, TtsState};

use super::{segment, SessionContext};
use crate::bus;

/// Frames sent back-to-back before pacing starts.
const PRE_BUFFER_FRAMES: usize = 3;

/// How often the paced sender wakes to check for barge-in.
const PACE_TICK: Duration = Duration::from_millis(10);

/// A text segment awaiting synthesis.
#[derive(Debug)]
pub struct TtsTask {
    pub text: String,
    pub round: u32,
    pub text_index: u32,
    /// Already-synthesized source (music playback); skips the TTS call.
    pub prebuilt_file: Option<PathBuf>,
    /// Music files survive the deletion policy.
    pub is_music: bool,
}

/// A synthesized file awaiting paced sending.
#[derive(Debug)]
pub struct AudioTask {
    pub file: PathBuf,
    pub text: String,
    pub round: u32,
    pub text_index: u32,
    pub is_music: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deletion policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stat-before-remove so overlapping deletion sites are no-ops.
fn delete_idempotent(path: &Path) {
    if std::fs::metadata(path).is_ok() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete audio file");
        }
    }
}

fn maybe_delete(ctx: &SessionContext, path: &Path, is_music: bool) {
    if ctx.config.audio.delete_audio && !is_music {
        delete_idempotent(path);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage A — TTS worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_tts_worker(ctx: Arc<SessionContext>) {
    while let Some(task) = ctx.tts_tasks.pop().await {
        if ctx.server_voice_stop.load(Ordering::Acquire)
            || task.round != ctx.current_round()
        {
            tracing::debug!(
                session_id = %ctx.session_id,
                index = task.text_index,
                "dropping stale TTS task"
            );
            if let Some(file) = &task.prebuilt_file {
                maybe_delete(&ctx, file, task.is_music);
            }
            continue;
        }

        // Pre-synthesized source (music): straight to the sender.
        if let Some(file) = task.prebuilt_file {
            ctx.audio_tasks.push(AudioTask {
                file,
                text: task.text,
                round: task.round,
                text_index: task.text_index,
                is_music: task.is_music,
            });
            continue;
        }

        let cleaned = segment::clean_for_tts(&task.text);
        if cleaned.is_empty() {
            tracing::debug!(
                session_id = %ctx.session_id,
                index = task.text_index,
                "segment empty after cleaning, skipping"
            );
            // An empty-file marker keeps the index stream contiguous in
            // stage B so the round still closes when this was the last
            // segment.
            ctx.audio_tasks.push(AudioTask {
                file: PathBuf::new(),
                text: task.text,
                round: task.round,
                text_index: task.text_index,
                is_music: false,
            });
            continue;
        }
        let speakable = segment::truncate_for_tts(&cleaned);

        match ctx.tts.synthesize(&speakable, &ctx.config.audio.output_dir).await {
            Ok(file) => {
                ctx.bus.publish(
                    bus::topics::TTS_SPEAK,
                    serde_json::json!({
                        "session_id": ctx.session_id,
                        "index": task.text_index,
                        "chars": speakable.chars().count(),
                    }),
                );
                ctx.audio_tasks.push(AudioTask {
                    file,
                    text: speakable,
                    round: task.round,
                    text_index: task.text_index,
                    is_music: false,
                });
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    index = task.text_index,
                    error = %e,
                    "synthesis failed, skipping segment"
                );
                ctx.bus.publish(
                    bus::topics::TTS_ERROR,
                    serde_json::json!({
                        "session_id": ctx.session_id,
                        "error": e.to_string(),
                    }),
                );
                ctx.audio_tasks.push(AudioTask {
                    file: PathBuf::new(),
                    text: String::new(),
                    round: task.round,
                    text_index: task.text_index,
                    is_music: false,
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage B — frame sender
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SendOutcome {
    Completed,
    Aborted,
}

pub async fn run_frame_sender(ctx: Arc<SessionContext>) {
    while let Some(task) = ctx.audio_tasks.pop().await {
        if ctx.server_voice_stop.load(Ordering::Acquire)
            || task.round != ctx.current_round()
        {
            maybe_delete(&ctx, &task.file, task.is_music);
            continue;
        }

        // Empty-file markers carry no audio; they exist only to close
        // out the index stream in order.
        if !task.file.as_os_str().is_empty() {
            let outcome = send_audio_task(&ctx, &task).await;
            maybe_delete(&ctx, &task.file, task.is_music);

            match outcome {
                SendOutcome::Aborted => continue,
                SendOutcome::Completed => {}
            }
        }

        ctx.tts_last_audio_index
            .store(task.text_index as i64, Ordering::Release);

        // Last segment of the round: close out the speak phase.
        let last_text = ctx.tts_last_text_index.load(Ordering::Acquire);
        if last_text >= 0 && task.text_index as i64 == last_text {
            let _ = ctx
                .send_text(ServerMessage::tts_state(&ctx.session_id, TtsState::Stop))
                .await;
            ctx.clear_speak_status().await;
            if ctx.close_after_chat.load(Ordering::Acquire) {
                tracing::info!(session_id = %ctx.session_id, "closing after final segment");
                ctx.close();
            }
        }
    }
}

/// Send one synthesized file: `sentence_start`, pre-buffer, paced
/// frames, trailing flush, `sentence_end`.
async fn send_audio_task(ctx: &SessionContext, task: &AudioTask) -> SendOutcome {
    let params = ctx.server_params;
    let file = task.file.clone();
    let conversion =
        tokio::task::spawn_blocking(move || vx_audio::audio_to_frames(&file, &params)).await;

    let (frames, duration_secs) = match conversion {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!(
                session_id = %ctx.session_id,
                file = %task.file.display(),
                error = %e,
                "failed to convert audio file, skipping"
            );
            return SendOutcome::Aborted;
        }
        Err(_) => return SendOutcome::Aborted,
    };

    tracing::debug!(
        session_id = %ctx.session_id,
        index = task.text_index,
        frames = frames.len(),
        duration_secs,
        "sending segment"
    );

    let _ = ctx
        .send_text(ServerMessage::tts_sentence(
            &ctx.session_id,
            TtsState::SentenceStart,
            &task.text,
            task.text_index,
        ))
        .await;

    let frame_duration = Duration::from_millis(params.frame_duration as u64);
    let pre_buffer = PRE_BUFFER_FRAMES.min(frames.len());
    let pre_buffer_time = frame_duration * pre_buffer as u32;

    // Pre-buffer: a small burst so playback starts without underrun.
    for frame in &frames[..pre_buffer] {
        if !ctx.send_frame(frame.clone()).await {
            return SendOutcome::Aborted;
        }
    }
    let mut play_pos = pre_buffer_time;

    let start = Instant::now();
    for frame in &frames[pre_buffer..] {
        // Virtual playout position minus the pre-buffer gives the
        // wall-clock instant this frame is due.
        let expected = play_pos - pre_buffer_time;
        loop {
            if should_abort(ctx, task.round) {
                return SendOutcome::Aborted;
            }
            let elapsed = start.elapsed();
            if elapsed >= expected {
                break;
            }
            tokio::time::sleep(PACE_TICK.min(expected - elapsed)).await;
        }

        if !ctx.send_frame(frame.clone()).await {
            return SendOutcome::Aborted;
        }
        play_pos += frame_duration;
    }

    // Flush: let the virtual queue drain before sentence_end.
    let mut remaining = pre_buffer_time;
    while remaining > Duration::ZERO {
        if should_abort(ctx, task.round) {
            return SendOutcome::Aborted;
        }
        let tick = PACE_TICK.min(remaining);
        tokio::time::sleep(tick).await;
        remaining = remaining.saturating_sub(tick);
    }

    let _ = ctx
        .send_text(ServerMessage::tts_sentence(
            &ctx.session_id,
            TtsState::SentenceEnd,
            &task.text,
            task.text_index,
        ))
        .await;

    SendOutcome::Completed
}

fn should_abort(ctx: &SessionContext, round: u32) -> bool {
    ctx.server_voice_stop.load(Ordering::Acquire)
        || round != ctx.current_round()
        || ctx.stop.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_idempotent_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.mp3");
        std::fs::write(&path, b"x").unwrap();
        delete_idempotent(&path);
        assert!(!path.exists());
        // Second delete is a no-op, not an error.
        delete_idempotent(&path);
    }
}

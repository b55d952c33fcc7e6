//! The per-session conversation engine.
//!
//! One [`Session`] exists per live connection. It owns the bounded
//! queues, the dialogue buffer, the negotiated audio formats, and the
//! provider handles leased for the connection's lifetime, and it runs
//! the worker tasks that move data between them:
//!
//! - text worker: drains client JSON, dispatches control messages
//! - audio worker: drains client frames, decodes, buffers for ASR
//! - ASR-result worker: runs dialogue turns (serialized; one in flight)
//! - TTS worker: synthesizes queued segments to audio files
//! - frame sender: paces synthesized frames onto the wire
//!
//! All of them stop within a tick of the session's stop token firing.

pub mod control;
pub mod dialogue;
pub mod queues;
pub mod segment;
pub mod speak;
pub mod turn;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vx_audio::OpusStreamDecoder;
use vx_domain::audio::AudioParams;
use vx_domain::config::Config;
use vx_mcp::SessionMcp;
use vx_protocol::{ListenMode, ServerMessage};
use vx_providers::{AsrProvider, LlmProvider, TtsProvider};

use crate::bus::EventBus;
use dialogue::DialogueBuffer;
use queues::BoundedQueue;
use speak::{AudioTask, TtsTask};

/// Spoken when a provider fails mid-turn.
pub const SERVICE_UNAVAILABLE_UTTERANCE: &str =
    "The service is temporarily unavailable, please try again later.";

/// One message to the device: control JSON or a single audio frame.
#[derive(Debug)]
pub enum Outbound {
    Text(ServerMessage),
    Frame(Vec<u8>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared state for every worker in one session.
pub struct SessionContext {
    pub session_id: String,
    pub device_id: Option<String>,
    pub config: Arc<Config>,
    pub stop: CancellationToken,
    outbound: mpsc::Sender<Outbound>,

    // ── Turn counters (atomics, spec'd in the data model) ──────────
    /// Monotonically increasing user-turn counter. Stale rounds
    /// self-abort their in-flight TTS work.
    pub talk_round: AtomicU32,
    /// Highest text index enqueued this round; −1 when idle.
    pub tts_last_text_index: AtomicI64,
    /// Highest text index the frame sender finished; −1 when idle.
    pub tts_last_audio_index: AtomicI64,

    // ── Flags ──────────────────────────────────────────────────────
    /// Barge-in asserted: the frame sender must exit promptly.
    pub server_voice_stop: AtomicBool,
    /// Ignore client audio while the server is speaking.
    pub asr_pause: AtomicBool,
    /// Terminate after the current turn's last segment is sent.
    pub close_after_chat: AtomicBool,

    // ── Negotiated state ───────────────────────────────────────────
    pub listen_mode: Mutex<ListenMode>,
    pub client_params: Mutex<AudioParams>,
    pub server_params: AudioParams,

    pub dialogue: Mutex<DialogueBuffer>,
    pub decoder: Mutex<Option<OpusStreamDecoder>>,
    /// Uplink PCM accumulated for the next ASR call.
    pub asr_buffer: Mutex<Vec<i16>>,
    /// Wake fast-path throttle.
    pub last_wake: Mutex<Option<Instant>>,

    // ── Leased providers ───────────────────────────────────────────
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub vllm: Option<Arc<dyn LlmProvider>>,
    pub mcp: Arc<SessionMcp>,

    // ── Queues ─────────────────────────────────────────────────────
    pub client_text: BoundedQueue<String>,
    pub client_audio: BoundedQueue<Vec<u8>>,
    pub asr_results: BoundedQueue<String>,
    pub tts_tasks: BoundedQueue<TtsTask>,
    pub audio_tasks: BoundedQueue<AudioTask>,

    pub bus: Arc<EventBus>,
}

impl SessionContext {
    /// Queue a control message to the device. Returns `false` when the
    /// session is gone.
    pub async fn send_text(&self, msg: ServerMessage) -> bool {
        self.outbound.send(Outbound::Text(msg)).await.is_ok()
    }

    /// Queue one audio frame to the device.
    pub async fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.outbound.send(Outbound::Frame(frame)).await.is_ok()
    }

    /// A clone of the outbound sender (the device MCP client binds to
    /// the text side of this).
    pub fn outbound_sender(&self) -> mpsc::Sender<Outbound> {
        self.outbound.clone()
    }

    pub fn current_round(&self) -> u32 {
        self.talk_round.load(Ordering::Acquire)
    }

    /// Enter a new round: bump the counter, reset segment indices, and
    /// re-arm the voice-stop flag. Audio capture pauses while the
    /// server speaks.
    pub fn start_round(&self) -> u32 {
        let round = self.talk_round.fetch_add(1, Ordering::AcqRel) + 1;
        self.tts_last_text_index.store(-1, Ordering::Release);
        self.tts_last_audio_index.store(-1, Ordering::Release);
        self.server_voice_stop.store(false, Ordering::Release);
        self.asr_pause.store(true, Ordering::Release);
        round
    }

    /// Reset speak state after the round's last segment (or an abort):
    /// indices to −1, queues drained, a short settle, capture resumed.
    pub async fn clear_speak_status(&self) {
        self.tts_last_text_index.store(-1, Ordering::Release);
        self.tts_last_audio_index.store(-1, Ordering::Release);
        self.tts_tasks.clear();
        self.audio_tasks.clear();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.asr_pause.store(false, Ordering::Release);
    }

    /// Barge-in: silence the frame sender and flush pending speech.
    pub async fn barge_in(&self) {
        self.server_voice_stop.store(true, Ordering::Release);
        let _ = self
            .send_text(ServerMessage::tts_state(
                &self.session_id,
                vx_protocol::TtsState::Stop,
            ))
            .await;
        self.clear_speak_status().await;
    }

    /// Begin session teardown. Idempotent.
    pub fn close(&self) {
        self.server_voice_stop.store(true, Ordering::Release);
        self.stop.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider handles a session borrows from its leased set.
pub struct SessionProviders {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub vllm: Option<Arc<dyn LlmProvider>>,
    pub mcp: Arc<SessionMcp>,
}

pub struct Session {
    pub ctx: Arc<SessionContext>,
}

impl Session {
    pub fn new(
        session_id: String,
        device_id: Option<String>,
        config: Arc<Config>,
        providers: SessionProviders,
        outbound: mpsc::Sender<Outbound>,
        bus: Arc<EventBus>,
    ) -> Self {
        let stop = CancellationToken::new();
        let dialogue = DialogueBuffer::new(
            &config.dialogue.system_prompt,
            config.dialogue.max_history,
        );

        let ctx = Arc::new(SessionContext {
            session_id,
            device_id,
            stop: stop.clone(),
            outbound,
            talk_round: AtomicU32::new(0),
            tts_last_text_index: AtomicI64::new(-1),
            tts_last_audio_index: AtomicI64::new(-1),
            server_voice_stop: AtomicBool::new(false),
            asr_pause: AtomicBool::new(false),
            close_after_chat: AtomicBool::new(false),
            listen_mode: Mutex::new(ListenMode::Auto),
            client_params: Mutex::new(AudioParams::client_default()),
            server_params: AudioParams::server_default(),
            dialogue: Mutex::new(dialogue),
            decoder: Mutex::new(None),
            asr_buffer: Mutex::new(Vec::new()),
            last_wake: Mutex::new(None),
            asr: providers.asr,
            llm: providers.llm,
            tts: providers.tts,
            vllm: providers.vllm,
            mcp: providers.mcp,
            client_text: BoundedQueue::new("client_text", stop.clone()),
            client_audio: BoundedQueue::new("client_audio", stop.clone()),
            asr_results: BoundedQueue::new("asr_results", stop.clone()),
            tts_tasks: BoundedQueue::new("tts_tasks", stop.clone()),
            audio_tasks: BoundedQueue::new("audio_tasks", stop.clone()),
            config,
            bus,
        });

        Self { ctx }
    }

    /// Run the session's workers until the stop token fires. The
    /// transport reader (owned by the acceptor) feeds the text/audio
    /// queues; everything else happens here.
    pub async fn run(&self) {
        let workers = [
            ("text_worker", tokio::spawn(text_worker(self.ctx.clone()))),
            ("audio_worker", tokio::spawn(audio_worker(self.ctx.clone()))),
            ("asr_worker", tokio::spawn(asr_result_worker(self.ctx.clone()))),
            ("tts_worker", tokio::spawn(speak::run_tts_worker(self.ctx.clone()))),
            ("frame_sender", tokio::spawn(speak::run_frame_sender(self.ctx.clone()))),
        ];

        self.ctx.stop.cancelled().await;

        for (name, handle) in workers {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    tracing::error!(
                        session_id = %self.ctx.session_id,
                        worker = name,
                        "session worker panicked"
                    );
                }
                Err(_) => {}
            }
        }

        tracing::info!(session_id = %self.ctx.session_id, "session finished");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drains client JSON and dispatches control messages in arrival order.
async fn text_worker(ctx: Arc<SessionContext>) {
    while let Some(raw) = ctx.client_text.pop().await {
        let msg = match serde_json::from_str::<vx_protocol::ClientMessage>(&raw) {
            Ok(m) => m,
            Err(e) => {
                // Validation errors never kill the session.
                tracing::warn!(
                    session_id = %ctx.session_id,
                    error = %e,
                    "ignoring malformed client message"
                );
                continue;
            }
        };
        control::handle_control(&ctx, msg).await;
    }
}

/// Drains client audio, decodes Opus (falling back to raw PCM), and
/// buffers samples for the next ASR call.
async fn audio_worker(ctx: Arc<SessionContext>) {
    while let Some(frame) = ctx.client_audio.pop().await {
        // asr_pause gates echo during server speech, except in
        // realtime mode where the user may talk over the assistant.
        if ctx.asr_pause.load(Ordering::Acquire)
            && *ctx.listen_mode.lock() != ListenMode::Realtime
        {
            continue;
        }

        let pcm = {
            let mut decoder = ctx.decoder.lock();
            match decoder.as_mut() {
                Some(d) => match d.decode(&frame) {
                    Ok(pcm) => pcm,
                    // Clients sometimes negotiate opus but send PCM;
                    // pass the frame through unchanged.
                    Err(_) => raw_frame_to_pcm(&frame),
                },
                None => raw_frame_to_pcm(&frame),
            }
        };

        ctx.asr_buffer.lock().extend_from_slice(&pcm);
    }
}

fn raw_frame_to_pcm(frame: &[u8]) -> Vec<i16> {
    frame
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Runs dialogue turns for finalized utterances, one at a time.
async fn asr_result_worker(ctx: Arc<SessionContext>) {
    while let Some(text) = ctx.asr_results.pop().await {
        control::handle_asr_text(&ctx, &text).await;
    }
}

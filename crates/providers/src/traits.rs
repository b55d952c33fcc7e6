use std::path::{Path, PathBuf};

use vx_domain::error::Result;
use vx_domain::message::{Message, ToolDefinition};
use vx_domain::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Speech recognition: one buffered utterance in, final text out.
///
/// The session buffers decoded uplink PCM until the utterance ends
/// (listen stop or silence), then hands the whole clip over. Providers
/// are exclusive to one session at a time, so implementations need no
/// internal per-call isolation.
#[async_trait::async_trait]
pub trait AsrProvider: Send + Sync {
    /// Transcribe mono 16-bit PCM recorded at `sample_rate`.
    async fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> Result<String>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

/// Chat completion. Vision-capable models implement the same trait;
/// image content travels as [`ContentPart::Image`] message parts.
///
/// [`ContentPart::Image`]: vx_domain::message::ContentPart::Image
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

/// Speech synthesis: text in, audio file out.
#[async_trait::async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize `text` into an audio file under `out_dir` and return
    /// its path.
    async fn synthesize(&self, text: &str, out_dir: &Path) -> Result<PathBuf>;

    /// Switch the speaking voice for subsequent synthesis calls.
    fn set_voice(&self, voice: &str);

    /// The voice currently in use.
    fn voice(&self) -> String;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

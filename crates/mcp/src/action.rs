use serde_json::Value;

/// The discriminated outcome of a tool call.
///
/// The turn loop interprets this envelope: `Response` is spoken
/// directly, `ReqLlm` feeds the result back into the model as a tool
/// message, `CallHandler` dispatches to a named in-process handler
/// that mutates session state.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResponse {
    /// The call failed; the turn continues without a re-entry.
    Error(String),

    /// No registered client owns the tool.
    NotFound(String),

    /// The call succeeded with nothing to say or do.
    None,

    /// Text to synthesize directly as a system utterance.
    Response(String),

    /// Dispatch to a named in-process handler.
    CallHandler { handler: String, args: Value },

    /// Feed the result back to the LLM as a tool message and continue
    /// the completion.
    ReqLlm(String),
}

impl ActionResponse {
    /// Whether the envelope represents a successful call (cacheable).
    pub fn is_success(&self) -> bool {
        !matches!(self, ActionResponse::Error(_) | ActionResponse::NotFound(_))
    }
}

/// In-process handler names reachable through `CallHandler`.
pub mod handlers {
    pub const EXIT: &str = "handle_exit";
    pub const PLAY_MUSIC: &str = "handle_play_music";
    pub const CHANGE_ROLE: &str = "handle_change_role";
    pub const SWITCH_AGENT: &str = "handle_switch_agent";
    pub const CHANGE_VOICE: &str = "handle_change_voice";
    pub const TAKE_PHOTO: &str = "handle_take_photo";
}

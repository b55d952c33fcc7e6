//! Wire protocol for device connections: the JSON control messages
//! exchanged over the duplex channel, and the JSON-RPC envelope that
//! multiplexes device-side MCP onto the same channel.
//!
//! Binary WebSocket messages carry exactly one audio frame each and
//! have no framing of their own; everything here is the `text` side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vx_domain::audio::AudioParams;

pub mod rpc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control messages sent by the device.
///
/// Unknown `type` values fail deserialization; the session logs and
/// continues (validation errors are never fatal).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Handshake: announces the device and its capture format.
    Hello {
        #[serde(default)]
        device_id: Option<String>,
        /// Loosely typed on purpose — numbers may arrive as floats.
        #[serde(default)]
        audio_params: Option<Value>,
    },

    /// Barge-in: stop speaking immediately.
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Listening control.
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        /// Detect payloads may carry recognized text.
        #[serde(default)]
        text: Option<String>,
    },

    /// Text-only turn (no audio).
    Chat { text: String },

    /// Multimodal turn: an image plus an optional question.
    #[serde(alias = "vision")]
    Image {
        url: String,
        #[serde(default)]
        text: Option<String>,
    },

    /// Device-state report, recorded into the LLM context.
    Iot {
        #[serde(default)]
        descriptors: Option<Value>,
        #[serde(default)]
        states: Option<Value>,
    },

    /// Device-side MCP traffic (JSON-RPC payload).
    Mcp {
        #[serde(default)]
        session_id: Option<String>,
        payload: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Auto,
    Manual,
    Realtime,
}

impl Default for ListenMode {
    fn default() -> Self {
        ListenMode::Auto
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control messages sent to the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake reply carrying the fixed downlink audio format.
    Hello {
        version: u32,
        transport: String,
        session_id: String,
        audio_params: AudioParams,
    },

    /// Recognized user utterance.
    Stt { text: String, session_id: String },

    /// TTS segment lifecycle.
    Tts {
        state: TtsState,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        audio_codec: String,
    },

    /// Emotion hint; `text` is an emoji.
    Llm {
        text: String,
        emotion: String,
        session_id: String,
    },

    /// Device-side MCP traffic (JSON-RPC payload).
    Mcp { session_id: String, payload: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

impl ServerMessage {
    /// Handshake reply for a session.
    pub fn hello(session_id: impl Into<String>, params: AudioParams) -> Self {
        ServerMessage::Hello {
            version: 1,
            transport: "websocket".into(),
            session_id: session_id.into(),
            audio_params: params,
        }
    }

    pub fn stt(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        ServerMessage::Stt {
            text: text.into(),
            session_id: session_id.into(),
        }
    }

    pub fn tts_state(session_id: impl Into<String>, state: TtsState) -> Self {
        ServerMessage::Tts {
            state,
            session_id: session_id.into(),
            text: None,
            index: None,
            audio_codec: "opus".into(),
        }
    }

    pub fn tts_sentence(
        session_id: impl Into<String>,
        state: TtsState,
        text: impl Into<String>,
        index: u32,
    ) -> Self {
        ServerMessage::Tts {
            state,
            session_id: session_id.into(),
            text: Some(text.into()),
            index: Some(index),
            audio_codec: "opus".into(),
        }
    }

    /// Emotion hint with its display emoji.
    pub fn emotion(session_id: impl Into<String>, emotion: &str) -> Self {
        let emoji = match emotion {
            "happy" => "😊",
            "thinking" => "🤔",
            "sad" => "😢",
            _ => "🙂",
        };
        ServerMessage::Llm {
            text: emoji.into(),
            emotion: emotion.into(),
            session_id: session_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_roundtrip() {
        let raw = r#"{"type":"hello","audio_params":{"format":"opus","sample_rate":16000.0,"channels":1,"frame_duration":60}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Hello { audio_params, .. } => {
                let params =
                    AudioParams::from_wire(&audio_params.unwrap()).unwrap();
                assert_eq!(params.sample_rate, 16_000);
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn vision_is_an_alias_for_image() {
        let raw = r#"{"type":"vision","url":"http://cam/1.jpg","text":"what do you see"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Image { .. }));
    }

    #[test]
    fn listen_detect_carries_text() {
        let raw = r#"{"type":"listen","state":"detect","text":"你好小智"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Listen { state, text, mode } => {
                assert_eq!(state, ListenState::Detect);
                assert_eq!(text.as_deref(), Some("你好小智"));
                assert!(mode.is_none());
            }
            other => panic!("expected listen, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_deserialization() {
        let raw = r#"{"type":"teleport"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn server_hello_shape() {
        let msg = ServerMessage::hello("s1", AudioParams::server_default());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["version"], 1);
        assert_eq!(v["transport"], "websocket");
        assert_eq!(v["audio_params"]["sample_rate"], 24_000);
    }

    #[test]
    fn tts_sentence_start_serializes_index() {
        let msg = ServerMessage::tts_sentence("s1", TtsState::SentenceStart, "hello.", 1);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["state"], "sentence_start");
        assert_eq!(v["index"], 1);
        assert_eq!(v["audio_codec"], "opus");
    }

    #[test]
    fn tts_stop_omits_text_and_index() {
        let msg = ServerMessage::tts_state("s1", TtsState::Stop);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["state"], "stop");
        assert!(v.get("text").is_none());
        assert!(v.get("index").is_none());
    }

    #[test]
    fn emotion_emoji_mapping() {
        let msg = ServerMessage::emotion("s1", "thinking");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["emotion"], "thinking");
        assert_eq!(v["text"], "🤔");
    }

    #[test]
    fn mcp_client_message_keeps_payload_opaque() {
        let raw = json!({"type":"mcp","session_id":"s1","payload":{"jsonrpc":"2.0","id":1,"result":{}}});
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Mcp { payload, session_id } => {
                assert_eq!(payload["id"], 1);
                assert_eq!(session_id.as_deref(), Some("s1"));
            }
            other => panic!("expected mcp, got {other:?}"),
        }
    }
}

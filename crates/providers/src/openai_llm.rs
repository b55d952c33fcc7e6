//! OpenAI-compatible chat adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, and any other endpoint
//! that follows the OpenAI chat completions contract. Vision models
//! use the same adapter: image message parts serialize to `image_url`
//! content blocks.
//!
//! Stream chunks deserialize into the typed [`ChatChunk`] shapes below
//! rather than being poked field-by-field. Tool-call argument
//! fragments arrive keyed by a choice-local `index` while the call id
//! appears only on the first fragment, so the payload handler keeps an
//! index→id map across chunks and re-keys every fragment to the real
//! id before the turn loop sees it.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::from_reqwest;
use crate::sse::decode_sse;
use crate::traits::{ChatRequest, LlmProvider};
use vx_domain::config::LlmProviderConfig;
use vx_domain::error::{Error, Result};
use vx_domain::message::{ContentPart, Message, MessageContent, Role};
use vx_domain::stream::{BoxStream, StreamEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiLlm {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn from_config(id: &str, cfg: &LlmProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            client,
        })
    }

    fn build_chat_body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(&req.messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = tools.into();
        }
        if let Some(temp) = req.temperature.or(self.temperature) {
            body["temperature"] = json!(temp);
        }
        if let Some(max) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(wire_message).collect()
}

/// One conversation message in OpenAI wire form. Assistant tool-call
/// requests and tool results need their own shapes; system messages
/// are flattened text.
fn wire_message(msg: &Message) -> Value {
    match msg.role {
        Role::System => json!({
            "role": "system",
            "content": msg.content.extract_all_text(),
        }),
        Role::User => wire_user(msg),
        Role::Assistant => wire_assistant(msg),
        Role::Tool => wire_tool_result(msg),
    }
}

/// Users get the multimodal content-block form only when an image part
/// is present; plain text stays a bare string.
fn wire_user(msg: &Message) -> Value {
    let parts = match &msg.content {
        MessageContent::Text(t) => return json!({"role": "user", "content": t}),
        MessageContent::Parts(parts) => parts,
    };

    if !parts.iter().any(|p| matches!(p, ContentPart::Image { .. })) {
        return json!({
            "role": "user",
            "content": msg.content.extract_all_text(),
        });
    }

    let blocks: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
            ContentPart::Image { url, .. } => Some(json!({
                "type": "image_url",
                "image_url": {"url": url},
            })),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": blocks})
}

fn wire_assistant(msg: &Message) -> Value {
    let text = msg.content.extract_all_text();
    let mut out = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { Value::String(text) },
    });

    let calls = msg.tool_calls();
    if !calls.is_empty() {
        let wire_calls: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.call_id,
                    "type": "function",
                    "function": {
                        "name": call.tool_name,
                        // The wire format wants arguments as a JSON string.
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
        out["tool_calls"] = wire_calls.into();
    }
    out
}

fn wire_tool_result(msg: &Message) -> Value {
    let (call_id, text) = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .find_map(|part| match part {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some((tool_use_id.clone(), content.clone())),
                _ => None,
            })
            .unwrap_or_default(),
        MessageContent::Text(t) => (String::new(), t.clone()),
    };
    json!({"role": "tool", "tool_call_id": call_id, "content": text})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream chunk shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: FunctionChunk,
}

#[derive(Deserialize, Default)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A stateful handler for one stream: remembers which call id each
/// tool-call index announced so later argument fragments re-key to it.
fn chunk_handler() -> impl FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static {
    let mut call_ids: HashMap<u32, String> = HashMap::new();

    move |payload: &str| {
        if payload.trim() == "[DONE]" {
            return vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })];
        }

        let chunk: ChatChunk = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => return vec![Err(Error::Json(e))],
        };

        let mut events = Vec::new();

        let choice = match chunk.choices.into_iter().next() {
            Some(choice) => choice,
            None => {
                // Trailing usage-only chunk (stream_options.include_usage).
                if let Some(usage) = chunk.usage {
                    events.push(Ok(StreamEvent::Done {
                        usage: Some(usage),
                        finish_reason: None,
                    }));
                }
                return events;
            }
        };

        for tc in choice.delta.tool_calls {
            if let Some(id) = tc.id {
                call_ids.insert(tc.index, id.clone());
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id,
                    tool_name: tc.function.name.clone().unwrap_or_default(),
                }));
            }
            if let Some(args) = tc.function.arguments {
                if !args.is_empty() {
                    let call_id = call_ids
                        .get(&tc.index)
                        .cloned()
                        .unwrap_or_else(|| tc.index.to_string());
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id,
                        delta: args,
                    }));
                }
            }
        }

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token { text }));
            }
        }

        if let Some(reason) = choice.finish_reason {
            events.push(Ok(StreamEvent::Done {
                usage: chunk.usage,
                finish_reason: Some(reason),
            }));
        }

        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiLlm {
    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req);

        tracing::debug!(provider = %self.id, url = %url, "chat stream request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder.json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        Ok(decode_sse(resp, chunk_handler()))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vx_domain::message::ToolCall;

    fn events_of(payloads: &[&str]) -> Vec<StreamEvent> {
        let mut handle = chunk_handler();
        payloads
            .iter()
            .flat_map(|p| handle(p))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn content_delta_becomes_token() {
        let events = events_of(&[r#"{"choices":[{"delta":{"content":"hi"}}]}"#]);
        assert!(matches!(&events[..], [StreamEvent::Token { text }] if text == "hi"));
    }

    #[test]
    fn tool_call_fragments_rekey_to_the_announced_id() {
        let events = events_of(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"get_time"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"zone\""}}]}}]}"#,
        ]);
        match &events[..] {
            [StreamEvent::ToolCallStarted { call_id, tool_name }, StreamEvent::ToolCallDelta {
                call_id: delta_id,
                delta,
            }] => {
                assert_eq!(call_id, "call_9");
                assert_eq!(tool_name, "get_time");
                // The fragment arrived keyed by index 0 but is re-keyed.
                assert_eq!(delta_id, "call_9");
                assert_eq!(delta, "{\"zone\"");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn id_and_arguments_in_one_chunk_emit_both_events() {
        let events = events_of(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":"{}"}}]}}]}"#,
        ]);
        assert!(matches!(events[0], StreamEvent::ToolCallStarted { .. }));
        assert!(matches!(events[1], StreamEvent::ToolCallDelta { .. }));
    }

    #[test]
    fn finish_reason_closes_the_stream() {
        let events = events_of(&[r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#]);
        assert!(matches!(
            &events[..],
            [StreamEvent::Done { finish_reason: Some(r), .. }] if r == "tool_calls"
        ));
    }

    #[test]
    fn done_sentinel_maps_to_done() {
        let events = events_of(&["[DONE]"]);
        assert!(matches!(&events[..], [StreamEvent::Done { .. }]));
    }

    #[test]
    fn usage_only_chunk_carries_totals() {
        let events = events_of(&[
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        ]);
        match &events[..] {
            [StreamEvent::Done { usage: Some(u), .. }] => assert_eq!(u.total_tokens, 15),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn malformed_chunk_surfaces_a_json_error() {
        let mut handle = chunk_handler();
        let events = handle("{not json");
        assert!(matches!(events[..], [Err(Error::Json(_))]));
    }

    #[test]
    fn assistant_tool_calls_take_openai_shape() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "get_time".into(),
            arguments: json!({}),
        }];
        let v = wire_assistant(&Message::assistant_tool_calls("", &calls));
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["id"], "c1");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "get_time");
        // Arguments are re-encoded as a string.
        assert_eq!(v["tool_calls"][0]["function"]["arguments"], "{}");
    }

    #[test]
    fn assistant_text_survives_alongside_calls() {
        let calls = vec![ToolCall {
            call_id: "c2".into(),
            tool_name: "play_music".into(),
            arguments: json!({"song": "x"}),
        }];
        let v = wire_assistant(&Message::assistant_tool_calls("one moment", &calls));
        assert_eq!(v["content"], "one moment");
    }

    #[test]
    fn tool_result_carries_its_call_id() {
        let v = wire_tool_result(&Message::tool_result("c1", "12:30"));
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "c1");
        assert_eq!(v["content"], "12:30");
    }

    #[test]
    fn image_parts_switch_user_content_to_blocks() {
        let v = wire_user(&Message::user_with_image("describe", "http://cam/x.jpg"));
        let blocks = v["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], "image_url");
        assert_eq!(blocks[1]["type"], "text");
    }

    #[test]
    fn plain_user_text_stays_a_string() {
        let v = wire_user(&Message::user("hello"));
        assert_eq!(v["content"], "hello");
    }
}

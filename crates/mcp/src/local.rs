//! In-process tools available to every session.
//!
//! Most of these resolve to `CallHandler` envelopes: the actual work
//! (closing the session, switching voices, queueing a music file)
//! touches session state, so it happens in the session's own handler
//! dispatch rather than here.

use serde_json::Value;

use vx_domain::error::Result;
use vx_domain::message::ToolDefinition;

use crate::action::{handlers, ActionResponse};
use crate::client::McpClient;

/// The fixed set of in-process tools.
pub struct LocalToolClient {
    tools: Vec<ToolDefinition>,
}

impl Default for LocalToolClient {
    fn default() -> Self {
        Self::new()
    }
}

fn no_args_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

fn one_string_schema(field: &str, description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            field: {"type": "string", "description": description}
        },
        "required": [field]
    })
}

impl LocalToolClient {
    pub fn new() -> Self {
        let tools = vec![
            ToolDefinition {
                name: "get_time".into(),
                description: "Get the current date and time.".into(),
                parameters: no_args_schema(),
            },
            ToolDefinition {
                name: "exit_chat".into(),
                description: "End the conversation when the user says goodbye.".into(),
                parameters: no_args_schema(),
            },
            ToolDefinition {
                name: "play_music".into(),
                description: "Play a song from the local music library.".into(),
                parameters: one_string_schema("song", "Song name to play; empty for a random pick."),
            },
            ToolDefinition {
                name: "change_voice".into(),
                description: "Switch the assistant's speaking voice.".into(),
                parameters: one_string_schema("voice", "Name of the voice to switch to."),
            },
            ToolDefinition {
                name: "change_role".into(),
                description: "Change the assistant's persona.".into(),
                parameters: one_string_schema("role", "Description of the new persona."),
            },
            ToolDefinition {
                name: "switch_agent".into(),
                description: "Hand the conversation to a different agent.".into(),
                parameters: one_string_schema("agent", "Name of the agent to switch to."),
            },
        ];
        Self { tools }
    }
}

#[async_trait::async_trait]
impl McpClient for LocalToolClient {
    fn client_id(&self) -> &str {
        "local"
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.clone()
    }

    async fn call_tool(&self, name: &str, args: &Value) -> Result<ActionResponse> {
        let resp = match name {
            "get_time" => {
                let now = chrono::Local::now();
                ActionResponse::ReqLlm(format!(
                    "The current time is {}.",
                    now.format("%Y-%m-%d %H:%M:%S")
                ))
            }
            "exit_chat" => ActionResponse::CallHandler {
                handler: handlers::EXIT.into(),
                args: args.clone(),
            },
            "play_music" => ActionResponse::CallHandler {
                handler: handlers::PLAY_MUSIC.into(),
                args: args.clone(),
            },
            "change_voice" => ActionResponse::CallHandler {
                handler: handlers::CHANGE_VOICE.into(),
                args: args.clone(),
            },
            "change_role" => ActionResponse::CallHandler {
                handler: handlers::CHANGE_ROLE.into(),
                args: args.clone(),
            },
            "switch_agent" => ActionResponse::CallHandler {
                handler: handlers::SWITCH_AGENT.into(),
                args: args.clone(),
            },
            other => ActionResponse::NotFound(format!("tool not found: {other}")),
        };
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_time_feeds_the_llm() {
        let client = LocalToolClient::new();
        let resp = client
            .call_tool("get_time", &serde_json::json!({}))
            .await
            .unwrap();
        match resp {
            ActionResponse::ReqLlm(text) => assert!(text.contains("current time")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_chat_is_a_handler_dispatch() {
        let client = LocalToolClient::new();
        let resp = client
            .call_tool("exit_chat", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(
            resp,
            ActionResponse::CallHandler {
                handler: handlers::EXIT.into(),
                args: serde_json::json!({}),
            }
        );
    }

    #[tokio::test]
    async fn play_music_forwards_arguments() {
        let client = LocalToolClient::new();
        let args = serde_json::json!({"song": "moonlight"});
        let resp = client.call_tool("play_music", &args).await.unwrap();
        match resp {
            ActionResponse::CallHandler { handler, args } => {
                assert_eq!(handler, handlers::PLAY_MUSIC);
                assert_eq!(args["song"], "moonlight");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn every_tool_is_discoverable() {
        let client = LocalToolClient::new();
        for name in [
            "get_time",
            "exit_chat",
            "play_music",
            "change_voice",
            "change_role",
            "switch_agent",
        ] {
            assert!(client.has_tool(name), "missing {name}");
        }
        assert!(!client.has_tool("get_weather"));
    }
}

//! Tool router — fans a tool call out to the first client that claims
//! the name, with a short-lived result cache.
//!
//! LLMs occasionally re-emit identical tool calls within one turn;
//! within a 10 second window repeats return the cached envelope and
//! skip the downstream (often device round-trip) work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use vx_domain::error::Result;
use vx_domain::message::ToolDefinition;

use crate::action::ActionResponse;
use crate::client::McpClient;

/// How long a successful call result stays servable.
const CACHE_TTL: Duration = Duration::from_secs(10);

struct CacheEntry {
    response: ActionResponse,
    expires_at: Instant,
}

/// Multi-client tool router with result caching.
pub struct ToolRouter {
    /// Consulted in insertion order.
    clients: Vec<Arc<dyn McpClient>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ToolRouter {
    pub fn new(clients: Vec<Arc<dyn McpClient>>) -> Self {
        Self {
            clients,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `name + "|" + k=v` pairs in sorted key order, so argument
    /// object ordering does not defeat the cache.
    fn cache_key(name: &str, args: &Value) -> String {
        let mut key = String::from(name);
        key.push('|');
        if let Some(obj) = args.as_object() {
            let mut keys: Vec<_> = obj.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let v = &obj[k];
                    match v.as_str() {
                        Some(s) => format!("{k}={s}"),
                        None => format!("{k}={v}"),
                    }
                })
                .collect();
            key.push_str(&parts.join(","));
        }
        key
    }

    /// Whether any client serves `name`.
    pub fn has_tool(&self, name: &str) -> bool {
        self.clients.iter().any(|c| c.has_tool(name))
    }

    /// All tool definitions across clients, in client order.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.clients
            .iter()
            .flat_map(|c| c.tool_definitions())
            .collect()
    }

    /// Route a tool call. Fresh cached results short-circuit; expired
    /// entries are evicted. Client errors pass through uncached.
    pub async fn execute_tool(&self, name: &str, args: &Value) -> Result<ActionResponse> {
        let key = Self::cache_key(name, args);

        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if Instant::now() < entry.expires_at {
                    tracing::debug!(tool = %name, "tool result served from cache");
                    return Ok(entry.response.clone());
                }
                cache.remove(&key);
            }
        }

        let owner = self.clients.iter().find(|c| c.has_tool(name));
        let client = match owner {
            Some(c) => c,
            None => {
                return Ok(ActionResponse::NotFound(format!("tool not found: {name}")));
            }
        };

        tracing::debug!(tool = %name, client = %client.client_id(), "dispatching tool call");
        let response = client.call_tool(name, args).await?;

        if response.is_success() {
            self.cache.lock().insert(
                key,
                CacheEntry {
                    response: response.clone(),
                    expires_at: Instant::now() + CACHE_TTL,
                },
            );
        }

        Ok(response)
    }

    /// Drop all cached results (called on session reset).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A client that counts calls and answers a fixed envelope.
    struct FakeClient {
        id: String,
        tools: Vec<String>,
        calls: AtomicUsize,
        response: ActionResponse,
    }

    impl FakeClient {
        fn new(id: &str, tools: &[&str], response: ActionResponse) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                tools: tools.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                response,
            })
        }
    }

    #[async_trait::async_trait]
    impl McpClient for FakeClient {
        fn client_id(&self) -> &str {
            &self.id
        }

        fn has_tool(&self, name: &str) -> bool {
            self.tools.iter().any(|t| t == name)
        }

        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            self.tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.clone(),
                    description: String::new(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                })
                .collect()
        }

        async fn call_tool(&self, _name: &str, _args: &Value) -> Result<ActionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_not_found() {
        let router = ToolRouter::new(vec![]);
        let resp = router
            .execute_tool("ghost", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(matches!(resp, ActionResponse::NotFound(_)));
    }

    #[tokio::test]
    async fn first_claiming_client_owns_the_call() {
        let a = FakeClient::new("a", &["shared"], ActionResponse::ReqLlm("from a".into()));
        let b = FakeClient::new("b", &["shared"], ActionResponse::ReqLlm("from b".into()));
        let router = ToolRouter::new(vec![a.clone(), b.clone()]);

        let resp = router
            .execute_tool("shared", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp, ActionResponse::ReqLlm("from a".into()));
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn identical_calls_within_ttl_hit_cache() {
        let c = FakeClient::new("c", &["get_time"], ActionResponse::ReqLlm("12:00".into()));
        let router = ToolRouter::new(vec![c.clone()]);
        let args = serde_json::json!({"zone": "utc"});

        router.execute_tool("get_time", &args).await.unwrap();
        router.execute_tool("get_time", &args).await.unwrap();

        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn argument_order_does_not_defeat_the_cache() {
        let key1 = ToolRouter::cache_key(
            "t",
            &serde_json::from_str::<Value>(r#"{"a":1,"b":"x"}"#).unwrap(),
        );
        let key2 = ToolRouter::cache_key(
            "t",
            &serde_json::from_str::<Value>(r#"{"b":"x","a":1}"#).unwrap(),
        );
        assert_eq!(key1, key2);
        assert_eq!(key1, "t|a=1,b=x");
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let c = FakeClient::new("c", &["flaky"], ActionResponse::Error("boom".into()));
        let router = ToolRouter::new(vec![c.clone()]);
        let args = serde_json::json!({});

        router.execute_tool("flaky", &args).await.unwrap();
        router.execute_tool("flaky", &args).await.unwrap();

        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        assert_eq!(router.cache_len(), 0);
    }

    #[tokio::test]
    async fn clear_cache_forces_redispatch() {
        let c = FakeClient::new("c", &["get_time"], ActionResponse::ReqLlm("t".into()));
        let router = ToolRouter::new(vec![c.clone()]);
        let args = serde_json::json!({});

        router.execute_tool("get_time", &args).await.unwrap();
        router.clear_cache();
        router.execute_tool("get_time", &args).await.unwrap();

        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_args_are_distinct_entries() {
        let c = FakeClient::new("c", &["echo"], ActionResponse::ReqLlm("ok".into()));
        let router = ToolRouter::new(vec![c.clone()]);

        router
            .execute_tool("echo", &serde_json::json!({"text": "a"}))
            .await
            .unwrap();
        router
            .execute_tool("echo", &serde_json::json!({"text": "b"}))
            .await
            .unwrap();

        assert_eq!(c.calls.load(Ordering::SeqCst), 2);
        assert_eq!(router.cache_len(), 2);
    }
}

//! Session tool registry.
//!
//! Tool names on the wire may contain dots (`self.camera.take_photo`);
//! OpenAI-compatible function names may not. The registry stores every
//! tool under its sanitized alias and keeps the reverse map so calls
//! can be routed back under the original name.

use std::collections::HashMap;

use parking_lot::RwLock;

use vx_domain::error::{Error, Result};
use vx_domain::message::ToolDefinition;

/// Replace the characters OpenAI-style function names reject.
pub fn sanitize_name(name: &str) -> String {
    name.replace('.', "_")
}

#[derive(Default)]
struct Inner {
    /// sanitized name → definition (definition carries the sanitized name).
    tools: HashMap<String, ToolDefinition>,
    /// sanitized name → original wire name.
    originals: HashMap<String, String>,
}

/// Thread-safe name→tool map with sanitized-alias round-tripping.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register tools under their sanitized names. An empty list is a
    /// no-op; an empty tool name is an error.
    pub fn register(&self, tools: Vec<ToolDefinition>) -> Result<()> {
        let mut inner = self.inner.write();
        for tool in tools {
            if tool.name.is_empty() {
                return Err(Error::Tool("tool with empty name rejected".into()));
            }
            let sanitized = sanitize_name(&tool.name);
            inner.originals.insert(sanitized.clone(), tool.name.clone());
            inner.tools.insert(
                sanitized.clone(),
                ToolDefinition {
                    name: sanitized,
                    description: tool.description,
                    parameters: tool.parameters,
                },
            );
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        let inner = self.inner.read();
        inner
            .tools
            .get(name)
            .or_else(|| inner.tools.get(&sanitize_name(name)))
            .cloned()
    }

    /// All registered tools, sorted by name.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self.inner.read().tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn is_mcp_tool(&self, name: &str) -> bool {
        let inner = self.inner.read();
        inner.tools.contains_key(name) || inner.tools.contains_key(&sanitize_name(name))
    }

    /// The wire name a sanitized alias maps back to.
    pub fn original_name(&self, sanitized: &str) -> Option<String> {
        self.inner.read().originals.get(sanitized).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tools.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tools.clear();
        inner.originals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn register_sanitizes_dotted_names() {
        let reg = ToolRegistry::new();
        reg.register(vec![tool("self.camera.take_photo")]).unwrap();

        assert!(reg.is_mcp_tool("self_camera_take_photo"));
        assert!(reg.is_mcp_tool("self.camera.take_photo"));
        assert_eq!(
            reg.original_name("self_camera_take_photo").as_deref(),
            Some("self.camera.take_photo")
        );
    }

    #[test]
    fn sanitized_alias_round_trips_uniquely() {
        let reg = ToolRegistry::new();
        reg.register(vec![tool("a.b"), tool("c.d")]).unwrap();
        assert_eq!(reg.original_name("a_b").as_deref(), Some("a.b"));
        assert_eq!(reg.original_name("c_d").as_deref(), Some("c.d"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn empty_name_is_rejected() {
        let reg = ToolRegistry::new();
        assert!(reg.register(vec![tool("")]).is_err());
    }

    #[test]
    fn empty_list_is_a_noop() {
        let reg = ToolRegistry::new();
        reg.register(Vec::new()).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn list_is_sorted() {
        let reg = ToolRegistry::new();
        reg.register(vec![tool("zeta"), tool("alpha"), tool("mid")])
            .unwrap();
        let names: Vec<_> = reg.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn reregistration_replaces() {
        let reg = ToolRegistry::new();
        reg.register(vec![tool("get_time")]).unwrap();
        reg.register(vec![tool("get_time")]).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn clear_empties_both_maps() {
        let reg = ToolRegistry::new();
        reg.register(vec![tool("a.b")]).unwrap();
        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.original_name("a_b").is_none());
    }
}

//! Tool contract and registry.
//!
//! Every tool exposes a stable name, a JSON-schema definition for the
//! model, and a JSON-in/JSON-out `execute`. Tools that sometimes need a
//! human decision regardless of policy implement `approval_request`; the
//! orchestrator inspects it before execution. Mutating tools report their
//! affected paths up front so undo snapshots can be captured before any
//! byte hits disk.

mod bash;
mod edit;
mod fs_query;
mod patch;
mod read;
mod todos;
mod write;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use bash::BashTool;
pub use edit::EditTool;
pub use fs_query::GlobTool;
pub use fs_query::GrepTool;
pub use fs_query::ListTool;
pub use patch::PatchTool;
pub use read::ReadTool;
pub use todos::TodoReadTool;
pub use todos::TodoWriteTool;
pub use write::WriteTool;

use crate::models::ToolDef;
use crate::todo::TodoStore;
use crate::workspace::Workspace;

/// Tools that mutate the workspace; their targets are snapshotted for undo
/// before execution.
pub const MUTATING_TOOLS: &[&str] = &["write", "edit", "patch"];

/// Shared state handed to every tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<Workspace>,
    pub cancel: CancellationToken,
    pub session_id: String,
    pub todos: Arc<Mutex<TodoStore>>,
}

/// A tool's self-declared demand for a human decision. Returned before
/// execution; non-nil means "ask", even when policy already said allow.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub tool: String,
    pub reason: String,
    pub raw_args: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn definition(&self) -> ToolDef;

    /// Secondary capability: demand approval based on the concrete args.
    fn approval_request(&self, _ctx: &ToolContext, _args: &Value) -> Option<ApprovalRequest> {
        None
    }

    /// Workspace paths this call would touch, resolved. Empty for
    /// non-mutating tools.
    fn affected_paths(&self, _ctx: &ToolContext, _args: &Value) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Run the tool. The returned string is a JSON document, conventionally
    /// `{"ok": bool, ...}`. Errors that are the *tool's* fault should be
    /// captured into `{"ok": false, "error": …}` instead of returned;
    /// returned errors are reserved for unexpected failures (and
    /// cancellation, which the orchestrator detects via the context token).
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All core tools.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadTool));
        registry.register(Arc::new(WriteTool));
        registry.register(Arc::new(EditTool));
        registry.register(Arc::new(PatchTool));
        registry.register(Arc::new(BashTool::default()));
        registry.register(Arc::new(GrepTool));
        registry.register(Arc::new(GlobTool));
        registry.register(Arc::new(ListTool));
        registry.register(Arc::new(TodoReadTool));
        registry.register(Arc::new(TodoWriteTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.tools.keys().map(|k| k.to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Definitions in deterministic (name) order.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Keep tools whose entry in `allow` is `true` or absent.
    pub fn definitions_filtered(&self, allow: &HashMap<String, bool>) -> Vec<ToolDef> {
        self.tools
            .values()
            .filter(|t| allow.get(t.name()).copied().unwrap_or(true))
            .map(|t| t.definition())
            .collect()
    }

    pub fn approval_request(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: &Value,
    ) -> Option<ApprovalRequest> {
        self.tools.get(name)?.approval_request(ctx, args)
    }

    pub fn affected_paths(&self, ctx: &ToolContext, name: &str, args: &Value) -> Vec<PathBuf> {
        self.tools
            .get(name)
            .map(|t| t.affected_paths(ctx, args))
            .unwrap_or_default()
    }

    pub async fn execute(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
    ) -> anyhow::Result<String> {
        match self.tools.get(name) {
            Some(tool) => tool.execute(ctx, args).await,
            None => anyhow::bail!("unsupported call: {name}"),
        }
    }
}

/// Serialize a tool result, falling back to a plain error payload if the
/// value itself will not serialize.
pub(crate) fn result_json(value: serde_json::Value) -> String {
    serde_json::to_string(&value)
        .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"serialize result: {e}"}}"#))
}

#[cfg(test)]
pub(crate) fn test_context(workspace_root: &std::path::Path) -> ToolContext {
    #[allow(clippy::unwrap_used)]
    let workspace = Arc::new(Workspace::new(workspace_root).unwrap());
    ToolContext {
        workspace,
        cancel: CancellationToken::new(),
        session_id: "test-session".to_string(),
        todos: Arc::new(Mutex::new(TodoStore::default())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn builtin_registry_is_deterministically_ordered() {
        let registry = ToolRegistry::builtin();
        let names: Vec<String> = registry
            .definitions()
            .iter()
            .map(|d| d.function.name.clone())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(registry.has("bash"));
        assert!(registry.has("patch"));
        assert!(!registry.has("nope"));
    }

    #[test]
    fn filtered_definitions_drop_disabled_tools() {
        let registry = ToolRegistry::builtin();
        let mut allow = HashMap::new();
        allow.insert("bash".to_string(), false);
        allow.insert("read".to_string(), true);
        let defs = registry.definitions_filtered(&allow);
        assert!(defs.iter().all(|d| d.function.name != "bash"));
        assert!(defs.iter().any(|d| d.function.name == "read"));
        // Absent entries stay enabled.
        assert!(defs.iter().any(|d| d.function.name == "glob"));
    }

    #[tokio::test]
    async fn unknown_tool_execution_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let registry = ToolRegistry::builtin();
        let err = registry
            .execute(&ctx, "nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported call"));
    }
}

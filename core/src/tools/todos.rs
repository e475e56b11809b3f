//! Model-facing access to the session todo list.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::models::JsonSchema;
use crate::models::ToolDef;
use crate::todo::TodoItem;

pub struct TodoReadTool;

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &'static str {
        "todoread"
    }

    fn definition(&self) -> ToolDef {
        ToolDef::function(
            "todoread",
            "Read the current todo list",
            JsonSchema::object(BTreeMap::new(), &[]),
        )
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> anyhow::Result<String> {
        #[allow(clippy::unwrap_used)]
        let todos = ctx.todos.lock().unwrap().list(&ctx.session_id);
        Ok(result_json(json!({"ok": true, "todos": todos})))
    }
}

#[derive(Debug, Deserialize)]
struct TodoWriteArgs {
    todos: Vec<TodoItem>,
}

pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &'static str {
        "todowrite"
    }

    fn definition(&self) -> ToolDef {
        let mut item_properties = BTreeMap::new();
        item_properties.insert("id".to_string(), JsonSchema::string("Stable item id"));
        item_properties.insert(
            "content".to_string(),
            JsonSchema::string("What needs to be done"),
        );
        item_properties.insert(
            "status".to_string(),
            JsonSchema::string("pending | in_progress | completed"),
        );
        item_properties.insert(
            "priority".to_string(),
            JsonSchema::string("high | medium | low"),
        );

        let mut properties = BTreeMap::new();
        properties.insert(
            "todos".to_string(),
            JsonSchema::Array {
                items: Box::new(JsonSchema::object(
                    item_properties,
                    &["content", "status", "priority"],
                )),
                description: Some("Full replacement todo list".to_string()),
            },
        );
        ToolDef::function(
            "todowrite",
            "Replace the todo list; keep exactly one item in_progress",
            JsonSchema::object(properties, &["todos"]),
        )
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: TodoWriteArgs = match serde_json::from_value(args) {
            Ok(args) => args,
            Err(e) => {
                return Ok(result_json(
                    json!({"ok": false, "error": format!("invalid todos: {e}")}),
                ));
            }
        };
        #[allow(clippy::unwrap_used)]
        let normalized = ctx
            .todos
            .lock()
            .unwrap()
            .replace(&ctx.session_id, args.todos);
        Ok(result_json(json!({"ok": true, "todos": normalized})))
    }
}

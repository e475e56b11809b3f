use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use coder_diff::build_unified_diff;
use coder_diff::truncate_unified_diff;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::models::JsonSchema;
use crate::models::ToolDef;

/// Diff previews embedded in write/edit results are capped here.
pub(crate) const PREVIEW_MAX_LINES: usize = 80;
pub(crate) const PREVIEW_MAX_BYTES: usize = 8000;

#[derive(Debug, Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

/// Verbatim file writes with a truncated diff preview in the result.
pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "path".to_string(),
            JsonSchema::string("File path to write"),
        );
        properties.insert(
            "content".to_string(),
            JsonSchema::string("Full file content, written verbatim"),
        );
        ToolDef::function(
            "write",
            "Create or overwrite a file with the given content",
            JsonSchema::object(properties, &["path", "content"]),
        )
    }

    fn affected_paths(&self, ctx: &ToolContext, args: &Value) -> Vec<PathBuf> {
        args.get("path")
            .and_then(|p| p.as_str())
            .and_then(|p| ctx.workspace.resolve(p).ok())
            .into_iter()
            .collect()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: WriteArgs = serde_json::from_value(args)?;
        let path = match ctx.workspace.resolve(&args.path) {
            Ok(path) => path,
            Err(e) => return Ok(result_json(json!({"ok": false, "error": e.to_string()}))),
        };

        let old = std::fs::read_to_string(&path).ok();
        let operation = match &old {
            None => "created",
            Some(old) if normalized(old) == normalized(&args.content) => "unchanged",
            Some(_) => "updated",
        };

        if operation != "unchanged" {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &args.content)?;
        }

        let (diff, additions, deletions) = build_unified_diff(
            &ctx.workspace.relative(&path).display().to_string(),
            old.as_deref().unwrap_or_default(),
            &args.content,
        );

        Ok(result_json(json!({
            "ok": true,
            "path": args.path,
            "operation": operation,
            "size": args.content.len(),
            "additions": additions,
            "deletions": deletions,
            "diff": truncate_unified_diff(&diff, PREVIEW_MAX_LINES, PREVIEW_MAX_BYTES),
        })))
    }
}

/// Line-ending normalization for the `unchanged` check only; writes stay
/// verbatim.
fn normalized(text: &str) -> String {
    text.replace("\r\n", "\n")
}

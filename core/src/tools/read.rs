use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::ApprovalRequest;
use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::models::JsonSchema;
use crate::models::ToolDef;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    /// 1-based first line; negative selects the last `limit` lines.
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Windowed file reads, workspace-confined. Absolute paths outside the
/// workspace are allowed only through an explicit approval.
pub struct ReadTool;

impl ReadTool {
    /// Resolve inside the workspace, or accept an existing absolute outside
    /// path (which `approval_request` will have flagged).
    fn target(&self, ctx: &ToolContext, path: &str) -> anyhow::Result<(PathBuf, bool)> {
        match ctx.workspace.resolve(path) {
            Ok(resolved) => Ok((resolved, false)),
            Err(inside_err) => {
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() && candidate.is_file() {
                    Ok((candidate, true))
                } else {
                    Err(anyhow::anyhow!(inside_err))
                }
            }
        }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &'static str {
        "read"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert("path".to_string(), JsonSchema::string("File path to read"));
        properties.insert(
            "offset".to_string(),
            JsonSchema::number("1-based first line; negative reads the file tail"),
        );
        properties.insert(
            "limit".to_string(),
            JsonSchema::number("Maximum number of lines to return (default 50, cap 200)"),
        );
        ToolDef::function(
            "read",
            "Read a slice of a text file, returning numbered line bounds",
            JsonSchema::object(properties, &["path"]),
        )
    }

    fn approval_request(&self, ctx: &ToolContext, args: &Value) -> Option<ApprovalRequest> {
        let path = args.get("path")?.as_str()?;
        if ctx.workspace.resolve(path).is_err() {
            let candidate = PathBuf::from(path);
            if candidate.is_absolute() && candidate.is_file() {
                return Some(ApprovalRequest {
                    tool: "read".to_string(),
                    reason: format!("reads {path} outside the workspace"),
                    raw_args: args.clone(),
                });
            }
        }
        None
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: ReadArgs = serde_json::from_value(args)?;
        let (path, _outside) = match self.target(ctx, &args.path) {
            Ok(target) => target,
            Err(e) => {
                return Ok(result_json(json!({"ok": false, "error": e.to_string()})));
            }
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(result_json(
                    json!({"ok": false, "error": format!("read {}: {e}", args.path)}),
                ));
            }
        };

        let lines: Vec<&str> = raw.lines().collect();
        let total = lines.len();
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = args.offset.unwrap_or(1);

        // Tail mode on negative offset.
        let start = if offset < 0 {
            total.saturating_sub(limit)
        } else {
            (offset.max(1) as usize).saturating_sub(1)
        };
        let window: Vec<&str> = lines.iter().skip(start).take(limit).copied().collect();
        let end = start + window.len();

        Ok(result_json(json!({
            "ok": true,
            "path": args.path,
            "content": window.join("\n"),
            "start_line": if window.is_empty() { 0 } else { start + 1 },
            "end_line": end,
            "has_more": end < total,
        })))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::test_context;
    use super::*;

    fn read(ctx: &ToolContext, args: Value) -> Value {
        let result = tokio_test::block_on(ReadTool.execute(ctx, args)).unwrap();
        serde_json::from_str(&result).unwrap()
    }

    #[test]
    fn reads_default_window() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (1..=120).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), body).unwrap();
        let ctx = test_context(dir.path());

        let v = read(&ctx, json!({"path": "f.txt"}));
        assert_eq!(v["ok"], true);
        assert_eq!(v["start_line"], 1);
        assert_eq!(v["end_line"], 50);
        assert_eq!(v["has_more"], true);
        assert!(v["content"].as_str().unwrap().starts_with("line 1\n"));
    }

    #[test]
    fn offset_and_limit_window() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (1..=10).map(|i| format!("l{i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), body).unwrap();
        let ctx = test_context(dir.path());

        let v = read(&ctx, json!({"path": "f.txt", "offset": 4, "limit": 3}));
        assert_eq!(v["content"], "l4\nl5\nl6");
        assert_eq!(v["start_line"], 4);
        assert_eq!(v["end_line"], 6);
        assert_eq!(v["has_more"], true);
    }

    #[test]
    fn negative_offset_reads_tail() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (1..=10).map(|i| format!("l{i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), body).unwrap();
        let ctx = test_context(dir.path());

        let v = read(&ctx, json!({"path": "f.txt", "offset": -1, "limit": 2}));
        assert_eq!(v["content"], "l9\nl10");
        assert_eq!(v["has_more"], false);
    }

    #[test]
    fn limit_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (1..=500).map(|i| format!("l{i}\n")).collect();
        std::fs::write(dir.path().join("f.txt"), body).unwrap();
        let ctx = test_context(dir.path());

        let v = read(&ctx, json!({"path": "f.txt", "limit": 5000}));
        assert_eq!(v["end_line"], 200);
    }

    #[test]
    fn escape_attempts_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let v = read(&ctx, json!({"path": "../outside.txt"}));
        assert_eq!(v["ok"], false);
    }

    #[test]
    fn outside_absolute_file_demands_approval() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(outside.path(), "secret").unwrap();
        let ctx = test_context(dir.path());

        let args = json!({"path": outside.path().to_str().unwrap()});
        let request = ReadTool.approval_request(&ctx, &args).unwrap();
        assert!(request.reason.contains("outside the workspace"));
        // Workspace-internal reads never demand approval.
        std::fs::write(dir.path().join("in.txt"), "x").unwrap();
        assert!(
            ReadTool
                .approval_request(&ctx, &json!({"path": "in.txt"}))
                .is_none()
        );
    }
}

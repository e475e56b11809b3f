use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use coder_diff::FileOperation;
use coder_diff::apply_file_patch;
use coder_diff::parse_unified_diff;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::models::JsonSchema;
use crate::models::ToolDef;

/// Context lines in dry-run previews.
const PREVIEW_CONTEXT: usize = 1;

#[derive(Debug, Deserialize)]
struct PatchArgs {
    patch: String,
    #[serde(default)]
    dry_run: bool,
}

/// Applies a unified diff to the workspace, file sections in order.
/// Context or remove mismatches abort the whole call with a citation of
/// both sides; `dry_run` plans everything and touches nothing.
pub struct PatchTool;

#[async_trait]
impl Tool for PatchTool {
    fn name(&self) -> &'static str {
        "patch"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "patch".to_string(),
            JsonSchema::string(
                "Unified diff (`--- a/OLD`, `+++ b/NEW`, `@@` hunks); /dev/null creates or deletes",
            ),
        );
        properties.insert(
            "dry_run".to_string(),
            JsonSchema::boolean("Validate and preview without writing"),
        );
        ToolDef::function(
            "patch",
            "Apply a unified diff to one or more workspace files",
            JsonSchema::object(properties, &["patch"]),
        )
    }

    fn affected_paths(&self, ctx: &ToolContext, args: &Value) -> Vec<PathBuf> {
        let Some(patch) = args.get("patch").and_then(|p| p.as_str()) else {
            return Vec::new();
        };
        let Ok(patches) = parse_unified_diff(patch) else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        for file_patch in &patches {
            for side in [&file_patch.old_path, &file_patch.new_path] {
                if let Some(path) = side {
                    if let Ok(resolved) = ctx.workspace.resolve(&path.display().to_string()) {
                        if !paths.contains(&resolved) {
                            paths.push(resolved);
                        }
                    }
                }
            }
        }
        paths
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: PatchArgs = serde_json::from_value(args)?;
        let patches = match parse_unified_diff(&args.patch) {
            Ok(patches) => patches,
            Err(e) => return Ok(error_result(&e.to_string())),
        };

        // Plan every file before touching any: a mismatch in file three
        // must not leave files one and two half-applied.
        let mut planned = Vec::with_capacity(patches.len());
        for file_patch in &patches {
            let rel = file_patch
                .target_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let resolved = match ctx.workspace.resolve(&rel) {
                Ok(path) => path,
                Err(e) => return Ok(error_result(&e.to_string())),
            };
            let original = match std::fs::read_to_string(&resolved) {
                Ok(content) => Some(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Ok(error_result(&format!("read {rel}: {e}"))),
            };
            let applied = match apply_file_patch(file_patch, original.as_deref(), PREVIEW_CONTEXT)
            {
                Ok(applied) => applied,
                Err(e) => return Ok(error_result(&e.to_string())),
            };
            planned.push((resolved, rel, applied));
        }

        let mut files = Vec::with_capacity(planned.len());
        for (resolved, rel, applied) in planned {
            if !args.dry_run {
                match applied.operation {
                    FileOperation::Created | FileOperation::Updated => {
                        if let Some(parent) = resolved.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&resolved, applied.new_content.as_deref().unwrap_or(""))?;
                    }
                    FileOperation::Deleted => {
                        std::fs::remove_file(&resolved)?;
                    }
                }
            }
            files.push(json!({
                "path": rel,
                "operation": applied.operation.as_str(),
                "additions": applied.additions,
                "deletions": applied.deletions,
                "preview": applied.preview,
            }));
        }

        Ok(result_json(json!({
            "ok": true,
            "dry_run": args.dry_run,
            "files": files,
        })))
    }
}

fn error_result(message: &str) -> String {
    result_json(json!({"ok": false, "error": message}))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::test_context;
    use super::*;

    fn patch(ctx: &ToolContext, args: Value) -> Value {
        let result = tokio_test::block_on(PatchTool.execute(ctx, args)).unwrap();
        serde_json::from_str(&result).unwrap()
    }

    #[test]
    fn applies_update_hunk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "a\nb\nc\n").unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n"}),
        );
        assert_eq!(v["ok"], true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f")).unwrap(),
            "a\nB\nc\n"
        );
        assert_eq!(v["files"][0]["operation"], "updated");
    }

    #[test]
    fn tolerates_blank_extra_context_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "a\nb\nc\n").unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n\n a\n-b\n+B\n c\n"}),
        );
        assert_eq!(v["ok"], true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f")).unwrap(),
            "a\nB\nc\n"
        );
    }

    #[test]
    fn creates_and_deletes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "bye\n").unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,1 @@\n+hi\n\
                   --- a/old.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n"}),
        );
        assert_eq!(v["ok"], true);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("new.txt")).unwrap(),
            "hi\n"
        );
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn mismatch_cites_both_sides_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "unexpected\n").unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-one\n+ONE\n\
                   --- a/b.txt\n+++ b/b.txt\n@@ -1,1 +1,1 @@\n-two\n+TWO\n"}),
        );
        assert_eq!(v["ok"], false);
        let error = v["error"].as_str().unwrap();
        assert!(error.contains("two"));
        assert!(error.contains("unexpected"));
        // First file must not have been applied.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one\n"
        );
    }

    #[test]
    fn dry_run_previews_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "a\nb\n").unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n", "dry_run": true}),
        );
        assert_eq!(v["ok"], true);
        assert_eq!(v["dry_run"], true);
        assert!(v["files"][0]["preview"].as_str().unwrap().contains("+B"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f")).unwrap(),
            "a\nb\n"
        );
    }

    #[test]
    fn affected_paths_cover_all_sections() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let args = json!({"patch": "--- /dev/null\n+++ b/x.txt\n@@ -0,0 +1,1 @@\n+1\n\
                          --- a/y.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-2\n"});
        let paths = PatchTool.affected_paths(&ctx, &args);
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn escape_via_patch_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let v = patch(
            &ctx,
            json!({"patch": "--- /dev/null\n+++ b/../escape.txt\n@@ -0,0 +1,1 @@\n+x\n"}),
        );
        assert_eq!(v["ok"], false);
    }
}

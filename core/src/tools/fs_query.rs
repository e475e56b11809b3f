//! Read-only filesystem queries: `grep`, `glob`, `list`.
//!
//! All three walk with the `ignore` crate so `.gitignore` rules and hidden
//! directories behave the way a developer expects, and all roots are
//! workspace-confined.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use super::Tool;
use super::ToolContext;
use super::result_json;
use crate::models::JsonSchema;
use crate::models::ToolDef;

const GREP_MAX_RESULTS: usize = 100;
const GLOB_MAX_RESULTS: usize = 500;

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "pattern".to_string(),
            JsonSchema::string("Regular expression to search for"),
        );
        properties.insert(
            "path".to_string(),
            JsonSchema::string("Directory or file to search (default workspace root)"),
        );
        properties.insert(
            "max_results".to_string(),
            JsonSchema::number("Result cap (default 100)"),
        );
        ToolDef::function(
            "grep",
            "Search file contents by regex, returning path, line number, and line",
            JsonSchema::object(properties, &["pattern"]),
        )
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: GrepArgs = serde_json::from_value(args)?;
        let root = match ctx.workspace.resolve(args.path.as_deref().unwrap_or("")) {
            Ok(root) => root,
            Err(e) => return Ok(result_json(json!({"ok": false, "error": e.to_string()}))),
        };
        let regex = match regex_lite::Regex::new(&args.pattern) {
            Ok(regex) => regex,
            Err(e) => {
                return Ok(result_json(
                    json!({"ok": false, "error": format!("invalid pattern: {e}")}),
                ));
            }
        };
        let cap = args.max_results.unwrap_or(GREP_MAX_RESULTS).clamp(1, 1000);

        let mut matches = Vec::new();
        let mut hit_cap = false;
        'walk: for entry in WalkBuilder::new(&root).build().flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            // Binary and non-UTF-8 files are skipped wholesale.
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = ctx.workspace.relative(entry.path());
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(json!({
                        "path": rel.display().to_string(),
                        "line_number": i + 1,
                        "line": line,
                    }));
                    if matches.len() >= cap {
                        hit_cap = true;
                        break 'walk;
                    }
                }
            }
        }

        Ok(result_json(json!({
            "ok": true,
            "matches": matches,
            "truncated": hit_cap,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct GlobArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &'static str {
        "glob"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "pattern".to_string(),
            JsonSchema::string("Glob pattern, gitignore syntax (e.g. **/*.rs)"),
        );
        properties.insert(
            "path".to_string(),
            JsonSchema::string("Directory to search (default workspace root)"),
        );
        ToolDef::function(
            "glob",
            "Find files matching a glob pattern",
            JsonSchema::object(properties, &["pattern"]),
        )
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: GlobArgs = serde_json::from_value(args)?;
        let root = match ctx.workspace.resolve(args.path.as_deref().unwrap_or("")) {
            Ok(root) => root,
            Err(e) => return Ok(result_json(json!({"ok": false, "error": e.to_string()}))),
        };

        let mut override_builder = OverrideBuilder::new(&root);
        if override_builder.add(&args.pattern).is_err() {
            return Ok(result_json(
                json!({"ok": false, "error": format!("invalid glob pattern: {}", args.pattern)}),
            ));
        }
        let overrides = match override_builder.build() {
            Ok(overrides) => overrides,
            Err(e) => {
                return Ok(result_json(
                    json!({"ok": false, "error": format!("invalid glob pattern: {e}")}),
                ));
            }
        };

        let mut files = Vec::new();
        let mut hit_cap = false;
        for entry in WalkBuilder::new(&root).overrides(overrides).build().flatten() {
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            files.push(ctx.workspace.relative(entry.path()).display().to_string());
            if files.len() >= GLOB_MAX_RESULTS {
                hit_cap = true;
                break;
            }
        }
        files.sort();

        Ok(result_json(json!({
            "ok": true,
            "files": files,
            "count": files.len(),
            "truncated": hit_cap,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
}

pub struct ListTool;

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &'static str {
        "list"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert(
            "path".to_string(),
            JsonSchema::string("Directory to list (default workspace root)"),
        );
        ToolDef::function(
            "list",
            "List directory entries with type and size",
            JsonSchema::object(properties, &[]),
        )
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<String> {
        let args: ListArgs = serde_json::from_value(args)?;
        let dir = match ctx.workspace.resolve(args.path.as_deref().unwrap_or("")) {
            Ok(dir) => dir,
            Err(e) => return Ok(result_json(json!({"ok": false, "error": e.to_string()}))),
        };

        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                return Ok(result_json(
                    json!({"ok": false, "error": format!("list {}: {e}", dir.display())}),
                ));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            entries.push(json!({
                "name": name,
                "type": if metadata.is_dir() { "dir" } else { "file" },
                "size": metadata.len(),
            }));
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["name"].as_str().unwrap_or_default())
        });

        Ok(result_json(json!({"ok": true, "entries": entries})))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::super::test_context;
    use super::*;

    fn run(tool: &dyn Tool, ctx: &ToolContext, args: Value) -> Value {
        let result = tokio_test::block_on(tool.execute(ctx, args)).unwrap();
        serde_json::from_str(&result).unwrap()
    }

    fn seed(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}\nlet x = 1;\n").unwrap();
        std::fs::write(dir.join("src/lib.rs"), "pub fn lib() {}\n").unwrap();
        std::fs::write(dir.join("README.md"), "# hello\n").unwrap();
    }

    #[test]
    fn grep_finds_lines_with_numbers() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = test_context(dir.path());
        let v = run(&GrepTool, &ctx, json!({"pattern": "fn \\w+"}));
        assert_eq!(v["ok"], true);
        let matches = v["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().any(|m| m["path"] == "src/main.rs"));
        assert!(matches.iter().all(|m| m["line_number"] == 1));
    }

    #[test]
    fn grep_respects_result_cap() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("match {i}\n")).collect();
        std::fs::write(dir.path().join("big.txt"), body).unwrap();
        let ctx = test_context(dir.path());
        let v = run(&GrepTool, &ctx, json!({"pattern": "match", "max_results": 10}));
        assert_eq!(v["matches"].as_array().unwrap().len(), 10);
        assert_eq!(v["truncated"], true);
    }

    #[test]
    fn grep_rejects_bad_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let v = run(&GrepTool, &ctx, json!({"pattern": "("}));
        assert_eq!(v["ok"], false);
    }

    #[test]
    fn glob_matches_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = test_context(dir.path());
        let v = run(&GlobTool, &ctx, json!({"pattern": "**/*.rs"}));
        let files = v["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], "src/lib.rs");
    }

    #[test]
    fn list_reports_types_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let ctx = test_context(dir.path());
        let v = run(&ListTool, &ctx, json!({}));
        let entries = v["entries"].as_array().unwrap();
        assert_eq!(entries[0]["name"], "README.md");
        assert!(
            entries
                .iter()
                .any(|e| e["name"] == "src" && e["type"] == "dir")
        );
    }

    #[test]
    fn queries_stay_inside_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        for (tool, args) in [
            (&GrepTool as &dyn Tool, json!({"pattern": "x", "path": "../"})),
            (&GlobTool, json!({"pattern": "*", "path": "/etc"})),
            (&ListTool, json!({"path": ".."})),
        ] {
            let v = run(tool, &ctx, args);
            assert_eq!(v["ok"], false, "{} escaped", tool.name());
        }
    }
}

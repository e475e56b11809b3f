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
use super::write::PREVIEW_MAX_BYTES;
use super::write::PREVIEW_MAX_LINES;
use crate::models::JsonSchema;
use crate::models::ToolDef;

#[derive(Debug, Deserialize)]
struct EditArgs {
    path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

/// Localized string replacement with a tolerant fallback.
///
/// The exact substring match runs first; when it finds nothing, a
/// line-trimmed block match takes over (both sides split by `\n`, lines
/// compared trimmed). Either way an ambiguous match without `replace_all`
/// is an error rather than a guess.
pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &'static str {
        "edit"
    }

    fn definition(&self) -> ToolDef {
        let mut properties = BTreeMap::new();
        properties.insert("path".to_string(), JsonSchema::string("File path to edit"));
        properties.insert(
            "old_string".to_string(),
            JsonSchema::string("Exact text to replace"),
        );
        properties.insert(
            "new_string".to_string(),
            JsonSchema::string("Replacement text"),
        );
        properties.insert(
            "replace_all".to_string(),
            JsonSchema::boolean("Replace every occurrence instead of requiring uniqueness"),
        );
        ToolDef::function(
            "edit",
            "Replace a string in a file, erroring when the match is ambiguous",
            JsonSchema::object(properties, &["path", "old_string", "new_string"]),
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
        let args: EditArgs = serde_json::from_value(args)?;
        if args.old_string.is_empty() {
            return Ok(error_result("old_string must not be empty"));
        }
        if args.old_string == args.new_string {
            return Ok(error_result("old_string and new_string are identical"));
        }
        let path = match ctx.workspace.resolve(&args.path) {
            Ok(path) => path,
            Err(e) => return Ok(error_result(&e.to_string())),
        };
        let original = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return Ok(error_result(&format!("read {}: {e}", args.path))),
        };

        let outcome = match replace_exact(&original, &args.old_string, &args.new_string, args.replace_all)
        {
            ReplaceOutcome::Replaced(new_content, count) => Ok((new_content, count)),
            ReplaceOutcome::Ambiguous(count) => Err(format!(
                "old_string matches multiple ({count}) locations; pass replace_all or add context"
            )),
            ReplaceOutcome::NotFound => {
                match replace_trimmed_block(
                    &original,
                    &args.old_string,
                    &args.new_string,
                    args.replace_all,
                ) {
                    ReplaceOutcome::Replaced(new_content, count) => Ok((new_content, count)),
                    ReplaceOutcome::Ambiguous(count) => Err(format!(
                        "old_string matches multiple ({count}) locations; pass replace_all or add context"
                    )),
                    ReplaceOutcome::NotFound => {
                        Err("old_string not found in file".to_string())
                    }
                }
            }
        };

        let (new_content, replacements) = match outcome {
            Ok(pair) => pair,
            Err(message) => return Ok(error_result(&message)),
        };

        std::fs::write(&path, &new_content)?;

        let (diff, additions, deletions) = build_unified_diff(
            &ctx.workspace.relative(&path).display().to_string(),
            &original,
            &new_content,
        );

        Ok(result_json(json!({
            "ok": true,
            "path": args.path,
            "replacements": replacements,
            "additions": additions,
            "deletions": deletions,
            "diff": truncate_unified_diff(&diff, PREVIEW_MAX_LINES, PREVIEW_MAX_BYTES),
        })))
    }
}

enum ReplaceOutcome {
    Replaced(String, usize),
    Ambiguous(usize),
    NotFound,
}

fn replace_exact(
    original: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> ReplaceOutcome {
    let count = original.matches(old).count();
    match count {
        0 => ReplaceOutcome::NotFound,
        1 => ReplaceOutcome::Replaced(original.replacen(old, new, 1), 1),
        n if replace_all => ReplaceOutcome::Replaced(original.replace(old, new), n),
        n => ReplaceOutcome::Ambiguous(n),
    }
}

/// Block match with per-line trimming: finds runs of file lines whose
/// trimmed forms equal the trimmed lines of `old`, then swaps in `new`'s
/// lines verbatim.
fn replace_trimmed_block(
    original: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> ReplaceOutcome {
    let file_lines: Vec<&str> = original.split('\n').collect();
    let old_lines: Vec<&str> = old.split('\n').map(str::trim).collect();
    if old_lines.is_empty() || old_lines.len() > file_lines.len() {
        return ReplaceOutcome::NotFound;
    }

    let mut starts = Vec::new();
    for i in 0..=(file_lines.len() - old_lines.len()) {
        if old_lines
            .iter()
            .enumerate()
            .all(|(j, old_line)| file_lines[i + j].trim() == *old_line)
        {
            starts.push(i);
        }
    }

    match starts.len() {
        0 => ReplaceOutcome::NotFound,
        n if n > 1 && !replace_all => ReplaceOutcome::Ambiguous(n),
        n => {
            let new_lines: Vec<&str> = new.split('\n').collect();
            let mut lines: Vec<&str> = file_lines;
            // Bottom-up so earlier indices stay valid.
            for start in starts.iter().rev() {
                lines.splice(*start..*start + old_lines.len(), new_lines.iter().copied());
            }
            ReplaceOutcome::Replaced(lines.join("\n"), n)
        }
    }
}

fn error_result(message: &str) -> String {
    result_json(json!({"ok": false, "error": message}))
}

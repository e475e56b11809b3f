//! Static context assembly: the instruction layers prepended to every
//! provider call.
//!
//! Emits, in order: the system prompt (built-in base instructions unless
//! overridden), `[PROJECT_RULES]`-prefixed contents of the workspace
//! `AGENTS.md`, `[GLOBAL_RULES]`-prefixed contents of the global rules
//! file, and one `[INSTRUCTION:<basename>]` message per configured
//! instruction file. These messages are recomputed on every call and are
//! never stored in session history.
//!
//! When `AGENTS.md` is absent from the workspace root, parent directories
//! are searched up to the Git repository root (a `.git` file or directory),
//! never past it.

use std::path::Path;
use std::path::PathBuf;

use crate::config::Config;
use crate::models::Message;
use crate::workspace::Workspace;

const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");

pub const PROJECT_RULES_PREFIX: &str = "[PROJECT_RULES]";
pub const GLOBAL_RULES_PREFIX: &str = "[GLOBAL_RULES]";

/// Project docs larger than this are cut at read time.
const PROJECT_DOC_MAX_BYTES: usize = 32 * 1024;
/// Rune budget applied to every rules/instruction payload.
const RULES_RUNE_BUDGET: usize = 16_384;

const TRUNCATED_SUFFIX: &str = "…[truncated]";

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    workspace_root: PathBuf,
    system_prompt: Option<String>,
    global_rules_file: Option<PathBuf>,
    instruction_files: Vec<PathBuf>,
}

impl ContextAssembler {
    pub fn new(config: &Config, workspace: &Workspace) -> Self {
        Self {
            workspace_root: workspace.root().to_path_buf(),
            system_prompt: config.system_prompt.clone(),
            global_rules_file: config.global_rules_file.clone(),
            instruction_files: config.instruction_files.clone(),
        }
    }

    pub fn static_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();

        let system = self
            .system_prompt
            .clone()
            .unwrap_or_else(|| BASE_INSTRUCTIONS.to_string());
        if !system.trim().is_empty() {
            messages.push(Message::system(system));
        }

        if let Some(rules) = find_project_doc(&self.workspace_root) {
            messages.push(Message::system(format!(
                "{PROJECT_RULES_PREFIX}\n{}",
                truncate_runes(&rules, RULES_RUNE_BUDGET)
            )));
        }

        if let Some(path) = &self.global_rules_file {
            if let Some(rules) = read_doc(path, PROJECT_DOC_MAX_BYTES) {
                messages.push(Message::system(format!(
                    "{GLOBAL_RULES_PREFIX}\n{}",
                    truncate_runes(&rules, RULES_RUNE_BUDGET)
                )));
            }
        }

        for path in &self.instruction_files {
            let Some(content) = read_doc(path, PROJECT_DOC_MAX_BYTES) else {
                continue;
            };
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            messages.push(Message::system(format!(
                "[INSTRUCTION:{basename}]\n{}",
                truncate_runes(&content, RULES_RUNE_BUDGET)
            )));
        }

        messages
    }

    /// One-shot user message describing the runtime situation, sent on the
    /// first provider call of a session.
    pub fn environment_context(&self, mode: &str, permission_preset: &str) -> Message {
        Message::user(format!(
            "<environment_context>\n\nWorking directory: {}\nMode: {mode}\nPermission preset: {permission_preset}\n\n</environment_context>",
            self.workspace_root.display()
        ))
    }
}

/// `AGENTS.md` in `root`, else in ancestors up to (and including) the Git
/// repository root.
fn find_project_doc(root: &Path) -> Option<String> {
    if let Some(doc) = read_doc(&root.join("AGENTS.md"), PROJECT_DOC_MAX_BYTES) {
        return Some(doc);
    }
    let mut dir = root.to_path_buf();
    while let Some(parent) = dir.parent() {
        if dir.join(".git").exists() {
            // Repo root; one final attempt, then stop. Never walk past it.
            return if dir == root {
                None
            } else {
                read_doc(&dir.join("AGENTS.md"), PROJECT_DOC_MAX_BYTES)
            };
        }
        dir = parent.to_path_buf();
        if let Some(doc) = read_doc(&dir.join("AGENTS.md"), PROJECT_DOC_MAX_BYTES) {
            return Some(doc);
        }
    }
    None
}

/// Read up to `max_bytes` of a UTF-8 file; empty or unreadable files count
/// as absent.
fn read_doc(path: &Path, max_bytes: usize) -> Option<String> {
    let data = std::fs::read(path).ok()?;
    if data.len() > max_bytes {
        tracing::warn!(
            "instruction file {} exceeds {max_bytes} bytes, truncating",
            path.display()
        );
    }
    let cut = &data[..data.len().min(max_bytes)];
    let content = String::from_utf8_lossy(cut).to_string();
    if content.trim().is_empty() {
        None
    } else {
        Some(content)
    }
}

fn truncate_runes(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let mut out: String = text.chars().take(budget).collect();
    out.push_str(TRUNCATED_SUFFIX);
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::ConfigOverrides;

    fn assembler_for(dir: &Path) -> ContextAssembler {
        let config = Config::load(dir, ConfigOverrides::default()).unwrap();
        let workspace = Workspace::new(dir).unwrap();
        ContextAssembler::new(&config, &workspace)
    }

    #[test]
    fn base_instructions_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let messages = assembler_for(dir.path()).static_messages();
        assert!(!messages.is_empty());
        assert!(messages[0].content.contains("coder"));
    }

    #[test]
    fn project_rules_are_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "always run the linter").unwrap();
        let messages = assembler_for(dir.path()).static_messages();
        let rules = messages
            .iter()
            .find(|m| m.content.starts_with(PROJECT_RULES_PREFIX))
            .unwrap();
        assert!(rules.content.contains("always run the linter"));
    }

    #[test]
    fn project_doc_found_at_git_root() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir(repo.path().join(".git")).unwrap();
        std::fs::write(repo.path().join("AGENTS.md"), "root level rules").unwrap();
        let nested = repo.path().join("crates/app");
        std::fs::create_dir_all(&nested).unwrap();
        let doc = find_project_doc(&nested.canonicalize().unwrap()).unwrap();
        assert_eq!(doc, "root level rules");
    }

    #[test]
    fn search_stops_at_git_root() {
        let outer = tempfile::tempdir().unwrap();
        // AGENTS.md above the repo root must not be picked up.
        std::fs::write(outer.path().join("AGENTS.md"), "outside rules").unwrap();
        let repo = outer.path().join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        let nested = repo.join("src");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(find_project_doc(&nested.canonicalize().unwrap()).is_none());
    }

    #[test]
    fn instruction_files_use_basename_tags() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("style.md");
        std::fs::write(&extra, "tabs, not spaces").unwrap();
        let workspace = Workspace::new(dir.path()).unwrap();
        let mut config = Config::load(dir.path(), ConfigOverrides::default()).unwrap();
        config.instruction_files = vec![extra];
        let messages = ContextAssembler::new(&config, &workspace).static_messages();
        assert!(
            messages
                .iter()
                .any(|m| m.content.starts_with("[INSTRUCTION:style.md]"))
        );
    }

    #[test]
    fn oversized_rules_are_rune_truncated() {
        let long = "x".repeat(RULES_RUNE_BUDGET + 100);
        let out = truncate_runes(&long, RULES_RUNE_BUDGET);
        assert!(out.ends_with(TRUNCATED_SUFFIX));
        assert!(out.chars().count() < long.chars().count());
    }

    #[test]
    fn empty_docs_count_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "   \n").unwrap();
        assert!(find_project_doc(dir.path()).is_none());
    }
}

//! Unified-diff engine: parsing, hunk application, and diff building.
//!
//! The crate is content-level only — callers own path resolution and
//! filesystem writes. [`parse_unified_diff`] turns patch text into
//! [`FilePatch`] values, [`apply_file_patch`] applies one file section to
//! the file's current content, and [`build_unified_diff`] /
//! [`truncate_unified_diff`] produce the compact previews embedded in tool
//! results.

mod builder;
mod parser;

use std::path::PathBuf;

pub use builder::TRUNCATION_MARKER;
pub use builder::build_unified_diff;
pub use builder::truncate_unified_diff;
pub use parser::FilePatch;
pub use parser::Hunk;
pub use parser::HunkLine;
pub use parser::LineKind;
pub use parser::ParseError;
pub use parser::parse_unified_diff;
use similar::TextDiff;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A context or remove line disagreed with the file. Cites both sides so
    /// the model (or a human) can see exactly where the patch went stale.
    #[error("patch mismatch in {path} at line {line}: expected {expected:?}, found {found:?}")]
    Mismatch {
        path: PathBuf,
        /// 1-based line in the file being patched.
        line: usize,
        expected: String,
        found: String,
    },

    #[error("hunks out of order in {path}: hunk starting at line {line} overlaps earlier hunk")]
    HunkOverlap { path: PathBuf, line: usize },

    #[error("cannot {operation} {path}: {reason}")]
    BadOperation {
        operation: &'static str,
        path: PathBuf,
        reason: String,
    },
}

/// What applying a [`FilePatch`] does to its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Created,
    Updated,
    Deleted,
}

impl FileOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Created => "created",
            FileOperation::Updated => "updated",
            FileOperation::Deleted => "deleted",
        }
    }
}

/// Outcome of applying one file section: the new content (absent for
/// deletions), line counts, and a short unified-diff preview.
#[derive(Debug)]
pub struct AppliedFile {
    /// Patch-relative target path (new path for updates/creates, old path
    /// for deletions).
    pub path: PathBuf,
    pub operation: FileOperation,
    pub new_content: Option<String>,
    pub additions: usize,
    pub deletions: usize,
    pub preview: String,
}

/// Apply a single parsed file section to `original` (the current file
/// content, `None` when the file does not exist). Pure function — the
/// caller performs the actual filesystem write/delete.
pub fn apply_file_patch(
    file_patch: &FilePatch,
    original: Option<&str>,
    preview_context: usize,
) -> Result<AppliedFile, DiffError> {
    let path = file_patch
        .target_path()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("/dev/null"));

    if file_patch.is_create() {
        if original.is_some() {
            return Err(DiffError::BadOperation {
                operation: "create",
                path,
                reason: "file already exists".to_string(),
            });
        }
        let content = creation_content(&file_patch.hunks);
        let additions = content.lines().count();
        let preview = preview_diff("", &content, preview_context);
        return Ok(AppliedFile {
            path,
            operation: FileOperation::Created,
            new_content: Some(content),
            additions,
            deletions: 0,
            preview,
        });
    }

    let Some(original) = original else {
        return Err(DiffError::BadOperation {
            operation: if file_patch.is_delete() { "delete" } else { "update" },
            path,
            reason: "file does not exist".to_string(),
        });
    };

    if file_patch.is_delete() {
        let deletions = original.lines().count();
        let preview = preview_diff(original, "", preview_context);
        return Ok(AppliedFile {
            path,
            operation: FileOperation::Deleted,
            new_content: None,
            additions: 0,
            deletions,
            preview,
        });
    }

    let new_content = apply_hunks_to_content(&path, original, &file_patch.hunks)?;
    let (additions, deletions) = count_changes(&file_patch.hunks);
    let preview = preview_diff(original, &new_content, preview_context);
    Ok(AppliedFile {
        path,
        operation: FileOperation::Updated,
        new_content: Some(new_content),
        additions,
        deletions,
        preview,
    })
}

/// Apply `hunks` to `original`, enforcing that context and remove lines
/// match the file.
///
/// Tolerance: one standalone blank-only context line that does not match is
/// skipped without advancing the file cursor; a second consecutive
/// blank-only mismatch in the same hunk is fatal, since a run of skipped
/// blanks would silently walk the rest of the hunk against the wrong lines.
pub fn apply_hunks_to_content(
    path: &std::path::Path,
    original: &str,
    hunks: &[Hunk],
) -> Result<String, DiffError> {
    let original = original.replace("\r\n", "\n");
    let lines = split_lines(&original);

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut idx = 0usize;

    for hunk in hunks {
        let target = hunk.old_start.saturating_sub(1);
        if target > lines.len() {
            return Err(DiffError::Mismatch {
                path: path.to_path_buf(),
                line: hunk.old_start,
                expected: format!("hunk starting at line {}", hunk.old_start),
                found: "end of file".to_string(),
            });
        }
        if target < idx {
            return Err(DiffError::HunkOverlap {
                path: path.to_path_buf(),
                line: hunk.old_start,
            });
        }
        out.extend_from_slice(&lines[idx..target]);
        idx = target;

        let mut blank_skips = 0u32;
        for hunk_line in &hunk.lines {
            match hunk_line.kind {
                LineKind::Context => {
                    if lines.get(idx).map(String::as_str) == Some(hunk_line.content.as_str()) {
                        out.push(hunk_line.content.clone());
                        idx += 1;
                        blank_skips = 0;
                    } else if hunk_line.content.trim().is_empty() {
                        // Stray blank context (often an artifact of the model
                        // re-wrapping the patch): skip it without consuming a
                        // file line.
                        blank_skips += 1;
                        if blank_skips > 1 {
                            return Err(mismatch(path, &lines, idx, &hunk_line.content));
                        }
                    } else {
                        return Err(mismatch(path, &lines, idx, &hunk_line.content));
                    }
                }
                LineKind::Remove => {
                    if lines.get(idx).map(String::as_str) == Some(hunk_line.content.as_str()) {
                        idx += 1;
                        blank_skips = 0;
                    } else {
                        return Err(mismatch(path, &lines, idx, &hunk_line.content));
                    }
                }
                LineKind::Add => {
                    out.push(hunk_line.content.clone());
                }
            }
        }
    }

    out.extend_from_slice(&lines[idx..]);

    let mut result = out.join("\n");
    if (original.ends_with('\n') || original.is_empty()) && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn mismatch(
    path: &std::path::Path,
    lines: &[String],
    idx: usize,
    expected: &str,
) -> DiffError {
    DiffError::Mismatch {
        path: path.to_path_buf(),
        line: idx + 1,
        expected: expected.to_string(),
        found: lines
            .get(idx)
            .cloned()
            .unwrap_or_else(|| "end of file".to_string()),
    }
}

/// Content of a created file: the add lines of every hunk, newline-joined.
fn creation_content(hunks: &[Hunk]) -> String {
    let mut content = String::new();
    for hunk in hunks {
        for line in &hunk.lines {
            if line.kind == LineKind::Add {
                content.push_str(&line.content);
                content.push('\n');
            }
        }
    }
    content
}

fn count_changes(hunks: &[Hunk]) -> (usize, usize) {
    let mut additions = 0;
    let mut deletions = 0;
    for hunk in hunks {
        for line in &hunk.lines {
            match line.kind {
                LineKind::Add => additions += 1,
                LineKind::Remove => deletions += 1,
                LineKind::Context => {}
            }
        }
    }
    (additions, deletions)
}

/// Hunk-only unified diff between two texts (no `---`/`+++` header), used
/// for dry-run previews.
pub fn preview_diff(old: &str, new: &str, context: usize) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(context)
        .to_string()
}

fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = text.split('\n').map(|s| s.to_string()).collect();
    if lines.last().is_some_and(|s| s.is_empty()) {
        lines.pop();
    }
    lines
}

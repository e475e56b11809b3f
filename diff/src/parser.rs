//! Parses a unified diff into per-file patches.
//!
//! The accepted grammar is the classic `diff -u` output:
//!
//! ```text
//! --- a/OLD_PATH
//! +++ b/NEW_PATH
//! @@ -oStart,oCount +nStart,nCount @@
//!  context line
//! -removed line
//! +added line
//! ```
//!
//! Either side of a file section may be `/dev/null`, which marks a file
//! creation (`--- /dev/null`) or deletion (`+++ /dev/null`). The parser is
//! more lenient than the strict format: `\ No newline at end of file`
//! markers are skipped, blank lines inside a hunk are recovered as empty
//! context, and a context line that lost its leading space is recovered as
//! context (logged, since it may hide a malformed patch). Any `@@` or
//! `--- ` line inside a hunk terminates it.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
    #[error("invalid hunk at line {line_number}: {message}")]
    InvalidHunk { message: String, line_number: usize },
}

/// Kind byte of a single hunk line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HunkLine {
    pub kind: LineKind,
    pub content: String,
}

impl HunkLine {
    fn context(content: impl Into<String>) -> Self {
        Self {
            kind: LineKind::Context,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    /// 1-based first line of the hunk in the original file (0 for creations).
    pub old_start: usize,
    pub old_count: usize,
    /// 1-based first line of the hunk in the new file.
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

/// All hunks for a single file section of the patch.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePatch {
    /// `None` when the old side is `/dev/null` (file creation).
    pub old_path: Option<PathBuf>,
    /// `None` when the new side is `/dev/null` (file deletion).
    pub new_path: Option<PathBuf>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn is_create(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_delete(&self) -> bool {
        self.new_path.is_none()
    }

    /// The path the change applies to: the new path when present, else the
    /// old path. At least one side is always set.
    pub fn target_path(&self) -> Option<&PathBuf> {
        self.new_path.as_ref().or(self.old_path.as_ref())
    }
}

const OLD_FILE_MARKER: &str = "--- ";
const NEW_FILE_MARKER: &str = "+++ ";
const HUNK_MARKER: &str = "@@ ";
const NO_NEWLINE_MARKER: &str = "\\ No newline";
const DEV_NULL: &str = "/dev/null";

pub fn parse_unified_diff(patch: &str) -> Result<Vec<FilePatch>, ParseError> {
    let lines: Vec<&str> = patch.lines().collect();
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if let Some(old) = line.strip_prefix(OLD_FILE_MARKER) {
            let (file_patch, consumed) = parse_file_section(&lines[i..], i + 1, old)?;
            patches.push(file_patch);
            i += consumed;
        } else if line.trim().is_empty() || is_preamble_line(line) {
            // `diff --git` headers, `index` lines, and surrounding prose are
            // skipped until the next `--- ` marker.
            i += 1;
        } else {
            return Err(ParseError::InvalidPatch(format!(
                "unexpected line {} outside of a file section: '{line}'",
                i + 1
            )));
        }
    }

    if patches.is_empty() {
        return Err(ParseError::InvalidPatch(
            "patch contains no file sections (expected '--- a/PATH')".to_string(),
        ));
    }
    Ok(patches)
}

fn is_preamble_line(line: &str) -> bool {
    line.starts_with("diff ")
        || line.starts_with("index ")
        || line.starts_with("new file mode")
        || line.starts_with("deleted file mode")
        || line.starts_with("old mode")
        || line.starts_with("new mode")
}

/// Parse one `--- / +++ / @@ ...` section. `lines[0]` is the `--- ` line and
/// `old` is its remainder. Returns the patch and how many lines it consumed.
fn parse_file_section(
    lines: &[&str],
    line_number: usize,
    old: &str,
) -> Result<(FilePatch, usize), ParseError> {
    let old_path = parse_diff_path(old);

    let Some(new_line) = lines.get(1) else {
        return Err(ParseError::InvalidHunk {
            message: "file section ends before '+++' line".to_string(),
            line_number,
        });
    };
    let Some(new) = new_line.strip_prefix(NEW_FILE_MARKER) else {
        return Err(ParseError::InvalidHunk {
            message: format!("expected '+++ NEW_PATH' after '--- ', got: '{new_line}'"),
            line_number: line_number + 1,
        });
    };
    let new_path = parse_diff_path(new);

    if old_path.is_none() && new_path.is_none() {
        return Err(ParseError::InvalidHunk {
            message: "both sides of a file section are /dev/null".to_string(),
            line_number,
        });
    }

    let mut hunks = Vec::new();
    let mut i = 2;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with(HUNK_MARKER) || line == "@@" || line.starts_with("@@-") {
            let (hunk, consumed) = parse_hunk(&lines[i..], line_number + i)?;
            hunks.push(hunk);
            i += consumed;
        } else if line.trim().is_empty() {
            i += 1;
        } else {
            // Next file section or trailing prose.
            break;
        }
    }

    if hunks.is_empty() {
        return Err(ParseError::InvalidHunk {
            message: "file section contains no hunks".to_string(),
            line_number,
        });
    }

    Ok((
        FilePatch {
            old_path,
            new_path,
            hunks,
        },
        i,
    ))
}

/// `a/foo.rs` → `foo.rs`; `/dev/null` → `None`. Trailing metadata after a
/// tab (git emits timestamps there) is stripped.
fn parse_diff_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == DEV_NULL {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(PathBuf::from(stripped))
}

fn parse_hunk(lines: &[&str], line_number: usize) -> Result<(Hunk, usize), ParseError> {
    let header = lines[0];
    let (old_start, old_count, new_start, new_count) =
        parse_hunk_header(header).ok_or_else(|| ParseError::InvalidHunk {
            message: format!("malformed hunk header: '{header}'"),
            line_number,
        })?;

    let mut hunk = Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
    };

    let mut i = 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with(HUNK_MARKER)
            || line == "@@"
            || line.starts_with("@@-")
            || line.starts_with(OLD_FILE_MARKER)
        {
            // Start of the next hunk or file section.
            break;
        }
        if line.starts_with(NO_NEWLINE_MARKER) {
            i += 1;
            continue;
        }
        match line.chars().next() {
            None => {
                // Blank line inside a hunk: recovered as empty context.
                hunk.lines.push(HunkLine::context(""));
            }
            Some(' ') => hunk.lines.push(HunkLine::context(&line[1..])),
            Some('+') => hunk.lines.push(HunkLine {
                kind: LineKind::Add,
                content: line[1..].to_string(),
            }),
            Some('-') => hunk.lines.push(HunkLine {
                kind: LineKind::Remove,
                content: line[1..].to_string(),
            }),
            Some(_) => {
                if hunk.lines.is_empty() {
                    return Err(ParseError::InvalidHunk {
                        message: format!(
                            "unexpected line in hunk: '{line}'. Every line should start with \
                             ' ' (context), '+' (added), or '-' (removed)"
                        ),
                        line_number: line_number + i,
                    });
                }
                // A context line that lost its leading space. Recover it, but
                // leave a trace since it may hide a malformed patch.
                tracing::debug!(
                    "recovering hunk line without kind byte as context: '{line}'"
                );
                hunk.lines.push(HunkLine::context(line));
            }
        }
        i += 1;
    }

    if hunk.lines.is_empty() {
        return Err(ParseError::InvalidHunk {
            message: "hunk contains no lines".to_string(),
            line_number,
        });
    }

    Ok((hunk, i))
}

/// Parse `@@ -oStart[,oCount] +nStart[,nCount] @@[ trailing]`. A missing
/// count defaults to 1, per the unified format.
fn parse_hunk_header(header: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = header.strip_prefix("@@")?.trim_start();
    let rest = rest.strip_prefix('-')?;
    let (old_part, rest) = rest.split_once(' ')?;
    let rest = rest.trim_start().strip_prefix('+')?;
    let new_part = rest.split(' ').next()?.trim_end_matches('@').trim();

    let (old_start, old_count) = parse_range(old_part)?;
    let (new_start, new_count) = parse_range(new_part)?;
    Some((old_start, old_count, new_start, new_count))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_single_file_update() {
        let patch = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        let patches = parse_unified_diff(patch).unwrap();
        assert_eq!(patches.len(), 1);
        let fp = &patches[0];
        assert_eq!(fp.old_path, Some(PathBuf::from("f")));
        assert_eq!(fp.new_path, Some(PathBuf::from("f")));
        assert_eq!(fp.hunks.len(), 1);
        let hunk = &fp.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (1, 3));
        assert_eq!(
            hunk.lines,
            vec![
                HunkLine::context("a"),
                HunkLine {
                    kind: LineKind::Remove,
                    content: "b".to_string()
                },
                HunkLine {
                    kind: LineKind::Add,
                    content: "B".to_string()
                },
                HunkLine::context("c"),
            ]
        );
    }

    #[test]
    fn parses_create_and_delete_sections() {
        let patch = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+one\n+two\n\
                     --- a/gone.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-bye\n";
        let patches = parse_unified_diff(patch).unwrap();
        assert_eq!(patches.len(), 2);
        assert!(patches[0].is_create());
        assert_eq!(patches[0].new_path, Some(PathBuf::from("new.txt")));
        assert!(patches[1].is_delete());
        assert_eq!(patches[1].old_path, Some(PathBuf::from("gone.txt")));
    }

    #[test]
    fn missing_count_defaults_to_one() {
        let patch = "--- a/f\n+++ b/f\n@@ -3 +3,2 @@\n baz\n+quux\n";
        let patches = parse_unified_diff(patch).unwrap();
        let hunk = &patches[0].hunks[0];
        assert_eq!((hunk.old_start, hunk.old_count), (3, 1));
        assert_eq!((hunk.new_start, hunk.new_count), (3, 2));
    }

    #[test]
    fn skips_no_newline_marker_and_git_preamble() {
        let patch = "diff --git a/f b/f\nindex 000..111 100644\n\
                     --- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-x\n+y\n\\ No newline at end of file\n";
        let patches = parse_unified_diff(patch).unwrap();
        assert_eq!(patches[0].hunks[0].lines.len(), 2);
    }

    #[test]
    fn blank_line_inside_hunk_becomes_empty_context() {
        let patch = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n\n-b\n+B\n";
        let patches = parse_unified_diff(patch).unwrap();
        let lines = &patches[0].hunks[0].lines;
        assert_eq!(lines[1], HunkLine::context(""));
    }

    #[test]
    fn kindless_context_line_is_recovered() {
        let patch = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\nb_no_space\n";
        let patches = parse_unified_diff(patch).unwrap();
        let lines = &patches[0].hunks[0].lines;
        assert_eq!(lines[1], HunkLine::context("b_no_space"));
    }

    #[test]
    fn rejects_garbage_and_empty_patches() {
        assert!(matches!(
            parse_unified_diff("hello world\n"),
            Err(ParseError::InvalidPatch(_))
        ));
        assert!(matches!(
            parse_unified_diff(""),
            Err(ParseError::InvalidPatch(_))
        ));
        assert!(matches!(
            parse_unified_diff("--- a/f\n+++ b/f\n"),
            Err(ParseError::InvalidHunk { .. })
        ));
    }

    #[test]
    fn second_hunk_header_terminates_first() {
        let patch = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-b\n+B\n@@ -9,2 +9,2 @@\n y\n-z\n+Z\n";
        let patches = parse_unified_diff(patch).unwrap();
        assert_eq!(patches[0].hunks.len(), 2);
        assert_eq!(patches[0].hunks[1].old_start, 9);
    }
}

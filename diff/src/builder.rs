//! Builds compact unified diffs for tool-result previews.

/// Marker appended when [`truncate_unified_diff`] cuts a diff short.
pub const TRUNCATION_MARKER: &str = "… (diff truncated)";

/// Build a unified diff between `old` and `new` as a single compact hunk
/// with at most one line of context on each side.
///
/// Both inputs are normalized CRLF→LF before comparison. Returns the diff
/// text together with the number of added and removed lines. Equal inputs
/// produce an empty diff.
pub fn build_unified_diff(path: &str, old: &str, new: &str) -> (String, usize, usize) {
    let old = old.replace("\r\n", "\n");
    let new = new.replace("\r\n", "\n");
    if old == new {
        return (String::new(), 0, 0);
    }

    let old_lines = split_lines(&old);
    let new_lines = split_lines(&new);

    let prefix = common_prefix_len(&old_lines, &new_lines);
    let max_suffix = old_lines.len().min(new_lines.len()) - prefix;
    let suffix = common_suffix_len(&old_lines, &new_lines, max_suffix);

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];
    let deletions = old_mid.len();
    let additions = new_mid.len();

    let ctx_before = usize::from(prefix > 0);
    let ctx_after = usize::from(suffix > 0);

    let old_count = deletions + ctx_before + ctx_after;
    let new_count = additions + ctx_before + ctx_after;
    // The unified format uses the line *before* the hunk as the start when
    // the hunk is empty on that side, hence the `max(...)` dance: a pure
    // creation yields `@@ -0,0 +1,N @@`.
    let old_start = if old_count == 0 { prefix } else { prefix + 1 - ctx_before };
    let new_start = if new_count == 0 { prefix } else { prefix + 1 - ctx_before };

    let mut out = String::new();
    out.push_str(&format!("--- a/{path}\n"));
    out.push_str(&format!("+++ b/{path}\n"));
    out.push_str(&format!(
        "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
    ));
    if ctx_before == 1 {
        out.push(' ');
        out.push_str(&old_lines[prefix - 1]);
        out.push('\n');
    }
    for line in old_mid {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in new_mid {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    if ctx_after == 1 {
        out.push(' ');
        out.push_str(&old_lines[old_lines.len() - suffix]);
        out.push('\n');
    }

    (out, additions, deletions)
}

/// Trim `diff` to at most `max_lines` lines and `max_bytes` bytes,
/// appending a truncation marker when anything was cut. Deterministic:
/// lines are dropped from the end only.
pub fn truncate_unified_diff(diff: &str, max_lines: usize, max_bytes: usize) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut bytes = 0usize;
    let mut truncated = false;

    for line in diff.lines() {
        if kept.len() >= max_lines || bytes + line.len() + 1 > max_bytes {
            truncated = true;
            break;
        }
        bytes += line.len() + 1;
        kept.push(line);
    }

    if !truncated {
        return diff.to_string();
    }
    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(TRUNCATION_MARKER);
    out.push('\n');
    out
}

/// Split into lines, dropping the trailing empty element produced by a
/// final newline so line counts match `diff` conventions.
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

fn common_prefix_len(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn common_suffix_len(a: &[String], b: &[String], max: usize) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take(max)
        .take_while(|(x, y)| x == y)
        .count()
}

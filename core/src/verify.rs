//! Auto-verification support: which command proves the turn's edits, and
//! whether a failure is worth retrying.

use std::path::Path;
use std::path::PathBuf;

use crate::config::CONFIG_DIR;
use crate::config::WorkflowConfig;

/// File extensions that never need a verification run.
const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "txt", "rst", "adoc"];

/// Markers of a broken environment rather than a broken change. A failing
/// verify whose output contains one of these is not retried — re-running the
/// model will not fix a missing toolchain.
const ENVIRONMENT_FAILURE_MARKERS: &[&str] = &["command not found", "missing lc_uuid", "dyld"];

const STARTUP_FILES: &[&str] = &[
    ".profile",
    ".zprofile",
    ".zshrc",
    ".bash_profile",
    ".bashrc",
];

/// The verify command for this workspace: the first non-blank configured
/// entry, else auto-detected from files at the workspace root.
pub fn select_verify_command(workflow: &WorkflowConfig, root: &Path) -> Option<String> {
    if let Some(command) = workflow
        .verify_commands
        .iter()
        .find(|c| !c.trim().is_empty())
    {
        return Some(command.clone());
    }
    if root.join("go.mod").is_file() {
        return Some("go test ./...".to_string());
    }
    if root.join("pyproject.toml").is_file()
        || root.join("pytest.ini").is_file()
        || root.join("requirements.txt").is_file()
    {
        return Some("pytest".to_string());
    }
    if root.join("package.json").is_file() {
        return Some("npm test -- --watch=false".to_string());
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditClass {
    Config,
    Docs,
    Code,
}

fn classify(path: &Path, root: &Path) -> EditClass {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut components = rel.components().filter_map(|c| c.as_os_str().to_str());
    match components.next() {
        Some(first) if first == CONFIG_DIR => return EditClass::Config,
        Some(first) if first == "docs" => return EditClass::Docs,
        _ => {}
    }
    let ext = rel
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if DOC_EXTENSIONS.contains(&ext.as_str()) {
        EditClass::Docs
    } else {
        EditClass::Code
    }
}

/// True when at least one edited path is real code. Paths under `.coder/`
/// are configuration and never trigger verification; doc-only edits skip it
/// too.
pub fn needs_verification(edited: &[PathBuf], root: &Path) -> bool {
    edited
        .iter()
        .any(|p| classify(p, root) == EditClass::Code)
}

/// Classify a failed verify run: environment breakage is not retryable.
pub fn is_environment_failure(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    if ENVIRONMENT_FAILURE_MARKERS
        .iter()
        .any(|m| combined.contains(m))
    {
        return true;
    }
    // Shell startup files failing to load point at the user's environment,
    // not the change under test.
    combined.contains("no such file or directory")
        && STARTUP_FILES.iter().any(|f| combined.contains(f))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn explicit_command_wins_over_detection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        let workflow = WorkflowConfig {
            verify_commands: vec!["".to_string(), "make check".to_string()],
            ..Default::default()
        };
        assert_eq!(
            select_verify_command(&workflow, dir.path()).unwrap(),
            "make check"
        );
    }

    #[test]
    fn detection_by_root_files() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowConfig::default();
        assert!(select_verify_command(&workflow, dir.path()).is_none());

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(
            select_verify_command(&workflow, dir.path()).unwrap(),
            "npm test -- --watch=false"
        );

        std::fs::write(dir.path().join("pyproject.toml"), "").unwrap();
        assert_eq!(
            select_verify_command(&workflow, dir.path()).unwrap(),
            "pytest"
        );

        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert_eq!(
            select_verify_command(&workflow, dir.path()).unwrap(),
            "go test ./..."
        );
    }

    #[test]
    fn docs_and_config_edits_skip_verification() {
        let root = Path::new("/ws");
        let docs_only = vec![
            PathBuf::from("/ws/README.md"),
            PathBuf::from("/ws/docs/guide.html"),
            PathBuf::from("/ws/.coder/config.json"),
        ];
        assert!(!needs_verification(&docs_only, root));

        let with_code = vec![
            PathBuf::from("/ws/README.md"),
            PathBuf::from("/ws/src/main.go"),
        ];
        assert!(needs_verification(&with_code, root));
        assert!(!needs_verification(&[], root));
    }

    #[test]
    fn environment_failures_are_not_retryable() {
        assert!(is_environment_failure("", "sh: go: command not found"));
        assert!(is_environment_failure("", "dyld: library not loaded"));
        assert!(is_environment_failure(
            "",
            "/bin/sh: /root/.bashrc: No such file or directory"
        ));
        assert!(!is_environment_failure(
            "",
            "--- FAIL: TestThing (0.01s)\nexpected 2 got 3"
        ));
        assert!(!is_environment_failure(
            "",
            "open data.txt: No such file or directory"
        ));
    }
}

//! Configuration loading and the merged runtime [`Config`].
//!
//! Local configuration lives at `<workspace>/.coder/config.json` (or
//! `config.jsonc`, which is the same thing with comments allowed). Values
//! from the file are merged with programmatic [`ConfigOverrides`]; overrides
//! win. Mutations to the config file never trigger auto-verify — paths under
//! `.coder/` are treated as configuration, not code.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::compact::CompactionConfig;
use crate::error::Result;

pub const CONFIG_DIR: &str = ".coder";
pub const SESSIONS_SUBDIR: &str = "sessions";

/// Auto-verification and todo-bootstrap knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Upper bound on verify attempts per turn.
    pub max_verify_attempts: usize,
    /// Explicit verify commands; the first non-blank entry wins. Empty means
    /// auto-detect from files at the workspace root.
    pub verify_commands: Vec<String>,
    /// Synthesize a starter todo list for complex inputs.
    pub require_todo_for_complex: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_verify_attempts: 2,
            verify_commands: Vec::new(),
            require_todo_for_complex: true,
        }
    }
}

/// Fully merged runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    pub cwd: PathBuf,
    /// Overrides the built-in base instructions when set.
    pub system_prompt: Option<String>,
    pub global_rules_file: Option<PathBuf>,
    pub instruction_files: Vec<PathBuf>,
    pub context_token_limit: usize,
    pub compaction: CompactionConfig,
    pub workflow: WorkflowConfig,
    /// Initial mode; selects both the agent profile and permission preset.
    pub mode: String,
}

impl Config {
    pub fn load(cwd: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file = ConfigFile::load_from(&cwd.join(CONFIG_DIR))?;
        Ok(Self::merge(cwd, file, overrides))
    }

    fn merge(cwd: &Path, file: ConfigFile, overrides: ConfigOverrides) -> Self {
        Self {
            model: overrides
                .model
                .or(file.model)
                .unwrap_or_else(|| "gpt-4.1".to_string()),
            base_url: overrides
                .base_url
                .or(file.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key_env: file
                .api_key_env
                .unwrap_or_else(|| "OPENAI_API_KEY".to_string()),
            cwd: overrides.cwd.unwrap_or_else(|| cwd.to_path_buf()),
            system_prompt: overrides.system_prompt.or(file.system_prompt),
            global_rules_file: file.global_rules_file,
            instruction_files: file.instruction_files.unwrap_or_default(),
            context_token_limit: overrides
                .context_token_limit
                .or(file.context_token_limit)
                .unwrap_or(128_000),
            compaction: file.compaction.unwrap_or_default(),
            workflow: file.workflow.unwrap_or_default(),
            mode: overrides
                .mode
                .or(file.mode)
                .unwrap_or_else(|| "build".to_string()),
        }
    }
}

/// Programmatic overrides; every field beats the config file when set.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub cwd: Option<PathBuf>,
    pub system_prompt: Option<String>,
    pub context_token_limit: Option<usize>,
    pub mode: Option<String>,
}

/// On-disk shape; everything optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    model: Option<String>,
    base_url: Option<String>,
    api_key_env: Option<String>,
    system_prompt: Option<String>,
    global_rules_file: Option<PathBuf>,
    instruction_files: Option<Vec<PathBuf>>,
    context_token_limit: Option<usize>,
    compaction: Option<CompactionConfig>,
    workflow: Option<WorkflowConfig>,
    mode: Option<String>,
}

impl ConfigFile {
    fn load_from(config_dir: &Path) -> Result<Self> {
        let json_path = config_dir.join("config.json");
        let jsonc_path = config_dir.join("config.jsonc");

        let text = if json_path.is_file() {
            std::fs::read_to_string(&json_path)?
        } else if jsonc_path.is_file() {
            strip_jsonc_comments(&std::fs::read_to_string(&jsonc_path)?)
        } else {
            return Ok(Self::default());
        };
        Ok(serde_json::from_str(&text)?)
    }
}

/// Remove `//` and `/* */` comments, leaving string literals intact.
fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// `$CODER_HOME` or `~/.coder`, created on first use. Holds the structured
/// store; per-workspace transcripts live under `<workspace>/.coder`.
pub fn coder_home() -> io::Result<PathBuf> {
    let home = match std::env::var("CODER_HOME") {
        Ok(value) if !value.is_empty() => PathBuf::from(value),
        _ => dirs::home_dir()
            .ok_or_else(|| io::Error::other("could not resolve home directory"))?
            .join(CONFIG_DIR),
    };
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

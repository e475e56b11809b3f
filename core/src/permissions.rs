//! Three-valued permission policy over tools and bash command patterns.
//!
//! Tool decisions come from a per-tool rule map with a default. Bash is
//! special-cased: a glob `pattern → rule` map (with `"*"` as the fallback
//! entry) is consulted longest-pattern-first, and a name allowlist can
//! short-circuit straight to `allow` for harmless read-only commands.
//!
//! The policy is read-only during a turn; presets may only be swapped
//! between turns.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use wildmatch::WildMatch;

use crate::command_safety::first_command_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionRule {
    Allow,
    Ask,
    Deny,
}

impl Default for PermissionRule {
    fn default() -> Self {
        PermissionRule::Ask
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDecision {
    pub rule: PermissionRule,
    pub reason: Option<String>,
}

impl PermissionDecision {
    fn new(rule: PermissionRule, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: Some(reason.into()),
        }
    }
}

/// Serializable rule set. The `build`/`plan` presets materialize one of
/// these; a config file may override individual entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub rules: HashMap<String, PermissionRule>,
    #[serde(default)]
    pub default: PermissionRule,
    /// Glob pattern → rule for bash commands; `"*"` is the default entry.
    #[serde(default)]
    pub bash_patterns: HashMap<String, PermissionRule>,
    /// Command names that short-circuit bash decisions to `allow`.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        build_preset()
    }
}

const READONLY_ALLOWLIST: &[&str] = &[
    "ls", "cat", "echo", "pwd", "head", "tail", "wc", "which", "grep", "rg", "find",
];

fn build_preset() -> PermissionConfig {
    let mut rules = HashMap::new();
    for tool in ["read", "list", "glob", "grep", "todoread", "todowrite", "skill"] {
        rules.insert(tool.to_string(), PermissionRule::Allow);
    }
    for tool in ["write", "edit", "patch", "task"] {
        rules.insert(tool.to_string(), PermissionRule::Ask);
    }
    let mut bash_patterns = HashMap::new();
    bash_patterns.insert("*".to_string(), PermissionRule::Ask);
    bash_patterns.insert("git *".to_string(), PermissionRule::Allow);
    bash_patterns.insert("git push *".to_string(), PermissionRule::Ask);
    PermissionConfig {
        rules,
        default: PermissionRule::Ask,
        bash_patterns,
        allowlist: READONLY_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
    }
}

fn plan_preset() -> PermissionConfig {
    let mut rules = HashMap::new();
    for tool in ["read", "list", "glob", "grep", "todoread", "todowrite"] {
        rules.insert(tool.to_string(), PermissionRule::Allow);
    }
    for tool in ["write", "edit", "patch", "task", "skill"] {
        rules.insert(tool.to_string(), PermissionRule::Deny);
    }
    let mut bash_patterns = HashMap::new();
    bash_patterns.insert("*".to_string(), PermissionRule::Deny);
    PermissionConfig {
        rules,
        default: PermissionRule::Deny,
        bash_patterns,
        allowlist: READONLY_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn preset_config(name: &str) -> Option<PermissionConfig> {
    match name {
        "build" => Some(build_preset()),
        "plan" => Some(plan_preset()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    config: PermissionConfig,
    preset: String,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            config: build_preset(),
            preset: "build".to_string(),
        }
    }
}

impl PermissionPolicy {
    pub fn new(config: PermissionConfig) -> Self {
        Self {
            config,
            preset: "custom".to_string(),
        }
    }

    pub fn preset(&self) -> &str {
        &self.preset
    }

    /// Replace the active rules with a named preset. Idempotent; returns
    /// false for an unknown preset name.
    pub fn apply_preset(&mut self, name: &str) -> bool {
        match preset_config(name) {
            Some(config) => {
                self.config = config;
                self.preset = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Decide for a tool call. Bash decisions depend on the command string
    /// inside `args`; everything else is a straight rule lookup.
    pub fn decide(&self, tool: &str, args: Option<&serde_json::Value>) -> PermissionDecision {
        if tool == "bash" {
            let command = args
                .and_then(|v| v.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            return self.decide_bash(command);
        }
        match self.config.rules.get(tool) {
            Some(rule) => PermissionDecision::new(*rule, format!("rule for `{tool}`")),
            None => PermissionDecision::new(self.config.default, "default rule"),
        }
    }

    pub fn decide_bash(&self, command: &str) -> PermissionDecision {
        let fallback = self
            .config
            .bash_patterns
            .get("*")
            .copied()
            .unwrap_or(self.config.default);

        if command.is_empty() {
            return PermissionDecision::new(fallback, "empty command");
        }

        // Name allowlist short-circuits to allow.
        if let Some(tokens) = shlex::split(command) {
            if let Some(name) = first_command_name(&tokens) {
                if self.config.allowlist.iter().any(|a| a == &name) {
                    return PermissionDecision::new(
                        PermissionRule::Allow,
                        format!("allowlisted `{name}`"),
                    );
                }
            }
        }

        // Longest (most specific) pattern wins; ties break lexicographically
        // so decisions stay deterministic.
        let mut patterns: Vec<(&String, &PermissionRule)> = self
            .config
            .bash_patterns
            .iter()
            .filter(|(p, _)| p.as_str() != "*")
            .collect();
        patterns.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for (pattern, rule) in patterns {
            if WildMatch::new(pattern).matches(command) {
                return PermissionDecision::new(*rule, format!("pattern `{pattern}`"));
            }
        }
        PermissionDecision::new(fallback, "default bash rule")
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn policy_with_patterns(patterns: &[(&str, PermissionRule)]) -> PermissionPolicy {
        let mut config = PermissionConfig {
            rules: HashMap::new(),
            default: PermissionRule::Ask,
            bash_patterns: HashMap::new(),
            allowlist: Vec::new(),
        };
        for (p, r) in patterns {
            config.bash_patterns.insert(p.to_string(), *r);
        }
        PermissionPolicy::new(config)
    }

    #[test]
    fn longest_pattern_wins() {
        let policy = policy_with_patterns(&[
            ("*", PermissionRule::Ask),
            ("git *", PermissionRule::Allow),
            ("git push *", PermissionRule::Deny),
        ]);
        assert_eq!(
            policy.decide_bash("git push origin").rule,
            PermissionRule::Deny
        );
        assert_eq!(policy.decide_bash("git status").rule, PermissionRule::Allow);
        assert_eq!(policy.decide_bash("make all").rule, PermissionRule::Ask);
    }

    #[test]
    fn empty_command_uses_star_entry() {
        let policy = policy_with_patterns(&[("*", PermissionRule::Deny)]);
        assert_eq!(policy.decide_bash("").rule, PermissionRule::Deny);
    }

    #[test]
    fn allowlist_short_circuits_patterns() {
        let mut policy = policy_with_patterns(&[("*", PermissionRule::Deny)]);
        policy.config.allowlist.push("ls".to_string());
        let decision = policy.decide_bash("ls -la");
        assert_eq!(decision.rule, PermissionRule::Allow);
        assert!(decision.reason.unwrap().contains("allowlisted"));
        // Wrapper stripping applies before the allowlist lookup.
        assert_eq!(
            policy.decide_bash("FOO=1 sudo ls").rule,
            PermissionRule::Allow
        );
    }

    #[test]
    fn tool_rules_fall_back_to_default() {
        let policy = PermissionPolicy::default();
        assert_eq!(policy.decide("read", None).rule, PermissionRule::Allow);
        assert_eq!(
            policy.decide("some_unknown_tool", None).rule,
            PermissionRule::Ask
        );
    }

    #[test]
    fn bash_decision_reads_command_from_args() {
        let policy = PermissionPolicy::default();
        let args = serde_json::json!({"command": "git push origin main"});
        assert_eq!(
            policy.decide("bash", Some(&args)).rule,
            PermissionRule::Ask
        );
        let args = serde_json::json!({"command": "git diff"});
        assert_eq!(
            policy.decide("bash", Some(&args)).rule,
            PermissionRule::Allow
        );
    }

    #[test]
    fn presets_apply_and_are_idempotent() {
        let mut policy = PermissionPolicy::default();
        assert!(policy.apply_preset("plan"));
        assert_eq!(policy.preset(), "plan");
        assert_eq!(policy.decide("write", None).rule, PermissionRule::Deny);
        assert_eq!(policy.decide_bash("make").rule, PermissionRule::Deny);
        // Applying the same preset again changes nothing.
        assert!(policy.apply_preset("plan"));
        assert_eq!(policy.decide("write", None).rule, PermissionRule::Deny);
        assert!(!policy.apply_preset("nonsense"));
    }

    #[test]
    fn plan_preset_still_allows_reads() {
        let mut policy = PermissionPolicy::default();
        policy.apply_preset("plan");
        assert_eq!(policy.decide("read", None).rule, PermissionRule::Allow);
        assert_eq!(policy.decide_bash("ls").rule, PermissionRule::Allow);
    }
}

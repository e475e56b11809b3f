//! Agent profiles and modes.
//!
//! An agent profile gates which tools are available this turn and bounds
//! the ReAct loop. A mode pairs a profile with a permission preset so one
//! user-facing switch (`/mode build`) flips both.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    /// Tools absent from the map are enabled; an explicit `false` disables.
    pub tool_enabled: HashMap<String, bool>,
    pub max_steps: usize,
}

impl AgentProfile {
    pub fn allows(&self, tool: &str) -> bool {
        self.tool_enabled.get(tool).copied().unwrap_or(true)
    }

    pub fn build() -> Self {
        Self {
            name: "build".to_string(),
            tool_enabled: HashMap::new(),
            max_steps: 24,
        }
    }

    /// Read-only profile: no mutations, no shell.
    pub fn plan() -> Self {
        let mut tool_enabled = HashMap::new();
        for tool in ["write", "edit", "patch", "bash"] {
            tool_enabled.insert(tool.to_string(), false);
        }
        Self {
            name: "plan".to_string(),
            tool_enabled,
            max_steps: 16,
        }
    }
}

/// A user-selectable mode: agent profile plus permission preset name.
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: &'static str,
    pub agent: AgentProfile,
    pub permission_preset: &'static str,
}

pub fn mode(name: &str) -> Option<Mode> {
    match name {
        "build" => Some(Mode {
            name: "build",
            agent: AgentProfile::build(),
            permission_preset: "build",
        }),
        "plan" => Some(Mode {
            name: "plan",
            agent: AgentProfile::plan(),
            permission_preset: "plan",
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn unknown_tools_default_to_enabled() {
        let agent = AgentProfile::build();
        assert!(agent.allows("bash"));
        assert!(agent.allows("anything"));
    }

    #[test]
    fn plan_profile_disables_mutating_tools() {
        let agent = AgentProfile::plan();
        assert!(!agent.allows("bash"));
        assert!(!agent.allows("write"));
        assert!(agent.allows("read"));
    }

    #[test]
    fn modes_pair_agent_and_preset() {
        let m = mode("plan").expect("plan mode exists");
        assert_eq!(m.agent.name, "plan");
        assert_eq!(m.permission_preset, "plan");
        assert!(mode("bogus").is_none());
    }
}

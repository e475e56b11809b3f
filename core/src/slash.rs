//! Slash commands: user-facing, side-effecting, never sent to the model.
//! Each returns a short textual response for the REPL to print.

use crate::error::Result;
use crate::orchestrator::Orchestrator;

const HELP_TEXT: &str = "\
Commands:
  /help                 show this help
  /new                  start a fresh session
  /resume [id]          resume a stored session (newest when no id)
  /mode {build|plan}    switch mode (agent profile + permission preset)
  /permissions {preset} apply a permission preset
  /model [name]         show or set the model
  /skills               list installed skills
  /undo                 revert the last turn's file edits
  /compact              compact older conversation history
Prefix a line with ! to run a shell command through the approval pipeline.";

impl Orchestrator {
    pub(crate) async fn handle_slash(&mut self, input: &str) -> Result<String> {
        let mut parts = input.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let arg = parts.next();

        let response = match command {
            "help" | "" => HELP_TEXT.to_string(),
            "new" => {
                self.new_session();
                format!("started new session {}", self.session.id)
            }
            "resume" => match self.resume_session(arg) {
                Ok(id) => format!("resumed session {id}"),
                Err(e) => format!("resume failed: {e}"),
            },
            "mode" => match arg {
                Some(name) => {
                    if self.set_mode(name) {
                        format!("mode set to {name}")
                    } else {
                        format!("unknown mode `{name}` (expected build or plan)")
                    }
                }
                None => format!("current mode: {}", self.mode_name),
            },
            "permissions" => match arg {
                Some(preset) => {
                    if self.apply_permission_preset(preset) {
                        format!("permission preset set to {preset}")
                    } else {
                        format!("unknown permission preset `{preset}`")
                    }
                }
                None => format!("current permission preset: {}", self.permission_preset()),
            },
            "model" => match arg {
                Some(model) => {
                    self.config.model = model.to_string();
                    self.session.meta.model = model.to_string();
                    format!("model set to {model}")
                }
                None => format!("current model: {}", self.config.model),
            },
            "skills" => "no skills installed".to_string(),
            "undo" => match self.undo_last_turn() {
                Ok(paths) if paths.is_empty() => "nothing to undo".to_string(),
                Ok(paths) => {
                    let listed: Vec<String> =
                        paths.iter().map(|p| p.display().to_string()).collect();
                    format!("restored {} file(s):\n{}", listed.len(), listed.join("\n"))
                }
                Err(e) => format!("undo failed: {e}"),
            },
            "compact" => {
                if self.compact_now().await? {
                    "conversation compacted".to_string()
                } else {
                    "nothing to compact yet".to_string()
                }
            }
            other => format!("unknown command `/{other}` (try /help)"),
        };
        Ok(response)
    }

    fn permission_preset(&self) -> String {
        self.policy_preset_name()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::client_common::Prompt;
    use crate::client_common::Provider;
    use crate::client_common::ResponseStream;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use crate::orchestrator::DenyAllApprovals;

    struct NoProvider;

    #[async_trait]
    impl Provider for NoProvider {
        async fn stream(&self, _prompt: &Prompt) -> crate::error::Result<ResponseStream> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(ResponseStream::new(rx))
        }
    }

    async fn orchestrator() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), ConfigOverrides::default()).unwrap();
        let orch =
            Orchestrator::new(config, Arc::new(NoProvider), Arc::new(DenyAllApprovals)).unwrap();
        (dir, orch)
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let (_dir, mut orch) = orchestrator().await;
        let out = orch.handle_slash("help").await.unwrap();
        assert!(out.contains("/mode"));
        assert!(out.contains("/undo"));
    }

    #[tokio::test]
    async fn mode_switch_updates_agent_and_preset() {
        let (_dir, mut orch) = orchestrator().await;
        let out = orch.handle_slash("mode plan").await.unwrap();
        assert_eq!(out, "mode set to plan");
        assert!(!orch.agent.allows("bash"));
        let out = orch.handle_slash("mode").await.unwrap();
        assert!(out.contains("plan"));
        let out = orch.handle_slash("mode bogus").await.unwrap();
        assert!(out.contains("unknown mode"));
    }

    #[tokio::test]
    async fn new_resets_the_session() {
        let (_dir, mut orch) = orchestrator().await;
        let old_id = orch.session().id.clone();
        let out = orch.handle_slash("new").await.unwrap();
        assert!(out.starts_with("started new session"));
        assert_ne!(orch.session().id, old_id);
    }

    #[tokio::test]
    async fn model_shows_and_sets() {
        let (_dir, mut orch) = orchestrator().await;
        let out = orch.handle_slash("model").await.unwrap();
        assert!(out.starts_with("current model:"));
        let out = orch.handle_slash("model my-local").await.unwrap();
        assert_eq!(out, "model set to my-local");
        assert_eq!(orch.config().model, "my-local");
    }

    #[tokio::test]
    async fn unknown_commands_suggest_help() {
        let (_dir, mut orch) = orchestrator().await;
        let out = orch.handle_slash("frobnicate").await.unwrap();
        assert!(out.contains("unknown command"));
    }

    #[tokio::test]
    async fn undo_with_empty_stack_is_graceful() {
        let (_dir, mut orch) = orchestrator().await;
        let out = orch.handle_slash("undo").await.unwrap();
        assert_eq!(out, "nothing to undo");
    }
}

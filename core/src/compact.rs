//! Context compaction: summarize an older message prefix into one synthetic
//! assistant message so the conversation stays under the token budget.
//!
//! `compact` is a no-op unless there is enough history beyond the protected
//! recent window. The trailing `keep_recent` messages are preserved
//! structurally; everything before them is replaced by a single assistant
//! message whose content starts with [`COMPACTION_PREFIX`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::client_common::Prompt;
use crate::client_common::Provider;
use crate::client_common::StreamEvent;
use crate::models::Message;
use crate::models::Role;

pub const COMPACTION_PREFIX: &str = "[COMPACTION_SUMMARY]\n";

/// Tool-output fields longer than this are pruned before summarization.
const PRUNE_RUNE_BUDGET: usize = 1200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub auto: bool,
    /// Fraction of the context token limit that triggers auto-compaction.
    pub threshold: f64,
    pub recent_messages: usize,
    pub prune_tool_outputs: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            threshold: 0.8,
            recent_messages: 12,
            prune_tool_outputs: true,
        }
    }
}

impl CompactionConfig {
    /// Clamp out-of-range values from config files into the contract:
    /// `0 < threshold < 1`, `recent_messages >= 4`.
    pub fn normalized(mut self) -> Self {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            self.threshold = 0.8;
        }
        self.recent_messages = self.recent_messages.max(4);
        self
    }
}

#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn summarize(&self, head: &[Message]) -> anyhow::Result<String>;
}

pub struct CompactOutcome {
    pub messages: Vec<Message>,
    pub summary: String,
    pub changed: bool,
}

/// Compact `msgs`, keeping the last `keep_recent` untouched. Returns
/// `changed == false` (and the input unchanged) when there is nothing worth
/// summarizing yet.
pub async fn compact(
    msgs: &[Message],
    keep_recent: usize,
    prune_tool_outputs: bool,
    strategy: &dyn CompactionStrategy,
) -> CompactOutcome {
    if msgs.len() <= keep_recent + 2 {
        return CompactOutcome {
            messages: msgs.to_vec(),
            summary: String::new(),
            changed: false,
        };
    }

    let mut msgs = msgs.to_vec();
    if prune_tool_outputs {
        for msg in &mut msgs {
            if msg.role == Role::Tool {
                msg.content = prune_tool_output(&msg.content);
            }
        }
    }

    let split = msgs.len() - keep_recent;
    let (head, tail) = msgs.split_at(split);

    let summary = match strategy.summarize(head).await {
        Ok(summary) if !summary.trim().is_empty() => summary,
        Ok(_) | Err(_) => {
            // Strategy produced nothing usable; fall back to the regex pass
            // so compaction still makes progress.
            RegexStrategy
                .summarize(head)
                .await
                .unwrap_or_else(|_| "(no summary available)".to_string())
        }
    };

    let mut messages = Vec::with_capacity(tail.len() + 1);
    messages.push(Message::assistant(format!("{COMPACTION_PREFIX}{summary}")));
    messages.extend_from_slice(tail);

    CompactOutcome {
        messages,
        summary,
        changed: true,
    }
}

/// Truncate the `content`/`stdout`/`stderr` fields inside a tool result's
/// JSON to the prune budget. Non-JSON content is truncated as a whole.
fn prune_tool_output(content: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                for key in ["content", "stdout", "stderr"] {
                    if let Some(field) = obj.get_mut(key) {
                        if let Some(s) = field.as_str() {
                            if s.chars().count() > PRUNE_RUNE_BUDGET {
                                let mut cut: String =
                                    s.chars().take(PRUNE_RUNE_BUDGET).collect();
                                cut.push_str("…[pruned]");
                                *field = serde_json::Value::String(cut);
                            }
                        }
                    }
                }
            }
            value.to_string()
        }
        Err(_) => {
            if content.chars().count() > PRUNE_RUNE_BUDGET {
                let mut cut: String = content.chars().take(PRUNE_RUNE_BUDGET).collect();
                cut.push_str("…[pruned]");
                cut
            } else {
                content.to_string()
            }
        }
    }
}

/// Heuristic summarizer: no model call, just structure scraped from the
/// head. Always available as the fallback.
pub struct RegexStrategy;

#[async_trait]
impl CompactionStrategy for RegexStrategy {
    async fn summarize(&self, head: &[Message]) -> anyhow::Result<String> {
        let objective = head
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| one_line(&m.content, 160))
            .unwrap_or_else(|| "(unknown)".to_string());

        let mut files: Vec<String> = Vec::new();
        let mut risks: Vec<String> = Vec::new();
        #[allow(clippy::unwrap_used)]
        let path_re = regex_lite::Regex::new(
            r#"[\w./-]+\.(?:rs|go|py|ts|js|tsx|jsx|md|toml|json|yaml|yml|txt|sh|c|h|cpp)"#,
        )
        .unwrap();

        for msg in head {
            if msg.role != Role::Tool {
                continue;
            }
            for m in path_re.find_iter(&msg.content) {
                let path = m.as_str().to_string();
                if !files.contains(&path) {
                    files.push(path);
                }
            }
            let lower = msg.content.to_lowercase();
            if lower.contains("denied") {
                risks.push("a tool call was denied".to_string());
            }
            if lower.contains("\"error\"") || lower.contains("error:") {
                risks.push("a tool call errored".to_string());
            }
        }
        risks.dedup();

        let mut steps: Vec<String> = Vec::new();
        for msg in head {
            for call in &msg.tool_calls {
                steps.push(call.function.name.clone());
            }
        }
        steps.dedup();

        let mut out = format!("Objective: {objective}\n");
        if !files.is_empty() {
            out.push_str(&format!("Files touched: {}\n", files.join(", ")));
        }
        if !steps.is_empty() {
            out.push_str(&format!("Key steps: {}\n", steps.join(" → ")));
        }
        if !risks.is_empty() {
            out.push_str(&format!("Risks: {}\n", risks.join("; ")));
        }
        out.push_str("Next steps: continue from the preserved recent messages.");
        Ok(out)
    }
}

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize a coding-agent conversation so it can be \
compacted. Reply with plain text covering: the objective, files touched, key decisions, risks \
or failures, and concrete next steps. Be factual and brief; do not invent details.";

/// Summarize via one auxiliary model completion.
pub struct LlmStrategy {
    provider: Arc<dyn Provider>,
    model: String,
}

impl LlmStrategy {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompactionStrategy for LlmStrategy {
    async fn summarize(&self, head: &[Message]) -> anyhow::Result<String> {
        use futures::StreamExt;

        let mut transcript = String::new();
        for msg in head {
            let role = match msg.role {
                Role::System => continue,
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            transcript.push_str(&format!("[{role}] {}\n", one_line(&msg.content, 400)));
            for call in &msg.tool_calls {
                transcript.push_str(&format!(
                    "[assistant→tool] {}({})\n",
                    call.function.name,
                    one_line(&call.function.arguments, 200)
                ));
            }
        }

        let prompt = Prompt {
            model: self.model.clone(),
            messages: vec![
                Message::system(SUMMARY_SYSTEM_PROMPT),
                Message::user(transcript),
            ],
            tools: Vec::new(),
        };

        let mut stream = self.provider.stream(&prompt).await?;
        while let Some(event) = stream.next().await {
            if let StreamEvent::Completed(response) = event? {
                return Ok(response.content);
            }
        }
        anyhow::bail!("summary stream ended without completion");
    }
}

/// LLM first, regex on empty output or error.
pub struct FallbackStrategy {
    llm: LlmStrategy,
}

impl FallbackStrategy {
    pub fn new(llm: LlmStrategy) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CompactionStrategy for FallbackStrategy {
    async fn summarize(&self, head: &[Message]) -> anyhow::Result<String> {
        match self.llm.summarize(head).await {
            Ok(summary) if !summary.trim().is_empty() => Ok(summary),
            Ok(_) => RegexStrategy.summarize(head).await,
            Err(e) => {
                tracing::warn!("LLM compaction failed, using regex strategy: {e:#}");
                RegexStrategy.summarize(head).await
            }
        }
    }
}

fn one_line(text: &str, budget: usize) -> String {
    let joined: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.chars().count() <= budget {
        joined
    } else {
        let mut cut: String = joined.chars().take(budget).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::ToolCall;

    fn msgs(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("user message {i}"))
                } else {
                    Message::assistant(format!("assistant message {i}"))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn short_histories_are_left_alone() {
        let input = msgs(6);
        let outcome = compact(&input, 12, false, &RegexStrategy).await;
        assert!(!outcome.changed);
        assert_eq!(outcome.messages, input);
    }

    #[tokio::test]
    async fn tail_is_preserved_structurally() {
        let input = msgs(20);
        let outcome = compact(&input, 5, false, &RegexStrategy).await;
        assert!(outcome.changed);
        assert_eq!(outcome.messages.len(), 6);
        assert_eq!(&outcome.messages[1..], &input[15..]);
        assert!(outcome.messages[0].content.starts_with(COMPACTION_PREFIX));
        assert_eq!(outcome.messages[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn regex_strategy_scrapes_objective_files_and_risks() {
        let mut input = msgs(2);
        input.push(Message::assistant_with_calls(
            "",
            None,
            vec![ToolCall::function("1", "edit", "{}")],
        ));
        input.push(Message::tool(
            "1",
            "edit",
            r#"{"ok":false,"error":"no match","path":"src/main.rs"}"#,
        ));
        input.extend(msgs(6));
        let outcome = compact(&input, 4, false, &RegexStrategy).await;
        assert!(outcome.changed);
        assert!(outcome.summary.contains("Objective: user message 0"));
        assert!(outcome.summary.contains("src/main.rs"));
        assert!(outcome.summary.contains("errored"));
        assert!(outcome.summary.contains("edit"));
    }

    #[tokio::test]
    async fn pruning_truncates_large_tool_fields() {
        let big = "y".repeat(5000);
        let mut input = msgs(8);
        input.insert(
            0,
            Message::tool("1", "bash", format!(r#"{{"ok":true,"stdout":"{big}"}}"#)),
        );
        let outcome = compact(&input, 4, true, &RegexStrategy).await;
        // The pruned message sits in the summarized head, so just confirm
        // pruning itself works on the raw content.
        assert!(outcome.changed);
        let pruned = prune_tool_output(&format!(r#"{{"ok":true,"stdout":"{big}"}}"#));
        let value: serde_json::Value = serde_json::from_str(&pruned).unwrap();
        let stdout = value.get("stdout").unwrap().as_str().unwrap();
        assert!(stdout.chars().count() < 1300);
        assert!(stdout.ends_with("…[pruned]"));
    }

    #[test]
    fn config_normalization_clamps_bad_values() {
        let config = CompactionConfig {
            auto: true,
            threshold: 1.7,
            recent_messages: 1,
            prune_tool_outputs: false,
        }
        .normalized();
        assert_eq!(config.threshold, 0.8);
        assert_eq!(config.recent_messages, 4);
    }
}

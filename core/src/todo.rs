//! Todo model, per-session store, and the complex-input bootstrap.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    pub status: TodoStatus,
    pub priority: TodoPriority,
}

impl TodoItem {
    pub fn pending(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            status: TodoStatus::Pending,
            priority: TodoPriority::Medium,
        }
    }
}

/// In-memory todo lists keyed by session id. The invariant that at most one
/// item is `in_progress` is enforced on every replace: the first one wins,
/// later ones are demoted to pending.
#[derive(Debug, Default)]
pub struct TodoStore {
    items: HashMap<String, Vec<TodoItem>>,
}

impl TodoStore {
    pub fn list(&self, session_id: &str) -> Vec<TodoItem> {
        self.items.get(session_id).cloned().unwrap_or_default()
    }

    pub fn replace(&mut self, session_id: &str, mut items: Vec<TodoItem>) -> Vec<TodoItem> {
        let mut seen_in_progress = false;
        for item in &mut items {
            if item.status == TodoStatus::InProgress {
                if seen_in_progress {
                    item.status = TodoStatus::Pending;
                } else {
                    seen_in_progress = true;
                }
            }
        }
        self.items.insert(session_id.to_string(), items.clone());
        items
    }

    pub fn all_completed(&self, session_id: &str) -> bool {
        self.items
            .get(session_id)
            .is_none_or(|items| items.iter().all(|i| i.status == TodoStatus::Completed))
    }
}

const STEP_KEYWORDS: &[&str] = &[
    "first", "then", "after that", "finally", "step", "steps", "refactor", "implement",
    "migrate",
];

/// A user input qualifies as complex when it is long, obviously multi-step,
/// or heavily clause-structured.
pub fn is_complex_input(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.chars().count() >= 80 {
        return true;
    }
    let lower = trimmed.to_lowercase();
    if STEP_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return true;
    }
    let clause_delimiters = trimmed.chars().filter(|c| matches!(c, ',' | ';')).count();
    if clause_delimiters >= 2 {
        return true;
    }
    trimmed.split_whitespace().count() >= 14
}

/// Starter todo items for a complex input: explicit `1. … 2. …` steps when
/// the user wrote them, else three boilerplate items matching the input's
/// language.
pub fn bootstrap_todos(input: &str) -> Vec<TodoItem> {
    let steps = parse_numbered_steps(input);
    if !steps.is_empty() {
        return steps.into_iter().map(TodoItem::pending).collect();
    }
    let boilerplate: &[&str] = if is_cjk_heavy(input) {
        &["理解需求和相关代码", "实现修改", "验证结果"]
    } else {
        &[
            "Understand the request and the relevant code",
            "Implement the change",
            "Verify the result",
        ]
    };
    boilerplate.iter().map(|s| TodoItem::pending(*s)).collect()
}

fn parse_numbered_steps(input: &str) -> Vec<String> {
    let re = regex_lite::Regex::new(r"(?:^|\s)(\d+)[.)]\s+").ok();
    let Some(re) = re else {
        return Vec::new();
    };
    let matches: Vec<(usize, usize)> = re
        .find_iter(input)
        .map(|m| (m.start(), m.end()))
        .collect();
    if matches.len() < 2 {
        return Vec::new();
    }
    let mut steps = Vec::new();
    for (i, (_, body_start)) in matches.iter().enumerate() {
        let end = matches
            .get(i + 1)
            .map(|(next_start, _)| *next_start)
            .unwrap_or(input.len());
        let step = input[*body_start..end].trim().trim_end_matches([',', ';']);
        if !step.is_empty() {
            steps.push(step.to_string());
        }
    }
    steps
}

fn is_cjk_heavy(input: &str) -> bool {
    let total = input.chars().count().max(1);
    let cjk = input
        .chars()
        .filter(|c| matches!(*c as u32, 0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xAC00..=0xD7AF))
        .count();
    cjk * 2 > total
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn replace_demotes_extra_in_progress_items() {
        let mut store = TodoStore::default();
        let items = vec![
            TodoItem {
                status: TodoStatus::InProgress,
                ..TodoItem::pending("a")
            },
            TodoItem {
                status: TodoStatus::InProgress,
                ..TodoItem::pending("b")
            },
        ];
        let normalized = store.replace("s1", items);
        assert_eq!(normalized[0].status, TodoStatus::InProgress);
        assert_eq!(normalized[1].status, TodoStatus::Pending);
    }

    #[test]
    fn all_completed_on_missing_list_is_true() {
        let store = TodoStore::default();
        assert!(store.all_completed("nope"));
    }

    #[test]
    fn complexity_thresholds() {
        assert!(!is_complex_input("hi"));
        assert!(!is_complex_input("what does this function do"));
        assert!(is_complex_input(&"long ".repeat(20)));
        assert!(is_complex_input("first add a flag, then update the parser"));
        assert!(is_complex_input("rename a, update b; fix c, and d"));
        assert!(is_complex_input(
            "please update the readme file so the install section mentions supported platforms"
        ));
    }

    #[test]
    fn bootstrap_parses_numbered_steps() {
        let todos = bootstrap_todos("do this: 1. add the flag 2. wire it up 3. test it");
        assert_eq!(todos.len(), 3);
        assert_eq!(todos[0].content, "add the flag");
        assert_eq!(todos[2].content, "test it");
        assert!(todos.iter().all(|t| t.status == TodoStatus::Pending));
    }

    #[test]
    fn bootstrap_falls_back_to_boilerplate() {
        let todos = bootstrap_todos("refactor the scheduler to support priorities");
        assert_eq!(todos.len(), 3);
        assert!(todos[0].content.starts_with("Understand"));
    }

    #[test]
    fn bootstrap_uses_cjk_boilerplate_for_cjk_input() {
        let todos = bootstrap_todos("重构调度器以支持优先级并添加测试");
        assert_eq!(todos.len(), 3);
        assert!(todos[0].content.contains("理解"));
    }
}

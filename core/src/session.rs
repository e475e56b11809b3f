//! In-memory session record: the durable conversation plus its metadata.
//!
//! Messages are append-only and only ever mutated by compaction, which
//! replaces a prefix with a single synthetic summary message. Every append
//! stamps a timestamp; `message_timestamps` stays exactly as long as
//! `messages`.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::models::Message;
use crate::models::ToolDef;

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub agent: String,
    pub model: String,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub meta: SessionMeta,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub message_timestamps: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl Session {
    pub fn new(meta: SessionMeta) -> Self {
        let now = now_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now.clone(),
            updated_at: now,
            meta,
            messages: Vec::new(),
            message_timestamps: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn append_message(&mut self, msg: Message) {
        let now = now_rfc3339();
        // Derive a title from the first user message.
        if self.meta.title.is_none() && msg.role == crate::models::Role::User {
            self.meta.title = Some(derive_title(&msg.content));
        }
        self.messages.push(msg);
        self.message_timestamps.push(now.clone());
        self.updated_at = now;
    }

    /// Install a compacted message list: `tail_len` trailing messages keep
    /// their original timestamps, everything before them (the synthetic
    /// summary) is stamped now.
    pub fn replace_with_compacted(&mut self, messages: Vec<Message>, tail_len: usize) {
        let now = now_rfc3339();
        let tail_len = tail_len.min(messages.len()).min(self.message_timestamps.len());
        let tail_stamps: Vec<String> = self
            .message_timestamps
            .iter()
            .rev()
            .take(tail_len)
            .rev()
            .cloned()
            .collect();
        let head_len = messages.len() - tail_len;
        let mut timestamps = vec![now.clone(); head_len];
        timestamps.extend(tail_stamps);
        self.messages = messages;
        self.message_timestamps = timestamps;
        self.updated_at = now;
    }

    /// Roll the conversation back to `len` messages, timestamps in step.
    /// Used when a cancelled turn unwinds.
    pub fn truncate_messages(&mut self, len: usize) {
        self.messages.truncate(len);
        self.message_timestamps.truncate(len);
    }

    /// Timestamp of message `i`, falling back to `created_at`.
    pub fn timestamp_of(&self, i: usize) -> &str {
        self.message_timestamps
            .get(i)
            .map(String::as_str)
            .unwrap_or(&self.created_at)
    }
}

fn derive_title(content: &str) -> String {
    const MAX: usize = 48;
    let line = content.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX {
        line.to_string()
    } else {
        let mut title: String = line.chars().take(MAX).collect();
        title.push('…');
        title
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::models::Role;

    fn session() -> Session {
        Session::new(SessionMeta {
            agent: "build".to_string(),
            model: "test-model".to_string(),
            cwd: PathBuf::from("/tmp"),
            title: None,
        })
    }

    #[test]
    fn append_keeps_timestamps_paired() {
        let mut s = session();
        s.append_message(Message::user("hi"));
        s.append_message(Message::assistant("hello"));
        assert_eq!(s.messages.len(), s.message_timestamps.len());
    }

    #[test]
    fn first_user_message_sets_title() {
        let mut s = session();
        s.append_message(Message::user("fix the flaky test in ci.rs"));
        assert_eq!(s.meta.title.as_deref(), Some("fix the flaky test in ci.rs"));
        s.append_message(Message::user("something else"));
        assert_eq!(s.meta.title.as_deref(), Some("fix the flaky test in ci.rs"));
    }

    #[test]
    fn long_titles_are_truncated() {
        let mut s = session();
        s.append_message(Message::user("x".repeat(100)));
        let title = s.meta.title.unwrap();
        assert!(title.chars().count() <= 49);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn compaction_preserves_tail_timestamps() {
        let mut s = session();
        for i in 0..6 {
            s.append_message(Message::user(format!("m{i}")));
        }
        let old_stamps = s.message_timestamps.clone();
        let compacted = vec![
            Message::assistant("[COMPACTION_SUMMARY]\nsummary"),
            s.messages[4].clone(),
            s.messages[5].clone(),
        ];
        s.replace_with_compacted(compacted, 2);
        assert_eq!(s.messages.len(), 3);
        assert_eq!(s.message_timestamps.len(), 3);
        assert_eq!(s.message_timestamps[1], old_stamps[4]);
        assert_eq!(s.message_timestamps[2], old_stamps[5]);
    }

    #[test]
    fn timestamp_of_falls_back_to_created_at() {
        let mut s = session();
        s.append_message(Message::user("hi"));
        assert_eq!(s.timestamp_of(99), s.created_at);
        assert_eq!(s.timestamp_of(0), s.message_timestamps[0]);
        assert_eq!(s.messages[0].role, Role::User);
    }
}

//! Per-session transcript file at `<workspace>/.coder/sessions/<id>.json`.
//!
//! The transcript is the human-inspectable mirror of the session: indented
//! JSON, rewritten after every state change via write-temp-then-rename.
//! Static assembler messages are prepended with the session `created_at` as
//! their timestamp; runtime messages carry their recorded RFC 3339 time,
//! falling back to `created_at`. `created_at` itself is preserved across
//! flushes.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::config::CONFIG_DIR;
use crate::config::SESSIONS_SUBDIR;
use crate::error::Result;
use crate::models::Message;
use crate::session::Session;
use crate::store::write_atomic;

pub struct TranscriptFile {
    path: PathBuf,
}

#[derive(Serialize)]
struct TranscriptDoc<'a> {
    session_id: &'a str,
    created_at: &'a str,
    updated_at: &'a str,
    meta: &'a crate::session::SessionMeta,
    messages: Vec<Value>,
    tools: &'a [crate::models::ToolDef],
}

impl TranscriptFile {
    pub fn new(workspace_root: &Path, session_id: &str) -> Self {
        let path = workspace_root
            .join(CONFIG_DIR)
            .join(SESSIONS_SUBDIR)
            .join(format!("{session_id}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the transcript. Best-effort at call sites: failures are
    /// logged by the caller and never abort a turn.
    pub fn flush(&self, session: &Session, static_messages: &[Message]) -> Result<()> {
        let mut messages = Vec::with_capacity(static_messages.len() + session.messages.len());
        for msg in static_messages {
            messages.push(message_with_timestamp(msg, &session.created_at)?);
        }
        for (i, msg) in session.messages.iter().enumerate() {
            messages.push(message_with_timestamp(msg, session.timestamp_of(i))?);
        }

        let doc = TranscriptDoc {
            session_id: &session.id,
            created_at: &session.created_at,
            updated_at: &session.updated_at,
            meta: &session.meta,
            messages,
            tools: &session.tools,
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&doc)?)
    }
}

fn message_with_timestamp(msg: &Message, timestamp: &str) -> Result<Value> {
    let mut value = serde_json::to_value(msg)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "timestamp".to_string(),
            Value::String(timestamp.to_string()),
        );
    }
    Ok(value)
}

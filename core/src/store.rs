//! Structured session store.
//!
//! Filesystem-backed, keyed by session id, living under
//! `coder_home()/store`. All writes are best-effort from the turn loop's
//! perspective (failures are logged, never abort a turn) and are atomic via
//! write-temp-then-rename so concurrent readers only ever observe complete
//! snapshots. A process-wide mutex serializes writers within this process.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CoderErr;
use crate::error::Result;
use crate::models::Message;
use crate::session::Session;
use crate::session::now_rfc3339;
use crate::todo::TodoItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub updated_at: String,
}

/// One permission decision, appended to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionLogEntry {
    pub timestamp: String,
    pub session_id: String,
    pub tool: String,
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionLogEntry {
    pub fn new(
        session_id: &str,
        tool: &str,
        rule: &str,
        reason: Option<String>,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            rule: rule.to_string(),
            reason,
        }
    }
}

pub trait Store: Send + Sync {
    fn create_session(&self, session: &Session) -> Result<()>;
    fn save_session(&self, session: &Session) -> Result<()>;
    fn load_session(&self, id: &str) -> Result<Session>;
    fn list_sessions(&self) -> Result<Vec<SessionSummary>>;
    fn save_messages(&self, id: &str, msgs: &[Message]) -> Result<()>;
    fn append_messages(&self, id: &str, msgs: &[Message]) -> Result<()>;
    fn load_messages(&self, id: &str) -> Result<Vec<Message>>;
    fn list_todos(&self, id: &str) -> Result<Vec<TodoItem>>;
    fn replace_todos(&self, id: &str, items: &[TodoItem]) -> Result<()>;
    fn log_permission(&self, entry: &PermissionLogEntry) -> Result<()>;
    fn close(&self) -> Result<()>;
}

pub struct FsStore {
    root: PathBuf,
    // Poisoned mutex should fail the program.
    write_lock: Mutex<()>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions"))?;
        std::fs::create_dir_all(root.join("todos"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store under the default `coder_home()/store` location.
    pub fn open_default() -> Result<Self> {
        Self::new(crate::config::coder_home()?.join("store"))
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    fn todos_path(&self, id: &str) -> PathBuf {
        self.root.join("todos").join(format!("{id}.json"))
    }

    #[allow(clippy::unwrap_used)]
    fn locked(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap()
    }
}

impl Store for FsStore {
    fn create_session(&self, session: &Session) -> Result<()> {
        self.save_session(session)
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        let _guard = self.locked();
        write_atomic(
            &self.session_path(&session.id),
            &serde_json::to_vec_pretty(session)?,
        )
    }

    fn load_session(&self, id: &str) -> Result<Session> {
        let path = self.session_path(id);
        let data = std::fs::read(&path)
            .map_err(|_| CoderErr::SessionNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(self.root.join("sessions"))? {
            let entry = entry?;
            let Ok(data) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(session) = serde_json::from_slice::<Session>(&data) else {
                tracing::warn!("skipping unreadable session file {:?}", entry.path());
                continue;
            };
            summaries.push(SessionSummary {
                id: session.id,
                title: session.meta.title,
                updated_at: session.updated_at,
            });
        }
        // Newest first.
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Replace the stored conversation wholesale (compaction does this).
    fn save_messages(&self, id: &str, msgs: &[Message]) -> Result<()> {
        let mut session = self.load_session(id)?;
        session.truncate_messages(0);
        for msg in msgs {
            session.append_message(msg.clone());
        }
        self.save_session(&session)
    }

    fn append_messages(&self, id: &str, msgs: &[Message]) -> Result<()> {
        let mut session = self.load_session(id)?;
        for msg in msgs {
            session.append_message(msg.clone());
        }
        self.save_session(&session)
    }

    fn load_messages(&self, id: &str) -> Result<Vec<Message>> {
        Ok(self.load_session(id)?.messages)
    }

    fn list_todos(&self, id: &str) -> Result<Vec<TodoItem>> {
        match std::fs::read(self.todos_path(id)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn replace_todos(&self, id: &str, items: &[TodoItem]) -> Result<()> {
        let _guard = self.locked();
        write_atomic(&self.todos_path(id), &serde_json::to_vec_pretty(items)?)
    }

    fn log_permission(&self, entry: &PermissionLogEntry) -> Result<()> {
        let _guard = self.locked();
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.root.join("permissions.jsonl"))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Write via a temp file in the same directory followed by a rename, so
/// readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| CoderErr::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::session::SessionMeta;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn session() -> Session {
        Session::new(SessionMeta {
            agent: "build".to_string(),
            model: "m".to_string(),
            cwd: PathBuf::from("/tmp"),
            title: None,
        })
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, store) = store();
        let mut s = session();
        s.append_message(Message::user("hello"));
        store.save_session(&s).unwrap();
        let loaded = store.load_session(&s.id).unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.created_at, s.created_at);
    }

    #[test]
    fn load_missing_session_errors() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_session("nope"),
            Err(CoderErr::SessionNotFound(_))
        ));
    }

    #[test]
    fn append_messages_extends_and_stamps() {
        let (_dir, store) = store();
        let s = session();
        store.create_session(&s).unwrap();
        store
            .append_messages(&s.id, &[Message::user("a"), Message::assistant("b")])
            .unwrap();
        let loaded = store.load_session(&s.id).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.message_timestamps.len(), 2);
    }

    #[test]
    fn save_messages_replaces_wholesale() {
        let (_dir, store) = store();
        let s = session();
        store.create_session(&s).unwrap();
        store
            .append_messages(&s.id, &[Message::user("a"), Message::assistant("b")])
            .unwrap();
        store
            .save_messages(&s.id, &[Message::user("only")])
            .unwrap();
        let loaded = store.load_session(&s.id).unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.message_timestamps.len(), 1);
        assert_eq!(loaded.messages[0].content, "only");
    }

    #[test]
    fn list_sessions_newest_first() {
        let (_dir, store) = store();
        let mut a = session();
        a.updated_at = "2026-01-01T00:00:00Z".to_string();
        let mut b = session();
        b.updated_at = "2026-06-01T00:00:00Z".to_string();
        store.save_session(&a).unwrap();
        store.save_session(&b).unwrap();
        let summaries = store.list_sessions().unwrap();
        assert_eq!(summaries[0].id, b.id);
    }

    #[test]
    fn todos_default_to_empty() {
        let (_dir, store) = store();
        assert!(store.list_todos("whatever").unwrap().is_empty());
        let items = vec![TodoItem::pending("x")];
        store.replace_todos("whatever", &items).unwrap();
        assert_eq!(store.list_todos("whatever").unwrap(), items);
    }

    #[test]
    fn permission_log_appends_jsonl() {
        let (_dir, store) = store();
        store
            .log_permission(&PermissionLogEntry::new("s1", "bash", "ask", None))
            .unwrap();
        store
            .log_permission(&PermissionLogEntry::new(
                "s1",
                "write",
                "deny",
                Some("plan mode".to_string()),
            ))
            .unwrap();
        let log = std::fs::read_to_string(store.root.join("permissions.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
        let last: PermissionLogEntry =
            serde_json::from_str(log.lines().last().unwrap()).unwrap();
        assert_eq!(last.rule, "deny");
    }
}

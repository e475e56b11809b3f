//! Per-turn undo: whole-file snapshots captured before any mutating tool
//! touches a path, reversed LIFO on request.
//!
//! Capture is eager and whole-file. Memory-expensive for large files, but
//! restore is then trivially correct, including file modes and created
//! files. The stack holds at most [`UNDO_STACK_CAP`] turns; the oldest is
//! evicted first.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;

pub const UNDO_STACK_CAP: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub existed: bool,
    pub content: Option<Vec<u8>>,
    pub mode: Option<u32>,
}

/// Collects snapshots for one turn. Deduplicates by resolved absolute path:
/// only the first capture of a path in a turn matters, because that is the
/// state the turn started from.
#[derive(Debug, Default)]
pub struct TurnRecorder {
    seen: HashSet<PathBuf>,
    snapshots: Vec<FileSnapshot>,
}

impl TurnRecorder {
    pub fn capture(&mut self, path: &Path) {
        if !self.seen.insert(path.to_path_buf()) {
            return;
        }
        let snapshot = match std::fs::read(path) {
            Ok(content) => {
                let mode = file_mode(path);
                FileSnapshot {
                    path: path.to_path_buf(),
                    existed: true,
                    content: Some(content),
                    mode,
                }
            }
            Err(_) => FileSnapshot {
                path: path.to_path_buf(),
                existed: false,
                content: None,
                mode: None,
            },
        };
        self.snapshots.push(snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn into_snapshots(self) -> Vec<FileSnapshot> {
        self.snapshots
    }
}

#[derive(Debug, Default)]
pub struct UndoStack {
    entries: VecDeque<Vec<FileSnapshot>>,
}

impl UndoStack {
    pub fn push(&mut self, snapshots: Vec<FileSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        self.entries.push_back(snapshots);
        while self.entries.len() > UNDO_STACK_CAP {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop the most recent turn and restore its snapshots in reverse capture
    /// order. On any OS error the entry is pushed back so a later retry can
    /// still restore it.
    pub fn undo_last(&mut self) -> Result<Vec<PathBuf>> {
        let Some(snapshots) = self.entries.pop_back() else {
            return Ok(Vec::new());
        };

        let mut restored = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots.iter().rev() {
            if let Err(e) = restore(snapshot) {
                self.entries.push_back(snapshots.clone());
                return Err(e);
            }
            restored.push(snapshot.path.clone());
        }
        Ok(restored)
    }
}

fn restore(snapshot: &FileSnapshot) -> Result<()> {
    if snapshot.existed {
        if let Some(parent) = snapshot.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&snapshot.path, snapshot.content.as_deref().unwrap_or_default())?;
        #[cfg(unix)]
        if let Some(mode) = snapshot.mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&snapshot.path, std::fs::Permissions::from_mode(mode))?;
        }
    } else if snapshot.path.exists() {
        std::fs::remove_file(&snapshot.path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

//! Group transcript store — a per-chat append-only log of everything said
//! in a group, independent of any single agent's session history.
//!
//! Where [`crate::session`] tracks one agent's private view of a
//! conversation (its own turns plus the peers it chose to remember),
//! the transcript store tracks the group's shared, agent-agnostic record:
//! every message any member posted, so a newly-joined or restarted agent
//! can reconstruct "what happened in this room" without replaying the
//! relay log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils;

/// One line of a group transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// "user" | "assistant" | "system" — mirrors session `Message` roles.
    pub role: String,
    pub content: String,
    /// Display name of whoever said it; empty for the group's own system notes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    /// Unix millis.
    pub ts: i64,
    /// Relay/channel message id, used to dedup re-delivered entries.
    pub message_id: String,
}

/// Append-only, file-backed transcript for every group chat this agent
/// has seen, one file per chat key under `<home>/transcripts/`.
pub struct GroupTranscriptStore {
    dir: PathBuf,
}

impl GroupTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        GroupTranscriptStore { dir: dir.into() }
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", utils::safe_filename(session_key)))
    }

    /// Append one entry to the chat's transcript file.
    pub fn append(&self, session_key: &str, entry: &TranscriptEntry) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(session_key);
        let line = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", line)
    }

    /// Load every entry ever appended for this chat, tolerating partial or
    /// malformed trailing lines (a concurrent writer may be mid-append).
    fn load_all(&self, session_key: &str) -> Vec<TranscriptEntry> {
        let path = self.path_for(session_key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to read transcript");
                }
                return Vec::new();
            }
        };

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<TranscriptEntry>(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping malformed transcript line");
                    None
                }
            })
            .collect()
    }

    /// Return the most recent `n` entries, deduplicated by `message_id`
    /// (at-least-once delivery upstream can append the same entry twice)
    /// and sorted by timestamp ascending.
    pub fn get_recent(&self, session_key: &str, n: usize) -> Vec<TranscriptEntry> {
        let mut seen = HashMap::new();
        for entry in self.load_all(session_key) {
            seen.insert(entry.message_id.clone(), entry);
        }

        let mut entries: Vec<TranscriptEntry> = seen.into_values().collect();
        entries.sort_by_key(|e| e.ts);

        let len = entries.len();
        if len > n {
            entries.split_off(len - n)
        } else {
            entries
        }
    }

    /// Count the trailing run of `role == "assistant"` entries at the end
    /// of the transcript — the group-level analogue of
    /// [`crate::session::SessionManager::count_trailing_bots`], used when
    /// no single agent's private session covers the whole group.
    pub fn count_trailing_assistants(&self, session_key: &str) -> usize {
        let entries = self.load_all(session_key);
        let mut seen = HashMap::new();
        for entry in entries {
            seen.insert(entry.message_id.clone(), entry);
        }
        let mut entries: Vec<TranscriptEntry> = seen.into_values().collect();
        entries.sort_by_key(|e| e.ts);

        entries
            .iter()
            .rev()
            .take_while(|e| e.role == "assistant")
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(role: &str, sender: &str, ts: i64, id: &str) -> TranscriptEntry {
        TranscriptEntry {
            role: role.to_string(),
            content: format!("{} says hi", sender),
            sender: sender.to_string(),
            ts,
            message_id: id.to_string(),
        }
    }

    #[test]
    fn test_append_and_get_recent() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());

        store.append("chat:1", &entry("user", "Dana", 1, "m1")).unwrap();
        store
            .append("chat:1", &entry("assistant", "Aria", 2, "m2"))
            .unwrap();

        let recent = store.get_recent("chat:1", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message_id, "m1");
        assert_eq!(recent[1].message_id, "m2");
    }

    #[test]
    fn test_get_recent_dedups_by_message_id() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());

        store.append("chat:1", &entry("user", "Dana", 1, "dup")).unwrap();
        store.append("chat:1", &entry("user", "Dana", 1, "dup")).unwrap();

        assert_eq!(store.get_recent("chat:1", 10).len(), 1);
    }

    #[test]
    fn test_get_recent_tail_limits_count() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());
        for i in 0..5 {
            store
                .append("chat:1", &entry("user", "Dana", i, &format!("m{}", i)))
                .unwrap();
        }

        let recent = store.get_recent("chat:1", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message_id, "m3");
        assert_eq!(recent[1].message_id, "m4");
    }

    #[test]
    fn test_missing_transcript_returns_empty() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());
        assert!(store.get_recent("nope", 10).is_empty());
        assert_eq!(store.count_trailing_assistants("nope"), 0);
    }

    #[test]
    fn test_tolerant_of_malformed_trailing_line() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());
        store.append("chat:1", &entry("user", "Dana", 1, "m1")).unwrap();

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("chat_1.jsonl"))
            .unwrap();
        write!(file, "{{not valid json").unwrap();

        let recent = store.get_recent("chat:1", 10);
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_count_trailing_assistants() {
        let dir = tempdir().unwrap();
        let store = GroupTranscriptStore::new(dir.path());
        store.append("chat:1", &entry("user", "Dana", 1, "m1")).unwrap();
        store
            .append("chat:1", &entry("assistant", "Aria", 2, "m2"))
            .unwrap();
        store
            .append("chat:1", &entry("assistant", "Nova", 3, "m3"))
            .unwrap();

        assert_eq!(store.count_trailing_assistants("chat:1"), 2);
    }
}

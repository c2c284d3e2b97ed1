//! `Paths` — the agent-home layout, resolved once at startup.
//!
//! The group-chat subsystem (transcripts, relay, shared groups registry)
//! is constructed once per process and threaded through, rather than
//! recomputed via ad hoc globals the way [`crate::utils`] resolves a
//! single-agent's session/workspace paths. See DESIGN.md for why the two
//! styles coexist.

use std::path::{Path, PathBuf};

use crate::utils;

/// Bundles every filesystem location the group-chat and relay subsystems
/// need, rooted at a single agent-home directory.
///
/// Construct once (`Paths::new` or `Paths::default_for_agent`) and pass
/// by value/clone into `SessionManager`, `GroupTranscriptStore`, and
/// `GroupMessageRelay` constructors.
#[derive(Clone, Debug)]
pub struct Paths {
    /// Root of this agent's data directory (e.g. `~/.oxibot/`).
    home: PathBuf,
}

impl Paths {
    /// Build a `Paths` rooted at an explicit home directory.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Paths { home: home.into() }
    }

    /// Build a `Paths` rooted at the default agent-home (`~/.oxibot/`).
    pub fn default_for_agent() -> Self {
        Paths {
            home: utils::get_data_path(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn sessions(&self) -> PathBuf {
        self.home.join("sessions")
    }

    pub fn workspace(&self) -> PathBuf {
        self.home.join("workspace")
    }

    pub fn transcripts(&self) -> PathBuf {
        self.home.join("transcripts")
    }

    pub fn relay_dir(&self) -> PathBuf {
        self.home.join("relay")
    }

    pub fn relay_log(&self) -> PathBuf {
        self.relay_dir().join("outbound.jsonl")
    }

    pub fn relay_offsets_dir(&self) -> PathBuf {
        self.relay_dir().join("offsets")
    }

    pub fn relay_offset_file(&self, agent_name: &str) -> PathBuf {
        self.relay_offsets_dir()
            .join(format!("{}.txt", utils::safe_filename(agent_name)))
    }

    /// Path to the shared groups registry (e.g. `~/.oxibot/groups.json`).
    pub fn groups_registry(&self) -> PathBuf {
        self.home.join("groups.json")
    }

    /// Ensure every directory this `Paths` points at exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.sessions())?;
        std::fs::create_dir_all(self.workspace())?;
        std::fs::create_dir_all(self.transcripts())?;
        std::fs::create_dir_all(self.relay_offsets_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Paths::default_for_agent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_under_home() {
        let paths = Paths::new("/tmp/agenthome");
        assert_eq!(paths.sessions(), PathBuf::from("/tmp/agenthome/sessions"));
        assert_eq!(paths.workspace(), PathBuf::from("/tmp/agenthome/workspace"));
        assert_eq!(
            paths.transcripts(),
            PathBuf::from("/tmp/agenthome/transcripts")
        );
        assert_eq!(
            paths.relay_log(),
            PathBuf::from("/tmp/agenthome/relay/outbound.jsonl")
        );
    }

    #[test]
    fn test_relay_offset_file_sanitizes_name() {
        let paths = Paths::new("/tmp/agenthome");
        let offset = paths.relay_offset_file("Aria/bot");
        assert_eq!(
            offset,
            PathBuf::from("/tmp/agenthome/relay/offsets/Aria_bot.txt")
        );
    }

    #[test]
    fn test_groups_registry_is_home_relative() {
        let paths = Paths::new("/tmp/agenthome");
        assert_eq!(
            paths.groups_registry(),
            PathBuf::from("/tmp/agenthome/groups.json")
        );
    }

    #[test]
    fn test_ensure_dirs_creates_tree() {
        let dir = tempdir().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure_dirs().unwrap();

        assert!(paths.sessions().is_dir());
        assert!(paths.workspace().is_dir());
        assert!(paths.transcripts().is_dir());
        assert!(paths.relay_offsets_dir().is_dir());
    }
}

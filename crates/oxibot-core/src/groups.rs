//! Shared `groups.json` registry — the flat list of peers (bots and humans)
//! every agent in a host consults to learn about the others.
//!
//! One file, shared across agents (`<home>/groups.json`), loaded fresh on
//! each read since any agent's onboarding can append a new peer at any time.

use std::path::Path;

use tracing::warn;

use crate::types::GroupMember;

/// Load the shared groups registry. Missing or malformed files are treated
/// as an empty registry — this mirrors `Session load failure` policy: warn
/// and continue with a safe default rather than fail the caller.
pub fn load_groups(path: &Path) -> Vec<GroupMember> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read groups registry");
            }
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<GroupMember>>(&content) {
        Ok(members) => members,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse groups registry");
            Vec::new()
        }
    }
}

/// Save the shared groups registry (pretty-printed JSON array).
pub fn save_groups(path: &Path, members: &[GroupMember]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(members)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    std::fs::write(path, json)
}

/// Find this agent's own entry in the registry by elimination: the one
/// `member_type == "bot"` entry whose name isn't among the peers listed on
/// an incoming group message's `group_members` (which excludes self by
/// construction). Returns `None` if no such entry exists, or if more than
/// one bot is unaccounted for (ambiguous — caller should fall back).
pub fn find_self_by_elimination<'a>(
    registry: &'a [GroupMember],
    excluding: &[GroupMember],
) -> Option<&'a GroupMember> {
    let peer_names: std::collections::HashSet<&str> =
        excluding.iter().map(|m| m.name.as_str()).collect();

    let mut candidates = registry
        .iter()
        .filter(|m| m.is_bot() && !peer_names.contains(m.name.as_str()));

    let first = candidates.next()?;
    if candidates.next().is_some() {
        None
    } else {
        Some(first)
    }
}

//! Cross-process group relay — lets independently-running agent processes
//! on the same host see each other's group messages without a shared bus.
//!
//! Each agent process owns its own [`crate::bus::MessageBus`]; there is no
//! in-memory fan-out between processes. Instead, every outbound group
//! message is appended to one shared, append-only log
//! (`<home>/relay/outbound.jsonl`), and each agent tails that log from its
//! own remembered byte offset (`<home>/relay/offsets/<agent_name>.txt`).
//! Delivery is at-least-once: a subscriber that crashes after reading but
//! before advancing its offset will re-read and must dedup.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{InboundMessage, MessageBus};
use crate::groups::{find_self_by_elimination, load_groups};
use crate::transcript::{GroupTranscriptStore, TranscriptEntry};
use crate::types::GroupMember;

static RELAY_COUNTER: AtomicU32 = AtomicU32::new(0);

/// One message as it travels across the relay log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub relay_msg_id: String,
    /// `open_id` (or name, if no open id) of the agent that sent this.
    pub sender_bot_id: String,
    pub sender_name: String,
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Group roster at publish time, so a subscriber without its own copy
    /// of `groups.json` can still resolve peers.
    pub group_members: Vec<GroupMember>,
    pub ts_millis: i64,
}

/// Build a relay message id unique enough for dedup purposes: sender +
/// wall-clock millis + a per-process monotonic counter. No `rand`
/// dependency needed — the counter plus timestamp is already unique
/// within one process, and cross-process collisions would need the same
/// sender id and millisecond, which dedup-by-full-id tolerates anyway.
pub fn make_relay_msg_id(sender_bot_id: &str) -> String {
    let ts = chrono::Utc::now().timestamp_millis();
    let seq = RELAY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{sender_bot_id}:{ts}:{seq}")
}

/// Append-only relay log plus per-subscriber offset bookkeeping.
pub struct GroupMessageRelay {
    log_path: PathBuf,
    offsets_dir: PathBuf,
}

impl GroupMessageRelay {
    pub fn new(log_path: impl Into<PathBuf>, offsets_dir: impl Into<PathBuf>) -> Self {
        GroupMessageRelay {
            log_path: log_path.into(),
            offsets_dir: offsets_dir.into(),
        }
    }

    /// Append one envelope to the shared log.
    pub fn publish(&self, envelope: &RelayEnvelope) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(envelope)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)
    }

    fn offset_path(&self, subscriber_id: &str) -> PathBuf {
        self.offsets_dir
            .join(format!("{}.txt", crate::utils::safe_filename(subscriber_id)))
    }

    fn read_offset(&self, subscriber_id: &str) -> u64 {
        std::fs::read_to_string(self.offset_path(subscriber_id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Advance this subscriber's offset atomically (write-temp-then-rename,
    /// so a crash mid-write never leaves a torn offset file).
    fn write_offset(&self, subscriber_id: &str, offset: u64) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.offsets_dir)?;
        let final_path = self.offset_path(subscriber_id);
        let tmp_path = final_path.with_extension("txt.tmp");
        std::fs::write(&tmp_path, offset.to_string())?;
        std::fs::rename(&tmp_path, &final_path)
    }

    /// Read every envelope appended since this subscriber last advanced,
    /// then advance its offset past them. Tolerates a malformed or
    /// truncated trailing line (the writer may be mid-append) by stopping
    /// before it and leaving the offset at the last complete line, so the
    /// partial line gets re-read (and hopefully completed) next poll.
    pub fn read_new_messages(&self, subscriber_id: &str) -> std::io::Result<Vec<RelayEnvelope>> {
        let mut file = match std::fs::File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let start_offset = self.read_offset(subscriber_id);
        let file_len = file.metadata()?.len();
        if start_offset >= file_len {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(start_offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut envelopes = Vec::new();
        let mut consumed: u64 = 0;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                // Partial trailing line — stop here, don't advance past it.
                break;
            }
            let trimmed = line.trim_end_matches('\n');
            consumed += line.len() as u64;
            if trimmed.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RelayEnvelope>(trimmed) {
                Ok(env) => envelopes.push(env),
                Err(e) => warn!(error = %e, "skipping malformed relay line"),
            }
        }

        self.write_offset(subscriber_id, start_offset + consumed)?;
        Ok(envelopes)
    }
}

/// Background poller that tails the relay log and re-injects messages from
/// other agent processes into this process's own inbound bus, as if they
/// had arrived over the channel natively.
pub struct RelaySubscriber {
    relay: GroupMessageRelay,
    transcript: GroupTranscriptStore,
    self_id: String,
    self_display_name: String,
    groups_registry_path: PathBuf,
    /// Bounded recent-id window for at-least-once dedup: keeps the newest
    /// 500 of the last 1000 ids seen, mirroring the channel adapters'
    /// own dedup-cache sizing.
    seen: VecDeque<String>,
}

const DEDUP_TRIM_TO: usize = 500;
const DEDUP_MAX: usize = 1000;

impl RelaySubscriber {
    pub fn new(
        relay: GroupMessageRelay,
        transcript: GroupTranscriptStore,
        self_id: impl Into<String>,
        self_display_name: impl Into<String>,
        groups_registry_path: impl Into<PathBuf>,
    ) -> Self {
        RelaySubscriber {
            relay,
            transcript,
            self_id: self_id.into(),
            self_display_name: self_display_name.into(),
            groups_registry_path: groups_registry_path.into(),
            seen: VecDeque::new(),
        }
    }

    fn already_seen(&mut self, id: &str) -> bool {
        if self.seen.iter().any(|s| s == id) {
            return true;
        }
        self.seen.push_back(id.to_string());
        if self.seen.len() > DEDUP_MAX {
            let drop = self.seen.len() - DEDUP_TRIM_TO;
            self.seen.drain(0..drop);
        }
        false
    }

    /// Decide whether the envelope's content actually @-mentions this
    /// agent. Never trusts a mention flag embedded upstream in the
    /// envelope itself — each subscriber recomputes it fresh from the raw
    /// text, since the sender's notion of "mentioned" may not match this
    /// agent's own display name. Matches either a plain `@<display_name>`
    /// token or a channel-native `<at id=<self_bot_id>` marker (Feishu
    /// encodes mentions this way rather than resolving the display name
    /// into the text).
    fn content_mentions_self(&self, content: &str) -> bool {
        let name_marker = format!("@{}", self.self_display_name);
        let at_marker = format!("<at id={}", self.self_id);
        content.contains(&name_marker) || content.contains(&at_marker)
    }

    /// Poll the relay log once, re-injecting any new, non-self-authored,
    /// not-already-seen envelopes into `bus` as inbound messages.
    pub async fn poll_once(&mut self, bus: &MessageBus) -> std::io::Result<usize> {
        let envelopes = self.relay.read_new_messages(&self.self_id)?;
        let registry = load_groups(&self.groups_registry_path);
        let mut delivered = 0;

        for env in envelopes {
            if env.sender_bot_id == self.self_id {
                continue;
            }
            if self.already_seen(&env.relay_msg_id) {
                continue;
            }

            // §4.5 step 3: append to the shared transcript before (or
            // regardless of) whether this agent goes on to respond, so the
            // peer's turn survives even if local routing skips it.
            let _ = self.transcript.append(
                &env.session_key,
                &TranscriptEntry {
                    role: "assistant".into(),
                    content: env.content.clone(),
                    sender: env.sender_name.clone(),
                    ts: env.ts_millis,
                    message_id: env.relay_msg_id.clone(),
                },
            );

            let is_mentioned = self.content_mentions_self(&env.content);
            let mut msg = InboundMessage::new(
                env.channel.clone(),
                env.sender_bot_id.clone(),
                env.chat_id.clone(),
                env.content.clone(),
            );
            msg.metadata
                .insert("chat_type".into(), serde_json::json!("group"));
            msg.metadata
                .insert("from_bot".into(), serde_json::json!(true));
            msg.metadata
                .insert("is_mentioned".into(), serde_json::json!(is_mentioned));
            msg.metadata.insert(
                "sender_agent_name".into(),
                serde_json::json!(env.sender_name),
            );
            msg.metadata
                .insert("message_id".into(), serde_json::json!(env.relay_msg_id));
            // `group_policy := existing or "auto"` — the envelope carries no
            // policy of its own, so a relayed bot-to-bot turn always falls
            // back to "auto" rather than the metadata-absent default "open".
            msg.metadata
                .insert("group_policy".into(), serde_json::json!("auto"));

            let peers: Vec<GroupMember> = if env.group_members.is_empty() {
                registry
                    .iter()
                    .filter(|m| m.name != self.self_id && m.name != self.self_display_name)
                    .cloned()
                    .collect()
            } else {
                env.group_members.clone()
            };
            msg.metadata
                .insert("group_members".into(), serde_json::to_value(&peers).unwrap_or_default());

            if bus.publish_inbound(msg).await.is_ok() {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Resolve this subscriber's own registry entry, for callers that only
    /// know a chat's peer list and need to find "which one is me".
    pub fn resolve_self<'a>(&self, registry: &'a [GroupMember], peers: &[GroupMember]) -> Option<&'a GroupMember> {
        find_self_by_elimination(registry, peers)
    }
}

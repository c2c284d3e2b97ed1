//! Group-chat routing filter — the depth cap, mention policy, and LLM
//! relevance gate that keep bots from talking past each other in a room.

use std::sync::Arc;

use async_trait::async_trait;
use oxibot_core::bus::InboundMessage;
use oxibot_core::routing::{RouteDecision, RoutingFilter, SessionContext};
use oxibot_core::types::{GroupMember, Message};
use oxibot_providers::{LlmProvider, LlmRequestConfig};

/// Configuration for the depth cap and LLM gate, mirroring
/// `config.routing` in `oxibot-core::config`.
#[derive(Clone, Debug)]
pub struct GroupChatConfig {
    pub max_bot_reply_depth: u32,
    pub bot_reply_llm_threshold: u32,
    pub bot_reply_llm_check: bool,
}

impl Default for GroupChatConfig {
    fn default() -> Self {
        GroupChatConfig {
            max_bot_reply_depth: 8,
            bot_reply_llm_threshold: 3,
            bot_reply_llm_check: true,
        }
    }
}

/// The principal group-chat routing filter: @mention policy, bot-to-bot
/// depth cap, LLM relevance gate, and the system-prompt/reminder
/// contributions that keep a bot from over-@mentioning its peers.
pub struct GroupChatFilter {
    config: GroupChatConfig,
    provider: Arc<dyn LlmProvider>,
    model: String,
    self_description: String,
}

impl GroupChatFilter {
    pub fn new(
        config: GroupChatConfig,
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        self_description: impl Into<String>,
    ) -> Self {
        GroupChatFilter {
            config,
            provider,
            model: model.into(),
            self_description: truncate(&self_description.into(), 300),
        }
    }

    async fn llm_gate(&self, msg: &InboundMessage, ctx: &SessionContext) -> bool {
        let peers = msg.group_members();
        let peer_listing = peers
            .iter()
            .map(|p| format!("- @{} ({}){}", p.name, p.member_type, describe(p)))
            .collect::<Vec<_>>()
            .join("\n");

        let history = ctx
            .recent_for_prompt
            .iter()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>();
        let history_tail: Vec<_> = history.iter().rev().take(8).collect::<Vec<_>>();
        let history_text = history_tail
            .iter()
            .rev()
            .map(|t| format!("{} ({}): {}", t.role, t.sender, truncate(&t.content, 100)))
            .collect::<Vec<_>>()
            .join("\n");

        let preview = truncate(&msg.content, 300);

        let prompt = format!(
            "You are deciding whether to respond to a group-chat message.\n\n\
            Your identity: {self_desc}\n\n\
            Peers in this chat:\n{peers}\n\n\
            Recent conversation:\n{history}\n\n\
            Incoming message: \"{preview}\"\n\n\
            Rules: if the message comes from another bot, only answer YES if it is \
            directly asking for your help or expertise. If the message comes from a \
            human who did not mention you, only answer YES if the content clearly \
            concerns your responsibilities. Reply with exactly one word: YES or NO.",
            self_desc = self.self_description,
            peers = peer_listing,
            history = history_text,
            preview = preview,
        );

        let messages = vec![Message::user(prompt)];
        let config = LlmRequestConfig {
            max_tokens: 64,
            temperature: 0.0,
        };
        let response = self.provider.chat(&messages, None, &self.model, &config).await;

        let combined = format!(
            "{} {}",
            response.content.unwrap_or_default(),
            response.reasoning_content.unwrap_or_default()
        )
        .trim()
        .to_uppercase();

        // Empty output (or a provider error surfaced as empty content) has no
        // opinion — fall back to the conservative/charitable default. A
        // non-empty answer that never says YES is a definite NO, not a
        // default case, even for a human sender.
        if combined.is_empty() {
            return !msg.from_bot();
        }

        let last_yes = combined.rfind("YES");
        let last_no = combined.rfind("NO");

        match (last_yes, last_no) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(y), Some(n)) => y > n,
        }
    }
}

fn describe(member: &GroupMember) -> String {
    match &member.description {
        Some(d) if !d.is_empty() => format!(" - {}", truncate(d, 300)),
        _ => String::new(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

const MENTION_HINT_UNKNOWN: &str = "a-peer";

fn first_bot_name(peers: &[GroupMember]) -> &str {
    peers
        .iter()
        .find(|p| p.is_bot())
        .map(|p| p.name.as_str())
        .unwrap_or(MENTION_HINT_UNKNOWN)
}

#[async_trait]
impl RoutingFilter for GroupChatFilter {
    async fn should_respond(&self, msg: &InboundMessage, ctx: &SessionContext) -> RouteDecision {
        if msg.chat_type() != Some("group") {
            return RouteDecision::Abstain;
        }

        let from_bot = msg.from_bot();
        let mentioned = msg.is_mentioned();
        let policy = msg.group_policy();

        if from_bot {
            let depth = ctx.trailing_bot_count + 1;
            if depth as u32 >= self.config.max_bot_reply_depth {
                return RouteDecision::Skip;
            }
            if !mentioned {
                return RouteDecision::Skip;
            }
            if mentioned
                && (depth as u32 <= self.config.bot_reply_llm_threshold
                    || !self.config.bot_reply_llm_check)
            {
                return RouteDecision::Respond;
            }
            // else fall through to LLM gate below
        } else if policy == "open" || mentioned {
            return RouteDecision::Respond;
        }
        // policy == "mention" or "auto" (or unrecognised) fall through to the gate

        if self.llm_gate(msg, ctx).await {
            RouteDecision::Respond
        } else {
            RouteDecision::Skip
        }
    }

    fn prompt_extras(&self, msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
        if msg.chat_type() != Some("group") {
            return None;
        }
        let peers = msg.group_members();
        if peers.is_empty() {
            return None;
        }

        let peer_listing = peers
            .iter()
            .map(|p| format!("- @{} ({}){}", p.name, p.member_type, describe(p)))
            .collect::<Vec<_>>()
            .join("\n");

        let mention_hint = first_bot_name(&peers);

        let policy_text = if msg.from_bot() {
            format!(
                "Mention policy (light): only relay to another participant by explicit \
                request from the current message. Do not chain-summon other bots. \
                Use `@{mention_hint}` syntax when you do need to address someone."
            )
        } else {
            format!(
                "Mention policy (strict): never @-mention another bot unless (i) you \
                need them to execute a task, (ii) your next step depends on their \
                result, or (iii) there is no alternative. Use `@{mention_hint}` syntax \
                when you do."
            )
        };

        Some(format!(
            "You are in a group chat with the following participants:\n{peer_listing}\n\n{policy_text}"
        ))
    }

    fn user_reminder(&self, msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
        if msg.chat_type() != Some("group") || msg.group_members().is_empty() {
            return None;
        }
        Some(
            "This is a group chat — answer only the part directed at you, do not answer \
            for others, and do not @-mention anyone unless necessary."
                .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxibot_core::types::LlmResponse;
    use serde_json::json;

    struct MockGate(&'static str);

    #[async_trait]
    impl LlmProvider for MockGate {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[oxibot_core::types::ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            LlmResponse {
                content: Some(self.0.to_string()),
                ..Default::default()
            }
        }

        fn default_model(&self) -> &str {
            "mock"
        }

        fn display_name(&self) -> &str {
            "mock"
        }
    }

    fn group_msg(content: &str) -> InboundMessage {
        let mut msg = InboundMessage::new("feishu", "u1", "oc_1", content);
        msg.metadata.insert("chat_type".into(), json!("group"));
        msg
    }

    fn filter_with(gate_reply: &'static str) -> GroupChatFilter {
        GroupChatFilter::new(
            GroupChatConfig::default(),
            Arc::new(MockGate(gate_reply)),
            "mock-model",
            "Aria, a scheduling assistant.",
        )
    }

    #[tokio::test]
    async fn test_non_group_abstains() {
        let filter = filter_with("YES");
        let msg = InboundMessage::new("cli", "u1", "direct", "hi");
        let ctx = SessionContext::default();
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Abstain
        );
    }

    #[tokio::test]
    async fn test_s2_group_mentioned_no_gate_call() {
        let filter = filter_with("NO"); // if the gate were called, it would say skip
        let mut msg = group_msg("@Aria ping");
        msg.metadata.insert("is_mentioned".into(), json!(true));
        msg.metadata.insert("group_policy".into(), json!("mention"));
        let ctx = SessionContext::default();
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Respond
        );
    }

    #[tokio::test]
    async fn test_s3_group_open_not_mentioned() {
        let filter = filter_with("NO");
        let mut msg = group_msg("anything");
        msg.metadata.insert("is_mentioned".into(), json!(false));
        msg.metadata.insert("group_policy".into(), json!("open"));
        let ctx = SessionContext::default();
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Respond
        );
    }

    #[tokio::test]
    async fn test_s4_bot_depth_cap_hit() {
        let filter = filter_with("YES"); // gate would say respond but depth cap wins first
        let mut msg = group_msg("@Aria help");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert("is_mentioned".into(), json!(true));
        let ctx = SessionContext {
            trailing_bot_count: 7,
            recent_for_prompt: Vec::new(),
        };
        assert_eq!(filter.should_respond(&msg, &ctx).await, RouteDecision::Skip);
    }

    #[tokio::test]
    async fn test_s5_bot_below_threshold_no_gate() {
        let filter = filter_with("NO"); // if gate were consulted, it would skip
        let mut msg = group_msg("@Aria help");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert("is_mentioned".into(), json!(true));
        let ctx = SessionContext {
            trailing_bot_count: 1,
            recent_for_prompt: Vec::new(),
        };
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Respond
        );
    }

    #[tokio::test]
    async fn test_bot_not_mentioned_skips() {
        let filter = filter_with("YES");
        let mut msg = group_msg("chatting");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert("is_mentioned".into(), json!(false));
        let ctx = SessionContext::default();
        assert_eq!(filter.should_respond(&msg, &ctx).await, RouteDecision::Skip);
    }

    #[tokio::test]
    async fn test_bot_mentioned_above_threshold_falls_to_gate() {
        let filter = filter_with("YES");
        let mut msg = group_msg("@Aria help");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert("is_mentioned".into(), json!(true));
        let ctx = SessionContext {
            trailing_bot_count: 4, // depth = 5, above threshold of 3
            recent_for_prompt: Vec::new(),
        };
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Respond
        );
    }

    #[tokio::test]
    async fn test_human_mention_policy_falls_to_gate() {
        let filter = filter_with("NO");
        let mut msg = group_msg("random chit chat");
        msg.metadata.insert("is_mentioned".into(), json!(false));
        msg.metadata.insert("group_policy".into(), json!("auto"));
        let ctx = SessionContext::default();
        assert_eq!(filter.should_respond(&msg, &ctx).await, RouteDecision::Skip);
    }

    #[tokio::test]
    async fn test_gate_empty_output_defaults_conservative_for_bot() {
        let filter = filter_with(""); // neither YES nor NO
        let mut msg = group_msg("@Aria help");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert("is_mentioned".into(), json!(true));
        let ctx = SessionContext {
            trailing_bot_count: 4,
            recent_for_prompt: Vec::new(),
        };
        assert_eq!(filter.should_respond(&msg, &ctx).await, RouteDecision::Skip);
    }

    #[tokio::test]
    async fn test_gate_empty_output_defaults_charitable_for_human() {
        let filter = filter_with("");
        let mut msg = group_msg("random chit chat");
        msg.metadata.insert("is_mentioned".into(), json!(false));
        msg.metadata.insert("group_policy".into(), json!("auto"));
        let ctx = SessionContext::default();
        assert_eq!(
            filter.should_respond(&msg, &ctx).await,
            RouteDecision::Respond
        );
    }

    #[test]
    fn test_prompt_extras_includes_strict_policy_for_human_sender() {
        let filter = filter_with("YES");
        let mut msg = group_msg("hi");
        msg.metadata.insert(
            "group_members".into(),
            json!([{"name": "Nova", "type": "bot", "description": "search"}]),
        );
        let ctx = SessionContext::default();
        let extras = filter.prompt_extras(&msg, &ctx).unwrap();
        assert!(extras.contains("strict"));
        assert!(extras.contains("@Nova"));
    }

    #[test]
    fn test_prompt_extras_includes_light_policy_for_bot_sender() {
        let filter = filter_with("YES");
        let mut msg = group_msg("hi");
        msg.metadata.insert("from_bot".into(), json!(true));
        msg.metadata.insert(
            "group_members".into(),
            json!([{"name": "Nova", "type": "bot", "description": "search"}]),
        );
        let ctx = SessionContext::default();
        let extras = filter.prompt_extras(&msg, &ctx).unwrap();
        assert!(extras.contains("light"));
    }

    #[test]
    fn test_user_reminder_present_in_group_with_members() {
        let filter = filter_with("YES");
        let mut msg = group_msg("hi");
        msg.metadata.insert(
            "group_members".into(),
            json!([{"name": "Nova", "type": "bot"}]),
        );
        let ctx = SessionContext::default();
        assert!(filter.user_reminder(&msg, &ctx).is_some());
    }

    #[test]
    fn test_no_prompt_extras_without_group_members() {
        let filter = filter_with("YES");
        let msg = group_msg("hi");
        let ctx = SessionContext::default();
        assert!(filter.prompt_extras(&msg, &ctx).is_none());
    }
}

//! Routing filter chain — the ordered set of gates an inbound message must
//! clear before the agent bothers calling an LLM on it.
//!
//! The group-chat relevance gate ([`crate::groups`] + the group-chat
//! filter living in `oxibot-agent`, since it needs an `LlmProvider`) is
//! the prototypical filter, but the chain is deliberately generic: any
//! future gate (rate limiting, blocklists, business hours) plugs in the
//! same way, as a `RoutingFilter` appended to the chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::InboundMessage;
use crate::session::PromptTurn;

/// What a single filter thinks should happen to this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// This filter has an opinion: answer.
    Respond,
    /// This filter has an opinion: stay silent.
    Skip,
    /// This filter has no opinion; defer to the next filter in the chain.
    Abstain,
}

/// A read-only snapshot of session state a filter may need, decoupling
/// `RoutingFilter` implementations from the concrete session storage
/// backend (`SessionManager` or `GroupTranscriptStore`).
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Trailing run of bot/assistant turns at the end of this chat's history.
    pub trailing_bot_count: usize,
    /// Recent turns formatted for prompt assembly.
    pub recent_for_prompt: Vec<PromptTurn>,
}

/// One gate in the routing chain.
#[async_trait]
pub trait RoutingFilter: Send + Sync {
    /// Decide whether to respond to `msg`. Filters are evaluated in
    /// order; the first non-`Abstain` verdict wins.
    async fn should_respond(&self, msg: &InboundMessage, ctx: &SessionContext) -> RouteDecision;

    /// Extra system-prompt material this filter wants injected when it
    /// (or a later filter) decides to respond — e.g. "you are in a group
    /// chat with: Nova, Dana" framing. Called regardless of which filter
    /// produced the gating decision.
    fn prompt_extras(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
        None
    }

    /// Extra reminder text appended near the user turn itself (e.g.
    /// "reply briefly, this is a group chat") rather than the system
    /// prompt.
    fn user_reminder(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
        None
    }
}

/// An ordered list of filters, evaluated first-non-abstain-wins, with
/// contributions from every filter aggregated once gating approves.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RoutingFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain {
            filters: Vec::new(),
        }
    }

    pub fn push(mut self, filter: Arc<dyn RoutingFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn add(&mut self, filter: Arc<dyn RoutingFilter>) {
        self.filters.push(filter);
    }

    /// Run the chain. Defaults to `Respond` if every filter abstains (an
    /// empty chain always responds — filters opt a message out, they
    /// don't need to opt every other message in).
    pub async fn should_respond(&self, msg: &InboundMessage, ctx: &SessionContext) -> RouteDecision {
        for filter in &self.filters {
            match filter.should_respond(msg, ctx).await {
                RouteDecision::Abstain => continue,
                decision => return decision,
            }
        }
        RouteDecision::Respond
    }

    /// Join every filter's non-empty prompt-extras contribution.
    pub fn collect_prompt_extras(&self, msg: &InboundMessage, ctx: &SessionContext) -> Option<String> {
        let parts: Vec<String> = self
            .filters
            .iter()
            .filter_map(|f| f.prompt_extras(msg, ctx))
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Join every filter's non-empty user-reminder contribution.
    pub fn collect_user_reminders(&self, msg: &InboundMessage, ctx: &SessionContext) -> Option<String> {
        let parts: Vec<String> = self
            .filters
            .iter()
            .filter_map(|f| f.user_reminder(msg, ctx))
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(RouteDecision);

    #[async_trait]
    impl RoutingFilter for Always {
        async fn should_respond(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> RouteDecision {
            self.0
        }
    }

    struct Abstaining;

    #[async_trait]
    impl RoutingFilter for Abstaining {
        async fn should_respond(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> RouteDecision {
            RouteDecision::Abstain
        }

        fn prompt_extras(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
            Some("extra framing".to_string())
        }

        fn user_reminder(&self, _msg: &InboundMessage, _ctx: &SessionContext) -> Option<String> {
            Some("be brief".to_string())
        }
    }

    fn msg() -> InboundMessage {
        InboundMessage::new("cli", "user", "default", "hi")
    }

    #[tokio::test]
    async fn test_empty_chain_defaults_to_respond() {
        let chain = FilterChain::new();
        let ctx = SessionContext::default();
        assert_eq!(chain.should_respond(&msg(), &ctx).await, RouteDecision::Respond);
    }

    #[tokio::test]
    async fn test_all_abstain_defaults_to_respond() {
        let chain = FilterChain::new().push(Arc::new(Abstaining));
        let ctx = SessionContext::default();
        assert_eq!(chain.should_respond(&msg(), &ctx).await, RouteDecision::Respond);
    }

    #[tokio::test]
    async fn test_first_non_abstain_wins() {
        let chain = FilterChain::new()
            .push(Arc::new(Abstaining))
            .push(Arc::new(Always(RouteDecision::Skip)))
            .push(Arc::new(Always(RouteDecision::Respond)));
        let ctx = SessionContext::default();
        assert_eq!(chain.should_respond(&msg(), &ctx).await, RouteDecision::Skip);
    }

    #[tokio::test]
    async fn test_prompt_extras_and_reminders_aggregate_despite_abstain() {
        let chain = FilterChain::new()
            .push(Arc::new(Abstaining))
            .push(Arc::new(Always(RouteDecision::Respond)));
        let ctx = SessionContext::default();
        assert_eq!(
            chain.collect_prompt_extras(&msg(), &ctx),
            Some("extra framing".to_string())
        );
        assert_eq!(
            chain.collect_user_reminders(&msg(), &ctx),
            Some("be brief".to_string())
        );
    }
}

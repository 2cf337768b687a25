//! Message Router (§4.7): derives recipients under the active protocol,
//! constructs provider requests, applies protocol-specific filtering, and
//! retries provider failures with backoff.
//!
//! Retry/backoff is grounded on `core/src/agent/runtime/impls/retry.rs`'s
//! `RetryConfig::delay_for_attempt` exponential-backoff formula, adapted to
//! the spec's fixed schedule (base 500ms, factor 2, 3 retries, cap 30s).
//! The system preamble assembly is grounded on
//! `core/src/config::build_system_prompt`'s role-aware prompt construction,
//! generalized to use Agent role + personality instead of tool lists.

use crate::agent_manager::AgentManager;
use crate::conversation::ConversationManager;
use crate::error::{HubError, Result};
use crate::event_bus::{ConversationEvent, EventBus, HubEvent};
use crate::ids::AgentId;
use crate::ids::ParticipantId;
use crate::ids::ConversationId;
use crate::provider::{ChatMessage, CompletionRequest, ProviderRegistry};
use crate::types::{Agent, AuthorKind, Conversation, Message, TaskStatus};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub factor: f64,
    /// Number of retries attempted after the initial request (so the total
    /// request count for a run of terminal `Timeout`s is `max_retries + 1`,
    /// matching S3's "four log entries" for a 3-retry schedule).
    pub max_retries: u32,
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { base_ms: 500, factor: 2.0, max_retries: 3, cap_ms: 30_000 }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_ms as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(scaled.min(self.cap_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Capability tags declared on the incoming prompt, used by the
    /// `specialist` protocol to pick agents whose capabilities intersect.
    pub capability_tags: Vec<String>,
    /// Whether this utterance is a critique, used by `brainstorm` to reject
    /// critiques during the divergent phase.
    pub is_critique: bool,
}

pub struct MessageRouter {
    conversations: Arc<ConversationManager>,
    agents: Arc<AgentManager>,
    providers: Arc<ProviderRegistry>,
    event_bus: Arc<EventBus>,
    retry: RetryConfig,
    window: usize,
    provider_deadline: Duration,
}

impl MessageRouter {
    pub fn new(
        conversations: Arc<ConversationManager>,
        agents: Arc<AgentManager>,
        providers: Arc<ProviderRegistry>,
        event_bus: Arc<EventBus>,
        retry: RetryConfig,
        window: usize,
        provider_deadline: Duration,
    ) -> Self {
        Self { conversations, agents, providers, event_bus, retry, window, provider_deadline }
    }

    /// Handles one newly-authored utterance: validates it against the
    /// active protocol, appends it, derives recipients, and dispatches
    /// provider requests — returning every agent/system Message produced.
    pub async fn handle_incoming(
        &self,
        conversation_id: &ConversationId,
        author_id: ParticipantId,
        author_kind: AuthorKind,
        body: String,
        context: DispatchContext,
    ) -> Result<Vec<Message>> {
        let conversation = self.conversations.get(conversation_id).await?;
        let type_tag = conversation.conversation_type.clone();

        if type_tag == "debate" && protocols::is_late_debate_submission(&conversation, Utc::now()) {
            tracing::debug!(conversation = %conversation_id, author = %author_id, "debate: dropping late submission silently");
            return Ok(Vec::new());
        }

        if let Err(reject_reason) = protocols::validate_incoming(&type_tag, &conversation, &author_id, &body, &context) {
            self.event_bus
                .publish(HubEvent::Conversation(ConversationEvent {
                    type_tag: "message_rejected".into(),
                    timestamp: Utc::now(),
                    producer_id: "message_router".into(),
                    conversation_id: conversation_id.clone(),
                    payload: json!({ "reason": reject_reason }),
                }))
                .await;
            return Err(HubError::InvalidState { message: reject_reason });
        }

        if protocols::is_strict_turn(&type_tag) {
            self.conversations.check_turn(conversation_id, &author_id).await?;
        }

        self.conversations.add_message(conversation_id, author_id.clone(), author_kind, body).await?;
        if protocols::is_strict_turn(&type_tag) {
            self.conversations.advance_turn(conversation_id).await?;
        }

        // Recipients and their Agent records are resolved once from this
        // snapshot; every recipient dispatched below builds its provider
        // prefix from this same pre-round `conversation`, so agents in a
        // democratic/ensemble/competitive round never see each other's
        // answers before their own request is built.
        let conversation = self.conversations.get(conversation_id).await?;
        let agents_by_id = self.agents_by_participant(&conversation).await;
        let recipients = protocols::derive_recipients(&type_tag, &conversation, &author_id, &context, &agents_by_id);

        let time_limit = if type_tag == "competitive" {
            Some(Duration::from_secs(conversation.settings.get("time_limit_seconds").and_then(|v| v.as_u64()).unwrap_or(60)))
        } else {
            None
        };

        let mut produced = Vec::with_capacity(recipients.len());
        for agent_id in recipients {
            let Some(agent) = agents_by_id.get(&agent_id) else { continue };
            let dispatch = self.dispatch_to_agent(conversation_id, &conversation, agent);
            match time_limit {
                Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                    Ok(result) => produced.push(result?),
                    Err(_) => tracing::warn!(agent = %agent_id, "competitive: agent missed the time limit, excluded from scoring"),
                },
                None => produced.push(dispatch.await?),
            }
        }

        match type_tag.as_str() {
            "consensus" => self.evaluate_consensus_round(conversation_id, &conversation, &produced).await?,
            "ensemble" => self.refine_ensemble(conversation_id, &conversation, &agents_by_id, &mut produced).await?,
            "competitive" => self.score_competitive(conversation_id, &produced).await?,
            _ => {}
        }

        Ok(produced)
    }

    /// Resolves every active agent participant's `Agent` record once per
    /// dispatch, so `derive_recipients`' capability/role filtering and the
    /// dispatch loop below don't each re-query the Agent Manager.
    async fn agents_by_participant(&self, conversation: &Conversation) -> HashMap<AgentId, Agent> {
        let mut agents_by_id = HashMap::new();
        for entry in &conversation.turn_order {
            let agent_id = AgentId::new(entry.participant_id.as_str());
            if let Ok(agent) = self.agents.get(&agent_id).await {
                agents_by_id.insert(agent_id, agent);
            }
        }
        agents_by_id
    }

    /// Runs the designated synthesizer over `refinement_rounds` passes once
    /// the initial per-agent answers are in, appending one agent Message per
    /// pass and feeding each pass the previous one's output (§4.6 ensemble:
    /// "designated synthesizer ... refines").
    async fn refine_ensemble(
        &self,
        conversation_id: &ConversationId,
        conversation: &Conversation,
        agents_by_id: &HashMap<AgentId, Agent>,
        produced: &mut Vec<Message>,
    ) -> Result<()> {
        if produced.is_empty() {
            return Ok(());
        }
        let agent_participants: Vec<AgentId> = conversation
            .turn_order
            .iter()
            .filter(|e| e.active)
            .map(|e| AgentId::new(e.participant_id.as_str()))
            .collect();
        let Some(synthesizer) = protocols::ensemble_synthesizer(&agent_participants, agents_by_id, conversation) else {
            return Ok(());
        };
        let Some(agent) = agents_by_id.get(&synthesizer) else { return Ok(()) };
        let refinement_rounds = conversation.settings.get("refinement_rounds").and_then(|v| v.as_u64()).unwrap_or(3);

        for round in 0..refinement_rounds {
            tracing::debug!(conversation = %conversation_id, round, "ensemble: synthesizer refinement pass");
            let current = self.conversations.get(conversation_id).await?;
            let msg = self.dispatch_to_agent(conversation_id, &current, agent).await?;
            produced.push(msg);
        }
        Ok(())
    }

    /// Scores each competitor's answer by word count and appends a system
    /// Message naming the winner (§4.6 competitive: "a scoring step ranks;
    /// highest wins").
    async fn score_competitive(&self, conversation_id: &ConversationId, produced: &[Message]) -> Result<()> {
        let Some(winner) = produced.iter().max_by_key(|m| m.body.split_whitespace().count()) else {
            return Ok(());
        };
        let summary = format!("Competitive round winner: {} (score {})", winner.author_id, winner.body.split_whitespace().count());
        self.conversations.add_message(conversation_id, "system".into(), AuthorKind::System, summary).await?;
        Ok(())
    }

    /// Tallies one consensus round's votes and ends the conversation once
    /// the agree-ratio reaches `consensus_threshold` or `max_rounds` is hit
    /// (§4.6, §8 S6). Abstentions (neither "agree" nor "disagree" in the
    /// response body) count as disagreement per the documented resolution.
    async fn evaluate_consensus_round(&self, conversation_id: &ConversationId, conversation: &Conversation, produced: &[Message]) -> Result<()> {
        if produced.is_empty() {
            return Ok(());
        }
        let threshold = conversation.settings.get("consensus_threshold").and_then(|v| v.as_f64()).unwrap_or(0.8);
        let max_rounds = conversation.settings.get("max_rounds").and_then(|v| v.as_u64()).unwrap_or(10);

        let agree_count = produced
            .iter()
            .filter(|m| m.author_kind == AuthorKind::Agent && m.body.to_lowercase().contains("agree") && !m.body.to_lowercase().contains("disagree"))
            .count();
        let ratio = agree_count as f64 / produced.len() as f64;
        let round = self.conversations.increment_round(conversation_id).await?;

        if ratio >= threshold {
            self.conversations.end_with_reason(conversation_id, "ConsensusReached").await?;
        } else if round >= max_rounds {
            self.conversations.end_with_reason(conversation_id, "MaxRoundsReached").await?;
        }
        Ok(())
    }

    /// Builds the provider request for `agent` from the conversation
    /// history, retries transient failures, and appends exactly one
    /// Message — agent on success, system on terminal failure (§4.7, §8
    /// property 7).
    async fn dispatch_to_agent(&self, conversation_id: &ConversationId, conversation: &Conversation, agent: &Agent) -> Result<Message> {
        let messages = self.build_prefix(conversation, agent);
        let task_id = self.agents.assign_task(&agent.id, "respond", "route dispatch", 0).await?;
        self.agents.start_task(&task_id).await?;

        let mut attempt = 0u32;
        let started = std::time::Instant::now();
        loop {
            let request = CompletionRequest {
                model: agent.model_id.clone(),
                messages: messages.clone(),
                max_tokens: agent.max_tokens,
                temperature: agent.temperature,
                deadline: self.provider_deadline,
                idempotency_key: None,
            };
            let provider = self.providers.get(&agent.provider_id).await?;
            match provider.complete(request).await {
                Ok(response) => {
                    self.agents
                        .complete_task(&task_id, TaskStatus::Completed, started.elapsed().as_millis() as f64, Ok(response.body.clone()), None)
                        .await?;
                    return self
                        .conversations
                        .add_message(conversation_id, agent.id.clone().into(), AuthorKind::Agent, response.body)
                        .await;
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    tracing::debug!(agent = %agent.id, attempt, error = %err, "provider call failed, retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.agents
                        .complete_task(&task_id, TaskStatus::Failed, started.elapsed().as_millis() as f64, Err(err.to_string()), None)
                        .await?;
                    let summary = format!("{}: {}", err.kind(), err.user_message());
                    return self
                        .conversations
                        .add_message(conversation_id, "system".into(), AuthorKind::System, summary)
                        .await;
                }
            }
        }
    }

    /// Assembles the last `window` messages plus a role/personality system
    /// preamble, grounded on the teacher's `build_system_prompt` shape.
    fn build_prefix(&self, conversation: &Conversation, agent: &Agent) -> Vec<ChatMessage> {
        let preamble = format!(
            "You are {}, acting as a {} with a {} communication style in conversation \"{}\".",
            agent.display_name, agent.role, agent.personality, conversation.subject
        );
        let mut out = vec![ChatMessage { role: "system".into(), content: preamble }];
        let start = conversation.messages.len().saturating_sub(self.window);
        for message in &conversation.messages[start..] {
            let role = match message.author_kind {
                AuthorKind::Agent if message.author_id.as_str() == agent.id.as_str() => "assistant",
                AuthorKind::System => "system",
                _ => "user",
            };
            out.push(ChatMessage { role: role.into(), content: message.body.clone() });
        }
        out
    }
}

pub mod protocols {
    use super::*;

    pub fn is_strict_turn(type_tag: &str) -> bool {
        matches!(type_tag, "hierarchical" | "debate" | "socratic")
    }

    fn is_question(body: &str) -> bool {
        body.trim().ends_with('?')
    }

    /// The debate window in force for the next submission: `speaking_time_seconds`
    /// before any statement has been made, `rebuttal_time_seconds` once the
    /// exchange is underway (§4.6, §4.7).
    fn debate_window_seconds(conversation: &Conversation) -> u64 {
        let key = if conversation.messages.is_empty() { "speaking_time_seconds" } else { "rebuttal_time_seconds" };
        conversation.settings.get(key).and_then(|v| v.as_u64()).unwrap_or(120)
    }

    /// Whether a debate submission arriving at `now` falls outside its
    /// speaking/rebuttal window, measured from the previous message's
    /// timestamp (or the conversation's creation if none yet) (§4.6, §4.7:
    /// "router silently refuses late submissions").
    pub fn is_late_debate_submission(conversation: &Conversation, now: chrono::DateTime<Utc>) -> bool {
        if conversation.conversation_type != "debate" {
            return false;
        }
        let window = Duration::from_secs(debate_window_seconds(conversation));
        let window_start = conversation.messages.last().map(|m| m.timestamp).unwrap_or(conversation.created_at);
        now.signed_duration_since(window_start).to_std().map(|elapsed| elapsed > window).unwrap_or(false)
    }

    /// The ensemble synthesizer: an explicit `synthesizer_id` setting if it
    /// names an active agent participant, else the first `turn_order` entry
    /// whose Agent has `role == "synthesizer"` (§4.6 ensemble: "designated
    /// synthesizer (or deterministic tie-break: first participant in
    /// turnOrder with role=synthesizer)").
    pub fn ensemble_synthesizer(
        agent_participants: &[AgentId],
        agents_by_id: &HashMap<AgentId, Agent>,
        conversation: &Conversation,
    ) -> Option<AgentId> {
        if let Some(explicit) = conversation.settings.get("synthesizer_id").and_then(|v| v.as_str()) {
            if let Some(found) = agent_participants.iter().find(|a| a.as_str() == explicit) {
                return Some(found.clone());
            }
        }
        agent_participants
            .iter()
            .find(|a| agents_by_id.get(a).map(|agent| agent.role == "synthesizer").unwrap_or(false))
            .cloned()
    }

    /// Protocol-specific content filtering of an incoming message (§4.6).
    /// Returns `Err(reason)` describing the rejection for the
    /// `message_rejected` event (e.g. `NonQuestionFromModerator`).
    pub fn validate_incoming(
        type_tag: &str,
        conversation: &Conversation,
        author_id: &ParticipantId,
        body: &str,
        context: &DispatchContext,
    ) -> std::result::Result<(), String> {
        match type_tag {
            "socratic" => {
                if conversation.moderator_id.as_ref() == Some(author_id) && !is_question(body) {
                    return Err("NonQuestionFromModerator".to_string());
                }
            }
            "brainstorm" => {
                let phase = conversation
                    .settings
                    .get("phase")
                    .and_then(|v| v.as_str())
                    .unwrap_or("divergent");
                if phase == "divergent" && context.is_critique {
                    return Err("CritiqueDuringDivergentPhase".to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Which agent participants should be dispatched to in response to this
    /// utterance, under the active protocol (§4.6).
    pub fn derive_recipients(
        type_tag: &str,
        conversation: &Conversation,
        author_id: &ParticipantId,
        context: &DispatchContext,
        agents_by_id: &HashMap<AgentId, Agent>,
    ) -> Vec<AgentId> {
        let agent_participants: Vec<AgentId> = conversation
            .turn_order
            .iter()
            .filter(|e| e.active && Some(&e.participant_id) != conversation.moderator_id.as_ref())
            .map(|e| AgentId::new(e.participant_id.as_str()))
            .collect();

        match type_tag {
            "socratic" => {
                // Only dispatch when the moderator just asked a question;
                // agent answers themselves do not trigger further dispatch.
                if conversation.moderator_id.as_ref() == Some(author_id) {
                    agent_participants
                } else {
                    Vec::new()
                }
            }
            "hierarchical" | "debate" => {
                // The moderator picks the next speaker out of band (via
                // `turn_order`/turn_cursor among non-moderator entries); the
                // router dispatches to whichever single agent currently
                // holds the turn.
                if agent_participants.is_empty() {
                    Vec::new()
                } else {
                    let idx = conversation.turn_cursor % agent_participants.len();
                    vec![agent_participants[idx].clone()]
                }
            }
            "specialist" => {
                // Dispatch only to agents whose declared capabilities
                // intersect the prompt's capability tags; an agent with no
                // resolved record (unknown to the Agent Manager) never
                // matches.
                if context.capability_tags.is_empty() {
                    agent_participants
                } else {
                    agent_participants
                        .into_iter()
                        .filter(|a| {
                            agents_by_id
                                .get(a)
                                .map(|agent| agent.capabilities.iter().any(|c| context.capability_tags.contains(c)))
                                .unwrap_or(false)
                        })
                        .collect()
                }
            }
            "ensemble" => {
                // The synthesizer refines after the round; it does not
                // produce an independent first-round answer.
                match ensemble_synthesizer(&agent_participants, agents_by_id, conversation) {
                    Some(synth) => agent_participants.into_iter().filter(|a| a != &synth).collect(),
                    None => agent_participants,
                }
            }
            "peer_review" => {
                // reviewerId != authorId (§4.6 Open Question resolution).
                agent_participants.into_iter().filter(|a| a.as_str() != author_id.as_str()).collect()
            }
            // democratic, competitive, consensus, brainstorm: every active
            // agent responds, ordered by turn_order for append order.
            _ => agent_participants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_manager::{AgentManager, AgentManagerConfig};
    use crate::conversation::ConversationTypeRegistry;
    use crate::event_bus::DropPolicy;
    use crate::ids::{AgentId, ProviderId};
    use crate::provider::MockProvider;
    use crate::provider::Provider as _;
    use crate::types::{Agent, AgentCounters, ProviderRecord};

    async fn setup() -> (Arc<ConversationManager>, Arc<AgentManager>, Arc<ProviderRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(64, DropPolicy::DropNewest));
        let types = Arc::new(ConversationTypeRegistry::from_bundled().unwrap());
        let conversations = Arc::new(ConversationManager::new(types, bus.clone()));
        let agents = Arc::new(AgentManager::new(AgentManagerConfig::default(), bus.clone()));
        let providers = Arc::new(ProviderRegistry::new());
        (conversations, agents, providers, bus)
    }

    fn sample_agent(id: &str) -> Agent {
        Agent {
            id: AgentId::new(id),
            display_name: id.into(),
            role: "generalist".into(),
            personality: "neutral".into(),
            provider_id: ProviderId::new("p1"),
            model_id: "model-a".into(),
            capabilities: vec![],
            max_tokens: 500,
            temperature: 0.5,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            counters: AgentCounters::default(),
        }
    }

    #[tokio::test]
    async fn democratic_round_dispatches_all_agents_with_same_prefix() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        agents.add(sample_agent("a2")).await;
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(MockProvider::new("p1", vec!["model-a".into()]));
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;

        let conv_id = conversations
            .create_conversation(
                "democratic",
                vec!["u1".into(), "a1".into(), "a2".into()],
                "demo",
                "u1".into(),
                &["a1".into(), "a2".into()],
            )
            .await
            .unwrap();

        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        let produced = router
            .handle_incoming(&conv_id, "u1".into(), AuthorKind::User, "pick a number".into(), DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0].author_id.as_str(), "a1");
        assert_eq!(produced[1].author_id.as_str(), "a2");
        assert_eq!(conversations.get(&conv_id).await.unwrap().state, crate::types::ConversationState::Active);
    }

    #[tokio::test]
    async fn socratic_rejects_non_question_from_moderator() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        let conv_id = conversations
            .create_conversation("socratic", vec!["m1".into(), "a1".into()], "s", "m1".into(), &["a1".into()])
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        let result = router
            .handle_incoming(&conv_id, "m1".into(), AuthorKind::User, "Answer me.".into(), DispatchContext::default())
            .await;
        assert!(result.is_err());
        let conv = conversations.get(&conv_id).await.unwrap();
        assert_eq!(conv.messages.len(), 0);
    }

    #[tokio::test]
    async fn provider_outage_appends_system_message_after_retries() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        let mock = MockProvider::new("p1", vec!["model-a".into()]);
        for _ in 0..4 {
            mock.push_failure(HubError::Timeout { duration: Duration::from_secs(30) }).await;
        }
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(mock);
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation("hierarchical", vec!["m1".into(), "a1".into()], "s", "m1".into(), &["a1".into()])
            .await
            .unwrap();
        let router = MessageRouter::new(
            conversations.clone(),
            agents,
            providers,
            bus,
            RetryConfig { base_ms: 1, factor: 1.0, max_retries: 3, cap_ms: 10 },
            50,
            Duration::from_secs(5),
        );
        let produced = router
            .handle_incoming(&conv_id, "m1".into(), AuthorKind::User, "go".into(), DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].author_kind, AuthorKind::System);
    }

    #[tokio::test]
    async fn consensus_ends_after_unanimous_first_round() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        agents.add(sample_agent("a2")).await;
        agents.add(sample_agent("a3")).await;
        let mock = MockProvider::new("p1", vec!["model-a".into()]);
        for _ in 0..3 {
            mock.push_response("I agree with this proposal.".into()).await;
        }
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(mock);
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation(
                "consensus",
                vec!["a1".into(), "a2".into(), "a3".into()],
                "s",
                "a1".into(),
                &["a1".into(), "a2".into(), "a3".into()],
            )
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));

        // Every active agent participant (including the proposer) casts a
        // vote; the bundled default threshold of 0.8 is satisfied by 3/3.
        let produced = router
            .handle_incoming(&conv_id, "a1".into(), AuthorKind::Agent, "do we proceed?".into(), DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(produced.len(), 3);
        let conv = conversations.get(&conv_id).await.unwrap();
        assert_eq!(conv.state, crate::types::ConversationState::Ended);
    }

    #[tokio::test]
    async fn peer_review_excludes_author_from_reviewers() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        agents.add(sample_agent("a2")).await;
        let conv_id = conversations
            .create_conversation(
                "peer_review",
                vec!["a1".into(), "a2".into()],
                "s",
                "a1".into(),
                &["a1".into(), "a2".into()],
            )
            .await
            .unwrap();
        let conversation = conversations.get(&conv_id).await.unwrap();
        let recipients = protocols::derive_recipients("peer_review", &conversation, &"a1".into(), &DispatchContext::default(), &HashMap::new());
        assert!(!recipients.iter().any(|r| r.as_str() == "a1"));
        assert!(recipients.iter().any(|r| r.as_str() == "a2"));
    }

    fn agent_with_capabilities(id: &str, capabilities: Vec<String>) -> Agent {
        Agent { capabilities, ..sample_agent(id) }
    }

    #[tokio::test]
    async fn specialist_filters_to_agents_with_matching_capability() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(agent_with_capabilities("a1", vec!["math".into()])).await;
        agents.add(agent_with_capabilities("a2", vec!["writing".into()])).await;
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(MockProvider::new("p1", vec!["model-a".into()]));
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation(
                "specialist",
                vec!["u1".into(), "a1".into(), "a2".into()],
                "s",
                "u1".into(),
                &["a1".into(), "a2".into()],
            )
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        let context = DispatchContext { capability_tags: vec!["math".into()], is_critique: false };
        let produced = router.handle_incoming(&conv_id, "u1".into(), AuthorKind::User, "solve this".into(), context).await.unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].author_id.as_str(), "a1");
    }

    #[tokio::test]
    async fn ensemble_synthesizer_refines_after_initial_answers() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        agents.add(Agent { role: "synthesizer".into(), ..sample_agent("a2") }).await;
        let mock = MockProvider::new("p1", vec!["model-a".into()]);
        mock.push_response("a1's answer".into()).await;
        for _ in 0..3 {
            mock.push_response("refined answer".into()).await;
        }
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(mock);
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation(
                "ensemble",
                vec!["u1".into(), "a1".into(), "a2".into()],
                "s",
                "u1".into(),
                &["a1".into(), "a2".into()],
            )
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        let produced = router
            .handle_incoming(&conv_id, "u1".into(), AuthorKind::User, "what should we do?".into(), DispatchContext::default())
            .await
            .unwrap();
        // 1 initial answer from the non-synthesizer agent + 3 refinement passes.
        assert_eq!(produced.len(), 4);
        assert_eq!(produced[0].author_id.as_str(), "a1");
        assert!(produced[1..].iter().all(|m| m.author_id.as_str() == "a2"));
    }

    #[tokio::test]
    async fn competitive_scores_answers_and_announces_winner() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        agents.add(sample_agent("a2")).await;
        let mock = MockProvider::new("p1", vec!["model-a".into()]);
        mock.push_response("short".into()).await;
        mock.push_response("a much longer and more thorough answer".into()).await;
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(mock);
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation(
                "competitive",
                vec!["u1".into(), "a1".into(), "a2".into()],
                "s",
                "u1".into(),
                &["a1".into(), "a2".into()],
            )
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        let produced = router
            .handle_incoming(&conv_id, "u1".into(), AuthorKind::User, "answer this".into(), DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(produced.len(), 2);
        let conv = conversations.get(&conv_id).await.unwrap();
        let winner_message = conv.messages.last().unwrap();
        assert_eq!(winner_message.author_kind, AuthorKind::System);
        assert!(winner_message.body.contains("a2"));
    }

    #[tokio::test]
    async fn debate_within_window_is_not_late() {
        let (conversations, agents, providers, bus) = setup().await;
        agents.add(sample_agent("a1")).await;
        let mock = MockProvider::new("p1", vec!["model-a".into()]);
        mock.push_response("rebuttal".into()).await;
        let mock: Arc<dyn crate::provider::Provider> = Arc::new(mock);
        providers
            .register(
                ProviderRecord {
                    id: ProviderId::new("p1"),
                    display_name: "mock".into(),
                    base_endpoint: None,
                    credential_ref: None,
                    models: vec!["model-a".into()],
                    is_active: true,
                    settings: Default::default(),
                },
                mock,
            )
            .await;
        let conv_id = conversations
            .create_conversation("debate", vec!["m1".into(), "a1".into()], "s", "m1".into(), &["a1".into()])
            .await
            .unwrap();
        let router = MessageRouter::new(conversations.clone(), agents, providers, bus, RetryConfig::default(), 50, Duration::from_secs(5));
        // The bundled `speaking_time_seconds` default (120s) has not elapsed yet,
        // so the opening statement is accepted and dispatched normally.
        let produced = router
            .handle_incoming(&conv_id, "m1".into(), AuthorKind::User, "opening statement".into(), DispatchContext::default())
            .await
            .unwrap();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].author_id.as_str(), "a1");
        let conv = conversations.get(&conv_id).await.unwrap();
        assert_eq!(conv.messages.len(), 2);
    }

    #[test]
    fn is_late_debate_submission_checks_the_active_window() {
        let now = Utc::now();
        let mut conversation = Conversation {
            id: crate::ids::ConversationId::new("c1"),
            conversation_type: "debate".into(),
            participants: vec!["m1".into(), "a1".into()],
            moderator_id: Some("m1".into()),
            subject: "s".into(),
            created_at: now - chrono::Duration::seconds(10),
            updated_at: now,
            state: crate::types::ConversationState::Active,
            turn_order: vec![],
            turn_cursor: 0,
            messages: vec![],
            settings: HashMap::new(),
        };
        conversation.settings.insert("speaking_time_seconds".into(), json!(5));
        // No messages yet: window start is `created_at`, 10s ago, past the 5s speaking window.
        assert!(protocols::is_late_debate_submission(&conversation, now));

        conversation.settings.insert("speaking_time_seconds".into(), json!(30));
        assert!(!protocols::is_late_debate_submission(&conversation, now));

        conversation.conversation_type = "hierarchical".into();
        assert!(!protocols::is_late_debate_submission(&conversation, now));
    }
}

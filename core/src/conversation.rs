//! Conversation Manager (§4.6): conversation type registry, state machines,
//! turn orderings.
//!
//! Conversation type configuration is data loaded from the bundled
//! `data/conversation_types.json` (or a user override file under
//! `data_dir`), validated against `ConversationTypeConfig` at startup — no
//! hard-coded branching on type tag outside the Message Router, per §9's
//! design note. This mirrors the teacher's
//! `config::store::Config::load_or_default` file-or-default pattern.

use crate::error::{HubError, Result};
use crate::event_bus::{ConversationEvent, EventBus, HubEvent};
use crate::ids::{ConversationId, IdGenerator, MessageId, ParticipantId};
use crate::types::{AuthorKind, Conversation, ConversationState, Message, TurnEntry};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

const BUNDLED_CONVERSATION_TYPES: &str = include_str!("../data/conversation_types.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTypeConfig {
    pub tag: String,
    pub display_name: String,
    pub description: String,
    pub min_participants: usize,
    pub max_participants: usize,
    pub requires_moderator: bool,
    pub settings: HashMap<String, serde_json::Value>,
}

/// Holds the ten standard conversation type configurations (§4.6), loaded
/// from the bundled defaults or an override file.
pub struct ConversationTypeRegistry {
    types: HashMap<String, ConversationTypeConfig>,
}

impl ConversationTypeRegistry {
    pub fn from_bundled() -> Result<Self> {
        Self::from_json(BUNDLED_CONVERSATION_TYPES)
    }

    /// Loads an override file if present under `data_dir/conversation_types.json`,
    /// otherwise falls back to the bundled defaults (§4.6 design note).
    pub async fn load_or_default(data_dir: &Path) -> Result<Self> {
        let override_path = data_dir.join("conversation_types.json");
        if override_path.exists() {
            let contents = tokio::fs::read_to_string(&override_path)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            Self::from_json(&contents)
        } else {
            Self::from_bundled()
        }
    }

    fn from_json(contents: &str) -> Result<Self> {
        let list: Vec<ConversationTypeConfig> = serde_json::from_str(contents)?;
        let types = list.into_iter().map(|c| (c.tag.clone(), c)).collect();
        Ok(Self { types })
    }

    pub fn get(&self, tag: &str) -> Result<&ConversationTypeConfig> {
        self.types
            .get(tag)
            .ok_or_else(|| HubError::InvalidConfiguration { message: format!("unknown conversation type {}", tag) })
    }

    pub fn tags(&self) -> Vec<&str> {
        self.types.keys().map(|s| s.as_str()).collect()
    }
}

pub struct ConversationManager {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    types: Arc<ConversationTypeRegistry>,
    ids: IdGenerator<crate::ids::SystemClock>,
    event_bus: Arc<EventBus>,
}

impl ConversationManager {
    pub fn new(types: Arc<ConversationTypeRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            types,
            ids: IdGenerator::system(),
            event_bus,
        }
    }

    /// Validates and creates a `forming` conversation (§4.6).
    pub async fn create_conversation(
        &self,
        conversation_type: &str,
        participants: Vec<ParticipantId>,
        subject: impl Into<String>,
        _creator_id: ParticipantId,
        known_agents: &[ParticipantId],
    ) -> Result<ConversationId> {
        let type_config = self.types.get(conversation_type)?;

        if participants.len() < type_config.min_participants || participants.len() > type_config.max_participants {
            return Err(HubError::OutOfCapacityRange {
                min: type_config.min_participants,
                max: type_config.max_participants,
                actual: participants.len(),
            });
        }

        let moderator_id = if type_config.requires_moderator {
            let moderator = participants.first().cloned().ok_or_else(|| HubError::ModeratorMissing {
                conversation_type: conversation_type.to_string(),
            })?;
            Some(moderator)
        } else {
            None
        };

        for p in &participants {
            let is_known_agent = known_agents.iter().any(|a| a == p);
            let looks_like_user = p.as_str().starts_with('u');
            if !is_known_agent && !looks_like_user {
                return Err(HubError::UnknownParticipant(p.to_string()));
            }
        }

        let id = ConversationId::new(self.ids.mint());
        let now = Utc::now();
        let conversation = Conversation {
            id: id.clone(),
            conversation_type: conversation_type.to_string(),
            turn_order: participants
                .iter()
                .map(|p| TurnEntry { participant_id: p.clone(), active: true })
                .collect(),
            participants,
            moderator_id,
            subject: subject.into(),
            created_at: now,
            updated_at: now,
            state: ConversationState::Forming,
            turn_cursor: 0,
            messages: Vec::new(),
            settings: type_config.settings.clone(),
        };
        self.conversations.write().await.insert(id.clone(), conversation);

        self.event_bus
            .publish(HubEvent::Conversation(ConversationEvent {
                type_tag: "conversation_created".into(),
                timestamp: now,
                producer_id: "conversation_manager".into(),
                conversation_id: id.clone(),
                payload: json!({ "type": conversation_type }),
            }))
            .await;

        Ok(id)
    }

    /// Returns every known conversation id, for listing commands.
    pub async fn list_ids(&self) -> Vec<ConversationId> {
        self.conversations.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, id: &ConversationId) -> Result<Conversation> {
        self.conversations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", id) })
    }

    pub fn type_config(&self, tag: &str) -> Result<ConversationTypeConfig> {
        self.types.get(tag).cloned()
    }

    /// Appends a message after the state-machine and participant checks in
    /// §4.6. Protocol-specific content filtering (e.g. socratic
    /// question-only) is the Message Router's responsibility and must run
    /// before calling this.
    pub async fn add_message(&self, conversation_id: &ConversationId, author_id: ParticipantId, author_kind: AuthorKind, body: String) -> Result<Message> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;

        match conversation.state {
            ConversationState::Ended | ConversationState::Paused => {
                return Err(HubError::InvalidState { message: format!("conversation {} is {:?}", conversation_id, conversation.state) })
            }
            _ => {}
        }

        if author_kind != AuthorKind::System && !conversation.is_participant(&author_id) {
            return Err(HubError::NotAParticipant {
                participant_id: author_id.to_string(),
                conversation_id: conversation_id.to_string(),
            });
        }

        let message = Message {
            id: MessageId::new(self.ids.mint()),
            timestamp: Utc::now(),
            author_id: author_id.clone(),
            author_kind: author_kind.clone(),
            body,
            parent_id: None,
            thread_id: None,
            conversation_id: conversation_id.clone(),
            metadata: Default::default(),
            edit_history: Vec::new(),
        };
        conversation.messages.push(message.clone());
        conversation.updated_at = Utc::now();

        if conversation.state == ConversationState::Forming {
            conversation.state = ConversationState::Active;
        }

        self.event_bus
            .publish(HubEvent::Conversation(ConversationEvent {
                type_tag: "message_added".into(),
                timestamp: message.timestamp,
                producer_id: "conversation_manager".into(),
                conversation_id: conversation_id.clone(),
                payload: json!({ "message_id": message.id.to_string(), "author_id": author_id.to_string() }),
            }))
            .await;

        Ok(message)
    }

    /// Enforces turn order for strict-turn protocols; callers for
    /// democratic/hierarchical/debate/socratic invoke this before
    /// `add_message` and surface `OutOfTurn` to the caller for buffer-and-retry
    /// (§4.6).
    pub async fn check_turn(&self, conversation_id: &ConversationId, participant_id: &ParticipantId) -> Result<()> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
        let expected = conversation
            .turn_order
            .iter()
            .filter(|e| e.active)
            .nth(conversation.turn_cursor % conversation.active_participant_count().max(1));
        match expected {
            Some(entry) if &entry.participant_id == participant_id => Ok(()),
            _ => Err(HubError::OutOfTurn { participant_id: participant_id.to_string() }),
        }
    }

    /// Advances the turn cursor to the next active participant, skipping
    /// inactive (departed) entries but never compacting `turn_order` so
    /// indices stay stable across replay (§4.6).
    pub async fn advance_turn(&self, conversation_id: &ConversationId) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
        let active_count = conversation.active_participant_count().max(1);
        conversation.turn_cursor = (conversation.turn_cursor + 1) % active_count;
        Ok(())
    }

    pub async fn pause(&self, conversation_id: &ConversationId) -> Result<()> {
        self.transition(conversation_id, ConversationState::Paused, "conversation_paused", json!({})).await
    }

    pub async fn resume(&self, conversation_id: &ConversationId) -> Result<()> {
        self.transition(conversation_id, ConversationState::Active, "conversation_resumed", json!({})).await
    }

    pub async fn end(&self, conversation_id: &ConversationId) -> Result<()> {
        self.transition(conversation_id, ConversationState::Ended, "conversation_ended", json!({})).await
    }

    /// Ends a conversation and stamps the `conversation_ended` event payload
    /// with `reason` (e.g. `ConsensusReached`), per §8 S6.
    pub async fn end_with_reason(&self, conversation_id: &ConversationId, reason: &str) -> Result<()> {
        self.transition(conversation_id, ConversationState::Ended, "conversation_ended", json!({ "reason": reason })).await
    }

    async fn transition(&self, conversation_id: &ConversationId, next: ConversationState, event_tag: &str, payload: serde_json::Value) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
        if !conversation.state.can_transition_to(next) {
            return Err(HubError::InvalidState {
                message: format!("cannot transition conversation {} from {:?} to {:?}", conversation_id, conversation.state, next),
            });
        }
        conversation.state = next;
        conversation.updated_at = Utc::now();
        let id = conversation.id.clone();
        drop(conversations);
        self.event_bus
            .publish(HubEvent::Conversation(ConversationEvent {
                type_tag: event_tag.into(),
                timestamp: Utc::now(),
                producer_id: "conversation_manager".into(),
                conversation_id: id,
                payload,
            }))
            .await;
        Ok(())
    }

    /// Increments and returns the consensus round counter stored in
    /// `settings["round"]` (§4.6 consensus protocol).
    pub async fn increment_round(&self, conversation_id: &ConversationId) -> Result<u64> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
        let current = conversation.settings.get("round").and_then(|v| v.as_u64()).unwrap_or(0);
        let next = current + 1;
        conversation.settings.insert("round".to_string(), json!(next));
        Ok(next)
    }

    /// Marks a departed participant inactive in `turn_order` without
    /// compacting the list (§4.6), ending the conversation if the active
    /// count drops below the type's `min_participants`.
    pub async fn mark_departed(&self, conversation_id: &ConversationId, participant_id: &ParticipantId) -> Result<()> {
        let min_participants = {
            let conversations = self.conversations.read().await;
            let conversation = conversations
                .get(conversation_id)
                .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
            self.types.get(&conversation.conversation_type)?.min_participants
        };

        let should_end = {
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
            for entry in conversation.turn_order.iter_mut() {
                if &entry.participant_id == participant_id {
                    entry.active = false;
                }
            }
            conversation.updated_at = Utc::now();
            conversation.active_participant_count() < min_participants
                && matches!(conversation.state, ConversationState::Active | ConversationState::Paused)
        };

        if should_end {
            self.end(conversation_id).await?;
        }
        Ok(())
    }

    /// Appends a new participant to `turn_order`; existing indices never
    /// shift (§4.6).
    pub async fn add_participant(&self, conversation_id: &ConversationId, participant_id: ParticipantId) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HubError::NotFound { what: format!("conversation {}", conversation_id) })?;
        if !conversation.is_participant(&participant_id) {
            conversation.participants.push(participant_id.clone());
        }
        conversation.turn_order.push(TurnEntry { participant_id, active: true });
        conversation.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::DropPolicy;

    fn manager() -> ConversationManager {
        let types = Arc::new(ConversationTypeRegistry::from_bundled().unwrap());
        let bus = Arc::new(EventBus::new(32, DropPolicy::DropNewest));
        ConversationManager::new(types, bus)
    }

    #[tokio::test]
    async fn bundled_registry_has_ten_types() {
        let registry = ConversationTypeRegistry::from_bundled().unwrap();
        assert_eq!(registry.tags().len(), 10);
    }

    #[tokio::test]
    async fn create_conversation_validates_capacity_range() {
        let mgr = manager();
        let result = mgr
            .create_conversation("debate", vec!["u1".into()], "too few", "u1".into(), &[])
            .await;
        assert!(matches!(result, Err(HubError::OutOfCapacityRange { .. })));
    }

    #[tokio::test]
    async fn create_conversation_requires_moderator_when_flagged() {
        let mgr = manager();
        let id = mgr
            .create_conversation("hierarchical", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        let conv = mgr.get(&id).await.unwrap();
        assert!(conv.moderator_id.is_some());
    }

    #[tokio::test]
    async fn first_message_transitions_forming_to_active() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        assert_eq!(mgr.get(&id).await.unwrap().state, ConversationState::Forming);
        mgr.add_message(&id, "u1".into(), AuthorKind::User, "hi".into()).await.unwrap();
        assert_eq!(mgr.get(&id).await.unwrap().state, ConversationState::Active);
    }

    #[tokio::test]
    async fn message_to_ended_conversation_fails_with_invalid_state() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        mgr.add_message(&id, "u1".into(), AuthorKind::User, "hi".into()).await.unwrap();
        mgr.end(&id).await.unwrap();
        let result = mgr.add_message(&id, "u1".into(), AuthorKind::User, "more".into()).await;
        assert!(matches!(result, Err(HubError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn non_participant_cannot_post() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        let result = mgr.add_message(&id, "u3".into(), AuthorKind::User, "hi".into()).await;
        assert!(matches!(result, Err(HubError::NotAParticipant { .. })));
    }

    #[tokio::test]
    async fn departure_keeps_turn_indices_stable() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into(), "u3".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        mgr.mark_departed(&id, &"u2".into()).await.unwrap();
        let conv = mgr.get(&id).await.unwrap();
        assert_eq!(conv.turn_order.len(), 3);
        assert!(!conv.turn_order[1].active);
    }

    #[tokio::test]
    async fn list_ids_reflects_created_conversations() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        assert_eq!(mgr.list_ids().await, vec![id]);
    }

    #[tokio::test]
    async fn conversation_ends_when_active_count_drops_below_minimum() {
        let mgr = manager();
        let id = mgr
            .create_conversation("democratic", vec!["u1".into(), "u2".into()], "s", "u1".into(), &[])
            .await
            .unwrap();
        mgr.add_message(&id, "u1".into(), AuthorKind::User, "hi".into()).await.unwrap();
        mgr.mark_departed(&id, &"u1".into()).await.unwrap();
        mgr.mark_departed(&id, &"u2".into()).await.unwrap();
        let conv = mgr.get(&id).await.unwrap();
        assert_eq!(conv.state, ConversationState::Ended);
    }
}

//! Controller / Facade (§4.9): translates user intents into manager calls
//! and emits one event per completed intent. Keeps no state beyond a
//! reference to the "current" conversation id for the active UI session.
//!
//! Grounded on `core/src/hub.rs`'s role as the single entry point
//! translating UI intents into manager calls, generalized from its
//! interactive `dialoguer`-menu shape into a plain async API that both the
//! CLI and the optional TUI observer call into. The UI is an observer of
//! the Event Bus; the Controller does not know about UI (§4.9, §9).

use crate::agent_manager::AgentManager;
use crate::conversation::ConversationManager;
use crate::error::Result;
use crate::event_bus::{EventBus, FileEvent, HubEvent};
use crate::file_store::FileStore;
use crate::ids::{ConversationId, FileId, ParticipantId};
use crate::provider::ProviderRegistry;
use crate::router::{DispatchContext, MessageRouter};
use crate::types::{Agent, AuthorKind, Conversation, FileRecord, Message, Permission};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct Controller {
    pub conversations: Arc<ConversationManager>,
    pub agents: Arc<AgentManager>,
    pub providers: Arc<ProviderRegistry>,
    pub router: Arc<MessageRouter>,
    pub files: Arc<FileStore>,
    pub event_bus: Arc<EventBus>,
    current_conversation: RwLock<Option<ConversationId>>,
}

impl Controller {
    pub fn new(
        conversations: Arc<ConversationManager>,
        agents: Arc<AgentManager>,
        providers: Arc<ProviderRegistry>,
        router: Arc<MessageRouter>,
        files: Arc<FileStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            conversations,
            agents,
            providers,
            router,
            files,
            event_bus,
            current_conversation: RwLock::new(None),
        }
    }

    pub async fn create_conversation(
        &self,
        conversation_type: &str,
        participants: Vec<ParticipantId>,
        subject: impl Into<String>,
        creator_id: ParticipantId,
    ) -> Result<ConversationId> {
        let known_agents: Vec<ParticipantId> = self.agents.list_active().await.into_iter().map(|a| a.id.into()).collect();
        let id = self
            .conversations
            .create_conversation(conversation_type, participants, subject, creator_id, &known_agents)
            .await?;
        *self.current_conversation.write().await = Some(id.clone());
        Ok(id)
    }

    pub async fn join_conversation(&self, conversation_id: &ConversationId, participant_id: ParticipantId) -> Result<()> {
        self.conversations.add_participant(conversation_id, participant_id).await?;
        *self.current_conversation.write().await = Some(conversation_id.clone());
        Ok(())
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        author_id: ParticipantId,
        author_kind: AuthorKind,
        body: String,
        context: DispatchContext,
    ) -> Result<Vec<Message>> {
        self.router.handle_incoming(conversation_id, author_id, author_kind, body, context).await
    }

    pub async fn upload_file(
        &self,
        name: impl Into<String>,
        bytes: &[u8],
        owner_id: ParticipantId,
        permissions: Vec<Permission>,
        is_public: bool,
    ) -> Result<FileRecord> {
        let record = self.files.upload(name, bytes, owner_id, permissions, is_public).await?;
        self.event_bus
            .publish(HubEvent::File(FileEvent {
                type_tag: "file_uploaded".into(),
                timestamp: Utc::now(),
                producer_id: "controller".into(),
                file_id: record.id.clone(),
                payload: json!({ "checksum": record.checksum, "size": record.size }),
            }))
            .await;
        Ok(record)
    }

    pub async fn delete_file(&self, file_id: &FileId, principal_id: &ParticipantId) -> Result<()> {
        self.files.delete(file_id, principal_id).await?;
        self.event_bus
            .publish(HubEvent::File(FileEvent {
                type_tag: "file_deleted".into(),
                timestamp: Utc::now(),
                producer_id: "controller".into(),
                file_id: file_id.clone(),
                payload: json!({}),
            }))
            .await;
        Ok(())
    }

    pub async fn share_file(&self, file_id: &FileId, principal_id: &ParticipantId, ttl: std::time::Duration) -> Result<crate::file_store::ShareLink> {
        self.files.share(file_id, principal_id, ttl).await
    }

    pub async fn end_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.conversations.end(conversation_id).await?;
        let mut current = self.current_conversation.write().await;
        if current.as_ref() == Some(conversation_id) {
            *current = None;
        }
        Ok(())
    }

    pub async fn pause_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.conversations.pause(conversation_id).await
    }

    pub async fn resume_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.conversations.resume(conversation_id).await
    }

    pub async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.conversations.get(conversation_id).await
    }

    pub async fn register_agent(&self, agent: Agent) {
        self.agents.add(agent).await;
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.agents.list_active().await
    }

    pub async fn current_conversation(&self) -> Option<ConversationId> {
        self.current_conversation.read().await.clone()
    }
}

//! Data model (§3): Message, Conversation, Agent, Task, Provider, File,
//! CollabSession, and the Journal record envelope.

use crate::ids::{AgentId, ConversationId, FileId, MessageId, ParticipantId, ProviderId, SessionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    User,
    Agent,
    System,
    Tool,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEdit {
    pub timestamp: DateTime<Utc>,
    pub editor_id: ParticipantId,
    pub previous_body: String,
    pub reason: Option<String>,
}

/// Immutable once appended (§3). `edit` pushes onto `edit_history` and
/// replaces `body`; nothing else mutates a `Message` in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub author_id: ParticipantId,
    pub author_kind: AuthorKind,
    pub body: String,
    pub parent_id: Option<MessageId>,
    pub thread_id: Option<String>,
    pub conversation_id: ConversationId,
    pub metadata: HashMap<String, serde_json::Value>,
    pub edit_history: Vec<MessageEdit>,
}

impl Message {
    pub fn edit(&mut self, editor_id: ParticipantId, new_body: String, reason: Option<String>) {
        self.edit_history.push(MessageEdit {
            timestamp: Utc::now(),
            editor_id,
            previous_body: self.body.clone(),
            reason,
        });
        self.body = new_body;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Forming,
    Active,
    Paused,
    Ended,
}

impl ConversationState {
    /// Transition table from §4.6. Returns `true` if `self -> next` is legal.
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Forming, Active) | (Active, Paused) | (Paused, Active) | (Active, Ended) | (Paused, Ended)
        )
    }
}

/// An entry in `turn_order`; departures mark `active = false` rather than
/// removing the entry so turn indices stay stable across replay (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEntry {
    pub participant_id: ParticipantId,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub conversation_type: String,
    pub participants: Vec<ParticipantId>,
    pub moderator_id: Option<ParticipantId>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: ConversationState,
    pub turn_order: Vec<TurnEntry>,
    pub turn_cursor: usize,
    pub messages: Vec<Message>,
    pub settings: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn active_participant_count(&self) -> usize {
        self.turn_order.iter().filter(|e| e.active).count()
    }

    pub fn is_participant(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCounters {
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub quality_score: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub display_name: String,
    pub role: String,
    pub personality: String,
    pub provider_id: ProviderId,
    pub model_id: String,
    pub capabilities: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub counters: AgentCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub assignee_id: AgentId,
    pub task_type: String,
    pub description: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub display_name: String,
    pub base_endpoint: Option<String>,
    /// Opaque reference into a process-scoped secret resolver; never a
    /// plaintext credential (§9 Design Notes: Credentials).
    pub credential_ref: Option<String>,
    pub models: Vec<String>,
    pub is_active: bool,
    pub settings: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Document,
    Image,
    Video,
    Audio,
    Code,
    Data,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Right {
    Read,
    Write,
    Delete,
    Share,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub principal_id: ParticipantId,
    pub rights: Vec<Right>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub category: FileCategory,
    pub owner_id: ParticipantId,
    pub permissions: Vec<Permission>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub checksum: String,
    pub is_public: bool,
    pub download_count: u64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Delete,
    Replace,
    Format,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: u64,
    pub author_id: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
    pub position: usize,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabSession {
    pub id: SessionId,
    pub file_id: FileId,
    pub participants: Vec<ParticipantId>,
    pub is_active: bool,
    pub version: u64,
    pub cursor_map: HashMap<String, usize>,
    pub changes: Vec<Change>,
    pub body: String,
}

impl CollabSession {
    /// Applies a linearized change: last-writer-wins at `position` (§4.8).
    pub fn apply_change(&mut self, author_id: ParticipantId, kind: ChangeKind, position: usize, payload: String) -> u64 {
        let change_id = self.changes.len() as u64;
        match kind {
            ChangeKind::Insert => {
                let pos = position.min(self.body.len());
                self.body.insert_str(pos, &payload);
            }
            ChangeKind::Delete => {
                let start = position.min(self.body.len());
                let end = (start + payload.len()).min(self.body.len());
                self.body.replace_range(start..end, "");
            }
            ChangeKind::Replace => {
                let start = position.min(self.body.len());
                let end = (start + payload.len()).min(self.body.len());
                self.body.replace_range(start..end, &payload);
            }
            ChangeKind::Format => {
                // Formatting changes carry no textual payload mutation.
            }
        }
        self.changes.push(Change {
            id: change_id,
            author_id,
            timestamp: Utc::now(),
            kind,
            position,
            payload,
        });
        self.version = self.changes.len() as u64;
        change_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalRecordKind {
    Event,
    ConversationSnapshot,
    Message,
    Task,
    FileEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: JournalRecordKind,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_state_transitions() {
        use ConversationState::*;
        assert!(Forming.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Ended));
        assert!(Paused.can_transition_to(Ended));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Forming.can_transition_to(Ended));
    }

    #[test]
    fn collab_session_linearizes_inserts() {
        let mut session = CollabSession {
            id: SessionId::new("s1"),
            file_id: FileId::new("f1"),
            participants: vec![],
            is_active: true,
            version: 0,
            cursor_map: HashMap::new(),
            changes: vec![],
            body: String::new(),
        };
        session.apply_change(ParticipantId::from("u1"), ChangeKind::Insert, 0, "hello".into());
        session.apply_change(ParticipantId::from("u1"), ChangeKind::Insert, 5, " world".into());
        assert_eq!(session.body, "hello world");
        assert_eq!(session.version, 2);
        assert_eq!(session.version as usize, session.changes.len());
    }
}

//! `conclave-core` — the conversation/agent runtime behind the `conclave`
//! terminal multi-agent conversation hub: the conversation state machine
//! and turn-order policies, the agent manager, the provider abstraction,
//! the event bus, and the append-only conversation/event log.
//!
//! This crate does not render UI, manage OS-level authentication, or
//! implement model inference; conversations persist as an append-only
//! journal on the local filesystem.

#![deny(unsafe_code)]

pub mod agent_manager;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod event_bus;
pub mod file_store;
pub mod ids;
pub mod journal;
pub mod provider;
pub mod router;
pub mod types;

use crate::agent_manager::{AgentManager, AgentManagerConfig};
use crate::config::HubConfig;
use crate::controller::Controller;
use crate::conversation::{ConversationManager, ConversationTypeRegistry};
use crate::error::Result;
use crate::event_bus::{EventBus, HubEvent};
use crate::file_store::{FileStore, FileStoreConfig};
use crate::journal::Journal;
use crate::provider::ProviderRegistry;
use crate::router::{MessageRouter, RetryConfig};
use crate::types::{JournalRecord, JournalRecordKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Wires together every component from §2's table and exposes the
/// Controller as the single entry point, mirroring the teacher's `hub.rs`
/// role as orchestration root.
pub struct Hub {
    pub config: HubConfig,
    pub event_bus: Arc<EventBus>,
    pub journal: Arc<Journal>,
    pub controller: Arc<Controller>,
    journal_writer: Option<JoinHandle<()>>,
}

impl Hub {
    /// Builds every manager from `config`, opens the journal, and starts
    /// the background task that persists every published event — the
    /// Journal is the one subscriber that must never miss an event, so it
    /// runs with `DropPolicy::Block` regardless of the bus-wide default.
    pub async fn bootstrap(config: HubConfig) -> Result<Self> {
        let data_dir = config.resolved_data_dir()?;
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| error::HubError::IoFailure { message: e.to_string() })?;

        let event_bus = Arc::new(EventBus::new(config.event_bus.subscriber_buffer, config.event_bus.drop_policy.into()));
        let journal = Arc::new(Journal::open(&data_dir, config.journal.fsync).await?);

        let types = Arc::new(ConversationTypeRegistry::load_or_default(&data_dir).await?);
        let conversations = Arc::new(ConversationManager::new(types, event_bus.clone()));

        let agent_config = AgentManagerConfig {
            task_queue_capacity: config.agent.task_queue_capacity,
            ema_smoothing: config.agent.ema_smoothing,
            intervention_error_rate_threshold: config.agent.intervention_error_rate_threshold,
        };
        let agents = Arc::new(AgentManager::new(agent_config, event_bus.clone()));

        let providers = Arc::new(ProviderRegistry::new());

        let retry = RetryConfig {
            base_ms: config.provider.retry.base_ms,
            factor: config.provider.retry.factor,
            max_retries: config.provider.retry.max_attempts,
            cap_ms: config.provider.retry.cap_ms,
        };
        let router = Arc::new(MessageRouter::new(
            conversations.clone(),
            agents.clone(),
            providers.clone(),
            event_bus.clone(),
            retry,
            config.router.window,
            Duration::from_millis(config.provider.default_timeout_ms),
        ));

        let file_config = FileStoreConfig { max_bytes: config.file.max_bytes, allowed_extensions: config.file.allowed_extensions.clone() };
        let files = Arc::new(FileStore::open(&data_dir, file_config).await?);

        let controller = Arc::new(Controller::new(conversations, agents, providers, router, files, event_bus.clone()));

        let mut hub = Self { config, event_bus, journal, controller, journal_writer: None };
        hub.journal_writer = Some(hub.spawn_journal_writer().await);
        Ok(hub)
    }

    /// Subscribes to the Event Bus and appends every event to
    /// `events.jsonl`, grounded on the teacher's background-task
    /// channel-draining pattern (`SessionPersistence`).
    async fn spawn_journal_writer(&self) -> JoinHandle<()> {
        let mut rx = self.event_bus.subscribe("journal", None, Some(event_bus::DropPolicy::Block)).await;
        let journal = self.journal.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = match serde_json::to_value(&event) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(error = %e, "journal writer: failed to serialize event");
                        continue;
                    }
                };
                let kind = match event {
                    HubEvent::Conversation(_) | HubEvent::Agent(_) => JournalRecordKind::Event,
                    HubEvent::File(_) => JournalRecordKind::FileEvent,
                };
                if let Err(e) = journal.append(kind, payload).await {
                    tracing::error!(error = %e, "journal writer: failed to append event");
                }
            }
        })
    }

    /// Replays `events.jsonl` from the given offset (§8 property 2).
    pub async fn replay_events(&self, from_offset: u64) -> Result<Vec<JournalRecord>> {
        self.journal.stream(from_offset).await
    }

    /// Reconstructs every non-ended conversation from `conversations.jsonl`.
    pub async fn replay_conversations(&self) -> Result<Vec<types::Conversation>> {
        self.journal.replay_conversations().await
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if let Some(handle) = self.journal_writer.take() {
            handle.abort();
        }
    }
}

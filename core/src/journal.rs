//! Append-only Journal (§4.3): line-delimited JSON log for events and
//! conversation snapshots, plus the checkpoint file used for fast restart.
//!
//! Grounded on the teacher's `core/src/memory/journal.rs` (lazily-created
//! append-only file under `dirs::data_dir()`), generalized from Markdown
//! entries to one `serde_json` envelope per line, and on
//! `core/src/agent/session/persistence.rs`'s atomic temp-file-then-rename
//! pattern for the periodic `conversations.jsonl` snapshot writer.

use crate::error::{HubError, Result};
use crate::ids::IdGenerator;
use crate::types::{Conversation, JournalRecord, JournalRecordKind};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, SeekFrom};
use tokio::sync::Mutex;

/// Strictly-serialized append-only writer over `events.jsonl` (§5: "Journal
/// append is strictly serialized"). Readers use `stream` independently and
/// are non-blocking.
pub struct Journal {
    events_path: PathBuf,
    conversations_path: PathBuf,
    write_lock: Mutex<()>,
    fsync: bool,
    offset: AtomicU64,
}

impl Journal {
    /// Opens (creating if absent) the journal files rooted at `data_dir`,
    /// truncating any trailing partial record from a previous crash (§4.3).
    pub async fn open(data_dir: &Path, fsync: bool) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let events_path = data_dir.join("events.jsonl");
        let conversations_path = data_dir.join("conversations.jsonl");

        let offset = Self::truncate_trailing_partial_record(&events_path).await?;
        // The conversations.jsonl file is created lazily by the first
        // snapshot write, so only events.jsonl is validated eagerly here.

        Ok(Self {
            events_path,
            conversations_path,
            write_lock: Mutex::new(()),
            fsync,
            offset: AtomicU64::new(offset),
        })
    }

    async fn truncate_trailing_partial_record(path: &Path) -> Result<u64> {
        if !path.exists() {
            File::create(path)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            return Ok(0);
        }
        let file = File::open(path).await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let mut reader = BufReader::new(file);
        let mut valid_bytes: u64 = 0;
        let mut line = String::new();
        let mut count = 0u64;
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            if n == 0 {
                break;
            }
            if line.ends_with('\n') && serde_json::from_str::<JournalRecord>(line.trim_end()).is_ok() {
                valid_bytes += n as u64;
                count += 1;
            } else {
                // Either a trailing partial line (no newline) or a line that
                // failed to parse: truncate here.
                break;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        file.set_len(valid_bytes)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        Ok(count)
    }

    /// Appends one record to `events.jsonl`, durable before returning when
    /// `journal.fsync` is configured (§6).
    pub async fn append(&self, kind: JournalRecordKind, payload: serde_json::Value) -> Result<JournalRecord> {
        let record = JournalRecord {
            record_id: IdGenerator::system().mint(),
            timestamp: Utc::now(),
            kind,
            payload,
        };
        let line = serde_json::to_string(&record)?;
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.events_path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        file.write_all(b"\n")
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        if self.fsync {
            file.sync_data().await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        }
        self.offset.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    /// Streams records from `events.jsonl` starting at the given 0-based
    /// record offset.
    pub async fn stream(&self, from_offset: u64) -> Result<Vec<JournalRecord>> {
        let file = File::open(&self.events_path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut index = 0u64;
        let mut out = Vec::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            if n == 0 {
                break;
            }
            if index >= from_offset {
                let record: JournalRecord = serde_json::from_str(line.trim_end())?;
                out.push(record);
            }
            index += 1;
        }
        Ok(out)
    }

    /// Writes a full-conversation checkpoint atomically (write temp file,
    /// fsync, rename), appended as one line in `conversations.jsonl`.
    /// Grounded on `SessionPersistence::update_latest_atomic`.
    pub async fn snapshot_conversation(&self, conversation: &Conversation) -> Result<()> {
        let line = serde_json::to_string(conversation)?;
        let _guard = self.write_lock.lock().await;
        let tmp_path = self.conversations_path.with_extension("jsonl.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&tmp_path)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            if self.conversations_path.exists() {
                let existing = tokio::fs::read(&self.conversations_path)
                    .await
                    .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
                tmp.write_all(&existing)
                    .await
                    .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            }
            tmp.write_all(line.as_bytes())
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            tmp.write_all(b"\n")
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            tmp.sync_data().await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        }
        tokio::fs::rename(&tmp_path, &self.conversations_path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        Ok(())
    }

    /// Replays every snapshot line in `conversations.jsonl`, last write per
    /// conversation id wins (§8 property 2: journal replay identity).
    pub async fn replay_conversations(&self) -> Result<Vec<Conversation>> {
        if !self.conversations_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.conversations_path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut by_id = std::collections::HashMap::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(conv) = serde_json::from_str::<Conversation>(trimmed) {
                by_id.insert(conv.id.clone(), conv);
            }
        }
        Ok(by_id.into_values().collect())
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ConversationId;
    use crate::types::{ConversationState, TurnEntry};
    use tempfile::tempdir;

    fn sample_conversation(id: &str) -> Conversation {
        Conversation {
            id: ConversationId::new(id),
            conversation_type: "democratic".into(),
            participants: vec![],
            moderator_id: None,
            subject: "demo".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            state: ConversationState::Active,
            turn_order: vec![TurnEntry { participant_id: "u1".into(), active: true }],
            turn_cursor: 0,
            messages: vec![],
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn append_and_stream_round_trip() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), false).await.unwrap();
        journal
            .append(JournalRecordKind::Event, serde_json::json!({"kind": "a"}))
            .await
            .unwrap();
        journal
            .append(JournalRecordKind::Event, serde_json::json!({"kind": "b"}))
            .await
            .unwrap();
        let all = journal.stream(0).await.unwrap();
        assert_eq!(all.len(), 2);
        let tail = journal.stream(1).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn truncates_trailing_partial_record_on_reopen() {
        let dir = tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        {
            let journal = Journal::open(dir.path(), false).await.unwrap();
            journal
                .append(JournalRecordKind::Event, serde_json::json!({"kind": "a"}))
                .await
                .unwrap();
        }
        // Simulate a crash mid-write: append a truncated line with no newline.
        {
            let mut file = OpenOptions::new().append(true).open(&events_path).await.unwrap();
            file.write_all(b"{\"record_id\":\"broken").await.unwrap();
        }
        let journal = Journal::open(dir.path(), false).await.unwrap();
        let records = journal.stream(0).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_replay_keeps_latest_per_conversation() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), false).await.unwrap();
        let mut conv = sample_conversation("c1");
        journal.snapshot_conversation(&conv).await.unwrap();
        conv.subject = "updated".into();
        journal.snapshot_conversation(&conv).await.unwrap();
        let replayed = journal.replay_conversations().await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].subject, "updated");
    }
}

//! File Store (§4.8): content-addressed files with permisssions and
//! collaborative edit sessions.
//!
//! Checksums use `sha2::Sha256`, grounded on `build.rs`'s
//! `compute_source_hash` (identical streaming-hash idiom, applied here to
//! uploaded bytes instead of source files). Blob storage lives under
//! `data_dir/files/<checksum>`; `file_index.jsonl` records one line per
//! `File` — an append-only index with soft-delete via a `deleted` flag
//! rather than rewriting the file, since the journal family is append-only
//! throughout this system.

use crate::error::{HubError, Result};
use crate::ids::{FileId, IdGenerator, ParticipantId, SessionId};
use crate::types::{CollabSession, ChangeKind, FileCategory, FileRecord, Permission, Right};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

/// A TTL-bounded share link minted by `FileStore::share` (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareLink {
    pub token: String,
    pub file_id: FileId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            allowed_extensions: vec![
                "txt", "md", "pdf", "doc", "docx", "rs", "py", "js", "ts", "json", "toml", "yaml",
                "png", "jpg", "jpeg", "gif", "zip", "tar", "gz",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

pub struct FileStore {
    root: PathBuf,
    config: FileStoreConfig,
    index: RwLock<HashMap<FileId, FileRecord>>,
    sessions: RwLock<HashMap<SessionId, CollabSession>>,
    shares: RwLock<HashMap<String, ShareLink>>,
    ids: IdGenerator<crate::ids::SystemClock>,
}

impl FileStore {
    pub async fn open(data_dir: &Path, config: FileStoreConfig) -> Result<Self> {
        let root = data_dir.join("files");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let index_path = data_dir.join("file_index.jsonl");
        let mut index = HashMap::new();
        if index_path.exists() {
            let contents = tokio::fs::read_to_string(&index_path)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(record) = serde_json::from_str::<FileRecord>(line) {
                    index.insert(record.id.clone(), record);
                }
            }
        }
        Ok(Self {
            root,
            config,
            index: RwLock::new(index),
            sessions: RwLock::new(HashMap::new()),
            shares: RwLock::new(HashMap::new()),
            ids: IdGenerator::system(),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.root.parent().unwrap_or(&self.root).join("file_index.jsonl")
    }

    fn extension_of(name: &str) -> String {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase()
    }

    fn category_for(extension: &str) -> FileCategory {
        match extension {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" => FileCategory::Image,
            "mp4" | "mov" | "avi" => FileCategory::Video,
            "mp3" | "wav" | "flac" => FileCategory::Audio,
            "rs" | "py" | "js" | "ts" | "go" | "c" | "cpp" => FileCategory::Code,
            "json" | "toml" | "yaml" | "csv" => FileCategory::Data,
            "txt" | "md" | "pdf" | "doc" | "docx" => FileCategory::Document,
            _ => FileCategory::Other,
        }
    }

    /// Uploads `bytes`, validating size and extension, content-addressing
    /// the blob by SHA-256, and appending one `FileRecord` line to the
    /// index (§4.8). Duplicate content shares on-disk storage (§8 property 9).
    pub async fn upload(
        &self,
        name: impl Into<String>,
        bytes: &[u8],
        owner_id: ParticipantId,
        permissions: Vec<Permission>,
        is_public: bool,
    ) -> Result<FileRecord> {
        let name = name.into();
        if bytes.len() as u64 > self.config.max_bytes {
            return Err(HubError::SizeExceeded { size: bytes.len() as u64, limit: self.config.max_bytes });
        }
        let extension = Self::extension_of(&name);
        if !self.config.allowed_extensions.iter().any(|e| e == &extension) {
            return Err(HubError::TypeDisallowed { extension });
        }

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let checksum = hex::encode(hasher.finalize());

        let blob_path = self.root.join(&checksum);
        if !blob_path.exists() {
            let mut file = tokio::fs::File::create(&blob_path)
                .await
                .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
            file.write_all(bytes).await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        }

        let now = Utc::now();
        let record = FileRecord {
            id: FileId::new(self.ids.mint()),
            name,
            size: bytes.len() as u64,
            mime_type: mime_guess_for(&extension),
            category: Self::category_for(&extension),
            owner_id,
            permissions,
            tags: Vec::new(),
            created_at: now,
            modified_at: now,
            checksum,
            is_public,
            download_count: 0,
            deleted: false,
        };

        self.append_index(&record).await?;
        self.index.write().await.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn append_index(&self, record: &FileRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.index_path())
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        file.write_all(line.as_bytes()).await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        file.write_all(b"\n").await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        Ok(())
    }

    pub async fn get(&self, file_id: &FileId) -> Result<FileRecord> {
        self.index
            .read()
            .await
            .get(file_id)
            .filter(|f| !f.deleted)
            .cloned()
            .ok_or_else(|| HubError::NotFound { what: format!("file {}", file_id) })
    }

    pub async fn download(&self, file_id: &FileId) -> Result<Vec<u8>> {
        let record = self.get(file_id).await?;
        let blob_path = self.root.join(&record.checksum);
        let mut file = tokio::fs::File::open(&blob_path)
            .await
            .map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.map_err(|e| HubError::IoFailure { message: e.to_string() })?;
        {
            let mut index = self.index.write().await;
            if let Some(r) = index.get_mut(file_id) {
                r.download_count += 1;
            }
        }
        Ok(bytes)
    }

    pub async fn list(&self, owner_id: Option<&ParticipantId>) -> Vec<FileRecord> {
        self.index
            .read()
            .await
            .values()
            .filter(|f| !f.deleted)
            .filter(|f| owner_id.map(|o| &f.owner_id == o).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Soft-deletes a file if `principal_id` holds `delete` rights or is the
    /// owner (§3: owner implicitly holds all rights).
    pub async fn delete(&self, file_id: &FileId, principal_id: &ParticipantId) -> Result<()> {
        let mut index = self.index.write().await;
        let record = index.get_mut(file_id).ok_or_else(|| HubError::NotFound { what: format!("file {}", file_id) })?;
        let authorized = &record.owner_id == principal_id
            || record
                .permissions
                .iter()
                .any(|p| &p.principal_id == principal_id && p.rights.contains(&Right::Delete));
        if !authorized {
            return Err(HubError::Unauthorized { message: format!("{} cannot delete file {}", principal_id, file_id) });
        }
        record.deleted = true;
        record.modified_at = Utc::now();
        Ok(())
    }

    /// Mints a TTL-bounded share link for `file_id`, requiring ownership or
    /// `Right::Share` (§4.8). `resolve_share` rejects the token once `ttl`
    /// has elapsed.
    pub async fn share(&self, file_id: &FileId, principal_id: &ParticipantId, ttl: Duration) -> Result<ShareLink> {
        let record = self.get(file_id).await?;
        let authorized = &record.owner_id == principal_id
            || record
                .permissions
                .iter()
                .any(|p| &p.principal_id == principal_id && p.rights.contains(&Right::Share));
        if !authorized {
            return Err(HubError::Unauthorized { message: format!("{} cannot share file {}", principal_id, file_id) });
        }
        let now = Utc::now();
        let link = ShareLink {
            token: self.ids.mint(),
            file_id: file_id.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        self.shares.write().await.insert(link.token.clone(), link.clone());
        Ok(link)
    }

    /// Resolves a share token to its file, rejecting unknown or expired
    /// tokens (§4.8).
    pub async fn resolve_share(&self, token: &str) -> Result<FileRecord> {
        let link = self
            .shares
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| HubError::NotFound { what: format!("share token {}", token) })?;
        if Utc::now() > link.expires_at {
            return Err(HubError::NotFound { what: format!("share token {} has expired", token) });
        }
        self.get(&link.file_id).await
    }

    pub async fn create_collaboration_session(&self, file_id: FileId, participants: Vec<ParticipantId>, initial_body: String) -> Result<SessionId> {
        let id = SessionId::new(self.ids.mint());
        let session = CollabSession {
            id: id.clone(),
            file_id,
            participants,
            is_active: true,
            version: 0,
            cursor_map: HashMap::new(),
            changes: Vec::new(),
            body: initial_body,
        };
        self.sessions.write().await.insert(id.clone(), session);
        Ok(id)
    }

    pub async fn join_session(&self, session_id: &SessionId, principal_id: ParticipantId) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::NotFound { what: format!("session {}", session_id) })?;
        if !session.participants.contains(&principal_id) {
            session.participants.push(principal_id);
        }
        Ok(())
    }

    /// Applies one linearized change (§4.8, §8 property 10). No operational
    /// transformation: conflicting edits resolve last-writer-wins at the
    /// target position.
    pub async fn apply_change(&self, session_id: &SessionId, author_id: ParticipantId, kind: ChangeKind, position: usize, payload: String) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| HubError::NotFound { what: format!("session {}", session_id) })?;
        Ok(session.apply_change(author_id, kind, position, payload))
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<CollabSession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound { what: format!("session {}", session_id) })
    }
}

fn mime_guess_for(extension: &str) -> String {
    match extension {
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "toml" => "application/toml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn uploading_same_bytes_twice_dedupes_storage() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let first = store.upload("hello.txt", b"hi", "u1".into(), vec![], false).await.unwrap();
        let second = store.upload("hello.txt", b"hi", "u1".into(), vec![], false).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.checksum, second.checksum);
        let blob_count = std::fs::read_dir(dir.path().join("files")).unwrap().count();
        assert_eq!(blob_count, 1);
    }

    #[tokio::test]
    async fn upload_rejects_oversized_and_disallowed_types() {
        let dir = tempdir().unwrap();
        let config = FileStoreConfig { max_bytes: 4, ..Default::default() };
        let store = FileStore::open(dir.path(), config).await.unwrap();
        let result = store.upload("big.txt", b"too big", "u1".into(), vec![], false).await;
        assert!(matches!(result, Err(HubError::SizeExceeded { .. })));

        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let result = store.upload("script.exe", b"x", "u1".into(), vec![], false).await;
        assert!(matches!(result, Err(HubError::TypeDisallowed { .. })));
    }

    #[tokio::test]
    async fn collab_session_linearizes_changes_across_participants() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let file = store.upload("doc.txt", b"start", "u1".into(), vec![], false).await.unwrap();
        let session_id = store
            .create_collaboration_session(file.id, vec!["u1".into()], String::new())
            .await
            .unwrap();
        store.apply_change(&session_id, "u1".into(), ChangeKind::Insert, 0, "ab".into()).await.unwrap();
        store.apply_change(&session_id, "u2".into(), ChangeKind::Insert, 2, "cd".into()).await.unwrap();
        let session = store.get_session(&session_id).await.unwrap();
        assert_eq!(session.body, "abcd");
        assert_eq!(session.version, 2);
        assert_eq!(session.version as usize, session.changes.len());
    }

    #[tokio::test]
    async fn delete_requires_ownership_or_rights() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let file = store.upload("doc.txt", b"data", "u1".into(), vec![], false).await.unwrap();
        let result = store.delete(&file.id, &"u2".into()).await;
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));
        store.delete(&file.id, &"u1".into()).await.unwrap();
        assert!(store.get(&file.id).await.is_err());
    }

    #[tokio::test]
    async fn share_requires_ownership_or_share_right() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let file = store.upload("doc.txt", b"data", "u1".into(), vec![], false).await.unwrap();

        let result = store.share(&file.id, &"u2".into(), Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(HubError::Unauthorized { .. })));

        let link = store.share(&file.id, &"u1".into(), Duration::from_secs(3600)).await.unwrap();
        let resolved = store.resolve_share(&link.token).await.unwrap();
        assert_eq!(resolved.id, file.id);
    }

    #[tokio::test]
    async fn resolve_share_rejects_expired_token() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), FileStoreConfig::default()).await.unwrap();
        let file = store.upload("doc.txt", b"data", "u1".into(), vec![], false).await.unwrap();
        let link = store.share(&file.id, &"u1".into(), Duration::from_secs(0)).await.unwrap();
        let result = store.resolve_share(&link.token).await;
        assert!(matches!(result, Err(HubError::NotFound { .. })));
    }
}

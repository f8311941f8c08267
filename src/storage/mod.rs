//! Durable session store: crash-safe JSONL records with a directory-level
//! index, per-session file locks, history budget trimming, and
//! quarantine-on-corruption (§4.1).
//!
//! Grounded in the shape of a conventional `Storage` API (method naming,
//! an async `with_timeout`-style wrapper) but the persistence model itself
//! is JSONL + file locks, not SQLite — the durability invariants in the
//! spec (prefix-append economy, atomic rewrite, mutual index/file
//! recoverability) are impossible to express faithfully over a database
//! connection pool.

pub mod atomic;
pub mod lock;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::GatewayError;
use lock::LockOptions;

// ── Data model (§3) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub sha256: String,
    pub bytes: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "imageRefs", skip_serializing_if = "Option::is_none")]
    pub image_refs: Option<Vec<ImageRef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionOrigin {
    pub channel: String,
    #[serde(rename = "workspaceId", skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(rename = "chatId", skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "threadId", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillInjectionMode {
    Off,
    All,
    Relevant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionOrigin>,
    #[serde(rename = "providerRouteId", skip_serializing_if = "Option::is_none")]
    pub provider_route_id: Option<String>,
    #[serde(rename = "skillInjectionMode", skip_serializing_if = "Option::is_none")]
    pub skill_injection_mode: Option<SkillInjectionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "activeProviderId", skip_serializing_if = "Option::is_none")]
    pub active_provider_id: Option<String>,
    #[serde(rename = "pendingProviderId", skip_serializing_if = "Option::is_none")]
    pub pending_provider_id: Option<String>,
    pub history: Vec<ChatMessage>,
    pub metadata: SessionMetadata,
    pub revision: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// One line in the full-log file: either a chat message or a runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum FullLogLine {
    #[serde(rename = "message")]
    Message {
        #[serde(flatten)]
        message: ChatMessage,
        version: u32,
    },
    #[serde(rename = "event")]
    Event {
        #[serde(rename = "eventType")]
        event_type: String,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
        version: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "activeProviderId", skip_serializing_if = "Option::is_none")]
    pub active_provider_id: Option<String>,
    #[serde(rename = "pendingProviderId", skip_serializing_if = "Option::is_none")]
    pub pending_provider_id: Option<String>,
    #[serde(rename = "historyCount")]
    pub history_count: usize,
    pub revision: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionOrigin>,
    #[serde(rename = "providerRouteId", skip_serializing_if = "Option::is_none")]
    pub provider_route_id: Option<String>,
    #[serde(rename = "skillInjectionMode", skip_serializing_if = "Option::is_none")]
    pub skill_injection_mode: Option<SkillInjectionMode>,
    #[serde(rename = "transcriptFile")]
    pub transcript_file: String,
    #[serde(rename = "fullFile")]
    pub full_file: String,
}

// ── Filenames ────────────────────────────────────────────────────────────

fn encode_session_id(session_id: &str) -> String {
    urlencoding::encode(session_id).into_owned()
}

fn transcript_filename(session_id: &str) -> String {
    format!("{}.jsonl", encode_session_id(session_id))
}

fn full_filename(session_id: &str) -> String {
    format!("{}.full.jsonl", encode_session_id(session_id))
}

fn lock_filename(session_id: &str) -> String {
    format!("{}.lock", encode_session_id(session_id))
}

const INDEX_FILE: &str = ".drost-sessions-index.jsonl";
const INDEX_LOCK_FILE: &str = ".drost-sessions-index.lock";
const CORRUPT_DIR: &str = ".drost-sessions-corrupt";
const ARCHIVE_DIR: &str = ".drost-sessions-archive";

/// Deterministic channel-identity → sessionId mapping (§3 invariant).
pub fn resolve_channel_session_id(
    prefix: &str,
    channel: &str,
    workspace_id: Option<&str>,
    best_id: &str,
    max_len: usize,
) -> String {
    let workspace = workspace_id.unwrap_or("global");
    let joined = format!("{prefix}:{channel}:{workspace}:{best_id}");
    if joined.len() <= max_len {
        return joined;
    }
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);
    format!("{prefix}:{channel}:{}", &hex[..20.min(hex.len())])
}

// ── Store ────────────────────────────────────────────────────────────────

pub struct LoadDiagnostic {
    pub quarantined_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    #[serde(rename = "dryRun")]
    pub dry_run: bool,
    pub archived: Vec<String>,
}

pub struct HistoryBudgetPolicy {
    pub enabled: bool,
    pub max_messages: Option<usize>,
    pub max_chars: Option<usize>,
    pub preserve_system_messages: bool,
}

impl Default for HistoryBudgetPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: None,
            max_chars: None,
            preserve_system_messages: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct HistoryBudgetReport {
    pub trimmed: bool,
    pub dropped_messages: usize,
    pub dropped_characters: usize,
}

/// Trim `history` in place per §4.1's history-budget rule. Returns a report
/// of what was dropped.
pub fn apply_session_history_budget(
    history: &mut Vec<ChatMessage>,
    policy: &HistoryBudgetPolicy,
) -> HistoryBudgetReport {
    let mut report = HistoryBudgetReport::default();
    if !policy.enabled {
        return report;
    }

    let leading_system = if policy.preserve_system_messages {
        history.iter().take_while(|m| m.role == Role::System).count()
    } else {
        0
    };

    if let Some(max_messages) = policy.max_messages {
        if history.len() > max_messages {
            let overflow = history.len() - max_messages;
            let removable: Vec<usize> = (leading_system..history.len())
                .take(overflow)
                .collect();
            for &idx in removable.iter().rev() {
                history.remove(idx);
                report.dropped_messages += 1;
            }
            report.trimmed = true;
        }
    }

    if let Some(max_chars) = policy.max_chars {
        let mut total: usize = history.iter().map(|m| m.content.len()).sum();
        let mut idx = leading_system;
        while total > max_chars && idx < history.len() {
            let removed = history.remove(idx);
            total -= removed.content.len();
            report.dropped_characters += removed.content.len();
            report.dropped_messages += 1;
            report.trimmed = true;
            // Don't advance idx — the next element has shifted into place.
        }
    }

    report
}

pub struct SessionStore {
    session_dir: PathBuf,
}

impl SessionStore {
    pub async fn new(session_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&session_dir).await?;
        tokio::fs::create_dir_all(session_dir.join(CORRUPT_DIR)).await?;
        tokio::fs::create_dir_all(session_dir.join(ARCHIVE_DIR)).await?;
        Ok(Self { session_dir })
    }

    fn lock_opts() -> LockOptions {
        LockOptions::default()
    }

    /// Save `record`, enforcing revision monotonicity and choosing between
    /// prefix-append and atomic rewrite per §4.1 step 5.
    pub async fn save_session_record(&self, mut record: SessionRecord) -> Result<SessionRecord> {
        let session_id = record.session_id.clone();
        let session_lock = self.session_dir.join(lock_filename(&session_id));

        lock::with_lock(&session_lock, &Self::lock_opts(), || async {
            let previous = self.read_full_log(&session_id).await.unwrap_or_default();
            let prev_messages: Vec<&ChatMessage> = previous
                .iter()
                .filter_map(|l| match l {
                    FullLogLine::Message { message, .. } => Some(message),
                    FullLogLine::Event { .. } => None,
                })
                .collect();

            let prev_revision = self
                .read_index_entry(&session_id)
                .await?
                .map(|e| e.revision)
                .unwrap_or(0);
            record.revision = prev_revision + 1;

            record.metadata.last_activity_at = record
                .history
                .iter()
                .map(|m| m.created_at)
                .max()
                .unwrap_or_else(Utc::now);
            record.updated_at = Utc::now();

            let is_prefix = record.history.len() >= prev_messages.len()
                && prev_messages
                    .iter()
                    .zip(record.history.iter())
                    .all(|(a, b)| messages_equal(a, b));

            let full_path = self.session_dir.join(full_filename(&session_id));
            let transcript_path = self.session_dir.join(transcript_filename(&session_id));

            if is_prefix && !previous.is_empty() {
                let suffix = &record.history[prev_messages.len()..];
                let mut full_append = String::new();
                let mut transcript_append = String::new();
                for m in suffix {
                    let line = FullLogLine::Message {
                        message: m.clone(),
                        version: 1,
                    };
                    full_append.push_str(&serde_json::to_string(&line)?);
                    full_append.push('\n');
                    if matches!(m.role, Role::User | Role::Assistant) {
                        transcript_append.push_str(&serde_json::to_string(&to_message_line(m))?);
                        transcript_append.push('\n');
                    }
                }
                atomic::append(&full_path, full_append.as_bytes()).await?;
                if !transcript_append.is_empty() {
                    atomic::append(&transcript_path, transcript_append.as_bytes()).await?;
                }
            } else {
                // Rewrite: preserve existing event lines, re-emitting them
                // before the message lines, then write every message.
                let mut full_body = String::new();
                for line in previous.iter() {
                    if let FullLogLine::Event { .. } = line {
                        full_body.push_str(&serde_json::to_string(line)?);
                        full_body.push('\n');
                    }
                }
                let mut transcript_body = String::new();
                for m in &record.history {
                    let line = FullLogLine::Message {
                        message: m.clone(),
                        version: 1,
                    };
                    full_body.push_str(&serde_json::to_string(&line)?);
                    full_body.push('\n');
                    if matches!(m.role, Role::User | Role::Assistant) {
                        transcript_body.push_str(&serde_json::to_string(&to_message_line(m))?);
                        transcript_body.push('\n');
                    }
                }
                atomic::write(&full_path, full_body.as_bytes()).await?;
                atomic::write(&transcript_path, transcript_body.as_bytes()).await?;
            }

            self.upsert_index_entry(&session_id, &record).await?;
            Ok(record.clone())
        })
        .await
    }

    /// Load a session record by id, quarantining the file on corruption.
    pub async fn load_session_record(
        &self,
        session_id: &str,
    ) -> Result<std::result::Result<SessionRecord, LoadDiagnostic>> {
        let full_path = self.session_dir.join(full_filename(session_id));
        let raw = match tokio::fs::read_to_string(&full_path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(session_id.to_string()).into())
            }
            Err(e) => return Err(e).context("failed to read session full-log"),
        };

        match self.parse_full_log(&raw) {
            Ok(lines) => {
                let messages: Vec<ChatMessage> = lines
                    .into_iter()
                    .filter_map(|l| match l {
                        FullLogLine::Message { message, .. } => Some(message),
                        FullLogLine::Event { .. } => None,
                    })
                    .collect();
                let index = self.read_index_entry(session_id).await?;
                let (created_at, revision) = index
                    .as_ref()
                    .map(|e| (e.created_at, e.revision))
                    .unwrap_or((Utc::now(), 0));
                let metadata = SessionMetadata {
                    created_at,
                    last_activity_at: messages
                        .iter()
                        .map(|m| m.created_at)
                        .max()
                        .unwrap_or(created_at),
                    title: index.as_ref().and_then(|e| e.title.clone()),
                    origin: index.as_ref().and_then(|e| e.origin.clone()),
                    provider_route_id: index.as_ref().and_then(|e| e.provider_route_id.clone()),
                    skill_injection_mode: index.as_ref().and_then(|e| e.skill_injection_mode),
                };
                Ok(Ok(SessionRecord {
                    session_id: session_id.to_string(),
                    active_provider_id: index.as_ref().and_then(|e| e.active_provider_id.clone()),
                    pending_provider_id: index
                        .as_ref()
                        .and_then(|e| e.pending_provider_id.clone()),
                    history: messages,
                    metadata,
                    revision,
                    updated_at: index.map(|e| e.updated_at).unwrap_or_else(Utc::now),
                }))
            }
            Err(reason) => {
                let quarantined = self.quarantine(session_id, &full_path).await?;
                self.remove_index_entry(session_id).await.ok();
                Ok(Err(LoadDiagnostic {
                    quarantined_path: quarantined,
                    reason,
                }))
            }
        }
    }

    async fn quarantine(&self, session_id: &str, full_path: &Path) -> Result<PathBuf> {
        let t = Utc::now().timestamp_millis();
        let rand = std::process::id();
        let dest = self.session_dir.join(CORRUPT_DIR).join(format!(
            "{}-{t}-{rand}.jsonl",
            encode_session_id(session_id)
        ));
        if full_path.exists() {
            tokio::fs::rename(full_path, &dest).await.ok();
        }
        let transcript = self.session_dir.join(transcript_filename(session_id));
        tokio::fs::remove_file(&transcript).await.ok();
        warn!(session_id, dest = %dest.display(), "quarantined corrupt session file");
        Ok(dest)
    }

    /// Delete a session's files and its index entry.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let lock_path = self.session_dir.join(lock_filename(session_id));
        lock::with_lock(&lock_path, &Self::lock_opts(), || async {
            tokio::fs::remove_file(self.session_dir.join(full_filename(session_id)))
                .await
                .ok();
            tokio::fs::remove_file(self.session_dir.join(transcript_filename(session_id)))
                .await
                .ok();
            self.remove_index_entry(session_id).await?;
            Ok(())
        })
        .await
    }

    /// Rename a session id, adopting the safer non-destructive ordering
    /// from §9/§4.1: move-source-to-temp, rename-target-to-trash (if
    /// `overwrite`), rename-source-to-target, unlink-trash. A crash at any
    /// step leaves either the original or the fully-renamed pair on disk.
    pub async fn rename_session(&self, old_id: &str, new_id: &str, overwrite: bool) -> Result<()> {
        let old_full = self.session_dir.join(full_filename(old_id));
        let old_transcript = self.session_dir.join(transcript_filename(old_id));
        let new_full = self.session_dir.join(full_filename(new_id));
        let new_transcript = self.session_dir.join(transcript_filename(new_id));

        if !overwrite && (new_full.exists() || new_transcript.exists()) {
            return Err(GatewayError::AlreadyExists(new_id.to_string()).into());
        }

        let tmp_full = self.session_dir.join(format!("{}.tmp-rename", full_filename(old_id)));
        let tmp_transcript = self
            .session_dir
            .join(format!("{}.tmp-rename", transcript_filename(old_id)));
        let trash_full = self.session_dir.join(format!("{}.trash", full_filename(new_id)));
        let trash_transcript = self
            .session_dir
            .join(format!("{}.trash", transcript_filename(new_id)));

        if old_full.exists() {
            tokio::fs::rename(&old_full, &tmp_full).await?;
        }
        if old_transcript.exists() {
            tokio::fs::rename(&old_transcript, &tmp_transcript).await?;
        }

        if overwrite {
            if new_full.exists() {
                tokio::fs::rename(&new_full, &trash_full).await?;
            }
            if new_transcript.exists() {
                tokio::fs::rename(&new_transcript, &trash_transcript).await?;
            }
        }

        if tmp_full.exists() {
            tokio::fs::rename(&tmp_full, &new_full).await?;
        }
        if tmp_transcript.exists() {
            tokio::fs::rename(&tmp_transcript, &new_transcript).await?;
        }

        tokio::fs::remove_file(&trash_full).await.ok();
        tokio::fs::remove_file(&trash_transcript).await.ok();

        if let Some(mut entry) = self.read_index_entry(old_id).await? {
            entry.session_id = new_id.to_string();
            entry.transcript_file = transcript_filename(new_id);
            entry.full_file = full_filename(new_id);
            self.remove_index_entry(old_id).await?;
            self.write_index_entry_raw(entry).await?;
        }

        Ok(())
    }

    // ── Index ────────────────────────────────────────────────────────────

    async fn read_all_index_entries(&self) -> Result<Vec<SessionIndexEntry>> {
        let path = self.session_dir.join(INDEX_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("failed to read session index"),
        };
        let mut out = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionIndexEntry>(line) {
                Ok(entry) => out.push(entry),
                Err(_) => continue, // tolerate torn lines
            }
        }
        Ok(out)
    }

    pub async fn read_index_entry(&self, session_id: &str) -> Result<Option<SessionIndexEntry>> {
        Ok(self
            .read_all_index_entries()
            .await?
            .into_iter()
            .find(|e| e.session_id == session_id))
    }

    pub async fn list_index(&self) -> Result<Vec<SessionIndexEntry>> {
        self.read_all_index_entries().await
    }

    async fn upsert_index_entry(&self, session_id: &str, record: &SessionRecord) -> Result<()> {
        let index_lock = self.session_dir.join(INDEX_LOCK_FILE);
        lock::with_lock(&index_lock, &Self::lock_opts(), || async {
            let mut entries = self.read_all_index_entries().await?;
            entries.retain(|e| e.session_id != session_id);
            entries.push(SessionIndexEntry {
                version: 1,
                kind: "session_index".to_string(),
                session_id: session_id.to_string(),
                active_provider_id: record.active_provider_id.clone(),
                pending_provider_id: record.pending_provider_id.clone(),
                history_count: record.history.len(),
                revision: record.revision,
                updated_at: record.updated_at,
                created_at: record.metadata.created_at,
                last_activity_at: record.metadata.last_activity_at,
                title: record.metadata.title.clone(),
                origin: record.metadata.origin.clone(),
                provider_route_id: record.metadata.provider_route_id.clone(),
                skill_injection_mode: record.metadata.skill_injection_mode,
                transcript_file: transcript_filename(session_id),
                full_file: full_filename(session_id),
            });
            entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            self.write_index(&entries).await
        })
        .await
    }

    async fn write_index_entry_raw(&self, entry: SessionIndexEntry) -> Result<()> {
        let index_lock = self.session_dir.join(INDEX_LOCK_FILE);
        lock::with_lock(&index_lock, &Self::lock_opts(), || async {
            let mut entries = self.read_all_index_entries().await?;
            entries.retain(|e| e.session_id != entry.session_id);
            entries.push(entry);
            entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            self.write_index(&entries).await
        })
        .await
    }

    async fn remove_index_entry(&self, session_id: &str) -> Result<()> {
        let index_lock = self.session_dir.join(INDEX_LOCK_FILE);
        lock::with_lock(&index_lock, &Self::lock_opts(), || async {
            let mut entries = self.read_all_index_entries().await?;
            let before = entries.len();
            entries.retain(|e| e.session_id != session_id);
            if entries.len() != before {
                self.write_index(&entries).await?;
            }
            Ok(())
        })
        .await
    }

    async fn write_index(&self, entries: &[SessionIndexEntry]) -> Result<()> {
        let mut body = String::new();
        for e in entries {
            body.push_str(&serde_json::to_string(e)?);
            body.push('\n');
        }
        atomic::write(&self.session_dir.join(INDEX_FILE), body.as_bytes()).await
    }

    /// Rebuild the index from `*.full.jsonl` files, for recovery when the
    /// index itself is lost (§3 invariant: mutual recoverability).
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut rebuilt = 0;
        let mut dir = tokio::fs::read_dir(&self.session_dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(enc_id) = name.strip_suffix(".full.jsonl") {
                let session_id = urlencoding::decode(enc_id)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| enc_id.to_string());
                if let Ok(loaded) = self.load_session_record(&session_id).await {
                    if let Ok(record) = loaded {
                        entries.push(SessionIndexEntry {
                            version: 1,
                            kind: "session_index".to_string(),
                            session_id: session_id.clone(),
                            active_provider_id: record.active_provider_id.clone(),
                            pending_provider_id: record.pending_provider_id.clone(),
                            history_count: record.history.len(),
                            revision: record.revision.max(1),
                            updated_at: record.updated_at,
                            created_at: record.metadata.created_at,
                            last_activity_at: record.metadata.last_activity_at,
                            title: record.metadata.title.clone(),
                            origin: record.metadata.origin.clone(),
                            provider_route_id: record.metadata.provider_route_id.clone(),
                            skill_injection_mode: record.metadata.skill_injection_mode,
                            transcript_file: transcript_filename(&session_id),
                            full_file: full_filename(&session_id),
                        });
                        rebuilt += 1;
                    }
                }
            }
        }
        self.write_index(&entries).await?;
        Ok(rebuilt)
    }

    // ── Retention ────────────────────────────────────────────────────────

    /// Index entries whose `lastActivityAt` is older than `older_than_days`,
    /// oldest first — the candidate set `GET /sessions/retention` reports
    /// and `POST /sessions/prune` acts on.
    pub async fn retention_candidates(&self, older_than_days: u32) -> Result<Vec<SessionIndexEntry>> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let mut entries: Vec<SessionIndexEntry> = self
            .read_all_index_entries()
            .await?
            .into_iter()
            .filter(|e| e.last_activity_at < cutoff)
            .collect();
        entries.sort_by_key(|e| e.last_activity_at);
        Ok(entries)
    }

    /// Move a session's transcript and full-log into `.drost-sessions-
    /// archive/` and drop its index entry. The archived files are left
    /// byte-identical so an operator can restore them by hand.
    pub async fn archive_session(&self, session_id: &str) -> Result<()> {
        let lock_path = self.session_dir.join(lock_filename(session_id));
        lock::with_lock(&lock_path, &Self::lock_opts(), || async {
            let archive_dir = self.session_dir.join(ARCHIVE_DIR);
            for name in [full_filename(session_id), transcript_filename(session_id)] {
                let src = self.session_dir.join(&name);
                if src.exists() {
                    tokio::fs::rename(&src, archive_dir.join(&name)).await?;
                }
            }
            self.remove_index_entry(session_id).await?;
            Ok(())
        })
        .await
    }

    /// Retention sweep: archive-then-drop every session older than
    /// `older_than_days`. With `dry_run`, only reports what would be
    /// archived and touches no files.
    pub async fn prune(&self, older_than_days: u32, dry_run: bool) -> Result<PruneReport> {
        let candidates = self.retention_candidates(older_than_days).await?;
        let session_ids: Vec<String> = candidates.iter().map(|e| e.session_id.clone()).collect();
        if dry_run {
            return Ok(PruneReport { dry_run: true, archived: session_ids });
        }
        for session_id in &session_ids {
            self.archive_session(session_id).await?;
        }
        Ok(PruneReport { dry_run: false, archived: session_ids })
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn read_full_log(&self, session_id: &str) -> Result<Vec<FullLogLine>> {
        let path = self.session_dir.join(full_filename(session_id));
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => self
                .parse_full_log(&raw)
                .map_err(|e| anyhow::anyhow!("corrupt full-log: {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn parse_full_log(&self, raw: &str) -> std::result::Result<Vec<FullLogLine>, String> {
        let mut out = Vec::new();
        for (i, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FullLogLine>(line) {
                Ok(parsed) => out.push(parsed),
                Err(e) => return Err(format!("line {i}: {e}")),
            }
        }
        Ok(out)
    }
}

fn messages_equal(a: &ChatMessage, b: &ChatMessage) -> bool {
    a.role == b.role && a.content == b.content && a.created_at == b.created_at
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageLine {
    version: u32,
    #[serde(rename = "type")]
    kind: String,
    role: Role,
    content: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

fn to_message_line(m: &ChatMessage) -> MessageLine {
    MessageLine {
        version: 1,
        kind: "message".to_string(),
        role: m.role,
        content: m.content.clone(),
        created_at: m.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            image_refs: None,
        }
    }

    fn blank_record(session_id: &str, history: Vec<ChatMessage>) -> SessionRecord {
        SessionRecord {
            session_id: session_id.to_string(),
            active_provider_id: None,
            pending_provider_id: None,
            history,
            metadata: SessionMetadata {
                created_at: Utc::now(),
                last_activity_at: Utc::now(),
                title: None,
                origin: None,
                provider_route_id: None,
                skill_injection_mode: None,
            },
            revision: 0,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn revision_increments_on_each_save() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();

        let r1 = store
            .save_session_record(blank_record("alpha", vec![msg(Role::User, "hi")]))
            .await
            .unwrap();
        assert_eq!(r1.revision, 1);

        let r2 = store
            .save_session_record(blank_record(
                "alpha",
                vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello")],
            ))
            .await
            .unwrap();
        assert_eq!(r2.revision, 2);
    }

    #[tokio::test]
    async fn prefix_append_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();

        store
            .save_session_record(blank_record("alpha", vec![msg(Role::User, "hi")]))
            .await
            .unwrap();
        store
            .save_session_record(blank_record(
                "alpha",
                vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello")],
            ))
            .await
            .unwrap();

        let mut dir_entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(e) = dir_entries.next_entry().await.unwrap() {
            let name = e.file_name().to_string_lossy().into_owned();
            assert!(!name.contains(".tmp-"), "leftover temp file: {name}");
        }
    }

    #[tokio::test]
    async fn load_round_trips_history() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        store
            .save_session_record(blank_record(
                "alpha",
                vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello")],
            ))
            .await
            .unwrap();

        let loaded = store.load_session_record("alpha").await.unwrap().unwrap();
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[1].content, "hello");
    }

    #[tokio::test]
    async fn corrupt_full_log_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        let full_path = dir.path().join(full_filename("alpha"));
        tokio::fs::write(&full_path, b"not json\n").await.unwrap();

        let result = store.load_session_record("alpha").await.unwrap();
        assert!(result.is_err());
        assert!(!full_path.exists());
    }

    #[tokio::test]
    async fn index_has_no_duplicate_session_ids_after_repeated_saves() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        for i in 0..3 {
            store
                .save_session_record(blank_record(
                    "alpha",
                    vec![msg(Role::User, &format!("turn {i}"))],
                ))
                .await
                .unwrap();
        }
        let entries = store.list_index().await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.session_id == "alpha").count(), 1);
    }

    #[tokio::test]
    async fn rename_moves_both_files_and_index_entry() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        store
            .save_session_record(blank_record("alpha", vec![msg(Role::User, "hi")]))
            .await
            .unwrap();

        store.rename_session("alpha", "beta", false).await.unwrap();

        assert!(store.load_session_record("beta").await.unwrap().is_ok());
        assert!(store.read_index_entry("alpha").await.unwrap().is_none());
        assert!(store.read_index_entry("beta").await.unwrap().is_some());
    }

    #[test]
    fn history_budget_trims_by_message_count_preserving_system() {
        let mut history = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "1"),
            msg(Role::Assistant, "2"),
            msg(Role::User, "3"),
        ];
        let policy = HistoryBudgetPolicy {
            enabled: true,
            max_messages: Some(2),
            max_chars: None,
            preserve_system_messages: true,
        };
        let report = apply_session_history_budget(&mut history, &policy);
        assert!(report.trimmed);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::System);
    }

    #[tokio::test]
    async fn prune_dry_run_reports_without_touching_files() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        store
            .save_session_record(blank_record("alpha", vec![msg(Role::User, "hi")]))
            .await
            .unwrap();

        let report = store.prune(0, true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.archived, vec!["alpha".to_string()]);
        assert!(store.read_index_entry("alpha").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_archives_and_removes_from_index() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf()).await.unwrap();
        store
            .save_session_record(blank_record("alpha", vec![msg(Role::User, "hi")]))
            .await
            .unwrap();

        let report = store.prune(0, false).await.unwrap();
        assert!(!report.dry_run);
        assert_eq!(report.archived, vec!["alpha".to_string()]);
        assert!(store.read_index_entry("alpha").await.unwrap().is_none());
        assert!(dir.path().join(ARCHIVE_DIR).join(full_filename("alpha")).exists());
    }

    #[test]
    fn channel_identity_mapping_is_deterministic() {
        let a = resolve_channel_session_id("drost", "telegram", Some("ws1"), "chat42", 200);
        let b = resolve_channel_session_id("drost", "telegram", Some("ws1"), "chat42", 200);
        assert_eq!(a, b);
    }

    #[test]
    fn long_channel_identity_collapses_to_hash() {
        let long_id = "x".repeat(500);
        let id = resolve_channel_session_id("drost", "telegram", Some("ws1"), &long_id, 64);
        assert!(id.starts_with("drost:telegram:"));
        assert!(id.len() < 100);
    }
}

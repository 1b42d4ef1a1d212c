//! Index delta/full sync.
//!
//! The producer streams Family file metadata changed since the requester's
//! high-water mark in batches of 100, plus fresh tombstones. The consumer
//! folds records into the remote-file shadow table with last-write-wins
//! merging (sync_version, then modified_at, then device id) and a union of
//! user tags. Private files never leave the device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::index::TOMBSTONE_TTL_SECS;
use crate::net::peer::{PeerHandle, SEND_AND_WAIT_TIMEOUT};
use crate::net::transport::codec::{MessageType, WireMessage};
use crate::types::{now_ts, Visibility};

pub const SYNC_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Unix-seconds high-water mark; records with `modified_at > since`.
    pub since: i64,
    pub full_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFileRecord {
    /// File id on the source device.
    pub remote_id: i64,
    pub relative_path: String,
    pub name: String,
    pub extension: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: Option<String>,
    pub sync_version: i64,
    pub last_modified_by: Option<String>,
    /// User tags only; auto tags are regenerated locally.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTombstone {
    pub checksum: String,
    pub deleted_at: i64,
    pub deleted_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub device_id: String,
    pub batch: u32,
    pub is_last: bool,
    pub total: u64,
    pub records: Vec<SyncFileRecord>,
    pub tombstones: Vec<SyncTombstone>,
    /// Complete Family checksum set; only on a full sync, only in the last
    /// batch. Feeds resurrection-candidate detection on the requester.
    pub checksums: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    pub device_id: String,
    pub records: Vec<SyncFileRecord>,
    pub tombstones: Vec<SyncTombstone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDeltaAck {
    pub received: u64,
}

/// Progress snapshot reported upward during a sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub device_id: String,
    pub total_files: u64,
    pub received_files: u64,
    pub sent_files: u64,
    pub is_complete: bool,
}

/// Outcome of a completed inbound sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub device_id: String,
    pub received_files: u64,
    pub applied_tombstones: u64,
    /// Checksums a peer still carries that we tombstoned recently. Surfaced
    /// upward; never auto-applied.
    pub resurrection_candidates: Vec<String>,
}

pub type SyncProgressFn = Arc<dyn Fn(SyncProgress) + Send + Sync>;
pub type SyncCompleteFn = Arc<dyn Fn(SyncSummary) + Send + Sync>;

#[derive(Default)]
struct InboundSession {
    received: u64,
    applied_tombstones: u64,
    max_sync_version: i64,
    resurrection_candidates: Vec<String>,
}

pub struct IndexSyncManager {
    db: Arc<Database>,
    device_id: String,
    inbound: Mutex<HashMap<String, InboundSession>>,
    on_progress: Mutex<Option<SyncProgressFn>>,
    on_complete: Mutex<Option<SyncCompleteFn>>,
}

impl IndexSyncManager {
    pub fn new(db: Arc<Database>, device_id: String) -> Self {
        Self {
            db,
            device_id,
            inbound: Mutex::new(HashMap::new()),
            on_progress: Mutex::new(None),
            on_complete: Mutex::new(None),
        }
    }

    pub fn set_progress_callback(&self, cb: SyncProgressFn) {
        *self.on_progress.lock().unwrap() = Some(cb);
    }

    pub fn set_complete_callback(&self, cb: SyncCompleteFn) {
        *self.on_complete.lock().unwrap() = Some(cb);
    }

    // ---- requester side --------------------------------------------------

    /// Kick off a sync with a connected peer. Responses arrive through the
    /// dispatcher; this only sends the request.
    pub async fn sync_with(&self, peer: &PeerHandle) -> Result<()> {
        let state = self.sync_state(&peer.device_id).await?;
        let stale = state.last_sync_at > 0
            && now_ts() - state.last_sync_at > TOMBSTONE_TTL_SECS;
        let full_sync = state.needs_full_resync || stale;
        if stale && !state.needs_full_resync {
            self.set_needs_full_resync(&peer.device_id, true).await?;
        }
        let since = if full_sync { 0 } else { state.last_sync_at };

        self.inbound
            .lock()
            .unwrap()
            .insert(peer.device_id.clone(), InboundSession::default());

        let request = WireMessage::json(
            MessageType::IndexSyncRequest,
            &SyncRequest { since, full_sync },
        )?;
        peer.send_message(&request).await?;
        info!(peer = %peer.device_id, since, full_sync, "index sync requested");
        Ok(())
    }

    /// Fold one `IndexSyncResponse` into the shadow table.
    pub async fn handle_response(&self, peer: &PeerHandle, message: &WireMessage) -> Result<()> {
        let response: SyncResponse = message.parse()?;
        let source = &response.device_id;
        if source != &peer.device_id {
            return Err(Error::Network("sync response from impostor device".into()));
        }

        let mut applied = 0u64;
        let mut max_version = 0i64;
        for record in &response.records {
            self.apply_record(source, record).await?;
            max_version = max_version.max(record.sync_version);
            applied += 1;
        }
        let mut tombstoned = 0u64;
        for tombstone in &response.tombstones {
            tombstoned += self.apply_tombstone(source, tombstone).await?;
        }
        let resurrection = match &response.checksums {
            Some(checksums) => self.resurrection_candidates(checksums).await?,
            None => Vec::new(),
        };

        let (received_total, finished) = {
            let mut sessions = self.inbound.lock().unwrap();
            let session = sessions.entry(source.clone()).or_default();
            session.received += applied;
            session.applied_tombstones += tombstoned;
            session.max_sync_version = session.max_sync_version.max(max_version);
            session.resurrection_candidates.extend(resurrection);
            let received_total = session.received;
            let finished = if response.is_last {
                let session = sessions.remove(source).unwrap_or_default();
                let summary = SyncSummary {
                    device_id: source.clone(),
                    received_files: session.received,
                    applied_tombstones: session.applied_tombstones,
                    resurrection_candidates: session.resurrection_candidates,
                };
                Some((summary, session.max_sync_version))
            } else {
                None
            };
            (received_total, finished)
        };

        self.report_progress(SyncProgress {
            device_id: source.clone(),
            total_files: response.total,
            received_files: received_total,
            sent_files: 0,
            is_complete: response.is_last,
        });

        if let Some((summary, overall_max_version)) = finished {
            self.update_sync_state(source, overall_max_version).await?;
            info!(
                peer = %source,
                received = summary.received_files,
                tombstones = summary.applied_tombstones,
                "index sync complete"
            );
            if let Some(cb) = self.on_complete.lock().unwrap().as_ref() {
                cb(summary);
            }
        }
        Ok(())
    }

    /// Handle a pushed `IndexDelta`; replies with an ack on the same id.
    pub async fn handle_delta(&self, peer: &PeerHandle, message: &WireMessage) -> Result<()> {
        let delta: SyncDelta = message.parse()?;
        if delta.device_id != peer.device_id {
            return Err(Error::Network("delta from impostor device".into()));
        }
        let mut received = 0u64;
        for record in &delta.records {
            self.apply_record(&delta.device_id, record).await?;
            received += 1;
        }
        for tombstone in &delta.tombstones {
            self.apply_tombstone(&delta.device_id, tombstone).await?;
        }
        let ack = WireMessage::json_reply(
            MessageType::IndexDeltaAck,
            message.request_id.clone(),
            &SyncDeltaAck { received },
        )?;
        peer.send_message(&ack).await
    }

    // ---- producer side ---------------------------------------------------

    /// Answer an `IndexSyncRequest` by streaming response batches.
    pub async fn handle_request(&self, peer: &PeerHandle, message: &WireMessage) -> Result<()> {
        let request: SyncRequest = message.parse()?;
        let records = self.local_changes_since(request.since).await?;
        let tombstones = self.tombstones_since(request.since).await?;
        let total = records.len() as u64;
        debug!(
            peer = %peer.device_id,
            since = request.since,
            files = total,
            tombstones = tombstones.len(),
            "serving index sync"
        );

        let mut sent = 0u64;
        let mut batch_index = 0u32;
        let mut batches: Vec<Vec<SyncFileRecord>> = records
            .chunks(SYNC_BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        let last_index = batches.len() - 1;

        for (i, batch) in batches.into_iter().enumerate() {
            let is_last = i == last_index;
            sent += batch.len() as u64;
            let response = SyncResponse {
                device_id: self.device_id.clone(),
                batch: batch_index,
                is_last,
                total,
                records: batch,
                tombstones: if is_last { tombstones.clone() } else { Vec::new() },
                checksums: if is_last && request.full_sync {
                    Some(self.family_checksums().await?)
                } else {
                    None
                },
            };
            let reply = WireMessage::json_reply(
                MessageType::IndexSyncResponse,
                message.request_id.clone(),
                &response,
            )?;
            peer.send_message(&reply).await?;
            batch_index += 1;

            self.report_progress(SyncProgress {
                device_id: peer.device_id.clone(),
                total_files: total,
                received_files: 0,
                sent_files: sent,
                is_complete: is_last,
            });
        }
        Ok(())
    }

    /// Push local changes since `since` as one acknowledged delta.
    pub async fn push_changes(&self, peer: &PeerHandle, since: i64) -> Result<u64> {
        let records = self.local_changes_since(since).await?;
        let tombstones = self.tombstones_since(since).await?;
        if records.is_empty() && tombstones.is_empty() {
            return Ok(0);
        }
        let pushed = records.len() as u64;
        let delta = WireMessage::json(
            MessageType::IndexDelta,
            &SyncDelta {
                device_id: self.device_id.clone(),
                records,
                tombstones,
            },
        )?;
        let reply = peer.send_and_wait(&delta, SEND_AND_WAIT_TIMEOUT).await?;
        let ack: SyncDeltaAck = reply.parse()?;
        if ack.received != pushed {
            warn!(
                peer = %peer.device_id,
                pushed,
                acked = ack.received,
                "delta ack count mismatch"
            );
        }
        Ok(pushed)
    }

    /// Family-visible local files changed after `since`, oldest first.
    pub async fn local_changes_since(&self, since: i64) -> Result<Vec<SyncFileRecord>> {
        let rows = self
            .db
            .query_all(
                "SELECT f.* FROM files f JOIN folders fo ON fo.id = f.folder_id
                 WHERE f.is_remote = 0
                   AND COALESCE(f.visibility, fo.default_visibility) = ?
                   AND f.modified_at > ?
                 ORDER BY f.modified_at, f.id",
                &[Visibility::Family.as_i32().into(), since.into()],
            )
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let file_id: i64 = row.try_get("id")?;
            records.push(SyncFileRecord {
                remote_id: file_id,
                relative_path: row.try_get("relative_path")?,
                name: row.try_get("name")?,
                extension: row.try_get("extension")?,
                mime_type: row.try_get("mime_type")?,
                size: row.try_get("size")?,
                modified_at: row.try_get("modified_at")?,
                checksum: row.try_get("checksum")?,
                sync_version: row.try_get("sync_version")?,
                last_modified_by: row.try_get("last_modified_by")?,
                tags: self.user_tags(file_id).await?,
            });
        }
        Ok(records)
    }

    async fn user_tags(&self, file_id: i64) -> Result<Vec<String>> {
        let rows = self
            .db
            .query_all(
                "SELECT t.name FROM tags t JOIN file_tags ft ON ft.tag_id = t.id
                 WHERE ft.file_id = ? AND t.source = 0 ORDER BY t.name",
                &[file_id.into()],
            )
            .await?;
        rows.iter().map(|r| Ok(r.try_get("name")?)).collect()
    }

    async fn tombstones_since(&self, since: i64) -> Result<Vec<SyncTombstone>> {
        let rows = self
            .db
            .query_all(
                "SELECT checksum, deleted_at, deleted_by FROM deleted_files WHERE deleted_at > ?",
                &[since.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SyncTombstone {
                    checksum: row.try_get("checksum")?,
                    deleted_at: row.try_get("deleted_at")?,
                    deleted_by: row.try_get("deleted_by")?,
                })
            })
            .collect()
    }

    async fn family_checksums(&self) -> Result<Vec<String>> {
        let rows = self
            .db
            .query_all(
                "SELECT DISTINCT f.checksum FROM files f
                 JOIN folders fo ON fo.id = f.folder_id
                 WHERE f.is_remote = 0 AND f.checksum IS NOT NULL
                   AND COALESCE(f.visibility, fo.default_visibility) = ?",
                &[Visibility::Family.as_i32().into()],
            )
            .await?;
        rows.iter().map(|r| Ok(r.try_get("checksum")?)).collect()
    }

    // ---- merge -----------------------------------------------------------

    async fn apply_record(&self, source_device: &str, record: &SyncFileRecord) -> Result<()> {
        let existing = self
            .db
            .query_optional(
                "SELECT local_id, sync_version, modified_at, last_modified_by, tags
                 FROM watched_remote_files
                 WHERE source_device_id = ? AND remote_id = ?",
                &[source_device.into(), record.remote_id.into()],
            )
            .await?;

        match existing {
            None => {
                self.db
                    .execute(
                        "INSERT INTO watched_remote_files
                            (remote_id, source_device_id, relative_path, name, mime_type, size,
                             modified_at, checksum, sync_version, last_modified_by, tags,
                             synced_at, is_deleted)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                        &[
                            record.remote_id.into(),
                            source_device.into(),
                            (&record.relative_path).into(),
                            (&record.name).into(),
                            (&record.mime_type).into(),
                            record.size.into(),
                            record.modified_at.into(),
                            record.checksum.as_deref().into(),
                            record.sync_version.into(),
                            record.last_modified_by.as_deref().into(),
                            serde_json::to_string(&record.tags)?.into(),
                            now_ts().into(),
                        ],
                    )
                    .await?;
            }
            Some(row) => {
                let local_id: i64 = row.try_get("local_id")?;
                let current = MergeKey {
                    sync_version: row.try_get("sync_version")?,
                    modified_at: row.try_get("modified_at")?,
                    last_modified_by: row
                        .try_get::<Option<String>, _>("last_modified_by")?
                        .unwrap_or_default(),
                };
                let incoming = MergeKey {
                    sync_version: record.sync_version,
                    modified_at: record.modified_at,
                    last_modified_by: record.last_modified_by.clone().unwrap_or_default(),
                };
                // User tags always merge by union, even when the record loses.
                let mut tags: Vec<String> = serde_json::from_str(
                    &row.try_get::<String, _>("tags")?,
                )
                .unwrap_or_default();
                for tag in &record.tags {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
                tags.sort();

                if incoming.wins_over(&current) {
                    self.db
                        .execute(
                            "UPDATE watched_remote_files SET
                                relative_path = ?, name = ?, mime_type = ?, size = ?,
                                modified_at = ?, checksum = ?, sync_version = ?,
                                last_modified_by = ?, tags = ?, synced_at = ?, is_deleted = 0
                             WHERE local_id = ?",
                            &[
                                (&record.relative_path).into(),
                                (&record.name).into(),
                                (&record.mime_type).into(),
                                record.size.into(),
                                record.modified_at.into(),
                                record.checksum.as_deref().into(),
                                record.sync_version.into(),
                                record.last_modified_by.as_deref().into(),
                                serde_json::to_string(&tags)?.into(),
                                now_ts().into(),
                                local_id.into(),
                            ],
                        )
                        .await?;
                } else {
                    self.db
                        .execute(
                            "UPDATE watched_remote_files SET tags = ?, synced_at = ?
                             WHERE local_id = ?",
                            &[
                                serde_json::to_string(&tags)?.into(),
                                now_ts().into(),
                                local_id.into(),
                            ],
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_tombstone(&self, source_device: &str, tombstone: &SyncTombstone) -> Result<u64> {
        self.db
            .execute(
                "DELETE FROM watched_remote_files WHERE source_device_id = ? AND checksum = ?",
                &[source_device.into(), (&tombstone.checksum).into()],
            )
            .await
    }

    /// Peer checksums that collide with one of our recent tombstones.
    async fn resurrection_candidates(&self, peer_checksums: &[String]) -> Result<Vec<String>> {
        let cutoff = now_ts() - TOMBSTONE_TTL_SECS;
        let mut candidates = Vec::new();
        for checksum in peer_checksums {
            let row = self
                .db
                .query_optional(
                    "SELECT 1 FROM deleted_files WHERE checksum = ? AND deleted_at >= ?",
                    &[checksum.into(), cutoff.into()],
                )
                .await?;
            if row.is_some() {
                candidates.push(checksum.clone());
            }
        }
        Ok(candidates)
    }

    // ---- sync state ------------------------------------------------------

    pub async fn sync_state(&self, device_id: &str) -> Result<SyncState> {
        let row = self
            .db
            .query_optional(
                "SELECT * FROM sync_state WHERE device_id = ?",
                &[device_id.into()],
            )
            .await?;
        Ok(match row {
            Some(row) => SyncState {
                device_id: device_id.to_string(),
                last_sync_version: row.try_get("last_sync_version")?,
                last_sync_at: row.try_get("last_sync_at")?,
                needs_full_resync: row.try_get::<i64, _>("needs_full_resync")? != 0,
            },
            None => SyncState {
                device_id: device_id.to_string(),
                last_sync_version: 0,
                last_sync_at: 0,
                needs_full_resync: false,
            },
        })
    }

    async fn set_needs_full_resync(&self, device_id: &str, value: bool) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO sync_state (device_id, needs_full_resync) VALUES (?, ?)
                 ON CONFLICT (device_id) DO UPDATE SET
                    needs_full_resync = excluded.needs_full_resync",
                &[device_id.into(), value.into()],
            )
            .await?;
        Ok(())
    }

    async fn update_sync_state(&self, device_id: &str, max_version: i64) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO sync_state
                    (device_id, last_sync_version, last_sync_at, needs_full_resync)
                 VALUES (?, ?, ?, 0)
                 ON CONFLICT (device_id) DO UPDATE SET
                    last_sync_version = MAX(last_sync_version, excluded.last_sync_version),
                    last_sync_at = excluded.last_sync_at,
                    needs_full_resync = 0",
                &[device_id.into(), max_version.into(), now_ts().into()],
            )
            .await?;
        Ok(())
    }

    pub async fn shadow_files(&self, source_device: &str) -> Result<Vec<ShadowFile>> {
        let rows = self
            .db
            .query_all(
                "SELECT * FROM watched_remote_files
                 WHERE source_device_id = ? AND is_deleted = 0 ORDER BY relative_path",
                &[source_device.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ShadowFile {
                    local_id: row.try_get("local_id")?,
                    remote_id: row.try_get("remote_id")?,
                    source_device_id: row.try_get("source_device_id")?,
                    relative_path: row.try_get("relative_path")?,
                    name: row.try_get("name")?,
                    mime_type: row.try_get("mime_type")?,
                    size: row.try_get("size")?,
                    modified_at: row.try_get("modified_at")?,
                    checksum: row.try_get("checksum")?,
                    sync_version: row.try_get("sync_version")?,
                    tags: serde_json::from_str(&row.try_get::<String, _>("tags")?)
                        .unwrap_or_default(),
                    synced_at: row.try_get("synced_at")?,
                })
            })
            .collect()
    }

    fn report_progress(&self, progress: SyncProgress) {
        if let Some(cb) = self.on_progress.lock().unwrap().as_ref() {
            cb(progress);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncState {
    pub device_id: String,
    pub last_sync_version: i64,
    pub last_sync_at: i64,
    pub needs_full_resync: bool,
}

#[derive(Debug, Clone)]
pub struct ShadowFile {
    pub local_id: i64,
    pub remote_id: i64,
    pub source_device_id: String,
    pub relative_path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: Option<String>,
    pub sync_version: i64,
    pub tags: Vec<String>,
    pub synced_at: i64,
}

#[derive(Debug, PartialEq, Eq)]
struct MergeKey {
    sync_version: i64,
    modified_at: i64,
    last_modified_by: String,
}

impl MergeKey {
    /// Last-write-wins with deterministic tiebreaks.
    fn wins_over(&self, other: &Self) -> bool {
        (self.sync_version, self.modified_at, &self.last_modified_by)
            > (other.sync_version, other.modified_at, &other.last_modified_by)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(remote_id: i64, version: i64, modified: i64, by: &str) -> SyncFileRecord {
        SyncFileRecord {
            remote_id,
            relative_path: format!("docs/f{remote_id}.txt"),
            name: format!("f{remote_id}.txt"),
            extension: "txt".into(),
            mime_type: "text/plain".into(),
            size: 10,
            modified_at: modified,
            checksum: Some(format!("sum-{remote_id}")),
            sync_version: version,
            last_modified_by: Some(by.into()),
            tags: Vec::new(),
        }
    }

    #[test]
    fn merge_key_ordering() {
        let a = MergeKey {
            sync_version: 2,
            modified_at: 1,
            last_modified_by: "a".into(),
        };
        let b = MergeKey {
            sync_version: 1,
            modified_at: 99,
            last_modified_by: "z".into(),
        };
        assert!(a.wins_over(&b));

        let newer = MergeKey {
            sync_version: 1,
            modified_at: 100,
            last_modified_by: "a".into(),
        };
        assert!(newer.wins_over(&b));

        let tie_by_device = MergeKey {
            sync_version: 1,
            modified_at: 99,
            last_modified_by: "zz".into(),
        };
        assert!(tie_by_device.wins_over(&b));
    }

    #[tokio::test]
    async fn records_merge_with_lww_and_tag_union() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = IndexSyncManager::new(db.clone(), "me".into());

        let mut first = record(1, 2, 100, "peer");
        first.tags = vec!["alpha".into()];
        manager.apply_record("peer", &first).await.unwrap();

        // Older record must not overwrite, but its tags still merge.
        let mut stale = record(1, 1, 50, "peer");
        stale.name = "stale.txt".into();
        stale.tags = vec!["beta".into()];
        manager.apply_record("peer", &stale).await.unwrap();

        let shadows = manager.shadow_files("peer").await.unwrap();
        assert_eq!(shadows.len(), 1);
        assert_eq!(shadows[0].name, "f1.txt");
        assert_eq!(shadows[0].tags, vec!["alpha".to_string(), "beta".to_string()]);

        // Newer version replaces.
        let newer = record(1, 3, 200, "peer");
        manager.apply_record("peer", &newer).await.unwrap();
        let shadows = manager.shadow_files("peer").await.unwrap();
        assert_eq!(shadows[0].sync_version, 3);
    }

    #[tokio::test]
    async fn tombstones_remove_shadows() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = IndexSyncManager::new(db, "me".into());
        manager.apply_record("peer", &record(5, 1, 10, "peer")).await.unwrap();

        let removed = manager
            .apply_tombstone(
                "peer",
                &SyncTombstone {
                    checksum: "sum-5".into(),
                    deleted_at: 20,
                    deleted_by: "peer".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(manager.shadow_files("peer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resurrection_candidates_match_recent_tombstones() {
        let db = Database::open_in_memory().await.unwrap();
        db.execute(
            "INSERT INTO deleted_files (checksum, deleted_at, deleted_by) VALUES (?, ?, ?)",
            &["gone".into(), now_ts().into(), "me".into()],
        )
        .await
        .unwrap();
        let manager = IndexSyncManager::new(db, "me".into());

        let candidates = manager
            .resurrection_candidates(&["gone".into(), "alive".into()])
            .await
            .unwrap();
        assert_eq!(candidates, vec!["gone".to_string()]);
    }
}

//! In-memory document store with optional JSON snapshot persistence.
//!
//! The reference `MetaStore` backend. All mutations happen under one lock,
//! which gives the same serialization the trait demands from a real document
//! database. With a snapshot path configured, every mutation rewrites the
//! snapshot atomically (temp file + rename), so a restart resumes from the
//! last committed state.

use super::traits::{MetaStore, MirrorPlacementUpdate, StoreError};
use crate::types::{
    Archive, ArchiveStatus, Folder, Part, PlacementSide, ProviderHandle, ProviderKind, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Default, Serialize, Deserialize)]
struct Collections {
    archives: HashMap<String, Archive>,
    users: HashMap<String, User>,
    folders: HashMap<String, Folder>,
    webhooks: Vec<ProviderHandle>,
    settings: HashMap<String, String>,
}

pub struct MemoryStore {
    inner: Mutex<Collections>,
    persist_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store — state dies with the process. Tests and demos.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Collections::default()),
            persist_path: None,
        }
    }

    /// Snapshot-backed store. Loads an existing snapshot when present.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let collections = if path.exists() {
            let raw = std::fs::read(path).map_err(|e| StoreError::Io(e.to_string()))?;
            serde_json::from_slice(&raw)?
        } else {
            Collections::default()
        };
        Ok(Self {
            inner: Mutex::new(collections),
            persist_path: Some(path.to_path_buf()),
        })
    }

    /// Run a mutation under the lock, then persist the snapshot if configured.
    /// The snapshot is serialized inside the lock (consistent view) and
    /// written outside it.
    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Collections) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let (result, snapshot) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner)?;
            let snapshot = if self.persist_path.is_some() {
                Some(serde_json::to_vec(&*inner)?)
            } else {
                None
            };
            (result, snapshot)
        };

        if let (Some(path), Some(bytes)) = (&self.persist_path, snapshot) {
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &bytes)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            tokio::fs::rename(&tmp, path)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&Collections) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn archive_mut<'a>(
    inner: &'a mut Collections,
    id: &str,
) -> Result<&'a mut Archive, StoreError> {
    inner
        .archives
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

/// Update one side of the newest part record carrying `index`.
fn part_mut<'a>(archive: &'a mut Archive, index: u32) -> Result<&'a mut Part, StoreError> {
    archive
        .parts
        .iter_mut()
        .rev()
        .find(|p| p.index == index)
        .ok_or_else(|| StoreError::NotFound(format!("part {index}")))
}

/// Recompute progress counters from the deduplicated part set. Counters are
/// derived state — invariant 2 says they must match the distinct parts at
/// every instant, duplicates included.
fn recount_progress(archive: &mut Archive) {
    let parts = archive.deduped_parts();
    archive.uploaded_parts = parts.len() as u32;
    archive.uploaded_bytes = parts.iter().map(|p| p.size).sum();
}

fn reset_to_queued(archive: &mut Archive) {
    archive.status = ArchiveStatus::Queued;
    if archive.parts.is_empty() {
        archive.uploaded_bytes = 0;
        archive.uploaded_parts = 0;
    }
    archive.updated_at = Utc::now();
}

#[async_trait]
impl MetaStore for MemoryStore {
    // === Archive documents ===

    async fn insert_archive(&self, archive: Archive) -> Result<(), StoreError> {
        self.mutate(|inner| {
            if inner.archives.contains_key(&archive.id) {
                return Err(StoreError::AlreadyExists(archive.id.clone()));
            }
            inner.archives.insert(archive.id.clone(), archive);
            Ok(())
        })
        .await
    }

    async fn get_archive(&self, id: &str) -> Result<Option<Archive>, StoreError> {
        Ok(self.read(|inner| inner.archives.get(id).cloned()))
    }

    async fn list_archives(&self, owner_id: &str, trash: bool) -> Result<Vec<Archive>, StoreError> {
        Ok(self.read(|inner| {
            let mut archives: Vec<Archive> = inner
                .archives
                .values()
                .filter(|a| a.owner_id == owner_id && a.is_visible())
                .filter(|a| if trash { a.is_trashed() } else { a.trashed_at.is_none() })
                .cloned()
                .collect();
            archives.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            archives
        }))
    }

    async fn count_queued(&self) -> Result<u64, StoreError> {
        Ok(self.read(|inner| {
            inner
                .archives
                .values()
                .filter(|a| a.status == ArchiveStatus::Queued && a.is_visible())
                .count() as u64
        }))
    }

    async fn lease_next_queued(&self) -> Result<Option<Archive>, StoreError> {
        self.mutate(|inner| {
            let best = inner
                .archives
                .values()
                .filter(|a| a.status == ArchiveStatus::Queued && a.is_visible())
                .min_by(|a, b| {
                    // highest priority first, oldest created_at breaking ties
                    b.priority
                        .cmp(&a.priority)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|a| a.id.clone());

            let Some(id) = best else { return Ok(None) };
            let archive = archive_mut(inner, &id)?;
            archive.status = ArchiveStatus::Processing;
            archive.error = None;
            archive.updated_at = Utc::now();
            Ok(Some(archive.clone()))
        })
        .await
    }

    async fn requeue_for_retry(&self, id: &str, error: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.retry_count += 1;
            archive.error = Some(error.to_string());
            reset_to_queued(archive);
            Ok(())
        })
        .await
    }

    async fn mark_error(&self, id: &str, error: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.status = ArchiveStatus::Error;
            archive.error = Some(error.to_string());
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn reset_stale_processing(&self, older_than_minutes: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::minutes(older_than_minutes);
        self.mutate(|inner| {
            let mut count = 0;
            for archive in inner.archives.values_mut() {
                if archive.status == ArchiveStatus::Processing && archive.updated_at < cutoff {
                    reset_to_queued(archive);
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn reset_all_processing(&self) -> Result<usize, StoreError> {
        self.mutate(|inner| {
            let mut count = 0;
            for archive in inner.archives.values_mut() {
                if archive.status == ArchiveStatus::Processing {
                    reset_to_queued(archive);
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn append_part(&self, id: &str, part: Part) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.parts.push(part);
            recount_progress(archive);
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn update_part_url(
        &self,
        id: &str,
        index: u32,
        side: PlacementSide,
        url: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let part = part_mut(archive, index)?;
            match side {
                PlacementSide::Primary => part.url = url.to_string(),
                PlacementSide::Mirror => part.mirror_url = url.to_string(),
            }
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn finalize_upload(
        &self,
        id: &str,
        encrypted_size: u64,
        total_parts: u32,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.encrypted_size = encrypted_size;
            archive.total_parts = total_parts;
            archive.encryption_version = crate::types::CURRENT_ENCRYPTION_VERSION;
            archive.iv = None;
            archive.auth_tag = None;
            archive.status = ArchiveStatus::Ready;
            archive.error = None;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_original_size(&self, id: &str, size: u64) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.original_size = size;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_chunk_size(&self, id: &str, size: u64) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.chunk_size_bytes = size;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn remove_archive(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            inner
                .archives
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
        .await
    }

    // === Mirror maintenance ===

    async fn next_mirror_prepare_candidate(&self) -> Result<Option<Archive>, StoreError> {
        Ok(self.read(|inner| {
            let mut candidates: Vec<&Archive> = inner
                .archives
                .values()
                .filter(|a| a.status == ArchiveStatus::Ready && a.is_visible())
                .filter(|a| {
                    let parts = a.deduped_parts();
                    !parts.is_empty() && parts.iter().any(|p| p.mirror_provider.is_none())
                })
                .collect();
            candidates.sort_by_key(|a| a.created_at);
            candidates.first().map(|a| (*a).clone())
        }))
    }

    async fn next_mirror_sync_candidate(
        &self,
        available: &[ProviderKind],
    ) -> Result<Option<Archive>, StoreError> {
        Ok(self.read(|inner| {
            let mut candidates: Vec<&Archive> = inner
                .archives
                .values()
                .filter(|a| a.status == ArchiveStatus::Ready && a.is_visible())
                .filter(|a| {
                    a.deduped_parts().iter().any(|p| {
                        p.mirror_pending
                            && p.mirror_provider
                                .map(|m| available.contains(&m))
                                .unwrap_or(false)
                    })
                })
                .collect();
            candidates.sort_by_key(|a| a.created_at);
            candidates.first().map(|a| (*a).clone())
        }))
    }

    async fn assign_part_mirror_provider(
        &self,
        id: &str,
        index: u32,
        provider: ProviderKind,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let part = part_mut(archive, index)?;
            part.mirror_provider = Some(provider);
            part.mirror_pending = true;
            part.mirror_error = None;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn claim_mirror_part(
        &self,
        id: &str,
        index: u32,
        provider: ProviderKind,
    ) -> Result<bool, StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let part = part_mut(archive, index)?;
            if part.mirror_pending && part.mirror_provider == Some(provider) {
                part.mirror_pending = false;
                archive.updated_at = Utc::now();
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await
    }

    async fn set_part_mirror_placement(
        &self,
        id: &str,
        index: u32,
        placement: MirrorPlacementUpdate,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let part = part_mut(archive, index)?;
            part.mirror_provider = Some(placement.provider);
            part.mirror_url = placement.url;
            part.mirror_message_id = placement.message_id;
            part.mirror_webhook_id = placement.webhook_id;
            part.mirror_file_id = placement.file_id;
            part.mirror_pending = false;
            part.mirror_error = None;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_part_mirror_pending(
        &self,
        id: &str,
        index: u32,
        pending: bool,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let part = part_mut(archive, index)?;
            part.mirror_pending = pending;
            part.mirror_error = error;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    // === Lifecycle ===

    async fn trash_archive(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.trashed_at = Some(Utc::now());
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn restore_from_trash(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.trashed_at = None;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn request_purge(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.delete_requested_at = Some(Utc::now());
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn move_archive(&self, id: &str, folder_id: Option<String>) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.folder_id = folder_id;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn rename_archive(&self, id: &str, download_name: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.download_name = download_name.to_string();
            archive.display_name = download_name.to_string();
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn inc_download_count(&self, id: &str, file_index: usize) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let entry = archive
                .files
                .get_mut(file_index)
                .ok_or_else(|| StoreError::NotFound(format!("file {file_index}")))?;
            entry.download_count += 1;
            Ok(())
        })
        .await
    }

    async fn rename_file_entry(
        &self,
        id: &str,
        file_index: usize,
        new_name: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            let entry = archive
                .files
                .get_mut(file_index)
                .ok_or_else(|| StoreError::NotFound(format!("file {file_index}")))?;
            entry.original_name = new_name.to_string();
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn set_priority(
        &self,
        id: &str,
        priority: u8,
        pin_override: bool,
    ) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.priority = priority.min(4);
            archive.priority_override = pin_override;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    // === Deletion reaper ===

    async fn claim_next_deletion(&self, retention_days: i64) -> Result<Option<Archive>, StoreError> {
        let retention_cutoff = Utc::now() - Duration::days(retention_days);
        self.mutate(|inner| {
            let far_future = DateTime::<Utc>::MAX_UTC;
            let best = inner
                .archives
                .values()
                .filter(|a| a.deleted_at.is_none() && !a.deleting)
                .filter(|a| {
                    a.delete_requested_at.is_some()
                        || a.trashed_at.map(|t| t <= retention_cutoff).unwrap_or(false)
                })
                .min_by_key(|a| {
                    (
                        a.delete_requested_at.unwrap_or(far_future),
                        a.trashed_at.unwrap_or(far_future),
                    )
                })
                .map(|a| a.id.clone());

            let Some(id) = best else { return Ok(None) };
            let archive = archive_mut(inner, &id)?;
            archive.deleting = true;
            archive.updated_at = Utc::now();
            Ok(Some(archive.clone()))
        })
        .await
    }

    async fn begin_deletion(&self, id: &str, total_parts: u32) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.delete_total_parts = total_parts;
            archive.deleted_parts = 0;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn inc_deleted_parts(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            if archive.deleted_parts < archive.delete_total_parts {
                archive.deleted_parts += 1;
            }
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn complete_deletion(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let archive = archive_mut(inner, id)?;
            archive.deleted_at = Some(Utc::now());
            archive.parts.clear();
            archive.deleting = false;
            archive.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    // === Users ===

    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.mutate(|inner| {
            if inner.users.contains_key(&user.id) {
                return Err(StoreError::AlreadyExists(user.id.clone()));
            }
            inner.users.insert(user.id.clone(), user);
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.read(|inner| inner.users.get(id).cloned()))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.read(|inner| {
            inner
                .users
                .values()
                .find(|u| u.username == username)
                .cloned()
        }))
    }

    async fn reserve_quota(&self, user_id: &str, bytes: u64) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let user = inner
                .users
                .get_mut(user_id)
                .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
            let next = user.used_bytes.saturating_add(bytes);
            if user.quota_bytes > 0 && next > user.quota_bytes {
                return Err(StoreError::QuotaExceeded);
            }
            user.used_bytes = next;
            Ok(())
        })
        .await
    }

    async fn release_quota(&self, user_id: &str, bytes: u64) -> Result<(), StoreError> {
        self.mutate(|inner| {
            let user = inner
                .users
                .get_mut(user_id)
                .ok_or_else(|| StoreError::NotFound(user_id.to_string()))?;
            user.used_bytes = user.used_bytes.saturating_sub(bytes);
            Ok(())
        })
        .await
    }

    // === Folders ===

    async fn insert_folder(&self, folder: Folder) -> Result<(), StoreError> {
        self.mutate(|inner| {
            if inner.folders.contains_key(&folder.id) {
                return Err(StoreError::AlreadyExists(folder.id.clone()));
            }
            inner.folders.insert(folder.id.clone(), folder);
            Ok(())
        })
        .await
    }

    async fn ensure_folder(
        &self,
        owner_id: &str,
        parent_id: Option<String>,
        name: &str,
    ) -> Result<Folder, StoreError> {
        self.mutate(|inner| {
            if let Some(existing) = inner
                .folders
                .values()
                .find(|f| f.owner_id == owner_id && f.parent_id == parent_id && f.name == name)
            {
                return Ok(existing.clone());
            }
            let folder = Folder {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                parent_id,
                name: name.to_string(),
                created_at: Utc::now(),
            };
            inner.folders.insert(folder.id.clone(), folder.clone());
            Ok(folder)
        })
        .await
    }

    // === Provider handles ===

    async fn list_webhooks(&self) -> Result<Vec<ProviderHandle>, StoreError> {
        Ok(self.read(|inner| {
            let mut handles = inner.webhooks.clone();
            handles.sort_by_key(|h| h.created_at);
            handles
        }))
    }

    async fn upsert_webhook(&self, handle: ProviderHandle) -> Result<(), StoreError> {
        self.mutate(|inner| {
            if let Some(existing) = inner.webhooks.iter_mut().find(|h| h.id == handle.id) {
                *existing = handle;
            } else {
                inner.webhooks.push(handle);
            }
            Ok(())
        })
        .await
    }

    // === Settings ===

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(|inner| inner.settings.get(key).cloned()))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(|inner| {
            inner.settings.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UserRole, CURRENT_ENCRYPTION_VERSION};

    fn archive(id: &str, priority: u8, created_offset_secs: i64) -> Archive {
        let at = Utc::now() - Duration::seconds(created_offset_secs);
        Archive {
            id: id.to_string(),
            owner_id: "u1".to_string(),
            folder_id: None,
            name: format!("{id}.bin"),
            display_name: format!("{id}.bin"),
            download_name: format!("{id}.bin"),
            is_bundle: false,
            files: Vec::new(),
            status: ArchiveStatus::Queued,
            trashed_at: None,
            deleted_at: None,
            delete_requested_at: None,
            deleting: false,
            retry_count: 0,
            error: None,
            original_size: 100,
            encrypted_size: 0,
            uploaded_bytes: 0,
            uploaded_parts: 0,
            total_parts: 0,
            delete_total_parts: 0,
            deleted_parts: 0,
            encryption_version: CURRENT_ENCRYPTION_VERSION,
            iv: None,
            auth_tag: None,
            chunk_size_bytes: 16,
            staging_dir: None,
            parts: Vec::new(),
            priority,
            priority_override: false,
            created_at: at,
            updated_at: at,
        }
    }

    fn part(index: u32, size: u64) -> Part {
        Part {
            index,
            size,
            plain_size: Some(size),
            hash: format!("h{index}"),
            iv: "aXY=".to_string(),
            auth_tag: "dGFn".to_string(),
            provider: ProviderKind::Webhook,
            url: format!("https://cdn.example/{index}"),
            message_id: format!("m{index}"),
            webhook_id: Some("w0".to_string()),
            file_id: None,
            mirror_provider: None,
            mirror_url: String::new(),
            mirror_message_id: String::new(),
            mirror_webhook_id: None,
            mirror_file_id: None,
            mirror_pending: false,
            mirror_error: None,
        }
    }

    fn user(id: &str, quota: u64) -> User {
        User {
            id: id.to_string(),
            username: id.to_string(),
            password_hash: String::new(),
            role: UserRole::User,
            quota_bytes: quota,
            used_bytes: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lease_prefers_priority_then_age() {
        let store = MemoryStore::new();
        store.insert_archive(archive("old-low", 0, 100)).await.unwrap();
        store.insert_archive(archive("new-high", 3, 10)).await.unwrap();
        store.insert_archive(archive("old-high", 3, 50)).await.unwrap();

        let leased = store.lease_next_queued().await.unwrap().unwrap();
        assert_eq!(leased.id, "old-high");
        assert_eq!(leased.status, ArchiveStatus::Processing);

        let leased = store.lease_next_queued().await.unwrap().unwrap();
        assert_eq!(leased.id, "new-high");

        let leased = store.lease_next_queued().await.unwrap().unwrap();
        assert_eq!(leased.id, "old-low");

        assert!(store.lease_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_part_counters_ignore_duplicates() {
        let store = MemoryStore::new();
        store.insert_archive(archive("a", 0, 0)).await.unwrap();

        store.append_part("a", part(0, 10)).await.unwrap();
        store.append_part("a", part(1, 20)).await.unwrap();
        // duplicate index 0 from a retry race
        store.append_part("a", part(0, 12)).await.unwrap();

        let a = store.get_archive("a").await.unwrap().unwrap();
        assert_eq!(a.uploaded_parts, 2);
        assert_eq!(a.uploaded_bytes, 32); // newest index-0 record wins
        assert_eq!(a.parts.len(), 3); // raw vector keeps history
    }

    #[tokio::test]
    async fn test_claim_mirror_part_is_guarded() {
        let store = MemoryStore::new();
        let mut a = archive("a", 0, 0);
        a.status = ArchiveStatus::Ready;
        let mut p = part(0, 10);
        p.mirror_provider = Some(ProviderKind::Bot);
        p.mirror_pending = true;
        a.parts.push(p);
        store.insert_archive(a).await.unwrap();

        assert!(store
            .claim_mirror_part("a", 0, ProviderKind::Bot)
            .await
            .unwrap());
        // second claim loses
        assert!(!store
            .claim_mirror_part("a", 0, ProviderKind::Bot)
            .await
            .unwrap());
        // wrong assignment loses
        assert!(!store
            .claim_mirror_part("a", 0, ProviderKind::Webhook)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_next_deletion_respects_retention() {
        let store = MemoryStore::new();

        let mut fresh = archive("fresh", 0, 0);
        fresh.status = ArchiveStatus::Ready;
        fresh.trashed_at = Some(Utc::now() - Duration::days(2));
        store.insert_archive(fresh).await.unwrap();

        let mut expired = archive("expired", 0, 0);
        expired.status = ArchiveStatus::Ready;
        expired.trashed_at = Some(Utc::now() - Duration::days(31));
        store.insert_archive(expired).await.unwrap();

        let claimed = store.claim_next_deletion(30).await.unwrap().unwrap();
        assert_eq!(claimed.id, "expired");
        assert!(claimed.deleting);

        // fresh trash is not eligible
        assert!(store.claim_next_deletion(30).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_request_beats_retention_order() {
        let store = MemoryStore::new();

        let mut trashed = archive("trashed", 0, 0);
        trashed.trashed_at = Some(Utc::now() - Duration::days(40));
        store.insert_archive(trashed).await.unwrap();

        let mut purged = archive("purged", 0, 0);
        purged.delete_requested_at = Some(Utc::now() - Duration::hours(1));
        store.insert_archive(purged).await.unwrap();

        let first = store.claim_next_deletion(30).await.unwrap().unwrap();
        assert_eq!(first.id, "purged");
    }

    #[tokio::test]
    async fn test_quota_boundary() {
        let store = MemoryStore::new();
        store.insert_user(user("u1", 100)).await.unwrap();

        // exactly at the boundary accepts
        store.reserve_quota("u1", 100).await.unwrap();
        // one byte over rejects
        let err = store.reserve_quota("u1", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded));

        store.release_quota("u1", 100).await.unwrap();
        let u = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(u.used_bytes, 0);
    }

    #[tokio::test]
    async fn test_unlimited_quota() {
        let store = MemoryStore::new();
        store.insert_user(user("u1", 0)).await.unwrap();
        store.reserve_quota("u1", u64::MAX / 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_all_processing_zeroes_partless_counters() {
        let store = MemoryStore::new();
        let mut a = archive("a", 0, 0);
        a.status = ArchiveStatus::Processing;
        a.uploaded_bytes = 999;
        a.uploaded_parts = 3;
        store.insert_archive(a).await.unwrap();

        let mut b = archive("b", 0, 0);
        b.status = ArchiveStatus::Processing;
        b.parts.push(part(0, 10));
        b.uploaded_bytes = 10;
        b.uploaded_parts = 1;
        store.insert_archive(b).await.unwrap();

        assert_eq!(store.reset_all_processing().await.unwrap(), 2);

        let a = store.get_archive("a").await.unwrap().unwrap();
        assert_eq!(a.status, ArchiveStatus::Queued);
        assert_eq!(a.uploaded_bytes, 0);
        assert_eq!(a.uploaded_parts, 0);

        // committed parts survive a reset
        let b = store.get_archive("b").await.unwrap().unwrap();
        assert_eq!(b.uploaded_parts, 1);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.insert_archive(archive("a", 2, 0)).await.unwrap();
            store.insert_user(user("u1", 500)).await.unwrap();
            store.set_setting("master_secret", "s3cret").await.unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        let a = reopened.get_archive("a").await.unwrap().unwrap();
        assert_eq!(a.priority, 2);
        assert_eq!(
            reopened.get_setting("master_secret").await.unwrap().as_deref(),
            Some("s3cret")
        );
    }

    #[tokio::test]
    async fn test_ensure_folder_is_get_or_create() {
        let store = MemoryStore::new();
        let f1 = store.ensure_folder("u1", None, "photos").await.unwrap();
        let f2 = store.ensure_folder("u1", None, "photos").await.unwrap();
        assert_eq!(f1.id, f2.id);

        let nested = store
            .ensure_folder("u1", Some(f1.id.clone()), "2026")
            .await
            .unwrap();
        assert_ne!(nested.id, f1.id);
    }
}
